//! Alignment helpers shared by the pool layout code.
//! These are functions that don't particularly belong to any concrete module of the program.

/// Returns the smallest power of two that is greater or equal than `n`.
///
/// `0` is rounded to `1`.
#[inline]
pub const fn boundary(n: usize) -> usize {
    n.next_power_of_two()
}

/// Rounds `value` up to the next multiple of `unit`.
///
/// `unit` does not have to be a power of two. Returns `None` when the result
/// does not fit in a `usize` or `unit` is zero.
#[inline]
pub const fn adjust(value: usize, unit: usize) -> Option<usize> {
    if unit == 0 {
        return None;
    }
    match value.checked_add(unit - 1) {
        Some(sum) => (sum / unit).checked_mul(unit),
        None => None,
    }
}
