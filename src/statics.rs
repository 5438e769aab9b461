//! Thread local pools keyed by chunk size, count and alignment.
//!
//! Every thread lazily gets its own [`Pool`] for each distinct
//! `Statics<SIZE, COUNT, ALIGN>` it uses, so allocating and freeing on the
//! owning thread never synchronizes. Memory freed by another thread goes
//! through the owner's reclamation queue like with any other pool.
//!
//! ```
//! use mempool::Statics;
//!
//! type Nodes = Statics<{ std::mem::size_of::<[u32; 4]>() }>;
//!
//! let node = Nodes::construct([1u32, 2, 3, 4]).unwrap();
//! unsafe { Nodes::destruct(node.as_ptr()) };
//! ```
//!
//! The pools of a thread are dropped with its thread locals, which frees
//! every block they allocated. Memory must not outlive the thread that
//! allocated it.

use std::{
    cell::RefCell,
    collections::{HashMap, hash_map::Entry},
    ptr::{self, NonNull},
};

use tracing::debug;

use crate::{
    config::{DEFAULT_ALIGN, DEFAULT_COUNT},
    error::{PoolError, Result},
    pool::Pool,
};

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
}

/// Configuration a thread local pool is registered under. These are the
/// raw parameters, so two triples normalizing to the same layout still get
/// separate pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    size: usize,
    count: usize,
    align: usize,
}

/// The pools of one thread.
#[derive(Default)]
struct Registry {
    pools: HashMap<Key, Pool>,
}

impl Registry {
    fn pool(&mut self, key: Key) -> Result<&mut Pool> {
        match self.pools.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let pool = Pool::with_layout(key.size, key.count, key.align)?;
                debug!(
                    size = key.size,
                    count = key.count,
                    align = key.align,
                    "created thread local pool"
                );
                Ok(entry.insert(pool))
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if !self.pools.is_empty() {
            let blocks: usize = self.pools.values().map(Pool::block_count).sum();
            debug!(pools = self.pools.len(), blocks, "tearing down thread local pools");
        }
    }
}

/// Whether the current thread's registry has not been torn down yet.
fn registry_alive() -> bool {
    REGISTRY.try_with(|_| ()).is_ok()
}

/// Runs `f` on the current thread's registry.
fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> Result<R> {
    REGISTRY
        .try_with(|registry| {
            let mut registry = registry
                .try_borrow_mut()
                .map_err(|_| PoolError::RegistryUnavailable)?;
            Ok(f(&mut registry))
        })
        .map_err(|_| PoolError::RegistryUnavailable)?
}

/// Thread local pool of `SIZE` byte chunks, `COUNT` per block, aligned to
/// `ALIGN`.
///
/// This type is never instantiated; it only names a pool. Distinct
/// parameters give distinct pools.
pub struct Statics<
    const SIZE: usize,
    const COUNT: usize = DEFAULT_COUNT,
    const ALIGN: usize = DEFAULT_ALIGN,
>;

impl<const SIZE: usize, const COUNT: usize, const ALIGN: usize> Statics<SIZE, COUNT, ALIGN> {
    const KEY: Key = Key {
        size: SIZE,
        count: COUNT,
        align: ALIGN,
    };

    /// Runs `f` on the current thread's pool, creating it on first use.
    ///
    /// Fails with [`PoolError::RegistryUnavailable`] when called while the
    /// thread is being torn down or from inside another `with`.
    pub fn with<R>(f: impl FnOnce(&mut Pool) -> R) -> Result<R> {
        with_registry(|registry| registry.pool(Self::KEY).map(f))?
    }

    /// See [`Pool::construct`].
    pub fn construct<T>(value: T) -> Result<NonNull<T>> {
        Self::with(|pool| pool.construct(value))?
    }

    /// See [`Pool::allocate`].
    pub fn allocate() -> Result<NonNull<u8>> {
        Self::with(Pool::allocate)?
    }

    /// See [`Pool::destruct`]. The value is dropped before the pool is
    /// touched, so its destructor may use the pool as well.
    ///
    /// When the pool is already borrowed, as from inside [`Statics::with`],
    /// the chunk is pushed onto its owner's reclamation queue instead. Once
    /// the thread's pools are torn down, as from another thread local's
    /// destructor, the chunk is not returned at all: its block may already
    /// be freed.
    ///
    /// # Safety
    ///
    /// Same as [`Pool::destruct`].
    pub unsafe fn destruct<T>(ptr: *mut T) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        unsafe { ptr::drop_in_place(ptr.as_ptr()) };

        let data = ptr.cast::<u8>();
        // Safety: forwarded from the caller.
        if Self::with(|pool| unsafe { pool.give_back(data) }).is_err() && registry_alive() {
            // Borrowed elsewhere on this thread, hand the chunk to its owner.
            unsafe { Pool::release(data.as_ptr()) };
        }
    }

    /// See [`Pool::deallocate`].
    ///
    /// # Safety
    ///
    /// Same as [`Pool::destruct`].
    pub unsafe fn deallocate(ptr: *mut u8) {
        unsafe { Self::destruct(ptr) }
    }

    /// See [`Pool::cleanup`]. Returns the number of blocks released, `0`
    /// when the registry is unavailable.
    pub fn cleanup() -> usize {
        Self::with(Pool::cleanup).unwrap_or(0)
    }
}

/// Runs [`Pool::cleanup`] on every pool of the current thread and returns
/// the number of blocks released.
pub fn cleanup_all() -> usize {
    with_registry(|registry| {
        registry
            .pools
            .values_mut()
            .map(Pool::cleanup)
            .sum::<usize>()
    })
    .unwrap_or(0)
}

/// Number of pools the current thread created.
pub fn pool_count() -> usize {
    with_registry(|registry| registry.pools.len()).unwrap_or(0)
}
