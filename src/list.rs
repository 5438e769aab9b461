use std::{marker::PhantomData, ptr::NonNull};


/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// Intrusive node. The links live right next to the element, so whoever owns
/// the memory of the node also owns its place in the list.
pub(crate) struct Node<T> {
    /// Pointer to the next node of the list
    pub next: Link<Self>,
    /// Pointer to the previous node of the list
    pub prev: Link<Self>,
    /// Element of the node
    pub data: T,
}

/// Intrusive doubly linked list used as the pool's chain of available
/// blocks. The list never allocates: nodes are written in place by their
/// owner and only linked / unlinked here.
///
/// The head of the list is the block new chunks are taken from, which is why
/// insertion only happens at the front.
pub(crate) struct List<T> {
    head: Link<Node<T>>,
    len: usize,
    marker: PhantomData<T>,
}

#[cfg(test)]
pub(crate) struct Iter<'a, T> {
    current: Link<Node<T>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

impl<T> Node<T> {
    pub const fn new(data: T) -> Self {
        Self { next: None, prev: None, data }
    }

    /// Whether the node is linked to a neighbour. The head of a single
    /// element list has no links either, so this is only meaningful together
    /// with [`List::first`].
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.next.is_some() || self.prev.is_some()
    }
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Node<T>> {
        self.head
    }

    /// Whether `node` is the head of the list.
    #[inline]
    pub fn is_first(&self, node: NonNull<Node<T>>) -> bool {
        self.head == Some(node)
    }

    /// Links `node` in front of the current head.
    ///
    /// Only the links are written, through raw places. No reference to a
    /// whole node is created, so other threads may read `data` meanwhile.
    ///
    /// **SAFETY**: `node` must point to a live node that is not part of any list.
    pub unsafe fn push_front(&mut self, node: NonNull<Node<T>>) {
        unsafe {
            (*node.as_ptr()).prev = None;
            (*node.as_ptr()).next = self.head;

            if let Some(head) = self.head {
                (*head.as_ptr()).prev = Some(node);
            }
        }

        self.head = Some(node);
        self.len += 1;
    }

    /// Unlinks `node` from the list, clearing both of its links.
    ///
    /// **SAFETY**: `node` must be a member of this list.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        unsafe {
            let next = (*node.as_ptr()).next;
            let prev = (*node.as_ptr()).prev;

            match prev {
                Some(prev) => (*prev.as_ptr()).next = next,
                None => self.head = next,
            }

            if let Some(next) = next {
                (*next.as_ptr()).prev = prev;
            }

            (*node.as_ptr()).next = None;
            (*node.as_ptr()).prev = None;
        }

        self.len -= 1;
    }

    #[cfg(test)]
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

#[cfg(test)]
impl<'a, T> Iterator for Iter<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
            self.remaining -= 1;
        }

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
