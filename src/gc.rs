//! Cross-owner reclamation queue.
//!
//! Every pool owns one [`Garbage`] queue on the heap. Blocks remember the
//! address of that queue, which makes it the identity of the pool: a chunk
//! belongs to the pool whose queue its block points to. Any thread may push
//! a chunk onto a queue, only the owning pool pops from it.

use std::ptr::NonNull;

use crossbeam_queue::SegQueue;

use crate::block::Chunk;

/// A chunk in transit back to its owner.
struct Reclaimed(NonNull<Chunk>);

// Safety: the chunk is not accessed while it sits in the queue and is only
// handed back to the thread that owns its pool.
unsafe impl Send for Reclaimed {}

/// Unordered, lock-free bag of chunks returned by threads or pools that do
/// not own them.
pub(crate) struct Garbage {
    queue: SegQueue<Reclaimed>,
}

impl Garbage {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    /// Hands `chunk` back to the owner. Never blocks.
    pub fn push(&self, chunk: NonNull<Chunk>) {
        self.queue.push(Reclaimed(chunk));
    }

    /// Takes one chunk if any is present.
    ///
    /// Only the owning pool may call this, which `Pool` guarantees by taking
    /// `&mut self` on every path that drains.
    pub fn pop(&self) -> Option<NonNull<Chunk>> {
        self.queue.pop().map(|Reclaimed(chunk)| chunk)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
