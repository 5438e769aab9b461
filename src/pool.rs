//! The pool: a chain of blocks handing out fixed size chunks.

use std::{
    collections::{HashSet, VecDeque},
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
};

use tracing::{debug, trace, warn};

use crate::{
    block::{self, Block, Chunk},
    config::{Geometry, PoolConfig},
    error::{PoolError, Result},
    gc::Garbage,
    kernel::{Kernel, RawMemory},
    list::{List, Node},
};

/// Fixed size object pool.
///
/// Blocks are requested from the backend `M` on demand and carved into
/// `count` chunks each. A block is always in one of three places:
///
/// ```text
///            get() empties it
///   +-----------+  ------------>  +-----------+
///   | available |                 |   full    |
///   |  (chain)  |  <------------  | (nowhere) |
///   +-----------+   chunk back    +-----------+
///      |     ^
///      |     |  taken when the chain is empty
///      v     |
///   +-----------+   cleanup()
///   |   idle    |  ----------->  backend
///   |  (queue)  |
///   +-----------+
/// ```
///
/// Chain mutation takes `&mut self`, so one pool is driven by one owner at a
/// time. Chunks may still be returned from anywhere: whoever is not the
/// owner pushes them onto the owner's reclamation queue, which the owner
/// drains on every [`Pool::destruct`] and [`Pool::cleanup`].
///
/// # Example
///
/// ```
/// use mempool::Pool;
///
/// let mut pool = Pool::for_type::<[u64; 4]>().unwrap();
///
/// let ptr = pool.construct([1u64, 2, 3, 4]).unwrap();
/// assert_eq!(10, unsafe { ptr.as_ref() }.iter().sum::<u64>());
///
/// unsafe { pool.destruct(ptr.as_ptr()) };
/// ```
pub struct Pool<M: RawMemory = Kernel> {
    /// Block layout.
    geometry: Geometry,
    /// Blocks with at least one free chunk. The head is `top`.
    top: List<Block>,
    /// Blocks with no chunk in use, parked until reused or released.
    idle: VecDeque<NonNull<Node<Block>>>,
    /// Every block this pool allocated.
    all: HashSet<NonNull<Node<Block>>>,
    /// Reclamation queue, and identity of the pool. Freed on drop.
    gc: NonNull<Garbage>,
    marker: PhantomData<fn() -> M>,
}

// Safety: the pool exclusively owns its blocks, its queues and its
// reclamation queue. Moving all of them to another thread is sound; sharing
// is not, hence no `Sync`.
unsafe impl<M: RawMemory> Send for Pool<M> {}

impl Pool {
    /// Pool of `chunk_size` byte chunks with default count and alignment.
    pub fn new(chunk_size: usize) -> Result<Self> {
        Self::with_config(PoolConfig::new(chunk_size))
    }

    /// Pool of chunks of `chunk_size` bytes, `count` chunks per block,
    /// aligned to `align`.
    pub fn with_layout(chunk_size: usize, count: usize, align: usize) -> Result<Self> {
        Self::with_config(PoolConfig::new(chunk_size).with_count(count).with_align(align))
    }

    /// Pool sized and aligned for values of type `T`.
    pub fn for_type<T>() -> Result<Self> {
        Self::with_config(PoolConfig::for_type::<T>())
    }

    /// Pool laid out after `config`, backed by [`Kernel`].
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        Self::with_memory(config)
    }

    /// Returns memory to the pool it was allocated from without access to
    /// that pool. The value is dropped in place and its chunk pushed onto
    /// the owner's reclamation queue; the owner reuses it on its next
    /// [`Pool::destruct`] or [`Pool::cleanup`]. Null pointers are ignored.
    ///
    /// This is the only way to free memory from a thread that has no access
    /// to any pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Pool::construct`] or
    /// [`Pool::allocate`] (of any pool, with any backend), must not have been
    /// returned already, and its pool must still be alive.
    pub unsafe fn release<T>(ptr: *mut T) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        unsafe {
            ptr::drop_in_place(ptr.as_ptr());

            let chunk = block::chunk_of(ptr.cast());
            let owner = (*block::parent_of(chunk).as_ptr()).data.owner;
            owner.as_ref().push(chunk);
        }
    }
}

impl<M: RawMemory> Pool<M> {
    /// Creates a pool that takes its blocks from the backend `M`.
    pub fn with_memory(config: PoolConfig) -> Result<Self> {
        let geometry = config.geometry()?;

        Ok(Self {
            geometry,
            top: List::new(),
            idle: VecDeque::new(),
            all: HashSet::new(),
            gc: NonNull::from(Box::leak(Box::new(Garbage::new()))),
            marker: PhantomData,
        })
    }

    /// Moves `value` into a free chunk and returns a pointer to it.
    ///
    /// Fails with [`PoolError::IncompatibleLayout`] when `T` does not fit in
    /// a chunk, and with [`PoolError::AllocationFailed`] when a new block was
    /// needed and the backend could not provide one. In both cases the pool
    /// is left untouched and `value` is dropped.
    pub fn construct<T>(&mut self, value: T) -> Result<NonNull<T>> {
        if mem::size_of::<T>() > self.geometry.chunk_size()
            || mem::align_of::<T>() > self.geometry.alignment
        {
            return Err(PoolError::IncompatibleLayout {
                size: mem::size_of::<T>(),
                align: mem::align_of::<T>(),
                chunk_size: self.geometry.chunk_size(),
                alignment: self.geometry.alignment,
            });
        }

        let ptr = self.allocate()?.cast::<T>();

        // Safety: the chunk is free, large and aligned enough for `T`.
        unsafe { ptr.write(value) };

        Ok(ptr)
    }

    /// Hands out an uninitialized chunk of [`Pool::chunk_size`] bytes.
    pub fn allocate(&mut self) -> Result<NonNull<u8>> {
        self.acquire().map(block::data)
    }

    /// Drops the value at `ptr` and gives its chunk back.
    ///
    /// Chunks of this pool are recycled right away; chunks of another pool
    /// are pushed onto that pool's reclamation queue. Afterwards every chunk
    /// other threads or pools returned to this pool is recycled. Null
    /// pointers are ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Pool::construct`] (or
    /// [`Pool::allocate`] and initialized as a `T`) of any live pool and must
    /// not have been returned already.
    pub unsafe fn destruct<T>(&mut self, ptr: *mut T) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        unsafe {
            ptr::drop_in_place(ptr.as_ptr());
            self.give_back(ptr.cast());
        }
    }

    /// Gives back a chunk obtained from [`Pool::allocate`] without running
    /// any destructor.
    ///
    /// # Safety
    ///
    /// Same as [`Pool::destruct`].
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        unsafe { self.destruct(ptr) }
    }

    /// Recycles every chunk returned by other threads or pools, then returns
    /// every idle block to the backend. Returns the number of blocks
    /// released.
    ///
    /// This is the only operation that gives memory back.
    pub fn cleanup(&mut self) -> usize {
        let reclaimed = self.drain();
        let mut released = 0;

        while let Some(block) = self.idle.pop_front() {
            self.all.remove(&block);
            self.free(block);
            released += 1;
        }

        debug!(released, reclaimed, blocks = self.all.len(), "pool cleanup");

        released
    }

    /// Whether `ptr` was handed out by this pool.
    ///
    /// # Safety
    ///
    /// `ptr` must be a chunk currently handed out by a live pool.
    pub unsafe fn owns<T>(&self, ptr: *const T) -> bool {
        let Some(ptr) = NonNull::new(ptr.cast_mut()) else {
            return false;
        };

        unsafe {
            let parent = block::parent_of(block::chunk_of(ptr.cast()));
            (*parent.as_ptr()).data.owner == self.gc && self.all.contains(&parent)
        }
    }

    /// Usable bytes per chunk. At least the configured chunk size.
    pub fn chunk_size(&self) -> usize {
        self.geometry.chunk_size()
    }

    /// Bytes a chunk occupies in its block, header included.
    pub fn chunk_stride(&self) -> usize {
        self.geometry.stride
    }

    /// Chunks carved out of every block.
    pub fn chunks_per_block(&self) -> usize {
        self.geometry.count
    }

    /// Alignment of every pointer handed out.
    pub fn alignment(&self) -> usize {
        self.geometry.alignment
    }

    /// Bytes requested from the backend per block.
    pub fn block_bytes(&self) -> usize {
        self.geometry.allocate
    }

    /// Blocks currently owned, whatever their state.
    pub fn block_count(&self) -> usize {
        self.all.len()
    }

    /// Blocks waiting in the idle queue.
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Blocks in the available chain.
    pub fn available_count(&self) -> usize {
        self.top.len()
    }

    /// Chunks returned by others and not recycled yet.
    pub fn pending(&self) -> usize {
        self.garbage().len()
    }

    /// Returns the chunk whose storage is `data`, then drains the
    /// reclamation queue. No destructor runs.
    ///
    /// **SAFETY**: `data` must be a chunk handed out by a live pool.
    pub(crate) unsafe fn give_back(&mut self, data: NonNull<u8>) {
        unsafe { self.reclaim(block::chunk_of(data)) };
        self.drain();
    }

    #[inline]
    fn garbage(&self) -> &Garbage {
        // Safety: the queue lives as long as the pool.
        unsafe { self.gc.as_ref() }
    }

    /// Takes a chunk from `top`, refilling the chain when it is empty.
    fn acquire(&mut self) -> Result<NonNull<Chunk>> {
        loop {
            let top = match self.top.first() {
                Some(top) => top,
                None => {
                    let block = match self.idle.pop_front() {
                        Some(block) => block,
                        None => match self.garbage().pop() {
                            // Somebody returned a chunk, hand it out as is.
                            Some(chunk) => return Ok(chunk),
                            None => self.setup()?,
                        },
                    };
                    // Safety: idle and fresh blocks belong to no list.
                    unsafe {
                        debug_assert!(!(*block.as_ptr()).is_linked());
                        self.top.push_front(block);
                    }
                    block
                }
            };

            // Safety: blocks in the chain are live.
            unsafe {
                let chunk = Block::get(block::header(top));

                if (*top.as_ptr()).data.is_full() {
                    // Reachable again through its chunks only.
                    self.top.remove(top);
                }

                if let Some(chunk) = chunk {
                    return Ok(chunk);
                }
            }
        }
    }

    /// Requests a new block from the backend.
    fn setup(&mut self) -> Result<NonNull<Node<Block>>> {
        let Geometry {
            allocate,
            alignment,
            ..
        } = self.geometry;

        // Safety: `allocate` always covers at least one header and one chunk.
        let Some(base) = (unsafe { M::request_memory(allocate, alignment) }) else {
            warn!(size = allocate, align = alignment, "block allocation failed");
            return Err(PoolError::AllocationFailed {
                size: allocate,
                align: alignment,
            });
        };

        // Safety: `base` spans `allocate` bytes aligned to `alignment`.
        let block = unsafe { Block::initialize(base, self.gc, &self.geometry) };
        self.all.insert(block);

        debug!(size = allocate, block = ?block, blocks = self.all.len(), "allocated block");

        Ok(block)
    }

    /// Routes a returned chunk to its owner.
    ///
    /// **SAFETY**: `chunk` must be handed out by a live pool.
    unsafe fn reclaim(&mut self, chunk: NonNull<Chunk>) {
        unsafe {
            let owner = (*block::parent_of(chunk).as_ptr()).data.owner;

            if owner == self.gc {
                self.recycle(chunk);
            } else {
                trace!(chunk = ?chunk, "returning chunk to foreign pool");
                owner.as_ref().push(chunk);
            }
        }
    }

    /// Recycles everything in the reclamation queue.
    fn drain(&mut self) -> usize {
        let mut reclaimed = 0;

        while let Some(chunk) = self.garbage().pop() {
            // Safety: only chunks of this pool are pushed to its queue.
            unsafe { self.recycle(chunk) };
            reclaimed += 1;
        }

        reclaimed
    }

    /// Puts `chunk` back into its block and moves the block along the state
    /// machine.
    ///
    /// **SAFETY**: `chunk` must be a handed out chunk of this pool.
    unsafe fn recycle(&mut self, chunk: NonNull<Chunk>) {
        unsafe {
            let parent = block::parent_of(chunk);

            // full -> available
            if (*parent.as_ptr()).data.is_full() {
                self.top.push_front(parent);
            }

            Block::set(block::header(parent), chunk.as_ptr());

            // available -> idle, unless it is the block we allocate from.
            if (*parent.as_ptr()).data.is_idle() && !self.top.is_first(parent) {
                self.top.remove(parent);
                self.idle.push_back(parent);
            }
        }
    }

    fn free(&self, block: NonNull<Node<Block>>) {
        debug!(size = self.geometry.allocate, block = ?block, "released block");

        // Safety: the block came from `M` with this very layout and is
        // forgotten by the caller.
        unsafe { M::return_memory(block.cast(), self.geometry.allocate, self.geometry.alignment) };
    }
}

impl<M: RawMemory> Drop for Pool<M> {
    fn drop(&mut self) {
        for block in mem::take(&mut self.all) {
            self.free(block);
        }

        // Safety: allocated in `with_memory`, blocks referencing it are gone.
        unsafe { drop(Box::from_raw(self.gc.as_ptr())) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, rc::Rc};

    /// Backend that never has memory.
    struct Exhausted;

    impl RawMemory for Exhausted {
        unsafe fn request_memory(_len: usize, _align: usize) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn return_memory(_addr: NonNull<u8>, _len: usize, _align: usize) {
            unreachable!("nothing was ever allocated");
        }
    }

    fn parent<T>(ptr: NonNull<T>) -> NonNull<Node<Block>> {
        unsafe { block::parent_of(block::chunk_of(ptr.cast())) }
    }

    fn pool(count: usize) -> Pool {
        Pool::with_layout(16, count, 8).unwrap()
    }

    #[test]
    fn back_reference_identifies_pool() {
        let mut a = pool(4);
        let b = pool(4);

        let ptrs: Vec<_> = (0..10).map(|i| a.construct(i as u64).unwrap()).collect();

        for ptr in &ptrs {
            assert!(unsafe { a.owns(ptr.as_ptr()) });
            assert!(!unsafe { b.owns(ptr.as_ptr()) });
            assert!(a.all.contains(&parent(*ptr)));
        }
    }

    #[test]
    fn construct_never_issues_twice() {
        let mut pool = pool(8);

        let mut addrs: Vec<_> = (0..100)
            .map(|i| pool.construct(i as u32).unwrap().as_ptr() as usize)
            .collect();
        addrs.sort_unstable();
        addrs.dedup();

        assert_eq!(100, addrs.len());
    }

    #[test]
    fn freed_chunks_are_reused_lifo() {
        let mut pool = pool(8);

        let a = pool.construct(1u64).unwrap();
        let b = pool.construct(2u64).unwrap();

        unsafe {
            pool.destruct(b.as_ptr());
            pool.destruct(a.as_ptr());
        }

        assert_eq!(a, pool.construct(3u64).unwrap());
        assert_eq!(b, pool.construct(4u64).unwrap());
    }

    #[test]
    fn third_chunk_comes_from_a_second_block() {
        let mut pool = pool(2);

        let a = pool.construct(1u8).unwrap();
        let b = pool.construct(2u8).unwrap();
        assert_eq!(1, pool.block_count());

        let c = pool.construct(3u8).unwrap();
        assert_eq!(2, pool.block_count());

        assert_eq!(parent(a), parent(b));
        assert_ne!(parent(a), parent(c));
    }

    #[test]
    fn full_block_leaves_the_chain_and_is_not_idle() {
        let mut pool = pool(2);

        let a = pool.construct(1u8).unwrap();
        assert_eq!(1, pool.available_count());

        let _b = pool.construct(2u8).unwrap();
        let full = parent(a);

        assert_eq!(0, pool.available_count());
        assert_eq!(0, pool.idle_count());
        assert!(!pool.idle.contains(&full));
        assert!(pool.all.contains(&full));
        assert!(unsafe { full.as_ref() }.data.is_full());
    }

    #[test]
    fn idle_block_is_released_by_cleanup() {
        let mut pool = pool(2);

        let c1 = pool.construct(1u32).unwrap();
        let c2 = pool.construct(2u32).unwrap();
        let c3 = pool.construct(3u32).unwrap();
        let c4 = pool.construct(4u32).unwrap();

        let first = parent(c1);
        let second = parent(c3);

        unsafe {
            // second becomes available, then first is pushed in front of it.
            pool.destruct(c3.as_ptr());
            pool.destruct(c1.as_ptr());
            assert!(pool.top.is_first(first));

            // second is idle and not `top`.
            pool.destruct(c4.as_ptr());
        }

        assert_eq!(1, pool.idle_count());
        assert!(pool.idle.contains(&second));

        assert_eq!(1, pool.cleanup());
        assert_eq!(0, pool.idle_count());
        assert_eq!(1, pool.block_count());
        assert!(!pool.all.contains(&second));

        // Remaining chunks come from the surviving block.
        let next = pool.construct(5u32).unwrap();
        assert_eq!(first, parent(next));
        assert_eq!(c1, next);

        unsafe { pool.destruct(c2.as_ptr()) };
    }

    #[test]
    fn idle_top_is_kept() {
        let mut pool = pool(2);

        let a = pool.construct(1u16).unwrap();
        unsafe { pool.destruct(a.as_ptr()) };

        assert_eq!(0, pool.idle_count());
        assert_eq!(1, pool.available_count());
        assert_eq!(0, pool.cleanup());
        assert_eq!(1, pool.block_count());
    }

    #[test]
    fn idle_blocks_are_reused_before_allocating() {
        let mut pool = pool(2);

        let a = pool.construct(1u8).unwrap();
        let b = pool.construct(2u8).unwrap();
        let c = pool.construct(3u8).unwrap();
        let _d = pool.construct(4u8).unwrap();
        let e = pool.construct(5u8).unwrap();
        assert_eq!(3, pool.block_count());

        unsafe {
            // chain: [a's block, e's block], then [c's block, a's block, e's block]
            pool.destruct(a.as_ptr());
            pool.destruct(c.as_ptr());
            // a's block is idle and not `top`.
            pool.destruct(b.as_ptr());
        }
        assert_eq!(1, pool.idle_count());
        assert_eq!(2, pool.available_count());

        // Drain the chain first, then the idle block is taken back.
        assert_eq!(c, pool.construct(6u8).unwrap());
        assert_eq!(parent(e), parent(pool.construct(7u8).unwrap()));
        assert_eq!(b, pool.construct(8u8).unwrap());
        assert_eq!(a, pool.construct(9u8).unwrap());

        assert_eq!(3, pool.block_count());
        assert_eq!(0, pool.idle_count());
    }

    #[test]
    fn foreign_chunk_waits_for_its_owner() {
        let mut a = pool(4);
        let mut b = pool(4);

        let x = a.construct(7u64).unwrap();
        unsafe { b.destruct(x.as_ptr()) };

        assert_eq!(1, a.pending());
        assert_eq!(0, b.pending());

        for i in 0..8 {
            let y = b.construct(i as u64).unwrap();
            assert_ne!(x, y);
            assert!(!unsafe { a.owns(y.as_ptr()) });
        }

        assert_eq!(0, a.cleanup());
        assert_eq!(0, a.pending());
        assert_eq!(x, a.construct(8u64).unwrap());
    }

    #[test]
    fn foreign_chunk_is_recycled_by_any_destruct() {
        let mut a = pool(4);
        let mut b = pool(4);

        let x = a.construct(1u64).unwrap();
        let y = a.construct(2u64).unwrap();

        unsafe {
            b.destruct(x.as_ptr());
            a.destruct(y.as_ptr());
        }

        assert_eq!(0, a.pending());
        assert_eq!(x, a.construct(3u64).unwrap());
        assert_eq!(y, a.construct(4u64).unwrap());
    }

    #[test]
    fn empty_chain_takes_returned_chunk_first() {
        let mut a = pool(1);
        let mut b = pool(1);

        let x = a.construct(1u32).unwrap();
        assert_eq!(0, a.available_count());

        unsafe { b.destruct(x.as_ptr()) };

        // No block is available and none is idle, so the returned chunk is
        // handed out without allocating.
        assert_eq!(x, a.construct(2u32).unwrap());
        assert_eq!(1, a.block_count());
    }

    #[test]
    fn release_routes_to_owner() {
        let mut pool = Pool::with_layout(32, 4, 8).unwrap();

        let x = pool.construct(String::from("released")).unwrap();
        unsafe { Pool::release(x.as_ptr()) };

        assert_eq!(1, pool.pending());
        pool.cleanup();
        assert_eq!(x.cast(), pool.allocate().unwrap());
    }

    #[test]
    fn pointers_respect_alignment() {
        for align in [1, 8, 16, 24, 32, 64, 128, 4096] {
            let mut pool = Pool::with_layout(40, 3, align).unwrap();
            let expected = align.next_power_of_two().max(mem::size_of::<usize>());
            assert_eq!(expected, pool.alignment());

            for _ in 0..10 {
                let ptr = pool.allocate().unwrap();
                assert_eq!(0, ptr.as_ptr() as usize % expected);
            }
        }
    }

    #[test]
    fn null_is_ignored() {
        let mut pool = pool(2);
        let x = pool.construct(1u8).unwrap();

        unsafe {
            pool.destruct::<u64>(ptr::null_mut());
            pool.deallocate(ptr::null_mut());
            Pool::release::<u64>(ptr::null_mut());
            assert!(!pool.owns::<u8>(ptr::null()));
        }

        assert_eq!(1, pool.block_count());
        assert_eq!(0, pool.pending());
        assert_ne!(x, pool.construct(2u8).unwrap());
    }

    #[test]
    fn values_are_dropped_once() {
        struct Tracked(Rc<Cell<usize>>);

        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let mut pool = Pool::for_type::<Tracked>().unwrap();

        let a = pool.construct(Tracked(Rc::clone(&drops))).unwrap();
        let b = pool.construct(Tracked(Rc::clone(&drops))).unwrap();

        unsafe {
            pool.destruct(a.as_ptr());
            Pool::release(b.as_ptr());
        }
        assert_eq!(2, drops.get());

        pool.cleanup();
        assert_eq!(2, drops.get());
        assert_eq!(1, Rc::strong_count(&drops));
    }

    #[test]
    fn oversized_type_is_rejected() {
        let mut pool = pool(2);

        let err = pool.construct([0u8; 64]).unwrap_err();
        assert!(matches!(err, PoolError::IncompatibleLayout { size: 64, .. }));

        #[repr(align(64))]
        struct Aligned(u8);
        let err = pool.construct(Aligned(1)).unwrap_err();
        assert!(matches!(err, PoolError::IncompatibleLayout { align: 64, .. }));

        assert_eq!(0, pool.block_count());
    }

    #[test]
    fn backend_failure_leaves_no_state() {
        let mut pool = Pool::<Exhausted>::with_memory(PoolConfig::new(32)).unwrap();

        let err = pool.construct(1u64).unwrap_err();
        assert_eq!(
            PoolError::AllocationFailed {
                size: pool.block_bytes(),
                align: pool.alignment(),
            },
            err
        );
        assert!(err.is_retryable());

        assert_eq!(0, pool.block_count());
        assert_eq!(0, pool.available_count());
        assert_eq!(0, pool.idle_count());
    }

    #[test]
    fn pool_can_move_with_live_chunks() {
        let mut pool = pool(4);
        let x = pool.construct(11u64).unwrap();

        let mut moved = Box::new(pool);
        assert!(unsafe { moved.owns(x.as_ptr()) });

        unsafe { moved.destruct(x.as_ptr()) };
        assert_eq!(0, moved.pending());
        assert_eq!(x, moved.construct(12u64).unwrap());
    }
}
