use std::{mem, ptr::NonNull};
use crate::{config::Geometry, gc::Garbage, list::{Link, Node}};


/// Header size of a block. We need to add the overhead introduced by our
/// [`Node`] structure since we always use our `Block` as a node of the pool's
/// chain of available blocks.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Node<Block>>();

/// Bytes in front of the storage of every chunk: the back-reference to the
/// block the chunk belongs to.
pub(crate) const CHUNK_HEADER_SIZE: usize = mem::size_of::<NonNull<Node<Block>>>();

/// One fixed size slot of a [`Block`].
///
/// ```text
/// +---------------------+ <------+
/// |       parent        |        | -> Header, written once
/// +---------------------+ <------+
/// |   next (when free)  |        |
/// |         ...         |        | -> Storage handed to the user
/// |         ...         |        |
/// +---------------------+ <------+
/// ```
///
/// The `next` link overlaps the storage, so it is only meaningful while the
/// chunk sits in the free list. Only the `parent` field may be read from an
/// allocated chunk.
#[repr(C)]
pub(crate) struct Chunk {
    /// Block which the chunk belongs to.
    pub parent: NonNull<Node<Block>>,
    /// Next free chunk of the same block.
    pub next: Link<Chunk>,
}

/// This is the structure of a block. The fields of the block are its
/// metadata, chunks are placed after this header.
///
/// The following diagram represents this structure ignoring that the block
/// will be wrapped inside a [`Node`]
///
/// ```text
/// +---------------------+ <------+
/// |        owner        |        |
/// +---------------------+        |
/// |        curr         |        |
/// +---------------------+        | -> Header
/// |        first        |        |
/// +---------------------+        |
/// |        used         |        |
/// +---------------------+ <------+
/// |       padding       |
/// +---------------------+ <------+
/// |        Chunk        |        |
/// |         ...         |        | -> `count` chunks of `stride` bytes
/// |        Chunk        |        |
/// +---------------------+ <------+
/// ```
///
/// The padding makes the storage of the first chunk start on an aligned
/// address. Since the stride is a multiple of the alignment, so does every
/// other chunk. See [`crate::config::PoolConfig`] for how this is computed.
pub(crate) struct Block {
    /// Reclamation queue of the pool that allocated the block.
    pub owner: NonNull<Garbage>,
    /// Head of the free list, `None` when the block is full.
    pub curr: Link<Chunk>,
    /// First chunk in memory.
    pub first: NonNull<Chunk>,
    /// Chunks currently handed out.
    pub used: usize,
}

impl Block {
    /// Writes a block header at `base` and threads the free list through
    /// all of its chunks, in address order.
    ///
    /// **SAFETY**: `base` must point to `geometry.allocate` writable bytes
    /// aligned to `geometry.alignment`.
    pub unsafe fn initialize(
        base: NonNull<u8>,
        owner: NonNull<Garbage>,
        geometry: &Geometry,
    ) -> NonNull<Node<Block>> {
        let node = base.cast::<Node<Block>>();

        unsafe {
            let first = base.add(geometry.first).cast::<Chunk>();

            node.write(Node::new(Block {
                owner,
                curr: Some(first),
                first,
                used: 0,
            }));

            let mut cursor = first;
            for i in 1..=geometry.count {
                let next = (i < geometry.count).then(|| cursor.byte_add(geometry.stride));
                cursor.write(Chunk { parent: node, next });

                if let Some(next) = next {
                    cursor = next;
                }
            }
        }

        node
    }

    /// Pops the head of the free list. Returns `None` when the block is full.
    ///
    /// The block is only touched through raw places: other threads read
    /// `owner` at any time, so no `&mut Block` may exist.
    ///
    /// **SAFETY**: `this` must point to a live block owned by the caller.
    pub unsafe fn get(this: NonNull<Self>) -> Link<Chunk> {
        let this = this.as_ptr();

        unsafe {
            let chunk = (*this).curr?;

            // Chunks in the free list are free, so their link is valid.
            (*this).curr = (*chunk.as_ptr()).next;
            (*this).used += 1;

            Some(chunk)
        }
    }

    /// Pushes `chunk` on top of the free list. Null chunks are ignored.
    ///
    /// **SAFETY**: `this` must point to a live block owned by the caller and
    /// `chunk` must be a chunk of that block which is currently handed out.
    pub unsafe fn set(this: NonNull<Self>, chunk: *mut Chunk) {
        let Some(chunk) = NonNull::new(chunk) else {
            return;
        };
        let this = this.as_ptr();

        unsafe {
            debug_assert!((*this).used > 0, "returning a chunk to a block with no chunks in use");
            debug_assert!(chunk >= (*this).first, "returning a chunk of another block");

            (*chunk.as_ptr()).next = (*this).curr;
            (*this).curr = Some(chunk);
            (*this).used -= 1;
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.curr.is_none()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.used == 0
    }
}

/// Header of the block wrapped by `node`, projected without creating a
/// reference to the node.
///
/// **SAFETY**: `node` must point to a live block.
#[inline]
pub(crate) unsafe fn header(node: NonNull<Node<Block>>) -> NonNull<Block> {
    unsafe { NonNull::new_unchecked(&raw mut (*node.as_ptr()).data) }
}

/// Storage of `chunk`, right after its header.
#[inline]
pub(crate) fn data(chunk: NonNull<Chunk>) -> NonNull<u8> {
    // Safety: every chunk is at least two pointers long.
    unsafe { chunk.cast::<u8>().add(CHUNK_HEADER_SIZE) }
}

/// Chunk whose storage starts at `data`.
///
/// **SAFETY**: `data` must come from [`data`].
#[inline]
pub(crate) unsafe fn chunk_of(data: NonNull<u8>) -> NonNull<Chunk> {
    unsafe { data.sub(CHUNK_HEADER_SIZE).cast() }
}

/// Block a chunk was carved from.
///
/// **SAFETY**: `chunk` must belong to a live block.
#[inline]
pub(crate) unsafe fn parent_of(chunk: NonNull<Chunk>) -> NonNull<Node<Block>> {
    unsafe { (*chunk.as_ptr()).parent }
}
