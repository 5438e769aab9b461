//! Fixed size object pools.
//!
//! A [`Pool`] hands out chunks of one size from blocks it requests from the
//! system, reuses freed chunks without going back to the system allocator,
//! and lets any thread return a chunk to the pool it came from.
//!
//! Every block is one aligned allocation:
//!
//! ```text
//! chunk: 96, align: 32, count: 2
//!
//! base                +56      +64         +184     +192        +320
//!  +--------+-------+--------+-----------+--------+-----------+-----+
//!  | header |  pad  | parent |   data    | parent |   data    | pad |
//!  +--------+-------+--------+-----------+--------+-----------+-----+
//!                   ^        ^ aligned   ^        ^ aligned
//!                   +------ chunk -------+
//! ```
//!
//! Each chunk starts with a pointer to its block and each block knows the
//! pool that allocated it, so returning a chunk never needs to be told where
//! the chunk came from.
//!
//! There are two ways of using the crate:
//!
//! 1. Owned pools. Not shareable between threads, but chunks may be returned
//!    through any pool or with [`Pool::release`]:
//!
//! ```
//! use mempool::{Pool, PoolConfig};
//!
//! let mut p1 = Pool::with_config(PoolConfig::new(24).with_count(512)).unwrap();
//! let mut p2 = Pool::with_config(PoolConfig::simd(24).with_count(256)).unwrap();
//!
//! let ptr = p1.construct([0u64; 3]).unwrap();
//!
//! // Goes to p1's reclamation queue, p1 reuses it on its next
//! // `destruct` or `cleanup`.
//! unsafe { p2.destruct(ptr.as_ptr()) };
//! assert_eq!(1, p1.pending());
//!
//! p1.cleanup();
//! assert_eq!(0, p1.pending());
//! ```
//!
//! 2. Thread local pools through [`Statics`], one per thread and per set of
//!    parameters.
//!
//! Memory is only given back to the system by [`Pool::cleanup`] and when a
//! pool is dropped.

mod block;
pub mod config;
pub mod error;
mod gc;
pub mod kernel;
mod list;
mod pool;
pub mod statics;
pub mod utils;

pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use kernel::{Kernel, RawMemory};
pub use pool::Pool;
pub use statics::Statics;
