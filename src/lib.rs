#![allow(clippy::missing_safety_doc)]

//! Heap allocator over a single fixed arena.
//!
//! Every block starts with a two-word header linking it to its neighbours in
//! address order. Free blocks extend that header with red-black tree links and
//! are indexed by size, so a request is served by descending the tree rather
//! than scanning. Freed blocks merge with free neighbours immediately, which
//! keeps free space in as few blocks as possible.
//!
//! Status bits ride in the low bits of the links themselves: bit 0 of a list
//! link says whether the block it points at is free, bit 1 of a tree parent
//! link carries the node's color.
//!
//! ```
//! use rbtalloc::RbtAllocator;
//!
//! let mut arena = RbtAllocator::with_capacity(64 * 1024).unwrap();
//! let ptr = arena.allocate(100, 8).unwrap();
//! assert_eq!(ptr.addr().get() % 8, 0);
//! unsafe { arena.deallocate(ptr.as_ptr()) };
//! assert_eq!(arena.used_memory(), 0);
//! ```

mod arena;
mod cell;
mod diag;
mod error;
mod fit;
mod header;
mod list;
mod platform;
mod tree;

pub use arena::{DEFAULT_CAPACITY, KILOBYTE, MEGABYTE, RbtAllocator};
pub use cell::{DefaultArena, RbtCell, with_default};
pub use diag::{BlockInfo, Blocks, Violation};
pub use error::{ArenaError, Result};
pub use fit::align_forward;
pub use header::{CLAIMED_HEADER_SIZE, FREE_HEADER_SIZE, MIN_ALIGN};
