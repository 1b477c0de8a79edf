//! Address-ordered list over every block in the arena, free or claimed.
//!
//! Sizes are never stored: a block ends where its successor begins, so every
//! block must stay linked for its size to be recoverable. The last block links
//! to the arena end, which is a sentinel address and never dereferenced.

use crate::header::{ClaimedHeader, clean, free_link, link_is_free};

#[derive(Clone, Copy)]
pub(crate) struct BlockList {
  /// Block at the arena start. It has no predecessor and is never claimed.
  pub first: *mut ClaimedHeader,
  /// One past the last block. Aligned, untagged, never dereferenced.
  pub end: *mut ClaimedHeader,
}

impl BlockList {
  pub const fn new(first: *mut ClaimedHeader, end: *mut ClaimedHeader) -> Self {
    Self { first, end }
  }

  /// Size of `block` in bytes, header included.
  ///
  /// # Safety
  ///
  /// `block` must be a linked block of this list.
  #[inline(always)]
  pub unsafe fn size_of(block: *mut ClaimedHeader) -> usize {
    unsafe { clean((*block).next).addr() - block.addr() }
  }

  /// Whether `block` is free, read from its predecessor's `next` link.
  ///
  /// # Safety
  ///
  /// `block` must be a linked block of this list.
  pub unsafe fn is_free(&self, block: *mut ClaimedHeader) -> bool {
    let prev = unsafe { clean((*block).prev) };
    if prev.is_null() {
      // Carving always leaves a free prefix at the arena start.
      debug_assert_eq!(block, self.first);
      true
    } else {
      unsafe { link_is_free((*prev).next) }
    }
  }

  /// Following block, or `None` at the arena end.
  ///
  /// # Safety
  ///
  /// `block` must be a linked block of this list.
  #[inline]
  pub unsafe fn successor(&self, block: *mut ClaimedHeader) -> Option<*mut ClaimedHeader> {
    let next = unsafe { clean((*block).next) };
    (next != self.end).then_some(next)
  }

  /// Re-points the predecessor named by `prev_link` at `block`.
  ///
  /// # Safety
  ///
  /// `prev_link` must be null or a (possibly tagged) pointer to a linked block.
  #[inline]
  pub unsafe fn point_forward(&self, prev_link: *mut ClaimedHeader, block: *mut ClaimedHeader, free: bool) {
    let prev = clean(prev_link);
    if !prev.is_null() {
      unsafe { (*prev).next = free_link(block, free) };
    }
  }

  /// Re-points the successor named by `next_link` back at `block`. No-op when
  /// the successor is the arena end.
  ///
  /// # Safety
  ///
  /// `next_link` must be the arena end or a (possibly tagged) pointer to a
  /// linked block.
  #[inline]
  pub unsafe fn point_back(&self, next_link: *mut ClaimedHeader, block: *mut ClaimedHeader, free: bool) {
    let next = clean(next_link);
    if next != self.end {
      unsafe { (*next).prev = free_link(block, free) };
    }
  }
}
