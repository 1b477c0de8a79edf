//! Fit test: can a free block host `size` bytes at `align`, and where?

use crate::header::{CLAIMED_HEADER_SIZE, ClaimedHeader, FREE_HEADER_SIZE, FreeHeader, MIN_ALIGN, clean};
use crate::list::BlockList;

/// Where a request lands inside a candidate block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Fit {
  /// Header of the block handed out. The user pointer follows it.
  pub claimed: *mut ClaimedHeader,
  /// Bytes between the candidate's start and `claimed`.
  pub adjustment: usize,
  /// Bytes left after the user region, up to the candidate's end.
  pub remainder: usize,
  /// Request size after rounding to [`MIN_ALIGN`].
  pub used: usize,
}

/// Advances `cursor` to the next multiple of `align` so that `size` bytes
/// still fit in `space`. Returns the new cursor and the space left from it.
///
/// `align` must be a power of two.
#[inline]
pub fn align_forward(align: usize, size: usize, cursor: *mut u8, space: usize) -> Option<(*mut u8, usize)> {
  debug_assert!(align.is_power_of_two());
  let pad = cursor.addr().wrapping_neg() & (align - 1);
  if size > space || pad > space - size {
    return None;
  }
  Some((cursor.wrapping_add(pad), space - pad))
}

/// Tests whether `block` can host the request and computes the carving.
///
/// The arena's first block has no predecessor to take a prefix, so a free
/// header's worth of space is reserved in front of the claimed header there.
/// That prefix always becomes a free block of its own.
///
/// # Safety
///
/// `block` must be null or a free block linked into the arena.
pub(crate) unsafe fn try_fit(block: *mut FreeHeader, size: usize, align: usize) -> Option<Fit> {
  if block.is_null() {
    return None;
  }

  let header = FreeHeader::as_block(block);
  let used = size.checked_next_multiple_of(MIN_ALIGN)?;
  let starting_space = unsafe { BlockList::size_of(header) } - CLAIMED_HEADER_SIZE;

  let mut cursor = header.cast::<u8>().wrapping_add(CLAIMED_HEADER_SIZE);
  let mut space = starting_space;

  if unsafe { clean((*header).prev) }.is_null() {
    if space < FREE_HEADER_SIZE {
      return None;
    }
    space -= FREE_HEADER_SIZE;
    cursor = cursor.wrapping_add(FREE_HEADER_SIZE);
  }

  let (cursor, _) = align_forward(align, used, cursor, space)?;
  let adjustment = cursor.addr() - header.addr() - CLAIMED_HEADER_SIZE;

  Some(Fit {
    claimed: cursor.wrapping_sub(CLAIMED_HEADER_SIZE).cast(),
    adjustment,
    remainder: starting_space - adjustment - used,
    used,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::header::free_link;
  use core::ptr::null_mut;

  #[repr(C, align(4096))]
  struct Page([u8; 4096]);

  #[test]
  fn align_forward_contract() {
    let mut page = Page([0; 4096]);
    let base = page.0.as_mut_ptr();

    // Already aligned: nothing moves.
    assert_eq!(align_forward(16, 32, base, 64), Some((base, 64)));

    // Moves to the next boundary and shrinks the space.
    let cursor = base.wrapping_add(16);
    assert_eq!(align_forward(64, 8, cursor, 100), Some((base.wrapping_add(64), 52)));

    // Exactly enough room after padding.
    assert_eq!(align_forward(64, 52, cursor, 100), Some((base.wrapping_add(64), 52)));

    // One byte short after padding, and a request larger than the space.
    assert_eq!(align_forward(64, 53, cursor, 100), None);
    assert_eq!(align_forward(1, 101, cursor, 100), None);
  }

  /// Lays out `[first | middle | end)` and returns both block pointers.
  unsafe fn two_blocks(base: *mut u8, first_len: usize, total: usize) -> (*mut FreeHeader, *mut FreeHeader) {
    let first = base.cast::<ClaimedHeader>();
    let middle = base.wrapping_add(first_len).cast::<ClaimedHeader>();
    let end = base.wrapping_add(total).cast::<ClaimedHeader>();
    unsafe {
      (*first).prev = null_mut();
      (*first).next = free_link(middle, true);
      (*middle).prev = free_link(first, true);
      (*middle).next = end;
    }
    (first.cast(), middle.cast())
  }

  #[test]
  fn first_block_reserves_a_free_prefix() {
    let mut page = Page([0; 4096]);
    let (first, _) = unsafe { two_blocks(page.0.as_mut_ptr(), 1024, 4096) };

    let fit = unsafe { try_fit(first, 100, 16) }.unwrap();
    assert_eq!(fit.adjustment, FREE_HEADER_SIZE);
    assert_eq!(fit.used, 112);
    assert_eq!(fit.remainder, 1024 - CLAIMED_HEADER_SIZE - FREE_HEADER_SIZE - 112);

    // Not even the prefix fits.
    let (tiny, _) = unsafe { two_blocks(page.0.as_mut_ptr(), FREE_HEADER_SIZE, 4096) };
    assert_eq!(unsafe { try_fit(tiny, 1, 16) }, None);
  }

  #[test]
  fn interior_block_is_carved_in_place() {
    let mut page = Page([0; 4096]);
    let (_, middle) = unsafe { two_blocks(page.0.as_mut_ptr(), 1024, 4096) };

    let fit = unsafe { try_fit(middle, 64, 16) }.unwrap();
    assert_eq!(fit.claimed, FreeHeader::as_block(middle));
    assert_eq!(fit.adjustment, 0);
    assert_eq!(fit.remainder, 3072 - CLAIMED_HEADER_SIZE - 64);
  }

  #[test]
  fn large_alignment_moves_the_claimed_header() {
    let mut page = Page([0; 4096]);
    let (_, middle) = unsafe { two_blocks(page.0.as_mut_ptr(), 1024, 4096) };

    let fit = unsafe { try_fit(middle, 64, 512) }.unwrap();
    let user = fit.claimed.cast::<u8>().wrapping_add(CLAIMED_HEADER_SIZE);
    assert_eq!(user.addr() % 512, 0);
    assert_eq!(fit.adjustment, 512 - CLAIMED_HEADER_SIZE);

    assert_eq!(unsafe { try_fit(middle, 4096, 16) }, None);
    assert_eq!(unsafe { try_fit(null_mut(), 1, 16) }, None);
  }
}
