//! Block headers and the tag bits stolen from their links.
//!
//! Every block starts with a [`ClaimedHeader`]. A free block extends it into a
//! [`FreeHeader`] by appending its red-black tree links:
//!
//! ```text
//!   Claimed block                      Free block
//!   +-----------------+                +-----------------+
//!   | prev  (tagged)  |                | prev  (tagged)  |
//!   | next  (tagged)  |                | next  (tagged)  |
//!   +-----------------+                | left            |
//!   | user data ...   |                | right           |
//!   |                 |                | parent (tagged) |
//!   +-----------------+                +-----------------+
//! ```
//!
//! Headers are aligned to [`MIN_ALIGN`], so the two low bits of every link are
//! always zero and carry state instead:
//!
//! - bit 0 of a list link (`prev`/`next`) is set when the block it points to is
//!   free. Whether a block is free is therefore read from its neighbour's link,
//!   never from its own header.
//! - bit 1 of `parent` is set when the node owning that field is red.
//!
//! This module is the only place that encodes or decodes those bits.

use core::mem::{align_of, size_of};
use core::ptr::null_mut;

// =============================================================================
// Constants
// =============================================================================

/// Alignment of every block header, and the granularity of every block size.
pub const MIN_ALIGN: usize = 16;

/// Size of the header in front of every claimed block.
pub const CLAIMED_HEADER_SIZE: usize = size_of::<ClaimedHeader>();

/// Size of a free block header. Also the smallest block that can exist.
pub const FREE_HEADER_SIZE: usize = size_of::<FreeHeader>();

/// Smallest request served, so a released block can always hold tree links.
pub(crate) const MIN_REQUEST: usize = FREE_HEADER_SIZE - CLAIMED_HEADER_SIZE;

const FREE_TAG: usize = 0b01;
const RED_TAG: usize = 0b10;
const TAG_MASK: usize = FREE_TAG | RED_TAG;

const _: () = assert!(MIN_ALIGN.is_power_of_two());
const _: () = assert!(MIN_ALIGN > TAG_MASK);
const _: () = assert!(align_of::<ClaimedHeader>() == MIN_ALIGN);
const _: () = assert!(align_of::<FreeHeader>() == MIN_ALIGN);
const _: () = assert!(CLAIMED_HEADER_SIZE < FREE_HEADER_SIZE);
const _: () = assert!(FREE_HEADER_SIZE % MIN_ALIGN == 0);

// =============================================================================
// Types
// =============================================================================

/// Header of every block. `prev`/`next` point at the physical neighbours and
/// carry their free tag.
#[repr(C, align(16))]
pub(crate) struct ClaimedHeader {
  pub prev: *mut ClaimedHeader,
  pub next: *mut ClaimedHeader,
}

/// Header of a free block. Starts with the claimed header so a pointer to
/// either can be cast to the other.
#[repr(C, align(16))]
pub(crate) struct FreeHeader {
  pub links: ClaimedHeader,
  pub left: *mut FreeHeader,
  pub right: *mut FreeHeader,
  /// Parent node, red tag in bit 1. Null with no tag for a black root.
  pub parent: *mut FreeHeader,
}

impl FreeHeader {
  /// Reinterprets a block start as a free header.
  #[inline(always)]
  pub fn from_block(block: *mut ClaimedHeader) -> *mut FreeHeader {
    block.cast()
  }

  #[inline(always)]
  pub fn as_block(node: *mut FreeHeader) -> *mut ClaimedHeader {
    node.cast()
  }

  /// Clears the tree links of a block that is about to enter the tree.
  ///
  /// # Safety
  ///
  /// `node` must point to writable memory of at least [`FREE_HEADER_SIZE`].
  #[inline]
  pub unsafe fn reset_links(node: *mut FreeHeader) {
    unsafe {
      (*node).left = null_mut();
      (*node).right = null_mut();
      (*node).parent = null_mut();
    }
  }
}

// =============================================================================
// Tag encoding
// =============================================================================

/// Strips both tag bits so the pointer can be dereferenced.
#[inline(always)]
pub(crate) fn clean<T>(ptr: *mut T) -> *mut T {
  ptr.map_addr(|addr| addr & !TAG_MASK)
}

/// Whether a list link marks its target as free.
#[inline(always)]
pub(crate) fn link_is_free<T>(link: *mut T) -> bool {
  link.addr() & FREE_TAG != 0
}

/// Builds a list link to `target` carrying its free tag.
#[inline(always)]
pub(crate) fn free_link<T>(target: *mut T, free: bool) -> *mut T {
  target.map_addr(|addr| (addr & !FREE_TAG) | (free as usize))
}

/// Whether a parent link marks its owner as red.
#[inline(always)]
pub(crate) fn link_is_red<T>(link: *mut T) -> bool {
  link.addr() & RED_TAG != 0
}

/// Builds a parent link to `target` carrying the owner's color.
#[inline(always)]
pub(crate) fn red_link<T>(target: *mut T, red: bool) -> *mut T {
  target.map_addr(|addr| (addr & !RED_TAG) | ((red as usize) << 1))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[repr(C, align(16))]
  struct Slot([u8; 64]);

  #[test]
  fn header_layout() {
    assert_eq!(CLAIMED_HEADER_SIZE % MIN_ALIGN, 0);
    assert!(CLAIMED_HEADER_SIZE >= 2 * size_of::<usize>());
    assert!(FREE_HEADER_SIZE >= CLAIMED_HEADER_SIZE + 3 * size_of::<usize>());
    assert_eq!(MIN_REQUEST % MIN_ALIGN, 0);
  }

  #[test]
  fn tags_do_not_clobber_each_other() {
    let mut slot = Slot([0; 64]);
    let base = slot.0.as_mut_ptr().cast::<ClaimedHeader>();

    let link = free_link(base, true);
    assert!(link_is_free(link));
    assert!(!link_is_red(link));

    let both = red_link(link, true);
    assert!(link_is_free(both));
    assert!(link_is_red(both));
    assert_eq!(clean(both), base);

    let unfree = free_link(both, false);
    assert!(!link_is_free(unfree));
    assert!(link_is_red(unfree));

    let black = red_link(unfree, false);
    assert_eq!(black, base);
  }

  #[test]
  fn null_links_carry_tags() {
    let red_root_parent = red_link(null_mut::<FreeHeader>(), true);
    assert!(link_is_red(red_root_parent));
    assert!(clean(red_root_parent).is_null());

    assert!(!link_is_free(null_mut::<ClaimedHeader>()));
    assert!(!link_is_red(null_mut::<FreeHeader>()));
  }
}
