use core::{
  alloc::Layout,
  fmt,
  mem::{align_of, size_of},
  ptr::{NonNull, null_mut},
};
use std::alloc::handle_alloc_error;

use crate::error::{ArenaError, Result};
use crate::fit::{Fit, align_forward};
use crate::header::{
  CLAIMED_HEADER_SIZE, ClaimedHeader, FREE_HEADER_SIZE, FreeHeader, MIN_ALIGN, MIN_REQUEST, clean, free_link,
  link_is_free,
};
use crate::list::BlockList;
use crate::platform::{os_acquire, os_release};
use crate::tree::FreeTree;

// =============================================================================
// Constants
// =============================================================================

pub const KILOBYTE: usize = 1024;
pub const MEGABYTE: usize = 1024 * KILOBYTE;

/// Arena size used by [`RbtAllocator::new`] and the per-thread default instance.
pub const DEFAULT_CAPACITY: usize = 8 * MEGABYTE;

// =============================================================================
// Allocator
// =============================================================================

/// General-purpose allocator over one fixed arena.
///
/// Free blocks live in a red-black tree keyed by size; every block, free or
/// claimed, lives in an address-ordered list used to merge neighbours on
/// release. Both structures are stored inside the arena itself, so a claimed
/// block costs only a two-word header.
///
/// ```text
///   arena
///   +------+--------------+------+---------+------+----------------+
///   | free | claimed      | free | claimed | free | claimed        |
///   +------+--------------+------+---------+------+----------------+
///      |                     |                |
///      +------ free tree ----+----------------+
/// ```
///
/// Not thread-safe. Wrap it in [`crate::RbtCell`] to hand it to containers.
pub struct RbtAllocator {
  pub(crate) list: BlockList,
  pub(crate) tree: FreeTree,
  pub(crate) total: usize,
  pub(crate) used: usize,
  allocations: usize,
  /// Region to give back on drop, when the arena owns its storage.
  backing: Option<(NonNull<u8>, usize)>,
}

// The arena is exclusively owned by this value; nothing else points into it.
unsafe impl Send for RbtAllocator {}

impl RbtAllocator {
  /// Allocator over a fresh [`DEFAULT_CAPACITY`] arena.
  ///
  /// Calls [`handle_alloc_error`] if the arena cannot be acquired.
  pub fn new() -> Self {
    Self::default()
  }

  /// Allocator over a fresh arena of `capacity` bytes (rounded up to
  /// [`MIN_ALIGN`]), released again on drop.
  pub fn with_capacity(capacity: usize) -> Result<Self> {
    let len = capacity
      .checked_next_multiple_of(MIN_ALIGN)
      .filter(|&len| len >= FREE_HEADER_SIZE)
      .ok_or(ArenaError::TooSmall {
        len: capacity,
        required: FREE_HEADER_SIZE,
      })?;

    let memory = NonNull::new(unsafe { os_acquire(len) }).ok_or(ArenaError::BackingUnavailable { len })?;

    match unsafe { Self::init(memory.as_ptr(), len) } {
      Ok(mut allocator) => {
        allocator.backing = Some((memory, len));
        Ok(allocator)
      }
      Err(err) => {
        unsafe { os_release(memory.as_ptr(), len) };
        Err(err)
      }
    }
  }

  /// Allocator over caller-provided storage, which is not released on drop.
  ///
  /// # Safety
  ///
  /// `memory..memory + len` must be valid for reads and writes, and must not
  /// be accessed except through this allocator until it is dropped.
  pub unsafe fn from_raw_parts(memory: *mut u8, len: usize) -> Result<Self> {
    unsafe { Self::init(memory, len) }
  }

  /// Lays a single free block over the aligned part of the region.
  unsafe fn init(memory: *mut u8, len: usize) -> Result<Self> {
    let too_small = ArenaError::TooSmall {
      len,
      required: FREE_HEADER_SIZE,
    };

    let end_addr = memory.addr().checked_add(len).ok_or(too_small)? & !(MIN_ALIGN - 1);
    let (start, _) = align_forward(MIN_ALIGN, FREE_HEADER_SIZE, memory, len).ok_or(too_small)?;
    if end_addr < start.addr() + FREE_HEADER_SIZE {
      return Err(too_small);
    }

    let first = start.cast::<ClaimedHeader>();
    let end = memory.wrapping_add(end_addr - memory.addr()).cast::<ClaimedHeader>();

    let mut tree = FreeTree::new();
    unsafe {
      (*first).prev = null_mut();
      (*first).next = end;
      tree.insert(FreeHeader::from_block(first));
    }

    let total = end.addr() - first.addr();
    log::debug!("arena ready at {first:p}: {total} bytes");

    Ok(Self {
      list: BlockList::new(first, end),
      tree,
      total,
      used: 0,
      allocations: 0,
      backing: None,
    })
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Allocates `size` bytes aligned to `align`.
  ///
  /// Returns `None` when no free block can host the request, or when `align`
  /// is not a power of two. A failed call leaves the allocator untouched.
  pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
    if !align.is_power_of_two() {
      log::warn!("rejected allocation of {size} bytes: alignment {align} is not a power of two");
      return None;
    }

    let request = size.max(MIN_REQUEST);
    // SAFETY: the tree only holds linked free blocks of this arena.
    let Some((block, fit)) = (unsafe { self.tree.find_fit(request, align.max(MIN_ALIGN)) }) else {
      log::debug!(
        "no fit for {size} bytes at align {align} ({} of {} bytes used)",
        self.used,
        self.total
      );
      return None;
    };

    let claimed = unsafe { self.claim(block, fit) };
    self.allocations += 1;

    #[cfg(feature = "sanity-checks")]
    self.check_sanity();

    let ptr = claimed.cast::<u8>().wrapping_add(CLAIMED_HEADER_SIZE);
    log::trace!("allocate({size}, {align}) -> {ptr:p}");
    NonNull::new(ptr)
  }

  /// Carves `fit` out of `block`: the claimed block in the middle, and a free
  /// block on either side when the leftover can hold a free header. Smaller
  /// leftovers are folded into a neighbour.
  unsafe fn claim(&mut self, block: *mut FreeHeader, fit: Fit) -> *mut ClaimedHeader {
    unsafe {
      self.tree.remove(block);

      let head = FreeHeader::as_block(block);
      let prev = (*head).prev;
      let next = (*head).next;
      let claimed = fit.claimed;

      // Back: after the user region.
      if fit.remainder >= FREE_HEADER_SIZE {
        let tail = claimed.cast::<u8>().add(CLAIMED_HEADER_SIZE + fit.used).cast::<ClaimedHeader>();
        (*tail).next = next;
        (*tail).prev = free_link(claimed, false);
        self.list.point_back(next, tail, true);
        (*claimed).next = free_link(tail, true);
        self.tree.insert(FreeHeader::from_block(tail));
      } else {
        (*claimed).next = next;
        self.list.point_back(next, claimed, false);
      }

      // Front: between the candidate's start and the claimed header.
      if fit.adjustment >= FREE_HEADER_SIZE {
        (*head).next = free_link(claimed, false);
        (*head).prev = prev;
        (*claimed).prev = free_link(head, true);
        self.list.point_forward(prev, head, true);
        self.tree.insert(block);
      } else {
        // The predecessor is claimed (free blocks never touch) and absorbs the
        // slack, so the slack counts as used from now on.
        debug_assert!(!clean(prev).is_null());
        (*claimed).prev = prev;
        self.list.point_forward(prev, claimed, false);
        self.used += fit.adjustment;
      }

      self.used += BlockList::size_of(claimed);
      claimed
    }
  }

  /// Releases a block returned by [`Self::allocate`], merging it with free
  /// neighbours. Null is ignored.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this allocator. Double frees
  /// and foreign pointers are not detected.
  pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }

    unsafe {
      let claimed = ptr.sub(CLAIMED_HEADER_SIZE).cast::<ClaimedHeader>();
      let prev = (*claimed).prev;
      let next = (*claimed).next;
      self.used -= BlockList::size_of(claimed);

      let mut merged = claimed;

      // At most one free neighbour on each side, since free blocks never touch.
      if link_is_free(prev) {
        merged = clean(prev);
        self.tree.remove(FreeHeader::from_block(merged));
        (*merged).next = next;
      }

      if link_is_free(next)
        && let Some(successor) = self.list.successor(claimed)
      {
        self.tree.remove(FreeHeader::from_block(successor));
        (*merged).next = (*successor).next;
      }

      self.list.point_forward((*merged).prev, merged, true);
      self.list.point_back((*merged).next, merged, true);
      self.tree.insert(FreeHeader::from_block(merged));
    }

    self.allocations -= 1;
    log::trace!("deallocate({ptr:p})");

    #[cfg(feature = "sanity-checks")]
    self.check_sanity();
  }

  /// Moves `value` into the arena. Hands it back if there is no room.
  pub fn alloc_value<T>(&mut self, value: T) -> core::result::Result<NonNull<T>, T> {
    match self.allocate(size_of::<T>(), align_of::<T>()) {
      Some(ptr) => {
        let ptr = ptr.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
      }
      None => Err(value),
    }
  }

  /// Drops a value placed by [`Self::alloc_value`] and releases its block.
  ///
  /// # Safety
  ///
  /// `ptr` must come from [`Self::alloc_value`] on this allocator and must
  /// not be used afterwards.
  pub unsafe fn drop_value<T>(&mut self, ptr: NonNull<T>) {
    unsafe {
      ptr.as_ptr().drop_in_place();
      self.deallocate(ptr.as_ptr().cast());
    }
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  /// Bytes held by claimed blocks, headers and slack included.
  #[inline]
  pub fn used_memory(&self) -> usize {
    self.used
  }

  /// Bytes under management.
  #[inline]
  pub fn total_memory(&self) -> usize {
    self.total
  }

  /// Live allocations.
  #[inline]
  pub fn allocations_count(&self) -> usize {
    self.allocations
  }

  /// Free blocks currently in the tree.
  #[inline]
  pub fn free_block_count(&self) -> usize {
    self.tree.len()
  }

  /// Whether `ptr` falls inside this arena, i.e. whether a deallocation of it
  /// should be routed here.
  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    ptr.addr() > self.list.first.addr() && ptr.addr() < self.list.end.addr()
  }

  /// Bytes usable behind `ptr`, at least the size it was requested with.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this allocator.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    unsafe {
      let claimed = ptr.as_ptr().sub(CLAIMED_HEADER_SIZE).cast::<ClaimedHeader>();
      BlockList::size_of(claimed) - CLAIMED_HEADER_SIZE
    }
  }
}

impl Default for RbtAllocator {
  fn default() -> Self {
    match Self::with_capacity(DEFAULT_CAPACITY) {
      Ok(allocator) => allocator,
      Err(err) => {
        log::error!("default arena unavailable: {err}");
        handle_alloc_error(Layout::from_size_align(DEFAULT_CAPACITY, MIN_ALIGN).unwrap_or(Layout::new::<FreeHeader>()))
      }
    }
  }
}

impl fmt::Debug for RbtAllocator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RbtAllocator")
      .field("base", &self.list.first)
      .field("total", &self.total)
      .field("used", &self.used)
      .field("allocations", &self.allocations)
      .field("free_blocks", &self.tree.len())
      .field("owned", &self.backing.is_some())
      .finish()
  }
}

impl Drop for RbtAllocator {
  fn drop(&mut self) {
    if self.allocations > 0 {
      log::error!(
        "memory leak detected: {} allocations ({} bytes) still live at teardown",
        self.allocations,
        self.used
      );
      // Live blocks may still be in use, so the arena is leaked, not released.
      if !std::thread::panicking() {
        panic!("memory leak detected: {} allocations still live", self.allocations);
      }
      return;
    }

    if let Some((memory, len)) = self.backing.take() {
      unsafe { os_release(memory.as_ptr(), len) };
      log::debug!("arena at {memory:p} released ({len} bytes)");
    }
  }
}
