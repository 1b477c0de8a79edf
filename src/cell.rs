//! Adapters that let containers allocate from an arena through the
//! [`allocator_api2`] `Allocator` trait.

use core::{cell::UnsafeCell, marker::PhantomData, ptr::NonNull};

use allocator_api2::alloc::{AllocError, Allocator, Layout};

use crate::arena::RbtAllocator;
use crate::diag::Violation;

// =============================================================================
// RbtCell
// =============================================================================

/// Single-threaded shared handle to an [`RbtAllocator`].
///
/// `&RbtCell` implements [`Allocator`], so any number of containers can draw
/// from the same arena:
///
/// ```
/// use allocator_api2::vec::Vec;
/// use rbtalloc::{RbtAllocator, RbtCell};
///
/// let arena = RbtCell::new(RbtAllocator::with_capacity(64 * 1024).unwrap());
/// let mut numbers = Vec::new_in(&arena);
/// numbers.extend([1, 2, 3]);
/// assert!(arena.used_memory() > 0);
/// ```
pub struct RbtCell {
  inner: UnsafeCell<RbtAllocator>,
}

impl RbtCell {
  pub const fn new(allocator: RbtAllocator) -> Self {
    Self {
      inner: UnsafeCell::new(allocator),
    }
  }

  pub fn get_mut(&mut self) -> &mut RbtAllocator {
    self.inner.get_mut()
  }

  pub fn into_inner(self) -> RbtAllocator {
    self.inner.into_inner()
  }

  // The cell is !Sync and none of the calls below re-enter it, so the
  // borrows taken here never overlap.

  fn allocator(&self) -> &RbtAllocator {
    unsafe { &*self.inner.get() }
  }

  #[allow(clippy::mut_from_ref)]
  fn allocator_mut(&self) -> &mut RbtAllocator {
    unsafe { &mut *self.inner.get() }
  }

  pub fn used_memory(&self) -> usize {
    self.allocator().used_memory()
  }

  pub fn total_memory(&self) -> usize {
    self.allocator().total_memory()
  }

  pub fn allocations_count(&self) -> usize {
    self.allocator().allocations_count()
  }

  pub fn contains(&self, ptr: *const u8) -> bool {
    self.allocator().contains(ptr)
  }

  pub fn audit(&self) -> Result<(), Violation> {
    self.allocator().audit()
  }
}

unsafe impl Allocator for RbtCell {
  fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
    let allocator = self.allocator_mut();
    let ptr = allocator.allocate(layout.size(), layout.align()).ok_or(AllocError)?;
    let usable = unsafe { allocator.usable_size(ptr) };
    Ok(NonNull::slice_from_raw_parts(ptr, usable))
  }

  unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
    debug_assert!(self.contains(ptr.as_ptr()), "{ptr:p} does not belong to this arena");
    unsafe { self.allocator_mut().deallocate(ptr.as_ptr()) }
  }
}

// =============================================================================
// Per-thread default
// =============================================================================

thread_local! {
  static DEFAULT: RbtCell = RbtCell::new(RbtAllocator::new());
}

/// Runs `f` with this thread's default arena, created on first use with
/// [`crate::DEFAULT_CAPACITY`] bytes.
///
/// The arena is torn down with the thread, so every allocation made from it
/// must be released before the thread exits.
pub fn with_default<R>(f: impl FnOnce(&RbtCell) -> R) -> R {
  DEFAULT.with(f)
}

/// Zero-sized [`Allocator`] backed by the calling thread's default arena.
///
/// Not `Send`: memory must be released on the thread that allocated it.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultArena {
  _not_send: PhantomData<*const ()>,
}

impl DefaultArena {
  pub const fn new() -> Self {
    Self { _not_send: PhantomData }
  }
}

unsafe impl Allocator for DefaultArena {
  fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
    // The thread-local may already be gone while the thread shuts down.
    DEFAULT.try_with(|cell| cell.allocate(layout)).unwrap_or(Err(AllocError))
  }

  unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
    let released = DEFAULT.try_with(|cell| unsafe { cell.deallocate(ptr, layout) });
    if released.is_err() {
      log::warn!("default arena already torn down, {ptr:p} not released");
    }
  }
}
