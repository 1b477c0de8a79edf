//! Backing storage for owned arenas: one region acquired at construction and
//! released at teardown.

use core::ptr::null_mut;

#[cfg(all(unix, not(miri)))]
pub(crate) unsafe fn os_acquire(len: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

#[cfg(all(unix, not(miri)))]
pub(crate) unsafe fn os_release(ptr: *mut u8, len: usize) {
  if unsafe { libc::munmap(ptr.cast(), len) } != 0 {
    log::warn!("munmap({ptr:p}, {len}) failed, arena pages stay mapped");
  }
}

// Miri has no FFI and other targets have no mmap: borrow from the system
// allocator instead.

#[cfg(any(not(unix), miri))]
fn region_layout(len: usize) -> Option<std::alloc::Layout> {
  std::alloc::Layout::from_size_align(len, crate::header::MIN_ALIGN).ok()
}

#[cfg(any(not(unix), miri))]
pub(crate) unsafe fn os_acquire(len: usize) -> *mut u8 {
  match region_layout(len) {
    Some(layout) if len > 0 => unsafe { std::alloc::alloc(layout) },
    _ => null_mut(),
  }
}

#[cfg(any(not(unix), miri))]
pub(crate) unsafe fn os_release(ptr: *mut u8, len: usize) {
  if let Some(layout) = region_layout(len) {
    unsafe { std::alloc::dealloc(ptr, layout) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn acquired_region_is_writable_and_aligned() {
    unsafe {
      let len = 64 * 1024;
      let ptr = os_acquire(len);
      assert!(!ptr.is_null());
      assert_eq!(ptr.addr() % crate::header::MIN_ALIGN, 0);

      ptr.write_bytes(0xAB, len);
      assert_eq!(*ptr.add(len - 1), 0xAB);

      os_release(ptr, len);
    }
  }
}
