//! Fiber stack allocation
//!
//! Each fiber owns a fixed-size mmap'd stack with a PROT_NONE guard page at
//! the low end, so overflow faults instead of corrupting a neighbour.

use weft_core::{Error, Result};

/// An owned, mmap'd fiber stack.
///
/// Layout (addresses grow upward, the stack grows downward):
///
/// ```text
/// base                      base + PAGE          base + PAGE + size
///  │  guard page (PROT_NONE) │  usable stack (RW)  │ ← top
/// ```
pub struct Stack {
    base: *mut u8,
    total: usize,
    size: usize,
}

// The mapping is plain anonymous memory; ownership moves with the Stack.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Allocate a stack with `size` usable bytes plus one guard page.
    ///
    /// `size` is rounded up to the page size.
    pub fn new(size: usize) -> Result<Stack> {
        let page = page_size();
        let size = (size.max(page) + page - 1) & !(page - 1);
        let total = size + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::StackAlloc);
        }
        let base = base as *mut u8;

        // Guard page at the low end; the stack grows down toward it.
        let rc = unsafe { libc::mprotect(base as *mut libc::c_void, page, libc::PROT_NONE) };
        if rc != 0 {
            unsafe {
                libc::munmap(base as *mut libc::c_void, total);
            }
            return Err(Error::StackAlloc);
        }

        Ok(Stack { base, total, size })
    }

    /// Upper end of the usable stack region.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable stack bytes (guard page excluded).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        if rc != 0 {
            log::error!("munmap({:p}, {}) failed", self.base, self.total);
        }
    }
}

#[inline]
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_write() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert!(stack.size() >= 64 * 1024);

        // The usable region is writable right up to the top.
        unsafe {
            let top = stack.top();
            *top.sub(1) = 0xAB;
            *top.sub(stack.size()) = 0xCD;
            assert_eq!(*top.sub(1), 0xAB);
        }
    }

    #[test]
    fn test_rounds_up_to_page() {
        let stack = Stack::new(1).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() >= page_size());
    }
}
