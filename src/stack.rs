//! Stack traces recorded for sampled allocations.

use core::ffi::c_void;
use core::ptr::null_mut;

/// Deepest stack recorded for a sample.
pub const MAX_STACK_DEPTH: usize = 64;

/// The call stack and requested size of a sampled allocation.
#[derive(Clone, Copy)]
pub struct StackTrace {
    /// Bytes the client asked for.
    pub size: usize,
    depth: usize,
    stack: [*mut c_void; MAX_STACK_DEPTH],
}

// SAFETY: the frames are return addresses, never dereferenced.
unsafe impl Send for StackTrace {}
unsafe impl Sync for StackTrace {}

impl StackTrace {
    pub const fn empty(size: usize) -> Self {
        StackTrace {
            size,
            depth: 0,
            stack: [null_mut(); MAX_STACK_DEPTH],
        }
    }

    /// Records the caller's stack. Must not be called with engine locks held:
    /// the unwinder may allocate through the system allocator on first use.
    #[inline(never)]
    pub fn capture(size: usize) -> Self {
        let mut trace = StackTrace::empty(size);
        trace.depth = platform::backtrace(&mut trace.stack);
        trace
    }

    /// Return addresses, innermost first.
    pub fn frames(&self) -> &[*mut c_void] {
        &self.stack[..self.depth]
    }
}

impl core::fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StackTrace")
            .field("size", &self.size)
            .field("frames", &self.frames())
            .finish()
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod platform {
    use core::ffi::{c_int, c_void};

    extern "C" {
        // glibc <execinfo.h>
        #[link_name = "backtrace"]
        fn glibc_backtrace(buffer: *mut *mut c_void, size: c_int) -> c_int;
    }

    pub fn backtrace(frames: &mut [*mut c_void]) -> usize {
        // SAFETY: `frames` is valid for `frames.len()` writes.
        let depth = unsafe { glibc_backtrace(frames.as_mut_ptr(), frames.len() as c_int) };
        depth.max(0) as usize
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
mod platform {
    use core::ffi::c_void;

    pub fn backtrace(_frames: &mut [*mut c_void]) -> usize {
        0
    }
}
