//! Error kinds of the engine and the fatal invariant-violation path.

use core::fmt;

/// Why a tier could not hand out memory.
///
/// Both variants surface to clients as a null pointer. They are kept apart
/// so that the page map running out of room can be diagnosed separately
/// from plain OS exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    /// The page source (or a tier below the caller) has nothing left.
    OutOfMemory,
    /// The page map could not grow to cover a new address range.
    CapacityExhausted,
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageError::OutOfMemory => f.write_str("out of memory"),
            PageError::CapacityExhausted => f.write_str("page map capacity exhausted"),
        }
    }
}

/// Reports a corrupted heap and aborts.
///
/// Writes straight to file descriptor 2; formatting machinery and logging
/// subscribers may allocate, and the heap is not trustworthy anymore.
#[cold]
#[inline(never)]
pub fn fatal(msg: &str) -> ! {
    const PREFIX: &[u8] = b"rusty_tcmalloc: invariant violation: ";
    unsafe {
        libc::write(2, PREFIX.as_ptr().cast(), PREFIX.len());
        libc::write(2, msg.as_ptr().cast(), msg.len());
        libc::write(2, b"\n".as_ptr().cast(), 1);
    }
    std::process::abort()
}

/// Aborts with `msg` unless `cond` holds. Checked in release builds too.
macro_rules! check {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            $crate::error::fatal($msg);
        }
    };
}

pub(crate) use check;
