//! Sync fence lifecycle management
//!
//! Fences are opaque fd-like synchronization handles passed in by the
//! upstream display stack (acquire fences) or produced by the hardware
//! present path (release/retire fences). Each fence is owned by exactly
//! one holder and must be closed exactly once on every exit path.
//!
//! The signal/wait side of a fence lives outside this crate; here a fence
//! is purely an owned resource with close semantics.

use std::fmt;
use std::sync::Arc;

use log::warn;

/// Raw fence file descriptor as exchanged with the upstream protocol.
pub type RawFenceFd = i32;

/// Sentinel meaning "no fence attached".
pub const INVALID_FENCE_FD: RawFenceFd = -1;

/// Closer callback invoked exactly once when an owned fence is released.
///
/// Tests inject counting closers here; production fences fall back to
/// `close(2)`.
pub type FenceCloser = Arc<dyn Fn(RawFenceFd) + Send + Sync>;

/// An owned sync fence handle.
///
/// Moving a `Fence` transfers ownership of the underlying fd. Dropping a
/// still-open fence closes it, so a fence can never leak across a frame
/// boundary even on early-return paths.
pub struct Fence {
    fd: RawFenceFd,
    closer: Option<FenceCloser>,
}

impl Fence {
    /// A fence representing "no fence"; closing it is a no-op.
    pub fn invalid() -> Self {
        Self {
            fd: INVALID_FENCE_FD,
            closer: None,
        }
    }

    /// Take ownership of a raw fd, to be closed with `close(2)`.
    pub fn from_raw(fd: RawFenceFd) -> Self {
        Self { fd, closer: None }
    }

    /// Take ownership of a raw fd with an injected closer.
    ///
    /// Used by tests to count close calls against sentinel fd values.
    pub fn with_closer(fd: RawFenceFd, closer: FenceCloser) -> Self {
        Self {
            fd,
            closer: Some(closer),
        }
    }

    /// Whether a real fence is attached.
    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    /// The raw fd, for handing to the upstream protocol. Ownership is
    /// not transferred.
    pub fn raw(&self) -> RawFenceFd {
        self.fd
    }

    /// Move the fence out, leaving an invalid fence behind.
    pub fn take(&mut self) -> Fence {
        std::mem::replace(self, Fence::invalid())
    }

    /// Close the fence now. Safe to call on an already-closed or invalid
    /// fence; the underlying fd is closed at most once.
    pub fn close(&mut self) {
        if self.fd < 0 {
            return;
        }
        let fd = self.fd;
        self.fd = INVALID_FENCE_FD;
        match self.closer.take() {
            Some(closer) => closer(fd),
            None => {
                // SAFETY: fd was exclusively owned by this fence and is
                // closed exactly once here.
                let ret = unsafe { libc::close(fd) };
                if ret != 0 {
                    warn!("fence fd {} close failed (errno {})", fd, unsafe {
                        *libc::__errno_location()
                    });
                }
            }
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.close();
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence").field("fd", &self.fd).finish()
    }
}
