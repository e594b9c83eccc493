//! Cache maintenance for memory shared with a non-coherent peer.
use std::sync::atomic::{fence, Ordering};

/// Cache maintenance hooks used by [`MessageQueue`](crate::MessageQueue).
///
/// On a non-coherent link `invalidate` must discard stale lines covering the
/// range before it is read, and `clean` must write dirty lines back so the
/// peer can observe them. Implementations run on the protocol hot path and
/// must not block.
pub trait SharedMemoryBarrier: Send + Sync {
    fn invalidate(&self, addr: *const u8, len: usize);
    fn clean(&self, addr: *const u8, len: usize);
}

/// For cache-coherent targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBarrier;

impl SharedMemoryBarrier for NoopBarrier {
    #[inline]
    fn invalidate(&self, _addr: *const u8, _len: usize) {}

    #[inline]
    fn clean(&self, _addr: *const u8, _len: usize) {}
}

/// Orders plain memory accesses around the range with full fences.
#[derive(Debug, Default, Clone, Copy)]
pub struct FenceBarrier;

impl SharedMemoryBarrier for FenceBarrier {
    #[inline]
    fn invalidate(&self, _addr: *const u8, _len: usize) {
        fence(Ordering::Acquire);
    }

    #[inline]
    fn clean(&self, _addr: *const u8, _len: usize) {
        fence(Ordering::Release);
    }
}
