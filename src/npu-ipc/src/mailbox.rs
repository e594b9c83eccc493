//! Doorbell between the two sides of the link.
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("Mailbox peer is not connected.")]
    Disconnected,
    #[error("Mailbox hardware error: {0}.")]
    Hardware(String),
}

pub type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// A mailbox raises an interrupt on the peer and dispatches the interrupts
/// raised by the peer to registered callbacks.
///
/// Callbacks run in interrupt context. They must only signal and never block.
pub trait Mailbox: Send + Sync {
    /// Rings the peer's doorbell.
    fn send_message(&self) -> Result<(), MailboxError>;

    /// Interrupt entry point: invokes every registered callback.
    fn handle_message(&self);

    fn verify_hardware(&self) -> bool {
        true
    }

    fn register_callback(&self, callback: Callback) -> CallbackId;

    fn deregister_callback(&self, id: CallbackId);
}

/// Callback table shared by mailbox implementations.
#[derive(Default)]
pub struct Callbacks {
    next_id: AtomicU64,
    entries: Mutex<Vec<(CallbackId, Callback)>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: Callback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, callback));
        id
    }

    pub fn deregister(&self, id: CallbackId) {
        self.entries.lock().retain(|(cid, _)| *cid != id);
    }

    pub fn invoke(&self) {
        let callbacks: Vec<Callback> = self
            .entries
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// In-process mailbox. Ringing one end of a pair interrupts the other end.
pub struct LoopbackMailbox {
    local: Arc<Callbacks>,
    remote: Arc<Callbacks>,
    sent: AtomicUsize,
}

impl LoopbackMailbox {
    pub fn pair() -> (LoopbackMailbox, LoopbackMailbox) {
        let a = Arc::new(Callbacks::new());
        let b = Arc::new(Callbacks::new());
        (
            LoopbackMailbox {
                local: Arc::clone(&a),
                remote: Arc::clone(&b),
                sent: AtomicUsize::new(0),
            },
            LoopbackMailbox {
                local: b,
                remote: a,
                sent: AtomicUsize::new(0),
            },
        )
    }

    /// Number of doorbells this end has raised.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Mailbox for LoopbackMailbox {
    fn send_message(&self) -> Result<(), MailboxError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.remote.invoke();
        Ok(())
    }

    fn handle_message(&self) {
        self.local.invoke();
    }

    fn register_callback(&self, callback: Callback) -> CallbackId {
        self.local.register(callback)
    }

    fn deregister_callback(&self, id: CallbackId) {
        self.local.deregister(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_other_end() {
        let (host, npu) = LoopbackMailbox::pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = npu.register_callback(Arc::new(move || {
            h.fetch_add(1, Ordering::Relaxed);
        }));

        host.send_message().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(host.sent(), 1);
        assert_eq!(npu.sent(), 0);

        // ringing yourself does not reach your own callbacks
        npu.send_message().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        npu.handle_message();
        assert_eq!(hits.load(Ordering::Relaxed), 2);

        npu.deregister_callback(id);
        host.send_message().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
        assert!(npu.verify_hardware());
    }
}
