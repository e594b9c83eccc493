use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

/// Binary wake-up signal for the message task.
///
/// Signals given while nobody waits collapse into one. `signal` never
/// blocks, so it may be called from a mailbox callback.
#[derive(Debug, Clone)]
pub struct Notify {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for Notify {
    fn default() -> Self {
        Self::new()
    }
}

impl Notify {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(1);
        Notify { tx, rx }
    }

    #[inline]
    pub fn signal(&self) {
        let _ = self.tx.try_send(());
    }

    pub fn wait(&self) {
        // cannot disconnect, `self` holds a sender
        let _ = self.rx.recv();
    }

    /// Returns whether a signal was consumed before `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}
