//! Shared-memory message transport between an application core and the
//! core driving the NPU.
//!
//! Each direction of the link is a [`MessageQueue`] over a [`QueueRegion`],
//! carrying frames laid out in [`wire`]. A [`Mailbox`] tells the peer that
//! a queue has new data.
pub mod barrier;
mod codec;
pub mod mailbox;
pub mod queue;
pub mod shm;
pub mod wire;

pub use barrier::{FenceBarrier, NoopBarrier, SharedMemoryBarrier};
pub use mailbox::{Callback, CallbackId, Callbacks, LoopbackMailbox, Mailbox, MailboxError};
pub use queue::{MessageQueue, QueueError};
pub use shm::QueueRegion;
