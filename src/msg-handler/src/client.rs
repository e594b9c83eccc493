//! Host side of the link.
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};

use npu_ipc::wire::{MessageType, MsgHeader, MSG_MAGIC};
use npu_ipc::{CallbackId, Mailbox, MailboxError, MessageQueue, QueueError};

use crate::notify::Notify;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Queue: {0}")]
    Queue(#[from] QueueError),
    #[error("Mailbox: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("Timed out waiting for a message")]
    Timeout,
    #[error("Invalid magic: 0x{0:x}")]
    InvalidMagic(u32),
    #[error("Unexpected message type: expected {expected}, got {got}")]
    UnexpectedType { expected: u32, got: u32 },
    #[error("Unexpected payload length: expected {expected}, got {got}")]
    UnexpectedLength { expected: usize, got: u32 },
}

/// Longest single sleep while waiting for the peer.
const POLL_SLICE: Duration = Duration::from_millis(5);

/// Writes requests into the NPU's input queue and reads responses from its
/// output queue.
pub struct MessageClient {
    input: MessageQueue,
    output: MessageQueue,
    mailbox: Arc<dyn Mailbox>,
    callback: CallbackId,
    wakeup: Notify,
    timeout: Duration,
}

impl Drop for MessageClient {
    fn drop(&mut self) {
        self.mailbox.deregister_callback(self.callback);
    }
}

impl MessageClient {
    pub fn new(
        input: MessageQueue,
        output: MessageQueue,
        mailbox: Arc<dyn Mailbox>,
        timeout: Duration,
    ) -> Self {
        let wakeup = Notify::new();
        let irq = wakeup.clone();
        let callback = mailbox.register_callback(Arc::new(move || irq.signal()));
        MessageClient {
            input,
            output,
            mailbox,
            callback,
            wakeup,
            timeout,
        }
    }

    pub fn send_input_message<T: AsBytes>(
        &mut self,
        ty: MessageType,
        payload: &T,
    ) -> Result<(), ClientError> {
        self.send_raw(ty.into(), payload.as_bytes())
    }

    pub fn send_empty(&mut self, ty: MessageType) -> Result<(), ClientError> {
        self.send_raw(ty.into(), &[])
    }

    /// Sends a frame with an arbitrary type value.
    pub fn send_raw(&mut self, ty: u32, payload: &[u8]) -> Result<(), ClientError> {
        self.input.write_raw(ty, payload)?;
        self.ring()
    }

    /// Sends unframed bytes.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.input.write(&[bytes])?;
        self.ring()
    }

    fn ring(&self) -> Result<(), ClientError> {
        self.mailbox.send_message()?;
        Ok(())
    }

    /// Bytes waiting in the output queue.
    pub fn pending(&self) -> usize {
        self.output.available()
    }

    fn wait_for_output(&self, len: usize) -> Result<(), ClientError> {
        let deadline = Instant::now() + self.timeout;
        while self.output.available() < len {
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout);
            }
            self.wakeup.wait_timeout((deadline - now).min(POLL_SLICE));
        }
        Ok(())
    }

    fn read_header(&mut self, expected: MessageType, len: usize) -> Result<(), ClientError> {
        self.wait_for_output(std::mem::size_of::<MsgHeader>())?;
        let msg: MsgHeader = self.output.read_as()?;
        if msg.magic != MSG_MAGIC {
            return Err(ClientError::InvalidMagic(msg.magic));
        }
        if msg.ty != expected as u32 {
            return Err(ClientError::UnexpectedType {
                expected: expected as u32,
                got: msg.ty,
            });
        }
        if msg.length as usize != len {
            return Err(ClientError::UnexpectedLength {
                expected: len,
                got: msg.length,
            });
        }
        self.wait_for_output(len)
    }

    /// Waits for the next message, which must be of type `expected` and
    /// carry a `T`.
    pub fn wait_and_read_output_message<T: FromBytes + AsBytes>(
        &mut self,
        expected: MessageType,
    ) -> Result<T, ClientError> {
        self.read_header(expected, std::mem::size_of::<T>())?;
        Ok(self.output.read_as()?)
    }

    /// Waits for a message of type `expected` without payload.
    pub fn wait_for_empty(&mut self, expected: MessageType) -> Result<(), ClientError> {
        self.read_header(expected, 0)
    }
}
