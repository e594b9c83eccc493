//! Message framing on top of [`MessageQueue`].
use zerocopy::{AsBytes, FromBytes};

use crate::queue::{MessageQueue, QueueError};
use crate::wire::{MessageType, MsgHeader};

impl MessageQueue {
    /// Writes a framed message. Header and payload are published together.
    pub fn write_msg<T: AsBytes>(&mut self, ty: MessageType, payload: &T) -> Result<(), QueueError> {
        self.write_raw(ty.into(), payload.as_bytes())
    }

    /// Writes a message without a payload.
    pub fn write_empty(&mut self, ty: MessageType) -> Result<(), QueueError> {
        self.write_raw(ty.into(), &[])
    }

    /// Writes a frame with an arbitrary type value.
    pub fn write_raw(&mut self, ty: u32, payload: &[u8]) -> Result<(), QueueError> {
        let header = MsgHeader::new(ty, payload.len());
        self.write(&[header.as_bytes(), payload])
    }

    /// Reads exactly `size_of::<T>()` bytes.
    pub fn read_as<T: FromBytes + AsBytes>(&mut self) -> Result<T, QueueError> {
        let mut value = T::new_zeroed();
        self.read(value.as_bytes_mut())?;
        Ok(value)
    }
}
