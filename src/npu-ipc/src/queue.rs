//! Single-producer/single-consumer byte ring over a [`QueueRegion`].
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::barrier::{NoopBarrier, SharedMemoryBarrier};
use crate::shm::{QueueRegion, HEADER_SIZE};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Requested {requested} bytes, only {available} available to read.")]
    Underflow { requested: usize, available: usize },
    #[error("Requested {requested} bytes, only {capacity} bytes free.")]
    Overflow { requested: usize, capacity: usize },
}

/// One side's view of a message queue.
///
/// The ring holds at most `size - 1` bytes; one byte stays free so that
/// `read == write` always means empty. Each side of the link owns its own
/// view: the consumer only calls [`read`](Self::read) and
/// [`reset`](Self::reset), the producer only calls [`write`](Self::write).
pub struct MessageQueue {
    region: QueueRegion,
    barrier: Arc<dyn SharedMemoryBarrier>,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("region", &self.region)
            .finish()
    }
}

impl MessageQueue {
    pub fn new(region: QueueRegion, barrier: Arc<dyn SharedMemoryBarrier>) -> Self {
        MessageQueue { region, barrier }
    }

    /// A view for cache-coherent memory.
    pub fn coherent(region: QueueRegion) -> Self {
        Self::new(region, Arc::new(NoopBarrier))
    }

    #[inline]
    pub fn region(&self) -> &QueueRegion {
        &self.region
    }

    /// Total size of the ring storage.
    #[inline]
    pub fn size(&self) -> usize {
        self.region.size()
    }

    #[inline]
    fn load_cursor(&self, cursor: &AtomicU32) -> usize {
        // A cursor is only ever stored reduced; the modulo keeps a corrupt
        // peer from steering copies outside the ring.
        cursor.load(Ordering::Acquire) as usize % self.size()
    }

    #[inline]
    fn cursors(&self) -> (usize, usize) {
        let header = self.region.header();
        (self.load_cursor(&header.read), self.load_cursor(&header.write))
    }

    #[inline]
    fn len_between(&self, read: usize, write: usize) -> usize {
        if write >= read {
            write - read
        } else {
            self.size() - read + write
        }
    }

    fn invalidate_header(&self) {
        self.barrier
            .invalidate(self.region.header_ptr(), HEADER_SIZE);
    }

    fn clean_header(&self) {
        self.barrier.clean(self.region.header_ptr(), HEADER_SIZE);
    }

    // Calls `f(offset, len)` for the at most two contiguous spans covering
    // `len` bytes starting at `start`.
    fn for_each_span<F: FnMut(usize, usize)>(&self, start: usize, len: usize, mut f: F) {
        let first = len.min(self.size() - start);
        if first > 0 {
            f(start, first);
        }
        if len > first {
            f(0, len - first);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.invalidate_header();
        let (read, write) = self.cursors();
        read == write
    }

    /// Bytes ready to be read.
    pub fn available(&self) -> usize {
        self.invalidate_header();
        let (read, write) = self.cursors();
        self.len_between(read, write)
    }

    /// Bytes that can be written without overtaking the reader.
    pub fn capacity(&self) -> usize {
        self.size() - self.available() - 1
    }

    /// Fills `dst` from the ring. Fails without side effects if fewer than
    /// `dst.len()` bytes are available.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<(), QueueError> {
        self.invalidate_header();
        let (read, write) = self.cursors();
        let available = self.len_between(read, write);
        if dst.len() > available {
            return Err(QueueError::Underflow {
                requested: dst.len(),
                available,
            });
        }

        let data = self.region.data_ptr();
        let mut copied = 0;
        self.for_each_span(read, dst.len(), |offset, len| {
            self.barrier.invalidate(unsafe { data.add(offset) }, len);
            // Safety: offset + len <= size, and copied + len <= dst.len().
            unsafe {
                ptr::copy_nonoverlapping(data.add(offset), dst.as_mut_ptr().add(copied), len);
            }
            copied += len;
        });

        let read = (read + dst.len()) % self.size();
        self.region
            .header()
            .read
            .store(read as u32, Ordering::Release);
        self.clean_header();
        Ok(())
    }

    /// Appends all `segments` as one unit. Either every byte is published or
    /// nothing is.
    pub fn write(&mut self, segments: &[&[u8]]) -> Result<(), QueueError> {
        let total: usize = segments.iter().map(|s| s.len()).sum();

        self.invalidate_header();
        let (read, write) = self.cursors();
        let capacity = self.size() - self.len_between(read, write) - 1;
        if total > capacity {
            return Err(QueueError::Overflow {
                requested: total,
                capacity,
            });
        }

        let data = self.region.data_ptr();
        let mut pos = write;
        for segment in segments {
            let mut copied = 0;
            self.for_each_span(pos, segment.len(), |offset, len| {
                // Safety: offset + len <= size, and copied + len <= segment.len().
                unsafe {
                    ptr::copy_nonoverlapping(segment.as_ptr().add(copied), data.add(offset), len);
                }
                copied += len;
            });
            pos = (pos + segment.len()) % self.size();
        }

        // Data must reach the peer before the cursor that covers it.
        self.for_each_span(write, total, |offset, len| {
            self.barrier.clean(unsafe { data.add(offset) }, len);
        });
        self.region
            .header()
            .write
            .store(pos as u32, Ordering::Release);
        self.clean_header();
        Ok(())
    }

    /// Drops every unread byte.
    pub fn reset(&mut self) {
        self.invalidate_header();
        let header = self.region.header();
        let write = self.load_cursor(&header.write);
        header.read.store(write as u32, Ordering::Release);
        self.clean_header();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use spin::Mutex;

    fn queue_pair(size: usize) -> (MessageQueue, MessageQueue) {
        let region = QueueRegion::anonymous(size).unwrap();
        (
            MessageQueue::coherent(region.clone()),
            MessageQueue::coherent(region),
        )
    }

    #[test]
    fn empty_queue() {
        let (tx, rx) = queue_pair(16);
        assert!(rx.is_empty());
        assert_eq!(rx.available(), 0);
        assert_eq!(tx.capacity(), 15);
    }

    #[test]
    fn round_trip() {
        let (mut tx, mut rx) = queue_pair(64);
        tx.write(&[b"hello", b" ", b"world"]).unwrap();
        assert_eq!(rx.available(), 11);

        let mut buf = [0u8; 11];
        rx.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
        assert!(rx.is_empty());
    }

    #[test]
    fn zero_length() {
        let (mut tx, mut rx) = queue_pair(8);
        tx.write(&[]).unwrap();
        tx.write(&[b""]).unwrap();
        rx.read(&mut []).unwrap();
        assert!(rx.is_empty());
    }

    #[test]
    fn wraps_at_end() {
        let (mut tx, mut rx) = queue_pair(10);
        let mut scratch = [0u8; 7];
        tx.write(&[&[0xaa; 7]]).unwrap();
        rx.read(&mut scratch).unwrap();

        // read = write = 7, the next 8 bytes straddle the end
        let payload: Vec<u8> = (1..=8).collect();
        tx.write(&[&payload[..3], &payload[3..]]).unwrap();
        assert_eq!(rx.available(), 8);
        assert_eq!(rx.region().header().write.load(Ordering::Relaxed), 5);

        let mut buf = [0u8; 8];
        rx.read(&mut buf).unwrap();
        assert_eq!(&buf[..], &payload[..]);
    }

    #[test]
    fn overflow_leaves_queue_untouched() {
        let (mut tx, rx) = queue_pair(8);
        tx.write(&[b"abcd"]).unwrap();
        assert_eq!(
            tx.write(&[b"abcd"]),
            Err(QueueError::Overflow {
                requested: 4,
                capacity: 3
            })
        );
        assert_eq!(rx.available(), 4);
        tx.write(&[b"xyz"]).unwrap();
        assert_eq!(tx.capacity(), 0);
    }

    #[test]
    fn underflow_leaves_queue_untouched() {
        let (mut tx, mut rx) = queue_pair(8);
        tx.write(&[b"ab"]).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(
            rx.read(&mut buf),
            Err(QueueError::Underflow {
                requested: 3,
                available: 2
            })
        );
        assert_eq!(rx.available(), 2);
    }

    #[test]
    fn fullness_invariant() {
        let (mut tx, mut rx) = queue_pair(13);
        let mut buf = [0u8; 13];
        for step in 0..50usize {
            let n = (step * 7) % 6;
            if tx.capacity() >= n {
                tx.write(&[&buf[..n]]).unwrap();
            }
            assert_eq!(rx.available() + rx.capacity(), rx.size() - 1);
            let m = (step * 5) % 4;
            if rx.available() >= m {
                rx.read(&mut buf[..m]).unwrap();
            }
            assert_eq!(rx.available() + rx.capacity(), rx.size() - 1);
        }
    }

    #[test]
    fn reset_drops_unread() {
        let (mut tx, mut rx) = queue_pair(32);
        rx.reset();
        assert_eq!(rx.available(), 0);

        tx.write(&[b"garbage"]).unwrap();
        rx.reset();
        assert_eq!(rx.available(), 0);
        rx.reset();
        assert_eq!(rx.available(), 0);

        tx.write(&[b"ok"]).unwrap();
        let mut buf = [0u8; 2];
        rx.read(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn corrupt_cursor_stays_in_bounds() {
        let (_tx, rx) = queue_pair(16);
        rx.region().header().write.store(16 + 3, Ordering::Release);
        assert_eq!(rx.available(), 3);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Invalidate,
        Clean { write_cursor: u32, header: bool },
    }

    struct RecordingBarrier {
        region: QueueRegion,
        ops: Mutex<Vec<Op>>,
    }

    impl SharedMemoryBarrier for RecordingBarrier {
        fn invalidate(&self, _addr: *const u8, _len: usize) {
            self.ops.lock().push(Op::Invalidate);
        }

        fn clean(&self, addr: *const u8, _len: usize) {
            self.ops.lock().push(Op::Clean {
                write_cursor: self.region.header().write.load(Ordering::Relaxed),
                header: addr == self.region.header_ptr(),
            });
        }
    }

    #[test]
    fn data_cleaned_before_cursor_published() {
        let region = QueueRegion::anonymous(16).unwrap();
        let barrier = Arc::new(RecordingBarrier {
            region: region.clone(),
            ops: Mutex::new(Vec::new()),
        });
        let mut tx = MessageQueue::new(region, barrier.clone());
        tx.write(&[b"abc"]).unwrap();

        let ops = barrier.ops.lock().clone();
        assert_eq!(ops[0], Op::Invalidate);
        assert_eq!(
            ops[1],
            Op::Clean {
                write_cursor: 0,
                header: false
            }
        );
        assert_eq!(
            ops[2],
            Op::Clean {
                write_cursor: 3,
                header: true
            }
        );
    }
}
