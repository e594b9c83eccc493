//! Shared memory backing a message queue.
//!
//! A region is laid out as a [`QueueHeader`] immediately followed by the
//! byte ring. Both sides of the link map the same region; the producer owns
//! the `write` cursor, the consumer owns `read`.
use std::fs::File;
use std::io;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use memfd::{Memfd, MemfdOptions};
use memmap2::{MmapMut, MmapOptions, MmapRaw};
use thiserror::Error;
use uuid::Uuid;

/// Control block at the start of every queue region.
///
/// `read` and `write` live on separate 32-byte cache lines so that cache
/// maintenance by one side never clobbers the cursor owned by the other.
#[repr(C)]
#[derive(Debug)]
pub struct QueueHeader {
    pub size: AtomicU32,
    pub read: AtomicU32,
    _pad: [u32; 6],
    pub write: AtomicU32,
}

pub const HEADER_SIZE: usize = size_of::<QueueHeader>();

mod sa {
    use super::*;
    use static_assertions::const_assert_eq;

    const_assert_eq!(HEADER_SIZE, 36);
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_to_page_size(bytes: usize) -> usize {
    let ps = page_size();
    (bytes + ps - 1) / ps * ps
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Memfd: {0}.")]
    Memfd(#[from] memfd::Error),
    #[error("IO: {0}.")]
    Io(#[from] io::Error),
    #[error("Invalid queue size: {0}.")]
    InvalidSize(usize),
    #[error("Buffer too small.")]
    BufTooSmall,
}

enum Mapping {
    Anon(#[allow(dead_code)] MmapMut),
    Memfd {
        #[allow(dead_code)]
        mmap: MmapRaw,
        memfd: Memfd,
    },
}

struct Inner {
    base: NonNull<u8>,
    // Data size fixed when the region was created or attached.
    size: usize,
    mapping: Mapping,
}

// Safety: all shared state is reached through atomics in the header or
// through the single-producer/single-consumer discipline of the ring.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    fn check_size(size: usize) -> Result<(), Error> {
        if size < 2 || size > u32::MAX as usize {
            return Err(Error::InvalidSize(size));
        }
        Ok(())
    }

    fn anonymous(size: usize) -> Result<Self, Error> {
        Self::check_size(size)?;
        let nbytes = round_to_page_size(HEADER_SIZE + size);
        let mut mmap = MmapOptions::new().len(nbytes).map_anon()?;
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(Error::BufTooSmall)?;
        Ok(Inner {
            base,
            size,
            mapping: Mapping::Anon(mmap),
        })
    }

    fn memfd(size: usize) -> Result<Self, Error> {
        Self::check_size(size)?;
        let nbytes = round_to_page_size(HEADER_SIZE + size);
        let opts = MemfdOptions::default()
            .allow_sealing(true)
            .close_on_exec(false);
        let name = format!("npu-queue-{}", Uuid::new_v4());
        let memfd = opts.create(name)?;
        memfd.as_file().set_len(nbytes as u64)?;

        let mmap = MmapOptions::new().map_raw(memfd.as_file())?;
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(Error::BufTooSmall)?;
        Ok(Inner {
            base,
            size,
            mapping: Mapping::Memfd { mmap, memfd },
        })
    }

    fn open(file: File) -> Result<Self, Error> {
        let memfd = Memfd::try_from_file(file).map_err(|_| io::Error::last_os_error())?;
        let mmap = MmapOptions::new().map_raw(memfd.as_file())?;
        if mmap.len() < HEADER_SIZE {
            return Err(Error::BufTooSmall);
        }
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(Error::BufTooSmall)?;
        let header = unsafe { &*base.as_ptr().cast::<QueueHeader>() };
        let size = header.size.load(Ordering::Acquire) as usize;
        Self::check_size(size)?;
        if mmap.len() < HEADER_SIZE + size {
            return Err(Error::BufTooSmall);
        }
        Ok(Inner {
            base,
            size,
            mapping: Mapping::Memfd { mmap, memfd },
        })
    }

    fn header(&self) -> &QueueHeader {
        // Safety: the mapping is page aligned and at least HEADER_SIZE bytes.
        unsafe { &*self.base.as_ptr().cast::<QueueHeader>() }
    }

    fn init_header(&self) {
        let header = self.header();
        header.size.store(self.size as u32, Ordering::Relaxed);
        header.read.store(0, Ordering::Relaxed);
        header.write.store(0, Ordering::Release);
    }
}

/// A mapped queue region. Cloning shares the mapping.
#[derive(Clone)]
pub struct QueueRegion {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for QueueRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegion")
            .field("base", &self.inner.base)
            .field("size", &self.inner.size)
            .finish()
    }
}

impl QueueRegion {
    /// Creates a process-private region with `size` bytes of ring storage.
    pub fn anonymous(size: usize) -> Result<Self, Error> {
        let inner = Inner::anonymous(size)?;
        inner.init_header();
        Ok(QueueRegion {
            inner: Arc::new(inner),
        })
    }

    /// Creates a memfd-backed region that can be handed to another process.
    pub fn memfd(size: usize) -> Result<Self, Error> {
        let inner = Inner::memfd(size)?;
        inner.init_header();
        Ok(QueueRegion {
            inner: Arc::new(inner),
        })
    }

    /// Attaches to a region created by the peer. The header is left untouched.
    pub fn open(file: File) -> Result<Self, Error> {
        let inner = Inner::open(file)?;
        Ok(QueueRegion {
            inner: Arc::new(inner),
        })
    }

    /// The memfd behind this region, if any.
    pub fn memfd_handle(&self) -> Option<&Memfd> {
        match &self.inner.mapping {
            Mapping::Memfd { memfd, .. } => Some(memfd),
            Mapping::Anon(_) => None,
        }
    }

    #[inline]
    pub fn header(&self) -> &QueueHeader {
        self.inner.header()
    }

    /// Size of the ring storage in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    #[inline]
    pub(crate) fn header_ptr(&self) -> *const u8 {
        self.inner.base.as_ptr()
    }

    #[inline]
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        // Safety: the mapping spans HEADER_SIZE + size bytes.
        unsafe { self.inner.base.as_ptr().add(HEADER_SIZE) }
    }
}
