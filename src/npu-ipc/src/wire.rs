//! Wire layout of the messages exchanged with the host.
//!
//! Every struct here is `repr(C)` with no implicit padding and is copied
//! byte-for-byte into and out of the queues.
use std::borrow::Cow;
use std::fmt;

use zerocopy::{AsBytes, FromBytes};

pub const MSG_MAGIC: u32 = 0x4145_7631;

pub const MSG_VERSION_MAJOR: u8 = 0;
pub const MSG_VERSION_MINOR: u8 = 2;
pub const MSG_VERSION_PATCH: u8 = 0;

/// Maximum number of input or output buffers of one inference.
pub const BUFFER_MAX: usize = 16;
/// Number of PMU event counters.
pub const PMU_MAX: usize = 8;

pub const ERROR_MSG_LEN: usize = 128;
pub const NETWORK_DESC_LEN: usize = 32;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Err = 1,
    Ping = 2,
    Pong = 3,
    InferenceReq = 4,
    InferenceRsp = 5,
    VersionReq = 6,
    VersionRsp = 7,
    CapabilitiesReq = 8,
    CapabilitiesRsp = 9,
    NetworkInfoReq = 10,
    NetworkInfoRsp = 11,
    CancelInferenceReq = 12,
    CancelInferenceRsp = 13,
}

impl TryFrom<u32> for MessageType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use MessageType::*;
        Ok(match value {
            1 => Err,
            2 => Ping,
            3 => Pong,
            4 => InferenceReq,
            5 => InferenceRsp,
            6 => VersionReq,
            7 => VersionRsp,
            8 => CapabilitiesReq,
            9 => CapabilitiesRsp,
            10 => NetworkInfoReq,
            11 => NetworkInfoRsp,
            12 => CancelInferenceReq,
            13 => CancelInferenceRsp,
            other => return std::result::Result::Err(other),
        })
    }
}

impl From<MessageType> for u32 {
    #[inline]
    fn from(ty: MessageType) -> u32 {
        ty as u32
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 0,
    Error = 1,
    Running = 2,
    Rejected = 3,
    Aborted = 4,
    Aborting = 5,
}

impl TryFrom<u32> for Status {
    type Error = u32;

    // `Self::Error` would name the variant.
    fn try_from(value: u32) -> Result<Self, u32> {
        Ok(match value {
            0 => Status::Ok,
            1 => Status::Error,
            2 => Status::Running,
            3 => Status::Rejected,
            4 => Status::Aborted,
            5 => Status::Aborting,
            other => return Err(other),
        })
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Generic = 0,
    UnsupportedType = 1,
    InvalidPayload = 2,
    InvalidSize = 3,
    InvalidMagic = 4,
}

impl TryFrom<u32> for ErrorKind {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ErrorKind::Generic,
            1 => ErrorKind::UnsupportedType,
            2 => ErrorKind::InvalidPayload,
            3 => ErrorKind::InvalidSize,
            4 => ErrorKind::InvalidMagic,
            other => return Err(other),
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct MsgHeader {
    pub magic: u32,
    pub ty: u32,
    pub length: u32,
}

impl MsgHeader {
    pub fn new(ty: u32, length: usize) -> Self {
        MsgHeader {
            magic: MSG_MAGIC,
            ty,
            length: length as u32,
        }
    }
}

/// A buffer in the address space shared with the host.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct BufferDesc {
    pub ptr: u32,
    pub size: u32,
}

pub const NETWORK_TYPE_BUFFER: u32 = 1;
pub const NETWORK_TYPE_INDEX: u32 = 2;

/// Network reference as laid out on the wire. `ptr_or_index` holds the
/// buffer address or the model index, depending on `kind`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct NetworkBuffer {
    pub kind: u32,
    pub ptr_or_index: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRef {
    Buffer(BufferDesc),
    Index(u32),
}

impl TryFrom<NetworkBuffer> for NetworkRef {
    /// The unrecognized network type.
    type Error = u32;

    fn try_from(net: NetworkBuffer) -> Result<Self, Self::Error> {
        match net.kind {
            NETWORK_TYPE_BUFFER => Ok(NetworkRef::Buffer(BufferDesc {
                ptr: net.ptr_or_index,
                size: net.size,
            })),
            NETWORK_TYPE_INDEX => Ok(NetworkRef::Index(net.ptr_or_index)),
            other => Err(other),
        }
    }
}

impl From<NetworkRef> for NetworkBuffer {
    fn from(net: NetworkRef) -> Self {
        match net {
            NetworkRef::Buffer(buf) => NetworkBuffer {
                kind: NETWORK_TYPE_BUFFER,
                ptr_or_index: buf.ptr,
                size: buf.size,
            },
            NetworkRef::Index(index) => NetworkBuffer {
                kind: NETWORK_TYPE_INDEX,
                ptr_or_index: index,
                size: 0,
            },
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct InferenceReq {
    pub user_arg: u64,
    pub ifm_count: u32,
    pub ifm: [BufferDesc; BUFFER_MAX],
    pub ofm_count: u32,
    pub ofm: [BufferDesc; BUFFER_MAX],
    pub network: NetworkBuffer,
    pub pmu_event_config: [u8; PMU_MAX],
    pub pmu_cycle_counter_enable: u32,
}

impl InferenceReq {
    /// Input buffers, or `None` if the count exceeds [`BUFFER_MAX`].
    pub fn inputs(&self) -> Option<&[BufferDesc]> {
        self.ifm.get(..self.ifm_count as usize)
    }

    /// Output buffers, or `None` if the count exceeds [`BUFFER_MAX`].
    pub fn outputs(&self) -> Option<&[BufferDesc]> {
        self.ofm.get(..self.ofm_count as usize)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct InferenceRsp {
    pub user_arg: u64,
    pub ofm_count: u32,
    pub ofm_size: [u32; BUFFER_MAX],
    pub status: u32,
    pub pmu_event_config: [u8; PMU_MAX],
    pub pmu_event_count: [u32; PMU_MAX],
    pub pmu_cycle_counter_enable: u32,
    pub _reserved: u32,
    pub pmu_cycle_counter_count: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct NetworkInfoReq {
    pub user_arg: u64,
    pub network: NetworkBuffer,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct NetworkInfoRsp {
    pub user_arg: u64,
    pub desc: [u8; NETWORK_DESC_LEN],
    pub ifm_count: u32,
    pub ifm_size: [u32; BUFFER_MAX],
    pub ofm_count: u32,
    pub ofm_size: [u32; BUFFER_MAX],
    pub status: u32,
    pub _reserved: u32,
}

impl NetworkInfoRsp {
    pub fn description(&self) -> Cow<'_, str> {
        c_str(&self.desc)
    }

    /// Stores `desc`, truncated so that a terminating NUL always fits.
    pub fn set_description(&mut self, desc: &str) {
        self.desc = [0; NETWORK_DESC_LEN];
        let n = desc.len().min(NETWORK_DESC_LEN - 1);
        self.desc[..n].copy_from_slice(&desc.as_bytes()[..n]);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct VersionRsp {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub _reserved: u8,
}

impl VersionRsp {
    pub const CURRENT: VersionRsp = VersionRsp {
        major: MSG_VERSION_MAJOR,
        minor: MSG_VERSION_MINOR,
        patch: MSG_VERSION_PATCH,
        _reserved: 0,
    };
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct CapabilitiesReq {
    pub user_arg: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct CapabilitiesRsp {
    pub user_arg: u64,
    pub version_status: u32,
    pub version_minor: u32,
    pub version_major: u32,
    pub product_major: u32,
    pub arch_patch_rev: u32,
    pub arch_minor_rev: u32,
    pub arch_major_rev: u32,
    pub driver_patch_rev: u32,
    pub driver_minor_rev: u32,
    pub driver_major_rev: u32,
    pub macs_per_cc: u32,
    pub cmd_stream_version: u32,
    pub custom_dma: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct CancelInferenceReq {
    pub user_arg: u64,
    pub inference_handle: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
pub struct CancelInferenceRsp {
    pub user_arg: u64,
    pub status: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, AsBytes)]
pub struct ErrorMsg {
    pub ty: u32,
    pub msg: [u8; ERROR_MSG_LEN],
}

impl ErrorMsg {
    pub fn new(kind: ErrorKind, text: &str) -> Self {
        let mut err = ErrorMsg {
            ty: kind as u32,
            msg: [0; ERROR_MSG_LEN],
        };
        let n = text.len().min(ERROR_MSG_LEN - 1);
        err.msg[..n].copy_from_slice(&text.as_bytes()[..n]);
        err
    }

    pub fn text(&self) -> Cow<'_, str> {
        c_str(&self.msg)
    }
}

impl fmt::Debug for ErrorMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMsg")
            .field("ty", &self.ty)
            .field("msg", &self.text())
            .finish()
    }
}

fn c_str(bytes: &[u8]) -> Cow<'_, str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
}

mod sa {
    use super::*;
    use static_assertions::const_assert_eq;
    use std::mem::size_of;

    const_assert_eq!(size_of::<MsgHeader>(), 12);
    const_assert_eq!(size_of::<NetworkBuffer>(), 12);
    const_assert_eq!(size_of::<InferenceReq>(), 296);
    const_assert_eq!(size_of::<InferenceRsp>(), 136);
    const_assert_eq!(size_of::<NetworkInfoReq>(), 24);
    const_assert_eq!(size_of::<NetworkInfoRsp>(), 184);
    const_assert_eq!(size_of::<VersionRsp>(), 4);
    const_assert_eq!(size_of::<CapabilitiesReq>(), 8);
    const_assert_eq!(size_of::<CapabilitiesRsp>(), 64);
    const_assert_eq!(size_of::<CancelInferenceReq>(), 16);
    const_assert_eq!(size_of::<CancelInferenceRsp>(), 16);
    const_assert_eq!(size_of::<ErrorMsg>(), 132);
}
