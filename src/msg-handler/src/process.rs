//! Interfaces to the inference runtime and the model parser.
use std::sync::Arc;

use thiserror::Error;

use npu_ipc::wire::{BufferDesc, CapabilitiesRsp, PMU_MAX};

/// A buffer in the address space shared with the host. Never dereferenced
/// by the message handler itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataPtr {
    pub addr: u32,
    pub size: u32,
}

impl From<BufferDesc> for DataPtr {
    fn from(buf: BufferDesc) -> Self {
        DataPtr {
            addr: buf.ptr,
            size: buf.size,
        }
    }
}

/// A resolved network model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Model {
    /// An image registered on this side, addressed by index.
    Registered { index: u32, data: Arc<[u8]> },
    /// An image placed in shared memory by the host.
    Shared(DataPtr),
}

impl Model {
    pub fn size(&self) -> usize {
        match self {
            Model::Registered { data, .. } => data.len(),
            Model::Shared(ptr) => ptr.size as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmuConfig {
    pub event_config: [u8; PMU_MAX],
    pub cycle_counter_enable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmuCounters {
    pub event_count: [u32; PMU_MAX],
    pub cycle_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceJob {
    pub name: String,
    pub network: Model,
    pub input: Vec<DataPtr>,
    /// The runner may shrink each entry to the bytes actually produced.
    pub output: Vec<DataPtr>,
    pub pmu: PmuConfig,
    pub counters: PmuCounters,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Invalid model: {0}")]
    InvalidModel(String),
    #[error("Inference failed: {0}")]
    Failed(String),
}

/// Executes inference jobs on the accelerator, one at a time.
pub trait InferenceRunner: Send {
    fn run_job(&mut self, job: &mut InferenceJob) -> Result<(), InferenceError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelInfo {
    pub description: String,
    pub input_sizes: Vec<u32>,
    pub output_sizes: Vec<u32>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Model is not a valid network: {0}")]
    Invalid(String),
    #[error("Model has {count} {kind} tensors, at most {max} are supported")]
    TooManyTensors {
        kind: &'static str,
        count: usize,
        max: usize,
    },
}

/// Extracts the tensor layout of a model.
pub trait ModelParser: Send + Sync {
    fn parse_model(&self, model: &Model) -> Result<ModelInfo, ParseError>;
}

/// Source of the capabilities reported to the host.
pub trait DriverInfo {
    fn capabilities(&self) -> CapabilitiesRsp;
}

/// For builds without an NPU driver: every capability reads as zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDriver;

impl DriverInfo for NoDriver {
    fn capabilities(&self) -> CapabilitiesRsp {
        CapabilitiesRsp::default()
    }
}

impl DriverInfo for CapabilitiesRsp {
    fn capabilities(&self) -> CapabilitiesRsp {
        *self
    }
}
