#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use npu_ipc::wire::{BufferDesc, CapabilitiesRsp, InferenceReq, NetworkRef};
use npu_ipc::{LoopbackMailbox, MessageQueue, QueueRegion};

use msg_handler::config::InferenceConfig;
use msg_handler::process::{
    DataPtr, InferenceError, InferenceJob, InferenceRunner, Model, ModelInfo, ModelParser,
    ParseError,
};
use msg_handler::{IncomingMessageHandler, IndexedNetworks, MessageClient, Networks, TaskParams};

pub const TIMEOUT: Duration = Duration::from_secs(2);

pub fn driver_capabilities() -> CapabilitiesRsp {
    CapabilitiesRsp {
        version_major: 1,
        product_major: 6,
        arch_major_rev: 1,
        driver_major_rev: 0,
        driver_minor_rev: 16,
        macs_per_cc: 8,
        cmd_stream_version: 1,
        ..Default::default()
    }
}

/// Model images carry their layout: byte 0 is the input count, byte 1 the
/// output count. An empty image does not parse.
pub struct ByteParser;

impl ModelParser for ByteParser {
    fn parse_model(&self, model: &Model) -> Result<ModelInfo, ParseError> {
        let data = match model {
            Model::Registered { data, .. } => data,
            Model::Shared(ptr) => {
                return Ok(ModelInfo {
                    description: format!("shared@0x{:x}", ptr.addr),
                    input_sizes: vec![ptr.size],
                    output_sizes: vec![ptr.size],
                })
            }
        };
        if data.len() < 2 {
            return Err(ParseError::Invalid("empty image".to_owned()));
        }
        Ok(ModelInfo {
            description: "Vela Optimised".to_owned(),
            input_sizes: (0..data[0] as u32).map(|i| 1024 + i).collect(),
            output_sizes: (0..data[1] as u32).map(|i| 16 + i).collect(),
        })
    }
}

/// Index 0: one input, two outputs. Index 1: unparsable. Index 2: too many
/// inputs.
pub fn test_networks() -> Arc<dyn Networks> {
    let mut networks = IndexedNetworks::new();
    networks.register(vec![1u8, 2]);
    networks.register(Vec::<u8>::new());
    networks.register(vec![17u8, 1]);
    Arc::new(networks)
}

/// Halves every output buffer and reports fixed PMU counts. Fails any job
/// whose first input is 0xdead bytes long.
pub struct HalvingRunner;

impl InferenceRunner for HalvingRunner {
    fn run_job(&mut self, job: &mut InferenceJob) -> Result<(), InferenceError> {
        if job.input.first().map(|p| p.size) == Some(0xdead) {
            return Err(InferenceError::Failed("bad input".to_owned()));
        }
        for out in job.output.iter_mut() {
            *out = DataPtr {
                addr: out.addr,
                size: out.size / 2,
            };
        }
        for (i, count) in job.counters.event_count.iter_mut().enumerate() {
            *count = job.pmu.event_config[i] as u32 * 10;
        }
        job.counters.cycle_count = 123_456;
        Ok(())
    }
}

pub fn inference_req(user_arg: u64) -> InferenceReq {
    let mut req = InferenceReq {
        user_arg,
        ifm_count: 1,
        ofm_count: 2,
        network: NetworkRef::Index(0).into(),
        pmu_event_config: [1, 2, 3, 4, 0, 0, 0, 0],
        pmu_cycle_counter_enable: 1,
        ..Default::default()
    };
    req.ifm[0] = BufferDesc {
        ptr: 0x6000_0000,
        size: 1024,
    };
    req.ofm[0] = BufferDesc {
        ptr: 0x6001_0000,
        size: 100,
    };
    req.ofm[1] = BufferDesc {
        ptr: 0x6002_0000,
        size: 32,
    };
    req
}

pub struct Link {
    pub client: MessageClient,
    pub input: MessageQueue,
    pub output: MessageQueue,
    pub host_mailbox: Arc<LoopbackMailbox>,
    pub npu_mailbox: Arc<LoopbackMailbox>,
}

/// Two queues and a mailbox pair. `input`/`output` are the NPU's views.
pub fn link(input_size: usize, output_size: usize) -> Link {
    let input_region = QueueRegion::anonymous(input_size).unwrap();
    let output_region = QueueRegion::anonymous(output_size).unwrap();
    let (host, npu) = LoopbackMailbox::pair();
    let host_mailbox = Arc::new(host);
    let npu_mailbox = Arc::new(npu);

    let client = MessageClient::new(
        MessageQueue::coherent(input_region.clone()),
        MessageQueue::coherent(output_region.clone()),
        host_mailbox.clone(),
        TIMEOUT,
    );
    Link {
        client,
        input: MessageQueue::coherent(input_region),
        output: MessageQueue::coherent(output_region),
        host_mailbox,
        npu_mailbox,
    }
}

pub struct Fixture {
    pub handler: IncomingMessageHandler,
    pub client: MessageClient,
    pub params: TaskParams,
    pub npu_mailbox: Arc<LoopbackMailbox>,
}

pub fn fixture() -> Fixture {
    fixture_with_output(1000)
}

pub fn fixture_with_output(output_size: usize) -> Fixture {
    let link = link(4096, output_size);
    let params = TaskParams::new(&InferenceConfig::default(), test_networks());
    let handler = IncomingMessageHandler::new(
        link.input,
        link.output,
        link.npu_mailbox.clone(),
        &params,
        Arc::new(ByteParser),
        &driver_capabilities(),
    );
    Fixture {
        handler,
        client: link.client,
        params,
        npu_mailbox: link.npu_mailbox,
    }
}
