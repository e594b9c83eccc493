use std::mem::size_of;
use std::time::Duration;

use anyhow::{anyhow, ensure, Result};

use npu_ipc::wire::{
    BufferDesc, CancelInferenceReq, CancelInferenceRsp, CapabilitiesReq, CapabilitiesRsp,
    InferenceReq, InferenceRsp, MessageType, NetworkInfoReq, NetworkInfoRsp, NetworkRef, Status,
    MsgHeader, VersionRsp, BUFFER_MAX,
};
use msg_handler::config::NetworkEntry;
use msg_handler::{Config, MessageClient};

use crate::loopback::Hold;

// Host addresses handed to the NPU; the loopback runner never touches them.
const IFM_BASE: u32 = 0x6000_0000;
const OFM_BASE: u32 = 0x6100_0000;

fn check_network_info(client: &mut MessageClient, index: u32, entry: &NetworkEntry) -> Result<()> {
    let req = NetworkInfoReq {
        user_arg: index as u64,
        network: NetworkRef::Index(index).into(),
        _reserved: 0,
    };
    client.send_input_message(MessageType::NetworkInfoReq, &req)?;
    let rsp: NetworkInfoRsp = client.wait_and_read_output_message(MessageType::NetworkInfoRsp)?;

    ensure!(rsp.user_arg == index as u64, "network info user_arg mismatch");
    ensure!(
        rsp.status == Status::Ok as u32,
        "network info for model {} failed, status={}",
        index,
        rsp.status
    );
    ensure!(
        rsp.ifm_size.get(..rsp.ifm_count as usize) == Some(&entry.input_sizes[..]),
        "network info input sizes differ for model {}",
        index
    );
    ensure!(
        rsp.ofm_size.get(..rsp.ofm_count as usize) == Some(&entry.output_sizes[..]),
        "network info output sizes differ for model {}",
        index
    );
    tracing::info!("network {}: \"{}\"", index, rsp.description());
    Ok(())
}

fn inference_req(index: u32, entry: &NetworkEntry, user_arg: u64) -> Result<InferenceReq> {
    ensure!(
        entry.input_sizes.len() <= BUFFER_MAX && entry.output_sizes.len() <= BUFFER_MAX,
        "model {} has too many tensors",
        index
    );

    let mut req = InferenceReq {
        user_arg,
        ifm_count: entry.input_sizes.len() as u32,
        ofm_count: entry.output_sizes.len() as u32,
        network: NetworkRef::Index(index).into(),
        pmu_cycle_counter_enable: 1,
        ..Default::default()
    };
    let mut addr = IFM_BASE;
    for (desc, &size) in req.ifm.iter_mut().zip(&entry.input_sizes) {
        *desc = BufferDesc { ptr: addr, size };
        addr = addr.wrapping_add(size);
    }
    let mut addr = OFM_BASE;
    for (desc, &size) in req.ofm.iter_mut().zip(&entry.output_sizes) {
        *desc = BufferDesc { ptr: addr, size };
        addr = addr.wrapping_add(size);
    }
    Ok(req)
}

fn check_inference(client: &mut MessageClient, index: u32, entry: &NetworkEntry) -> Result<()> {
    let req = inference_req(index, entry, 0x1000 + index as u64)?;
    client.send_input_message(MessageType::InferenceReq, &req)?;
    let rsp: InferenceRsp = client.wait_and_read_output_message(MessageType::InferenceRsp)?;
    ensure!(rsp.user_arg == req.user_arg, "inference user_arg mismatch");
    ensure!(
        rsp.status == Status::Ok as u32,
        "inference on model {} failed, status={}",
        index,
        rsp.status
    );
    ensure!(
        rsp.ofm_size.get(..rsp.ofm_count as usize) == Some(&entry.output_sizes[..]),
        "inference output sizes differ for model {}",
        index
    );
    tracing::info!(
        "inference on network {} ok, cycles={}",
        index,
        rsp.pmu_cycle_counter_count
    );
    Ok(())
}

fn expect_inference_rsp(client: &mut MessageClient, user_arg: u64, status: Status) -> Result<()> {
    let rsp: InferenceRsp = client.wait_and_read_output_message(MessageType::InferenceRsp)?;
    ensure!(
        (rsp.user_arg, rsp.status) == (user_arg, status as u32),
        "expected inference 0x{:x} with status {:?}, got 0x{:x} with status {}",
        user_arg,
        status,
        rsp.user_arg,
        rsp.status
    );
    Ok(())
}

/// Parks the worker on one job, fills the inference queue behind it, then
/// checks that one more request is rejected and that a queued request can
/// be cancelled.
fn check_reject_and_cancel(
    client: &mut MessageClient,
    entry: &NetworkEntry,
    hold: &Hold,
    config: &Config,
) -> Result<()> {
    let capacity = config.inference.queue_capacity as u64;
    let frame = size_of::<MsgHeader>() + size_of::<InferenceRsp>();
    if capacity as usize * frame >= config.queue.output_size {
        tracing::warn!(
            "output queue of {} bytes cannot hold {} responses, skipping reject/cancel check",
            config.queue.output_size,
            capacity
        );
        return Ok(());
    }

    const BASE: u64 = 0x2000;
    let guard = hold.engage();

    client.send_input_message(MessageType::InferenceReq, &inference_req(0, entry, BASE)?)?;
    let parked = hold
        .wait_parked(Duration::from_secs(5))
        .ok_or_else(|| anyhow!("worker never picked up inference 0x{:x}", BASE))?;
    ensure!(parked == format!("inference-{:x}", BASE), "worker parked on {}", parked);

    // a pong after each request means the message task has queued it
    for user_arg in BASE + 1..=BASE + capacity {
        client.send_input_message(MessageType::InferenceReq, &inference_req(0, entry, user_arg)?)?;
        client.send_empty(MessageType::Ping)?;
        client.wait_for_empty(MessageType::Pong)?;
    }
    let rejected = BASE + capacity + 1;
    client.send_input_message(MessageType::InferenceReq, &inference_req(0, entry, rejected)?)?;
    expect_inference_rsp(client, rejected, Status::Rejected)?;

    let cancelled = BASE + capacity;
    let cancel = CancelInferenceReq {
        user_arg: 3,
        inference_handle: cancelled,
    };
    client.send_input_message(MessageType::CancelInferenceReq, &cancel)?;
    expect_inference_rsp(client, cancelled, Status::Aborted)?;
    let rsp: CancelInferenceRsp =
        client.wait_and_read_output_message(MessageType::CancelInferenceRsp)?;
    ensure!(
        (rsp.user_arg, rsp.status) == (3, Status::Ok as u32),
        "cancelling a queued inference failed, status={}",
        rsp.status
    );

    drop(guard);
    for user_arg in BASE..cancelled {
        expect_inference_rsp(client, user_arg, Status::Ok)?;
    }
    Ok(())
}

/// Runs one round of every request type against the message handler.
pub fn run(
    client: &mut MessageClient,
    networks: &[NetworkEntry],
    hold: &Hold,
    config: &Config,
) -> Result<()> {
    client.send_empty(MessageType::Ping)?;
    client.wait_for_empty(MessageType::Pong)?;

    client.send_empty(MessageType::VersionReq)?;
    let version: VersionRsp = client.wait_and_read_output_message(MessageType::VersionRsp)?;
    ensure!(
        version == VersionRsp::CURRENT,
        "protocol version mismatch: {}.{}.{}",
        version.major,
        version.minor,
        version.patch
    );

    client.send_input_message(MessageType::CapabilitiesReq, &CapabilitiesReq { user_arg: 1 })?;
    let caps: CapabilitiesRsp = client.wait_and_read_output_message(MessageType::CapabilitiesRsp)?;
    ensure!(caps.user_arg == 1, "capabilities user_arg mismatch");

    for (index, entry) in networks.iter().enumerate() {
        check_network_info(client, index as u32, entry)?;
        check_inference(client, index as u32, entry)?;
    }

    let cancel = CancelInferenceReq {
        user_arg: 2,
        inference_handle: u64::MAX,
    };
    client.send_input_message(MessageType::CancelInferenceReq, &cancel)?;
    let rsp: CancelInferenceRsp =
        client.wait_and_read_output_message(MessageType::CancelInferenceRsp)?;
    ensure!(
        rsp.status == Status::Error as u32,
        "cancelling an unknown inference must fail"
    );

    if let Some(entry) = networks.first() {
        check_reject_and_cancel(client, entry, hold, config)?;
    }

    Ok(())
}
