mod common;

use std::time::Duration;

use npu_ipc::wire::{
    BufferDesc, CancelInferenceReq, CancelInferenceRsp, CapabilitiesReq, CapabilitiesRsp,
    ErrorKind, ErrorMsg, InferenceRsp, MessageType, MsgHeader, NetworkInfoReq, NetworkInfoRsp,
    NetworkRef, Status, VersionRsp, MSG_MAGIC,
};
use npu_ipc::Mailbox;
use zerocopy::AsBytes;

use common::*;

fn cancel(f: &mut Fixture, user_arg: u64, handle: u64) {
    let req = CancelInferenceReq {
        user_arg,
        inference_handle: handle,
    };
    f.client
        .send_input_message(MessageType::CancelInferenceReq, &req)
        .unwrap();
}

fn submit(f: &mut Fixture, user_arg: u64) {
    f.client
        .send_input_message(MessageType::InferenceReq, &inference_req(user_arg))
        .unwrap();
}

fn read_error(f: &mut Fixture) -> ErrorMsg {
    f.client
        .wait_and_read_output_message::<ErrorMsg>(MessageType::Err)
        .unwrap()
}

#[test]
fn ping_pong() {
    let mut f = fixture();
    f.client.send_empty(MessageType::Ping).unwrap();
    assert_eq!(f.handler.poll(), 1);

    f.client.wait_for_empty(MessageType::Pong).unwrap();
    assert_eq!(f.client.pending(), 0);
    assert_eq!(f.npu_mailbox.sent(), 1);
}

#[test]
fn mailbox_wakes_message_task() {
    let f = fixture();
    assert!(!f.params.notify.wait_timeout(Duration::from_millis(1)));
    f.npu_mailbox.handle_message();
    assert!(f.params.notify.wait_timeout(Duration::from_millis(1)));
}

#[test]
fn version() {
    let mut f = fixture();
    f.client.send_empty(MessageType::VersionReq).unwrap();
    f.handler.poll();

    let rsp: VersionRsp = f
        .client
        .wait_and_read_output_message(MessageType::VersionRsp)
        .unwrap();
    assert_eq!(rsp, VersionRsp::CURRENT);
}

#[test]
fn capabilities_echo_user_arg() {
    let mut f = fixture();
    for user_arg in [0x1234u64, 0x5678] {
        f.client
            .send_input_message(MessageType::CapabilitiesReq, &CapabilitiesReq { user_arg })
            .unwrap();
    }
    assert_eq!(f.handler.poll(), 2);

    for user_arg in [0x1234u64, 0x5678] {
        let rsp: CapabilitiesRsp = f
            .client
            .wait_and_read_output_message(MessageType::CapabilitiesRsp)
            .unwrap();
        let mut expected = driver_capabilities();
        expected.user_arg = user_arg;
        assert_eq!(rsp, expected);
    }
}

#[test]
fn cancel_before_run() {
    let mut f = fixture();
    submit(&mut f, 42);
    cancel(&mut f, 7, 42);
    assert_eq!(f.handler.poll(), 2);

    let rsp: InferenceRsp = f
        .client
        .wait_and_read_output_message(MessageType::InferenceRsp)
        .unwrap();
    assert_eq!(rsp.user_arg, 42);
    assert_eq!(rsp.status, Status::Aborted as u32);

    let rsp: CancelInferenceRsp = f
        .client
        .wait_and_read_output_message(MessageType::CancelInferenceRsp)
        .unwrap();
    assert_eq!(rsp.user_arg, 7);
    assert_eq!(rsp.status, Status::Ok as u32);

    assert!(f.params.inference_input.is_empty());
    assert_eq!(f.client.pending(), 0);
}

#[test]
fn cancel_unknown_handle() {
    let mut f = fixture();
    cancel(&mut f, 1, 999);
    f.handler.poll();

    let rsp: CancelInferenceRsp = f
        .client
        .wait_and_read_output_message(MessageType::CancelInferenceRsp)
        .unwrap();
    assert_eq!(rsp.user_arg, 1);
    assert_eq!(rsp.status, Status::Error as u32);
    assert_eq!(f.client.pending(), 0);
}

#[test]
fn cancel_already_running() {
    let mut f = fixture();
    submit(&mut f, 42);
    f.handler.poll();

    // the worker has taken it
    let running = f.params.inference_input.pop();
    assert_eq!(running.user_arg, 42);

    cancel(&mut f, 2, 42);
    f.handler.poll();
    let rsp: CancelInferenceRsp = f
        .client
        .wait_and_read_output_message(MessageType::CancelInferenceRsp)
        .unwrap();
    assert_eq!(rsp.status, Status::Error as u32);
    assert_eq!(f.client.pending(), 0);
}

#[test]
fn queue_overflow_rejects() {
    let mut f = fixture();
    for user_arg in 42..=47 {
        submit(&mut f, user_arg);
    }
    assert_eq!(f.handler.poll(), 6);

    let rsp: InferenceRsp = f
        .client
        .wait_and_read_output_message(MessageType::InferenceRsp)
        .unwrap();
    assert_eq!(rsp.user_arg, 47);
    assert_eq!(rsp.status, Status::Rejected as u32);
    assert_eq!(f.client.pending(), 0);
    assert_eq!(f.params.inference_input.len(), 5);

    // the accepted five are still cancellable
    for user_arg in 42..=46 {
        cancel(&mut f, 100 + user_arg, user_arg);
        f.handler.poll();
        let rsp: InferenceRsp = f
            .client
            .wait_and_read_output_message(MessageType::InferenceRsp)
            .unwrap();
        assert_eq!((rsp.user_arg, rsp.status), (user_arg, Status::Aborted as u32));
        let rsp: CancelInferenceRsp = f
            .client
            .wait_and_read_output_message(MessageType::CancelInferenceRsp)
            .unwrap();
        assert_eq!((rsp.user_arg, rsp.status), (100 + user_arg, Status::Ok as u32));
    }
    assert!(f.params.inference_input.is_empty());
}

#[test]
fn invalid_magic_resets_input() {
    let mut f = fixture();
    let bogus = MsgHeader {
        magic: 0xdeadbeef,
        ty: MessageType::Ping as u32,
        length: 0,
    };
    f.client.send_bytes(bogus.as_bytes()).unwrap();
    f.client.send_empty(MessageType::Ping).unwrap();
    assert_eq!(f.handler.poll(), 0);

    let err = read_error(&mut f);
    assert_eq!(err.ty, ErrorKind::InvalidMagic as u32);
    assert_eq!(err.text(), "Invalid magic");
    // the ping behind the corrupt frame was dropped
    assert_eq!(f.client.pending(), 0);

    f.client.send_empty(MessageType::Ping).unwrap();
    f.handler.poll();
    f.client.wait_for_empty(MessageType::Pong).unwrap();
}

#[test]
fn truncated_header() {
    let mut f = fixture();
    f.client.send_bytes(&MSG_MAGIC.to_le_bytes()).unwrap();
    f.handler.poll();

    let err = read_error(&mut f);
    assert_eq!(err.ty, ErrorKind::InvalidSize as u32);
    assert_eq!(err.text(), "Failed to read a complete header");
    assert_eq!(f.client.pending(), 0);
}

#[test]
fn truncated_payload() {
    let mut f = fixture();
    f.client
        .send_raw(MessageType::CapabilitiesReq as u32, &[0u8; 4])
        .unwrap();
    f.handler.poll();

    let err = read_error(&mut f);
    assert_eq!(err.ty, ErrorKind::InvalidPayload as u32);
    assert_eq!(err.text(), "CapabilitiesReq. Failed to read payload");
    assert_eq!(f.client.pending(), 0);
}

#[test]
fn unknown_type() {
    let mut f = fixture();
    f.client.send_raw(99, &[0u8; 8]).unwrap();
    f.handler.poll();

    let err = read_error(&mut f);
    assert_eq!(err.ty, ErrorKind::UnsupportedType as u32);
    assert!(err.text().contains("99"));
    assert!(err.text().contains("8 bytes"));
}

#[test]
fn response_type_is_unsupported() {
    let mut f = fixture();
    f.client.send_empty(MessageType::Pong).unwrap();
    f.handler.poll();

    let err = read_error(&mut f);
    assert_eq!(err.ty, ErrorKind::UnsupportedType as u32);
}

#[test]
fn peer_error_is_not_answered() {
    let mut f = fixture();
    let err = ErrorMsg::new(ErrorKind::Generic, "host gave up");
    f.client
        .send_input_message(MessageType::Err, &err)
        .unwrap();
    f.client.send_empty(MessageType::Ping).unwrap();
    assert_eq!(f.handler.poll(), 0);
    assert_eq!(f.client.pending(), 0);
    assert_eq!(f.npu_mailbox.sent(), 0);
}

fn network_info(f: &mut Fixture, network: NetworkRef) -> NetworkInfoRsp {
    let req = NetworkInfoReq {
        user_arg: 0xabc,
        network: network.into(),
        _reserved: 0,
    };
    f.client
        .send_input_message(MessageType::NetworkInfoReq, &req)
        .unwrap();
    f.handler.poll();
    let rsp: NetworkInfoRsp = f
        .client
        .wait_and_read_output_message(MessageType::NetworkInfoRsp)
        .unwrap();
    assert_eq!(rsp.user_arg, 0xabc);
    rsp
}

#[test]
fn network_info_by_index() {
    let mut f = fixture();
    let rsp = network_info(&mut f, NetworkRef::Index(0));
    assert_eq!(rsp.status, Status::Ok as u32);
    assert_eq!(rsp.description(), "Vela Optimised");
    assert_eq!(rsp.ifm_count, 1);
    assert_eq!(rsp.ifm_size[0], 1024);
    assert_eq!(rsp.ofm_count, 2);
    assert_eq!(&rsp.ofm_size[..2], &[16, 17]);
}

#[test]
fn network_info_by_buffer() {
    let mut f = fixture();
    let rsp = network_info(
        &mut f,
        NetworkRef::Buffer(BufferDesc {
            ptr: 0x7000,
            size: 64,
        }),
    );
    assert_eq!(rsp.status, Status::Ok as u32);
    assert_eq!(rsp.description(), "shared@0x7000");
}

#[test]
fn network_info_failures() {
    let mut f = fixture();
    // out of range, unparsable, too many tensors
    for index in [9, 1, 2] {
        let rsp = network_info(&mut f, NetworkRef::Index(index));
        assert_eq!(rsp.status, Status::Error as u32, "index {index}");
        assert_eq!(rsp.ifm_count, 0);
    }
}

#[test]
fn forwards_inference_output() {
    let mut f = fixture();
    let done = InferenceRsp {
        user_arg: 5,
        ofm_count: 1,
        status: Status::Ok as u32,
        ..Default::default()
    };
    f.params.inference_output_tx.send(done).unwrap();
    assert_eq!(f.handler.poll(), 1);

    let rsp: InferenceRsp = f
        .client
        .wait_and_read_output_message(MessageType::InferenceRsp)
        .unwrap();
    assert_eq!(rsp, done);
}

/// Responses that do not fit into the output queue are dropped without
/// telling the host. This is a known limitation of the protocol, there is
/// no flow control from the host side.
#[test]
fn full_output_drops_response() {
    // room for two pongs but not three
    let mut f = fixture_with_output(30);
    for _ in 0..3 {
        f.client.send_empty(MessageType::Ping).unwrap();
    }
    assert_eq!(f.handler.poll(), 3);
    assert_eq!(f.npu_mailbox.sent(), 2);

    f.client.wait_for_empty(MessageType::Pong).unwrap();
    f.client.wait_for_empty(MessageType::Pong).unwrap();
    assert_eq!(f.client.pending(), 0);
}

/// A mailbox whose doorbell is broken.
struct BrokenMailbox {
    callbacks: npu_ipc::Callbacks,
}

impl Mailbox for BrokenMailbox {
    fn send_message(&self) -> Result<(), npu_ipc::MailboxError> {
        Err(npu_ipc::MailboxError::Hardware("doorbell stuck".to_owned()))
    }

    fn handle_message(&self) {
        self.callbacks.invoke();
    }

    fn verify_hardware(&self) -> bool {
        false
    }

    fn register_callback(&self, callback: npu_ipc::Callback) -> npu_ipc::CallbackId {
        self.callbacks.register(callback)
    }

    fn deregister_callback(&self, id: npu_ipc::CallbackId) {
        self.callbacks.deregister(id)
    }
}

#[test]
fn doorbell_failure_keeps_response() {
    use std::sync::Arc;

    use msg_handler::config::InferenceConfig;
    use msg_handler::{IncomingMessageHandler, TaskParams};

    let mut link = link(1000, 1000);
    let mailbox = Arc::new(BrokenMailbox {
        callbacks: npu_ipc::Callbacks::new(),
    });
    let params = TaskParams::new(&InferenceConfig::default(), test_networks());
    let mut handler = IncomingMessageHandler::new(
        link.input,
        link.output,
        mailbox.clone(),
        &params,
        Arc::new(ByteParser),
        &driver_capabilities(),
    );
    assert_eq!(mailbox.callbacks.len(), 1);

    link.client.send_empty(MessageType::Ping).unwrap();
    assert_eq!(handler.poll(), 1);
    // the response was written even though the peer was not interrupted
    link.client.wait_for_empty(MessageType::Pong).unwrap();

    drop(handler);
    assert!(mailbox.callbacks.is_empty());
}
