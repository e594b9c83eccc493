//! The message task: sole reader of the host-to-NPU queue and sole writer
//! of the NPU-to-host queue.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::Receiver;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};

use npu_ipc::wire::{
    CancelInferenceReq, CancelInferenceRsp, CapabilitiesReq, CapabilitiesRsp, ErrorKind, ErrorMsg,
    InferenceReq, InferenceRsp, MessageType, MsgHeader, NetworkBuffer, NetworkInfoReq,
    NetworkInfoRsp, Status, VersionRsp, BUFFER_MAX, MSG_MAGIC,
};
use npu_ipc::{CallbackId, Mailbox, MessageQueue};

use crate::inference_queue::InferenceQueue;
use crate::networks::{NetworkError, Networks};
use crate::notify::Notify;
use crate::process::{DriverInfo, ModelInfo, ModelParser, ParseError};
use crate::service::TaskParams;

#[derive(Debug, Error)]
enum NetworkInfoError {
    #[error("{0}")]
    Network(#[from] NetworkError),
    #[error("{0}")]
    Parse(#[from] ParseError),
}

pub struct IncomingMessageHandler {
    input: MessageQueue,
    output: MessageQueue,
    mailbox: Arc<dyn Mailbox>,
    callback: CallbackId,
    notify: Notify,
    inference_input: Arc<InferenceQueue<InferenceReq>>,
    inference_output: Receiver<InferenceRsp>,
    networks: Arc<dyn Networks>,
    parser: Arc<dyn ModelParser>,
    capabilities: CapabilitiesRsp,
}

impl Drop for IncomingMessageHandler {
    fn drop(&mut self) {
        self.mailbox.deregister_callback(self.callback);
    }
}

impl IncomingMessageHandler {
    /// Capabilities are read from `driver` once, here.
    pub fn new(
        input: MessageQueue,
        output: MessageQueue,
        mailbox: Arc<dyn Mailbox>,
        params: &TaskParams,
        parser: Arc<dyn ModelParser>,
        driver: &dyn DriverInfo,
    ) -> Self {
        let notify = params.notify.clone();
        let irq_notify = notify.clone();
        let callback = mailbox.register_callback(Arc::new(move || irq_notify.signal()));
        if !mailbox.verify_hardware() {
            tracing::warn!("Mailbox hardware verification failed");
        }

        IncomingMessageHandler {
            input,
            output,
            mailbox,
            callback,
            notify,
            inference_input: Arc::clone(&params.inference_input),
            inference_output: params.inference_output_rx.clone(),
            networks: Arc::clone(&params.networks),
            parser,
            capabilities: driver.capabilities(),
        }
    }

    /// Task loop. Sleeps until the mailbox or the inference task signals,
    /// then drains both sources.
    pub fn run(&mut self, terminate: &AtomicBool) {
        tracing::info!("Message task started");
        while !terminate.load(Ordering::Relaxed) {
            self.notify.wait();
            if terminate.load(Ordering::Relaxed) {
                break;
            }
            self.poll();
        }
        tracing::info!("Message task stopped");
    }

    /// Handles everything pending without waiting. Returns the number of
    /// units of work done.
    pub fn poll(&mut self) -> usize {
        let mut nwork = 0;
        while self.handle_inference_output() || self.handle_message() {
            nwork += 1;
        }
        nwork
    }

    fn handle_inference_output(&mut self) -> bool {
        match self.inference_output.try_recv() {
            Ok(rsp) => {
                self.send_inference_rsp(&rsp);
                true
            }
            Err(_) => false,
        }
    }

    fn handle_message(&mut self) -> bool {
        if self.input.available() == 0 {
            return false;
        }

        let msg: MsgHeader = match self.input.read_as() {
            Ok(msg) => msg,
            Err(_) => {
                self.send_error_and_reset_queue(
                    ErrorKind::InvalidSize,
                    "Failed to read a complete header",
                );
                return false;
            }
        };

        tracing::debug!(
            "Msg: header magic={:X}, type={}, length={}",
            msg.magic,
            msg.ty,
            msg.length
        );

        if msg.magic != MSG_MAGIC {
            self.send_error_and_reset_queue(ErrorKind::InvalidMagic, "Invalid magic");
            return false;
        }

        let ty = match MessageType::try_from(msg.ty) {
            Ok(ty) => ty,
            Err(_) => return self.unsupported(&msg),
        };

        match ty {
            MessageType::Ping => {
                tracing::debug!("Msg: Ping");
                self.send_pong();
            }
            MessageType::Err => {
                match self.input.read_as::<ErrorMsg>() {
                    Ok(err) => tracing::warn!(
                        "Msg: Error. type={}, msg=\"{}\"",
                        err.ty,
                        err.text()
                    ),
                    Err(_) => tracing::error!("Msg: Failed to receive error message"),
                }
                self.input.reset();
                return false;
            }
            MessageType::VersionReq => {
                tracing::debug!("Msg: Version request");
                self.send_version_rsp();
            }
            MessageType::CapabilitiesReq => {
                let Some(req) = self.read_payload::<CapabilitiesReq>("CapabilitiesReq") else {
                    return true;
                };
                tracing::debug!("Msg: Capabilities request. user_arg=0x{:x}", req.user_arg);
                self.send_capabilities_rsp(req.user_arg);
            }
            MessageType::InferenceReq => {
                let Some(req) = self.read_payload::<InferenceReq>("InferenceReq") else {
                    return true;
                };
                tracing::debug!(
                    "Msg: InferenceReq. user_arg=0x{:x}, network_type={}, ifm_count={}, ofm_count={}",
                    req.user_arg,
                    req.network.kind,
                    req.ifm_count,
                    req.ofm_count
                );
                if let Err(req) = self.inference_input.push(req) {
                    tracing::info!(
                        "Msg: Inference queue full ({} pending). Rejecting inference user_arg=0x{:x}",
                        self.inference_input.capacity(),
                        req.user_arg
                    );
                    self.send_failed_inference_rsp(req.user_arg, Status::Rejected);
                }
            }
            MessageType::CancelInferenceReq => {
                let Some(req) = self.read_payload::<CancelInferenceReq>("CancelInferenceReq")
                else {
                    return true;
                };
                tracing::debug!(
                    "Msg: CancelInferenceReq. user_arg=0x{:x}, inference_handle=0x{:x}",
                    req.user_arg,
                    req.inference_handle
                );

                let found = self
                    .inference_input
                    .erase(|queued| queued.user_arg == req.inference_handle);
                if found {
                    self.send_failed_inference_rsp(req.inference_handle, Status::Aborted);
                }
                let status = if found { Status::Ok } else { Status::Error };
                self.send_cancel_inference_rsp(req.user_arg, status);
            }
            MessageType::NetworkInfoReq => {
                let Some(req) = self.read_payload::<NetworkInfoReq>("NetworkInfoReq") else {
                    return true;
                };
                tracing::debug!(
                    "Msg: NetworkInfoReq. user_arg=0x{:x}, network_type={}",
                    req.user_arg,
                    req.network.kind
                );
                self.send_network_info_rsp(req.user_arg, &req.network);
            }
            MessageType::Pong
            | MessageType::InferenceRsp
            | MessageType::VersionRsp
            | MessageType::CapabilitiesRsp
            | MessageType::NetworkInfoRsp
            | MessageType::CancelInferenceRsp => return self.unsupported(&msg),
        }

        true
    }

    fn read_payload<T: FromBytes + AsBytes>(&mut self, name: &str) -> Option<T> {
        match self.input.read_as::<T>() {
            Ok(payload) => Some(payload),
            Err(_) => {
                self.send_error_and_reset_queue(
                    ErrorKind::InvalidPayload,
                    &format!("{}. Failed to read payload", name),
                );
                None
            }
        }
    }

    fn unsupported(&mut self, msg: &MsgHeader) -> bool {
        let text = format!(
            "Msg: Unknown type: {} with payload length {} bytes",
            msg.ty, msg.length
        );
        self.send_error_and_reset_queue(ErrorKind::UnsupportedType, &text);
        false
    }

    fn send(&mut self, ty: MessageType, payload: &[u8], what: &str) {
        if let Err(e) = self.output.write_raw(ty.into(), payload) {
            tracing::error!("Failed to write {}. No mailbox message sent: {}", what, e);
            return;
        }
        if let Err(e) = self.mailbox.send_message() {
            tracing::error!("Failed to signal {}: {}", what, e);
        }
    }

    fn send_error_and_reset_queue(&mut self, kind: ErrorKind, message: &str) {
        tracing::warn!("{}", message);
        let err = ErrorMsg::new(kind, message);
        self.send(MessageType::Err, err.as_bytes(), "error response");
        self.input.reset();
    }

    fn send_pong(&mut self) {
        self.send(MessageType::Pong, &[], "pong response");
    }

    fn send_version_rsp(&mut self) {
        self.send(
            MessageType::VersionRsp,
            VersionRsp::CURRENT.as_bytes(),
            "version response",
        );
    }

    fn send_capabilities_rsp(&mut self, user_arg: u64) {
        let mut rsp = self.capabilities;
        rsp.user_arg = user_arg;
        self.send(
            MessageType::CapabilitiesRsp,
            rsp.as_bytes(),
            "capabilities response",
        );
    }

    fn network_info(&self, network: &NetworkBuffer) -> Result<ModelInfo, NetworkInfoError> {
        let model = self.networks.get_network(network)?;
        let info = self.parser.parse_model(&model)?;
        for (kind, count) in [
            ("input", info.input_sizes.len()),
            ("output", info.output_sizes.len()),
        ] {
            if count > BUFFER_MAX {
                return Err(ParseError::TooManyTensors {
                    kind,
                    count,
                    max: BUFFER_MAX,
                }
                .into());
            }
        }
        Ok(info)
    }

    fn send_network_info_rsp(&mut self, user_arg: u64, network: &NetworkBuffer) {
        let mut rsp = NetworkInfoRsp {
            user_arg,
            ..Default::default()
        };

        match self.network_info(network) {
            Ok(info) => {
                rsp.set_description(&info.description);
                rsp.ifm_count = info.input_sizes.len() as u32;
                rsp.ifm_size[..info.input_sizes.len()].copy_from_slice(&info.input_sizes);
                rsp.ofm_count = info.output_sizes.len() as u32;
                rsp.ofm_size[..info.output_sizes.len()].copy_from_slice(&info.output_sizes);
                rsp.status = Status::Ok as u32;
            }
            Err(e) => {
                tracing::warn!("Msg: NetworkInfoReq failed. user_arg=0x{:x}: {}", user_arg, e);
                rsp.status = Status::Error as u32;
            }
        }

        self.send(
            MessageType::NetworkInfoRsp,
            rsp.as_bytes(),
            "network info response",
        );
    }

    fn send_inference_rsp(&mut self, rsp: &InferenceRsp) {
        tracing::debug!(
            "Sending inference response. user_arg=0x{:x}, ofm_count={}, status={}",
            rsp.user_arg,
            rsp.ofm_count,
            rsp.status
        );
        self.send(
            MessageType::InferenceRsp,
            rsp.as_bytes(),
            "inference response",
        );
    }

    fn send_failed_inference_rsp(&mut self, user_arg: u64, status: Status) {
        let rsp = InferenceRsp {
            user_arg,
            status: status as u32,
            ..Default::default()
        };
        self.send_inference_rsp(&rsp);
    }

    fn send_cancel_inference_rsp(&mut self, user_arg: u64, status: Status) {
        tracing::debug!(
            "Sending cancel inference response. user_arg=0x{:x}, status={:?}",
            user_arg,
            status
        );
        let rsp = CancelInferenceRsp {
            user_arg,
            status: status as u32,
            _reserved: 0,
        };
        self.send(
            MessageType::CancelInferenceRsp,
            rsp.as_bytes(),
            "cancel inference response",
        );
    }
}
