//! The inference task: runs queued requests one at a time.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{SendTimeoutError, Sender};
use minstant::Instant;
use thiserror::Error;

use npu_ipc::wire::{InferenceReq, InferenceRsp, Status, BUFFER_MAX};

use crate::inference_queue::InferenceQueue;
use crate::networks::{NetworkError, Networks};
use crate::notify::Notify;
use crate::process::{DataPtr, InferenceJob, InferenceRunner, PmuConfig};
use crate::service::TaskParams;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Network: {0}")]
    Network(#[from] NetworkError),
    #[error("Too many {kind} buffers: {count}, at most {max}")]
    TooManyBuffers {
        kind: &'static str,
        count: u32,
        max: usize,
    },
}

pub struct InferenceHandler {
    inference_input: Arc<InferenceQueue<InferenceReq>>,
    inference_output: Sender<InferenceRsp>,
    notify: Notify,
    networks: Arc<dyn Networks>,
    runner: Box<dyn InferenceRunner>,
    poll_interval: Duration,
}

impl InferenceHandler {
    pub fn new(params: &TaskParams, runner: Box<dyn InferenceRunner>) -> Self {
        InferenceHandler {
            inference_input: Arc::clone(&params.inference_input),
            inference_output: params.inference_output_tx.clone(),
            notify: params.notify.clone(),
            networks: Arc::clone(&params.networks),
            runner,
            poll_interval: params.poll_interval,
        }
    }

    /// Task loop. Pops requests in FIFO order and hands each response to
    /// the message task.
    pub fn run(&mut self, terminate: &AtomicBool) {
        tracing::info!("Inference task started");
        while !terminate.load(Ordering::Relaxed) {
            let Some(req) = self.inference_input.pop_timeout(self.poll_interval) else {
                continue;
            };

            let rsp = self.run_inference(&req);
            if !self.deliver(rsp, terminate) {
                break;
            }
        }
        tracing::info!("Inference task stopped");
    }

    // Hands `rsp` to the message task, waiting while the channel is full.
    // Returns false if the task should stop instead.
    fn deliver(&self, mut rsp: InferenceRsp, terminate: &AtomicBool) -> bool {
        loop {
            match self.inference_output.send_timeout(rsp, self.poll_interval) {
                Ok(()) => {
                    self.notify.signal();
                    return true;
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    if terminate.load(Ordering::Relaxed) {
                        tracing::warn!(
                            "Shutting down, dropping inference response user_arg=0x{:x}",
                            back.user_arg
                        );
                        return false;
                    }
                    self.notify.signal();
                    rsp = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    tracing::error!("Message task is gone, dropping inference response");
                    return false;
                }
            }
        }
    }

    /// Runs one request to completion and builds its response.
    pub fn run_inference(&mut self, req: &InferenceReq) -> InferenceRsp {
        tracing::debug!(
            "Running inference. user_arg=0x{:x}, ifm_count={}, ofm_count={}",
            req.user_arg,
            req.ifm_count,
            req.ofm_count
        );

        let mut rsp = InferenceRsp {
            user_arg: req.user_arg,
            pmu_event_config: req.pmu_event_config,
            pmu_cycle_counter_enable: req.pmu_cycle_counter_enable,
            status: Status::Error as u32,
            ..Default::default()
        };

        let mut job = match self.get_inference_job(req) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!("Failed to build job. user_arg=0x{:x}: {}", req.user_arg, e);
                return rsp;
            }
        };

        let start = Instant::now();
        let result = self.runner.run_job(&mut job);
        tracing::debug!(
            "Inference user_arg=0x{:x} finished in {:?}",
            req.user_arg,
            start.elapsed()
        );

        rsp.ofm_count = job.output.len().min(BUFFER_MAX) as u32;
        for (size, ofm) in rsp.ofm_size.iter_mut().zip(&job.output) {
            *size = ofm.size;
        }

        match result {
            Ok(()) => {
                rsp.pmu_event_count = job.counters.event_count;
                if job.pmu.cycle_counter_enable {
                    rsp.pmu_cycle_counter_count = job.counters.cycle_count;
                }
                rsp.status = Status::Ok as u32;
            }
            Err(e) => {
                tracing::warn!("Inference failed. user_arg=0x{:x}: {}", req.user_arg, e);
            }
        }

        rsp
    }

    fn get_inference_job(&self, req: &InferenceReq) -> Result<InferenceJob, JobError> {
        let network = self.networks.get_network(&req.network)?;
        let input = req.inputs().ok_or(JobError::TooManyBuffers {
            kind: "input",
            count: req.ifm_count,
            max: BUFFER_MAX,
        })?;
        let output = req.outputs().ok_or(JobError::TooManyBuffers {
            kind: "output",
            count: req.ofm_count,
            max: BUFFER_MAX,
        })?;

        Ok(InferenceJob {
            name: format!("inference-{:x}", req.user_arg),
            network,
            input: input.iter().copied().map(DataPtr::from).collect(),
            output: output.iter().copied().map(DataPtr::from).collect(),
            pmu: PmuConfig {
                event_config: req.pmu_event_config,
                cycle_counter_enable: req.pmu_cycle_counter_enable != 0,
            },
            counters: Default::default(),
        })
    }
}
