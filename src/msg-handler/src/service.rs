//! Wiring of the message task and the inference task.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use npu_ipc::wire::{InferenceReq, InferenceRsp};

use crate::config::InferenceConfig;
use crate::inference::InferenceHandler;
use crate::inference_queue::InferenceQueue;
use crate::incoming::IncomingMessageHandler;
use crate::networks::Networks;
use crate::notify::Notify;
use crate::Error;

/// State shared by the two tasks.
pub struct TaskParams {
    pub notify: Notify,
    pub inference_input: Arc<InferenceQueue<InferenceReq>>,
    pub inference_output_tx: Sender<InferenceRsp>,
    pub inference_output_rx: Receiver<InferenceRsp>,
    pub networks: Arc<dyn Networks>,
    pub poll_interval: Duration,
}

impl TaskParams {
    pub fn new(config: &InferenceConfig, networks: Arc<dyn Networks>) -> Self {
        let (inference_output_tx, inference_output_rx) = channel::bounded(config.output_depth);
        TaskParams {
            notify: Notify::new(),
            inference_input: Arc::new(InferenceQueue::new(config.queue_capacity)),
            inference_output_tx,
            inference_output_rx,
            networks,
            poll_interval: config.poll_interval(),
        }
    }
}

/// Handle to the running tasks. Dropping it stops them.
pub struct MessageHandlerService {
    terminate: Arc<AtomicBool>,
    notify: Notify,
    message_task: Option<JoinHandle<()>>,
    inference_task: Option<JoinHandle<()>>,
}

impl MessageHandlerService {
    /// Starts the message task, and the inference task if one is given.
    pub fn spawn(
        mut incoming: IncomingMessageHandler,
        inference: Option<InferenceHandler>,
        params: &TaskParams,
    ) -> Result<Self, Error> {
        let terminate = Arc::new(AtomicBool::new(false));
        let mut service = MessageHandlerService {
            terminate: Arc::clone(&terminate),
            notify: params.notify.clone(),
            message_task: None,
            inference_task: None,
        };

        if let Some(mut inference) = inference {
            let terminate = Arc::clone(&terminate);
            service.inference_task = Some(
                thread::Builder::new()
                    .name("inference-task".to_owned())
                    .spawn(move || inference.run(&terminate))?,
            );
        }

        service.message_task = Some(
            thread::Builder::new()
                .name("message-task".to_owned())
                .spawn(move || incoming.run(&terminate))?,
        );

        tracing::info!("Message handler service started");
        Ok(service)
    }

    pub fn is_running(&self) -> bool {
        !self.terminate.load(Ordering::Relaxed)
    }

    /// Stops both tasks and waits for them to exit.
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.terminate.store(true, Ordering::Relaxed);
        self.notify.signal();

        let mut result = Ok(());
        for (name, task) in [
            ("message-task", self.message_task.take()),
            ("inference-task", self.inference_task.take()),
        ] {
            if let Some(handle) = task {
                if handle.join().is_err() {
                    result = Err(Error::TaskPanicked(name));
                }
            }
        }
        result
    }
}

impl Drop for MessageHandlerService {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("Message handler service shutdown: {}", e);
        }
    }
}
