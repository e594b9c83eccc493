//! NPU-side message handler.
//!
//! Two tasks share the work: the message task ([`IncomingMessageHandler`])
//! reads requests from the host, answers what it can directly and queues
//! inference requests; the inference task ([`InferenceHandler`]) runs them
//! one at a time and hands responses back to the message task.
use std::io;

use thiserror::Error;

pub mod client;
pub mod config;
pub mod inference;
pub mod inference_queue;
pub mod incoming;
pub mod logging;
pub mod networks;
pub mod notify;
pub mod process;
pub mod service;

pub use client::{ClientError, MessageClient};
pub use config::Config;
pub use inference::InferenceHandler;
pub use inference_queue::InferenceQueue;
pub use incoming::IncomingMessageHandler;
pub use networks::{IndexedNetworks, NetworkError, Networks, NoIndexedNetworks};
pub use notify::Notify;
pub use service::{MessageHandlerService, TaskParams};

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("Task {0} panicked")]
    TaskPanicked(&'static str),
}
