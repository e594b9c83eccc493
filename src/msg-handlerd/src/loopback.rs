//! Stand-ins for the accelerator runtime when running on a host.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::utils::Backoff;

use msg_handler::config::NetworkEntry;
use msg_handler::process::{
    InferenceError, InferenceJob, InferenceRunner, Model, ModelInfo, ModelParser, ParseError,
};

/// Reports the tensor layout listed for each registered model in the
/// configuration.
pub struct ManifestParser {
    entries: Vec<ModelInfo>,
}

impl ManifestParser {
    pub fn new(entries: &[NetworkEntry]) -> Self {
        let entries = entries
            .iter()
            .map(|e| ModelInfo {
                description: e.description.clone(),
                input_sizes: e.input_sizes.clone(),
                output_sizes: e.output_sizes.clone(),
            })
            .collect();
        ManifestParser { entries }
    }
}

impl ModelParser for ManifestParser {
    fn parse_model(&self, model: &Model) -> Result<ModelInfo, ParseError> {
        match model {
            Model::Registered { index, .. } => {
                self.entries.get(*index as usize).cloned().ok_or_else(|| {
                    ParseError::Invalid(format!("no manifest for model {}", index))
                })
            }
            Model::Shared(ptr) => Err(ParseError::Invalid(format!(
                "cannot inspect model at 0x{:x} from the host",
                ptr.addr
            ))),
        }
    }
}

/// Parks the runner inside its next job until released, so requests pile
/// up in the inference queue behind it.
#[derive(Clone)]
pub struct Hold {
    held: Arc<AtomicBool>,
    parked_tx: Sender<String>,
    parked_rx: Receiver<String>,
}

impl Hold {
    pub fn new() -> Self {
        let (parked_tx, parked_rx) = channel::unbounded();
        Hold {
            held: Arc::new(AtomicBool::new(false)),
            parked_tx,
            parked_rx,
        }
    }

    /// Engages the hold. It is released when the returned guard drops.
    pub fn engage(&self) -> HoldGuard<'_> {
        self.held.store(true, Ordering::Release);
        HoldGuard { hold: self }
    }

    /// Name of the job the runner parked on, if it did so in time.
    pub fn wait_parked(&self, timeout: Duration) -> Option<String> {
        self.parked_rx.recv_timeout(timeout).ok()
    }

    fn park(&self, job: &str) {
        if !self.held.load(Ordering::Acquire) {
            return;
        }
        let _ = self.parked_tx.send(job.to_owned());
        let backoff = Backoff::new();
        while self.held.load(Ordering::Acquire) {
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
    }
}

impl Default for Hold {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HoldGuard<'a> {
    hold: &'a Hold,
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        self.hold.held.store(false, Ordering::Release);
    }
}

/// Completes every job immediately, leaving outputs at full size.
pub struct EchoRunner {
    jobs: u64,
    hold: Hold,
}

impl EchoRunner {
    pub fn new(hold: Hold) -> Self {
        EchoRunner { jobs: 0, hold }
    }
}

impl InferenceRunner for EchoRunner {
    fn run_job(&mut self, job: &mut InferenceJob) -> Result<(), InferenceError> {
        self.hold.park(&job.name);
        if job.network.size() == 0 {
            return Err(InferenceError::InvalidModel(job.name.clone()));
        }
        self.jobs += 1;
        job.counters.cycle_count = self.jobs;
        Ok(())
    }
}
