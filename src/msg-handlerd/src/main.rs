use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use nix::sys::signal;

use msg_handler::config::NetworkEntry;
use msg_handler::process::NoDriver;
use msg_handler::{
    Config, IncomingMessageHandler, IndexedNetworks, InferenceHandler, MessageClient,
    MessageHandlerService, TaskParams,
};
use npu_ipc::{FenceBarrier, LoopbackMailbox, MessageQueue, QueueRegion, SharedMemoryBarrier};

mod loopback;
mod selftest;

use loopback::{EchoRunner, Hold, ManifestParser};

#[derive(Debug, Clone, Parser)]
#[command(name = "NPU message handler")]
struct Opts {
    /// Message handler config path
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    no_ansi: bool,
    /// Self-test rounds to run, 0 runs until interrupted
    #[arg(short = 'n', long, default_value_t = 1)]
    iterations: u64,
}

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(sig: i32) {
    assert_eq!(sig, signal::SIGINT as i32);
    TERMINATE.store(true, Ordering::Relaxed);
}

fn builtin_network() -> NetworkEntry {
    NetworkEntry {
        path: PathBuf::from("<builtin>"),
        description: "loopback".to_owned(),
        input_sizes: vec![16],
        output_sizes: vec![16],
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = match &opts.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    let _guard = msg_handler::logging::init_log(&config, !opts.no_ansi)?;

    let (networks, entries) = if config.networks.is_empty() {
        let mut networks = IndexedNetworks::new();
        networks.register(vec![0u8; 16]);
        (networks, vec![builtin_network()])
    } else {
        let networks = IndexedNetworks::from_paths(config.networks.iter().map(|e| &e.path))?;
        (networks, config.networks.clone())
    };
    tracing::info!("{} network(s) registered", networks.len());

    // memfd-backed so another process could attach to the same queues
    let input_region = QueueRegion::memfd(config.queue.input_size)?;
    let output_region = QueueRegion::memfd(config.queue.output_size)?;
    let barrier: Arc<dyn SharedMemoryBarrier> = Arc::new(FenceBarrier);
    let (host_mailbox, npu_mailbox) = LoopbackMailbox::pair();

    let params = TaskParams::new(&config.inference, Arc::new(networks));
    let incoming = IncomingMessageHandler::new(
        MessageQueue::new(input_region.clone(), Arc::clone(&barrier)),
        MessageQueue::new(output_region.clone(), Arc::clone(&barrier)),
        Arc::new(npu_mailbox),
        &params,
        Arc::new(ManifestParser::new(&entries)),
        &NoDriver,
    );
    let hold = Hold::new();
    let inference = InferenceHandler::new(&params, Box::new(EchoRunner::new(hold.clone())));
    let service = MessageHandlerService::spawn(incoming, Some(inference), &params)?;

    let mut client = MessageClient::new(
        MessageQueue::new(input_region, Arc::clone(&barrier)),
        MessageQueue::new(output_region, barrier),
        Arc::new(host_mailbox),
        config.client.timeout(),
    );

    // process Ctrl-C event
    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_sigint),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe { signal::sigaction(signal::SIGINT, &sig_action) }?;

    let mut round = 0;
    while !TERMINATE.load(Ordering::Relaxed) && (opts.iterations == 0 || round < opts.iterations) {
        selftest::run(&mut client, &entries, &hold, &config)?;
        round += 1;
        tracing::debug!("self-test round {} passed", round);
    }
    tracing::info!("{} self-test round(s) passed", round);

    service.shutdown()?;
    Ok(())
}
