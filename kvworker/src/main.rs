use std::error::Error;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use signal_hook::consts::signal::{SIGINT, SIGTERM};

use kvipc::channel::Channel;
use kvipc::engine::MemEngine;
use kvipc::worker::KvWorker;

/// Storage engine worker: hosts one engine instance and serves every
/// backend of its database over a shared-memory channel.
#[derive(Parser)]
#[command(name = "kvworker")]
struct Opts {
    /// Channel id of this worker; also names its shared-memory objects.
    #[arg(long)]
    worker_id: u32,
    /// Database this worker belongs to.
    #[arg(long, default_value_t = 0)]
    db_id: u32,
    /// Create the channel instead of opening one the manager prepared.
    #[arg(long)]
    standalone: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts = Opts::parse();

    // First signal asks the loop to stop; a second one forces the exit.
    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in [SIGTERM, SIGINT] {
        signal_hook::flag::register_conditional_shutdown(sig, 1, Arc::clone(&shutdown))?;
        signal_hook::flag::register(sig, Arc::clone(&shutdown))?;
    }

    let channel = if opts.standalone {
        Channel::create(opts.worker_id)?
    } else {
        Channel::open(opts.worker_id)?
    };

    log::info!(
        "kvworker {} starting for database {}",
        opts.worker_id,
        opts.db_id
    );
    KvWorker::<MemEngine>::new(opts.worker_id, channel).run(&shutdown)?;
    log::info!("kvworker {} stopped", opts.worker_id);
    Ok(())
}
