use std::error::Error;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use signal_hook::consts::signal::{SIGINT, SIGTERM};

use kvipc::manager::{Manager, ManagerConfig};

/// Control process: launches storage workers on demand, terminates them,
/// and reaps the ones that die.
#[derive(Parser)]
#[command(name = "kvmanager")]
struct Opts {
    /// Manager configuration file.
    #[arg(short, long, default_value = "kvmanager.toml")]
    config: String,
    /// Worker binary, overriding the configuration file.
    #[arg(long)]
    worker_exe: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts = Opts::parse();

    let mut config: ManagerConfig = confy::load_path(&opts.config)?;
    if let Some(worker_exe) = opts.worker_exe {
        config.worker_exe = worker_exe;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in [SIGTERM, SIGINT] {
        signal_hook::flag::register_conditional_shutdown(sig, 1, Arc::clone(&shutdown))?;
        signal_hook::flag::register(sig, Arc::clone(&shutdown))?;
    }

    let mut manager = Manager::new(config)?;
    manager.run(&shutdown)?;
    log::info!("kvmanager stopped");
    Ok(())
}
