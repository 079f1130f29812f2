#[macro_use]
extern crate synapse_sched;

mod args;
mod sim;

use std::process;

use synapse_sched::{log, Config};

fn main() {
    let args = args::args();
    if let Some(level) = args.level {
        log::log_init(level);
    } else if cfg!(debug_assertions) {
        log::log_init(log::LogLevel::Debug);
    } else {
        log::log_init(log::LogLevel::Info);
    }

    info!("Initializing");
    let config = match args.config {
        Some(ref path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to load config {}: {}", path, e);
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    match sim::run(&config, args.peers, args.pieces) {
        Ok(true) => info!("Download complete, shutdown complete"),
        Ok(false) => info!("Shutdown complete"),
        Err(e) => {
            error!("Simulation failed: {}", e);
            process::exit(1);
        }
    }
}
