//! Grid sync server binary.
//!
//! Configuration comes from the environment (see [`ServerConfig::from_env`]);
//! log verbosity from `RUST_LOG`, defaulting to `info`.

use grid_sync::{ServerConfig, SyncServer};
use log::{error, info};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Starting grid server (flush every {:?}, log: {}, store: {})",
        config.flush.interval,
        describe(config.log_path.as_deref()),
        describe(config.store_path.as_deref()),
    );

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open storage: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    ExitCode::SUCCESS
}

fn describe(path: Option<&std::path::Path>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "in-memory".to_string(),
    }
}
