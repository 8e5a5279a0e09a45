use std::path::PathBuf;

use clap::Parser;
use tracing::error;

mod config;
mod data_model;
mod error;
mod http_objects;
mod logging;
mod orchestrator;
mod registry;
mod routes;
mod service;

use service::Service;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(path) => match config::ServerConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error reading config file: {err:?}");
                return;
            }
        },
        None => config::ServerConfig::default(),
    };
    config.apply_env_overrides();

    if let Err(err) = logging::setup_logging() {
        eprintln!("Error setting up logging: {err:?}");
        return;
    }

    let service = Service::new(config).await;
    if let Err(err) = service {
        error!("Error creating service: {:?}", err);
        return;
    }
    if let Err(err) = service.unwrap().start().await {
        error!("Error starting service: {:?}", err);
    }
}
