use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use bollard::Docker;
use tokio::{self, signal};
use tracing::info;

use crate::{
    config::ServerConfig,
    error::Error,
    orchestrator::{ingress, network::NetworkFabric, Orchestrator},
    routes::{create_routes, RouteState},
};

pub struct Service {
    pub config: ServerConfig,
    pub orchestrator: Arc<Orchestrator>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let docker = Arc::new(connect_docker(config.docker_addr.as_deref())?);
        docker
            .ping()
            .await
            .map_err(|e| Error::EngineUnavailable(e.to_string()))?;

        let fabric = Arc::new(NetworkFabric::new(docker.clone()));
        let endpoint = ingress::bootstrap(
            &docker,
            &fabric,
            &config.ingress,
            config.self_container.as_deref(),
        )
        .await
        .context("error bootstrapping ingress")?;

        let orchestrator = Arc::new(
            Orchestrator::new(&config, docker, fabric, endpoint)
                .context("error initializing orchestrator")?,
        );

        Ok(Self {
            config,
            orchestrator,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        let route_state = RouteState {
            orchestrator: self.orchestrator.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("management api listening on {}", self.config.listen_addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(create_routes(route_state).into_make_service())
            .await?;

        // Listener is down; undo everything we created in the engine.
        self.orchestrator.shutdown().await;
        Ok(())
    }
}

fn connect_docker(addr: Option<&str>) -> Result<Docker> {
    let docker = match addr {
        Some(addr) if addr.starts_with("http://") || addr.starts_with("tcp://") => {
            Docker::connect_with_http(addr, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("failed to connect to docker at {addr}"))?
        }
        Some(addr) => {
            let path = addr.strip_prefix("unix://").unwrap_or(addr);
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("failed to connect to docker socket {path}"))?
        }
        None => Docker::connect_with_local_defaults()
            .context("failed to connect to docker with default settings")?,
    };
    Ok(docker)
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    info!("signal received, shutting down server gracefully");
}
