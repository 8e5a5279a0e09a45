//! The shared ingress container and its registration protocol.
//!
//! One reverse-proxy container fronts every deployed function. It sits on
//! the shared network plus each function's private network, and learns
//! where replicas live through a registration push: a POST to its control
//! port with the function's resource path and replica addresses. An empty
//! address list deregisters the resource.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use bollard::{
    container::{Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions},
    service::{HostConfig, PortBinding},
    Docker,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::IngressConfig,
    data_model::IngressEndpoint,
    error::{Error, Result},
};

use super::network::NetworkFabric;

/// Fixed ports the ingress listens on inside its container. Host ports are
/// configuration; a host port of 0 leaves the protocol unpublished.
const INGRESS_HTTP_PORT: &str = "7000/tcp";
const INGRESS_GRPC_PORT: &str = "8000/tcp";
const INGRESS_COAP_PORT: &str = "6000/udp";

/// Start the shared ingress container on a fresh shared network. Leftovers
/// from an unclean shutdown (network or container with the same name) are
/// removed first. When `self_container` names the container this process
/// runs in, it is attached to the shared network too so the control port is
/// reachable by address.
pub async fn bootstrap(
    docker: &Arc<Docker>,
    fabric: &NetworkFabric,
    config: &IngressConfig,
    self_container: Option<&str>,
) -> Result<IngressEndpoint> {
    fabric.remove_stale_network(&config.network).await?;
    fabric.create_network(&config.network, "ingress").await?;
    remove_stale_container(docker, &config.container_name).await;

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for (container_port, host_port) in [
        (INGRESS_HTTP_PORT, config.http_port),
        (INGRESS_GRPC_PORT, config.grpc_port),
        (INGRESS_COAP_PORT, config.coap_port),
    ] {
        if host_port == 0 {
            continue;
        }
        exposed_ports.insert(container_port.to_string(), HashMap::new());
        port_bindings.insert(
            container_port.to_string(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );
    }

    let container_config = Config::<String> {
        image: Some(config.image.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            network_mode: Some(config.network.clone()),
            port_bindings: Some(port_bindings),
            auto_remove: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };
    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: config.container_name.clone(),
                platform: None,
            }),
            container_config,
        )
        .await
        .context("failed to create ingress container")?;
    docker
        .start_container(
            &config.container_name,
            None::<StartContainerOptions<String>>,
        )
        .await
        .context("failed to start ingress container")?;
    let addr = fabric
        .resolve_member_addr(&config.network, &created.id)
        .await?;

    if let Some(own) = self_container {
        fabric.connect(&config.network, own).await?;
    }

    info!(
        container = config.container_name,
        network = config.network,
        addr,
        "ingress container running"
    );
    Ok(IngressEndpoint {
        container_id: created.id,
        container_name: config.container_name.clone(),
        network: config.network.clone(),
        addr,
        control_port: config.control_port,
    })
}

/// Remove the ingress container and the shared network. Best effort, used
/// on shutdown.
pub async fn teardown(docker: &Arc<Docker>, fabric: &NetworkFabric, endpoint: &IngressEndpoint) {
    remove_stale_container(docker, &endpoint.container_name).await;
    if let Err(e) = fabric.destroy_network(&endpoint.network).await {
        warn!(network = endpoint.network, "failed to remove shared network: {e}");
    }
}

async fn remove_stale_container(docker: &Arc<Docker>, name: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    match docker.remove_container(name, Some(options)).await {
        Ok(()) => debug!(container = name, "removed stale container"),
        Err(e) if super::engine_gone(&e) => {}
        Err(e) => warn!(container = name, "failed to remove stale container: {e}"),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrationRequest {
    function_resource: String,
    function_containers: Vec<String>,
}

/// Client side of the registration protocol.
pub struct IngressClient {
    http: reqwest::Client,
    control_url: String,
}

impl IngressClient {
    pub fn new(endpoint: &IngressEndpoint, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build ingress control client")?;
        Ok(IngressClient {
            http,
            control_url: format!("http://{}:{}", endpoint.addr, endpoint.control_port),
        })
    }

    /// Push the replica addresses serving `resource`. The ingress replaces
    /// its previous routing entry for the resource wholesale.
    pub async fn register(&self, resource: &str, addrs: Vec<String>) -> Result<()> {
        let request = RegistrationRequest {
            function_resource: resource.to_string(),
            function_containers: addrs,
        };
        let response = self
            .http
            .post(&self.control_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::IngressRegistrationFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::IngressRegistrationFailed(format!(
                "control endpoint returned status {}",
                response.status()
            )));
        }
        debug!(resource, "registered resource with ingress");
        Ok(())
    }

    /// Deregistration is a registration with no addresses.
    pub async fn deregister(&self, resource: &str) -> Result<()> {
        self.register(resource, Vec::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_wire_format() {
        let request = RegistrationRequest {
            function_resource: "/echo".to_string(),
            function_containers: vec!["172.20.0.3".to_string(), "172.20.0.4".to_string()],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "function_resource": "/echo",
                "function_containers": ["172.20.0.3", "172.20.0.4"],
            })
        );
    }

    #[test]
    fn test_deregistration_sends_empty_list() {
        let request = RegistrationRequest {
            function_resource: "/echo".to_string(),
            function_containers: Vec::new(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["function_containers"], serde_json::json!([]));
    }
}
