//! Bridge network management.
//!
//! Each deployment owns a private bridge network named `<function>-net`.
//! Replicas and the shared ingress container are attached to it, and replica
//! addresses are resolved from the engine's network inspection rather than
//! guessed. Teardown force-disconnects whatever is still attached so a
//! half-rolled-back deploy cannot pin the network forever.

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use anyhow::Context;
use bollard::{
    network::{
        ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions,
        InspectNetworkOptions, ListNetworksOptions,
    },
    Docker,
};
use tracing::{debug, warn};

use crate::{
    data_model::platform_labels,
    error::{Error, Result},
};

pub fn function_network_name(function: &str) -> String {
    format!("{function}-net")
}

pub struct NetworkFabric {
    docker: Arc<Docker>,
}

impl NetworkFabric {
    pub fn new(docker: Arc<Docker>) -> Self {
        NetworkFabric { docker }
    }

    pub async fn create_function_network(&self, function: &str) -> Result<String> {
        let name = function_network_name(function);
        self.create_network(&name, function).await?;
        Ok(name)
    }

    pub async fn create_network(&self, name: &str, function: &str) -> Result<()> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            labels: platform_labels(function),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| Error::NetworkCreateFailed {
                name: name.to_string(),
                source: e.into(),
            })?;
        debug!(network = name, "created bridge network");
        Ok(())
    }

    pub async fn connect(&self, network: &str, container: &str) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: Default::default(),
        };
        self.docker
            .connect_network(network, options)
            .await
            .with_context(|| format!("failed to connect {container} to network {network}"))?;
        Ok(())
    }

    /// Address of `container_id` on `network`, from the engine's view.
    pub async fn resolve_member_addr(&self, network: &str, container_id: &str) -> Result<String> {
        let details = self
            .docker
            .inspect_network(
                network,
                Some(InspectNetworkOptions::<String> {
                    verbose: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("failed to inspect network {network}"))?;
        let endpoint = details
            .containers
            .as_ref()
            .and_then(|containers| containers.get(container_id))
            .with_context(|| format!("container {container_id} not attached to {network}"))?;
        let cidr = endpoint
            .ipv4_address
            .as_deref()
            .filter(|addr| !addr.is_empty())
            .with_context(|| format!("container {container_id} has no address on {network}"))?;
        Ok(strip_cidr(cidr)?)
    }

    /// Remove a network, force-disconnecting anything still attached.
    /// Absent networks are fine; a member that refuses to disconnect is
    /// logged and skipped so removal still gets attempted.
    pub async fn destroy_network(&self, network: &str) -> Result<()> {
        let details = match self
            .docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(details) => details,
            Err(e) if super::engine_not_found(&e) => return Ok(()),
            Err(e) => {
                return Err(
                    anyhow::Error::from(e)
                        .context(format!("failed to inspect network {network}"))
                        .into(),
                )
            }
        };
        for member in details.containers.unwrap_or_default().into_keys() {
            let options = DisconnectNetworkOptions {
                container: member.clone(),
                force: true,
            };
            if let Err(e) = self.docker.disconnect_network(network, options).await {
                warn!(network, container = member, "failed to disconnect: {e}");
            }
        }
        match self.docker.remove_network(network).await {
            Ok(()) => {
                debug!(network, "removed bridge network");
                Ok(())
            }
            Err(e) if super::engine_not_found(&e) => Ok(()),
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("failed to remove network {network}"))
                .into()),
        }
    }

    /// Remove any leftover network with exactly this name, e.g. after an
    /// unclean shutdown.
    pub async fn remove_stale_network(&self, name: &str) -> Result<()> {
        let filters = HashMap::from([("name".to_string(), vec![name.to_string()])]);
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .context("failed to list networks")?;
        for network in networks {
            // The name filter matches substrings; only exact hits are ours.
            if network.name.as_deref() == Some(name) {
                self.destroy_network(name).await?;
            }
        }
        Ok(())
    }
}

/// Strip the prefix length from a CIDR-form address like `172.20.0.3/16`.
/// Accepts a bare address too; anything that does not parse as an IP is an
/// error rather than a silently truncated string.
pub(crate) fn strip_cidr(addr: &str) -> anyhow::Result<String> {
    let host = addr.split('/').next().unwrap_or_default();
    host.parse::<IpAddr>()
        .with_context(|| format!("invalid network address: {addr}"))?;
    Ok(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_cidr_ipv4() {
        assert_eq!(strip_cidr("172.20.0.3/16").unwrap(), "172.20.0.3");
        assert_eq!(strip_cidr("10.0.0.1/8").unwrap(), "10.0.0.1");
        assert_eq!(strip_cidr("192.168.100.7/20").unwrap(), "192.168.100.7");
    }

    #[test]
    fn test_strip_cidr_bare_address() {
        assert_eq!(strip_cidr("172.20.0.3").unwrap(), "172.20.0.3");
    }

    #[test]
    fn test_strip_cidr_ipv6() {
        assert_eq!(strip_cidr("fd00::3/64").unwrap(), "fd00::3");
    }

    #[test]
    fn test_strip_cidr_rejects_garbage() {
        assert!(strip_cidr("").is_err());
        assert!(strip_cidr("not-an-address/16").is_err());
        assert!(strip_cidr("/16").is_err());
    }

    #[test]
    fn test_function_network_name() {
        assert_eq!(function_network_name("echo"), "echo-net");
    }
}
