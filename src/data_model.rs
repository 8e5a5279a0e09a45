use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Marker variable injected into every replica's environment.
pub const PLATFORM_ENV_VAR: &str = "NIMBUS_PLATFORM";
pub const PLATFORM_ENV_VALUE: &str = "nimbus";

/// Labels stamped on every container, network and image the orchestrator
/// creates, used to scope engine queries to platform-managed resources.
pub const MANAGED_LABEL: &str = "nimbus.managed";
pub const FUNCTION_LABEL: &str = "nimbus.function";

pub fn platform_labels(function: &str) -> HashMap<String, String> {
    HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (FUNCTION_LABEL.to_string(), function.to_string()),
    ])
}

/// One running container instance of a deployment's image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaHandle {
    pub container_id: String,
    pub container_name: String,
    /// Address on the deployment's private network.
    pub addr: String,
}

/// A function's complete runtime footprint: the built image, the private
/// bridge network, the replica containers, and the resource path registered
/// at the ingress. Created only by a fully successful deploy; replaced
/// wholesale on redeploy.
#[derive(Debug, Clone)]
pub struct FunctionDeployment {
    pub name: String,
    pub resource_path: String,
    pub replica_count: usize,
    /// sha256 of the uploaded package bytes, hex encoded.
    pub content_hash: String,
    pub environment: HashMap<String, String>,
    /// Private bridge network owned by this deployment.
    pub network: String,
    /// Ordered replica handles, destroyed together with the deployment.
    pub replicas: Vec<ReplicaHandle>,
    /// Image built for this deployment, one build per deploy.
    pub image_ref: String,
}

impl FunctionDeployment {
    pub fn replica_addrs(&self) -> Vec<String> {
        self.replicas.iter().map(|r| r.addr.clone()).collect()
    }
}

/// The shared ingress container's identity and its address on the shared
/// network. Process-wide singleton created at startup.
#[derive(Debug, Clone)]
pub struct IngressEndpoint {
    pub container_id: String,
    pub container_name: String,
    pub network: String,
    pub addr: String,
    pub control_port: u16,
}

/// Where the function package bytes come from.
#[derive(Debug, Clone)]
pub enum PackageSource {
    Archive(Vec<u8>),
    Url(String),
}

/// Validated parameters of a deploy operation.
#[derive(Debug, Clone)]
pub struct DeploySpec {
    pub name: String,
    pub replica_count: usize,
    pub environment: HashMap<String, String>,
    pub source: PackageSource,
    pub subfolder_path: Option<String>,
}

impl DeploySpec {
    pub fn resource_path(&self) -> String {
        format!("/{}", self.name)
    }
}

/// Function names become container and network name prefixes, so they are
/// restricted to what the engine accepts there.
pub fn valid_function_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_function_names() {
        assert!(valid_function_name("echo"));
        assert!(valid_function_name("sieve-of-eratosthenes"));
        assert!(valid_function_name("fn2"));
    }

    #[test]
    fn test_invalid_function_names() {
        assert!(!valid_function_name(""));
        assert!(!valid_function_name("-echo"));
        assert!(!valid_function_name("echo fn"));
        assert!(!valid_function_name("echo/../etc"));
        assert!(!valid_function_name("fn_underscore"));
    }

    #[test]
    fn test_resource_path() {
        let spec = DeploySpec {
            name: "echo".to_string(),
            replica_count: 1,
            environment: HashMap::new(),
            source: PackageSource::Archive(vec![]),
            subfolder_path: None,
        };
        assert_eq!(spec.resource_path(), "/echo");
    }
}
