use std::{env, fmt::Debug, net::SocketAddr};

use anyhow::Result;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Settings for the shared ingress (reverse-proxy) container that every
/// deployment registers its replica addresses with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Image the ingress container is started from.
    #[serde(default = "default_ingress_image")]
    pub image: String,
    #[serde(default = "default_ingress_container")]
    pub container_name: String,
    /// Name of the shared network the ingress and the orchestrator sit on.
    #[serde(default = "default_ingress_network")]
    pub network: String,
    /// Port the ingress accepts registration pushes on, reachable over the
    /// shared network.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Host ports published for each ingress protocol. 0 disables the
    /// protocol entirely.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    #[serde(default = "default_coap_port")]
    pub coap_port: u16,
}

impl Default for IngressConfig {
    fn default() -> Self {
        IngressConfig {
            image: default_ingress_image(),
            container_name: default_ingress_container(),
            network: default_ingress_network(),
            control_port: default_control_port(),
            http_port: default_http_port(),
            grpc_port: default_grpc_port(),
            coap_port: default_coap_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the management API listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Docker daemon address. Supports:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    ///
    /// If not specified, uses Docker's default socket location.
    #[serde(default)]
    pub docker_addr: Option<String>,
    /// Staging area for uploaded function packages.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: String,
    /// Directory holding the handler-runtime template (Dockerfile plus the
    /// language bootstrap that loads and serves the function code).
    #[serde(default = "default_template_dir")]
    pub runtime_template_dir: String,
    /// Name of the container this process runs in, if any. When set, the
    /// orchestrator connects it to the shared ingress network so the
    /// registration protocol can reach the ingress by address.
    #[serde(default)]
    pub self_container: Option<String>,
    #[serde(default)]
    pub ingress: IngressConfig,
    /// Upper bound on a single deploy's engine work (build, network,
    /// replica start, registration). A timed-out deploy is rolled back.
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,
    /// How many times to poll a replica's health endpoint before declaring
    /// the start failed. 0 disables readiness probing.
    #[serde(default = "default_ready_retries")]
    pub replica_ready_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: default_listen_addr(),
            docker_addr: None,
            tmp_dir: default_tmp_dir(),
            runtime_template_dir: default_template_dir(),
            self_container: None,
            ingress: IngressConfig::default(),
            deploy_timeout_secs: default_deploy_timeout(),
            registration_timeout_secs: default_registration_timeout(),
            replica_ready_retries: default_ready_retries(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.ingress.control_port == 0 {
            return Err(anyhow::anyhow!("ingress control port must not be 0"));
        }
        if self.deploy_timeout_secs == 0 {
            return Err(anyhow::anyhow!("deploy timeout must be at least 1 second"));
        }
        Ok(())
    }

    /// Apply the `HTTP_PORT`, `GRPC_PORT` and `COAP_PORT` environment
    /// variables to the ingress port selection. 0 disables a protocol.
    pub fn apply_env_overrides(&mut self) {
        self.apply_port_overrides(|var| env::var(var).ok());
    }

    fn apply_port_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (var, port) in [
            ("HTTP_PORT", &mut self.ingress.http_port),
            ("GRPC_PORT", &mut self.ingress.grpc_port),
            ("COAP_PORT", &mut self.ingress.coap_port),
        ] {
            if let Some(value) = lookup(var).and_then(|v| v.parse::<u16>().ok()) {
                *port = value;
            }
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_tmp_dir() -> String {
    "./tmp".to_string()
}

fn default_template_dir() -> String {
    "./handler-runtime".to_string()
}

fn default_ingress_image() -> String {
    "nimbus/ingress:latest".to_string()
}

fn default_ingress_container() -> String {
    "nimbus-ingress".to_string()
}

fn default_ingress_network() -> String {
    "endpoint-net".to_string()
}

fn default_control_port() -> u16 {
    80
}

fn default_http_port() -> u16 {
    8000
}

fn default_grpc_port() -> u16 {
    9000
}

fn default_coap_port() -> u16 {
    5683
}

fn default_deploy_timeout() -> u64 {
    300
}

fn default_registration_timeout() -> u64 {
    5
}

fn default_ready_retries() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let config = ServerConfig {
            listen_addr: "not an address".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
listen_addr: "127.0.0.1:9090"
ingress:
  http_port: 8081
  grpc_port: 0
"#;
        let config: ServerConfig = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.ingress.http_port, 8081);
        assert_eq!(config.ingress.grpc_port, 0);
        assert_eq!(config.ingress.coap_port, default_coap_port());
        assert_eq!(config.tmp_dir, default_tmp_dir());
    }

    #[test]
    fn test_port_env_overrides() {
        let mut config = ServerConfig::default();
        config.apply_port_overrides(|var| match var {
            "HTTP_PORT" => Some("8888".to_string()),
            "COAP_PORT" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.ingress.http_port, 8888);
        assert_eq!(config.ingress.coap_port, 0);
        assert_eq!(config.ingress.grpc_port, default_grpc_port());
    }

    #[test]
    fn test_non_numeric_env_override_ignored() {
        let mut config = ServerConfig::default();
        config.apply_port_overrides(|var| match var {
            "HTTP_PORT" => Some("eighty".to_string()),
            _ => None,
        });
        assert_eq!(config.ingress.http_port, default_http_port());
    }
}
