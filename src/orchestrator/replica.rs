//! Replica container lifecycle.
//!
//! A deployment runs `replica_count` containers of the same image, named
//! `<function>-<ordinal>`, attached only to the function's private network.
//! Start is all-or-nothing: if any replica fails to start or never becomes
//! ready, the ones already running are removed before the error surfaces.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bollard::{
    container::{
        Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
        StartContainerOptions,
    },
    service::HostConfig,
    Docker,
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::{
    data_model::{platform_labels, ReplicaHandle, PLATFORM_ENV_VALUE, PLATFORM_ENV_VAR},
    error::{Error, Result},
};

use super::network::NetworkFabric;

/// Port the handler runtime serves on inside the container, also used for
/// readiness probing.
const HANDLER_PORT: u16 = 8000;
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct ReplicaManager {
    docker: Arc<Docker>,
    fabric: Arc<NetworkFabric>,
    http: reqwest::Client,
    ready_retries: u32,
}

impl ReplicaManager {
    pub fn new(docker: Arc<Docker>, fabric: Arc<NetworkFabric>, ready_retries: u32) -> Self {
        ReplicaManager {
            docker,
            fabric,
            http: reqwest::Client::new(),
            ready_retries,
        }
    }

    pub async fn start_replicas(
        &self,
        function: &str,
        image: &str,
        network: &str,
        count: usize,
        environment: &HashMap<String, String>,
    ) -> Result<Vec<ReplicaHandle>> {
        let mut handles = Vec::with_capacity(count);
        for ordinal in 0..count {
            match self
                .start_one(function, image, network, ordinal, environment)
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.stop_replicas(&handles).await;
                    return Err(Error::ReplicaStartFailed(e.to_string()));
                }
            }
        }
        if self.ready_retries > 0 {
            for handle in &handles {
                if let Err(e) = self.await_ready(function, handle).await {
                    self.stop_replicas(&handles).await;
                    return Err(Error::ReplicaStartFailed(e.to_string()));
                }
            }
        }
        Ok(handles)
    }

    async fn start_one(
        &self,
        function: &str,
        image: &str,
        network: &str,
        ordinal: usize,
        environment: &HashMap<String, String>,
    ) -> anyhow::Result<ReplicaHandle> {
        let container_name = format!("{function}-{ordinal}");
        let mut env: Vec<String> = environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        env.push(format!("{PLATFORM_ENV_VAR}={PLATFORM_ENV_VALUE}"));

        let config = Config::<String> {
            image: Some(image.to_string()),
            env: Some(env),
            labels: Some(platform_labels(function)),
            host_config: Some(HostConfig {
                network_mode: Some(network.to_string()),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await?;
        let addr = self.fabric.resolve_member_addr(network, &created.id).await?;

        info!(
            function,
            replica = container_name,
            addr,
            "started replica container"
        );
        Ok(ReplicaHandle {
            container_id: created.id,
            container_name,
            addr,
        })
    }

    /// Poll the replica's health endpoint until it answers or the retry
    /// budget runs out. Probing runs from inside the function's network
    /// namespace in spirit: the address is only routable because this
    /// process sits on the same bridge.
    async fn await_ready(&self, function: &str, handle: &ReplicaHandle) -> anyhow::Result<()> {
        let url = format!("http://{}:{HANDLER_PORT}/health", handle.addr);
        for attempt in 1..=self.ready_retries {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(function, replica = handle.container_name, "replica ready");
                    return Ok(());
                }
                Ok(response) => {
                    debug!(
                        function,
                        replica = handle.container_name,
                        attempt,
                        "health probe returned {}",
                        response.status()
                    );
                }
                Err(e) => {
                    debug!(
                        function,
                        replica = handle.container_name,
                        attempt,
                        "health probe failed: {e}"
                    );
                }
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        for line in self.replica_logs(function, handle).await {
            warn!("{line}");
        }
        anyhow::bail!(
            "replica {} did not become ready after {} probes",
            handle.container_name,
            self.ready_retries
        )
    }

    /// Remove the given replica containers. Absent containers and removals
    /// already in progress are not errors.
    pub async fn stop_replicas(&self, handles: &[ReplicaHandle]) {
        for handle in handles {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match self
                .docker
                .remove_container(&handle.container_name, Some(options))
                .await
            {
                Ok(()) => debug!(replica = handle.container_name, "removed replica container"),
                Err(e) if super::engine_gone(&e) => {}
                Err(e) => warn!(
                    replica = handle.container_name,
                    "failed to remove replica container: {e}"
                ),
            }
        }
    }

    /// Collected log lines of a deployment's replicas, each prefixed with
    /// the function and replica it came from.
    pub async fn collect_logs(&self, function: &str, handles: &[ReplicaHandle]) -> Vec<String> {
        let mut lines = Vec::new();
        for handle in handles {
            lines.extend(self.replica_logs(function, handle).await);
        }
        lines
    }

    async fn replica_logs(&self, function: &str, handle: &ReplicaHandle) -> Vec<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(&handle.container_name, Some(options));
        let mut lines = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(output) => {
                    for line in output.to_string().lines() {
                        lines.push(format!(
                            "function={function} replica={} {line}",
                            handle.container_name
                        ));
                    }
                }
                Err(e) => {
                    warn!(
                        replica = handle.container_name,
                        "failed to read replica logs: {e}"
                    );
                    break;
                }
            }
        }
        lines
    }
}
