//! Deployment orchestration.
//!
//! The orchestrator owns every engine-side side effect: image builds,
//! private networks, replica containers and ingress registration. Deploys,
//! deletes and wipes serialize on the registry's mutation lock; read paths
//! (list, logs) never take it.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use bollard::{
    container::{ListContainersOptions, RemoveContainerOptions},
    Docker,
};
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    data_model::{DeploySpec, FunctionDeployment, IngressEndpoint, FUNCTION_LABEL},
    error::{Error, Result},
    registry::FunctionRegistry,
};

pub mod image;
pub mod ingress;
pub mod network;
pub mod replica;
pub mod workspace;

use image::ImageBuilder;
use ingress::IngressClient;
use network::NetworkFabric;
use replica::ReplicaManager;
use workspace::{StagedPackage, WorkspaceManager};

/// True when the engine reports the resource as absent.
pub(crate) fn engine_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// True when a removal can be treated as done: the resource is absent or
/// its removal is already in progress.
pub(crate) fn engine_gone(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

/// Engine resources created so far by an in-flight deploy, recorded so a
/// failure at any step can undo the previous ones.
#[derive(Default)]
struct PartialDeployment {
    image: Option<String>,
    replicas: Vec<crate::data_model::ReplicaHandle>,
}

pub struct Orchestrator {
    docker: Arc<Docker>,
    registry: FunctionRegistry,
    workspace: WorkspaceManager,
    images: ImageBuilder,
    fabric: Arc<NetworkFabric>,
    replicas: ReplicaManager,
    ingress: IngressClient,
    endpoint: IngressEndpoint,
    deploy_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        config: &ServerConfig,
        docker: Arc<Docker>,
        fabric: Arc<NetworkFabric>,
        endpoint: IngressEndpoint,
    ) -> Result<Self> {
        let workspace = WorkspaceManager::new(&config.tmp_dir)?;
        let images = ImageBuilder::new(docker.clone(), &config.runtime_template_dir);
        let replicas = ReplicaManager::new(
            docker.clone(),
            fabric.clone(),
            config.replica_ready_retries,
        );
        let ingress = IngressClient::new(
            &endpoint,
            Duration::from_secs(config.registration_timeout_secs),
        )?;
        Ok(Orchestrator {
            docker,
            registry: FunctionRegistry::new(),
            workspace,
            images,
            fabric: fabric.clone(),
            replicas,
            ingress,
            endpoint,
            deploy_timeout: Duration::from_secs(config.deploy_timeout_secs),
        })
    }

    /// Deploy a function, replacing any existing deployment with the same
    /// name. The existing deployment is destroyed before the new one is
    /// provisioned; a provisioning failure therefore leaves the name
    /// undeployed, never half-and-half. A successful redeploy keeps the
    /// function's position in the listing order.
    pub async fn deploy(&self, spec: DeploySpec) -> Result<Arc<FunctionDeployment>> {
        let _guard = self.registry.lock_mutations().await;

        let prior_position = match self.registry.get(&spec.name).await {
            Some(existing) => {
                info!(function = spec.name, "replacing existing deployment");
                self.destroy(&existing).await?;
                self.registry
                    .remove(&spec.name)
                    .await
                    .map(|(_, position)| position)
            }
            None => None,
        };

        let staged = self
            .workspace
            .stage(&spec.source, spec.subfolder_path.as_deref())
            .await?;

        let mut partial = PartialDeployment::default();
        let outcome = tokio::time::timeout(
            self.deploy_timeout,
            self.provision(&spec, &staged, &mut partial),
        )
        .await;
        self.workspace.discard(&staged);

        let deployment = match outcome {
            Ok(Ok(deployment)) => deployment,
            Ok(Err(e)) => {
                self.rollback(&spec.name, partial).await;
                return Err(e);
            }
            Err(_) => {
                self.rollback(&spec.name, partial).await;
                return Err(Error::Internal(anyhow::anyhow!(
                    "deploy of {} timed out after {:?}",
                    spec.name,
                    self.deploy_timeout
                )));
            }
        };

        self.registry.commit(deployment, prior_position).await;
        let committed = self
            .registry
            .get(&spec.name)
            .await
            .context("deployment vanished after commit")?;
        info!(
            function = committed.name,
            hash = committed.content_hash,
            replicas = committed.replica_count,
            "function deployed"
        );
        Ok(committed)
    }

    async fn provision(
        &self,
        spec: &DeploySpec,
        staged: &StagedPackage,
        partial: &mut PartialDeployment,
    ) -> Result<FunctionDeployment> {
        let image = self.images.build(&spec.name, &staged.source_dir).await?;
        partial.image = Some(image.clone());

        let network = self.fabric.create_function_network(&spec.name).await?;
        self.fabric
            .connect(&network, &self.endpoint.container_id)
            .await?;

        let replicas = self
            .replicas
            .start_replicas(
                &spec.name,
                &image,
                &network,
                spec.replica_count,
                &spec.environment,
            )
            .await?;
        partial.replicas = replicas.clone();

        let resource_path = spec.resource_path();
        let addrs = replicas.iter().map(|r| r.addr.clone()).collect();
        self.ingress.register(&resource_path, addrs).await?;

        Ok(FunctionDeployment {
            name: spec.name.clone(),
            resource_path,
            replica_count: spec.replica_count,
            content_hash: staged.content_hash.clone(),
            environment: spec.environment.clone(),
            network,
            replicas,
            image_ref: image,
        })
    }

    /// Undo a failed deploy. Removes the recorded replicas plus anything
    /// else labelled for the function (covers containers created before
    /// their handle was recorded), then the network and the image. The
    /// network is destroyed by its derived name rather than a recorded
    /// handle: a timeout cancels provisioning at an await point, and the
    /// engine can complete a network create whose result was never
    /// observed.
    async fn rollback(&self, function: &str, partial: PartialDeployment) {
        warn!(function, "rolling back failed deploy");
        self.replicas.stop_replicas(&partial.replicas).await;
        self.remove_labelled_containers(function).await;
        let network = network::function_network_name(function);
        if let Err(e) = self.fabric.destroy_network(&network).await {
            warn!(function, network, "rollback failed to remove network: {e}");
        }
        if let Some(image) = partial.image {
            self.images.remove(&image).await;
        }
    }

    async fn remove_labelled_containers(&self, function: &str) {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{FUNCTION_LABEL}={function}")],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = match self.docker.list_containers(Some(options)).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(function, "failed to list function containers: {e}");
                return;
            }
        };
        for container in containers {
            let Some(id) = container.id else { continue };
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match self.docker.remove_container(&id, Some(options)).await {
                Ok(()) => {}
                Err(e) if engine_gone(&e) => {}
                Err(e) => warn!(function, container = id, "failed to remove container: {e}"),
            }
        }
    }

    /// Delete a deployment by name. `Err(NotFound)` if the name is unknown.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.registry.lock_mutations().await;
        let Some(deployment) = self.registry.get(name).await else {
            return Err(Error::NotFound(name.to_string()));
        };
        self.destroy(&deployment).await?;
        self.registry.remove(name).await;
        info!(function = name, "function deleted");
        Ok(())
    }

    /// Delete every deployment. Failures are collected so one stuck
    /// function does not shield the rest from removal.
    pub async fn wipe(&self) -> Result<()> {
        let _guard = self.registry.lock_mutations().await;
        self.wipe_locked().await
    }

    async fn wipe_locked(&self) -> Result<()> {
        let mut failures = Vec::new();
        for deployment in self.registry.snapshot().await {
            match self.destroy(&deployment).await {
                Ok(()) => {
                    self.registry.remove(&deployment.name).await;
                }
                Err(e) => failures.push(format!("{}: {e}", deployment.name)),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(anyhow::anyhow!(
                "wipe left deployments behind: {}",
                failures.join("; ")
            )))
        }
    }

    /// Tear down a deployment's engine footprint: deregister from the
    /// ingress first so no new calls route to dying replicas, then remove
    /// replicas, network and image.
    async fn destroy(&self, deployment: &FunctionDeployment) -> Result<()> {
        self.ingress.deregister(&deployment.resource_path).await?;
        self.replicas.stop_replicas(&deployment.replicas).await;
        self.remove_labelled_containers(&deployment.name).await;
        self.fabric.destroy_network(&deployment.network).await?;
        self.images.remove(&deployment.image_ref).await;
        Ok(())
    }

    pub async fn list(&self) -> Vec<Arc<FunctionDeployment>> {
        self.registry.snapshot().await
    }

    /// Log lines of one function's replicas, or of every deployment when
    /// `name` is `None`.
    pub async fn logs(&self, name: Option<&str>) -> Result<Vec<String>> {
        let deployments = match name {
            Some(name) => {
                let deployment = self
                    .registry
                    .get(name)
                    .await
                    .ok_or_else(|| Error::NotFound(name.to_string()))?;
                vec![deployment]
            }
            None => self.registry.snapshot().await,
        };
        let mut lines = Vec::new();
        for deployment in deployments {
            lines.extend(
                self.replicas
                    .collect_logs(&deployment.name, &deployment.replicas)
                    .await,
            );
        }
        Ok(lines)
    }

    /// Best-effort full teardown on shutdown: every deployment, then the
    /// ingress container and shared network.
    pub async fn shutdown(&self) {
        let _guard = self.registry.lock_mutations().await;
        if let Err(e) = self.wipe_locked().await {
            warn!("shutdown wipe incomplete: {e}");
        }
        ingress::teardown(&self.docker, &self.fabric, &self.endpoint).await;
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::ServerConfig;

    fn test_orchestrator(tmp: &TempDir) -> Orchestrator {
        let config = ServerConfig {
            tmp_dir: tmp.path().join("staging").to_string_lossy().into_owned(),
            runtime_template_dir: tmp.path().join("template").to_string_lossy().into_owned(),
            replica_ready_retries: 0,
            ..Default::default()
        };
        let docker = Arc::new(Docker::connect_with_local_defaults().unwrap());
        let fabric = Arc::new(NetworkFabric::new(docker.clone()));
        let endpoint = IngressEndpoint {
            container_id: "ingress-id".to_string(),
            container_name: "test-ingress".to_string(),
            network: "endpoint-net".to_string(),
            addr: "127.0.0.1".to_string(),
            control_port: 80,
        };
        Orchestrator::new(&config, docker, fabric, endpoint).unwrap()
    }

    // A timed-out deploy can leave a network the provisioning future never
    // got to record. Rollback must target the derived network name and
    // complete even with an empty partial record.
    #[tokio::test]
    async fn test_rollback_without_recorded_resources_completes() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = test_orchestrator(&tmp);
        orchestrator
            .rollback("ghost", PartialDeployment::default())
            .await;
    }
}
