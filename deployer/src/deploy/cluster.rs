use async_trait::async_trait;
use flowplane_common::backends::client::ServicesApiClient;
use flowplane_common::models::deployment::DeploymentConfig;
use http::{Method, StatusCode};
use serde::Deserialize;

use crate::build::StageError;

use super::{DeployStrategy, ServiceSpec, ServiceState, RUNTIME_PORT};

/// Deploys a workload + service manifest onto a container cluster.
pub struct Cluster {
    api: ServicesApiClient,
    namespace: String,
    token: String,
}

#[derive(Deserialize)]
struct WorkloadStatus {
    #[serde(default)]
    ready_replicas: u32,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    failed: bool,
    #[serde(default)]
    message: Option<String>,
}

impl Cluster {
    pub fn new(api: ServicesApiClient, namespace: String, token: String) -> Self {
        Self {
            api,
            namespace,
            token,
        }
    }
}

#[async_trait]
impl DeployStrategy for Cluster {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), StageError> {
        let manifest = serde_json::json!({
            "workload": {
                "name": spec.service_name,
                "image": spec.image,
                "port": RUNTIME_PORT,
                "replicas": {
                    "min": spec.config.min_replicas.max(1),
                    "max": spec.config.max_replicas.max(1),
                },
            },
            "service": {
                "name": spec.service_name,
                "target_port": RUNTIME_PORT,
            },
        });

        // PUT has apply semantics on the cluster API, so resumed pipelines
        // converge on the same manifest instead of erroring.
        self.api
            .request::<_, serde_json::Value>(
                Method::PUT,
                &format!("namespaces/{}/workloads/{}", self.namespace, spec.service_name),
                Some(&manifest),
                Some(&self.token),
            )
            .await
            .map(|_| ())
            .map_err(StageError::from)
    }

    async fn get_state(
        &self,
        service_name: &str,
        config: &DeploymentConfig,
    ) -> Result<ServiceState, StageError> {
        let status: WorkloadStatus = self
            .api
            .request::<(), _>(
                Method::GET,
                &format!("namespaces/{}/workloads/{service_name}/status", self.namespace),
                None,
                Some(&self.token),
            )
            .await?;

        if status.failed {
            return Ok(ServiceState::Failed {
                reason: status
                    .message
                    .unwrap_or_else(|| "workload failed to roll out".to_string()),
            });
        }

        // Ready once the deployment's replica floor is met and the service
        // has an address. A floor of zero is satisfied vacuously.
        match (status.ready_replicas, status.url) {
            (replicas, Some(url)) if replicas >= config.min_replicas => {
                Ok(ServiceState::Ready { url })
            }
            _ => Ok(ServiceState::Progressing),
        }
    }

    async fn delete_service(&self, service_name: &str) -> Result<(), StageError> {
        let response: Result<serde_json::Value, _> = self
            .api
            .request::<(), _>(
                Method::DELETE,
                &format!("namespaces/{}/workloads/{service_name}", self.namespace),
                None,
                Some(&self.token),
            )
            .await;

        match response {
            Ok(_) => Ok(()),
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
