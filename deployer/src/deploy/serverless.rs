use async_trait::async_trait;
use flowplane_common::backends::client::ServicesApiClient;
use flowplane_common::models::deployment::DeploymentConfig;
use http::{Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::build::StageError;

use super::{DeployStrategy, ServiceSpec, ServiceState, RUNTIME_PORT};

/// Deploys to a managed serverless container platform.
pub struct Serverless {
    api: ServicesApiClient,
    token: String,
}

#[derive(Deserialize)]
struct ServiceStatus {
    status: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl Serverless {
    pub fn new(api: ServicesApiClient, token: String) -> Self {
        Self { api, token }
    }
}

#[async_trait]
impl DeployStrategy for Serverless {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), StageError> {
        let body = serde_json::json!({
            "name": spec.service_name,
            "image": spec.image,
            "port": RUNTIME_PORT,
            "concurrency": spec.config.concurrency,
            "min_instances": spec.config.min_replicas,
            "max_instances": spec.config.max_replicas,
        });

        let response: Result<serde_json::Value, _> = self
            .api
            .request(Method::POST, "v1/services", Some(&body), Some(&self.token))
            .await;

        match response {
            Ok(_) => Ok(()),
            Err(err) if err.status() == Some(StatusCode::CONFLICT) => {
                debug!(service = %spec.service_name, "service already exists, re-attaching");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    // The platform's own status field is authoritative; the replica bounds
    // were handed over at creation.
    async fn get_state(
        &self,
        service_name: &str,
        _config: &DeploymentConfig,
    ) -> Result<ServiceState, StageError> {
        let service: ServiceStatus = self
            .api
            .request::<(), _>(
                Method::GET,
                &format!("v1/services/{service_name}"),
                None,
                Some(&self.token),
            )
            .await?;

        match service.status.as_str() {
            "ready" => {
                let url = service.url.ok_or_else(|| {
                    StageError::Transient("service is ready but has no url yet".to_string())
                })?;
                Ok(ServiceState::Ready { url })
            }
            "deploying" | "provisioning" | "pending" => Ok(ServiceState::Progressing),
            other => Ok(ServiceState::Failed {
                reason: service
                    .message
                    .unwrap_or_else(|| format!("platform reports '{other}'")),
            }),
        }
    }

    async fn delete_service(&self, service_name: &str) -> Result<(), StageError> {
        let response: Result<serde_json::Value, _> = self
            .api
            .request::<(), _>(
                Method::DELETE,
                &format!("v1/services/{service_name}"),
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
