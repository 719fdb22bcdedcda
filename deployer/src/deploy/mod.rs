use async_trait::async_trait;
use flowplane_common::models::deployment::DeploymentConfig;

mod cluster;
mod serverless;

pub use cluster::Cluster;
pub use serverless::Serverless;

use crate::build::StageError;

/// The container port every agent runtime listens on.
pub const RUNTIME_PORT: u16 = 8080;

/// What a deploy target is asked to run.
pub struct ServiceSpec {
    /// `agent-runtime-<deployment_id>`; doubles as the idempotency key.
    pub service_name: String,
    pub image: String,
    pub config: DeploymentConfig,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServiceState {
    Progressing,
    Ready { url: String },
    Failed { reason: String },
}

/// One of the two pluggable deploy targets.
#[async_trait]
pub trait DeployStrategy: Send + Sync {
    /// Create the platform service. "Already exists" is success: the existing
    /// service is re-attached by its deterministic name.
    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), StageError>;

    /// Readiness of the named service against the deployment's bounds: the
    /// cluster target is only ready once `ready_replicas >= min_replicas`.
    async fn get_state(
        &self,
        service_name: &str,
        config: &DeploymentConfig,
    ) -> Result<ServiceState, StageError>;

    /// Tear the service down. A missing service is success.
    async fn delete_service(&self, service_name: &str) -> Result<(), StageError>;
}
