use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Running,
    Failed,
    Stopped,
}

impl DeploymentStatus {
    /// Whether this status allows a transition to `next`.
    ///
    /// ```text
    /// pending ─► deploying ─► running ─► stopped
    ///    │          │           │
    ///    ▼          ▼           ▼
    ///  failed     failed      failed
    /// ```
    ///
    /// `pending` may also go straight to `stopped`: stopping before a worker
    /// picked the row up never touches the platform.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;

        matches!(
            (self, next),
            (Pending, Deploying)
                | (Pending, Stopped)
                | (Pending, Failed)
                | (Deploying, Running)
                | (Deploying, Stopped)
                | (Deploying, Failed)
                | (Running, Stopped)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Running | DeploymentStatus::Failed | DeploymentStatus::Stopped
        )
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BuildStrategyKind {
    CiDriven,
    HostedBuild,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeployStrategyKind {
    Serverless,
    Cluster,
}

/// Runtime bounds applied to the deployed service.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeploymentConfig {
    #[serde(default = "DeploymentConfig::default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "DeploymentConfig::default_min_replicas")]
    pub min_replicas: u32,
    #[serde(default = "DeploymentConfig::default_max_replicas")]
    pub max_replicas: u32,
}

impl DeploymentConfig {
    fn default_concurrency() -> u32 {
        80
    }

    fn default_min_replicas() -> u32 {
        0
    }

    fn default_max_replicas() -> u32 {
        1
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            concurrency: Self::default_concurrency(),
            min_replicas: Self::default_min_replicas(),
            max_replicas: Self::default_max_replicas(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreateDeploymentRequest {
    pub agent_id: Uuid,
    pub agent_version_id: Uuid,
    #[serde(default)]
    pub build_strategy: Option<BuildStrategyKind>,
    #[serde(default)]
    pub deploy_strategy: Option<DeployStrategyKind>,
    #[serde(default)]
    pub deployment_config: Option<DeploymentConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeploymentResponse {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub agent_id: Uuid,
    pub agent_version_id: Uuid,
    pub status: DeploymentStatus,
    pub endpoint_url: Option<String>,
    /// Platform-specific resumption markers (`build_job_id`, `image_tag`,
    /// `platform_service_name`).
    pub metadata: serde_json::Value,
    pub error_message: Option<String>,
    pub build_strategy: BuildStrategyKind,
    pub deploy_strategy: DeployStrategyKind,
    pub deployed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TransitionResponse {
    pub deployment_id: Uuid,
    pub from_status: Option<DeploymentStatus>,
    pub to_status: DeploymentStatus,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeploymentFilters {
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<DeploymentStatus>,
}
