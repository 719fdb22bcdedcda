use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowplane_common::backends::client::CatalogApiClient;
use flowplane_common::models::deployment::{
    BuildStrategyKind, DeployStrategyKind, DeploymentStatus,
};
use flowplane_common::models::error::Error;
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::build::{materialize, BuildPoll, BuildStrategy, ContextSettings, StageError};
use crate::dal::{Dal, Deployment};
use crate::deploy::{DeployStrategy, ServiceSpec, ServiceState};
use crate::registry::RegistryCheck;

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Lease duration; renewed during long polls.
    pub lease: Duration,
    /// First poll interval against external build/deploy APIs.
    pub poll_initial: Duration,
    /// Poll backoff cap.
    pub poll_max: Duration,
    /// Deadline for one pipeline stage.
    pub stage_deadline: Duration,
    /// Wall-clock deadline from `pending` to any terminal state.
    pub pipeline_deadline: Duration,
    /// Retry budget for transient failures within a stage.
    pub max_attempts: u32,
    /// Sleep between empty lease polls.
    pub idle_backoff: Duration,
    /// Registry prefix images are pushed under, e.g. `registry.example.com/agents`.
    pub registry_base: String,
    pub context: ContextSettings,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            poll_initial: Duration::from_secs(5),
            poll_max: Duration::from_secs(30),
            stage_deadline: Duration::from_secs(300),
            pipeline_deadline: Duration::from_secs(900),
            max_attempts: 5,
            idle_backoff: Duration::from_secs(1),
            registry_base: "registry.invalid/agents".to_string(),
            context: ContextSettings {
                runtime_image: "registry.invalid/flowplane/agent-runtime:latest".to_string(),
            },
        }
    }
}

/// Where the worker reads flow documents from.
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn flow_config(
        &self,
        agent_id: Uuid,
        version_id: Uuid,
    ) -> Result<serde_json::Value, StageError>;
}

#[async_trait]
impl VersionSource for CatalogApiClient {
    async fn flow_config(
        &self,
        agent_id: Uuid,
        version_id: Uuid,
    ) -> Result<serde_json::Value, StageError> {
        self.get_version(agent_id, version_id, None)
            .await
            .map(|version| version.config)
            .map_err(StageError::from)
    }
}

enum Outcome {
    Running(String),
    Stopped,
    NothingToDo,
}

enum Interrupt {
    /// A stage failed for good; the deployment goes to `failed`.
    Stage(StageError),
    /// The stop flag was observed between stages.
    Cancelled,
    /// The stage or pipeline deadline passed.
    TimedOut,
    /// The store failed or the lease was lost; leave the row for re-lease.
    Dal(Error),
}

impl From<Error> for Interrupt {
    fn from(err: Error) -> Self {
        Interrupt::Dal(err)
    }
}

/// A deployment pipeline worker.
///
/// Workers coordinate exclusively through the lease columns on the
/// deployments table: at most one worker holds a deployment at a time, and a
/// crashed worker's row is picked up after lease expiry. Every stage records
/// a resumption marker in the deployment metadata before it talks to an
/// external system, so a takeover re-attaches instead of duplicating external
/// resources.
pub struct Worker {
    id: String,
    dal: Arc<dyn Dal>,
    versions: Arc<dyn VersionSource>,
    builds: HashMap<BuildStrategyKind, Arc<dyn BuildStrategy>>,
    deploys: HashMap<DeployStrategyKind, Arc<dyn DeployStrategy>>,
    registry: Arc<dyn RegistryCheck>,
    settings: WorkerSettings,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        dal: Arc<dyn Dal>,
        versions: Arc<dyn VersionSource>,
        builds: HashMap<BuildStrategyKind, Arc<dyn BuildStrategy>>,
        deploys: HashMap<DeployStrategyKind, Arc<dyn DeployStrategy>>,
        registry: Arc<dyn RegistryCheck>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            dal,
            versions,
            builds,
            deploys,
            registry,
            settings,
        }
    }

    /// Lease and process deployments until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        info!(worker = %self.id, "deployment worker started");

        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.settings.idle_backoff).await,
                Err(err) => {
                    error!(error = %err, "worker failed to lease");
                    tokio::time::sleep(self.settings.idle_backoff).await;
                }
            }
        }
    }

    /// Lease at most one deployment and drive it. Returns whether any work
    /// was found.
    pub async fn run_once(&self) -> Result<bool, Error> {
        let Some(deployment) = self.dal.lease_next(&self.id, self.settings.lease).await? else {
            return Ok(false);
        };

        self.process(deployment).await;

        Ok(true)
    }

    #[instrument(skip(self, deployment), fields(deployment_id = %deployment.id, worker = %self.id))]
    async fn process(&self, deployment: Deployment) {
        let id = deployment.id;

        match self.advance(deployment).await {
            Ok(Outcome::Running(url)) => info!(%url, "deployment is running"),
            Ok(Outcome::Stopped) => info!("deployment stopped"),
            Ok(Outcome::NothingToDo) => {}
            Err(Interrupt::Cancelled) => match self.teardown_and_stop(id).await {
                Ok(()) => info!("deployment stopped on request"),
                Err(err) => error!(error = %err, "failed to stop deployment"),
            },
            Err(Interrupt::TimedOut) => {
                warn!("pipeline deadline exceeded");
                self.fail(id, "timeout".to_string()).await;
            }
            Err(Interrupt::Stage(err)) => {
                warn!(error = %err, "pipeline stage failed");
                self.fail(id, err.to_string()).await;
            }
            Err(Interrupt::Dal(err)) => {
                // Leave the row alone: the lease will expire and another
                // worker resumes from the recorded markers.
                error!(error = %err, "store error mid-pipeline, leaving for re-lease");
            }
        }

        if let Err(err) = self.dal.release_lease(id, &self.id).await {
            warn!(error = %err, "failed to release lease");
        }
    }

    async fn advance(&self, mut deployment: Deployment) -> Result<Outcome, Interrupt> {
        let id = deployment.id;

        if deployment.status.is_terminal() && !deployment.stop_requested {
            return Ok(Outcome::NothingToDo);
        }
        if deployment.stop_requested {
            return Err(Interrupt::Cancelled);
        }

        let pipeline_deadline = deployment.created_at
            + chrono::Duration::from_std(self.settings.pipeline_deadline)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));

        if deployment.status == DeploymentStatus::Pending {
            deployment = self
                .dal
                .transition(id, DeploymentStatus::Deploying, Some("pipeline started".to_string()), None, None)
                .await?;
        }

        let build = self
            .builds
            .get(&deployment.build_strategy)
            .cloned()
            .ok_or_else(|| {
                Interrupt::Stage(StageError::Fatal(format!(
                    "build strategy '{}' is not configured",
                    deployment.build_strategy
                )))
            })?;
        let deploy = self
            .deploys
            .get(&deployment.deploy_strategy)
            .cloned()
            .ok_or_else(|| {
                Interrupt::Stage(StageError::Fatal(format!(
                    "deploy strategy '{}' is not configured",
                    deployment.deploy_strategy
                )))
            })?;

        // Stage: materialize the build context and submit the build, unless a
        // previous attempt already has a job to re-attach to.
        let image_tag = match deployment.marker("image_tag") {
            Some(tag) => tag,
            None => {
                let tag = format!(
                    "{}/agent-{}:{}",
                    self.settings.registry_base, deployment.agent_id, deployment.id
                );
                deployment = self
                    .dal
                    .merge_metadata(id, json!({ "image_tag": tag }))
                    .await?;
                tag
            }
        };

        let build_job_id = match deployment.marker("build_job_id") {
            Some(job_id) => job_id,
            None => {
                self.check_cancel(id).await?;

                let stage_deadline = self.stage_deadline(pipeline_deadline);
                let flow = self
                    .with_retries(stage_deadline, || {
                        self.versions
                            .flow_config(deployment.agent_id, deployment.agent_version_id)
                    })
                    .await?;
                let context = materialize(&flow, &image_tag, &self.settings.context)
                    .map_err(Interrupt::Stage)?;

                let job_id = self
                    .with_retries(stage_deadline, || build.submit(id, &context))
                    .await?;
                deployment = self
                    .dal
                    .merge_metadata(id, json!({ "build_job_id": job_id }))
                    .await?;
                job_id
            }
        };

        // Stage: poll the build until the image is pushed.
        self.poll_stage(id, pipeline_deadline, || async {
            match build.poll(&build_job_id).await? {
                BuildPoll::Succeeded => Ok(Some(())),
                BuildPoll::Pending => Ok(None),
            }
        })
        .await?;

        // Stage: confirm the tag exists and fits the target architecture.
        let require_amd64 = deployment.deploy_strategy == DeployStrategyKind::Serverless;
        self.with_retries(self.stage_deadline(pipeline_deadline), || {
            self.registry.verify_image(&image_tag, require_amd64)
        })
        .await?;

        // Stage: create the platform service and wait for readiness.
        let service_name = match deployment.marker("platform_service_name") {
            Some(name) => name,
            None => {
                let name = format!("agent-runtime-{id}");
                deployment = self
                    .dal
                    .merge_metadata(id, json!({ "platform_service_name": name }))
                    .await?;
                name
            }
        };

        self.check_cancel(id).await?;

        let spec = ServiceSpec {
            service_name: service_name.clone(),
            image: image_tag,
            config: deployment.deployment_config,
        };
        self.with_retries(self.stage_deadline(pipeline_deadline), || {
            deploy.create_service(&spec)
        })
        .await?;

        let url = self
            .poll_stage(id, pipeline_deadline, || async {
                match deploy.get_state(&service_name, &spec.config).await? {
                    ServiceState::Ready { url } => Ok(Some(url)),
                    ServiceState::Progressing => Ok(None),
                    ServiceState::Failed { reason } => Err(StageError::Fatal(reason)),
                }
            })
            .await?;

        self.dal
            .transition(
                id,
                DeploymentStatus::Running,
                Some("service ready".to_string()),
                Some(url.clone()),
                None,
            )
            .await?;

        Ok(Outcome::Running(url))
    }

    fn stage_deadline(&self, pipeline_deadline: DateTime<Utc>) -> DateTime<Utc> {
        let stage = Utc::now()
            + chrono::Duration::from_std(self.settings.stage_deadline)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));

        stage.min(pipeline_deadline)
    }

    async fn check_cancel(&self, id: Uuid) -> Result<(), Interrupt> {
        if self.dal.stop_requested(id).await? {
            return Err(Interrupt::Cancelled);
        }

        Ok(())
    }

    /// Retry a stage call on transient failures with exponential backoff.
    async fn with_retries<T, F, Fut>(
        &self,
        deadline: DateTime<Utc>,
        mut op: F,
    ) -> Result<T, Interrupt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempts = 0;
        let mut backoff = self.settings.poll_initial;

        loop {
            if Utc::now() > deadline {
                return Err(Interrupt::TimedOut);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempts += 1;
                    if attempts >= self.settings.max_attempts {
                        return Err(Interrupt::Stage(err));
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.settings.poll_max);
                }
                Err(err) => return Err(Interrupt::Stage(err)),
            }
        }
    }

    /// Poll an external system at bounded intervals until it reports done,
    /// renewing the lease and honoring the stop flag between polls.
    async fn poll_stage<T, F, Fut>(
        &self,
        id: Uuid,
        pipeline_deadline: DateTime<Utc>,
        mut poll: F,
    ) -> Result<T, Interrupt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, StageError>>,
    {
        let stage_deadline = self.stage_deadline(pipeline_deadline);
        let mut backoff = self.settings.poll_initial;
        let mut transient_failures = 0;

        loop {
            if Utc::now() > stage_deadline {
                return Err(Interrupt::TimedOut);
            }

            self.check_cancel(id).await?;
            self.dal.renew_lease(id, &self.id, self.settings.lease).await?;

            match poll().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    transient_failures = 0;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.settings.poll_max);
                }
                Err(err) if err.is_transient() => {
                    transient_failures += 1;
                    if transient_failures >= self.settings.max_attempts {
                        return Err(Interrupt::Stage(err));
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.settings.poll_max);
                }
                Err(err) => return Err(Interrupt::Stage(err)),
            }
        }
    }

    /// Cancel whatever the pipeline has in flight, tear down the platform
    /// service, and record the stop.
    async fn teardown_and_stop(&self, id: Uuid) -> Result<(), Error> {
        let deployment = self.dal.get(id).await?;

        self.teardown(&deployment).await;

        self.dal
            .transition(
                id,
                DeploymentStatus::Stopped,
                Some("stop requested".to_string()),
                None,
                None,
            )
            .await?;

        Ok(())
    }

    /// Best-effort cleanup of external resources named in the metadata.
    async fn teardown(&self, deployment: &Deployment) {
        if deployment.status == DeploymentStatus::Deploying {
            if let (Some(job_id), Some(build)) = (
                deployment.marker("build_job_id"),
                self.builds.get(&deployment.build_strategy),
            ) {
                if let Err(err) = build.cancel(&job_id).await {
                    warn!(error = %err, %job_id, "failed to cancel in-flight build");
                }
            }
        }

        if let (Some(service_name), Some(deploy)) = (
            deployment.marker("platform_service_name"),
            self.deploys.get(&deployment.deploy_strategy),
        ) {
            if let Err(err) = deploy.delete_service(&service_name).await {
                warn!(error = %err, %service_name, "failed to tear down platform service");
            }
        }
    }

    async fn fail(&self, id: Uuid, message: String) {
        if let Ok(deployment) = self.dal.get(id).await {
            self.teardown(&deployment).await;
        }

        if let Err(err) = self
            .dal
            .transition(
                id,
                DeploymentStatus::Failed,
                Some(message.clone()),
                None,
                Some(message),
            )
            .await
        {
            error!(error = %err, "failed to record pipeline failure");
        }
    }
}
