use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flowplane_common::backends::client::ServicesApiClient;
use http::{Method, StatusCode};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::{BuildContext, BuildPoll, BuildStrategy, StageError};

/// Builds through a managed build service that takes a storage-backed build
/// context and reports job status.
pub struct HostedBuild {
    api: ServicesApiClient,
    token: String,
}

#[derive(Deserialize)]
struct BuildJob {
    id: String,
    status: String,
    #[serde(default)]
    logs_url: Option<String>,
}

impl HostedBuild {
    pub fn new(api: ServicesApiClient, token: String) -> Self {
        Self { api, token }
    }
}

#[async_trait]
impl BuildStrategy for HostedBuild {
    async fn submit(
        &self,
        deployment_id: Uuid,
        build_context: &BuildContext,
    ) -> Result<String, StageError> {
        let body = serde_json::json!({
            // The deployment id names the job, so resubmits collide instead
            // of duplicating work.
            "name": format!("deploy-{deployment_id}"),
            "image_tag": build_context.image_tag,
            "context": BASE64.encode(&build_context.archive),
        });

        let response: Result<BuildJob, _> = self
            .api
            .request(Method::POST, "builds", Some(&body), Some(&self.token))
            .await;

        match response {
            Ok(job) => Ok(job.id),
            Err(err) if err.status() == Some(StatusCode::CONFLICT) => {
                debug!(%deployment_id, "build job already exists, re-attaching");
                Ok(format!("deploy-{deployment_id}"))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn poll(&self, job_id: &str) -> Result<BuildPoll, StageError> {
        let job: BuildJob = self
            .api
            .request::<(), _>(
                Method::GET,
                &format!("builds/{job_id}"),
                None,
                Some(&self.token),
            )
            .await?;

        match job.status.as_str() {
            "queued" | "working" | "running" => Ok(BuildPoll::Pending),
            "success" => Ok(BuildPoll::Succeeded),
            other => Err(StageError::Fatal(format!(
                "hosted build ended as '{other}'{}",
                job.logs_url
                    .map(|url| format!(" (logs: {url})"))
                    .unwrap_or_default()
            ))),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<(), StageError> {
        self.api
            .request::<_, serde_json::Value>(
                Method::POST,
                &format!("builds/{job_id}/cancel"),
                Some(&serde_json::json!({})),
                Some(&self.token),
            )
            .await
            .map(|_| ())
            .map_err(StageError::from)
    }
}
