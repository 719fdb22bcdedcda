use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flowplane_common::backends::client::ServicesApiClient;
use http::{Method, StatusCode};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::{BuildContext, BuildPoll, BuildStrategy, StageError};

/// Builds by dispatching a remote CI workflow and polling the resulting run.
pub struct CiDriven {
    api: ServicesApiClient,
    /// Workflow identifier understood by the CI dispatch endpoint.
    workflow: String,
    token: String,
}

#[derive(Deserialize)]
struct DispatchResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct JobStatus {
    status: String,
    #[serde(default)]
    logs_url: Option<String>,
}

impl CiDriven {
    pub fn new(api: ServicesApiClient, workflow: String, token: String) -> Self {
        Self {
            api,
            workflow,
            token,
        }
    }
}

#[async_trait]
impl BuildStrategy for CiDriven {
    async fn submit(
        &self,
        deployment_id: Uuid,
        build_context: &BuildContext,
    ) -> Result<String, StageError> {
        let body = serde_json::json!({
            "workflow": self.workflow,
            "inputs": {
                "deployment_id": deployment_id,
                "image_tag": build_context.image_tag,
                "build_context": BASE64.encode(&build_context.archive),
            },
        });

        let response: Result<DispatchResponse, _> = self
            .api
            .request(
                Method::POST,
                "dispatch",
                Some(&body),
                Some(&self.token),
            )
            .await;

        match response {
            Ok(dispatch) => Ok(dispatch.job_id),
            // A workflow already dispatched for this deployment is a success;
            // the existing run is re-attached by its deterministic name.
            Err(err) if err.status() == Some(StatusCode::CONFLICT) => {
                debug!(%deployment_id, "workflow already dispatched, re-attaching");
                Ok(format!("deploy-{deployment_id}"))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn poll(&self, job_id: &str) -> Result<BuildPoll, StageError> {
        let job: JobStatus = self
            .api
            .request::<(), _>(
                Method::GET,
                &format!("jobs/{job_id}"),
                None,
                Some(&self.token),
            )
            .await?;

        match job.status.as_str() {
            "queued" | "in_progress" | "running" => Ok(BuildPoll::Pending),
            "success" | "completed" => Ok(BuildPoll::Succeeded),
            other => Err(StageError::Fatal(format!(
                "ci build ended as '{other}'{}",
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
                &format!("jobs/{job_id}/cancel"),
                Some(&serde_json::json!({})),
                Some(&self.token),
            )
            .await
            .map(|_| ())
            .map_err(StageError::from)
    }
}
