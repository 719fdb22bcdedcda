use async_trait::async_trait;
use flowplane_common::backends::client::ClientError;
use thiserror::Error;
use uuid::Uuid;

mod ci;
mod context;
mod hosted;

pub use ci::CiDriven;
pub use context::{materialize, ContextSettings};
pub use hosted::HostedBuild;

/// Failure of one pipeline stage call.
///
/// Transient failures are retried with backoff up to the stage deadline;
/// fatal ones fail the deployment immediately.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Fatal(String),
    #[error("{0}")]
    Transient(String),
}

impl StageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }
}

impl From<ClientError> for StageError {
    fn from(err: ClientError) -> Self {
        if err.is_transient() {
            StageError::Transient(err.to_string())
        } else {
            StageError::Fatal(err.to_string())
        }
    }
}

/// An in-memory container build context: a gzipped tar of the Dockerfile and
/// the flow artifact, plus the tag the image will land on.
#[derive(Debug)]
pub struct BuildContext {
    pub archive: Vec<u8>,
    pub image_tag: String,
}

/// Build failures surface as [`StageError::Fatal`] from `poll`, so the poll
/// outcome only distinguishes "keep waiting" from "image is pushed".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildPoll {
    Pending,
    Succeeded,
}

/// One of the two pluggable ways of turning a build context into a pushed
/// image. External job names derive from the deployment id, which makes every
/// create call naturally idempotent: "already exists" re-attaches.
#[async_trait]
pub trait BuildStrategy: Send + Sync {
    /// Submit the build and return the external job id to poll and resume on.
    async fn submit(
        &self,
        deployment_id: Uuid,
        build_context: &BuildContext,
    ) -> Result<String, StageError>;

    async fn poll(&self, job_id: &str) -> Result<BuildPoll, StageError>;

    /// Best-effort cancellation of an in-flight build.
    async fn cancel(&self, job_id: &str) -> Result<(), StageError>;
}
