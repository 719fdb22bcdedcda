use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowplane_common::models::deployment::{
    BuildStrategyKind, DeployStrategyKind, DeploymentConfig, DeploymentFilters,
    DeploymentResponse, DeploymentStatus, TransitionResponse,
};
use flowplane_common::models::error::{Error, ErrorKind};
use flowplane_common::models::{Page, Paging};
use sqlx::postgres::PgRow;
use sqlx::types::Json as SqlxJson;
use sqlx::{query, query_scalar, FromRow, PgPool, Row};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Deployment {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub agent_id: Uuid,
    pub agent_version_id: Uuid,
    pub status: DeploymentStatus,
    pub endpoint_url: Option<String>,
    pub metadata: serde_json::Value,
    pub error_message: Option<String>,
    pub build_strategy: BuildStrategyKind,
    pub deploy_strategy: DeployStrategyKind,
    pub deployment_config: DeploymentConfig,
    pub stop_requested: bool,
    pub deployed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Resumption marker lookup.
    pub fn marker(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .and_then(|value| value.as_str())
            .map(str::to_string)
    }
}

fn decode_column<T: FromStr>(row: &PgRow, column: &'static str) -> Result<T, sqlx::Error>
where
    T::Err: std::fmt::Display,
{
    T::from_str(row.try_get(column)?).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            err.to_string(),
        )),
    })
}

impl FromRow<'_, PgRow> for Deployment {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Deployment {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            agent_id: row.try_get("agent_id")?,
            agent_version_id: row.try_get("agent_version_id")?,
            status: decode_column(row, "status")?,
            endpoint_url: row.try_get("endpoint_url")?,
            metadata: row.try_get("metadata")?,
            error_message: row.try_get("error_message")?,
            build_strategy: decode_column(row, "build_strategy")?,
            deploy_strategy: decode_column(row, "deploy_strategy")?,
            deployment_config: row
                .try_get::<SqlxJson<DeploymentConfig>, _>("deployment_config")?
                .0,
            stop_requested: row.try_get("stop_requested")?,
            deployed_at: row.try_get("deployed_at")?,
            stopped_at: row.try_get("stopped_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<Deployment> for DeploymentResponse {
    fn from(d: Deployment) -> Self {
        Self {
            id: d.id,
            owner_id: d.owner_id,
            agent_id: d.agent_id,
            agent_version_id: d.agent_version_id,
            status: d.status,
            endpoint_url: d.endpoint_url,
            metadata: d.metadata,
            error_message: d.error_message,
            build_strategy: d.build_strategy,
            deploy_strategy: d.deploy_strategy,
            deployed_at: d.deployed_at,
            stopped_at: d.stopped_at,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

pub struct NewDeployment {
    pub owner_id: Uuid,
    pub agent_id: Uuid,
    pub agent_version_id: Uuid,
    pub build_strategy: BuildStrategyKind,
    pub deploy_strategy: DeployStrategyKind,
    pub deployment_config: DeploymentConfig,
}

#[derive(Clone, Debug, FromRow)]
pub struct TransitionRow {
    pub deployment_id: Uuid,
    pub from_status: Option<String>,
    pub to_status: String,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl TryFrom<TransitionRow> for TransitionResponse {
    type Error = Error;

    fn try_from(row: TransitionRow) -> Result<Self, Error> {
        Ok(Self {
            deployment_id: row.deployment_id,
            from_status: row
                .from_status
                .as_deref()
                .map(DeploymentStatus::from_str)
                .transpose()
                .map_err(|err| Error::custom(ErrorKind::Internal, err.to_string()))?,
            to_status: DeploymentStatus::from_str(&row.to_status)
                .map_err(|err| Error::custom(ErrorKind::Internal, err.to_string()))?,
            at: row.at,
            detail: row.detail,
        })
    }
}

#[async_trait]
pub trait Dal: Send + Sync {
    async fn insert(&self, deployment: NewDeployment) -> Result<Deployment, Error>;

    async fn get(&self, id: Uuid) -> Result<Deployment, Error>;

    async fn list(
        &self,
        owner_scope: Option<Uuid>,
        filters: &DeploymentFilters,
        paging: &Paging,
    ) -> Result<Page<Deployment>, Error>;

    /// Apply one status transition and append its log entry in one
    /// transaction. Illegal transitions are refused with `conflict`.
    async fn transition(
        &self,
        id: Uuid,
        to: DeploymentStatus,
        detail: Option<String>,
        endpoint_url: Option<String>,
        error_message: Option<String>,
    ) -> Result<Deployment, Error>;

    async fn transitions(&self, id: Uuid) -> Result<Vec<TransitionRow>, Error>;

    /// Lease the oldest deployment with work left on it. Expired leases are
    /// taken over, which is what resumes a crashed worker's pipeline.
    async fn lease_next(&self, worker_id: &str, lease: Duration)
        -> Result<Option<Deployment>, Error>;

    async fn renew_lease(&self, id: Uuid, worker_id: &str, lease: Duration) -> Result<(), Error>;

    async fn release_lease(&self, id: Uuid, worker_id: &str) -> Result<(), Error>;

    /// Flag the deployment for cancellation; the worker observes the flag
    /// between stages.
    async fn request_stop(&self, id: Uuid) -> Result<Deployment, Error>;

    async fn stop_requested(&self, id: Uuid) -> Result<bool, Error>;

    /// Merge resumption markers into the metadata document.
    async fn merge_metadata(&self, id: Uuid, patch: serde_json::Value)
        -> Result<Deployment, Error>;

    async fn healthy(&self) -> bool;
}

const COLUMNS: &str = "id, owner_id, agent_id, agent_version_id, status, endpoint_url, metadata, \
                       error_message, build_strategy, deploy_strategy, deployment_config, \
                       stop_requested, deployed_at, stopped_at, created_at, updated_at";

pub struct Postgres {
    pool: PgPool,
}

impl Postgres {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Dal for Postgres {
    async fn insert(&self, deployment: NewDeployment) -> Result<Deployment, Error> {
        let mut transaction = self.pool.begin().await?;

        let inserted: Deployment = sqlx::query_as(&format!(
            "INSERT INTO deployments
                 (owner_id, agent_id, agent_version_id, build_strategy, deploy_strategy, deployment_config)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {COLUMNS}"
        ))
        .bind(deployment.owner_id)
        .bind(deployment.agent_id)
        .bind(deployment.agent_version_id)
        .bind(deployment.build_strategy.to_string())
        .bind(deployment.deploy_strategy.to_string())
        .bind(SqlxJson(deployment.deployment_config))
        .fetch_one(&mut *transaction)
        .await?;

        query(
            "INSERT INTO deployment_transitions (deployment_id, from_status, to_status, detail)
             VALUES ($1, NULL, 'pending', 'created')",
        )
        .bind(inserted.id)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;

        Ok(inserted)
    }

    async fn get(&self, id: Uuid) -> Result<Deployment, Error> {
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM deployments WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn list(
        &self,
        owner_scope: Option<Uuid>,
        filters: &DeploymentFilters,
        paging: &Paging,
    ) -> Result<Page<Deployment>, Error> {
        let status = filters.status.map(|s| s.to_string());

        let total: i64 = query_scalar(
            "SELECT COUNT(*) FROM deployments
             WHERE ($1::uuid IS NULL OR owner_id = $1)
               AND ($2::uuid IS NULL OR agent_id = $2)
               AND ($3::text IS NULL OR status = $3)",
        )
        .bind(owner_scope)
        .bind(filters.agent_id)
        .bind(&status)
        .fetch_one(&self.pool)
        .await?;

        let items: Vec<Deployment> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM deployments
             WHERE ($1::uuid IS NULL OR owner_id = $1)
               AND ($2::uuid IS NULL OR agent_id = $2)
               AND ($3::text IS NULL OR status = $3)
             ORDER BY created_at DESC
             LIMIT $4 OFFSET $5"
        ))
        .bind(owner_scope)
        .bind(filters.agent_id)
        .bind(&status)
        .bind(paging.limit())
        .bind(paging.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items,
            page: paging.page(),
            page_size: paging.page_size(),
            total,
        })
    }

    async fn transition(
        &self,
        id: Uuid,
        to: DeploymentStatus,
        detail: Option<String>,
        endpoint_url: Option<String>,
        error_message: Option<String>,
    ) -> Result<Deployment, Error> {
        let mut transaction = self.pool.begin().await?;

        let current: String =
            query_scalar("SELECT status FROM deployments WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *transaction)
                .await?
                .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        let from = DeploymentStatus::from_str(&current)
            .map_err(|err| Error::custom(ErrorKind::Internal, err.to_string()))?;

        if !from.can_transition_to(to) {
            return Err(Error::custom(
                ErrorKind::Conflict,
                format!("illegal transition {from} -> {to}"),
            ));
        }

        let updated: Deployment = sqlx::query_as(&format!(
            "UPDATE deployments SET
                 status = $2,
                 endpoint_url = CASE WHEN $2 = 'running' THEN $3 ELSE endpoint_url END,
                 deployed_at = CASE WHEN $2 = 'running' THEN now() ELSE deployed_at END,
                 stopped_at = CASE WHEN $2 = 'stopped' THEN now() ELSE stopped_at END,
                 error_message = CASE WHEN $2 = 'failed' THEN $4 ELSE error_message END
             WHERE id = $1
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(to.to_string())
        .bind(endpoint_url)
        .bind(error_message)
        .fetch_one(&mut *transaction)
        .await?;

        query(
            "INSERT INTO deployment_transitions (deployment_id, from_status, to_status, detail)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .bind(detail)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;

        Ok(updated)
    }

    async fn transitions(&self, id: Uuid) -> Result<Vec<TransitionRow>, Error> {
        Ok(sqlx::query_as(
            "SELECT deployment_id, from_status, to_status, at, detail
             FROM deployment_transitions
             WHERE deployment_id = $1
             ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn lease_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Deployment>, Error> {
        Ok(sqlx::query_as(&format!(
            "UPDATE deployments
             SET leased_by = $1, lease_expires_at = now() + make_interval(secs => $2)
             WHERE id = (
                 SELECT id FROM deployments
                 WHERE (status IN ('pending', 'deploying')
                        OR (status = 'running' AND stop_requested))
                   AND (lease_expires_at IS NULL OR lease_expires_at < now())
                 ORDER BY created_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {COLUMNS}"
        ))
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn renew_lease(&self, id: Uuid, worker_id: &str, lease: Duration) -> Result<(), Error> {
        let rows_affected = query(
            "UPDATE deployments
             SET lease_expires_at = now() + make_interval(secs => $3)
             WHERE id = $1 AND leased_by = $2",
        )
        .bind(id)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            Ok(())
        } else {
            Err(Error::custom(
                ErrorKind::PreconditionFailed,
                "lease is no longer held by this worker",
            ))
        }
    }

    async fn release_lease(&self, id: Uuid, worker_id: &str) -> Result<(), Error> {
        query(
            "UPDATE deployments SET leased_by = NULL, lease_expires_at = NULL
             WHERE id = $1 AND leased_by = $2",
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn request_stop(&self, id: Uuid) -> Result<Deployment, Error> {
        sqlx::query_as(&format!(
            "UPDATE deployments SET stop_requested = TRUE WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn stop_requested(&self, id: Uuid) -> Result<bool, Error> {
        query_scalar("SELECT stop_requested FROM deployments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn merge_metadata(
        &self,
        id: Uuid,
        patch: serde_json::Value,
    ) -> Result<Deployment, Error> {
        sqlx::query_as(&format!(
            "UPDATE deployments SET metadata = metadata || $2 WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(&patch)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn healthy(&self) -> bool {
        query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
