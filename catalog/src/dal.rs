use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowplane_common::models::agent::{
    AgentFilters, AgentResponse, AgentStatus, AgentVersionResponse,
};
use flowplane_common::models::error::{Error, ErrorKind};
use flowplane_common::models::{Page, Paging};
use sqlx::postgres::PgRow;
use sqlx::{query, query_scalar, FromRow, PgPool, Row};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Agent {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: AgentStatus,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for Agent {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Agent {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: AgentStatus::from_str(row.try_get("status")?).map_err(|err| {
                sqlx::Error::ColumnDecode {
                    index: "status".to_string(),
                    source: Box::new(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        err.to_string(),
                    )),
                }
            })?,
            tags: row.try_get("tags")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<Agent> for AgentResponse {
    fn from(agent: Agent) -> Self {
        Self {
            id: agent.id,
            owner_id: agent.owner_id,
            name: agent.name,
            description: agent.description,
            status: agent.status,
            tags: agent.tags,
            created_at: agent.created_at,
            updated_at: agent.updated_at,
        }
    }
}

#[derive(Clone, Debug, FromRow)]
pub struct AgentVersion {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub owner_id: Uuid,
    pub version_number: i32,
    pub config: serde_json::Value,
    pub changelog: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<AgentVersion> for AgentVersionResponse {
    fn from(version: AgentVersion) -> Self {
        Self {
            id: version.id,
            agent_id: version.agent_id,
            owner_id: version.owner_id,
            version_number: version.version_number,
            config: version.config,
            changelog: version.changelog,
            published_at: version.published_at,
            created_at: version.created_at,
        }
    }
}

#[async_trait]
pub trait Dal: Send + Sync {
    /// Insert the agent and its first version atomically.
    async fn create_agent(
        &self,
        owner_id: Uuid,
        name: &str,
        description: Option<&str>,
        tags: &[String],
        config: serde_json::Value,
    ) -> Result<(Agent, AgentVersion), Error>;

    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, Error>;

    async fn update_agent(
        &self,
        agent_id: Uuid,
        name: Option<String>,
        description: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Agent, Error>;

    /// Terminal for new versions; running deployments are left alone.
    async fn archive_agent(&self, agent_id: Uuid) -> Result<Agent, Error>;

    async fn list_agents(
        &self,
        owner_scope: Option<Uuid>,
        filters: &AgentFilters,
        paging: &Paging,
    ) -> Result<Page<Agent>, Error>;

    /// Append the next version under the agent's row lock. The version counter
    /// is always derived from the stored rows.
    async fn insert_version(
        &self,
        agent_id: Uuid,
        config: serde_json::Value,
        changelog: Option<String>,
    ) -> Result<AgentVersion, Error>;

    async fn get_version(&self, agent_id: Uuid, version_id: Uuid) -> Result<AgentVersion, Error>;

    async fn latest_version(&self, agent_id: Uuid) -> Result<AgentVersion, Error>;

    async fn list_versions(
        &self,
        agent_id: Uuid,
        paging: &Paging,
    ) -> Result<Page<AgentVersion>, Error>;

    /// Stamp `published_at` (at most once) and flip the agent to published.
    async fn publish_version(&self, agent_id: Uuid, version_id: Uuid)
        -> Result<AgentVersion, Error>;

    async fn healthy(&self) -> bool;
}

pub struct Postgres {
    pool: PgPool,
}

impl Postgres {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const AGENT_COLUMNS: &str = "id, owner_id, name, description, status, tags, created_at, updated_at";
const VERSION_COLUMNS: &str =
    "id, agent_id, owner_id, version_number, config, changelog, published_at, created_at";

#[async_trait]
impl Dal for Postgres {
    async fn create_agent(
        &self,
        owner_id: Uuid,
        name: &str,
        description: Option<&str>,
        tags: &[String],
        config: serde_json::Value,
    ) -> Result<(Agent, AgentVersion), Error> {
        let mut transaction = self.pool.begin().await?;

        let agent: Agent = sqlx::query_as(&format!(
            "INSERT INTO agents (owner_id, name, description, tags)
             VALUES ($1, $2, $3, $4)
             RETURNING {AGENT_COLUMNS}"
        ))
        .bind(owner_id)
        .bind(name)
        .bind(description)
        .bind(tags)
        .fetch_one(&mut *transaction)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::custom(ErrorKind::Conflict, "an agent with that name already exists")
            }
            _ => err.into(),
        })?;

        let version: AgentVersion = sqlx::query_as(&format!(
            "INSERT INTO agent_versions (agent_id, owner_id, version_number, config)
             VALUES ($1, $2, 1, $3)
             RETURNING {VERSION_COLUMNS}"
        ))
        .bind(agent.id)
        .bind(owner_id)
        .bind(&config)
        .fetch_one(&mut *transaction)
        .await?;

        transaction.commit().await?;

        Ok((agent, version))
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, Error> {
        sqlx::query_as(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1"))
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn update_agent(
        &self,
        agent_id: Uuid,
        name: Option<String>,
        description: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Agent, Error> {
        sqlx::query_as(&format!(
            "UPDATE agents SET
                 name = COALESCE($2, name),
                 description = COALESCE($3, description),
                 tags = COALESCE($4, tags)
             WHERE id = $1
             RETURNING {AGENT_COLUMNS}"
        ))
        .bind(agent_id)
        .bind(name)
        .bind(description)
        .bind(tags)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::custom(ErrorKind::Conflict, "an agent with that name already exists")
            }
            _ => err.into(),
        })?
        .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn archive_agent(&self, agent_id: Uuid) -> Result<Agent, Error> {
        sqlx::query_as(&format!(
            "UPDATE agents SET status = 'archived' WHERE id = $1 RETURNING {AGENT_COLUMNS}"
        ))
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn list_agents(
        &self,
        owner_scope: Option<Uuid>,
        filters: &AgentFilters,
        paging: &Paging,
    ) -> Result<Page<Agent>, Error> {
        let status = filters.status.map(|s| s.to_string());

        let total: i64 = query_scalar(
            "SELECT COUNT(*) FROM agents
             WHERE ($1::uuid IS NULL OR owner_id = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR $3 = ANY(tags))",
        )
        .bind(owner_scope)
        .bind(&status)
        .bind(&filters.tag)
        .fetch_one(&self.pool)
        .await?;

        let items: Vec<Agent> = sqlx::query_as(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents
             WHERE ($1::uuid IS NULL OR owner_id = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR $3 = ANY(tags))
             ORDER BY created_at DESC
             LIMIT $4 OFFSET $5"
        ))
        .bind(owner_scope)
        .bind(&status)
        .bind(&filters.tag)
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

    async fn insert_version(
        &self,
        agent_id: Uuid,
        config: serde_json::Value,
        changelog: Option<String>,
    ) -> Result<AgentVersion, Error> {
        let mut transaction = self.pool.begin().await?;

        // The row lock serializes concurrent writers per agent; the next
        // version number is derived under it, so numbers stay gapless.
        let row = query("SELECT owner_id, status FROM agents WHERE id = $1 FOR UPDATE")
            .bind(agent_id)
            .fetch_optional(&mut *transaction)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        let owner_id: Uuid = row.get("owner_id");
        let status: String = row.get("status");
        if status == AgentStatus::Archived.to_string() {
            return Err(Error::custom(
                ErrorKind::Conflict,
                "agent is archived and no longer accepts versions",
            ));
        }

        let current: i32 = query_scalar(
            "SELECT COALESCE(MAX(version_number), 0) FROM agent_versions WHERE agent_id = $1",
        )
        .bind(agent_id)
        .fetch_one(&mut *transaction)
        .await?;

        let version: AgentVersion = sqlx::query_as(&format!(
            "INSERT INTO agent_versions (agent_id, owner_id, version_number, config, changelog)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {VERSION_COLUMNS}"
        ))
        .bind(agent_id)
        .bind(owner_id)
        .bind(current + 1)
        .bind(&config)
        .bind(changelog)
        .fetch_one(&mut *transaction)
        .await?;

        transaction.commit().await?;

        Ok(version)
    }

    async fn get_version(&self, agent_id: Uuid, version_id: Uuid) -> Result<AgentVersion, Error> {
        sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM agent_versions WHERE id = $1 AND agent_id = $2"
        ))
        .bind(version_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn latest_version(&self, agent_id: Uuid) -> Result<AgentVersion, Error> {
        sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM agent_versions
             WHERE agent_id = $1
             ORDER BY version_number DESC
             LIMIT 1"
        ))
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn list_versions(
        &self,
        agent_id: Uuid,
        paging: &Paging,
    ) -> Result<Page<AgentVersion>, Error> {
        let total: i64 = query_scalar("SELECT COUNT(*) FROM agent_versions WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_one(&self.pool)
            .await?;

        let items: Vec<AgentVersion> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM agent_versions
             WHERE agent_id = $1
             ORDER BY version_number DESC
             LIMIT $2 OFFSET $3"
        ))
        .bind(agent_id)
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

    async fn publish_version(
        &self,
        agent_id: Uuid,
        version_id: Uuid,
    ) -> Result<AgentVersion, Error> {
        let mut transaction = self.pool.begin().await?;

        // `published_at` is set at most once; re-publishing returns the
        // original stamp.
        let version: AgentVersion = sqlx::query_as(&format!(
            "UPDATE agent_versions SET published_at = COALESCE(published_at, now())
             WHERE id = $1 AND agent_id = $2
             RETURNING {VERSION_COLUMNS}"
        ))
        .bind(version_id)
        .bind(agent_id)
        .fetch_optional(&mut *transaction)
        .await?
        .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        query("UPDATE agents SET status = 'published' WHERE id = $1 AND status <> 'archived'")
            .bind(agent_id)
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?;

        Ok(version)
    }

    async fn healthy(&self) -> bool {
        query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
