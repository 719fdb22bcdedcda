use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowplane_common::models::conversation::{
    ConversationResponse, MessageResponse, MessageRole,
};
use flowplane_common::models::error::{Error, ErrorKind};
use flowplane_common::models::{Page, Paging};
use sqlx::postgres::PgRow;
use sqlx::{query_scalar, FromRow, PgPool, Row};
use uuid::Uuid;

#[derive(Clone, Debug, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub owner_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub title: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Conversation> for ConversationResponse {
    fn from(c: Conversation) -> Self {
        Self {
            id: c.id,
            owner_id: c.owner_id,
            agent_id: c.agent_id,
            title: c.title,
            metadata: c.metadata,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for Message {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Message {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            role: MessageRole::from_str(row.try_get("role")?).map_err(|err| {
                sqlx::Error::ColumnDecode {
                    index: "role".to_string(),
                    source: Box::new(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        err.to_string(),
                    )),
                }
            })?,
            content: row.try_get("content")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<Message> for MessageResponse {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            conversation_id: m.conversation_id,
            role: m.role,
            content: m.content,
            metadata: m.metadata,
            created_at: m.created_at,
        }
    }
}

#[async_trait]
pub trait Dal: Send + Sync {
    async fn create_conversation(
        &self,
        owner_id: Option<Uuid>,
        agent_id: Option<Uuid>,
        title: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<Conversation, Error>;

    async fn get_conversation(&self, id: Uuid) -> Result<Conversation, Error>;

    async fn list_conversations(
        &self,
        owner_scope: Option<Uuid>,
        paging: &Paging,
    ) -> Result<Page<Conversation>, Error>;

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<Message, Error>;

    /// Messages in their total order, `(created_at, id)` ascending.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        paging: &Paging,
    ) -> Result<Page<Message>, Error>;

    async fn healthy(&self) -> bool;
}

const CONVERSATION_COLUMNS: &str =
    "id, owner_id, agent_id, title, metadata, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, metadata, created_at";

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
    async fn create_conversation(
        &self,
        owner_id: Option<Uuid>,
        agent_id: Option<Uuid>,
        title: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<Conversation, Error> {
        Ok(sqlx::query_as(&format!(
            "INSERT INTO conversations (owner_id, agent_id, title, metadata)
             VALUES ($1, $2, $3, $4)
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(owner_id)
        .bind(agent_id)
        .bind(title)
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Conversation, Error> {
        sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn list_conversations(
        &self,
        owner_scope: Option<Uuid>,
        paging: &Paging,
    ) -> Result<Page<Conversation>, Error> {
        let total: i64 = query_scalar(
            "SELECT COUNT(*) FROM conversations WHERE ($1::uuid IS NULL OR owner_id = $1)",
        )
        .bind(owner_scope)
        .fetch_one(&self.pool)
        .await?;

        let items: Vec<Conversation> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE ($1::uuid IS NULL OR owner_id = $1)
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3"
        ))
        .bind(owner_scope)
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

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<Message, Error> {
        sqlx::query_as(&format!(
            "INSERT INTO messages (conversation_id, role, content, metadata)
             VALUES ($1, $2, $3, $4)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(role.to_string())
        .bind(content)
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                Error::from_kind(ErrorKind::NotFound)
            }
            _ => err.into(),
        })
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        paging: &Paging,
    ) -> Result<Page<Message>, Error> {
        let total: i64 = query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;

        let items: Vec<Message> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = $1
             ORDER BY created_at, id
             LIMIT $2 OFFSET $3"
        ))
        .bind(conversation_id)
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

    async fn healthy(&self) -> bool {
        query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
