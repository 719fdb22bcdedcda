use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowplane_common::models::user::ProfileResponse;
use sqlx::{query, query_scalar, FromRow, PgPool};
use uuid::Uuid;

use crate::error::Error;

/// Role granted to every registered user.
pub const DEFAULT_ROLE: &str = "member";
/// Role granted to the bootstrap admin account.
pub const ADMIN_ROLE: &str = "admin";

#[derive(Clone, Debug, FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Profile> for ProfileResponse {
    fn from(profile: Profile) -> Self {
        Self {
            id: profile.id,
            email: profile.email,
            display_name: profile.display_name,
            created_at: profile.created_at,
            updated_at: profile.updated_at,
        }
    }
}

#[async_trait]
pub trait ProfileManagement: Send + Sync {
    /// Insert the profile and its default role assignment in one transaction.
    /// A failure here fails the whole registration.
    async fn create_profile(
        &self,
        id: Uuid,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<Profile, Error>;

    async fn get_profile(&self, id: Uuid) -> Result<Profile, Error>;

    async fn update_profile(&self, id: Uuid, display_name: Option<String>)
        -> Result<Profile, Error>;

    /// Upsert the bootstrap admin profile and make sure it holds the admin role.
    async fn ensure_admin(&self, id: Uuid, email: &str) -> Result<(), Error>;

    /// Whether the backing store answers queries.
    async fn healthy(&self) -> bool;
}

#[derive(Clone)]
pub struct ProfileManager {
    pub pool: PgPool,
}

#[async_trait]
impl ProfileManagement for ProfileManager {
    async fn create_profile(
        &self,
        id: Uuid,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<Profile, Error> {
        let mut transaction = self.pool.begin().await?;

        let profile: Profile = sqlx::query_as(
            "INSERT INTO profiles (id, email, display_name) VALUES ($1, $2, $3)
             RETURNING id, email, display_name, created_at, updated_at",
        )
        .bind(id)
        .bind(email)
        .bind(display_name)
        .fetch_one(&mut *transaction)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::EmailTaken,
            _ => Error::Database(err),
        })?;

        query("INSERT INTO user_roles (user_id, role_id) SELECT $1, id FROM roles WHERE name = $2")
            .bind(id)
            .bind(DEFAULT_ROLE)
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?;

        Ok(profile)
    }

    async fn get_profile(&self, id: Uuid) -> Result<Profile, Error> {
        sqlx::query_as(
            "SELECT id, email, display_name, created_at, updated_at FROM profiles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::ProfileNotFound)
    }

    async fn update_profile(
        &self,
        id: Uuid,
        display_name: Option<String>,
    ) -> Result<Profile, Error> {
        sqlx::query_as(
            "UPDATE profiles SET display_name = $2 WHERE id = $1
             RETURNING id, email, display_name, created_at, updated_at",
        )
        .bind(id)
        .bind(display_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::ProfileNotFound)
    }

    async fn ensure_admin(&self, id: Uuid, email: &str) -> Result<(), Error> {
        let mut transaction = self.pool.begin().await?;

        query(
            "INSERT INTO profiles (id, email) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET email = EXCLUDED.email",
        )
        .bind(id)
        .bind(email)
        .execute(&mut *transaction)
        .await?;

        query(
            "INSERT INTO user_roles (user_id, role_id)
             SELECT $1, id FROM roles WHERE name = $2
             ON CONFLICT DO NOTHING",
        )
        .bind(id)
        .bind(ADMIN_ROLE)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;

        Ok(())
    }

    async fn healthy(&self) -> bool {
        query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
