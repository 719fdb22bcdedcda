use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use flowplane_common::claims::Claim;
use flowplane_common::models::user::{ClientResponse, TokenResponse};
use flowplane_common::Secret;
use rand::distributions::{Alphanumeric, DistString};
use sqlx::{query, query_scalar, PgPool, Row};
use uuid::Uuid;

use crate::error::Error;

const CLIENT_SECRET_LENGTH: usize = 40;

#[derive(Clone, Debug)]
pub struct ClientRecord {
    pub client_id: Uuid,
    pub name: String,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl From<ClientRecord> for ClientResponse {
    fn from(client: ClientRecord) -> Self {
        Self {
            client_id: client.client_id,
            name: client.name,
            roles: client.roles,
            created_at: client.created_at,
            revoked_at: client.revoked_at,
        }
    }
}

/// Machine client storage. The secret is hashed at rest; its plaintext leaves
/// this module exactly once, at creation.
#[async_trait]
pub trait ClientManagement: Send + Sync {
    async fn create_client(
        &self,
        name: &str,
        roles: &[String],
    ) -> Result<(ClientRecord, String), Error>;

    async fn list_clients(&self) -> Result<Vec<ClientRecord>, Error>;

    async fn assign_roles(&self, client_id: Uuid, roles: &[String])
        -> Result<ClientRecord, Error>;

    async fn revoke(&self, client_id: Uuid) -> Result<(), Error>;

    /// Check the presented secret against the stored hash and reject revoked
    /// clients. Unknown ids fail the same way as bad secrets.
    async fn verify_credentials(&self, client_id: Uuid, secret: &str)
        -> Result<ClientRecord, Error>;
}

#[derive(Clone)]
pub struct ClientManager {
    pub pool: PgPool,
}

impl ClientManager {
    async fn fetch(&self, client_id: Uuid) -> Result<ClientRecord, Error> {
        let row = query(
            "SELECT client_id, name, created_at, revoked_at FROM machine_clients WHERE client_id = $1",
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::ClientNotFound)?;

        let roles: Vec<String> = query_scalar(
            "SELECT r.name FROM roles r
             JOIN client_roles cr ON cr.role_id = r.id
             WHERE cr.client_id = $1
             ORDER BY r.name",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ClientRecord {
            client_id: row.get("client_id"),
            name: row.get("name"),
            roles,
            created_at: row.get("created_at"),
            revoked_at: row.get("revoked_at"),
        })
    }
}

#[async_trait]
impl ClientManagement for ClientManager {
    async fn create_client(
        &self,
        name: &str,
        roles: &[String],
    ) -> Result<(ClientRecord, String), Error> {
        let secret = Alphanumeric.sample_string(&mut rand::thread_rng(), CLIENT_SECRET_LENGTH);
        let salt = SaltString::generate(&mut OsRng);
        let secret_hash = Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|_| Error::Hash)?
            .to_string();

        let mut transaction = self.pool.begin().await?;

        let client_id: Uuid = query_scalar(
            "INSERT INTO machine_clients (name, secret_hash) VALUES ($1, $2) RETURNING client_id",
        )
        .bind(name)
        .bind(secret_hash)
        .fetch_one(&mut *transaction)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::ClientNameTaken,
            _ => Error::Database(err),
        })?;

        let assigned = query(
            "INSERT INTO client_roles (client_id, role_id)
             SELECT $1, id FROM roles WHERE name = ANY($2)",
        )
        .bind(client_id)
        .bind(roles)
        .execute(&mut *transaction)
        .await?
        .rows_affected();

        if assigned != roles.len() as u64 {
            return Err(Error::RoleNotFound);
        }

        transaction.commit().await?;

        Ok((self.fetch(client_id).await?, secret))
    }

    async fn list_clients(&self) -> Result<Vec<ClientRecord>, Error> {
        let ids: Vec<Uuid> =
            query_scalar("SELECT client_id FROM machine_clients ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;

        let mut clients = Vec::with_capacity(ids.len());
        for id in ids {
            clients.push(self.fetch(id).await?);
        }

        Ok(clients)
    }

    async fn assign_roles(
        &self,
        client_id: Uuid,
        roles: &[String],
    ) -> Result<ClientRecord, Error> {
        // Make sure the client exists before touching assignments.
        self.fetch(client_id).await?;

        let mut transaction = self.pool.begin().await?;

        query("DELETE FROM client_roles WHERE client_id = $1")
            .bind(client_id)
            .execute(&mut *transaction)
            .await?;

        let assigned = query(
            "INSERT INTO client_roles (client_id, role_id)
             SELECT $1, id FROM roles WHERE name = ANY($2)",
        )
        .bind(client_id)
        .bind(roles)
        .execute(&mut *transaction)
        .await?
        .rows_affected();

        if assigned != roles.len() as u64 {
            return Err(Error::RoleNotFound);
        }

        transaction.commit().await?;

        self.fetch(client_id).await
    }

    async fn revoke(&self, client_id: Uuid) -> Result<(), Error> {
        let rows_affected = query(
            "UPDATE machine_clients SET revoked_at = now()
             WHERE client_id = $1 AND revoked_at IS NULL",
        )
        .bind(client_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            Ok(())
        } else {
            Err(Error::ClientNotFound)
        }
    }

    async fn verify_credentials(
        &self,
        client_id: Uuid,
        secret: &str,
    ) -> Result<ClientRecord, Error> {
        let row = query("SELECT secret_hash, revoked_at FROM machine_clients WHERE client_id = $1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::InvalidClientCredentials)?;

        let secret_hash: String = row.get("secret_hash");
        let revoked_at: Option<DateTime<Utc>> = row.get("revoked_at");

        let parsed = PasswordHash::new(&secret_hash).map_err(|_| Error::Hash)?;
        Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .map_err(|_| Error::InvalidClientCredentials)?;

        if revoked_at.is_some() {
            return Err(Error::ClientRevoked);
        }

        self.fetch(client_id).await
    }
}

/// Mints machine tokens for verified clients.
pub struct TokenMinter {
    secret: Secret,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl TokenMinter {
    pub fn new(secret: Secret, issuer: String, audience: String, ttl: Duration) -> Self {
        Self {
            secret,
            issuer,
            audience,
            ttl,
        }
    }

    pub fn mint(
        &self,
        client_id: Uuid,
        roles: Vec<String>,
        permissions: Vec<String>,
    ) -> Result<TokenResponse, Error> {
        let claim = Claim::new_machine(
            client_id,
            roles,
            permissions,
            &self.issuer,
            &self.audience,
            self.ttl,
        );
        let access_token = claim.into_token(&self.secret)?;

        Ok(TokenResponse {
            access_token,
            token_type: "bearer".to_string(),
            expires_in: self.ttl.num_seconds() as u64,
        })
    }
}
