use async_trait::async_trait;
use flowplane_common::models::user::{PermissionResponse, RoleResponse};
use sqlx::{query, query_scalar, FromRow, PgPool};
use uuid::Uuid;

use crate::error::Error;

#[derive(Clone, Debug, FromRow)]
pub struct RoleRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

impl From<RoleRecord> for RoleResponse {
    fn from(role: RoleRecord) -> Self {
        Self {
            id: role.id,
            name: role.name,
            description: role.description,
        }
    }
}

#[derive(Clone, Debug, FromRow)]
pub struct PermissionRecord {
    pub id: Uuid,
    pub name: String,
}

impl From<PermissionRecord> for PermissionResponse {
    fn from(permission: PermissionRecord) -> Self {
        Self {
            id: permission.id,
            name: permission.name,
        }
    }
}

/// Role and permission storage. Names are unique and immutable after creation;
/// a user's effective permission set is the union over their roles.
#[async_trait]
pub trait RbacManagement: Send + Sync {
    async fn create_role(&self, name: &str, description: Option<&str>)
        -> Result<RoleRecord, Error>;
    async fn list_roles(&self) -> Result<Vec<RoleRecord>, Error>;
    async fn delete_role(&self, id: Uuid) -> Result<(), Error>;

    async fn create_permission(&self, name: &str) -> Result<PermissionRecord, Error>;
    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>, Error>;
    async fn delete_permission(&self, id: Uuid) -> Result<(), Error>;

    async fn attach_permission(&self, role_id: Uuid, permission_id: Uuid) -> Result<(), Error>;

    /// Role names and the union of their permissions for one user.
    async fn grants_for_user(&self, user_id: Uuid) -> Result<(Vec<String>, Vec<String>), Error>;

    /// The union of permissions granted by the given role names.
    async fn permissions_for_roles(&self, roles: &[String]) -> Result<Vec<String>, Error>;
}

#[derive(Clone)]
pub struct RbacManager {
    pub pool: PgPool,
}

#[async_trait]
impl RbacManagement for RbacManager {
    async fn create_role(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<RoleRecord, Error> {
        sqlx::query_as(
            "INSERT INTO roles (name, description) VALUES ($1, $2)
             RETURNING id, name, description",
        )
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::NameTaken,
            _ => Error::Database(err),
        })
    }

    async fn list_roles(&self) -> Result<Vec<RoleRecord>, Error> {
        Ok(
            sqlx::query_as("SELECT id, name, description FROM roles ORDER BY name")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn delete_role(&self, id: Uuid) -> Result<(), Error> {
        let rows_affected = query("DELETE FROM roles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows_affected > 0 {
            Ok(())
        } else {
            Err(Error::RoleNotFound)
        }
    }

    async fn create_permission(&self, name: &str) -> Result<PermissionRecord, Error> {
        sqlx::query_as("INSERT INTO permissions (name) VALUES ($1) RETURNING id, name")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| match &err {
                sqlx::Error::Database(db) if db.is_unique_violation() => Error::NameTaken,
                _ => Error::Database(err),
            })
    }

    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>, Error> {
        Ok(
            sqlx::query_as("SELECT id, name FROM permissions ORDER BY name")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn delete_permission(&self, id: Uuid) -> Result<(), Error> {
        let rows_affected = query("DELETE FROM permissions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows_affected > 0 {
            Ok(())
        } else {
            Err(Error::PermissionNotFound)
        }
    }

    async fn attach_permission(&self, role_id: Uuid, permission_id: Uuid) -> Result<(), Error> {
        query(
            "INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(role_id)
        .bind(permission_id)
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => Error::RoleNotFound,
            _ => Error::Database(err),
        })?;

        Ok(())
    }

    async fn grants_for_user(&self, user_id: Uuid) -> Result<(Vec<String>, Vec<String>), Error> {
        let roles: Vec<String> = query_scalar(
            "SELECT r.name FROM roles r
             JOIN user_roles ur ON ur.role_id = r.id
             WHERE ur.user_id = $1
             ORDER BY r.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let permissions: Vec<String> = query_scalar(
            "SELECT DISTINCT p.name FROM permissions p
             JOIN role_permissions rp ON rp.permission_id = p.id
             JOIN user_roles ur ON ur.role_id = rp.role_id
             WHERE ur.user_id = $1
             ORDER BY p.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok((roles, permissions))
    }

    async fn permissions_for_roles(&self, roles: &[String]) -> Result<Vec<String>, Error> {
        Ok(query_scalar(
            "SELECT DISTINCT p.name FROM permissions p
             JOIN role_permissions rp ON rp.permission_id = p.id
             JOIN roles r ON r.id = rp.role_id
             WHERE r.name = ANY($1)
             ORDER BY p.name",
        )
        .bind(roles)
        .fetch_all(&self.pool)
        .await?)
    }
}
