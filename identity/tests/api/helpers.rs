use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use axum::Router;
use chrono::{Duration, Utc};
use flowplane_common::claims::{Claim, TokenFamily, TokenVerifier};
use flowplane_common::Secret;
use flowplane_identity::client::{ClientManagement, ClientRecord, TokenMinter};
use flowplane_identity::error::Error;
use flowplane_identity::provider::{IdentityProvider, ProviderSignup};
use flowplane_identity::rbac::{PermissionRecord, RbacManagement, RoleRecord};
use flowplane_identity::user::{Profile, ProfileManagement};
use flowplane_identity::{ApiBuilder, RouterState};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::Request;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

pub const PROVIDER_SECRET: &str = "provider-secret";
pub const M2M_SECRET: &str = "m2m-secret";
pub const M2M_ISSUER: &str = "flowplane";
pub const M2M_AUDIENCE: &str = "flowplane-services";

pub struct TestApp {
    pub router: Router,
    pub admin_id: Uuid,
    pub member_id: Uuid,
}

#[derive(Default)]
pub struct InMemoryProfiles {
    profiles: Mutex<HashMap<Uuid, Profile>>,
}

#[async_trait]
impl ProfileManagement for InMemoryProfiles {
    async fn create_profile(
        &self,
        id: Uuid,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<Profile, Error> {
        let mut profiles = self.profiles.lock().unwrap();
        if profiles.values().any(|p| p.email == email) {
            return Err(Error::EmailTaken);
        }

        let profile = Profile {
            id,
            email: email.to_string(),
            display_name: display_name.map(str::to_string),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        profiles.insert(id, profile.clone());

        Ok(profile)
    }

    async fn get_profile(&self, id: Uuid) -> Result<Profile, Error> {
        self.profiles
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::ProfileNotFound)
    }

    async fn update_profile(
        &self,
        id: Uuid,
        display_name: Option<String>,
    ) -> Result<Profile, Error> {
        let mut profiles = self.profiles.lock().unwrap();
        let profile = profiles.get_mut(&id).ok_or(Error::ProfileNotFound)?;
        profile.display_name = display_name;
        profile.updated_at = Utc::now();

        Ok(profile.clone())
    }

    async fn ensure_admin(&self, id: Uuid, email: &str) -> Result<(), Error> {
        let mut profiles = self.profiles.lock().unwrap();
        profiles.entry(id).or_insert_with(|| Profile {
            id,
            email: email.to_string(),
            display_name: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/// Role/permission fixture: admin and member roles plus per-user assignments.
pub struct InMemoryRbac {
    pub user_roles: Mutex<HashMap<Uuid, Vec<String>>>,
    pub role_permissions: Mutex<HashMap<String, Vec<String>>>,
    pub roles: Mutex<Vec<RoleRecord>>,
    pub permissions: Mutex<Vec<PermissionRecord>>,
}

impl Default for InMemoryRbac {
    fn default() -> Self {
        let role_permissions = HashMap::from([
            ("admin".to_string(), vec!["admin:manage".to_string()]),
            (
                "member".to_string(),
                vec!["agent:read".to_string(), "agent:write".to_string()],
            ),
            (
                "conversation_client".to_string(),
                vec!["identity:read".to_string(), "agent:read:any".to_string()],
            ),
        ]);

        Self {
            user_roles: Mutex::new(HashMap::new()),
            role_permissions: Mutex::new(role_permissions),
            roles: Mutex::new(
                ["admin", "member", "conversation_client"]
                    .iter()
                    .map(|name| RoleRecord {
                        id: Uuid::new_v4(),
                        name: name.to_string(),
                        description: None,
                    })
                    .collect(),
            ),
            permissions: Mutex::new(vec![]),
        }
    }
}

#[async_trait]
impl RbacManagement for InMemoryRbac {
    async fn create_role(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<RoleRecord, Error> {
        let mut roles = self.roles.lock().unwrap();
        if roles.iter().any(|r| r.name == name) {
            return Err(Error::NameTaken);
        }
        let role = RoleRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.map(str::to_string),
        };
        roles.push(role.clone());

        Ok(role)
    }

    async fn list_roles(&self) -> Result<Vec<RoleRecord>, Error> {
        Ok(self.roles.lock().unwrap().clone())
    }

    async fn delete_role(&self, id: Uuid) -> Result<(), Error> {
        let mut roles = self.roles.lock().unwrap();
        let before = roles.len();
        roles.retain(|r| r.id != id);
        if roles.len() == before {
            return Err(Error::RoleNotFound);
        }

        Ok(())
    }

    async fn create_permission(&self, name: &str) -> Result<PermissionRecord, Error> {
        let mut permissions = self.permissions.lock().unwrap();
        if permissions.iter().any(|p| p.name == name) {
            return Err(Error::NameTaken);
        }
        let permission = PermissionRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        permissions.push(permission.clone());

        Ok(permission)
    }

    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>, Error> {
        Ok(self.permissions.lock().unwrap().clone())
    }

    async fn delete_permission(&self, id: Uuid) -> Result<(), Error> {
        let mut permissions = self.permissions.lock().unwrap();
        let before = permissions.len();
        permissions.retain(|p| p.id != id);
        if permissions.len() == before {
            return Err(Error::PermissionNotFound);
        }

        Ok(())
    }

    async fn attach_permission(&self, role_id: Uuid, permission_id: Uuid) -> Result<(), Error> {
        let roles = self.roles.lock().unwrap();
        let role = roles
            .iter()
            .find(|r| r.id == role_id)
            .ok_or(Error::RoleNotFound)?;
        let permissions = self.permissions.lock().unwrap();
        let permission = permissions
            .iter()
            .find(|p| p.id == permission_id)
            .ok_or(Error::PermissionNotFound)?;

        self.role_permissions
            .lock()
            .unwrap()
            .entry(role.name.clone())
            .or_default()
            .push(permission.name.clone());

        Ok(())
    }

    async fn grants_for_user(&self, user_id: Uuid) -> Result<(Vec<String>, Vec<String>), Error> {
        let roles = self
            .user_roles
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_default();
        let permissions = self.permissions_for_roles(&roles).await?;

        Ok((roles, permissions))
    }

    async fn permissions_for_roles(&self, roles: &[String]) -> Result<Vec<String>, Error> {
        let map = self.role_permissions.lock().unwrap();
        let mut permissions: Vec<String> = roles
            .iter()
            .flat_map(|role| map.get(role).cloned().unwrap_or_default())
            .collect();
        permissions.sort();
        permissions.dedup();

        Ok(permissions)
    }
}

#[derive(Default)]
pub struct InMemoryClients {
    clients: Mutex<HashMap<Uuid, (ClientRecord, String)>>,
}

#[async_trait]
impl ClientManagement for InMemoryClients {
    async fn create_client(
        &self,
        name: &str,
        roles: &[String],
    ) -> Result<(ClientRecord, String), Error> {
        let mut clients = self.clients.lock().unwrap();
        if clients.values().any(|(c, _)| c.name == name) {
            return Err(Error::ClientNameTaken);
        }

        let record = ClientRecord {
            client_id: Uuid::new_v4(),
            name: name.to_string(),
            roles: roles.to_vec(),
            created_at: Utc::now(),
            revoked_at: None,
        };
        let secret = Uuid::new_v4().simple().to_string();
        clients.insert(record.client_id, (record.clone(), secret.clone()));

        Ok((record, secret))
    }

    async fn list_clients(&self) -> Result<Vec<ClientRecord>, Error> {
        Ok(self
            .clients
            .lock()
            .unwrap()
            .values()
            .map(|(c, _)| c.clone())
            .collect())
    }

    async fn assign_roles(
        &self,
        client_id: Uuid,
        roles: &[String],
    ) -> Result<ClientRecord, Error> {
        let mut clients = self.clients.lock().unwrap();
        let (record, _) = clients.get_mut(&client_id).ok_or(Error::ClientNotFound)?;
        record.roles = roles.to_vec();

        Ok(record.clone())
    }

    async fn revoke(&self, client_id: Uuid) -> Result<(), Error> {
        let mut clients = self.clients.lock().unwrap();
        let (record, _) = clients.get_mut(&client_id).ok_or(Error::ClientNotFound)?;
        record.revoked_at = Some(Utc::now());

        Ok(())
    }

    async fn verify_credentials(
        &self,
        client_id: Uuid,
        secret: &str,
    ) -> Result<ClientRecord, Error> {
        let clients = self.clients.lock().unwrap();
        let (record, stored) = clients
            .get(&client_id)
            .ok_or(Error::InvalidClientCredentials)?;
        if stored.as_str() != secret {
            return Err(Error::InvalidClientCredentials);
        }
        if record.revoked_at.is_some() {
            return Err(Error::ClientRevoked);
        }

        Ok(record.clone())
    }
}

/// Provider stub that accepts everything and assigns fresh user ids.
pub struct StubProvider {
    pub taken: Mutex<Vec<String>>,
}

#[async_trait]
impl IdentityProvider for StubProvider {
    async fn register(&self, email: &str, _password: &str) -> Result<ProviderSignup, Error> {
        let mut taken = self.taken.lock().unwrap();
        if taken.iter().any(|e| e == email) {
            return Err(Error::EmailTaken);
        }
        taken.push(email.to_string());

        Ok(ProviderSignup {
            user_id: Uuid::new_v4(),
            tokens: json!({"access_token": "provider-token", "token_type": "bearer"}),
        })
    }

    async fn login(&self, email: &str, _password: &str) -> Result<Value, Error> {
        Ok(json!({"access_token": format!("token-for-{email}"), "token_type": "bearer"}))
    }
}

pub fn user_token(user_id: Uuid) -> String {
    Claim::new_machine(
        user_id,
        vec![],
        vec![],
        "https://identity.example.com/auth/v1",
        "authenticated",
        Duration::hours(1),
    )
    .into_token(&Secret::new(PROVIDER_SECRET.to_string()))
    .unwrap()
}

pub async fn app() -> TestApp {
    let admin_id = Uuid::new_v4();
    let member_id = Uuid::new_v4();

    let rbac = InMemoryRbac::default();
    rbac.user_roles
        .lock()
        .unwrap()
        .insert(admin_id, vec!["admin".to_string()]);
    rbac.user_roles
        .lock()
        .unwrap()
        .insert(member_id, vec!["member".to_string()]);

    let verifier = TokenVerifier::new(
        TokenFamily {
            secret: Secret::new(PROVIDER_SECRET.to_string()),
            issuer: None,
            audience: "authenticated".to_string(),
        },
        TokenFamily {
            secret: Secret::new(M2M_SECRET.to_string()),
            issuer: Some(M2M_ISSUER.to_string()),
            audience: M2M_AUDIENCE.to_string(),
        },
    );

    let router = ApiBuilder::new()
        .with_state(RouterState {
            profiles: Arc::new(InMemoryProfiles::default()),
            rbac: Arc::new(rbac),
            clients: Arc::new(InMemoryClients::default()),
            provider: Arc::new(StubProvider {
                taken: Mutex::new(vec![]),
            }),
            minter: Arc::new(TokenMinter::new(
                Secret::new(M2M_SECRET.to_string()),
                M2M_ISSUER.to_string(),
                M2M_AUDIENCE.to_string(),
                Duration::minutes(15),
            )),
            ready: Arc::new(AtomicBool::new(true)),
        })
        .with_verifier(verifier)
        .into_router();

    TestApp {
        router,
        admin_id,
        member_id,
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("failed to execute request")
    }

    pub async fn post_json(&self, uri: &str, bearer: Option<&str>, body: Value) -> Response {
        let mut builder = Request::post(uri).header(CONTENT_TYPE, "application/json");
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        self.send(
            builder
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
    }

    pub async fn get(&self, uri: &str, bearer: Option<&str>) -> Response {
        let mut builder = Request::get(uri);
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub fn admin_token(&self) -> String {
        user_token(self.admin_id)
    }

    pub fn member_token(&self) -> String {
        user_token(self.member_id)
    }
}

pub async fn body_json(response: Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
