use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use axum::Router;
use chrono::{Duration, Utc};
use flowplane_catalog::dal::{Agent, AgentVersion, Dal};
use flowplane_catalog::{ApiBuilder, RouterState};
use flowplane_common::backends::auth::GrantsSource;
use flowplane_common::backends::client::ClientError;
use flowplane_common::claims::{Claim, TokenFamily, TokenVerifier};
use flowplane_common::models::agent::{AgentFilters, AgentStatus};
use flowplane_common::models::error::{Error, ErrorKind};
use flowplane_common::models::user::GrantsResponse;
use flowplane_common::models::{Page, Paging};
use flowplane_common::Secret;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::Request;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

pub const PROVIDER_SECRET: &str = "provider-secret";
pub const M2M_SECRET: &str = "m2m-secret";

#[derive(Default)]
pub struct InMemoryDal {
    // One lock over both maps mirrors the per-agent serialization the real
    // store gets from its row locks.
    state: Mutex<(HashMap<Uuid, Agent>, Vec<AgentVersion>)>,
}

#[async_trait]
impl Dal for InMemoryDal {
    async fn create_agent(
        &self,
        owner_id: Uuid,
        name: &str,
        description: Option<&str>,
        tags: &[String],
        config: Value,
    ) -> Result<(Agent, AgentVersion), Error> {
        let mut state = self.state.lock().unwrap();

        if state
            .0
            .values()
            .any(|a| a.owner_id == owner_id && a.name == name)
        {
            return Err(Error::custom(
                ErrorKind::Conflict,
                "an agent with that name already exists",
            ));
        }

        let agent = Agent {
            id: Uuid::new_v4(),
            owner_id,
            name: name.to_string(),
            description: description.map(str::to_string),
            status: AgentStatus::Draft,
            tags: tags.to_vec(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let version = AgentVersion {
            id: Uuid::new_v4(),
            agent_id: agent.id,
            owner_id,
            version_number: 1,
            config,
            changelog: None,
            published_at: None,
            created_at: Utc::now(),
        };

        state.0.insert(agent.id, agent.clone());
        state.1.push(version.clone());

        Ok((agent, version))
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, Error> {
        self.state
            .lock()
            .unwrap()
            .0
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn update_agent(
        &self,
        agent_id: Uuid,
        name: Option<String>,
        description: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Agent, Error> {
        let mut state = self.state.lock().unwrap();
        let agent = state
            .0
            .get_mut(&agent_id)
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        if let Some(name) = name {
            agent.name = name;
        }
        if let Some(description) = description {
            agent.description = Some(description);
        }
        if let Some(tags) = tags {
            agent.tags = tags;
        }
        agent.updated_at = Utc::now();

        Ok(agent.clone())
    }

    async fn archive_agent(&self, agent_id: Uuid) -> Result<Agent, Error> {
        let mut state = self.state.lock().unwrap();
        let agent = state
            .0
            .get_mut(&agent_id)
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        agent.status = AgentStatus::Archived;

        Ok(agent.clone())
    }

    async fn list_agents(
        &self,
        owner_scope: Option<Uuid>,
        filters: &AgentFilters,
        paging: &Paging,
    ) -> Result<Page<Agent>, Error> {
        let state = self.state.lock().unwrap();
        let mut items: Vec<Agent> = state
            .0
            .values()
            .filter(|a| owner_scope.map_or(true, |owner| a.owner_id == owner))
            .filter(|a| filters.status.map_or(true, |s| a.status == s))
            .filter(|a| {
                filters
                    .tag
                    .as_ref()
                    .map_or(true, |tag| a.tags.contains(tag))
            })
            .cloned()
            .collect();
        items.sort_by_key(|a| a.created_at);
        items.reverse();

        let total = items.len() as i64;
        let items = items
            .into_iter()
            .skip(paging.offset() as usize)
            .take(paging.limit() as usize)
            .collect();

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
        config: Value,
        changelog: Option<String>,
    ) -> Result<AgentVersion, Error> {
        let mut state = self.state.lock().unwrap();

        let agent = state
            .0
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        if agent.status == AgentStatus::Archived {
            return Err(Error::custom(
                ErrorKind::Conflict,
                "agent is archived and no longer accepts versions",
            ));
        }

        let next = state
            .1
            .iter()
            .filter(|v| v.agent_id == agent_id)
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1;

        let version = AgentVersion {
            id: Uuid::new_v4(),
            agent_id,
            owner_id: agent.owner_id,
            version_number: next,
            config,
            changelog,
            published_at: None,
            created_at: Utc::now(),
        };
        state.1.push(version.clone());

        Ok(version)
    }

    async fn get_version(&self, agent_id: Uuid, version_id: Uuid) -> Result<AgentVersion, Error> {
        self.state
            .lock()
            .unwrap()
            .1
            .iter()
            .find(|v| v.agent_id == agent_id && v.id == version_id)
            .cloned()
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn latest_version(&self, agent_id: Uuid) -> Result<AgentVersion, Error> {
        self.state
            .lock()
            .unwrap()
            .1
            .iter()
            .filter(|v| v.agent_id == agent_id)
            .max_by_key(|v| v.version_number)
            .cloned()
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn list_versions(
        &self,
        agent_id: Uuid,
        paging: &Paging,
    ) -> Result<Page<AgentVersion>, Error> {
        let state = self.state.lock().unwrap();
        let mut items: Vec<AgentVersion> = state
            .1
            .iter()
            .filter(|v| v.agent_id == agent_id)
            .cloned()
            .collect();
        items.sort_by_key(|v| std::cmp::Reverse(v.version_number));

        let total = items.len() as i64;
        let items = items
            .into_iter()
            .skip(paging.offset() as usize)
            .take(paging.limit() as usize)
            .collect();

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
        let mut state = self.state.lock().unwrap();

        let version = state
            .1
            .iter_mut()
            .find(|v| v.agent_id == agent_id && v.id == version_id)
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        if version.published_at.is_none() {
            version.published_at = Some(Utc::now());
        }
        let version = version.clone();

        if let Some(agent) = state.0.get_mut(&agent_id) {
            if agent.status != AgentStatus::Archived {
                agent.status = AgentStatus::Published;
            }
        }

        Ok(version)
    }

    async fn healthy(&self) -> bool {
        true
    }
}

pub struct StaticGrants {
    pub grants: HashMap<Uuid, (Vec<String>, Vec<String>)>,
}

#[async_trait]
impl GrantsSource for StaticGrants {
    async fn grants_for(&self, user_id: Uuid) -> Result<GrantsResponse, ClientError> {
        let (roles, permissions) = self.grants.get(&user_id).cloned().unwrap_or_default();

        Ok(GrantsResponse {
            user_id,
            roles,
            permissions,
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub owner_id: Uuid,
    pub other_id: Uuid,
    pub auditor_id: Uuid,
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

pub fn machine_token(permissions: Vec<String>) -> String {
    Claim::new_machine(
        Uuid::new_v4(),
        vec!["service_client".to_string()],
        permissions,
        "flowplane",
        "flowplane-services",
        Duration::minutes(15),
    )
    .into_token(&Secret::new(M2M_SECRET.to_string()))
    .unwrap()
}

pub fn app() -> TestApp {
    app_with_cap(flowplane_common::models::agent::DEFAULT_CONFIG_MAX_BYTES)
}

pub fn app_with_cap(config_max_bytes: usize) -> TestApp {
    let owner_id = Uuid::new_v4();
    let other_id = Uuid::new_v4();
    let auditor_id = Uuid::new_v4();

    let member_grants = (
        vec!["member".to_string()],
        vec!["agent:read".to_string(), "agent:write".to_string()],
    );
    let grants = HashMap::from([
        (owner_id, member_grants.clone()),
        (other_id, member_grants),
        (
            auditor_id,
            (
                vec!["auditor".to_string()],
                vec!["agent:read:any".to_string()],
            ),
        ),
    ]);

    let verifier = TokenVerifier::new(
        TokenFamily {
            secret: Secret::new(PROVIDER_SECRET.to_string()),
            issuer: None,
            audience: "authenticated".to_string(),
        },
        TokenFamily {
            secret: Secret::new(M2M_SECRET.to_string()),
            issuer: Some("flowplane".to_string()),
            audience: "flowplane-services".to_string(),
        },
    );

    let router = ApiBuilder::new()
        .with_state(RouterState {
            dal: Arc::new(InMemoryDal::default()),
            config_max_bytes,
            ready: Arc::new(AtomicBool::new(true)),
        })
        .with_verifier(verifier)
        .with_grants(Arc::new(StaticGrants { grants }))
        .into_router();

    TestApp {
        router,
        owner_id,
        other_id,
        auditor_id,
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

    pub async fn post_json(&self, uri: &str, token: &str, body: Value) -> Response {
        self.send(
            Request::post(uri)
                .header(CONTENT_TYPE, "application/json")
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
    }

    pub async fn get(&self, uri: &str, token: &str) -> Response {
        self.send(
            Request::get(uri)
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn create_agent(&self, name: &str) -> Value {
        let response = self
            .post_json(
                "/api/v1/agents",
                &user_token(self.owner_id),
                serde_json::json!({"name": name, "config": {"nodes": [], "edges": []}}),
            )
            .await;
        assert_eq!(response.status(), http::StatusCode::CREATED);

        body_json(response).await
    }
}

pub async fn body_json(response: Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
