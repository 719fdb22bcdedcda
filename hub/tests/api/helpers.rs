use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use axum::Router;
use chrono::Utc;
use flowplane_common::backends::auth::GrantsSource;
use flowplane_common::backends::client::ClientError;
use flowplane_common::claims::{Claim, TokenFamily, TokenVerifier};
use flowplane_common::models::conversation::MessageRole;
use flowplane_common::models::error::{Error, ErrorKind};
use flowplane_common::models::user::GrantsResponse;
use flowplane_common::models::{Page, Paging};
use flowplane_common::Secret;
use flowplane_hub::dal::{Conversation, Dal, Message};
use flowplane_hub::runtime::{AgentRuntime, RuntimeError};
use flowplane_hub::subscribers::SubscriberRegistry;
use flowplane_hub::turn::{EndpointResolver, ServiceTokens, TurnRunner};
use flowplane_hub::{ApiBuilder, RouterState};
use futures::stream::BoxStream;
use futures::StreamExt;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::Request;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

pub const PROVIDER_SECRET: &str = "provider-secret";
pub const M2M_SECRET: &str = "m2m-secret";

#[derive(Default)]
pub struct InMemoryDal {
    state: Mutex<(HashMap<Uuid, Conversation>, Vec<Message>)>,
}

impl InMemoryDal {
    pub fn messages(&self, conversation_id: Uuid) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .state
            .lock()
            .unwrap()
            .1
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        messages
    }
}

#[async_trait]
impl Dal for InMemoryDal {
    async fn create_conversation(
        &self,
        owner_id: Option<Uuid>,
        agent_id: Option<Uuid>,
        title: Option<String>,
        metadata: Value,
    ) -> Result<Conversation, Error> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            owner_id,
            agent_id,
            title,
            metadata,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.state
            .lock()
            .unwrap()
            .0
            .insert(conversation.id, conversation.clone());

        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Conversation, Error> {
        self.state
            .lock()
            .unwrap()
            .0
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    async fn list_conversations(
        &self,
        owner_scope: Option<Uuid>,
        paging: &Paging,
    ) -> Result<Page<Conversation>, Error> {
        let state = self.state.lock().unwrap();
        let mut items: Vec<Conversation> = state
            .0
            .values()
            .filter(|c| owner_scope.map_or(true, |o| c.owner_id == Some(o)))
            .cloned()
            .collect();
        items.sort_by_key(|c| c.created_at);
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

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        metadata: Value,
    ) -> Result<Message, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.0.contains_key(&conversation_id) {
            return Err(Error::from_kind(ErrorKind::NotFound));
        }

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
        };
        state.1.push(message.clone());

        Ok(message)
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        paging: &Paging,
    ) -> Result<Page<Message>, Error> {
        let items = self.messages(conversation_id);
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

    async fn healthy(&self) -> bool {
        true
    }
}

pub struct StubResolver {
    pub endpoint: Option<String>,
}

#[async_trait]
impl EndpointResolver for StubResolver {
    async fn running_endpoint(&self, _: Uuid) -> Result<Option<String>, ClientError> {
        Ok(self.endpoint.clone())
    }
}

pub struct StubTokens;

#[async_trait]
impl ServiceTokens for StubTokens {
    async fn token(&self) -> Result<String, ClientError> {
        Ok("machine-token".to_string())
    }
}

pub struct StubRuntime {
    pub chunks: Vec<String>,
    pub fail_login: AtomicBool,
}

impl StubRuntime {
    pub fn streaming(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            fail_login: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl AgentRuntime for StubRuntime {
    async fn login(&self, _: &str, _: &str) -> Result<String, RuntimeError> {
        if self.fail_login.load(Ordering::SeqCst) {
            return Err(RuntimeError::AuthFailed);
        }

        Ok("runtime-bearer".to_string())
    }

    async fn stream_turn(
        &self,
        _: &str,
        _: &str,
        _: Uuid,
        _: &str,
    ) -> Result<BoxStream<'static, Result<String, RuntimeError>>, RuntimeError> {
        let chunks: Vec<Result<String, RuntimeError>> =
            self.chunks.iter().cloned().map(Ok).collect();

        Ok(futures::stream::iter(chunks).boxed())
    }
}

struct StaticGrants;

#[async_trait]
impl GrantsSource for StaticGrants {
    async fn grants_for(&self, user_id: Uuid) -> Result<GrantsResponse, ClientError> {
        Ok(GrantsResponse {
            user_id,
            roles: vec!["member".to_string()],
            permissions: vec![
                "conversation:read".to_string(),
                "conversation:write".to_string(),
            ],
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub dal: Arc<InMemoryDal>,
    pub owner_id: Uuid,
}

pub fn app(runtime: Arc<StubRuntime>, endpoint: Option<String>) -> TestApp {
    let dal = Arc::new(InMemoryDal::default());
    let registry = SubscriberRegistry::default();
    let owner_id = Uuid::new_v4();

    let turns = Arc::new(TurnRunner::new(
        dal.clone(),
        registry.clone(),
        Arc::new(StubResolver { endpoint }),
        runtime,
        Arc::new(StubTokens),
        true,
    ));

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
            dal: dal.clone(),
            registry,
            turns,
            ready: Arc::new(AtomicBool::new(true)),
        })
        .with_verifier(verifier)
        .with_grants(Arc::new(StaticGrants))
        .into_router();

    TestApp {
        router,
        dal,
        owner_id,
    }
}

pub fn user_token(user_id: Uuid) -> String {
    Claim::new_machine(
        user_id,
        vec![],
        vec![],
        "https://identity.example.com/auth/v1",
        "authenticated",
        chrono::Duration::hours(1),
    )
    .into_token(&Secret::new(PROVIDER_SECRET.to_string()))
    .unwrap()
}

impl TestApp {
    /// Serve this app on an ephemeral port for WebSocket clients; plain REST
    /// calls can keep using [`TestApp::send`] against the same shared state.
    pub async fn spawn(&self) -> SocketAddr {
        let port = portpicker::pick_unused_port().expect("no free port");
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let router = self.router.clone();

        tokio::spawn(async move {
            axum::Server::bind(&addr)
                .serve(router.into_make_service())
                .await
                .unwrap();
        });

        // Wait for the listener to come up before handing the address out.
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                return addr;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("test server never came up on {addr}");
    }

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

    pub async fn create_conversation(&self, agent_id: Option<Uuid>) -> Uuid {
        let response = self
            .post_json(
                "/api/v1/conversations",
                &user_token(self.owner_id),
                serde_json::json!({"title": "test", "agent_id": agent_id}),
            )
            .await;
        assert_eq!(response.status(), http::StatusCode::CREATED);

        let body = body_json(response).await;
        body["id"].as_str().unwrap().parse().unwrap()
    }
}

pub async fn body_json(response: Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
