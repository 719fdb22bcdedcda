mod api;
pub mod args;
pub mod dal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use flowplane_common::backends::bootstrap::{bootstrap, BootstrapSettings};
use flowplane_common::backends::client::{IdentityApiClient, ServicesApiClient};
use flowplane_common::backends::cors::cors_layer;
use flowplane_common::claims::{TokenFamily, TokenVerifier};
use flowplane_common::Secret;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

pub use api::{serve, ApiBuilder, RouterState};
pub use args::Args;

use dal::Postgres;

pub static MIGRATIONS: Migrator = sqlx::migrate!("./migrations");

/// Well-known machine client name of this service.
pub const CLIENT_NAME: &str = "catalog_service_client";

pub async fn pgpool_init(db_uri: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(db_uri)
        .await
        .context("failed to connect to the database")?;
    MIGRATIONS.run(&pool).await.context("failed to run migrations")?;

    Ok(pool)
}

pub fn token_verifier(args: &Args) -> TokenVerifier {
    TokenVerifier::new(
        TokenFamily {
            secret: Secret::new(args.provider_jwt_secret.clone()),
            issuer: None,
            audience: args.user_audience.clone(),
        },
        TokenFamily {
            secret: Secret::new(args.m2m_jwt_secret.clone()),
            issuer: Some(args.m2m_issuer.clone()),
            audience: args.m2m_audience.clone(),
        },
    )
}

pub async fn start(pool: PgPool, args: Args) -> anyhow::Result<()> {
    let verifier = token_verifier(&args);
    let ready = Arc::new(AtomicBool::new(false));

    // Acquire this service's machine identity. Failure is fatal by design.
    let tokens = bootstrap(BootstrapSettings {
        identity_uri: args.identity_url.clone(),
        admin_email: args.admin_email.clone(),
        admin_password: Secret::new(args.admin_password.clone()),
        client_name: CLIENT_NAME.to_string(),
        client_roles: vec!["catalog_client".to_string()],
        credentials_path: args.credentials_file.clone(),
    })
    .await
    .context("bootstrap against the identity store failed")?;

    let identity = IdentityApiClient::new(ServicesApiClient::new(&args.identity_url), tokens);

    ready.store(true, Ordering::Relaxed);

    let router = ApiBuilder::new()
        .with_state(RouterState {
            dal: Arc::new(Postgres::new(pool)),
            config_max_bytes: args.config_max_bytes,
            ready,
        })
        .with_verifier(verifier)
        .with_grants(Arc::new(identity))
        .into_router()
        .layer(cors_layer(&args.cors_origins));
    let router = mount(router, &args.root_path);

    info!(address = %args.address, "binding to and listening at address");

    serve(router, args.address).await;

    Ok(())
}

fn mount(router: axum::Router, root_path: &str) -> axum::Router {
    if root_path.is_empty() || root_path == "/" {
        router
    } else {
        axum::Router::new().nest(root_path, router)
    }
}
