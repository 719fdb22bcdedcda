mod api;
pub mod args;
pub mod client;
pub mod error;
pub mod provider;
pub mod rbac;
pub mod user;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::Duration;
use flowplane_common::backends::cors::cors_layer;
use flowplane_common::claims::{TokenFamily, TokenVerifier};
use flowplane_common::Secret;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

pub use api::{serve, ApiBuilder, RouterState};
pub use args::Args;

use client::{ClientManager, TokenMinter};
use provider::{HttpIdentityProvider, IdentityProvider};
use rbac::RbacManager;
use user::{ProfileManagement, ProfileManager};

pub static MIGRATIONS: Migrator = sqlx::migrate!("./migrations");

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

    let profiles = Arc::new(ProfileManager { pool: pool.clone() });
    let rbac = Arc::new(RbacManager { pool: pool.clone() });
    let clients = Arc::new(ClientManager { pool });
    let provider = Arc::new(HttpIdentityProvider::new(&args.provider_url));
    let minter = Arc::new(TokenMinter::new(
        Secret::new(args.m2m_jwt_secret.clone()),
        args.m2m_issuer.clone(),
        args.m2m_audience.clone(),
        Duration::minutes(args.m2m_token_ttl_minutes),
    ));
    let ready = Arc::new(AtomicBool::new(false));

    // A failure to line up the bootstrap admin is fatal; the service must not
    // serve traffic without it.
    ensure_admin(&args, &verifier, provider.as_ref(), profiles.as_ref()).await?;
    ready.store(true, Ordering::Relaxed);

    let router = ApiBuilder::new()
        .with_state(RouterState {
            profiles,
            rbac,
            clients,
            provider,
            minter,
            ready,
        })
        .with_verifier(verifier)
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

/// Make sure the configured admin account has a profile with the admin role.
async fn ensure_admin(
    args: &Args,
    verifier: &TokenVerifier,
    provider: &dyn IdentityProvider,
    profiles: &dyn ProfileManagement,
) -> anyhow::Result<()> {
    let tokens = provider
        .login(&args.admin_email, &args.admin_password)
        .await
        .context("bootstrap admin login failed")?;

    let access_token = tokens["access_token"]
        .as_str()
        .context("provider login response is missing 'access_token'")?;

    let verified = verifier
        .verify(access_token)
        .map_err(|err| anyhow::anyhow!("admin token failed verification: {err}"))?;
    let admin_id = Uuid::parse_str(&verified.claim.sub).context("admin token has no user id")?;

    profiles
        .ensure_admin(admin_id, &args.admin_email)
        .await
        .context("failed to upsert the admin profile")?;

    info!(admin = %args.admin_email, "bootstrap admin is in place");

    Ok(())
}
