mod api;
pub mod args;
pub mod build;
pub mod dal;
pub mod deploy;
pub mod registry;
pub mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use flowplane_common::backends::bootstrap::{bootstrap, BootstrapSettings};
use flowplane_common::backends::client::{
    CatalogApiClient, IdentityApiClient, ServicesApiClient,
};
use flowplane_common::backends::cors::cors_layer;
use flowplane_common::claims::{TokenFamily, TokenVerifier};
use flowplane_common::models::deployment::{BuildStrategyKind, DeployStrategyKind};
use flowplane_common::Secret;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

pub use api::{serve, ApiBuilder, RouterState, VersionValidator};
pub use args::Args;

use build::{BuildStrategy, CiDriven, ContextSettings, HostedBuild};
use dal::Postgres;
use deploy::{Cluster, DeployStrategy, Serverless};
use registry::RegistryClient;
use worker::{Worker, WorkerSettings};

pub static MIGRATIONS: Migrator = sqlx::migrate!("./migrations");

/// Well-known machine client name of this service.
pub const CLIENT_NAME: &str = "deployer_service_client";

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
        client_roles: vec!["deployer_client".to_string()],
        credentials_path: args.credentials_file.clone(),
    })
    .await
    .context("bootstrap against the identity store failed")?;

    let identity = IdentityApiClient::new(ServicesApiClient::new(&args.identity_url), tokens.clone());
    let catalog = Arc::new(CatalogApiClient::new(
        ServicesApiClient::new(&args.catalog_url),
        tokens,
    ));

    let dal = Arc::new(Postgres::new(pool));

    let mut builds: HashMap<BuildStrategyKind, Arc<dyn BuildStrategy>> = HashMap::new();
    builds.insert(
        BuildStrategyKind::CiDriven,
        Arc::new(CiDriven::new(
            ServicesApiClient::new(&args.ci_api_url),
            args.ci_workflow.clone(),
            args.ci_token.clone(),
        )),
    );
    builds.insert(
        BuildStrategyKind::HostedBuild,
        Arc::new(HostedBuild::new(
            ServicesApiClient::new(&args.build_api_url),
            args.build_api_token.clone(),
        )),
    );

    let mut deploys: HashMap<DeployStrategyKind, Arc<dyn DeployStrategy>> = HashMap::new();
    deploys.insert(
        DeployStrategyKind::Serverless,
        Arc::new(Serverless::new(
            ServicesApiClient::new(&args.platform_api_url),
            args.platform_token.clone(),
        )),
    );
    deploys.insert(
        DeployStrategyKind::Cluster,
        Arc::new(Cluster::new(
            ServicesApiClient::new(&args.cluster_api_url),
            args.cluster_namespace.clone(),
            args.platform_token.clone(),
        )),
    );

    let registry = Arc::new(RegistryClient::new(
        ServicesApiClient::new(&args.registry_api_url),
        args.registry_token.clone(),
    ));

    let settings = WorkerSettings {
        registry_base: args.registry_base.clone(),
        context: ContextSettings {
            runtime_image: args.runtime_image.clone(),
        },
        ..WorkerSettings::default()
    };

    for n in 0..args.worker_count.max(1) {
        let worker = Arc::new(Worker::new(
            format!("worker-{n}"),
            dal.clone(),
            catalog.clone(),
            builds.clone(),
            deploys.clone(),
            registry.clone(),
            settings.clone(),
        ));
        tokio::spawn(worker.run());
    }

    ready.store(true, Ordering::Relaxed);

    let router = ApiBuilder::new()
        .with_state(RouterState {
            dal,
            validator: catalog,
            default_build_strategy: args.build_strategy,
            default_deploy_strategy: args.deploy_strategy,
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
