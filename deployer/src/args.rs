use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use flowplane_common::models::deployment::{BuildStrategyKind, DeployStrategyKind};

/// The deployment engine: turns published agent versions into running
/// container services.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Address to bind to
    #[arg(long, env = "DEPLOYER_ADDRESS", default_value = "127.0.0.1:8002")]
    pub address: SocketAddr,

    /// Postgres connection string
    #[arg(long, env = "DEPLOYER_DATABASE_URL")]
    pub database_url: String,

    /// Base URI of the identity store
    #[arg(long, env = "DEPLOYER_IDENTITY_URL")]
    pub identity_url: String,

    /// Base URI of the agent catalog
    #[arg(long, env = "DEPLOYER_CATALOG_URL")]
    pub catalog_url: String,

    /// Secret the identity provider signs user tokens with
    #[arg(long, env = "DEPLOYER_PROVIDER_JWT_SECRET")]
    pub provider_jwt_secret: String,

    /// Audience of user tokens
    #[arg(long, env = "DEPLOYER_USER_AUDIENCE", default_value = "authenticated")]
    pub user_audience: String,

    /// Secret machine tokens are signed with
    #[arg(long, env = "DEPLOYER_M2M_JWT_SECRET")]
    pub m2m_jwt_secret: String,

    /// Issuer of machine tokens
    #[arg(long, env = "DEPLOYER_M2M_ISSUER", default_value = "flowplane")]
    pub m2m_issuer: String,

    /// Audience of machine tokens
    #[arg(long, env = "DEPLOYER_M2M_AUDIENCE", default_value = "flowplane-services")]
    pub m2m_audience: String,

    /// Admin account used during bootstrap
    #[arg(long, env = "DEPLOYER_ADMIN_EMAIL")]
    pub admin_email: String,

    /// Password of the bootstrap admin account
    #[arg(long, env = "DEPLOYER_ADMIN_PASSWORD")]
    pub admin_password: String,

    /// Where the bootstrap credentials are persisted
    #[arg(long, env = "DEPLOYER_CREDENTIALS_FILE", default_value = "deployer-credentials.json")]
    pub credentials_file: PathBuf,

    /// Build strategy used when a request does not pick one
    #[arg(long, env = "DEPLOYER_BUILD_STRATEGY", default_value = "ci_driven")]
    pub build_strategy: BuildStrategyKind,

    /// Deploy strategy used when a request does not pick one
    #[arg(long, env = "DEPLOYER_DEPLOY_STRATEGY", default_value = "serverless")]
    pub deploy_strategy: DeployStrategyKind,

    /// Base URI of the CI dispatch API
    #[arg(long, env = "DEPLOYER_CI_API_URL")]
    pub ci_api_url: String,

    /// Workflow identifier dispatched for image builds
    #[arg(long, env = "DEPLOYER_CI_WORKFLOW", default_value = "build-agent-image")]
    pub ci_workflow: String,

    /// Token for the CI API
    #[arg(long, env = "DEPLOYER_CI_TOKEN", default_value = "")]
    pub ci_token: String,

    /// Base URI of the hosted build service
    #[arg(long, env = "DEPLOYER_BUILD_API_URL")]
    pub build_api_url: String,

    /// Token for the hosted build service
    #[arg(long, env = "DEPLOYER_BUILD_API_TOKEN", default_value = "")]
    pub build_api_token: String,

    /// Base URI of the serverless platform API
    #[arg(long, env = "DEPLOYER_PLATFORM_API_URL")]
    pub platform_api_url: String,

    /// Token for the platform APIs
    #[arg(long, env = "DEPLOYER_PLATFORM_TOKEN", default_value = "")]
    pub platform_token: String,

    /// Base URI of the cluster API
    #[arg(long, env = "DEPLOYER_CLUSTER_API_URL")]
    pub cluster_api_url: String,

    /// Namespace agent workloads are applied into
    #[arg(long, env = "DEPLOYER_CLUSTER_NAMESPACE", default_value = "agents")]
    pub cluster_namespace: String,

    /// Base URI of the container registry API
    #[arg(long, env = "DEPLOYER_REGISTRY_API_URL")]
    pub registry_api_url: String,

    /// Token for the registry API
    #[arg(long, env = "DEPLOYER_REGISTRY_TOKEN", default_value = "")]
    pub registry_token: String,

    /// Registry prefix images are pushed under
    #[arg(long, env = "DEPLOYER_REGISTRY_BASE")]
    pub registry_base: String,

    /// Base image the agent runtime ships in
    #[arg(long, env = "DEPLOYER_RUNTIME_IMAGE")]
    pub runtime_image: String,

    /// Number of pipeline workers to run in this process
    #[arg(long, env = "DEPLOYER_WORKER_COUNT", default_value = "2")]
    pub worker_count: usize,

    /// Origins allowed by CORS; all origins when empty
    #[arg(long, env = "DEPLOYER_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Path prefix the whole service is mounted under
    #[arg(long, env = "DEPLOYER_ROOT_PATH", default_value = "")]
    pub root_path: String,
}
