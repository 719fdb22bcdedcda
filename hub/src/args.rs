use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// The conversation hub: message persistence and per-conversation WebSocket
/// fan-out of agent runtime output.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Address to bind to
    #[arg(long, env = "HUB_ADDRESS", default_value = "127.0.0.1:8003")]
    pub address: SocketAddr,

    /// Postgres connection string
    #[arg(long, env = "HUB_DATABASE_URL")]
    pub database_url: String,

    /// Base URI of the identity store
    #[arg(long, env = "HUB_IDENTITY_URL")]
    pub identity_url: String,

    /// Base URI of the agent catalog
    #[arg(long, env = "HUB_CATALOG_URL")]
    pub catalog_url: String,

    /// Base URI of the deployment engine
    #[arg(long, env = "HUB_DEPLOYER_URL")]
    pub deployer_url: String,

    /// Secret the identity provider signs user tokens with
    #[arg(long, env = "HUB_PROVIDER_JWT_SECRET")]
    pub provider_jwt_secret: String,

    /// Audience of user tokens
    #[arg(long, env = "HUB_USER_AUDIENCE", default_value = "authenticated")]
    pub user_audience: String,

    /// Secret machine tokens are signed with
    #[arg(long, env = "HUB_M2M_JWT_SECRET")]
    pub m2m_jwt_secret: String,

    /// Issuer of machine tokens
    #[arg(long, env = "HUB_M2M_ISSUER", default_value = "flowplane")]
    pub m2m_issuer: String,

    /// Audience of machine tokens
    #[arg(long, env = "HUB_M2M_AUDIENCE", default_value = "flowplane-services")]
    pub m2m_audience: String,

    /// Admin account used during bootstrap
    #[arg(long, env = "HUB_ADMIN_EMAIL")]
    pub admin_email: String,

    /// Password of the bootstrap admin account
    #[arg(long, env = "HUB_ADMIN_PASSWORD")]
    pub admin_password: String,

    /// Where the bootstrap credentials are persisted
    #[arg(long, env = "HUB_CREDENTIALS_FILE", default_value = "hub-credentials.json")]
    pub credentials_file: PathBuf,

    /// Whether finished assistant replies are stored as messages
    #[arg(
        long,
        env = "HUB_PERSIST_ASSISTANT_REPLIES",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub persist_assistant_replies: bool,

    /// Origins allowed by CORS; all origins when empty
    #[arg(long, env = "HUB_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Path prefix the whole service is mounted under
    #[arg(long, env = "HUB_ROOT_PATH", default_value = "")]
    pub root_path: String,
}
