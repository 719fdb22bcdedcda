use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// The agent catalog: ownership-scoped agents with immutable, monotonically
/// numbered versions.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Address to bind to
    #[arg(long, env = "CATALOG_ADDRESS", default_value = "127.0.0.1:8001")]
    pub address: SocketAddr,

    /// Postgres connection string
    #[arg(long, env = "CATALOG_DATABASE_URL")]
    pub database_url: String,

    /// Base URI of the identity store
    #[arg(long, env = "CATALOG_IDENTITY_URL")]
    pub identity_url: String,

    /// Secret the identity provider signs user tokens with
    #[arg(long, env = "CATALOG_PROVIDER_JWT_SECRET")]
    pub provider_jwt_secret: String,

    /// Audience of user tokens
    #[arg(long, env = "CATALOG_USER_AUDIENCE", default_value = "authenticated")]
    pub user_audience: String,

    /// Secret machine tokens are signed with
    #[arg(long, env = "CATALOG_M2M_JWT_SECRET")]
    pub m2m_jwt_secret: String,

    /// Issuer of machine tokens
    #[arg(long, env = "CATALOG_M2M_ISSUER", default_value = "flowplane")]
    pub m2m_issuer: String,

    /// Audience of machine tokens
    #[arg(long, env = "CATALOG_M2M_AUDIENCE", default_value = "flowplane-services")]
    pub m2m_audience: String,

    /// Admin account used during bootstrap
    #[arg(long, env = "CATALOG_ADMIN_EMAIL")]
    pub admin_email: String,

    /// Password of the bootstrap admin account
    #[arg(long, env = "CATALOG_ADMIN_PASSWORD")]
    pub admin_password: String,

    /// Where the bootstrap credentials are persisted
    #[arg(long, env = "CATALOG_CREDENTIALS_FILE", default_value = "catalog-credentials.json")]
    pub credentials_file: PathBuf,

    /// Cap on the serialized size of a version config document, in bytes
    #[arg(long, env = "CATALOG_CONFIG_MAX_BYTES", default_value = "1048576")]
    pub config_max_bytes: usize,

    /// Origins allowed by CORS; all origins when empty
    #[arg(long, env = "CATALOG_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Path prefix the whole service is mounted under
    #[arg(long, env = "CATALOG_ROOT_PATH", default_value = "")]
    pub root_path: String,
}
