use std::net::SocketAddr;

use clap::Parser;

/// The identity store: user profiles, roles and permissions, machine clients,
/// and the client-credentials token endpoint.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Address to bind to
    #[arg(long, env = "IDENTITY_ADDRESS", default_value = "127.0.0.1:8000")]
    pub address: SocketAddr,

    /// Postgres connection string
    #[arg(long, env = "IDENTITY_DATABASE_URL")]
    pub database_url: String,

    /// Base URI of the external identity provider
    #[arg(long, env = "IDENTITY_PROVIDER_URL")]
    pub provider_url: String,

    /// Secret the identity provider signs user tokens with
    #[arg(long, env = "IDENTITY_PROVIDER_JWT_SECRET")]
    pub provider_jwt_secret: String,

    /// Audience of user tokens
    #[arg(long, env = "IDENTITY_USER_AUDIENCE", default_value = "authenticated")]
    pub user_audience: String,

    /// Secret machine tokens are signed with
    #[arg(long, env = "IDENTITY_M2M_JWT_SECRET")]
    pub m2m_jwt_secret: String,

    /// Issuer of machine tokens
    #[arg(long, env = "IDENTITY_M2M_ISSUER", default_value = "flowplane")]
    pub m2m_issuer: String,

    /// Audience of machine tokens
    #[arg(long, env = "IDENTITY_M2M_AUDIENCE", default_value = "flowplane-services")]
    pub m2m_audience: String,

    /// Machine token lifetime in minutes
    #[arg(long, env = "IDENTITY_M2M_TOKEN_TTL_MINUTES", default_value = "15")]
    pub m2m_token_ttl_minutes: i64,

    /// Provider account the bootstrap admin logs in with
    #[arg(long, env = "IDENTITY_ADMIN_EMAIL")]
    pub admin_email: String,

    /// Password of the bootstrap admin account
    #[arg(long, env = "IDENTITY_ADMIN_PASSWORD")]
    pub admin_password: String,

    /// Origins allowed by CORS; all origins when empty
    #[arg(long, env = "IDENTITY_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Path prefix the whole service is mounted under
    #[arg(long, env = "IDENTITY_ROOT_PATH", default_value = "")]
    pub root_path: String,
}
