use clap::Parser;
use flowplane_catalog::{pgpool_init, start, Args};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .init();

    let pool = pgpool_init(&args.database_url)
        .await
        .expect("to initialize the catalog database");

    start(pool, args).await.expect("catalog service crashed");
}
