//! Example server: serves the API directory in API_ROOT over HTTP with a
//! Postgres `db` connection from DATABASE_URL.

use arbor::{api_router, Arbor, PostgresProviderFactory};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("arbor=info".parse()?))
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/arbor".into());
    let api_root = std::env::var("API_ROOT").unwrap_or_else(|_| "serve/api".into());
    let debug = std::env::var("ARBOR_DEBUG").map(|v| v == "1").unwrap_or(false);

    let mut factory = PostgresProviderFactory::new();
    factory.connect("db", &database_url, 5).await?;

    let engine = Arbor::from_dir(&api_root, Arc::new(factory))?.with_debug(debug);
    let app = api_router(Arc::new(engine));

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
