use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use schoolops_auth::RbacGuard;
use schoolops_infra::{store, AppConfig, InventoryService, Stores};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    schoolops_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let stores = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("failed to connect to postgres")?;
            store::run_migrations(&pool)
                .await
                .context("failed to apply migrations")?;
            tracing::info!("using postgres stores");
            Stores::postgres(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            Stores::in_memory()
        }
    };

    let service = InventoryService::from_config(Arc::new(RbacGuard::default()), stores, &config);
    let app = schoolops_api::app::build_app(Arc::new(service));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app).await?;
    Ok(())
}
