//! # UBL Server
//!
//! HTTP API over the append-only, hash-chained ledger (§6). Connects to
//! PostgreSQL, runs the ledger's migrations, and serves the commit/
//! validate/state/tail/atom/entry routes plus `/health`.

use std::sync::Arc;

use tracing::info;

use ubl_commit::CommitApi;
use ubl_ledger::postgres::PgLedgerStore;
use ubl_ledger::LedgerStore;
use ubl_server::app::{router, AppState, UniformRegistry};
use ubl_tail::TailBus;

const TAIL_BUS_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ubl_server=info".parse()?),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://ubl_dev@localhost:5432/ubl_dev".to_string());

    info!("connecting to postgres");
    let pool = sqlx::PgPool::connect(&database_url).await?;

    info!("running ledger migrations");
    sqlx::migrate!("../ubl-ledger/migrations").run(&pool).await?;

    let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool));
    let tail = TailBus::new(TAIL_BUS_CAPACITY);
    let registry = Arc::new(UniformRegistry::new(
        ubl_membrane::ContainerConfig::default(),
        None,
    ));
    let commit = Arc::new(CommitApi::new(store.clone(), tail.clone(), registry.clone()));

    let state = AppState {
        commit,
        store,
        tail,
        registry,
    };

    let app = router(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("0.0.0.0:{port}");

    info!(%addr, "ubl-server listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
