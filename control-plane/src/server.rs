use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
use deadpool_postgres::Pool;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use store_control_common::request_context::middleware::extract_context;

use crate::args::ServerArgs;
use crate::db;
use crate::handlers;
use crate::models::AuditEntry;
use crate::orchestrator::Orchestrator;

/// Shared application state; every replica is otherwise stateless.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub args: Arc<ServerArgs>,
    pub audit_tx: mpsc::Sender<AuditEntry>,
}

const AUDIT_CHANNEL_CAPACITY: usize = 1024;

/// Spawns the detached audit writer. Send failures (a full channel) are swallowed by the
/// caller; this task itself swallows persistence errors per the audit error-handling policy.
fn spawn_audit_writer(pool: Pool) -> mpsc::Sender<AuditEntry> {
    let (tx, mut rx) = mpsc::channel::<AuditEntry>(AUDIT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            let now = chrono::Utc::now();
            let client = match pool.get().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "audit writer failed to get db connection");
                    continue;
                }
            };
            if let Err(e) = db::insert_audit(&client, &entry, now).await {
                tracing::warn!(error = %e, "failed to persist audit entry");
            }
        }
    });
    tx
}

pub async fn run(
    pool: Pool,
    orchestrator: Arc<dyn Orchestrator>,
    args: Arc<ServerArgs>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let audit_tx = spawn_audit_writer(pool.clone());
    let port = args.port;
    let state = AppState {
        pool,
        orchestrator,
        args,
        audit_tx,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route(
            "/stores",
            post(handlers::create_store).get(handlers::list_stores),
        )
        .route(
            "/stores/{id}",
            get(handlers::get_store).delete(handlers::delete_store),
        )
        .route("/health", get(handlers::health))
        .layer(axum::middleware::from_fn(extract_context))
        .layer(cors)
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .context("failed to bind control plane server")?;
    tracing::info!(%addr, "starting store control plane HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("control plane server failed")?;

    tracing::info!("server stopped gracefully");
    Ok(())
}
