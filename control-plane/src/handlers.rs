use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use rand::Rng;
use serde_json::json;

use crate::db::{self, StatusTimestamp};
use crate::error::{ApiError, ApiResult};
use crate::gate::{self, GateError, GateOutcome};
use crate::lifecycle;
use crate::models::{AuditEntry, CreateStoreRequest, DeleteResponse, HealthResponse, Store, StoreStatus};
use crate::server::AppState;
use crate::tenant::{IdempotencyKey, TenantId};
use store_control_common::request_context::RequestContextExtractor;

fn generate_store_id() -> String {
    let bytes: [u8; 4] = rand::rng().random();
    format!("store-{}", hex::encode(bytes))
}

fn audit(
    state: &AppState,
    tenant_id: &str,
    action: &str,
    resource_id: &str,
    status: &str,
    details: serde_json::Value,
    ip_address: Option<String>,
) {
    let entry = AuditEntry {
        tenant_id: tenant_id.to_string(),
        action: action.to_string(),
        resource_type: "store".to_string(),
        resource_id: resource_id.to_string(),
        status: status.to_string(),
        details,
        ip_address,
    };
    if state.audit_tx.try_send(entry).is_err() {
        tracing::warn!("audit channel full, dropping entry");
    }
}

/// `POST /stores` — `202` on fresh creation, `200` on idempotent replay.
pub async fn create_store(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    IdempotencyKey(idempotency_key): IdempotencyKey,
    RequestContextExtractor(ctx): RequestContextExtractor,
    Json(_req): Json<CreateStoreRequest>,
) -> ApiResult<impl IntoResponse> {
    let ip_address = ctx.client_ip.map(|ip| ip.to_string());

    // Retried only on an id/host collision, which is vanishingly rare with 32 bits of entropy.
    loop {
        let id = generate_store_id();
        let namespace = id.clone();
        let host = format!("{id}.{}", state.args.dns_suffix);
        let now = Utc::now();

        let candidate = Store {
            id,
            tenant_id: tenant_id.clone(),
            namespace,
            host,
            status: StoreStatus::Provisioning,
            failure_reason: None,
            created_at: now,
            provisioning_started_at: Some(now),
            ready_at: None,
            deletion_started_at: None,
            deleted_at: None,
        };

        match gate::run(&state.pool, &idempotency_key, candidate, &state.args).await {
            Ok(GateOutcome::Replayed(store)) => {
                audit(
                    &state,
                    &tenant_id,
                    "create",
                    &store.id,
                    "replayed",
                    json!({"idempotency_key": idempotency_key}),
                    ip_address,
                );
                return Ok((StatusCode::OK, Json(store)));
            }
            Ok(GateOutcome::Created(store)) => {
                lifecycle::spawn_create(
                    state.pool.clone(),
                    state.orchestrator.clone(),
                    state.args.clone(),
                    store.id.clone(),
                    tenant_id.clone(),
                    store.namespace.clone(),
                    store.host.clone(),
                );
                audit(
                    &state,
                    &tenant_id,
                    "create",
                    &store.id,
                    "accepted",
                    json!({"host": store.host}),
                    ip_address,
                );
                return Ok((StatusCode::ACCEPTED, Json(store)));
            }
            Err(GateError::Conflict) => continue,
            Err(GateError::GlobalQuotaExceeded) => return Err(ApiError::GlobalQuotaExceeded),
            Err(GateError::TenantQuotaExceeded) => return Err(ApiError::TenantQuotaExceeded),
            Err(GateError::RateLimited {
                retry_after_seconds,
            }) => return Err(ApiError::RateLimited {
                retry_after_seconds,
            }),
            Err(GateError::Persistence(e)) => return Err(ApiError::Persistence(e)),
        }
    }
}

/// `GET /stores` — the tenant's non-deleted stores, newest first.
pub async fn list_stores(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
) -> ApiResult<impl IntoResponse> {
    let client = state.pool.get().await.map_err(|e| anyhow::anyhow!(e))?;
    let stores = db::list_stores_for_tenant(&client, &tenant_id).await?;
    Ok(Json(stores))
}

/// `GET /stores/{id}`.
pub async fn get_store(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let client = state.pool.get().await.map_err(|e| anyhow::anyhow!(e))?;
    let store = db::get_store(&client, &id, &tenant_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(store))
}

/// `DELETE /stores/{id}` — idempotent: deleting an already-deleted or in-flight delete
/// succeeds without re-running teardown.
pub async fn delete_store(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Path(id): Path<String>,
    RequestContextExtractor(ctx): RequestContextExtractor,
) -> ApiResult<impl IntoResponse> {
    let ip_address = ctx.client_ip.map(|ip| ip.to_string());
    let mut client = state.pool.get().await.map_err(|e| anyhow::anyhow!(e))?;
    let tx = client.transaction().await.map_err(|e| anyhow::anyhow!(e))?;

    let Some(store) = db::lock_store(&tx, &id, &tenant_id).await? else {
        return Err(ApiError::NotFound);
    };

    match store.status {
        StoreStatus::Deleted => {
            tx.commit().await.map_err(|e| anyhow::anyhow!(e))?;
            return Ok(Json(DeleteResponse {
                message: "already deleted".to_string(),
                store,
            }));
        }
        StoreStatus::Deleting => {
            tx.commit().await.map_err(|e| anyhow::anyhow!(e))?;
            return Ok(Json(DeleteResponse {
                message: "in progress".to_string(),
                store,
            }));
        }
        _ => {}
    }

    let now = Utc::now();
    db::update_store_status(
        &tx,
        &id,
        StoreStatus::Deleting,
        None,
        StatusTimestamp::DeletionStartedAt,
        now,
    )
    .await?;
    tx.commit().await.map_err(|e| anyhow::anyhow!(e))?;

    lifecycle::spawn_delete(
        state.pool.clone(),
        state.orchestrator.clone(),
        store.id.clone(),
        tenant_id.clone(),
        store.namespace.clone(),
    );

    audit(
        &state,
        &tenant_id,
        "delete",
        &store.id,
        "deleting",
        json!({}),
        ip_address,
    );

    let mut updated = store;
    updated.status = StoreStatus::Deleting;
    updated.deletion_started_at = Some(now);

    Ok(Json(DeleteResponse {
        message: "Deleting".to_string(),
        store: updated,
    }))
}

/// `GET /health`.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.pool.get().await {
        Ok(client) => match client.simple_query("SELECT 1").await {
            Ok(_) => (
                StatusCode::OK,
                Json(HealthResponse {
                    status: "healthy",
                    database: "connected",
                }),
            )
                .into_response(),
            Err(e) => {
                tracing::error!(error = %e, "health check query failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"status": "unhealthy", "database": "error"})),
                )
                    .into_response()
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "health check failed to get db connection");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unhealthy", "database": "unreachable"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_store_ids_match_expected_shape() {
        for _ in 0..50 {
            let id = generate_store_id();
            assert!(id.starts_with("store-"));
            let suffix = &id["store-".len()..];
            assert_eq!(suffix.len(), 8);
            assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }
}
