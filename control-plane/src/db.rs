use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::{GenericClient, Pool};

use crate::models::{AuditEntry, Store, StoreStatus};

#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("store id or host already exists")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which terminal timestamp column a status transition should stamp, if any.
#[derive(Debug, Clone, Copy)]
pub enum StatusTimestamp {
    None,
    ProvisioningStartedAt,
    ReadyAt,
    DeletionStartedAt,
    DeletedAt,
}

/// Initialize the database schema, creating tables if they don't exist.
pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS stores (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                namespace TEXT NOT NULL,
                host TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                failure_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                provisioning_started_at TIMESTAMPTZ,
                ready_at TIMESTAMPTZ,
                deletion_started_at TIMESTAMPTZ,
                deleted_at TIMESTAMPTZ
            );

            CREATE INDEX IF NOT EXISTS idx_stores_tenant ON stores (tenant_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS idempotency_keys (
                key TEXT PRIMARY KEY,
                store_id TEXT NOT NULL REFERENCES stores(id),
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rate_limits (
                id BIGSERIAL PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                store_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rate_limits_tenant ON rate_limits (tenant_id, created_at);

            CREATE TABLE IF NOT EXISTS audit_logs (
                id BIGSERIAL PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                status TEXT NOT NULL,
                details JSONB,
                ip_address TEXT,
                created_at TIMESTAMPTZ NOT NULL
            );
            "#,
        )
        .await
        .context("failed to initialize schema")?;

    tracing::info!("database schema initialized");
    Ok(())
}

fn row_to_store(row: &tokio_postgres::Row) -> Result<Store> {
    let status: String = row.get("status");
    Ok(Store {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        namespace: row.get("namespace"),
        host: row.get("host"),
        status: status.parse()?,
        failure_reason: row.get("failure_reason"),
        created_at: row.get("created_at"),
        provisioning_started_at: row.get("provisioning_started_at"),
        ready_at: row.get("ready_at"),
        deletion_started_at: row.get("deletion_started_at"),
        deleted_at: row.get("deleted_at"),
    })
}

const STORE_COLUMNS: &str = "id, tenant_id, namespace, host, status, failure_reason, created_at, \
     provisioning_started_at, ready_at, deletion_started_at, deleted_at";

/// Insert a newly provisioned store. Fails with `Conflict` on duplicate id or host.
pub async fn insert_store(client: &impl GenericClient, store: &Store) -> Result<(), DbError> {
    let result = client
        .execute(
            r#"
            INSERT INTO stores
                (id, tenant_id, namespace, host, status, failure_reason, created_at,
                 provisioning_started_at, ready_at, deletion_started_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
            &[
                &store.id,
                &store.tenant_id,
                &store.namespace,
                &store.host,
                &store.status.as_str(),
                &store.failure_reason,
                &store.created_at,
                &store.provisioning_started_at,
                &store.ready_at,
                &store.deletion_started_at,
                &store.deleted_at,
            ],
        )
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) => {
            Err(DbError::Conflict)
        }
        Err(e) => Err(DbError::Other(
            anyhow::Error::new(e).context("failed to insert store"),
        )),
    }
}

/// Fetch a store scoped to its owning tenant.
pub async fn get_store(
    client: &impl GenericClient,
    id: &str,
    tenant_id: &str,
) -> Result<Option<Store>> {
    let row = client
        .query_opt(
            &format!("SELECT {STORE_COLUMNS} FROM stores WHERE id = $1 AND tenant_id = $2"),
            &[&id, &tenant_id],
        )
        .await
        .context("failed to query store")?;

    row.as_ref().map(row_to_store).transpose()
}

/// List a tenant's non-deleted stores, most recently created first.
pub async fn list_stores_for_tenant(
    client: &impl GenericClient,
    tenant_id: &str,
) -> Result<Vec<Store>> {
    let rows = client
        .query(
            &format!(
                "SELECT {STORE_COLUMNS} FROM stores WHERE tenant_id = $1 AND status <> 'Deleted' ORDER BY created_at DESC"
            ),
            &[&tenant_id],
        )
        .await
        .context("failed to list stores")?;

    rows.iter().map(row_to_store).collect()
}

/// Acquire a row lock on a store scoped to its tenant. Must run inside a transaction.
pub async fn lock_store(
    client: &impl GenericClient,
    id: &str,
    tenant_id: &str,
) -> Result<Option<Store>> {
    let row = client
        .query_opt(
            &format!(
                "SELECT {STORE_COLUMNS} FROM stores WHERE id = $1 AND tenant_id = $2 FOR UPDATE"
            ),
            &[&id, &tenant_id],
        )
        .await
        .context("failed to lock store")?;

    row.as_ref().map(row_to_store).transpose()
}

/// Update a store's status and, depending on the transition, one terminal timestamp column.
pub async fn update_store_status(
    client: &impl GenericClient,
    id: &str,
    status: StoreStatus,
    failure_reason: Option<&str>,
    timestamp: StatusTimestamp,
    now: DateTime<Utc>,
) -> Result<bool> {
    let ts_column = match timestamp {
        StatusTimestamp::None => None,
        StatusTimestamp::ProvisioningStartedAt => Some("provisioning_started_at"),
        StatusTimestamp::ReadyAt => Some("ready_at"),
        StatusTimestamp::DeletionStartedAt => Some("deletion_started_at"),
        StatusTimestamp::DeletedAt => Some("deleted_at"),
    };

    let status_str = status.as_str();
    let mut set_clauses = vec!["status = $1".to_string()];
    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![&status_str];
    let mut idx = 2;

    if failure_reason.is_some() {
        set_clauses.push(format!("failure_reason = ${idx}"));
        params.push(&failure_reason);
        idx += 1;
    }
    if let Some(col) = ts_column {
        set_clauses.push(format!("{col} = ${idx}"));
        params.push(&now);
        idx += 1;
    }

    let query = format!(
        "UPDATE stores SET {} WHERE id = ${idx}",
        set_clauses.join(", ")
    );
    params.push(&id);

    let rows_affected = client
        .execute(&query, &params)
        .await
        .context("failed to update store status")?;

    Ok(rows_affected > 0)
}

/// Look up a non-expired idempotency record and the store it refers to.
pub async fn lookup_idempotent(
    client: &impl GenericClient,
    key: &str,
    window_start: DateTime<Utc>,
) -> Result<Option<Store>> {
    let row = client
        .query_opt(
            &format!(
                "SELECT s.{} FROM idempotency_keys ik JOIN stores s ON s.id = ik.store_id \
                 WHERE ik.key = $1 AND ik.created_at >= $2",
                STORE_COLUMNS.replace(", ", ", s.")
            ),
            &[&key, &window_start],
        )
        .await
        .context("failed to look up idempotency key")?;

    row.as_ref().map(row_to_store).transpose()
}

pub async fn put_idempotency(
    client: &impl GenericClient,
    key: &str,
    store_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    client
        .execute(
            "INSERT INTO idempotency_keys (key, store_id, created_at) VALUES ($1, $2, $3)",
            &[&key, &store_id, &now],
        )
        .await
        .context("failed to persist idempotency key")?;
    Ok(())
}

pub async fn count_global_active(client: &impl GenericClient) -> Result<i64> {
    let row = client
        .query_one("SELECT COUNT(*) AS n FROM stores WHERE status <> 'Deleted'", &[])
        .await
        .context("failed to count global active stores")?;
    Ok(row.get("n"))
}

pub async fn count_tenant_active(client: &impl GenericClient, tenant_id: &str) -> Result<i64> {
    let row = client
        .query_one(
            "SELECT COUNT(*) AS n FROM stores WHERE tenant_id = $1 AND status <> 'Deleted'",
            &[&tenant_id],
        )
        .await
        .context("failed to count tenant active stores")?;
    Ok(row.get("n"))
}

pub async fn count_rate_window(
    client: &impl GenericClient,
    tenant_id: &str,
    window_start: DateTime<Utc>,
) -> Result<i64> {
    let row = client
        .query_one(
            "SELECT COUNT(*) AS n FROM rate_limits WHERE tenant_id = $1 AND created_at >= $2",
            &[&tenant_id, &window_start],
        )
        .await
        .context("failed to count rate window")?;
    Ok(row.get("n"))
}

pub async fn oldest_rate_in_window(
    client: &impl GenericClient,
    tenant_id: &str,
    window_start: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let row = client
        .query_one(
            "SELECT MIN(created_at) AS oldest FROM rate_limits WHERE tenant_id = $1 AND created_at >= $2",
            &[&tenant_id, &window_start],
        )
        .await
        .context("failed to find oldest rate record")?;
    Ok(row.get("oldest"))
}

pub async fn insert_rate(
    client: &impl GenericClient,
    tenant_id: &str,
    store_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    client
        .execute(
            "INSERT INTO rate_limits (tenant_id, store_id, created_at) VALUES ($1, $2, $3)",
            &[&tenant_id, &store_id, &now],
        )
        .await
        .context("failed to insert rate record")?;
    Ok(())
}

/// Best-effort append. Callers must not let failures here affect the request outcome.
pub async fn insert_audit(
    client: &impl GenericClient,
    entry: &AuditEntry,
    now: DateTime<Utc>,
) -> Result<()> {
    client
        .execute(
            r#"
            INSERT INTO audit_logs
                (tenant_id, action, resource_type, resource_id, status, details, ip_address, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            &[
                &entry.tenant_id,
                &entry.action,
                &entry.resource_type,
                &entry.resource_id,
                &entry.status,
                &entry.details,
                &entry.ip_address,
                &now,
            ],
        )
        .await
        .context("failed to insert audit entry")?;
    Ok(())
}

/// Delete idempotency keys older than the window; returns rows removed.
pub async fn gc_idempotency_keys(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let client = pool.get().await.context("failed to get db connection")?;
    let n = client
        .execute(
            "DELETE FROM idempotency_keys WHERE created_at < $1",
            &[&cutoff],
        )
        .await
        .context("failed to gc idempotency keys")?;
    Ok(n)
}

/// Delete rate-limit rows outside the 1h accounting window; returns rows removed.
pub async fn gc_rate_limits(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let client = pool.get().await.context("failed to get db connection")?;
    let n = client
        .execute("DELETE FROM rate_limits WHERE created_at < $1", &[&cutoff])
        .await
        .context("failed to gc rate limits")?;
    Ok(n)
}
