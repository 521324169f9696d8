use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use deadpool_postgres::{GenericClient, Pool};

use crate::args::ServerArgs;
use crate::db::{self, DbError};
use crate::models::Store;

#[derive(Debug)]
pub enum GateOutcome {
    /// The idempotency key matched a non-expired record; no quota or rate budget was consumed.
    Replayed(Store),
    Created(Store),
}

#[derive(thiserror::Error, Debug)]
pub enum GateError {
    #[error("global store quota exceeded")]
    GlobalQuotaExceeded,
    #[error("tenant store quota exceeded")]
    TenantQuotaExceeded,
    #[error("rate limit exceeded")]
    RateLimited { retry_after_seconds: i64 },
    /// Id or host collided with an existing row; the caller should regenerate and retry.
    #[error("store id or host collided")]
    Conflict,
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

/// The persistence operations the gate's decision logic needs, as a seam for tests: the
/// production path runs it against a live transaction, tests run it against an in-memory fake.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn lookup_idempotent(
        &self,
        key: &str,
        window_start: DateTime<Utc>,
    ) -> anyhow::Result<Option<Store>>;
    async fn count_global_active(&self) -> anyhow::Result<i64>;
    async fn count_tenant_active(&self, tenant_id: &str) -> anyhow::Result<i64>;
    async fn count_rate_window(
        &self,
        tenant_id: &str,
        window_start: DateTime<Utc>,
    ) -> anyhow::Result<i64>;
    async fn oldest_rate_in_window(
        &self,
        tenant_id: &str,
        window_start: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>>;
    async fn insert_store(&self, store: &Store) -> Result<(), DbError>;
    async fn put_idempotency(&self, key: &str, store_id: &str, now: DateTime<Utc>) -> anyhow::Result<()>;
    async fn insert_rate(&self, tenant_id: &str, store_id: &str, now: DateTime<Utc>) -> anyhow::Result<()>;
}

#[async_trait]
impl<T> QuotaStore for T
where
    T: GenericClient + Send + Sync,
{
    async fn lookup_idempotent(
        &self,
        key: &str,
        window_start: DateTime<Utc>,
    ) -> anyhow::Result<Option<Store>> {
        db::lookup_idempotent(self, key, window_start).await
    }

    async fn count_global_active(&self) -> anyhow::Result<i64> {
        db::count_global_active(self).await
    }

    async fn count_tenant_active(&self, tenant_id: &str) -> anyhow::Result<i64> {
        db::count_tenant_active(self, tenant_id).await
    }

    async fn count_rate_window(
        &self,
        tenant_id: &str,
        window_start: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        db::count_rate_window(self, tenant_id, window_start).await
    }

    async fn oldest_rate_in_window(
        &self,
        tenant_id: &str,
        window_start: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        db::oldest_rate_in_window(self, tenant_id, window_start).await
    }

    async fn insert_store(&self, store: &Store) -> Result<(), DbError> {
        db::insert_store(self, store).await
    }

    async fn put_idempotency(&self, key: &str, store_id: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        db::put_idempotency(self, key, store_id, now).await
    }

    async fn insert_rate(&self, tenant_id: &str, store_id: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        db::insert_rate(self, tenant_id, store_id, now).await
    }
}

/// Runs the quota/idempotency gate (checks 1-4 of the creation path) inside one transaction.
///
/// Check order is fixed: idempotency replay, global cap, per-tenant cap, per-tenant rate window.
/// A replay short-circuits before any quota or rate check runs.
pub async fn run(
    pool: &Pool,
    idempotency_key: &str,
    candidate: Store,
    args: &ServerArgs,
) -> Result<GateOutcome, GateError> {
    let now = Utc::now();
    let mut client = pool.get().await.map_err(|e| anyhow::anyhow!(e))?;
    let tx = client.transaction().await.map_err(|e| anyhow::anyhow!(e))?;

    let outcome = run_with_store(&tx, idempotency_key, candidate, args, now).await?;

    tx.commit().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(outcome)
}

/// The gate's decision logic, against any [`QuotaStore`]. Separated from [`run`] so it can be
/// exercised in tests without a live Postgres transaction.
pub(crate) async fn run_with_store<S: QuotaStore + ?Sized>(
    store: &S,
    idempotency_key: &str,
    candidate: Store,
    args: &ServerArgs,
    now: DateTime<Utc>,
) -> Result<GateOutcome, GateError> {
    let window_start = now - ChronoDuration::milliseconds(args.idempotency_window_ms);
    if let Some(existing) = store.lookup_idempotent(idempotency_key, window_start).await? {
        return Ok(GateOutcome::Replayed(existing));
    }

    let global_active = store.count_global_active().await?;
    if global_active >= args.max_stores_global {
        return Err(GateError::GlobalQuotaExceeded);
    }

    let tenant_active = store.count_tenant_active(&candidate.tenant_id).await?;
    if tenant_active >= args.max_stores_per_tenant {
        return Err(GateError::TenantQuotaExceeded);
    }

    let rate_window_start = now - ChronoDuration::hours(1);
    let rate_count = store
        .count_rate_window(&candidate.tenant_id, rate_window_start)
        .await?;
    if rate_count >= args.max_stores_per_hour {
        let retry_after_seconds =
            retry_after(store, &candidate.tenant_id, rate_window_start, now).await?;
        return Err(GateError::RateLimited {
            retry_after_seconds,
        });
    }

    if let Err(e) = store.insert_store(&candidate).await {
        return Err(match e {
            DbError::Conflict => GateError::Conflict,
            DbError::Other(e) => GateError::Persistence(e),
        });
    }
    store
        .put_idempotency(idempotency_key, &candidate.id, now)
        .await?;
    store
        .insert_rate(&candidate.tenant_id, &candidate.id, now)
        .await?;

    Ok(GateOutcome::Created(candidate))
}

async fn retry_after<S: QuotaStore + ?Sized>(
    store: &S,
    tenant_id: &str,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<i64, anyhow::Error> {
    let oldest = store.oldest_rate_in_window(tenant_id, window_start).await?;
    Ok(compute_retry_after(oldest, now))
}

fn compute_retry_after(oldest: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    oldest
        .map(|oldest| {
            let window_end = oldest + ChronoDuration::hours(1);
            let remaining = (window_end - now).num_milliseconds();
            remaining.div_ceil(1000).max(1)
        })
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StoreStatus;
    use std::sync::Mutex;
    use store_control_common::args::PostgresArgs;

    #[test]
    fn retry_after_never_below_one_second() {
        let now = Utc::now();
        // Oldest record falls right at the edge of the window: remaining time rounds to < 1s.
        let oldest = now - ChronoDuration::hours(1) + ChronoDuration::milliseconds(100);
        assert!(compute_retry_after(Some(oldest), now) >= 1);
    }

    #[test]
    fn retry_after_with_no_rate_rows_defaults_to_one_second() {
        assert_eq!(compute_retry_after(None, Utc::now()), 1);
    }

    struct FakeState {
        stores: Vec<Store>,
        idempotency: Vec<(String, String, DateTime<Utc>)>,
        rates: Vec<(String, String, DateTime<Utc>)>,
    }

    /// In-memory stand-in for the `stores`/`idempotency_keys`/`rate_limits` tables.
    struct FakeQuotaStore(Mutex<FakeState>);

    impl FakeQuotaStore {
        fn new() -> Self {
            FakeQuotaStore(Mutex::new(FakeState {
                stores: Vec::new(),
                idempotency: Vec::new(),
                rates: Vec::new(),
            }))
        }

        fn with_active_store(self, tenant_id: &str) -> Self {
            let store = sample_store("store-seeded1", tenant_id);
            self.0.lock().unwrap().stores.push(store);
            self
        }

        fn with_rate_record(self, tenant_id: &str, created_at: DateTime<Utc>) -> Self {
            self.0
                .lock()
                .unwrap()
                .rates
                .push((tenant_id.to_string(), "store-seeded1".to_string(), created_at));
            self
        }
    }

    #[async_trait]
    impl QuotaStore for FakeQuotaStore {
        async fn lookup_idempotent(
            &self,
            key: &str,
            window_start: DateTime<Utc>,
        ) -> anyhow::Result<Option<Store>> {
            let state = self.0.lock().unwrap();
            Ok(state
                .idempotency
                .iter()
                .find(|(k, _, created_at)| k == key && *created_at >= window_start)
                .and_then(|(_, store_id, _)| {
                    state.stores.iter().find(|s| &s.id == store_id).cloned()
                }))
        }

        async fn count_global_active(&self) -> anyhow::Result<i64> {
            let state = self.0.lock().unwrap();
            Ok(state
                .stores
                .iter()
                .filter(|s| s.status != StoreStatus::Deleted)
                .count() as i64)
        }

        async fn count_tenant_active(&self, tenant_id: &str) -> anyhow::Result<i64> {
            let state = self.0.lock().unwrap();
            Ok(state
                .stores
                .iter()
                .filter(|s| s.tenant_id == tenant_id && s.status != StoreStatus::Deleted)
                .count() as i64)
        }

        async fn count_rate_window(
            &self,
            tenant_id: &str,
            window_start: DateTime<Utc>,
        ) -> anyhow::Result<i64> {
            let state = self.0.lock().unwrap();
            Ok(state
                .rates
                .iter()
                .filter(|(t, _, created_at)| t == tenant_id && *created_at >= window_start)
                .count() as i64)
        }

        async fn oldest_rate_in_window(
            &self,
            tenant_id: &str,
            window_start: DateTime<Utc>,
        ) -> anyhow::Result<Option<DateTime<Utc>>> {
            let state = self.0.lock().unwrap();
            Ok(state
                .rates
                .iter()
                .filter(|(t, _, created_at)| t == tenant_id && *created_at >= window_start)
                .map(|(_, _, created_at)| *created_at)
                .min())
        }

        async fn insert_store(&self, store: &Store) -> Result<(), DbError> {
            let mut state = self.0.lock().unwrap();
            if state
                .stores
                .iter()
                .any(|s| s.id == store.id || s.host == store.host)
            {
                return Err(DbError::Conflict);
            }
            state.stores.push(store.clone());
            Ok(())
        }

        async fn put_idempotency(
            &self,
            key: &str,
            store_id: &str,
            now: DateTime<Utc>,
        ) -> anyhow::Result<()> {
            self.0
                .lock()
                .unwrap()
                .idempotency
                .push((key.to_string(), store_id.to_string(), now));
            Ok(())
        }

        async fn insert_rate(
            &self,
            tenant_id: &str,
            store_id: &str,
            now: DateTime<Utc>,
        ) -> anyhow::Result<()> {
            self.0
                .lock()
                .unwrap()
                .rates
                .push((tenant_id.to_string(), store_id.to_string(), now));
            Ok(())
        }
    }

    fn sample_store(id: &str, tenant_id: &str) -> Store {
        let now = Utc::now();
        Store {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            namespace: id.to_string(),
            host: format!("{id}.example.com"),
            status: StoreStatus::Provisioning,
            failure_reason: None,
            created_at: now,
            provisioning_started_at: Some(now),
            ready_at: None,
            deletion_started_at: None,
            deleted_at: None,
        }
    }

    fn test_args() -> ServerArgs {
        ServerArgs {
            postgres: PostgresArgs {
                postgres_host: "localhost".to_string(),
                postgres_port: 5432,
                postgres_database: "postgres".to_string(),
                postgres_username: "postgres".to_string(),
                postgres_password: None,
                postgres_ca_cert: None,
            },
            port: 8080,
            dns_suffix: "example.com".to_string(),
            chart_path: "./charts/store".to_string(),
            max_stores_global: 100,
            max_stores_per_tenant: 10,
            max_stores_per_hour: 5,
            provisioning_timeout_ms: 300_000,
            readiness_check_interval_ms: 5_000,
            max_readiness_checks: 60,
            idempotency_window_ms: 300_000,
            maintenance_interval_ms: 300_000,
        }
    }

    #[tokio::test]
    async fn successful_create_persists_store_idempotency_and_rate() {
        let fake = FakeQuotaStore::new();
        let args = test_args();
        let candidate = sample_store("store-aaaaaaaa", "tenant-a");

        let outcome = run_with_store(&fake, "key-1", candidate.clone(), &args, Utc::now())
            .await
            .unwrap();

        match outcome {
            GateOutcome::Created(store) => assert_eq!(store.id, candidate.id),
            GateOutcome::Replayed(_) => panic!("expected a fresh create"),
        }
        assert_eq!(fake.0.lock().unwrap().stores.len(), 1);
        assert_eq!(fake.0.lock().unwrap().idempotency.len(), 1);
        assert_eq!(fake.0.lock().unwrap().rates.len(), 1);
    }

    #[tokio::test]
    async fn idempotent_replay_short_circuits_before_quota_check() {
        let fake = FakeQuotaStore::new();
        let args = {
            let mut a = test_args();
            a.max_stores_global = 0; // would reject any fresh create
            a
        };
        let now = Utc::now();
        let existing = sample_store("store-existing", "tenant-a");
        fake.0.lock().unwrap().stores.push(existing.clone());
        fake.0
            .lock()
            .unwrap()
            .idempotency
            .push(("key-1".to_string(), existing.id.clone(), now));

        let candidate = sample_store("store-bbbbbbbb", "tenant-a");
        let outcome = run_with_store(&fake, "key-1", candidate, &args, now)
            .await
            .unwrap();

        match outcome {
            GateOutcome::Replayed(store) => assert_eq!(store.id, existing.id),
            GateOutcome::Created(_) => panic!("expected a replay"),
        }
        // No new store, idempotency record, or rate record was added.
        assert_eq!(fake.0.lock().unwrap().stores.len(), 1);
        assert_eq!(fake.0.lock().unwrap().idempotency.len(), 1);
        assert_eq!(fake.0.lock().unwrap().rates.len(), 0);
    }

    #[tokio::test]
    async fn global_cap_rejects_regardless_of_tenant() {
        let fake = FakeQuotaStore::new().with_active_store("some-other-tenant");
        let args = {
            let mut a = test_args();
            a.max_stores_global = 1;
            a
        };
        let candidate = sample_store("store-aaaaaaaa", "tenant-a");

        let result = run_with_store(&fake, "key-1", candidate, &args, Utc::now()).await;
        assert!(matches!(result, Err(GateError::GlobalQuotaExceeded)));
    }

    #[tokio::test]
    async fn tenant_cap_rejects_even_with_global_headroom() {
        let fake = FakeQuotaStore::new().with_active_store("tenant-a");
        let args = {
            let mut a = test_args();
            a.max_stores_per_tenant = 1;
            a
        };
        let candidate = sample_store("store-bbbbbbbb", "tenant-a");

        let result = run_with_store(&fake, "key-1", candidate, &args, Utc::now()).await;
        assert!(matches!(result, Err(GateError::TenantQuotaExceeded)));
    }

    #[tokio::test]
    async fn rate_limit_reports_retry_after_consistent_with_oldest_record() {
        let now = Utc::now();
        let oldest = now - ChronoDuration::minutes(20);
        let fake = FakeQuotaStore::new().with_rate_record("tenant-a", oldest);
        let args = {
            let mut a = test_args();
            a.max_stores_per_hour = 1;
            a
        };
        let candidate = sample_store("store-cccccccc", "tenant-a");

        let result = run_with_store(&fake, "key-1", candidate, &args, now).await;
        match result {
            Err(GateError::RateLimited {
                retry_after_seconds,
            }) => {
                assert_eq!(retry_after_seconds, compute_retry_after(Some(oldest), now));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }
}
