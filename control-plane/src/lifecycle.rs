use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use deadpool_postgres::Pool;

use crate::args::ServerArgs;
use crate::db::{self, StatusTimestamp};
use crate::orchestrator::Orchestrator;

/// State the readiness watcher advances on a timer; mirrors what a scheduler would persist
/// if the loop were reconstructed after a restart (not attempted here, see DESIGN.md).
struct ReadinessWatch {
    store_id: String,
    namespace: String,
    host: String,
    attempts: u32,
    start_time: Instant,
}

/// Spawns the create-path background task: install, then watch for readiness.
pub fn spawn_create(
    pool: Pool,
    orchestrator: Arc<dyn Orchestrator>,
    args: Arc<ServerArgs>,
    store_id: String,
    tenant_id: String,
    namespace: String,
    host: String,
) {
    tokio::spawn(async move {
        run_create(pool, orchestrator, args, store_id, tenant_id, namespace, host).await;
    });
}

async fn run_create(
    pool: Pool,
    orchestrator: Arc<dyn Orchestrator>,
    args: Arc<ServerArgs>,
    store_id: String,
    tenant_id: String,
    namespace: String,
    host: String,
) {
    tracing::info!(store_id = %store_id, tenant_id = %tenant_id, "invoking install");
    if let Err(e) = orchestrator
        .install(&store_id, &args.chart_path, &namespace, &host)
        .await
    {
        tracing::warn!(store_id = %store_id, tenant_id = %tenant_id, error = %e, "install failed");
        fail(
            &pool,
            &store_id,
            &tenant_id,
            &format!("{e}"),
        )
        .await;
        return;
    }
    tracing::info!(store_id = %store_id, tenant_id = %tenant_id, "install succeeded, entering readiness watch");

    let mut watch = ReadinessWatch {
        store_id: store_id.clone(),
        namespace,
        host,
        attempts: 0,
        start_time: Instant::now(),
    };

    let timeout = Duration::from_millis(args.provisioning_timeout_ms.max(0) as u64);
    let interval = Duration::from_millis(args.readiness_check_interval_ms);

    loop {
        if watch.start_time.elapsed() > timeout {
            tracing::warn!(store_id = %watch.store_id, tenant_id = %tenant_id, "provisioning timeout exceeded");
            fail(&pool, &watch.store_id, &tenant_id, "Provisioning timeout exceeded").await;
            return;
        }
        watch.attempts += 1;
        if watch.attempts > args.max_readiness_checks {
            tracing::warn!(store_id = %watch.store_id, tenant_id = %tenant_id, "maximum readiness checks exceeded");
            fail(
                &pool,
                &watch.store_id,
                &tenant_id,
                "Maximum readiness checks exceeded",
            )
            .await;
            return;
        }

        let pod_readiness = orchestrator.check_pod_readiness(&watch.namespace).await;
        if pod_readiness.ready {
            let ingress_readiness = orchestrator.check_ingress_readiness(&watch.host).await;
            if ingress_readiness.ready {
                tracing::info!(
                    store_id = %watch.store_id,
                    tenant_id = %tenant_id,
                    attempt = watch.attempts,
                    "store became ready"
                );
                succeed(&pool, &watch.store_id, &tenant_id).await;
                return;
            }
            tracing::debug!(
                store_id = %watch.store_id,
                tenant_id = %tenant_id,
                attempt = watch.attempts,
                reason = %ingress_readiness.reason,
                "ingress not ready"
            );
        } else {
            tracing::debug!(
                store_id = %watch.store_id,
                tenant_id = %tenant_id,
                attempt = watch.attempts,
                reason = %pod_readiness.reason,
                "pods not ready"
            );
        }

        tokio::time::sleep(interval).await;
    }
}

async fn fail(pool: &Pool, store_id: &str, tenant_id: &str, reason: &str) {
    let client = match pool.get().await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(store_id, tenant_id, error = %e, "failed to get db connection to mark store failed");
            return;
        }
    };
    if let Err(e) = db::update_store_status(
        &client,
        store_id,
        crate::models::StoreStatus::Failed,
        Some(reason),
        StatusTimestamp::None,
        Utc::now(),
    )
    .await
    {
        tracing::error!(store_id, tenant_id, error = %e, "failed to persist Failed status");
    }
}

async fn succeed(pool: &Pool, store_id: &str, tenant_id: &str) {
    let client = match pool.get().await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(store_id, tenant_id, error = %e, "failed to get db connection to mark store ready");
            return;
        }
    };
    if let Err(e) = db::update_store_status(
        &client,
        store_id,
        crate::models::StoreStatus::Ready,
        None,
        StatusTimestamp::ReadyAt,
        Utc::now(),
    )
    .await
    {
        tracing::error!(store_id, tenant_id, error = %e, "failed to persist Ready status");
    }
}

/// Spawns the delete-path background task: uninstall, then Deleted or Failed.
pub fn spawn_delete(
    pool: Pool,
    orchestrator: Arc<dyn Orchestrator>,
    store_id: String,
    tenant_id: String,
    namespace: String,
) {
    tokio::spawn(async move {
        run_delete(pool, orchestrator, store_id, tenant_id, namespace).await;
    });
}

async fn run_delete(
    pool: Pool,
    orchestrator: Arc<dyn Orchestrator>,
    store_id: String,
    tenant_id: String,
    namespace: String,
) {
    let client = match pool.get().await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(store_id = %store_id, tenant_id = %tenant_id, error = %e, "failed to get db connection for deletion outcome");
            return;
        }
    };

    tracing::info!(store_id = %store_id, tenant_id = %tenant_id, "invoking uninstall");
    match orchestrator.uninstall(&store_id, &namespace).await {
        Ok(()) => {
            tracing::info!(store_id = %store_id, tenant_id = %tenant_id, "uninstall succeeded, store deleted");
            if let Err(e) = db::update_store_status(
                &client,
                &store_id,
                crate::models::StoreStatus::Deleted,
                None,
                StatusTimestamp::DeletedAt,
                Utc::now(),
            )
            .await
            {
                tracing::error!(store_id = %store_id, tenant_id = %tenant_id, error = %e, "failed to persist Deleted status");
            }
        }
        Err(e) => {
            tracing::warn!(store_id = %store_id, tenant_id = %tenant_id, error = %e, "uninstall failed");
            if let Err(e) = db::update_store_status(
                &client,
                &store_id,
                crate::models::StoreStatus::Failed,
                Some(&format!("Deletion failed: {e}")),
                StatusTimestamp::None,
                Utc::now(),
            )
            .await
            {
                tracing::error!(store_id = %store_id, tenant_id = %tenant_id, error = %e, "failed to persist Failed status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{CommandError, Readiness};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports pods/ingress ready starting from a configurable attempt.
    struct FakeOrchestrator {
        ready_on_attempt: u32,
        pod_calls: AtomicU32,
        install_err: bool,
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn install(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), CommandError> {
            if self.install_err {
                Err(CommandError::ExitStatus {
                    stderr: "boom".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn uninstall(&self, _: &str, _: &str) -> Result<(), CommandError> {
            Ok(())
        }

        async fn check_pod_readiness(&self, _: &str) -> Readiness {
            let call = self.pod_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.ready_on_attempt {
                Readiness {
                    ready: true,
                    reason: String::new(),
                }
            } else {
                Readiness {
                    ready: false,
                    reason: "No pods found".into(),
                }
            }
        }

        async fn check_ingress_readiness(&self, _: &str) -> Readiness {
            Readiness {
                ready: true,
                reason: String::new(),
            }
        }
    }

    #[test]
    fn readiness_watch_attempt_counter_starts_at_zero() {
        let watch = ReadinessWatch {
            store_id: "store-aaaaaaaa".into(),
            namespace: "store-aaaaaaaa".into(),
            host: "store-aaaaaaaa.example.com".into(),
            attempts: 0,
            start_time: Instant::now(),
        };
        assert_eq!(watch.attempts, 0);
        assert_eq!(watch.store_id, "store-aaaaaaaa");
    }

    #[tokio::test]
    async fn fake_orchestrator_becomes_ready_on_configured_attempt() {
        let orch = FakeOrchestrator {
            ready_on_attempt: 2,
            pod_calls: AtomicU32::new(0),
            install_err: false,
        };
        assert!(!orch.check_pod_readiness("ns").await.ready);
        assert!(orch.check_pod_readiness("ns").await.ready);
    }
}
