use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, ResourceExt, api::ListParams};
use tokio::process::Command;

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn command: {0}")]
    Spawn(std::io::Error),
    #[error("command exited with non-zero status: {stderr}")]
    ExitStatus { stderr: String },
}

/// Outcome of a pod or ingress readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub reason: String,
}

impl Readiness {
    fn ready() -> Self {
        Readiness {
            ready: true,
            reason: String::new(),
        }
    }

    fn not_ready(reason: impl Into<String>) -> Self {
        Readiness {
            ready: false,
            reason: reason.into(),
        }
    }
}

/// The external templating tool and cluster inspection API, as a seam for tests.
///
/// Implementations must build commands argv-only: `id`, `namespace`, and `host` are restricted
/// to `[a-z0-9-]` by construction, but no identifier is ever interpolated into a shell string.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn install(
        &self,
        id: &str,
        chart_path: &str,
        namespace: &str,
        host: &str,
    ) -> Result<(), CommandError>;

    async fn uninstall(&self, id: &str, namespace: &str) -> Result<(), CommandError>;

    async fn check_pod_readiness(&self, namespace: &str) -> Readiness;

    async fn check_ingress_readiness(&self, host: &str) -> Readiness;
}

/// Invokes the templating tool and the cluster CLI as child processes, and the cluster API
/// via a typed client for readiness reads.
pub struct CliOrchestrator {
    helm_binary: String,
    kubectl_binary: String,
    kube_client: Client,
}

impl CliOrchestrator {
    pub fn new(
        helm_binary: impl Into<String>,
        kubectl_binary: impl Into<String>,
        kube_client: Client,
    ) -> Self {
        CliOrchestrator {
            helm_binary: helm_binary.into(),
            kubectl_binary: kubectl_binary.into(),
            kube_client,
        }
    }

    async fn run(binary: &str, args: &[&str]) -> Result<(), CommandError> {
        let output = Command::new(binary)
            .args(args)
            .output()
            .await
            .map_err(CommandError::Spawn)?;

        if !output.status.success() {
            return Err(CommandError::ExitStatus {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for CliOrchestrator {
    async fn install(
        &self,
        id: &str,
        chart_path: &str,
        namespace: &str,
        host: &str,
    ) -> Result<(), CommandError> {
        let set_arg = format!("ingress.host={host}");
        Self::run(
            &self.helm_binary,
            &[
                "install",
                id,
                chart_path,
                "--namespace",
                namespace,
                "--create-namespace",
                "--set",
                &set_arg,
            ],
        )
        .await
    }

    async fn uninstall(&self, id: &str, namespace: &str) -> Result<(), CommandError> {
        // A missing release is not a failure: the delete path tolerates partial prior cleanup.
        let _ = Self::run(&self.helm_binary, &["uninstall", id, "--namespace", namespace]).await;

        if let Err(e) = Self::run(
            &self.kubectl_binary,
            &["delete", "namespace", namespace, "--wait=false"],
        )
        .await
        {
            tracing::warn!(%namespace, error = %e, "namespace deletion returned an error, continuing");
        }
        Ok(())
    }

    async fn check_pod_readiness(&self, namespace: &str) -> Readiness {
        let pods: Api<Pod> = Api::namespaced(self.kube_client.clone(), namespace);
        let list = match pods.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => return Readiness::not_ready(format!("failed to list pods: {e}")),
        };

        if list.items.is_empty() {
            return Readiness::not_ready("No pods found");
        }

        let not_ready: Vec<String> = list
            .items
            .iter()
            .filter(|pod| !pod_is_ready(pod))
            .map(|pod| pod.name_any())
            .collect();

        if not_ready.is_empty() {
            Readiness::ready()
        } else {
            Readiness::not_ready(format!("Pods not ready: {}", not_ready.join(", ")))
        }
    }

    async fn check_ingress_readiness(&self, host: &str) -> Readiness {
        let ingresses: Api<Ingress> = Api::all(self.kube_client.clone());
        let list = match ingresses.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => return Readiness::not_ready(format!("failed to list ingresses: {e}")),
        };

        let matching = list.items.iter().find(|ing| {
            ing.spec
                .as_ref()
                .and_then(|s| s.rules.as_ref())
                .map(|rules| {
                    rules
                        .iter()
                        .any(|r| r.host.as_deref() == Some(host))
                })
                .unwrap_or(false)
        });

        let Some(ingress) = matching else {
            return Readiness::not_ready("Ingress not found");
        };

        let has_lb = ingress
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|entries| !entries.is_empty())
            .unwrap_or(false);

        if has_lb {
            Readiness::ready()
        } else {
            Readiness::not_ready("Ingress has no load balancer IP")
        }
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_helpers() {
        assert!(Readiness::ready().ready);
        assert!(!Readiness::not_ready("x").ready);
        assert_eq!(Readiness::not_ready("boom").reason, "boom");
    }
}
