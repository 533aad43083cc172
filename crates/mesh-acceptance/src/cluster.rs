//! Cluster access through the cluster CLI.
//!
//! [`MeshCluster`] is the seam between the runner and the cluster. The
//! production implementation, [`Kubectl`], shells out to `kubectl` (or the
//! binary given with `-i`); tests substitute a recording fake.

use crate::errors::HarnessError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Operations the runner needs from the cluster.
#[async_trait]
pub trait MeshCluster: Send + Sync {
    /// Create `namespace`. An existing namespace is not an error.
    async fn create_namespace(&self, namespace: &str) -> Result<(), HarnessError>;

    /// Delete `namespace`. A missing namespace is not an error.
    async fn delete_namespace(&self, namespace: &str) -> Result<(), HarnessError>;

    /// Apply the manifest file or directory at `manifest`.
    async fn apply(&self, namespace: &str, manifest: &Path) -> Result<(), HarnessError>;

    /// Delete the objects in `manifest`. Objects that do not exist are skipped.
    async fn delete(&self, namespace: &str, manifest: &Path) -> Result<(), HarnessError>;

    /// Block until every deployment in `namespace` reports available. A
    /// namespace without deployments is already available.
    async fn wait_for_deployments(
        &self,
        namespace: &str,
        timeout: Duration,
    ) -> Result<(), HarnessError>;

    /// External address of the ingress service, if one has been assigned.
    async fn ingress_address(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<String>, HarnessError>;

    /// Human-readable snapshot of the namespace for failure diagnostics.
    async fn dump_debug(&self, namespace: &str) -> Result<String, HarnessError>;
}

/// [`MeshCluster`] backed by the `kubectl` CLI.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: PathBuf,
}

impl Kubectl {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run the CLI and return stdout on success.
    async fn run(&self, args: &[&str]) -> Result<String, HarnessError> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        debug!(command = %command, "Running cluster command");

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| HarnessError::CommandSpawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(HarnessError::CommandFailed {
                command,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn load_balancer_field(
        &self,
        namespace: &str,
        service: &str,
        field: &str,
    ) -> Result<Option<String>, HarnessError> {
        let jsonpath = format!("jsonpath={{.status.loadBalancer.ingress[0].{field}}}");
        let out = self
            .run(&["get", "service", service, "-n", namespace, "-o", &jsonpath])
            .await?;
        let value = out.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }
}

#[async_trait]
impl MeshCluster for Kubectl {
    async fn create_namespace(&self, namespace: &str) -> Result<(), HarnessError> {
        match self.run(&["create", "namespace", namespace]).await {
            Err(HarnessError::CommandFailed { stderr, .. }) if stderr.contains("AlreadyExists") => {
                debug!(namespace = namespace, "Namespace already exists");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), HarnessError> {
        self.run(&["delete", "namespace", namespace, "--ignore-not-found"])
            .await
            .map(|_| ())
    }

    async fn apply(&self, namespace: &str, manifest: &Path) -> Result<(), HarnessError> {
        let manifest = manifest.to_string_lossy();
        self.run(&["apply", "-n", namespace, "-f", &manifest])
            .await
            .map(|_| ())
    }

    async fn delete(&self, namespace: &str, manifest: &Path) -> Result<(), HarnessError> {
        let manifest = manifest.to_string_lossy();
        self.run(&[
            "delete",
            "-n",
            namespace,
            "-f",
            &manifest,
            "--ignore-not-found",
        ])
        .await
        .map(|_| ())
    }

    async fn wait_for_deployments(
        &self,
        namespace: &str,
        timeout: Duration,
    ) -> Result<(), HarnessError> {
        let timeout = format!("--timeout={}s", timeout.as_secs());
        let result = self
            .run(&[
                "wait",
                "--for=condition=available",
                "deployment",
                "--all",
                "-n",
                namespace,
                &timeout,
            ])
            .await;
        match result {
            Err(e) if is_no_resources(&e) => {
                debug!(namespace = namespace, "No deployments to wait for");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn ingress_address(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<String>, HarnessError> {
        if let Some(ip) = self.load_balancer_field(namespace, service, "ip").await? {
            return Ok(Some(ip));
        }
        self.load_balancer_field(namespace, service, "hostname")
            .await
    }

    async fn dump_debug(&self, namespace: &str) -> Result<String, HarnessError> {
        let resources = self
            .run(&["get", "pods,services,deployments", "-n", namespace, "-o", "wide"])
            .await?;
        let events = self
            .run(&[
                "get",
                "events",
                "-n",
                namespace,
                "--sort-by=.lastTimestamp",
            ])
            .await?;
        Ok(format!("{resources}\n{events}"))
    }
}

/// `kubectl wait --all` fails when nothing matches the selector.
fn is_no_resources(err: &HarnessError) -> bool {
    matches!(err, HarnessError::CommandFailed { stderr, .. } if stderr.contains("no matching resources found"))
}


#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // `echo` stands in for kubectl so the argument vector shows up on stdout.

    #[tokio::test]
    async fn test_ingress_address_builds_jsonpath_query() {
        let kubectl = Kubectl::new("echo");

        let address = kubectl
            .ingress_address("mesh-e2e", "istio-ingress")
            .await
            .expect("echo should succeed");

        assert_eq!(
            address.as_deref(),
            Some(
                "get service istio-ingress -n mesh-e2e -o jsonpath={.status.loadBalancer.ingress[0].ip}"
            )
        );
    }

    #[tokio::test]
    async fn test_run_reports_non_zero_exit() {
        let kubectl = Kubectl::new("false");

        let err = kubectl
            .apply("mesh-e2e", Path::new("rule.yaml"))
            .await
            .expect_err("false should fail");

        assert!(matches!(err, HarnessError::CommandFailed { status: 1, .. }));
    }

    #[tokio::test]
    async fn test_run_reports_missing_binary() {
        let kubectl = Kubectl::new("/nonexistent/kubectl-binary");

        let err = kubectl
            .create_namespace("mesh-e2e")
            .await
            .expect_err("missing binary should fail to spawn");

        assert!(matches!(err, HarnessError::CommandSpawn { .. }));
    }

    #[test]
    fn test_wait_without_deployments_is_not_an_error() {
        let empty = HarnessError::CommandFailed {
            command: "kubectl wait --for=condition=available deployment --all".to_string(),
            status: 1,
            stderr: "error: no matching resources found".to_string(),
        };
        assert!(is_no_resources(&empty));

        let timed_out = HarnessError::CommandFailed {
            command: "kubectl wait --for=condition=available deployment --all".to_string(),
            status: 1,
            stderr: "error: timed out waiting for the condition on deployments/pilot".to_string(),
        };
        assert!(!is_no_resources(&timed_out));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_flagged() {
        let kubectl = Kubectl::new("echo");
        let out = kubectl
            .run(&["delete", "-n", "ns", "-f", "rule.yaml", "--ignore-not-found"])
            .await
            .unwrap();
        assert!(out.contains("--ignore-not-found"));

        // Removing twice in a row is indistinguishable from a no-op
        kubectl.delete("ns", Path::new("rule.yaml")).await.unwrap();
        kubectl.delete("ns", Path::new("rule.yaml")).await.unwrap();
    }
}
