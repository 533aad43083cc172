//! Runner configuration.
//!
//! Values come from `MESH_*` environment variables; the three CLI flags
//! (`-i`, `-s`, `-n`) are layered on top through [`Overrides`].

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default cluster CLI binary.
pub const DEFAULT_KUBECTL: &str = "kubectl";

/// Default ingress service name.
pub const DEFAULT_INGRESS_SERVICE: &str = "istio-ingress";

/// Default retry bound for response-code and delay-window polling.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Default spacing between retries, in seconds.
pub const DEFAULT_RETRY_INTERVAL_SECONDS: u64 = 10;

/// Default wait after a rule change, in seconds.
pub const DEFAULT_PROPAGATION_SECONDS: u64 = 30;

/// Default number of requests sampled by the split check.
pub const DEFAULT_SPLIT_SAMPLES: u32 = 100;

/// Default symmetric tolerance of the split check, in percentage points.
pub const DEFAULT_SPLIT_TOLERANCE: u32 = 10;

/// Default cap on ingress address polling, in seconds.
pub const DEFAULT_INGRESS_TIMEOUT_SECONDS: u64 = 300;

/// Default cap on waiting for deployments to become available, in seconds.
pub const DEFAULT_ROLLOUT_TIMEOUT_SECONDS: u64 = 300;

/// Maximum length of a Kubernetes namespace name (DNS-1123 label).
const MAX_NAMESPACE_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },

    #[error("Invalid namespace {0:?}: must be a lowercase DNS-1123 label of at most 63 characters")]
    InvalidNamespace(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster CLI binary.
    pub kubectl: PathBuf,
    /// Namespace override; generated per run when `None`.
    pub namespace: Option<String>,
    /// Skip teardown and keep the working directory.
    pub keep_environment: bool,
    pub control_plane_templates: PathBuf,
    pub app_templates: PathBuf,
    pub fixtures_dir: PathBuf,
    /// Image registry substituted for `{{HUB}}`.
    pub hub: String,
    /// Image tag substituted for `{{TAG}}`.
    pub tag: String,
    pub ingress_service: String,
    pub retry_attempts: u32,
    pub retry_interval: Duration,
    pub propagation_interval: Duration,
    pub split_samples: u32,
    pub split_tolerance: u32,
    pub ingress_timeout: Duration,
    pub rollout_timeout: Duration,
    pub log_json: bool,
}

/// CLI flag overrides applied on top of the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub kubectl: Option<PathBuf>,
    pub skip_cleanup: bool,
    pub namespace: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing)
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let namespace = vars
            .get("MESH_NAMESPACE")
            .filter(|ns| !ns.is_empty())
            .cloned();
        if let Some(ns) = &namespace {
            validate_namespace(ns)?;
        }

        let retry_attempts: u32 = parse_var(vars, "MESH_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS)?;
        if retry_attempts == 0 {
            return Err(invalid("MESH_RETRY_ATTEMPTS", "0", "must be at least 1"));
        }

        let split_samples: u32 = parse_var(vars, "MESH_SPLIT_SAMPLES", DEFAULT_SPLIT_SAMPLES)?;
        if split_samples == 0 {
            return Err(invalid("MESH_SPLIT_SAMPLES", "0", "must be at least 1"));
        }

        let split_tolerance: u32 =
            parse_var(vars, "MESH_SPLIT_TOLERANCE", DEFAULT_SPLIT_TOLERANCE)?;
        if split_tolerance > 100 {
            return Err(invalid(
                "MESH_SPLIT_TOLERANCE",
                &split_tolerance.to_string(),
                "must be a percentage between 0 and 100",
            ));
        }

        Ok(Config {
            kubectl: path_var(vars, "MESH_KUBECTL", DEFAULT_KUBECTL),
            namespace,
            keep_environment: false,
            control_plane_templates: path_var(
                vars,
                "MESH_CONTROL_PLANE_TEMPLATES",
                "install/kubernetes/templates",
            ),
            app_templates: path_var(vars, "MESH_APP_TEMPLATES", "samples/bookinfo/templates"),
            fixtures_dir: path_var(vars, "MESH_FIXTURES_DIR", "samples/bookinfo/fixtures"),
            hub: string_var(vars, "MESH_HUB", "docker.io/istio"),
            tag: string_var(vars, "MESH_TAG", "latest"),
            ingress_service: string_var(vars, "MESH_INGRESS_SERVICE", DEFAULT_INGRESS_SERVICE),
            retry_attempts,
            retry_interval: Duration::from_secs(parse_var(
                vars,
                "MESH_RETRY_INTERVAL_SECS",
                DEFAULT_RETRY_INTERVAL_SECONDS,
            )?),
            propagation_interval: Duration::from_secs(parse_var(
                vars,
                "MESH_PROPAGATION_SECS",
                DEFAULT_PROPAGATION_SECONDS,
            )?),
            split_samples,
            split_tolerance,
            ingress_timeout: Duration::from_secs(parse_var(
                vars,
                "MESH_INGRESS_TIMEOUT_SECS",
                DEFAULT_INGRESS_TIMEOUT_SECONDS,
            )?),
            rollout_timeout: Duration::from_secs(parse_var(
                vars,
                "MESH_ROLLOUT_TIMEOUT_SECS",
                DEFAULT_ROLLOUT_TIMEOUT_SECONDS,
            )?),
            log_json: parse_var(vars, "MESH_LOG_JSON", false)?,
        })
    }

    /// Layer CLI flags over the environment-derived values.
    pub fn with_overrides(mut self, overrides: Overrides) -> Result<Self, ConfigError> {
        if let Some(kubectl) = overrides.kubectl {
            self.kubectl = kubectl;
        }
        if let Some(ns) = overrides.namespace {
            validate_namespace(&ns)?;
            self.namespace = Some(ns);
        }
        self.keep_environment |= overrides.skip_cleanup;
        Ok(self)
    }
}

/// Check that `ns` is a valid DNS-1123 label.
pub fn validate_namespace(ns: &str) -> Result<(), ConfigError> {
    let valid_chars = ns
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = !ns.starts_with('-') && !ns.ends_with('-');

    if ns.is_empty() || ns.len() > MAX_NAMESPACE_LEN || !valid_chars || !valid_edges {
        return Err(ConfigError::InvalidNamespace(ns.to_string()));
    }
    Ok(())
}

fn invalid(var: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn string_var(vars: &HashMap<String, String>, name: &str, default: &str) -> String {
    vars.get(name)
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn path_var(vars: &HashMap<String, String>, name: &str, default: &str) -> PathBuf {
    PathBuf::from(string_var(vars, name, default))
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(name, raw, &e.to_string())),
        None => Ok(default),
    }
}
