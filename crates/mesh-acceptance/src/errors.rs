//! Fatal error types for the acceptance runner.
//!
//! Anything in here aborts the run. Assertion failures are not errors; they
//! are recorded as [`crate::report::CheckOutcome`] values and the run goes on.

use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal runner error.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The cluster CLI could not be spawned.
    #[error("Failed to run `{command}`: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The cluster CLI exited with a non-zero status.
    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// Template directory is missing or holds no manifests.
    #[error("Template error in {path}: {message}")]
    Template { path: PathBuf, message: String },

    /// Filesystem error while preparing the working directory.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An expected-output fixture could not be read.
    #[error("Fixture {path} could not be read: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The ingress service never received an external address.
    #[error("Ingress address for service {service} not available after {waited_secs}s")]
    IngressUnavailable { service: String, waited_secs: u64 },

    /// The product page never answered 200 on the default route.
    #[error("Default route unavailable after {attempts} attempts (last: {last})")]
    DefaultRouteUnavailable { attempts: u32, last: String },

    /// HTTP client construction failed.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl HarnessError {
    /// Build an [`HarnessError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HarnessError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = HarnessError::CommandFailed {
            command: "kubectl apply -f rule.yaml".to_string(),
            status: 1,
            stderr: "error: no objects passed to apply".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "`kubectl apply -f rule.yaml` exited with status 1: error: no objects passed to apply"
        );
    }

    #[test]
    fn test_default_route_display() {
        let err = HarnessError::DefaultRouteUnavailable {
            attempts: 5,
            last: "status 503".to_string(),
        };
        assert!(err.to_string().contains("after 5 attempts"));
        assert!(err.to_string().contains("status 503"));
    }
}
