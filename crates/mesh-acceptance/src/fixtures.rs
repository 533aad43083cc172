//! Expected-output fixtures and the output comparator.
//!
//! A fixture is the stored product page body for a (user, version) pair,
//! optionally with a variant suffix such as `review-timeout`. Fixture files
//! are named `productpage-<user>-<version>[-<variant>].html`.

use crate::errors::HarnessError;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Variant used when the reviews call times out behind an injected delay.
pub const REVIEW_TIMEOUT_VARIANT: &str = "review-timeout";

/// Maximum characters of a differing line shown in diagnostics.
const MAX_DIFF_LINE_LEN: usize = 160;

/// Key identifying a fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureKey {
    pub user: String,
    pub version: String,
    pub variant: Option<String>,
}

impl FixtureKey {
    pub fn new(user: &str, version: &str) -> Self {
        Self {
            user: user.to_string(),
            version: version.to_string(),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: &str) -> Self {
        self.variant = Some(variant.to_string());
        self
    }

    pub fn file_name(&self) -> String {
        match &self.variant {
            Some(variant) => format!("productpage-{}-{}-{}.html", self.user, self.version, variant),
            None => format!("productpage-{}-{}.html", self.user, self.version),
        }
    }
}

/// A loaded fixture body.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub key: FixtureKey,
    pub body: Vec<u8>,
}

/// Directory of fixture files.
#[derive(Debug, Clone)]
pub struct FixtureSet {
    dir: PathBuf,
}

impl FixtureSet {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn load(&self, key: &FixtureKey) -> Result<Fixture, HarnessError> {
        let path = self.dir.join(key.file_name());
        let body = fs::read(&path).map_err(|source| HarnessError::Fixture { path, source })?;
        Ok(Fixture {
            key: key.clone(),
            body,
        })
    }
}

/// Result of comparing a response body with a fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    Match,
    Mismatch {
        /// 1-based number of the first differing line.
        line: usize,
        expected: String,
        actual: String,
    },
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        matches!(self, Comparison::Match)
    }
}

/// Byte-compare `actual` with `expected`, logging the outcome under `label`.
pub fn compare_output(expected: &Fixture, actual: &[u8], label: &str) -> Comparison {
    let comparison = diff_bodies(&expected.body, actual);
    match &comparison {
        Comparison::Match => {
            info!(check = label, fixture = %expected.key.file_name(), "Output matches fixture");
        }
        Comparison::Mismatch {
            line,
            expected: want,
            actual: got,
        } => {
            warn!(
                check = label,
                fixture = %expected.key.file_name(),
                line = line,
                expected = %want,
                actual = %got,
                "Output differs from fixture"
            );
        }
    }
    comparison
}

/// Plain equality with the first differing line for diagnostics.
pub fn diff_bodies(expected: &[u8], actual: &[u8]) -> Comparison {
    if expected == actual {
        return Comparison::Match;
    }

    let mut want = expected.split(|b| *b == b'\n');
    let mut got = actual.split(|b| *b == b'\n');
    let mut line = 1;
    loop {
        match (want.next(), got.next()) {
            (Some(w), Some(g)) if w == g => line += 1,
            (w, g) => {
                return Comparison::Mismatch {
                    line,
                    expected: excerpt(w),
                    actual: excerpt(g),
                };
            }
        }
    }
}

fn excerpt(line: Option<&[u8]>) -> String {
    match line {
        Some(bytes) => String::from_utf8_lossy(bytes)
            .chars()
            .take(MAX_DIFF_LINE_LEN)
            .collect(),
        None => "<end of body>".to_string(),
    }
}
