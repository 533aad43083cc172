//! Traffic rules installed during a run.
//!
//! Rule manifests are embedded templates rendered into the run's rules
//! directory. The runner treats each rendered file as an opaque unit that is
//! applied or removed; [`RuleBook`] keeps track of which ones are live.

use crate::cluster::MeshCluster;
use crate::environment::TemplateVars;
use crate::errors::HarnessError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Cookie identity routed to non-default versions.
pub const TEST_USER: &str = "test-user";

/// Cookie identity that follows the default route.
pub const NORMAL_USER: &str = "normal-user";

/// Fixed delay injected by [`RuleKind::RatingsTestDelay`].
pub const INJECTED_DELAY_SECONDS: u64 = 7;

const DESTINATION_RULES: &str = r#"apiVersion: networking.istio.io/v1
kind: DestinationRule
metadata:
  name: reviews
  namespace: {{NAMESPACE}}
spec:
  host: reviews
  subsets:
  - name: v1
    labels:
      version: v1
  - name: v2
    labels:
      version: v2
  - name: v3
    labels:
      version: v3
---
apiVersion: networking.istio.io/v1
kind: DestinationRule
metadata:
  name: ratings
  namespace: {{NAMESPACE}}
spec:
  host: ratings
  subsets:
  - name: v1
    labels:
      version: v1
"#;

const ALL_V1: &str = r#"apiVersion: networking.istio.io/v1
kind: VirtualService
metadata:
  name: reviews
  namespace: {{NAMESPACE}}
spec:
  hosts:
  - reviews
  http:
  - route:
    - destination:
        host: reviews
        subset: v1
"#;

const REVIEWS_TEST_V2: &str = r#"apiVersion: networking.istio.io/v1
kind: VirtualService
metadata:
  name: reviews
  namespace: {{NAMESPACE}}
spec:
  hosts:
  - reviews
  http:
  - match:
    - headers:
        cookie:
          regex: "^(.*?;)?(user=test-user)(;.*)?$"
    route:
    - destination:
        host: reviews
        subset: v2
  - route:
    - destination:
        host: reviews
        subset: v1
"#;

const RATINGS_TEST_DELAY: &str = r#"apiVersion: networking.istio.io/v1
kind: VirtualService
metadata:
  name: ratings-test-delay
  namespace: {{NAMESPACE}}
spec:
  hosts:
  - ratings
  http:
  - match:
    - headers:
        cookie:
          regex: "^(.*?;)?(user=test-user)(;.*)?$"
    fault:
      delay:
        percentage:
          value: 100.0
        fixedDelay: 7s
    route:
    - destination:
        host: ratings
        subset: v1
  - route:
    - destination:
        host: ratings
        subset: v1
"#;

const REVIEWS_SPLIT_V3: &str = r#"apiVersion: networking.istio.io/v1
kind: VirtualService
metadata:
  name: reviews
  namespace: {{NAMESPACE}}
spec:
  hosts:
  - reviews
  http:
  - match:
    - headers:
        cookie:
          regex: "^(.*?;)?(user=normal-user)(;.*)?$"
    route:
    - destination:
        host: reviews
        subset: v1
      weight: 50
    - destination:
        host: reviews
        subset: v3
      weight: 50
  - route:
    - destination:
        host: reviews
        subset: v1
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Subsets for the reviews and ratings versions.
    Destinations,
    /// Route all reviews traffic to v1.
    AllV1,
    /// Route `test-user` to reviews v2.
    ReviewsTestV2,
    /// Delay ratings responses for `test-user`.
    RatingsTestDelay,
    /// Split `normal-user` 50/50 between reviews v1 and v3.
    ReviewsSplitV3,
}

impl RuleKind {
    pub const ALL: [RuleKind; 5] = [
        RuleKind::Destinations,
        RuleKind::AllV1,
        RuleKind::ReviewsTestV2,
        RuleKind::RatingsTestDelay,
        RuleKind::ReviewsSplitV3,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            RuleKind::Destinations => "destination-rules.yaml",
            RuleKind::AllV1 => "route-rule-all-v1.yaml",
            RuleKind::ReviewsTestV2 => "route-rule-reviews-test-v2.yaml",
            RuleKind::RatingsTestDelay => "route-rule-ratings-test-delay.yaml",
            RuleKind::ReviewsSplitV3 => "route-rule-reviews-50-v3.yaml",
        }
    }

    fn template(self) -> &'static str {
        match self {
            RuleKind::Destinations => DESTINATION_RULES,
            RuleKind::AllV1 => ALL_V1,
            RuleKind::ReviewsTestV2 => REVIEWS_TEST_V2,
            RuleKind::RatingsTestDelay => RATINGS_TEST_DELAY,
            RuleKind::ReviewsSplitV3 => REVIEWS_SPLIT_V3,
        }
    }
}

/// A rendered rule manifest.
#[derive(Debug, Clone)]
pub struct TrafficRule {
    pub kind: RuleKind,
    pub path: PathBuf,
}

/// Rendered rules plus the set currently applied to the cluster.
#[derive(Debug)]
pub struct RuleBook {
    rules: Vec<TrafficRule>,
    applied: Vec<RuleKind>,
}

impl RuleBook {
    /// Render every rule template into `dir`.
    pub fn render(dir: &Path, vars: &TemplateVars) -> Result<Self, HarnessError> {
        let mut rules = Vec::with_capacity(RuleKind::ALL.len());
        for kind in RuleKind::ALL {
            let path = dir.join(kind.file_name());
            fs::write(&path, vars.render(kind.template()))
                .map_err(|e| HarnessError::io(&path, e))?;
            rules.push(TrafficRule { kind, path });
        }
        Ok(Self {
            rules,
            applied: Vec::new(),
        })
    }

    pub fn rules(&self) -> &[TrafficRule] {
        &self.rules
    }

    pub fn path(&self, kind: RuleKind) -> Option<&Path> {
        self.rules
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r.path.as_path())
    }

    pub fn applied(&self) -> &[RuleKind] {
        &self.applied
    }

    /// Apply `kind`. Applying a live rule again re-applies it.
    pub async fn apply(
        &mut self,
        cluster: &dyn MeshCluster,
        namespace: &str,
        kind: RuleKind,
    ) -> Result<(), HarnessError> {
        let path = self.require(kind)?;
        info!(rule = kind.file_name(), "Applying traffic rule");
        cluster.apply(namespace, &path).await?;
        if !self.applied.contains(&kind) {
            self.applied.push(kind);
        }
        Ok(())
    }

    /// Remove `kind`. Removing a rule that was never applied is a no-op.
    pub async fn remove(
        &mut self,
        cluster: &dyn MeshCluster,
        namespace: &str,
        kind: RuleKind,
    ) -> Result<(), HarnessError> {
        let path = self.require(kind)?;
        info!(rule = kind.file_name(), "Removing traffic rule");
        cluster.delete(namespace, &path).await?;
        self.applied.retain(|k| *k != kind);
        Ok(())
    }

    /// Remove every known rule, newest first. Safe to call repeatedly.
    ///
    /// Every rule is attempted even if one removal fails; the first failure
    /// is returned.
    pub async fn cleanup_all(
        &mut self,
        cluster: &dyn MeshCluster,
        namespace: &str,
    ) -> Result<(), HarnessError> {
        let mut first_error = None;
        for rule in self.rules.iter().rev() {
            if let Err(e) = cluster.delete(namespace, &rule.path).await {
                warn!(rule = rule.kind.file_name(), error = %e, "Failed to remove traffic rule");
                first_error.get_or_insert(e);
            }
        }
        self.applied.clear();
        first_error.map_or(Ok(()), Err)
    }

    fn require(&self, kind: RuleKind) -> Result<PathBuf, HarnessError> {
        self.path(kind)
            .map(Path::to_path_buf)
            .ok_or_else(|| HarnessError::Template {
                path: PathBuf::from(kind.file_name()),
                message: "rule was not rendered".to_string(),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cluster::testing::RecordingCluster;

    fn render_book(dir: &Path) -> RuleBook {
        let vars = TemplateVars {
            namespace: "mesh-e2e-rules".to_string(),
            hub: "hub".to_string(),
            tag: "tag".to_string(),
        };
        RuleBook::render(dir, &vars).unwrap()
    }

    #[test]
    fn test_render_writes_every_rule_with_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let book = render_book(dir.path());

        assert_eq!(book.rules().len(), RuleKind::ALL.len());
        for rule in book.rules() {
            let contents = fs::read_to_string(&rule.path).unwrap();
            assert!(contents.contains("namespace: mesh-e2e-rules"));
            assert!(!contents.contains("{{NAMESPACE}}"));
        }
    }

    #[test]
    fn test_delay_rule_matches_injected_delay() {
        assert!(RATINGS_TEST_DELAY.contains(&format!("fixedDelay: {INJECTED_DELAY_SECONDS}s")));
        assert!(RATINGS_TEST_DELAY.contains(TEST_USER));
        assert!(REVIEWS_SPLIT_V3.contains(NORMAL_USER));
    }

    fn metadata_name(manifest: &str) -> Option<&str> {
        manifest
            .lines()
            .find_map(|line| line.strip_prefix("  name: "))
    }

    #[test]
    fn test_reviews_routes_share_one_virtual_service() {
        let dir = tempfile::tempdir().unwrap();
        let book = render_book(dir.path());

        let names: Vec<String> = book
            .rules()
            .iter()
            .map(|rule| fs::read_to_string(&rule.path).unwrap())
            .filter(|m| m.contains("kind: VirtualService") && m.contains("hosts:\n  - reviews\n"))
            .map(|m| metadata_name(&m).unwrap().to_string())
            .collect();

        // Each apply replaces the live route instead of adding a second one
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|name| name == "reviews"), "{names:?}");
    }

    #[tokio::test]
    async fn test_apply_and_remove_track_live_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = render_book(dir.path());
        let cluster = RecordingCluster::default();

        book.apply(&cluster, "ns", RuleKind::AllV1).await.unwrap();
        book.apply(&cluster, "ns", RuleKind::ReviewsTestV2).await.unwrap();
        book.apply(&cluster, "ns", RuleKind::AllV1).await.unwrap();
        assert_eq!(book.applied(), &[RuleKind::AllV1, RuleKind::ReviewsTestV2]);

        book.remove(&cluster, "ns", RuleKind::AllV1).await.unwrap();
        assert_eq!(book.applied(), &[RuleKind::ReviewsTestV2]);
    }

    #[tokio::test]
    async fn test_remove_never_applied_rule_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = render_book(dir.path());
        let cluster = RecordingCluster::default();

        book.remove(&cluster, "ns", RuleKind::RatingsTestDelay)
            .await
            .expect("Removing an unapplied rule should succeed");
        assert!(book.applied().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_all_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = render_book(dir.path());
        let cluster = RecordingCluster::default();
        book.apply(&cluster, "ns", RuleKind::AllV1).await.unwrap();

        book.cleanup_all(&cluster, "ns").await.unwrap();
        book.cleanup_all(&cluster, "ns").await.unwrap();

        assert!(book.applied().is_empty());
        let deletes = cluster
            .calls()
            .iter()
            .filter(|c| c.starts_with("delete "))
            .count();
        assert_eq!(deletes, 2 * RuleKind::ALL.len());
        assert_eq!(
            cluster.calls().get(1).map(String::as_str),
            Some("delete route-rule-reviews-50-v3.yaml")
        );
    }
}
