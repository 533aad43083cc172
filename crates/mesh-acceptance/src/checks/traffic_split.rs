//! Weighted traffic split between two reviews versions.

use super::CheckContext;
use crate::errors::HarnessError;
use crate::eventual::wait_for_propagation;
use crate::fixtures::{diff_bodies, FixtureKey};
use crate::report::{CheckOutcome, Tally};
use crate::rules::{RuleBook, RuleKind, NORMAL_USER};
use tracing::{info, warn};

const CHECK: &str = "traffic_split";

/// Version expected to receive `target_percent` of the traffic.
pub const SPLIT_VERSION_A: &str = "v1";

/// Version expected to receive the rest.
pub const SPLIT_VERSION_B: &str = "v3";

/// Target share of version A with a symmetric tolerance, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitTarget {
    pub target_percent: u32,
    pub tolerance_percent: u32,
}

impl SplitTarget {
    pub fn new(target_percent: u32, tolerance_percent: u32) -> Self {
        Self {
            target_percent: target_percent.min(100),
            tolerance_percent,
        }
    }

    /// Inclusive bounds on version A hits out of `samples`:
    /// `floor(N * (target - tol) / 100)` to `ceil(N * (target + tol) / 100)`.
    pub fn bounds(&self, samples: u32) -> (u32, u32) {
        let n = u64::from(samples);
        let low_pct = u64::from(self.target_percent.saturating_sub(self.tolerance_percent));
        let high_pct = u64::from(
            self.target_percent
                .saturating_add(self.tolerance_percent)
                .min(100),
        );

        let lower = n * low_pct / 100;
        let upper = (n * high_pct).div_ceil(100);
        (
            u32::try_from(lower).unwrap_or(samples),
            u32::try_from(upper).unwrap_or(samples),
        )
    }

    pub fn accepts(&self, hits: u32, samples: u32) -> bool {
        let (lower, upper) = self.bounds(samples);
        hits >= lower && hits <= upper
    }
}

/// Classification of the sampled responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitCounts {
    pub version_a: u32,
    pub version_b: u32,
    /// Responses matching neither fixture, including failed requests.
    pub unclassified: u32,
}

impl SplitCounts {
    pub fn total(&self) -> u32 {
        self.version_a + self.version_b + self.unclassified
    }
}

/// Replace all rules with the 50/50 split for `normal-user`, sample the
/// product page, and check the share of version A against `target`.
pub async fn check_traffic_split(
    ctx: &CheckContext<'_>,
    rules: &mut RuleBook,
    samples: u32,
    target: SplitTarget,
    tally: &mut Tally,
) -> Result<bool, HarnessError> {
    info!(samples = samples, target = target.target_percent, "Checking traffic split");

    rules.cleanup_all(ctx.cluster, ctx.namespace).await?;
    wait_for_propagation("rule cleanup", ctx.propagation).await;
    rules
        .apply(ctx.cluster, ctx.namespace, RuleKind::Destinations)
        .await?;
    rules
        .apply(ctx.cluster, ctx.namespace, RuleKind::ReviewsSplitV3)
        .await?;
    wait_for_propagation("traffic split rule", ctx.propagation).await;

    let fixture_a = ctx
        .fixtures
        .load(&FixtureKey::new(NORMAL_USER, SPLIT_VERSION_A))?;
    let fixture_b = ctx
        .fixtures
        .load(&FixtureKey::new(NORMAL_USER, SPLIT_VERSION_B))?;

    let mut counts = SplitCounts::default();
    for _ in 0..samples {
        match ctx.page.fetch_as(NORMAL_USER).await {
            Ok(page) if diff_bodies(&fixture_a.body, &page.body).is_match() => {
                counts.version_a += 1
            }
            Ok(page) if diff_bodies(&fixture_b.body, &page.body).is_match() => {
                counts.version_b += 1
            }
            Ok(page) => {
                warn!(status = page.status, "Split response matched neither version");
                counts.unclassified += 1;
            }
            Err(e) => {
                warn!(error = %e, "Split request failed");
                counts.unclassified += 1;
            }
        }
    }

    let outcome = evaluate_split(&counts, target);
    let passed = tally.record(outcome);
    if !passed {
        ctx.dump_debug().await;
    }
    Ok(passed)
}

/// Turn sampled counts into an outcome.
pub fn evaluate_split(counts: &SplitCounts, target: SplitTarget) -> CheckOutcome {
    let total = counts.total();
    let (lower, upper) = target.bounds(total);
    let summary = format!(
        "{}/{} {SPLIT_VERSION_A}, {}/{} {SPLIT_VERSION_B}, {} unclassified; expected {SPLIT_VERSION_A} in [{lower}, {upper}]",
        counts.version_a, total, counts.version_b, total, counts.unclassified
    );

    if counts.unclassified > 0 {
        CheckOutcome::fail(CHECK, format!("Unexpected responses during split: {summary}"))
    } else if target.accepts(counts.version_a, total) {
        CheckOutcome::pass(CHECK, format!("Traffic split within tolerance: {summary}"))
    } else {
        CheckOutcome::fail(CHECK, format!("Traffic split outside tolerance: {summary}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checks::test_support::{fast_retry, write_fixtures, V1_PAGE, V3_PAGE};
    use crate::cluster::testing::RecordingCluster;
    use crate::environment::TemplateVars;
    use crate::fixtures::FixtureSet;
    use crate::probe::ProductPageClient;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_bounds_for_fifty_percent() {
        let target = SplitTarget::new(50, 10);
        assert_eq!(target.bounds(100), (40, 60));
        // floor(7 * 40 / 100) = 2, ceil(7 * 60 / 100) = 5
        assert_eq!(target.bounds(7), (2, 5));
    }

    #[test]
    fn test_accepts_within_tolerance_only() {
        let target = SplitTarget::new(50, 10);
        assert!(target.accepts(40, 100));
        assert!(target.accepts(50, 100));
        assert!(target.accepts(60, 100));
        assert!(!target.accepts(39, 100));
        assert!(!target.accepts(61, 100));
    }

    #[test]
    fn test_zero_tolerance_is_not_exact_match_for_odd_samples() {
        let target = SplitTarget::new(50, 0);
        // 50% of 5 is 2.5, so both 2 and 3 are accepted
        assert_eq!(target.bounds(5), (2, 3));
    }

    #[test]
    fn test_bounds_saturate_at_extremes() {
        let target = SplitTarget::new(95, 10);
        assert_eq!(target.bounds(100), (85, 100));
        let target = SplitTarget::new(5, 10);
        assert_eq!(target.bounds(100), (0, 15));
    }

    #[test]
    fn test_unclassified_responses_fail() {
        let counts = SplitCounts {
            version_a: 50,
            version_b: 49,
            unclassified: 1,
        };
        let outcome = evaluate_split(&counts, SplitTarget::new(50, 10));
        assert!(!outcome.passed);
        assert!(outcome.message.contains("1 unclassified"));
    }

    async fn run(pattern: fn(u32) -> &'static str, samples: u32) -> (bool, Tally, Vec<String>) {
        let mock_server = MockServer::start().await;
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        Mock::given(method("GET"))
            .and(path("/productpage"))
            .respond_with(move |_: &wiremock::Request| {
                let n = counter_clone.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_string(pattern(n))
            })
            .mount(&mock_server)
            .await;

        let fixtures_dir = tempfile::tempdir().unwrap();
        write_fixtures(fixtures_dir.path()).unwrap();
        let rules_dir = tempfile::tempdir().unwrap();
        let vars = TemplateVars {
            namespace: "ns".to_string(),
            hub: "hub".to_string(),
            tag: "tag".to_string(),
        };
        let mut rules = RuleBook::render(rules_dir.path(), &vars).unwrap();

        let cluster = RecordingCluster::default();
        let page = ProductPageClient::new(mock_server.uri()).unwrap();
        let fixtures = FixtureSet::new(fixtures_dir.path());
        let ctx = CheckContext {
            cluster: &cluster,
            namespace: "ns",
            page: &page,
            fixtures: &fixtures,
            retry: fast_retry(),
            propagation: Duration::ZERO,
        };
        let mut tally = Tally::new();

        let passed = check_traffic_split(&ctx, &mut rules, samples, SplitTarget::new(50, 10), &mut tally)
            .await
            .unwrap();
        (passed, tally, cluster.calls())
    }

    #[tokio::test]
    async fn test_alternating_versions_pass() {
        let (passed, tally, calls) =
            run(|n| if n % 2 == 0 { V1_PAGE } else { V3_PAGE }, 20).await;

        assert!(passed);
        assert_eq!(tally.failures(), 0);
        let applies: Vec<_> = calls.iter().filter(|c| c.starts_with("apply")).collect();
        assert_eq!(
            applies,
            vec!["apply destination-rules.yaml", "apply route-rule-reviews-50-v3.yaml"]
        );
    }

    #[tokio::test]
    async fn test_all_one_version_fails() {
        let (passed, tally, calls) = run(|_| V1_PAGE, 20).await;

        assert!(!passed);
        assert_eq!(tally.failures(), 1);
        assert!(calls.iter().any(|c| c.starts_with("dump-debug")));
    }
}
