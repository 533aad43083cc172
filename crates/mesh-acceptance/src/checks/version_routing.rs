//! Version routing: identity-based routes select the reviews version.

use super::CheckContext;
use crate::errors::HarnessError;
use crate::eventual::wait_for_propagation;
use crate::fixtures::{compare_output, FixtureKey};
use crate::report::{CheckOutcome, Tally};
use crate::rules::{RuleBook, RuleKind, NORMAL_USER, TEST_USER};
use tracing::info;

const CHECK: &str = "version_routing";

/// Identities and the reviews version each must be routed to.
pub const EXPECTED_ROUTES: [(&str, &str); 2] = [(NORMAL_USER, "v1"), (TEST_USER, "v2")];

/// Route everyone to v1 and `test-user` to v2, then compare both pages with
/// their fixtures. Each mismatch is one failure.
pub async fn check_version_routing(
    ctx: &CheckContext<'_>,
    rules: &mut RuleBook,
    tally: &mut Tally,
) -> Result<bool, HarnessError> {
    info!("Checking version routing");

    for kind in [RuleKind::Destinations, RuleKind::AllV1, RuleKind::ReviewsTestV2] {
        rules.apply(ctx.cluster, ctx.namespace, kind).await?;
    }
    wait_for_propagation("version routing rules", ctx.propagation).await;

    let mut all_passed = true;
    for (user, version) in EXPECTED_ROUTES {
        let fixture = ctx.fixtures.load(&FixtureKey::new(user, version))?;
        let label = format!("{CHECK}:{user}");

        let outcome = match ctx.page.fetch_as(user).await {
            Ok(page) if compare_output(&fixture, &page.body, &label).is_match() => {
                CheckOutcome::pass(CHECK, format!("{user} routed to reviews {version}"))
            }
            Ok(page) => CheckOutcome::fail(
                CHECK,
                format!(
                    "{user} did not receive reviews {version} (status {})",
                    page.status
                ),
            ),
            Err(e) => CheckOutcome::fail(CHECK, format!("{user} request failed: {e}")),
        };

        if !tally.record(outcome) {
            all_passed = false;
            ctx.dump_debug().await;
        }
    }

    Ok(all_passed)
}
