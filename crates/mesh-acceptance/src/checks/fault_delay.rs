//! Fault injection: an injected delay shows up (or does not) in the round
//! trip of a tagged request.

use super::CheckContext;
use crate::errors::HarnessError;
use crate::eventual::retry_fixed;
use crate::fixtures::{compare_output, FixtureKey, REVIEW_TIMEOUT_VARIANT};
use crate::report::{CheckOutcome, Tally};
use std::time::Duration;
use tracing::info;

/// Inclusive window of acceptable round-trip times, in whole seconds.
///
/// Round trips are truncated to whole seconds before classification, so a
/// 2.9s request lies within `[0, 2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayWindow {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl DelayWindow {
    pub const fn new(min_secs: u64, max_secs: u64) -> Self {
        Self { min_secs, max_secs }
    }

    pub fn contains(&self, elapsed: Duration) -> bool {
        let secs = elapsed.as_secs();
        secs >= self.min_secs && secs <= self.max_secs
    }

    /// Whether a delay is expected at all.
    pub fn expects_delay(&self) -> bool {
        self.min_secs > 0
    }
}

impl std::fmt::Display for DelayWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}s, {}s]", self.min_secs, self.max_secs)
    }
}

/// Whether the delay rule is live or has just been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayPhase {
    Injected,
    Removed,
}

impl DelayPhase {
    fn check_name(self) -> &'static str {
        match self {
            DelayPhase::Injected => "fault_delay",
            DelayPhase::Removed => "fault_removal",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DelayExpectation<'a> {
    pub user: &'a str,
    pub version: &'a str,
    pub window: DelayWindow,
    pub phase: DelayPhase,
}

impl DelayExpectation<'_> {
    fn fixture_key(&self) -> FixtureKey {
        let key = FixtureKey::new(self.user, self.version);
        if self.window.expects_delay() {
            key.with_variant(REVIEW_TIMEOUT_VARIANT)
        } else {
            key
        }
    }
}

/// Time tagged requests until one lands inside the window, then compare its
/// body with the matching fixture.
///
/// Rule changes and propagation waits are the caller's job. Records exactly
/// one outcome.
pub async fn check_fault_delay(
    ctx: &CheckContext<'_>,
    expectation: &DelayExpectation<'_>,
    tally: &mut Tally,
) -> Result<bool, HarnessError> {
    let check = expectation.phase.check_name();
    let fixture = ctx.fixtures.load(&expectation.fixture_key())?;
    let window = expectation.window;
    let user = expectation.user;

    info!(
        check = check,
        user = user,
        window = %window,
        "Checking fault injection delay"
    );

    let in_window = retry_fixed(ctx.retry, check, move |attempt| async move {
        let page = ctx
            .page
            .fetch_as(user)
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        info!(
            check = check,
            attempt = attempt,
            elapsed = ?page.elapsed,
            "Measured round trip"
        );
        if window.contains(page.elapsed) {
            Ok(page)
        } else {
            Err(format!(
                "round trip {}s outside {window}",
                page.elapsed.as_secs()
            ))
        }
    })
    .await;

    let outcome = match in_window {
        Ok(page) => {
            let label = format!("{check}:{user}");
            if compare_output(&fixture, &page.body, &label).is_match() {
                CheckOutcome::pass(check, pass_message(expectation, page.elapsed))
            } else {
                CheckOutcome::fail(
                    check,
                    format!(
                        "{user} response within {window} but differs from {}",
                        fixture.key.file_name()
                    ),
                )
            }
        }
        Err(exhausted) => CheckOutcome::fail(check, fail_message(expectation, &exhausted.to_string())),
    };

    let passed = tally.record(outcome);
    if !passed {
        ctx.dump_debug().await;
    }
    Ok(passed)
}

fn pass_message(expectation: &DelayExpectation<'_>, elapsed: Duration) -> String {
    match expectation.phase {
        DelayPhase::Removed => "Fault injection was successfully cleared up".to_string(),
        DelayPhase::Injected => format!(
            "{} answered in {}s within {}",
            expectation.user,
            elapsed.as_secs(),
            expectation.window
        ),
    }
}

fn fail_message(expectation: &DelayExpectation<'_>, reason: &str) -> String {
    match expectation.phase {
        DelayPhase::Removed => format!("Fault injection persisted: {reason}"),
        DelayPhase::Injected => format!(
            "{} never answered within {}: {reason}",
            expectation.user, expectation.window
        ),
    }
}
