//! Default route: the product page answers 200 through the ingress.

use super::CheckContext;
use crate::errors::HarnessError;
use crate::eventual::retry_fixed;
use crate::report::{CheckOutcome, Tally};
use tracing::info;

const CHECK: &str = "default_route";

/// Poll the product page until it answers 200.
///
/// Exhausting the retry policy records one failure, dumps diagnostics and
/// returns [`HarnessError::DefaultRouteUnavailable`]: nothing after this
/// check can pass without a working default route.
pub async fn check_default_route(
    ctx: &CheckContext<'_>,
    tally: &mut Tally,
) -> Result<(), HarnessError> {
    info!(url = %ctx.page.url(), "Checking default route");

    let result = retry_fixed(ctx.retry, CHECK, move |_| async move {
        match ctx.page.status().await {
            Ok(200) => Ok(()),
            Ok(status) => Err(format!("status {status}")),
            Err(e) => Err(format!("request failed: {e}")),
        }
    })
    .await;

    match result {
        Ok(()) => {
            tally.record(CheckOutcome::pass(CHECK, "Product page answered 200"));
            Ok(())
        }
        Err(exhausted) => {
            tally.record(CheckOutcome::fail(
                CHECK,
                format!("Product page never answered 200: {exhausted}"),
            ));
            ctx.dump_debug().await;
            Err(HarnessError::DefaultRouteUnavailable {
                attempts: exhausted.attempts,
                last: exhausted.last_error,
            })
        }
    }
}
