//! The acceptance run.
//!
//! Stages execute in a fixed order:
//!
//! ```text
//! Setup -> DefaultRoute -> VersionRouting -> FaultInjection -> FaultRemoval
//!       -> TrafficSplit -> Teardown
//! ```
//!
//! Failed assertions are folded into the [`Tally`] and the run moves on. Only
//! Setup and DefaultRoute return early. [`Runner::finish`] performs teardown
//! and must be called on every exit path, including after an interrupted
//! [`Runner::run`].

use crate::checks::{
    check_default_route, check_fault_delay, check_traffic_split, check_version_routing,
    CheckContext, DelayExpectation, DelayPhase, DelayWindow, SplitTarget,
};
use crate::cluster::MeshCluster;
use crate::config::Config;
use crate::environment::{render_templates, TemplateVars, TestEnvironment};
use crate::errors::HarnessError;
use crate::eventual::{poll_until, wait_for_propagation, RetryPolicy};
use crate::fixtures::FixtureSet;
use crate::probe::ProductPageClient;
use crate::report::{RunReport, Tally};
use crate::rules::{RuleBook, RuleKind, NORMAL_USER, TEST_USER};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Spacing between ingress address polls.
const INGRESS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Share of traffic the split rule sends to reviews v1.
const SPLIT_TARGET_PERCENT: u32 = 50;

/// File name of the report written into a kept working directory.
pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    DefaultRoute,
    VersionRouting,
    FaultInjection,
    FaultRemoval,
    TrafficSplit,
    Teardown,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::DefaultRoute => "default_route",
            Stage::VersionRouting => "version_routing",
            Stage::FaultInjection => "fault_injection",
            Stage::FaultRemoval => "fault_removal",
            Stage::TrafficSplit => "traffic_split",
            Stage::Teardown => "teardown",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay windows checked around the fault injection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultPlan {
    /// `normal-user` while the delay rule is live.
    pub unaffected: DelayWindow,
    /// `test-user` while the delay rule is live.
    pub delayed: DelayWindow,
    /// `test-user` after the delay rule is removed.
    pub cleared: DelayWindow,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self {
            unaffected: DelayWindow::new(0, 2),
            delayed: DelayWindow::new(5, 8),
            cleared: DelayWindow::new(0, 2),
        }
    }
}

/// Resources created so far, so teardown only touches what exists.
#[derive(Debug, Default)]
struct Deployed {
    namespace: bool,
    control_plane: bool,
    app: bool,
}

pub struct Runner<C: MeshCluster> {
    config: Config,
    cluster: C,
    fixtures: FixtureSet,
    fault_plan: FaultPlan,
    env: Option<TestEnvironment>,
    rules: Option<RuleBook>,
    page: Option<ProductPageClient>,
    deployed: Deployed,
    stage: Stage,
    tally: Tally,
    started_at: DateTime<Utc>,
}

impl<C: MeshCluster> Runner<C> {
    pub fn new(config: Config, cluster: C) -> Self {
        let fixtures = FixtureSet::new(config.fixtures_dir.clone());
        Self {
            config,
            cluster,
            fixtures,
            fault_plan: FaultPlan::default(),
            env: None,
            rules: None,
            page: None,
            deployed: Deployed::default(),
            stage: Stage::Setup,
            tally: Tally::new(),
            started_at: Utc::now(),
        }
    }

    pub fn with_fault_plan(mut self, plan: FaultPlan) -> Self {
        self.fault_plan = plan;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn tally(&self) -> &Tally {
        &self.tally
    }

    /// Execute every stage up to (not including) teardown.
    pub async fn run(&mut self) -> Result<(), HarnessError> {
        self.enter(Stage::Setup);
        self.setup().await?;

        let (Some(env), Some(rules), Some(page)) =
            (self.env.as_ref(), self.rules.as_mut(), self.page.as_ref())
        else {
            return Err(HarnessError::Template {
                path: self.config.control_plane_templates.clone(),
                message: "environment incomplete after setup".to_string(),
            });
        };

        let ctx = CheckContext {
            cluster: &self.cluster,
            namespace: env.namespace(),
            page,
            fixtures: &self.fixtures,
            retry: RetryPolicy::new(self.config.retry_attempts, self.config.retry_interval),
            propagation: self.config.propagation_interval,
        };
        let tally = &mut self.tally;
        let plan = self.fault_plan;

        self.stage = Stage::DefaultRoute;
        info!(stage = %self.stage, "Entering stage");
        check_default_route(&ctx, tally).await?;

        self.stage = Stage::VersionRouting;
        info!(stage = %self.stage, "Entering stage");
        check_version_routing(&ctx, rules, tally).await?;

        self.stage = Stage::FaultInjection;
        info!(stage = %self.stage, "Entering stage");
        rules
            .apply(ctx.cluster, ctx.namespace, RuleKind::RatingsTestDelay)
            .await?;
        wait_for_propagation("fault injection rule", ctx.propagation).await;
        let unaffected = DelayExpectation {
            user: NORMAL_USER,
            version: "v1",
            window: plan.unaffected,
            phase: DelayPhase::Injected,
        };
        check_fault_delay(&ctx, &unaffected, tally).await?;
        let delayed = DelayExpectation {
            user: TEST_USER,
            version: "v2",
            window: plan.delayed,
            phase: DelayPhase::Injected,
        };
        check_fault_delay(&ctx, &delayed, tally).await?;

        self.stage = Stage::FaultRemoval;
        info!(stage = %self.stage, "Entering stage");
        rules
            .remove(ctx.cluster, ctx.namespace, RuleKind::RatingsTestDelay)
            .await?;
        wait_for_propagation("fault injection removal", ctx.propagation).await;
        let cleared = DelayExpectation {
            user: TEST_USER,
            version: "v2",
            window: plan.cleared,
            phase: DelayPhase::Removed,
        };
        check_fault_delay(&ctx, &cleared, tally).await?;

        self.stage = Stage::TrafficSplit;
        info!(stage = %self.stage, "Entering stage");
        let target = SplitTarget::new(SPLIT_TARGET_PERCENT, self.config.split_tolerance);
        check_traffic_split(&ctx, rules, self.config.split_samples, target, tally).await?;

        Ok(())
    }

    /// Tear down (unless the environment is kept) and build the report.
    ///
    /// `abort_reason` is `Some` when [`Runner::run`] returned an error or was
    /// interrupted.
    pub async fn finish(mut self, abort_reason: Option<String>) -> RunReport {
        let abort_reason = abort_reason.map(|reason| format!("{}: {reason}", self.stage));
        let namespace = self
            .env
            .as_ref()
            .map(|env| env.namespace().to_string())
            .or_else(|| self.config.namespace.clone())
            .unwrap_or_default();
        let mut report = RunReport::new(&namespace, self.started_at, &self.tally, abort_reason);

        self.enter(Stage::Teardown);
        if self.config.keep_environment {
            self.keep(&mut report);
        } else {
            self.teardown().await;
        }
        report
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        info!(stage = %stage, "Entering stage");
    }

    async fn setup(&mut self) -> Result<(), HarnessError> {
        let env = TestEnvironment::create(self.config.namespace.clone())?;
        let namespace = env.namespace().to_string();
        let vars = TemplateVars {
            namespace: namespace.clone(),
            hub: self.config.hub.clone(),
            tag: self.config.tag.clone(),
        };

        render_templates(
            &self.config.control_plane_templates,
            &env.control_plane_dir(),
            &vars,
        )?;
        render_templates(&self.config.app_templates, &env.app_dir(), &vars)?;
        self.rules = Some(RuleBook::render(&env.rules_dir(), &vars)?);
        let control_plane_dir = env.control_plane_dir();
        let app_dir = env.app_dir();
        self.env = Some(env);

        self.cluster.create_namespace(&namespace).await?;
        self.deployed.namespace = true;

        info!(namespace = %namespace, "Deploying control plane");
        self.deployed.control_plane = true;
        self.cluster.apply(&namespace, &control_plane_dir).await?;
        self.cluster
            .wait_for_deployments(&namespace, self.config.rollout_timeout)
            .await?;

        info!(namespace = %namespace, "Deploying sample application");
        self.deployed.app = true;
        self.cluster.apply(&namespace, &app_dir).await?;
        self.cluster
            .wait_for_deployments(&namespace, self.config.rollout_timeout)
            .await?;

        let address = self.resolve_ingress(&namespace).await?;
        info!(ingress = %address, "Ingress address resolved");
        self.page = Some(ProductPageClient::for_ingress(&address)?);
        Ok(())
    }

    async fn resolve_ingress(&self, namespace: &str) -> Result<String, HarnessError> {
        let cluster = &self.cluster;
        let service = self.config.ingress_service.as_str();

        poll_until(
            "ingress address",
            self.config.ingress_timeout,
            INGRESS_POLL_INTERVAL,
            move || async move {
                match cluster.ingress_address(namespace, service).await {
                    Ok(address) => address,
                    Err(e) => {
                        debug!(error = %e, "Ingress address not available yet");
                        None
                    }
                }
            },
        )
        .await
        .map_err(|_| HarnessError::IngressUnavailable {
            service: service.to_string(),
            waited_secs: self.config.ingress_timeout.as_secs(),
        })
    }

    fn keep(&mut self, report: &mut RunReport) {
        let Some(env) = self.env.take() else {
            info!("Skipping cleanup; no environment was created");
            return;
        };
        let workdir = env.keep();
        report.workdir = Some(workdir.clone());
        if let Err(e) = report.write_json(&workdir.join(REPORT_FILE)) {
            warn!(error = %e, "Failed to write run report");
        }
        info!(
            namespace = %report.namespace,
            workdir = %workdir.display(),
            "Skipping cleanup; environment kept"
        );
    }

    /// Best-effort teardown: every step runs even if an earlier one failed.
    async fn teardown(&mut self) {
        let Some(env) = self.env.take() else {
            return;
        };
        let namespace = env.namespace().to_string();
        info!(namespace = %namespace, "Tearing down test environment");

        if let Some(rules) = self.rules.as_mut() {
            if let Err(e) = rules.cleanup_all(&self.cluster, &namespace).await {
                warn!(error = %e, "Failed to remove traffic rules");
            }
        }
        if self.deployed.app {
            if let Err(e) = self.cluster.delete(&namespace, &env.app_dir()).await {
                warn!(error = %e, "Failed to delete sample application");
            }
        }
        if self.deployed.control_plane {
            if let Err(e) = self.cluster.delete(&namespace, &env.control_plane_dir()).await {
                warn!(error = %e, "Failed to delete control plane");
            }
        }
        if self.deployed.namespace {
            if let Err(e) = self.cluster.delete_namespace(&namespace).await {
                warn!(error = %e, "Failed to delete namespace");
            }
        }
        if let Err(e) = env.remove() {
            warn!(error = %e, "Failed to remove working directory");
        }
    }
}
