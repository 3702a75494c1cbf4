//! Scenario runner: one session per scenario, steps in order, bounded waits

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::condition::{is_truthy, CheckContext};
use crate::config::{HarnessConfig, MockMode, Viewport};
use crate::error::{FailureKind, HarnessError, HarnessResult};
use crate::evidence::EvidenceCollector;
use crate::fixture::FixtureStore;
use crate::inject::StateInjector;
use crate::mock::{values_equal, DispatchRecord, RouteRegistry};
use crate::page::{resolve_url, ElementState, PageDriver, ScreenshotTarget};
use crate::poll::{poll_until, within, PollOutcome, PollPolicy, Probe};
use crate::report::{FailureInfo, RunReport, ScenarioStatus, StepOutcome, StepStatus, SuiteReport};
use crate::scenario::{Criticality, Scenario, Step, StepSpec, WaitState};
use crate::session::{with_session, ActiveSession, SessionProvider, SessionSpec};
use crate::visual::{VisualComparator, VisualConfig, VisualDiff};

/// Runner settings resolved from configuration and CLI flags
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Budget for steps without their own `timeout_ms`
    pub step_timeout: Duration,
    pub navigation_timeout: Duration,
    pub poll_interval: Duration,
    pub output_dir: PathBuf,
    pub mock_mode: MockMode,
    pub viewport: Viewport,
    pub max_parallel: usize,
    pub visual: Option<VisualConfig>,
}

impl RunOptions {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            step_timeout: Duration::from_millis(config.timeouts.step_ms),
            navigation_timeout: Duration::from_millis(config.timeouts.navigation_ms),
            poll_interval: Duration::from_millis(config.timeouts.poll_interval_ms),
            output_dir: config.output_dir.clone(),
            mock_mode: config.mock_mode,
            viewport: config.session.viewport,
            max_parallel: config.max_parallel.max(1),
            visual: config.visual.clone(),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

/// Mutable state of one scenario run
struct Execution {
    steps: Vec<StepOutcome>,
    collector: EvidenceCollector,
    visual_diffs: Vec<VisualDiff>,
    state_injected: bool,
    error: Option<FailureInfo>,
}

impl Execution {
    fn new(collector: EvidenceCollector) -> Self {
        Self {
            steps: Vec::new(),
            collector,
            visual_diffs: Vec::new(),
            state_injected: false,
            error: None,
        }
    }

    /// Mark the step at the current position failed and every later one
    /// skipped
    fn abort(&mut self, plan: &[StepSpec], failure: FailureInfo) {
        if let Some(spec) = plan.get(self.steps.len()) {
            self.steps.push(StepOutcome {
                index: self.steps.len(),
                label: spec.step.label(),
                criticality: spec.criticality,
                status: StepStatus::HardFailed,
                duration_ms: 0,
                failure: Some(failure.clone()),
                artifacts: Vec::new(),
            });
        }
        self.error = Some(failure);
        self.skip_rest(plan);
    }

    fn skip_rest(&mut self, plan: &[StepSpec]) {
        for (index, spec) in plan.iter().enumerate().skip(self.steps.len()) {
            self.steps.push(StepOutcome {
                index,
                label: spec.step.label(),
                criticality: spec.criticality,
                status: StepStatus::Skipped,
                duration_ms: 0,
                failure: None,
                artifacts: Vec::new(),
            });
        }
    }

    /// Fail the run for strict-mode rejections that arrived after the
    /// last step was charged. Returns whether this set the run's error.
    fn reject_late(&mut self, scenario: &str, late: &[DispatchRecord]) -> bool {
        let Some(first) = late.first() else {
            return false;
        };
        warn!(
            "[{}] {} request(s) matched no route after the last step, first: {} {}",
            scenario,
            late.len(),
            first.method,
            first.url
        );
        if self.error.is_some() {
            return false;
        }
        self.error = Some(FailureInfo::from(&HarnessError::MockMismatch {
            method: first.method.clone(),
            url: first.url.clone(),
        }));
        true
    }

    fn status(&self) -> ScenarioStatus {
        let hard = self.error.is_some()
            || self.steps.iter().any(|s| s.status == StepStatus::HardFailed);
        if hard {
            ScenarioStatus::HardFailed
        } else if self.steps.iter().any(|s| s.status == StepStatus::SoftFailed) {
            ScenarioStatus::SoftFailed
        } else {
            ScenarioStatus::Completed
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Retry a page action until it succeeds or the budget is spent. Each
/// attempt gets the poll interval as its own driver-side timeout.
async fn act<F, Fut>(what: &str, policy: PollPolicy, mut action: F) -> HarnessResult<()>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = HarnessResult<()>>,
{
    let per_attempt = policy.interval;
    let outcome = poll_until(policy, || action(per_attempt).map(|r| r.map(Probe::Done))).await?;

    match outcome {
        PollOutcome::Ready(()) => Ok(()),
        PollOutcome::TimedOut {
            attempts,
            last_error,
            ..
        } => match last_error {
            Some(err) if attempts > 0 => Err(err),
            _ => Err(HarnessError::Timeout {
                what: what.to_string(),
                timeout_ms: policy.timeout_ms(),
            }),
        },
    }
}

fn wait_satisfied(state: WaitState, el: &ElementState) -> bool {
    match state {
        WaitState::Visible => el.any_visible(),
        WaitState::Hidden => !el.any_visible(),
        WaitState::Attached => el.count > 0,
        WaitState::Detached => el.count == 0,
    }
}

/// Turn a timed-out poll into the error the step reports
fn timed_out<T>(what: String, policy: PollPolicy, outcome: PollOutcome<T>, seen: impl FnOnce(T) -> String) -> HarnessResult<T> {
    match outcome {
        PollOutcome::Ready(value) => Ok(value),
        PollOutcome::TimedOut {
            attempts: 0, ..
        } => Err(HarnessError::Timeout {
            what,
            timeout_ms: policy.timeout_ms(),
        }),
        PollOutcome::TimedOut {
            last_error: Some(err),
            last: None,
            ..
        } => Err(err),
        PollOutcome::TimedOut { last, .. } => Err(HarnessError::Timeout {
            what: match last {
                Some(value) => format!("{} (last seen: {})", what, seen(value)),
                None => what,
            },
            timeout_ms: policy.timeout_ms(),
        }),
    }
}

/// Runs scenarios against sessions from a [`SessionProvider`]
pub struct ScenarioRunner<P> {
    provider: P,
    fixtures: Arc<FixtureStore>,
    options: RunOptions,
    injector: StateInjector,
    visual: Option<VisualComparator>,
    progress: Mutex<BTreeMap<String, ScenarioStatus>>,
}

impl<P: SessionProvider> ScenarioRunner<P> {
    pub fn new(provider: P, fixtures: Arc<FixtureStore>, options: RunOptions) -> HarnessResult<Self> {
        let visual = options.visual.clone().map(VisualComparator::new).transpose()?;
        Ok(Self {
            provider,
            fixtures,
            options,
            injector: StateInjector,
            visual,
            progress: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Live status of every scenario this runner was asked to run.
    ///
    /// A scenario is `Pending` until its first step is dispatched and
    /// `Running` until it finishes, then holds its final status. Scenarios
    /// skipped after a harness failure stay `Pending`.
    pub fn progress(&self) -> BTreeMap<String, ScenarioStatus> {
        self.progress.lock().clone()
    }

    fn set_progress(&self, scenario: &str, status: ScenarioStatus) {
        debug!("[{}] {}", scenario, status);
        self.progress.lock().insert(scenario.to_string(), status);
    }

    /// Run one scenario with its own session, registry and evidence
    /// collector.
    ///
    /// Only a `SessionStart` failure is returned as an error; everything
    /// else is recorded in the report.
    pub async fn run(&self, scenario: &Scenario) -> HarnessResult<RunReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        info!("Running scenario: {}", scenario.name);
        self.set_progress(&scenario.name, ScenarioStatus::Pending);

        let mode = scenario.mock_mode.unwrap_or(self.options.mock_mode);
        let registry = match RouteRegistry::from_specs(&scenario.routes, &self.fixtures, mode) {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                error!("Scenario '{}' has an invalid route table: {}", scenario.name, e);
                self.set_progress(&scenario.name, ScenarioStatus::HardFailed);
                return Ok(RunReport::not_started(&scenario.name, &e));
            }
        };

        let spec = SessionSpec {
            base_url: scenario.base_url.clone(),
            viewport: scenario.viewport.unwrap_or(self.options.viewport),
        };
        let output_root = scenario
            .output_dir
            .clone()
            .unwrap_or_else(|| self.options.output_dir.clone());
        let collector = EvidenceCollector::new(&output_root, &scenario.name);

        let outcome = with_session(&self.provider, &spec, Arc::clone(&registry), |session| {
            let registry = Arc::clone(&registry);
            async move {
                let mut run = Execution::new(collector);
                let driven = AssertUnwindSafe(self.drive(session.as_ref(), &registry, scenario, &mut run))
                    .catch_unwind()
                    .await;
                if let Err(panic) = driven {
                    let message = panic_message(panic.as_ref());
                    error!("Scenario '{}' panicked: {}", scenario.name, message);
                    run.abort(
                        &scenario.steps,
                        FailureInfo {
                            kind: FailureKind::Other,
                            message: format!("panic: {}", message),
                            evidence: None,
                        },
                    );
                }
                run
            }
        })
        .await;

        let mut run = match outcome {
            Ok(run) => run,
            Err(e @ HarnessError::SessionStart(_)) => return Err(e),
            Err(e) => {
                error!("Scenario '{}' could not start: {}", scenario.name, e);
                self.set_progress(&scenario.name, ScenarioStatus::HardFailed);
                return Ok(RunReport::not_started(&scenario.name, &e));
            }
        };

        // Requests rejected while the session was closing
        run.reject_late(&scenario.name, &registry.take_mismatches());

        let status = run.status();
        self.set_progress(&scenario.name, status);
        Ok(RunReport {
            scenario: scenario.name.clone(),
            status,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            steps: run.steps,
            artifacts: run.collector.into_artifacts(),
            dispatches: registry.records(),
            state_injected: run.state_injected,
            visual_diffs: run.visual_diffs,
            error: run.error,
        })
    }

    /// Run scenarios, up to `max_parallel` at a time. A `SessionStart`
    /// failure stops every scenario not yet started.
    pub async fn run_all(&self, scenarios: &[Scenario]) -> SuiteReport {
        let start = Instant::now();
        let aborted: Mutex<Option<String>> = Mutex::new(None);

        info!("Running {} scenario(s)...", scenarios.len());
        for scenario in scenarios {
            self.set_progress(&scenario.name, ScenarioStatus::Pending);
        }

        let results: Vec<RunReport> = stream::iter(scenarios)
            .map(|scenario| {
                let aborted = &aborted;
                async move {
                    if aborted.lock().is_some() {
                        debug!("Skipping '{}' after harness failure", scenario.name);
                        return None;
                    }
                    match self.run(scenario).await {
                        Ok(report) => {
                            if report.status.is_success() {
                                info!("✓ {} ({}, {} ms)", report.scenario, report.status, report.duration_ms);
                            } else {
                                error!(
                                    "✗ {} - {}",
                                    report.scenario,
                                    report
                                        .error
                                        .as_ref()
                                        .map_or("unknown error", |f| f.message.as_str())
                                );
                            }
                            Some(report)
                        }
                        Err(e) => {
                            error!("Aborting suite: {}", e);
                            aborted.lock().get_or_insert_with(|| e.to_string());
                            None
                        }
                    }
                }
            })
            .buffered(self.options.max_parallel.max(1))
            .filter_map(|report| async move { report })
            .collect()
            .await;

        let suite = SuiteReport::new(results, start.elapsed().as_millis() as u64, aborted.into_inner());
        info!(
            "Results: {} completed, {} with warnings, {} failed ({} ms)",
            suite.completed, suite.warnings, suite.failed, suite.duration_ms
        );
        suite
    }

    async fn drive(
        &self,
        session: &dyn ActiveSession,
        registry: &RouteRegistry,
        scenario: &Scenario,
        run: &mut Execution,
    ) {
        let page = match session.new_page().await {
            Ok(page) => page,
            Err(e) => {
                error!("Scenario '{}' could not open a page: {}", scenario.name, e);
                run.abort(&scenario.steps, FailureInfo::from(&e));
                return;
            }
        };
        self.execute(page.as_ref(), session.base_url(), registry, scenario, run)
            .await;

        if run.reject_late(&scenario.name, &registry.take_mismatches()) {
            let index = run.steps.len().saturating_sub(1);
            run.collector.capture_failure(page.as_ref(), index).await;
        }
    }

    async fn execute(
        &self,
        page: &dyn PageDriver,
        base_url: &str,
        registry: &RouteRegistry,
        scenario: &Scenario,
        run: &mut Execution,
    ) {
        for (index, spec) in scenario.steps.iter().enumerate() {
            if index == 0 {
                self.set_progress(&scenario.name, ScenarioStatus::Running);
            }
            let label = spec.step.label();
            debug!("[{}] step {}: {}", scenario.name, index, label);
            let started = Instant::now();
            let first_artifact = run.collector.artifacts().len();

            let mut result = self
                .step(page, base_url, registry, index, spec, run)
                .await;

            let mismatches = registry.take_mismatches();
            if let Some(first) = mismatches.first() {
                warn!(
                    "[{}] {} request(s) matched no route, first: {} {}",
                    scenario.name,
                    mismatches.len(),
                    first.method,
                    first.url
                );
                if !matches!(&result, Err(e) if e.is_fatal()) {
                    result = Err(HarnessError::MockMismatch {
                        method: first.method.clone(),
                        url: first.url.clone(),
                    });
                }
            }

            let mut artifacts: Vec<PathBuf> = run.collector.artifacts()[first_artifact..]
                .iter()
                .map(|a| a.path.clone())
                .collect();
            let mut outcome = StepOutcome {
                index,
                label,
                criticality: spec.criticality,
                status: StepStatus::Passed,
                duration_ms: 0,
                failure: None,
                artifacts: Vec::new(),
            };

            match result {
                Ok(()) => {}
                Err(e) if !e.is_fatal() && spec.criticality == Criticality::BestEffort => {
                    warn!("[{}] best-effort step {} failed: {}", scenario.name, outcome.label, e);
                    outcome.status = StepStatus::SoftFailed;
                    outcome.failure = Some(FailureInfo::from(&e));
                }
                Err(e) => {
                    error!("[{}] step {} failed: {}", scenario.name, outcome.label, e);
                    if !matches!(e, HarnessError::DriverClosed) {
                        artifacts.extend(run.collector.capture_failure(page, index).await);
                    }
                    let failure = FailureInfo::from(&e);
                    outcome.status = StepStatus::HardFailed;
                    outcome.failure = Some(failure.clone());
                    run.error = Some(failure);
                }
            }

            outcome.duration_ms = started.elapsed().as_millis() as u64;
            outcome.artifacts = artifacts;
            let halted = outcome.status == StepStatus::HardFailed;
            run.steps.push(outcome);
            if halted {
                run.skip_rest(&scenario.steps);
                return;
            }
        }
    }

    async fn step(
        &self,
        page: &dyn PageDriver,
        base_url: &str,
        registry: &RouteRegistry,
        index: usize,
        spec: &StepSpec,
        run: &mut Execution,
    ) -> HarnessResult<()> {
        let budget = |default: Duration| spec.timeout_ms.map_or(default, Duration::from_millis);
        let policy = PollPolicy::new(budget(self.options.step_timeout), self.options.poll_interval);

        match &spec.step {
            Step::Navigate { url } => {
                let url = resolve_url(base_url, url);
                let timeout = budget(self.options.navigation_timeout);
                within(&format!("navigate to {}", url), timeout, page.goto(&url, timeout)).await
            }

            Step::Fill { selector, value } => {
                act(&format!("fill {}", selector), policy, move |t| {
                    page.fill(selector, value, t)
                })
                .await
            }

            Step::Click { selector } => {
                act(&format!("click {}", selector), policy, move |t| {
                    page.click(selector, t)
                })
                .await
            }

            Step::Select {
                selector,
                label,
                value,
            } => {
                let choice = Step::select_choice(label, value)?;
                let choice = &choice;
                act(&format!("select in {}", selector), policy, move |t| {
                    page.select_option(selector, choice, t)
                })
                .await
            }

            Step::WaitFor {
                selector: Some(selector),
                state,
                ..
            } => {
                let state = *state;
                let outcome = poll_until(policy, move || async move {
                    let el = page.query(selector).await?;
                    Ok::<_, HarnessError>(if wait_satisfied(state, &el) {
                        Probe::Done(el)
                    } else {
                        Probe::Pending(el)
                    })
                })
                .await?;
                timed_out(
                    format!("wait for {} to be {}", selector, format!("{:?}", state).to_lowercase()),
                    policy,
                    outcome,
                    |el| format!("{} attached, {} visible", el.count, el.visible),
                )
                .map(|_| ())
            }

            Step::WaitFor {
                expression: Some(expression),
                ..
            } => {
                let outcome = poll_until(policy, move || async move {
                    let value = page.evaluate(expression).await?;
                    Ok::<_, HarnessError>(if is_truthy(&value) {
                        Probe::Done(value)
                    } else {
                        Probe::Pending(value)
                    })
                })
                .await?;
                timed_out(
                    format!("wait for `{}`", expression),
                    policy,
                    outcome,
                    |v| v.to_string(),
                )
                .map(|_| ())
            }

            Step::WaitFor { .. } => Err(HarnessError::Scenario(
                "wait_for needs a selector or an expression".to_string(),
            )),

            Step::Evaluate {
                script,
                expect: None,
            } => within("evaluate", policy.timeout, page.evaluate(script))
                .await
                .map(|value| debug!("evaluate returned {}", value)),

            Step::Evaluate {
                script,
                expect: Some(expected),
            } => {
                let outcome = poll_until(policy, move || async move {
                    let value = page.evaluate(script).await?;
                    Ok::<_, HarnessError>(if values_equal(expected, &value) {
                        Probe::Done(value)
                    } else {
                        Probe::Pending(value)
                    })
                })
                .await?;
                timed_out(
                    format!("`{}` to return {}", script, expected),
                    policy,
                    outcome,
                    |v: Value| v.to_string(),
                )
                .map(|_| ())
            }

            Step::Inject { mutation } => {
                run.state_injected = true;
                let injection = within(
                    &mutation.describe(),
                    policy.timeout,
                    self.injector.apply(page, mutation),
                )
                .await?;
                debug!("{} affected {} element(s)", mutation.describe(), injection.affected);
                Ok(())
            }

            Step::Assert {
                condition,
                description,
            } => {
                let description = description.clone().unwrap_or_else(|| condition.describe());
                let ctx = CheckContext {
                    page,
                    registry,
                    base_url,
                };
                let observation = run
                    .collector
                    .assert(&ctx, index, condition, &description, policy)
                    .await?;
                debug!("assert {}: {}", description, observation.observed);
                Ok(())
            }

            Step::Screenshot {
                target,
                name,
                full_page,
            } => {
                let target = match target {
                    Some(selector) => ScreenshotTarget::Element {
                        selector: selector.clone(),
                    },
                    None => ScreenshotTarget::Page {
                        full_page: *full_page,
                    },
                };
                let artifact = run
                    .collector
                    .screenshot(page, index, &target, name.clone(), policy)
                    .await?;

                let Some(visual) = &self.visual else {
                    return Ok(());
                };
                match visual.compare(&artifact.path)? {
                    Some(diff) => {
                        let matches = diff.matches;
                        let percent = diff.diff_percent;
                        run.visual_diffs.push(diff);
                        if matches {
                            Ok(())
                        } else {
                            Err(HarnessError::Visual(format!(
                                "{} differs from its baseline by {:.2}%",
                                artifact.path.display(),
                                percent
                            )))
                        }
                    }
                    None => {
                        info!("No baseline for {}", artifact.path.display());
                        Ok(())
                    }
                }
            }

            Step::Include { scenario } => Err(HarnessError::Scenario(format!(
                "include of '{}' was not resolved",
                scenario
            ))),
        }
    }
}
