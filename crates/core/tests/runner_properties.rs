//! Runner properties exercised against a scripted application
//!
//! The app model below renders a pricing page, a login form and a
//! dashboard with an upload/stock-music toggle, issuing its API calls
//! through the scenario's route table the way the real pages do.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Value};
use tempfile::TempDir;

use pagewright_core::config::Viewport;
use pagewright_core::error::{FailureKind, HarnessResult};
use pagewright_core::fixture::Fixture;
use pagewright_core::mock::{BranchRule, DispatchOutcome, InterceptedRequest};
use pagewright_core::page::PageDriver;
use pagewright_core::report::RunReport;
use pagewright_core::session::{with_session, ActiveSession, SessionProvider, SessionSpec};
use pagewright_core::testing::{AppModel, FakeDom, FakeElement, ScriptedLauncher};
use pagewright_core::{
    FixtureStore, MockMode, RouteRegistry, RunOptions, Scenario, ScenarioRunner, ScenarioSet,
    ScenarioStatus, StepStatus,
};

const ORIGIN: &str = "http://app.test";
const SANDBOX: &str = "https://sandbox.phonepe.com/pay";

fn fixtures() -> Arc<FixtureStore> {
    let plan = |amount: u64| {
        json!({
            "currency": "INR",
            "plans": [
                {"id": "ESSENTIALS", "price": "₹499", "amount": amount, "badge": "50% OFF"}
            ]
        })
    };
    let payment: BranchRule = serde_json::from_value(json!({
        "inspect": {"json": "/amount"},
        "cases": [
            {"equals": 49900, "status": 200, "body": {"redirectUrl": format!("{}?txn=T1", SANDBOX)}}
        ],
        "otherwise": {"status": 400, "body": {"error": "amount mismatch"}}
    }))
    .unwrap();

    Arc::new(
        FixtureStore::from_fixtures([
            Fixture::json("pricing", plan(49900)),
            Fixture::json("pricing_mispriced", plan(1)),
            Fixture::branch("payment_initiate", payment),
            Fixture::json("user_info", json!({"name": "QA User", "email": "qa@example.com"})),
            Fixture::binary("audio/lofi_chill", "audio/mpeg", b"ID3\x03fake-mp3".to_vec()),
        ])
        .unwrap(),
    )
}

fn body_json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

fn dashboard(dom: &mut FakeDom, registry: &RouteRegistry) {
    dom.url = format!("{}/dashboard.html", ORIGIN);
    dom.elements.clear();
    if let Some(resp) = dom.request(registry, "GET", &format!("{}/api/user/info", ORIGIN), None) {
        let info = body_json(&resp.body);
        dom.set("#user-name", FakeElement::shown(info["name"].as_str().unwrap_or_default()));
    }
    dom.set("#upload-section", FakeElement::shown("Upload your track"));
    dom.set("#stock-section", FakeElement::hidden());
    dom.set("#stock-library-toggle", FakeElement::shown("Stock Library"));
    dom.set(
        "#stock-music-select",
        FakeElement::hidden()
            .with_option("", "Choose a track")
            .with_option("lofi_chill", "Lofi Chill")
            .with_option("ambient_focus", "Ambient Focus"),
    );
    dom.set("#stock-preview", FakeElement::hidden().with_attr("src", ""));
}

/// Emulated application; `exclusive_toggle` off reproduces a page that
/// shows both sections at once
fn app(exclusive_toggle: bool) -> AppModel {
    AppModel::new()
        .page("/pricing.html", |dom, registry| {
            dom.set("#payment-error", FakeElement::hidden());
            let Some(resp) = dom.request(registry, "GET", &format!("{}/api/pricing", ORIGIN), None)
            else {
                return;
            };
            let pricing = body_json(&resp.body);
            for plan in pricing["plans"].as_array().into_iter().flatten() {
                let id = plan["id"].as_str().unwrap_or_default();
                dom.set(
                    &format!("#plan-{}-price", id),
                    FakeElement::shown(plan["price"].as_str().unwrap_or_default()),
                );
                dom.set(
                    &format!("#plan-{}-badge", id),
                    FakeElement::shown(plan["badge"].as_str().unwrap_or_default()),
                );
                dom.set(
                    &format!("#plan-{}-upgrade", id),
                    FakeElement::shown("Upgrade").with_attr("data-amount", plan["amount"].to_string()),
                );
            }
        })
        .on_click("#plan-ESSENTIALS-upgrade", |dom, registry| {
            let amount: Value = dom
                .element("#plan-ESSENTIALS-upgrade")
                .and_then(|el| el.attributes.get("data-amount"))
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null);
            let redirect = dom
                .request(
                    registry,
                    "POST",
                    &format!("{}/api/payment/initiate", ORIGIN),
                    Some(json!({"plan": "ESSENTIALS", "amount": amount})),
                )
                .filter(|resp| resp.status == 200)
                .and_then(|resp| body_json(&resp.body)["redirectUrl"].as_str().map(String::from));
            match redirect {
                Some(url) => dom.url = url,
                None => dom.set_visible("#payment-error", true),
            }
        })
        .page("/login.html", |dom, _| {
            dom.set("#email", FakeElement::shown(""));
            dom.set("#password", FakeElement::shown(""));
            dom.set("#login-submit", FakeElement::shown("Sign in"));
            dom.set("#login-error", FakeElement::hidden());
        })
        .on_click("#login-submit", |dom, registry| {
            let email = dom.element("#email").map(|el| el.value.clone()).unwrap_or_default();
            let ok = dom
                .request(
                    registry,
                    "POST",
                    &format!("{}/api/auth/login", ORIGIN),
                    Some(json!({"email": email})),
                )
                .map_or(false, |resp| resp.status == 200);
            if ok {
                dashboard(dom, registry);
            } else {
                dom.set_visible("#login-error", true);
            }
        })
        .page("/dashboard.html", dashboard)
        .on_click("#stock-library-toggle", move |dom, _| {
            if exclusive_toggle {
                dom.set_visible("#upload-section", false);
            }
            for selector in ["#stock-section", "#stock-music-select", "#stock-preview"] {
                dom.set_visible(selector, true);
            }
        })
        .on_change("#stock-music-select", |dom, _| {
            let key = dom
                .element("#stock-music-select")
                .map(|el| el.value.clone())
                .unwrap_or_default();
            if let Some(preview) = dom.element_mut("#stock-preview") {
                preview
                    .attributes
                    .insert("src".to_string(), format!("/api/stock-music/preview?key={}", key));
            }
        })
        .on_click("#crash", |_, _| panic!("scripted crash"))
}

const LOGIN_FRAGMENT: &str = r##"
name: register-and-login
fragment: true
steps:
  - action: navigate
    url: /login.html
  - action: fill
    selector: "#email"
    value: qa@example.com
  - action: fill
    selector: "#password"
    value: correct-horse
  - action: click
    selector: "#login-submit"
  - action: wait_for
    selector: "#user-name"
"##;

const AUTH_ROUTES: &str = r##"
  - pattern: "**/api/auth/login"
    method: POST
    body: {token: test-token}
  - pattern: "**/api/user/info"
    fixture: user_info
"##;

fn payment_scenario(name: &str, pricing_fixture: &str, outcome: &str) -> Scenario {
    Scenario::from_yaml(&format!(
        r##"
name: {name}
routes:
  - pattern: "**/api/pricing"
    method: GET
    fixture: {pricing_fixture}
  - pattern: "**/api/payment/initiate"
    method: POST
    fixture: payment_initiate
steps:
  - action: navigate
    url: /pricing.html
  - action: assert
    condition: {{check: text_contains, selector: "#plan-ESSENTIALS-badge", text: 50% OFF}}
  - action: assert
    condition: {{check: text_contains, selector: "#plan-ESSENTIALS-price", text: "₹499"}}
  - action: click
    selector: "#plan-ESSENTIALS-upgrade"
{outcome}
"##
    ))
    .unwrap()
}

fn scenario_a() -> Scenario {
    payment_scenario(
        "pricing-payment",
        "pricing",
        r##"
  - action: assert
    condition: {check: request, pattern: "**/api/payment/initiate", method: POST, json: {"/amount": 49900}, status: 200}
  - action: assert
    condition: {check: url_contains, value: "sandbox.phonepe.com/pay"}
  - action: screenshot
    name: redirected
"##,
    )
}

fn scenario_b() -> Scenario {
    payment_scenario(
        "payment-wrong-amount",
        "pricing_mispriced",
        r##"
  - action: assert
    condition: {check: request, pattern: "**/api/payment/initiate", method: POST, json: {"/amount": 1}, status: 400}
  - action: assert
    condition: {check: visible, selector: "#payment-error"}
  - action: assert
    condition: {check: url_not_contains, value: "sandbox.phonepe.com"}
"##,
    )
}

fn stock_scenarios() -> ScenarioSet {
    let toggle = format!(
        r##"
name: stock-music-toggle
routes:{AUTH_ROUTES}
steps:
  - action: include
    scenario: register-and-login
  - action: assert
    condition: {{check: exactly_one_visible, selectors: ["#upload-section", "#stock-section"]}}
  - action: click
    selector: "#stock-library-toggle"
  - action: assert
    condition: {{check: exactly_one_visible, selectors: ["#upload-section", "#stock-section"]}}
  - action: assert
    condition: {{check: visible, selector: "#stock-section"}}
"##
    );
    let preview = format!(
        r##"
name: stock-music-preview
routes:{AUTH_ROUTES}
  - pattern: "**/api/stock-music/preview*"
    fixture: audio/lofi_chill
steps:
  - action: include
    scenario: register-and-login
  - action: click
    selector: "#stock-library-toggle"
  - action: select
    selector: "#stock-music-select"
    label: Lofi Chill
  - action: assert
    condition:
      check: attribute_contains
      selector: "#stock-preview"
      attribute: src
      contains: ["/api/stock-music/preview", "key="]
  - action: assert
    condition:
      check: resource
      from_attribute: {{selector: "#stock-preview", attribute: src}}
      status: 200
      content_type: audio/mpeg
"##
    );

    ScenarioSet::new([
        Scenario::from_yaml(LOGIN_FRAGMENT).unwrap(),
        Scenario::from_yaml(&toggle).unwrap(),
        Scenario::from_yaml(&preview).unwrap(),
    ])
    .unwrap()
}

fn options(output: &Path) -> RunOptions {
    RunOptions {
        step_timeout: Duration::from_millis(500),
        navigation_timeout: Duration::from_millis(1000),
        poll_interval: Duration::from_millis(10),
        output_dir: output.to_path_buf(),
        ..RunOptions::default()
    }
}

fn runner(launcher: ScriptedLauncher, output: &Path) -> ScenarioRunner<ScriptedLauncher> {
    ScenarioRunner::new(launcher, fixtures(), options(output)).unwrap()
}

fn failure_kinds(report: &RunReport) -> Vec<FailureKind> {
    report
        .failures()
        .filter_map(|s| s.failure.as_ref().map(|f| f.kind))
        .collect()
}

#[tokio::test]
async fn scenario_a_redirects_to_sandbox() {
    let out = TempDir::new().unwrap();
    let report = runner(ScriptedLauncher::new(app(true)), out.path())
        .run(&scenario_a())
        .await
        .unwrap();

    assert_eq!(report.status, ScenarioStatus::Completed, "{:#?}", report.steps);
    assert_eq!(report.failures().count(), 0);
    assert!(report.statuses().iter().all(|s| *s == StepStatus::Passed));

    let payment = report
        .dispatches
        .iter()
        .find(|d| d.url.ends_with("/api/payment/initiate"))
        .unwrap();
    assert_eq!(payment.json_body.as_ref().unwrap()["amount"], 49900);

    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(
        report.artifacts[0].path,
        out.path().join("pricing-payment/pricing-payment_6_0.png")
    );
    assert!(!report.state_injected);
}

#[tokio::test]
async fn scenario_b_detects_failed_redirect() {
    let out = TempDir::new().unwrap();
    let report = runner(ScriptedLauncher::new(app(true)), out.path())
        .run(&scenario_b())
        .await
        .unwrap();

    assert_eq!(report.status, ScenarioStatus::Completed, "{:#?}", report.steps);
    let payment = report
        .dispatches
        .iter()
        .find(|d| d.url.ends_with("/api/payment/initiate"))
        .unwrap();
    assert_eq!(payment.json_body.as_ref().unwrap()["amount"], 1);
}

#[tokio::test]
async fn scenario_a_fails_with_evidence_when_amount_is_wrong() {
    let out = TempDir::new().unwrap();
    let mut scenario = scenario_a();
    scenario.routes[0].fixture = Some("pricing_mispriced".to_string());
    for step in &mut scenario.steps {
        step.timeout_ms = Some(100);
    }

    let report = runner(ScriptedLauncher::new(app(true)), out.path())
        .run(&scenario)
        .await
        .unwrap();

    assert_eq!(report.status, ScenarioStatus::HardFailed);
    assert_eq!(failure_kinds(&report), vec![FailureKind::AssertionFailure]);
    let failed = report.failures().next().unwrap();
    assert_eq!(failed.index, 4);
    assert!(failed.failure.as_ref().unwrap().evidence.is_some());
    assert!(failed.artifacts.iter().all(|p| p.exists()));
    assert_eq!(
        report.statuses()[5..].to_vec(),
        vec![StepStatus::Skipped, StepStatus::Skipped]
    );
}

#[tokio::test]
async fn scenario_c_toggle_is_exclusive() {
    let out = TempDir::new().unwrap();
    let set = stock_scenarios();
    let scenario = set.resolve("stock-music-toggle").unwrap();
    assert_eq!(scenario.steps.len(), 9);

    let report = runner(ScriptedLauncher::new(app(true)), out.path())
        .run(&scenario)
        .await
        .unwrap();
    assert_eq!(report.status, ScenarioStatus::Completed, "{:#?}", report.steps);
}

#[tokio::test]
async fn scenario_c_reports_both_sections_visible() {
    let out = TempDir::new().unwrap();
    let mut scenario = stock_scenarios().resolve("stock-music-toggle").unwrap();
    for step in &mut scenario.steps {
        step.timeout_ms = Some(100);
    }

    let report = runner(ScriptedLauncher::new(app(false)), out.path())
        .run(&scenario)
        .await
        .unwrap();
    assert_eq!(report.status, ScenarioStatus::HardFailed);
    let failed = report.failures().next().unwrap();
    assert_eq!(failed.index, 7);
    let failure = failed.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::AssertionFailure);
    assert!(failure.message.contains("#stock-section"), "{}", failure.message);
}

#[tokio::test]
async fn scenario_d_preview_resolves_to_audio() {
    let out = TempDir::new().unwrap();
    let scenario = stock_scenarios().resolve("stock-music-preview").unwrap();

    let report = runner(ScriptedLauncher::new(app(true)), out.path())
        .run(&scenario)
        .await
        .unwrap();
    assert_eq!(report.status, ScenarioStatus::Completed, "{:#?}", report.steps);
}

#[tokio::test]
async fn earliest_registered_route_wins() {
    for (first, second, expected_amount) in [
        ("pricing", "pricing_mispriced", 49900),
        ("pricing_mispriced", "pricing", 1),
    ] {
        let out = TempDir::new().unwrap();
        let mut scenario = scenario_a();
        scenario.routes[0].fixture = Some(first.to_string());
        let mut shadowed = scenario.routes[0].clone();
        shadowed.pattern = "**/api/**".to_string();
        shadowed.fixture = Some(second.to_string());
        scenario.routes.insert(1, shadowed);
        scenario.steps.truncate(4);

        let report = runner(ScriptedLauncher::new(app(true)), out.path())
            .run(&scenario)
            .await
            .unwrap();

        assert_eq!(report.dispatches[0].route, Some(0));
        let payment = report
            .dispatches
            .iter()
            .find(|d| d.url.ends_with("/api/payment/initiate"))
            .unwrap();
        assert_eq!(payment.json_body.as_ref().unwrap()["amount"], expected_amount);
    }
}

#[tokio::test]
async fn reruns_are_identical() {
    let mut failing = scenario_a();
    failing.routes[0].fixture = Some("pricing_mispriced".to_string());
    for step in &mut failing.steps {
        step.timeout_ms = Some(50);
    }

    for scenario in [scenario_a(), failing] {
        let mut runs = Vec::new();
        for _ in 0..2 {
            let out = TempDir::new().unwrap();
            let report = runner(ScriptedLauncher::new(app(true)), out.path())
                .run(&scenario)
                .await
                .unwrap();
            runs.push((report.statuses(), report.artifacts.len(), report.status));
        }
        assert_eq!(runs[0], runs[1]);
    }
}

#[tokio::test]
async fn zero_and_tiny_timeouts_fail_as_timeouts() {
    let out = TempDir::new().unwrap();
    let runner = runner(ScriptedLauncher::new(app(true)), out.path());

    for timeout_ms in [0, 5] {
        let mut scenario = scenario_a();
        scenario.steps.truncate(4);
        scenario.steps[3].timeout_ms = Some(timeout_ms);
        let report = runner.run(&scenario).await.unwrap();
        assert_eq!(failure_kinds(&report), vec![FailureKind::Timeout], "{} ms", timeout_ms);

        let mut scenario = scenario_a();
        scenario.steps.truncate(2);
        scenario.steps[1].timeout_ms = Some(timeout_ms);
        let report = runner.run(&scenario).await.unwrap();
        assert_eq!(failure_kinds(&report), vec![FailureKind::Timeout], "{} ms", timeout_ms);
    }

    let mut scenario = scenario_a();
    scenario.steps.truncate(1);
    scenario.steps[0].timeout_ms = Some(0);
    let report = runner.run(&scenario).await.unwrap();
    assert_eq!(failure_kinds(&report), vec![FailureKind::Timeout]);
}

#[tokio::test]
async fn best_effort_failures_complete_with_warnings() {
    let out = TempDir::new().unwrap();
    let mut scenario = scenario_a();
    scenario.steps.insert(
        1,
        Scenario::from_yaml(
            r##"
name: probe
steps:
  - action: click
    selector: "#cookie-banner-dismiss"
    criticality: best_effort
    timeout_ms: 50
"##,
        )
        .unwrap()
        .steps
        .remove(0),
    );

    let report = runner(ScriptedLauncher::new(app(true)), out.path())
        .run(&scenario)
        .await
        .unwrap();
    assert_eq!(report.status, ScenarioStatus::SoftFailed);
    assert!(report.status.is_success());
    assert_eq!(report.statuses()[1], StepStatus::SoftFailed);
    assert_eq!(failure_kinds(&report), vec![FailureKind::TargetNotFound]);
}

#[tokio::test]
async fn strict_mode_mismatch_is_fatal_even_when_best_effort() {
    let out = TempDir::new().unwrap();
    let mut scenario = stock_scenarios().resolve("stock-music-toggle").unwrap();
    scenario.mock_mode = Some(MockMode::Strict);
    scenario.routes.retain(|r| r.pattern != "**/api/user/info");
    for step in &mut scenario.steps {
        step.criticality = pagewright_core::scenario::Criticality::BestEffort;
    }

    let report = runner(ScriptedLauncher::new(app(true)), out.path())
        .run(&scenario)
        .await
        .unwrap();
    assert_eq!(report.status, ScenarioStatus::HardFailed);
    assert_eq!(failure_kinds(&report), vec![FailureKind::MockMismatch]);
    assert_eq!(report.statuses()[3], StepStatus::HardFailed);
}

/// Sessions whose page sends one unrouted request while being torn down,
/// after the last step has already returned
struct BeaconOnClose(ScriptedLauncher);

struct BeaconSession {
    inner: Box<dyn ActiveSession>,
    registry: Arc<RouteRegistry>,
}

#[async_trait]
impl SessionProvider for BeaconOnClose {
    async fn open(
        &self,
        spec: &SessionSpec,
        registry: Arc<RouteRegistry>,
    ) -> HarnessResult<Box<dyn ActiveSession>> {
        let inner = self.0.open(spec, Arc::clone(&registry)).await?;
        Ok(Box::new(BeaconSession { inner, registry }))
    }
}

#[async_trait]
impl ActiveSession for BeaconSession {
    fn base_url(&self) -> &str {
        self.inner.base_url()
    }

    async fn new_page(&self) -> HarnessResult<Box<dyn PageDriver>> {
        self.inner.new_page().await
    }

    async fn close(&self) {
        let beacon = InterceptedRequest::new("GET", format!("{}/api/unmocked", ORIGIN));
        let _ = self.registry.dispatch(&beacon);
        self.inner.close().await;
    }
}

#[tokio::test]
async fn strict_mode_rejection_after_last_step_fails_the_run() {
    let out = TempDir::new().unwrap();
    let launcher = ScriptedLauncher::new(app(true));
    let counters = launcher.counters();
    let mut scenario = scenario_a();
    scenario.mock_mode = Some(MockMode::Strict);

    let report = ScenarioRunner::new(BeaconOnClose(launcher), fixtures(), options(out.path()))
        .unwrap()
        .run(&scenario)
        .await
        .unwrap();

    assert!(report.statuses().iter().all(|s| *s == StepStatus::Passed));
    assert_eq!(report.status, ScenarioStatus::HardFailed);
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.kind, FailureKind::MockMismatch);
    assert!(error.message.contains("/api/unmocked"));
    assert!(report
        .dispatches
        .iter()
        .any(|d| d.outcome == DispatchOutcome::Rejected && d.url.ends_with("/api/unmocked")));
    assert_eq!(counters.released(), 1);
}

#[tokio::test]
async fn lenient_mode_ignores_requests_after_last_step() {
    let out = TempDir::new().unwrap();
    let mut scenario = scenario_a();
    scenario.mock_mode = Some(MockMode::Lenient);

    let report = ScenarioRunner::new(
        BeaconOnClose(ScriptedLauncher::new(app(true))),
        fixtures(),
        options(out.path()),
    )
    .unwrap()
    .run(&scenario)
    .await
    .unwrap();

    assert_eq!(report.status, ScenarioStatus::Completed, "{:#?}", report.error);
}

#[tokio::test]
async fn session_released_once_after_hard_failure() {
    let out = TempDir::new().unwrap();
    let launcher = ScriptedLauncher::new(app(true));
    let counters = launcher.counters();

    let mut scenario = scenario_a();
    scenario.steps[1].timeout_ms = Some(50);
    scenario.routes.clear();

    let report = runner(launcher, out.path()).run(&scenario).await.unwrap();
    assert_eq!(report.status, ScenarioStatus::HardFailed);
    assert_eq!(counters.opened(), 1);
    assert_eq!(counters.released(), 1);
}

#[tokio::test]
async fn session_released_once_after_panic() {
    let out = TempDir::new().unwrap();
    let launcher = ScriptedLauncher::new(app(true).page("/crash.html", |dom, _| {
        dom.set("#crash", FakeElement::shown("Crash"));
    }));
    let counters = launcher.counters();

    let scenario = Scenario::from_yaml(
        r##"
name: crash
steps:
  - action: navigate
    url: /crash.html
  - action: click
    selector: "#crash"
  - action: navigate
    url: /pricing.html
"##,
    )
    .unwrap();

    let report = runner(launcher.clone(), out.path()).run(&scenario).await.unwrap();
    assert_eq!(report.status, ScenarioStatus::HardFailed);
    assert_eq!(
        report.statuses(),
        vec![StepStatus::Passed, StepStatus::HardFailed, StepStatus::Skipped]
    );
    assert!(report.error.as_ref().unwrap().message.contains("scripted crash"));
    assert_eq!(counters.released(), 1);

    // A panic escaping the scoped block is resumed after release
    let spec = SessionSpec {
        base_url: None,
        viewport: Viewport::default(),
    };
    let registry = Arc::new(RouteRegistry::new(MockMode::Lenient));
    let outcome = AssertUnwindSafe(with_session(&launcher, &spec, registry, |_session| async {
        panic!("escaped");
    }))
    .catch_unwind()
    .await;
    assert!(outcome.is_err());
    assert_eq!(counters.opened(), 2);
    assert_eq!(counters.released(), 2);
}

#[tokio::test]
async fn session_start_failure_aborts_suite() {
    let out = TempDir::new().unwrap();
    let runner = runner(ScriptedLauncher::failing("node: command not found"), out.path());

    let suite = runner.run_all(&[scenario_a(), scenario_b()]).await;
    assert!(suite.results.is_empty());
    assert_eq!(suite.exit_code(), 2);
    assert!(suite.aborted.as_deref().unwrap().contains("node"));
    assert!(runner
        .progress()
        .values()
        .all(|status| *status == ScenarioStatus::Pending));
}

#[tokio::test]
async fn progress_moves_from_running_to_final_status() {
    let out = TempDir::new().unwrap();
    let launcher = ScriptedLauncher::new(app(true).stall("#plan-ESSENTIALS-upgrade"));
    let runner = runner(launcher, out.path());
    let mut scenario = scenario_a();
    scenario.steps[3].timeout_ms = Some(300);

    let watch = async {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if runner.progress().get("pricing-payment") == Some(&ScenarioStatus::Running) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    };
    let (suite, seen_running) = tokio::join!(runner.run_all(std::slice::from_ref(&scenario)), watch);

    assert!(seen_running.is_ok());
    assert_eq!(suite.failed, 1);
    assert_eq!(
        runner.progress().get("pricing-payment"),
        Some(&ScenarioStatus::HardFailed)
    );
}

#[tokio::test]
async fn suite_runs_scenarios_in_isolated_sessions() {
    let out = TempDir::new().unwrap();
    let launcher = ScriptedLauncher::new(app(true));
    let counters = launcher.counters();
    let mut options = options(out.path());
    options.max_parallel = 2;
    let runner = ScenarioRunner::new(launcher, fixtures(), options).unwrap();

    let set = stock_scenarios();
    let scenarios = vec![
        scenario_a(),
        scenario_b(),
        set.resolve("stock-music-toggle").unwrap(),
        set.resolve("stock-music-preview").unwrap(),
    ];
    let suite = runner.run_all(&scenarios).await;

    assert_eq!(suite.total, 4);
    assert_eq!(suite.completed, 4, "{:#?}", suite.results);
    assert_eq!(suite.exit_code(), 0);
    let names: Vec<_> = suite.results.iter().map(|r| r.scenario.as_str()).collect();
    assert_eq!(
        names,
        vec!["pricing-payment", "payment-wrong-amount", "stock-music-toggle", "stock-music-preview"]
    );
    assert_eq!(counters.opened(), 4);
    assert_eq!(counters.released(), 4);
    // each scenario saw only its own traffic
    assert!(suite.results[0]
        .dispatches
        .iter()
        .all(|d| !d.url.contains("/api/user/info")));
}
