//! Loading the repository's own configuration, fixtures and scenarios,
//! plus the malformed-input cases a scenario author runs into

use std::fs;
use std::path::PathBuf;

use serde_json::json;
use tempfile::TempDir;

use pagewright_core::fixture::FixturePayload;
use pagewright_core::mock::{Dispatch, InterceptedRequest};
use pagewright_core::{
    FixtureStore, HarnessConfig, HarnessError, MockMode, RouteRegistry, ScenarioSet,
};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(|p| p.parent())
        .expect("crates/core sits two levels below the workspace root")
        .to_path_buf()
}

fn repo_fixtures() -> FixtureStore {
    FixtureStore::load(&workspace_root().join("fixtures")).expect("load fixtures")
}

fn repo_scenarios() -> ScenarioSet {
    ScenarioSet::load_all(&workspace_root().join("scenarios")).expect("load scenarios")
}

fn registry_for(name: &str) -> RouteRegistry {
    let scenario = repo_scenarios().resolve(name).expect("resolve scenario");
    RouteRegistry::from_specs(
        &scenario.routes,
        &repo_fixtures(),
        scenario.mock_mode.unwrap_or(MockMode::Lenient),
    )
    .expect("build registry")
}

fn fulfilled(dispatch: Dispatch) -> pagewright_core::mock::MockResponse {
    match dispatch {
        Dispatch::Fulfill(response) => response,
        other => panic!("expected a fulfilled response, got {:?}", other),
    }
}

#[test]
fn repo_config_is_valid() {
    let config = HarnessConfig::load(&workspace_root().join("pagewright.toml")).unwrap();
    assert_eq!(config.mock_mode, MockMode::Lenient);
    assert!(config.server.is_some());
    assert!(config.visual.is_some());
    assert!(config.max_parallel >= 1);
}

#[test]
fn repo_fixtures_load_with_expected_kinds() {
    let store = repo_fixtures();

    assert!(matches!(store.get("pricing").unwrap().payload, FixturePayload::Json(_)));
    assert!(matches!(
        store.get("payment_initiate").unwrap().payload,
        FixturePayload::Branch(_)
    ));
    match &store.get("audio/lofi_chill").unwrap().payload {
        FixturePayload::Binary { content_type, bytes } => {
            assert_eq!(content_type, "audio/mpeg");
            assert!(!bytes.is_empty());
        }
        other => panic!("expected binary fixture, got {:?}", other),
    }
}

#[test]
fn every_repo_scenario_resolves_and_builds_routes() {
    let fixtures = repo_fixtures();
    let set = repo_scenarios();
    assert!(set.get("register-and-login").unwrap().fragment);

    let runnable: Vec<String> = set.runnable().map(|s| s.name.clone()).collect();
    assert!(runnable.contains(&"pricing-payment".to_string()));
    assert!(runnable.contains(&"stock-music-preview".to_string()));
    assert!(!runnable.contains(&"register-and-login".to_string()));

    for name in runnable {
        let scenario = set.resolve(&name).unwrap();
        assert!(!scenario.steps.is_empty(), "{} has no steps", name);
        RouteRegistry::from_specs(&scenario.routes, &fixtures, MockMode::Strict)
            .unwrap_or_else(|e| panic!("{}: {}", name, e));
    }
}

#[test]
fn stock_scenarios_start_with_the_login_fragment() {
    let set = repo_scenarios();
    let fragment_len = set.get("register-and-login").unwrap().steps.len();
    let preview = set.resolve("stock-music-preview").unwrap();

    assert_eq!(
        preview.steps[..fragment_len].to_vec(),
        set.get("register-and-login").unwrap().steps
    );
}

#[test]
fn payment_route_branches_on_amount() {
    let registry = registry_for("pricing-payment");
    let url = "http://127.0.0.1:8000/api/payment/initiate";

    let ok = fulfilled(
        registry
            .dispatch(&InterceptedRequest::new("POST", url).with_json(&json!({"amount": 49900})))
            .unwrap(),
    );
    assert_eq!(ok.status, 200);
    let body: serde_json::Value = serde_json::from_slice(&ok.body).unwrap();
    assert!(body["redirectUrl"]
        .as_str()
        .unwrap()
        .starts_with("https://sandbox.phonepe.com/pay"));

    let rejected = fulfilled(
        registry
            .dispatch(&InterceptedRequest::new("POST", url).with_json(&json!({"amount": 499})))
            .unwrap(),
    );
    assert_eq!(rejected.status, 400);
}

#[test]
fn strict_pricing_scenario_rejects_unrouted_requests() {
    let registry = registry_for("pricing-payment");
    let err = registry
        .dispatch(&InterceptedRequest::new("GET", "https://cdn.example.com/analytics.js"))
        .unwrap_err();

    assert!(matches!(err, HarnessError::MockMismatch { .. }));
    assert_eq!(registry.take_mismatches().len(), 1);
}

#[test]
fn preview_route_serves_audio_for_stock_keys() {
    let registry = registry_for("stock-music-preview");
    let request = InterceptedRequest::new(
        "GET",
        "http://localhost:8080/api/stock-music/preview?key=stock/lofi_chill.mp3",
    );

    let response = registry.lookup(&request).expect("preview is mocked");
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("audio/mpeg"));

    let listing = registry
        .lookup(&InterceptedRequest::new("GET", "http://localhost:8080/api/stock-music"))
        .expect("listing is mocked");
    let body: serde_json::Value = serde_json::from_slice(&listing.body).unwrap();
    assert_eq!(body["data"][0]["name"], "Lofi Chill");
}

#[test]
fn fixture_names_must_be_unique() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("pricing.json"), "{}").unwrap();
    fs::write(dir.path().join("pricing.png"), [0x89, b'P', b'N', b'G']).unwrap();

    let err = FixtureStore::load(dir.path()).unwrap_err();
    assert!(matches!(err, HarnessError::FixtureLoad { .. }));
    assert!(err.to_string().contains("pricing"));
}

#[test]
fn malformed_fixture_names_the_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("user_info.json"), "{ not json").unwrap();

    match FixtureStore::load(dir.path()).unwrap_err() {
        HarnessError::FixtureLoad { path, .. } => assert!(path.ends_with("user_info.json")),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn missing_fixture_dir_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(FixtureStore::load(&dir.path().join("absent")).is_err());
}

#[test]
fn route_to_unknown_fixture_fails_at_build() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("orphan.yaml"),
        r#"
name: orphan
routes:
  - pattern: "**/api/pricing"
    fixture: no_such_fixture
steps: []
"#,
    )
    .unwrap();
    let scenario = ScenarioSet::load_all(dir.path())
        .unwrap()
        .resolve("orphan")
        .unwrap();

    let err = RouteRegistry::from_specs(&scenario.routes, &FixtureStore::empty(), MockMode::Lenient)
        .unwrap_err();
    assert!(matches!(err, HarnessError::UnknownFixture(name) if name == "no_such_fixture"));
}

#[test]
fn bad_yaml_and_duplicate_names_are_rejected() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("broken.yaml"), "name: [unclosed\n").unwrap();
    let err = ScenarioSet::load_all(dir.path()).unwrap_err();
    assert!(err.to_string().contains("broken.yaml"));

    let dir = TempDir::new().unwrap();
    let body = "name: same\nsteps: []\n";
    fs::write(dir.path().join("a.yaml"), body).unwrap();
    fs::write(dir.path().join("b.yml"), body).unwrap();
    let err = ScenarioSet::load_all(dir.path()).unwrap_err();
    assert!(err.to_string().contains("duplicate scenario name"));
}

#[test]
fn include_cycle_across_files_is_reported() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("a.yaml"),
        "name: a\nsteps:\n  - action: include\n    scenario: b\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("b.yaml"),
        "name: b\nfragment: true\nsteps:\n  - action: include\n    scenario: a\n",
    )
    .unwrap();

    let set = ScenarioSet::load_all(dir.path()).unwrap();
    let err = set.select(&[], None).unwrap_err();
    assert!(err.to_string().contains("include cycle"));
}
