use std::fs;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use pagewright_core::config::SessionConfig;
use pagewright_core::fixture::Fixture;
use pagewright_core::{
    FixtureStore, PlaywrightLauncher, RunOptions, Scenario, ScenarioRunner, ScenarioStatus,
};

fn in_path(bin: &str) -> bool {
    Command::new("sh")
        .arg("-lc")
        .arg(format!("command -v {bin} >/dev/null 2>&1"))
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn playwright_installed() -> bool {
    Command::new("node")
        .arg("-e")
        .arg("require('playwright')")
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

const PAGE: &str = r#"<!doctype html>
<html>
<body>
  <section id="musicUploadSection">Upload</section>
  <section id="musicStockSection" class="hidden" style="display:none">
    <select id="stockMusicSelect"><option value="">Choose</option></select>
    <audio id="audioPreview"></audio>
  </section>
  <button id="btnMusicStock">Stock Library</button>
  <script>
    fetch('/api/stock-music').then(r => r.json()).then(list => {
      const select = document.getElementById('stockMusicSelect');
      for (const item of list.data) select.add(new Option(item.name, item.key));
    });
    document.getElementById('btnMusicStock').addEventListener('click', () => {
      document.getElementById('musicUploadSection').style.display = 'none';
      document.getElementById('musicStockSection').style.display = '';
    });
    document.getElementById('stockMusicSelect').addEventListener('change', e => {
      document.getElementById('audioPreview').src =
        '/api/stock-music/preview?key=' + encodeURIComponent(e.target.value);
    });
  </script>
</body>
</html>
"#;

/// Real Browser Smoke Test
///
/// Serves a small page through the route table and drives it through
/// Chromium: toggle, select, attribute check and a resource probe.
///
/// Marked ignored because it needs Node.js with the `playwright` package
/// and an installed Chromium.
#[tokio::test]
#[ignore]
async fn stock_music_page_in_real_browser() {
    if !in_path("node") || !playwright_installed() {
        eprintln!("Skipping: node with playwright not available");
        return;
    }

    let site = TempDir::new().expect("create site dir");
    fs::write(site.path().join("index.html"), PAGE).expect("write page");
    let output = TempDir::new().expect("create output dir");

    let fixtures = FixtureStore::from_fixtures([
        Fixture::json(
            "stock_music",
            json!({"data": [{"name": "Lofi Chill", "key": "stock/lofi_chill.mp3"}]}),
        ),
        Fixture::binary("audio/lofi_chill", "audio/mpeg", b"ID3\x03".to_vec()),
    ])
    .expect("build fixtures");

    let scenario = Scenario::from_yaml(&format!(
        r##"
name: stock-music-browser
mock_mode: strict
routes:
  - pattern: "**/api/stock-music"
    fixture: stock_music
  - pattern: "**/api/stock-music/preview**"
    fixture: audio/lofi_chill
  - pattern: "http://pagewright.test/**"
    static_dir: "{site}"
steps:
  - action: navigate
    url: /index.html
  - action: assert
    condition: {{check: exactly_one_visible, selectors: ["#musicUploadSection", "#musicStockSection"]}}
  - action: click
    selector: "#btnMusicStock"
  - action: assert
    condition: {{check: visible, selector: "#musicStockSection"}}
  - action: wait_for
    expression: "document.getElementById('stockMusicSelect').options.length > 1"
  - action: select
    selector: "#stockMusicSelect"
    label: Lofi Chill
  - action: assert
    condition: {{check: attribute_contains, selector: "#audioPreview", attribute: src, contains: [api/stock-music/preview, key=stock]}}
  - action: assert
    condition:
      check: resource
      from_attribute: {{selector: "#audioPreview", attribute: src}}
      status: 200
      content_type: audio/mpeg
  - action: screenshot
    name: stock-section
"##,
        site = site.path().display()
    ))
    .expect("parse scenario");

    let session = SessionConfig {
        base_url: "http://pagewright.test".to_string(),
        ..SessionConfig::default()
    };
    let options = RunOptions {
        step_timeout: Duration::from_secs(10),
        output_dir: output.path().to_path_buf(),
        ..RunOptions::default()
    };
    let runner = ScenarioRunner::new(
        PlaywrightLauncher::new(session, None),
        Arc::new(fixtures),
        options,
    )
    .expect("build runner");

    let report = runner.run(&scenario).await.expect("session starts");
    assert_eq!(
        report.status,
        ScenarioStatus::Completed,
        "steps: {:#?}",
        report.steps
    );
    assert!(output
        .path()
        .join("stock-music-browser")
        .read_dir()
        .map(|mut d| d.next().is_some())
        .unwrap_or(false));
}
