//! Page-level browser operations
//!
//! [`PageDriver`] is the seam between the runner and a browser. The
//! production implementation lives in [`crate::bridge`]; tests use
//! `testing::ScriptedPage`, built with the `testing` feature.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HarnessResult;

/// Snapshot of the elements matched by a selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementState {
    /// Number of attached matches
    pub count: usize,
    /// Number of visible matches
    pub visible: usize,
    /// Text content of the first match
    #[serde(default)]
    pub text: Option<String>,
}

impl ElementState {
    pub fn any_visible(&self) -> bool {
        self.visible > 0
    }
}

/// Option to pick in a `<select>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectChoice {
    Label(String),
    Value(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScreenshotTarget {
    Page { full_page: bool },
    Element { selector: String },
}

/// HTTP request issued from the browser's request context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub method: String,
    pub url: String,
}

impl ProbeRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub status: u16,
    /// Lowercase header names
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl ProbeResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

/// One page in an isolated browser context.
///
/// Operations that wait for an element take an explicit `timeout`; the
/// runner passes its poll interval so every attempt stays short.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str, timeout: Duration) -> HarnessResult<()>;

    async fn fill(&self, selector: &str, value: &str, timeout: Duration) -> HarnessResult<()>;

    async fn click(&self, selector: &str, timeout: Duration) -> HarnessResult<()>;

    async fn select_option(
        &self,
        selector: &str,
        choice: &SelectChoice,
        timeout: Duration,
    ) -> HarnessResult<()>;

    /// Count and visibility of matches; never waits
    async fn query(&self, selector: &str) -> HarnessResult<ElementState>;

    /// Attribute of the first match, `None` when absent
    async fn attribute(&self, selector: &str, name: &str) -> HarnessResult<Option<String>>;

    /// Evaluate a JavaScript expression and return its JSON value
    async fn evaluate(&self, expression: &str) -> HarnessResult<Value>;

    async fn url(&self) -> HarnessResult<String>;

    async fn screenshot(&self, target: &ScreenshotTarget, path: &Path) -> HarnessResult<()>;

    /// Request outside the page, bypassing interception
    async fn fetch(&self, request: &ProbeRequest) -> HarnessResult<ProbeResponse>;

    /// Console and page-error lines collected so far
    async fn console(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Resolve `url` against `base`. Absolute URLs are returned unchanged.
pub fn resolve_url(base: &str, url: &str) -> String {
    if url.contains("://") || base.is_empty() {
        return url.to_string();
    }
    let base = base.trim_end_matches('/');
    if url.starts_with('/') {
        format!("{}{}", base, url)
    } else {
        format!("{}/{}", base, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("http://h:8080", "/pricing.html", "http://h:8080/pricing.html"; "absolute path")]
    #[test_case("http://h:8080/", "login", "http://h:8080/login"; "relative path")]
    #[test_case("http://h:8080", "https://sandbox.phonepe.com/pay", "https://sandbox.phonepe.com/pay"; "absolute url")]
    #[test_case("", "/x", "/x"; "no base")]
    fn test_resolve_url(base: &str, url: &str, expected: &str) {
        assert_eq!(resolve_url(base, url), expected);
    }
}
