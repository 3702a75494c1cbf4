//! Route mock registry
//!
//! One ordered table of routes and one dispatch function. For any request
//! the earliest registered matching route answers; duplicate and
//! overlapping patterns are legal and resolved by that order alone.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::MockMode;
use crate::error::{HarnessError, HarnessResult};
use crate::fixture::{content_type_for, FixturePayload, FixtureStore};

/// URL matcher: a glob (`**` any text, `*` any text except `/`) or a raw
/// regex when written with a `re:` prefix. Matches the full URL.
#[derive(Clone)]
pub struct UrlPattern {
    source: String,
    regex: Regex,
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> HarnessResult<Self> {
        let expr = match pattern.strip_prefix("re:") {
            Some(raw) => raw.to_string(),
            None => glob_to_regex(pattern),
        };
        let regex = Regex::new(&expr).map_err(|e| {
            HarnessError::Config(format!("invalid URL pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UrlPattern").field(&self.source).finish()
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// A request intercepted from the page (or issued by a resource probe)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterceptedRequest {
    pub method: String,
    pub url: String,
    /// Header names are lowercase
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl InterceptedRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_json(mut self, body: &Value) -> Self {
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        self.body = Some(body.to_string().into_bytes());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json_body(&self) -> Option<Value> {
        self.body
            .as_deref()
            .and_then(|b| serde_json::from_slice(b).ok())
    }

    /// First value of a query parameter, percent-decoded
    pub fn query_param(&self, name: &str) -> Option<String> {
        let url = reqwest::Url::parse("http://localhost/")
            .and_then(|base| base.join(&self.url))
            .ok()?;
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Path component of the URL, without query or fragment
    pub fn path(&self) -> &str {
        let rest = match self.url.split_once("://") {
            Some((_, rest)) => rest,
            None => self.url.as_str(),
        };
        let path = match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "/",
        };
        let end = path.find(['?', '#']).unwrap_or(path.len());
        &path[..end]
    }
}

/// A literal response served instead of the network
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self::bytes(status, "application/json", body.to_string().into_bytes())
    }

    pub fn bytes(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

/// Pure request handler used by conditional responders
pub type Handler = Arc<dyn Fn(&InterceptedRequest) -> MockResponse + Send + Sync>;

/// How a matched route answers
#[derive(Clone)]
pub enum Responder {
    Literal(MockResponse),
    /// Inspects the request and branches. Must be a pure function of the
    /// request: the page may issue several dispatches concurrently.
    Conditional(Handler),
    /// Serve files below a directory by URL path; missing files pass through
    StaticDir(PathBuf),
    PassThrough,
}

impl Responder {
    pub fn conditional<F>(f: F) -> Self
    where
        F: Fn(&InterceptedRequest) -> MockResponse + Send + Sync + 'static,
    {
        Responder::Conditional(Arc::new(f))
    }

    pub fn branch(rule: BranchRule) -> Self {
        Responder::conditional(move |request| rule.respond(request))
    }

    fn respond(&self, request: &InterceptedRequest) -> Option<MockResponse> {
        match self {
            Responder::Literal(response) => Some(response.clone()),
            Responder::Conditional(handler) => Some(handler(request)),
            Responder::StaticDir(root) => serve_file(root, request.path()),
            Responder::PassThrough => None,
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Responder::Literal(r) => f.debug_tuple("Literal").field(&r.status).finish(),
            Responder::Conditional(_) => f.write_str("Conditional(..)"),
            Responder::StaticDir(root) => f.debug_tuple("StaticDir").field(root).finish(),
            Responder::PassThrough => f.write_str("PassThrough"),
        }
    }
}

fn serve_file(root: &Path, url_path: &str) -> Option<MockResponse> {
    let relative = Path::new(url_path.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    let mut path = root.join(relative);
    if path.is_dir() {
        path = path.join("index.html");
    } else if path.extension().is_none() && !path.exists() {
        path.set_extension("html");
    }
    match std::fs::read(&path) {
        Ok(bytes) => Some(MockResponse::bytes(200, content_type_for(&path), bytes)),
        Err(e) => {
            debug!("Static file {} unavailable ({}), passing through", path.display(), e);
            None
        }
    }
}

/// Where a branch rule looks on the request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRef {
    /// JSON pointer into the request body, e.g. `/amount`
    Json(String),
    Header(String),
    Query(String),
}

impl FieldRef {
    fn extract(&self, request: &InterceptedRequest) -> Option<Value> {
        match self {
            FieldRef::Json(pointer) => request
                .json_body()
                .and_then(|body| body.pointer(pointer).cloned()),
            FieldRef::Header(name) => request.header(name).map(|v| Value::String(v.to_string())),
            FieldRef::Query(name) => request.query_param(name).map(Value::String),
        }
    }
}

/// Declarative response description used in branch rules and routes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSpec {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_status() -> u16 {
    200
}

impl ResponseSpec {
    pub fn to_response(&self) -> MockResponse {
        let mut response = match &self.body {
            Some(Value::String(text)) => {
                MockResponse::bytes(self.status, "text/plain", text.clone().into_bytes())
            }
            Some(body) => MockResponse::json(self.status, body),
            None => MockResponse::empty(self.status),
        };
        for (name, value) in &self.headers {
            response
                .headers
                .insert(name.to_ascii_lowercase(), value.clone());
        }
        response
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCase {
    pub equals: Value,
    #[serde(flatten)]
    pub response: ResponseSpec,
}

/// Conditional fixture: inspect one request field, answer per exact match,
/// fall back to `otherwise`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRule {
    pub inspect: FieldRef,
    #[serde(default)]
    pub cases: Vec<BranchCase>,
    pub otherwise: ResponseSpec,
}

impl BranchRule {
    pub fn respond(&self, request: &InterceptedRequest) -> MockResponse {
        let observed = self.inspect.extract(request);
        let case = observed
            .as_ref()
            .and_then(|value| self.cases.iter().find(|c| values_equal(&c.equals, value)));
        match case {
            Some(case) => case.response.to_response(),
            None => self.otherwise.to_response(),
        }
    }
}

/// Exact equality, except that numbers compare by value (`49900` == `49900.0`).
pub(crate) fn values_equal(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => expected == actual,
    }
}

/// A registered route
#[derive(Debug, Clone)]
pub struct MockRoute {
    pub pattern: UrlPattern,
    /// Uppercase HTTP method filter
    pub method: Option<String>,
    pub responder: Responder,
    pub order: usize,
}

impl MockRoute {
    pub fn matches(&self, request: &InterceptedRequest) -> bool {
        if let Some(method) = &self.method {
            if !method.eq_ignore_ascii_case(&request.method) {
                return false;
            }
        }
        self.pattern.matches(&request.url)
    }
}

/// Route as written in a scenario file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub pattern: String,
    #[serde(default)]
    pub method: Option<String>,
    /// Name of a fixture to serve
    #[serde(default)]
    pub fixture: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Inline JSON body (strings are served as text/plain)
    #[serde(default)]
    pub body: Option<Value>,
    /// Serve files from this directory
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
    #[serde(default)]
    pub pass_through: bool,
}

impl RouteSpec {
    /// Resolve the route against the fixture store
    pub fn build(&self, fixtures: &FixtureStore, order: usize) -> HarnessResult<MockRoute> {
        let kinds = [
            self.fixture.is_some(),
            self.body.is_some() || (self.status.is_some() && self.fixture.is_none()),
            self.static_dir.is_some(),
            self.pass_through,
        ];
        if kinds.iter().filter(|k| **k).count() != 1 {
            return Err(HarnessError::Scenario(format!(
                "route '{}' must declare exactly one of fixture, body/status, static_dir, pass_through",
                self.pattern
            )));
        }

        let responder = if let Some(name) = &self.fixture {
            let fixture = fixtures.get(name)?;
            let status = self.status.unwrap_or(200);
            match &fixture.payload {
                FixturePayload::Json(value) => {
                    Responder::Literal(self.with_headers(MockResponse::json(status, value)))
                }
                FixturePayload::Binary {
                    content_type,
                    bytes,
                } => Responder::Literal(self.with_headers(MockResponse::bytes(
                    status,
                    content_type,
                    bytes.clone(),
                ))),
                FixturePayload::Branch(rule) => Responder::branch(rule.clone()),
            }
        } else if let Some(root) = &self.static_dir {
            Responder::StaticDir(root.clone())
        } else if self.pass_through {
            Responder::PassThrough
        } else {
            let spec = ResponseSpec {
                status: self.status.unwrap_or(200),
                headers: self.headers.clone(),
                body: self.body.clone(),
            };
            Responder::Literal(spec.to_response())
        };

        Ok(MockRoute {
            pattern: UrlPattern::parse(&self.pattern)?,
            method: self.method.as_ref().map(|m| m.to_ascii_uppercase()),
            responder,
            order,
        })
    }

    fn with_headers(&self, mut response: MockResponse) -> MockResponse {
        for (name, value) in &self.headers {
            response
                .headers
                .insert(name.to_ascii_lowercase(), value.clone());
        }
        response
    }
}

/// Result of dispatching one request
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Fulfill(MockResponse),
    PassThrough,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Fulfilled { status: u16 },
    PassedThrough,
    Rejected,
}

/// Log entry for one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub sequence: u64,
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_body: Option<Value>,
    /// Registration index of the route that answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<usize>,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

#[derive(Default)]
struct DispatchLog {
    records: Vec<DispatchRecord>,
    unreported_mismatches: Vec<DispatchRecord>,
}

/// Ordered route table plus the per-run dispatch log
pub struct RouteRegistry {
    routes: Vec<MockRoute>,
    mode: MockMode,
    log: Mutex<DispatchLog>,
}

impl RouteRegistry {
    pub fn new(mode: MockMode) -> Self {
        Self {
            routes: Vec::new(),
            mode,
            log: Mutex::new(DispatchLog::default()),
        }
    }

    /// Build a registry from scenario routes, in declaration order
    pub fn from_specs(
        specs: &[RouteSpec],
        fixtures: &FixtureStore,
        mode: MockMode,
    ) -> HarnessResult<Self> {
        let mut registry = Self::new(mode);
        for spec in specs {
            let route = spec.build(fixtures, registry.routes.len())?;
            registry.routes.push(route);
        }
        Ok(registry)
    }

    pub fn register(&mut self, pattern: &str, responder: Responder) -> HarnessResult<usize> {
        let order = self.routes.len();
        self.routes.push(MockRoute {
            pattern: UrlPattern::parse(pattern)?,
            method: None,
            responder,
            order,
        });
        Ok(order)
    }

    pub fn register_route(&mut self, mut route: MockRoute) -> usize {
        route.order = self.routes.len();
        let order = route.order;
        self.routes.push(route);
        order
    }

    pub fn mode(&self) -> MockMode {
        self.mode
    }

    pub fn routes(&self) -> &[MockRoute] {
        &self.routes
    }

    /// Whether the browser needs to intercept requests at all
    pub fn intercepts(&self) -> bool {
        !self.routes.is_empty() || self.mode == MockMode::Strict
    }

    /// Resolve a request against the table and record the outcome
    pub fn dispatch(&self, request: &InterceptedRequest) -> HarnessResult<Dispatch> {
        let matched = self.routes.iter().find(|route| route.matches(request));

        let (result, outcome) = match matched {
            Some(route) => match route.responder.respond(request) {
                Some(response) => {
                    let status = response.status;
                    (Ok(Dispatch::Fulfill(response)), DispatchOutcome::Fulfilled { status })
                }
                None => (Ok(Dispatch::PassThrough), DispatchOutcome::PassedThrough),
            },
            None if self.mode == MockMode::Strict => (
                Err(HarnessError::MockMismatch {
                    method: request.method.clone(),
                    url: request.url.clone(),
                }),
                DispatchOutcome::Rejected,
            ),
            None => (Ok(Dispatch::PassThrough), DispatchOutcome::PassedThrough),
        };

        let mut log = self.log.lock();
        let record = DispatchRecord {
            sequence: log.records.len() as u64,
            method: request.method.clone(),
            url: request.url.clone(),
            json_body: request.json_body(),
            route: matched.map(|r| r.order),
            outcome,
        };
        debug!(
            "dispatch #{} {} {} -> {:?}",
            record.sequence, record.method, record.url, record.outcome
        );
        if record.outcome == DispatchOutcome::Rejected {
            warn!("Strict mode rejected {} {}", record.method, record.url);
            log.unreported_mismatches.push(record.clone());
        }
        log.records.push(record);

        result
    }

    /// Answer a harness-issued probe from the table without logging it.
    /// `None` means the real network should be asked.
    pub fn lookup(&self, request: &InterceptedRequest) -> Option<MockResponse> {
        self.routes
            .iter()
            .find(|route| route.matches(request))
            .and_then(|route| route.responder.respond(request))
    }

    /// Snapshot of every dispatch so far
    pub fn records(&self) -> Vec<DispatchRecord> {
        self.log.lock().records.clone()
    }

    pub fn records_matching(
        &self,
        pattern: &UrlPattern,
        method: Option<&str>,
    ) -> Vec<DispatchRecord> {
        self.log
            .lock()
            .records
            .iter()
            .filter(|r| pattern.matches(&r.url))
            .filter(|r| method.map_or(true, |m| m.eq_ignore_ascii_case(&r.method)))
            .cloned()
            .collect()
    }

    /// Strict-mode rejections not yet surfaced to the runner
    pub fn take_mismatches(&self) -> Vec<DispatchRecord> {
        std::mem::take(&mut self.log.lock().unreported_mismatches)
    }
}

impl fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRegistry")
            .field("mode", &self.mode)
            .field("routes", &self.routes)
            .finish()
    }
}
