//! In-memory page model for exercising the runner without a browser
//!
//! An [`AppModel`] describes a fake application: what each page renders on
//! load, what clicks and input changes do, which expressions evaluate to
//! what. [`ScriptedLauncher`] opens sessions over a fresh [`FakeDom`] built
//! from that model, and counts how often sessions are opened and released.
//!
//! Selectors are matched literally: `#badge` only matches elements stored
//! under `#badge`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{HarnessError, HarnessResult};
use crate::inject::{self, Mutation};
use crate::mock::{Dispatch, InterceptedRequest, MockResponse, RouteRegistry};
use crate::page::{
    ElementState, PageDriver, ProbeRequest, ProbeResponse, ScreenshotTarget, SelectChoice,
};
use crate::session::{ActiveSession, SessionProvider, SessionSpec};

/// Reaction to a page load, click, or input change
pub type Handler = Arc<dyn Fn(&mut FakeDom, &RouteRegistry) + Send + Sync>;
/// Scripted result of an evaluated expression
pub type Evaluator = Arc<dyn Fn(&mut FakeDom) -> HarnessResult<Value> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeElement {
    pub visible: bool,
    pub text: String,
    pub value: String,
    pub attributes: BTreeMap<String, String>,
    pub classes: BTreeSet<String>,
    pub options: Vec<SelectOption>,
}

impl FakeElement {
    pub fn shown(text: impl Into<String>) -> Self {
        Self {
            visible: true,
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn hidden() -> Self {
        Self::default()
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_option(mut self, value: impl Into<String>, label: impl Into<String>) -> Self {
        self.options.push(SelectOption {
            value: value.into(),
            label: label.into(),
        });
        self
    }
}

/// Mutable page state
#[derive(Debug, Default)]
pub struct FakeDom {
    pub url: String,
    pub elements: BTreeMap<String, Vec<FakeElement>>,
    pub variables: BTreeMap<String, Value>,
    pub console: Vec<String>,
}

impl FakeDom {
    /// Replace the matches of `selector` with one element
    pub fn set(&mut self, selector: &str, element: FakeElement) {
        self.elements.insert(selector.to_string(), vec![element]);
    }

    pub fn set_all(&mut self, selector: &str, elements: Vec<FakeElement>) {
        self.elements.insert(selector.to_string(), elements);
    }

    pub fn element(&self, selector: &str) -> Option<&FakeElement> {
        self.elements.get(selector).and_then(|els| els.first())
    }

    pub fn element_mut(&mut self, selector: &str) -> Option<&mut FakeElement> {
        self.elements.get_mut(selector).and_then(|els| els.first_mut())
    }

    pub fn set_visible(&mut self, selector: &str, visible: bool) {
        if let Some(els) = self.elements.get_mut(selector) {
            els.iter_mut().for_each(|el| el.visible = visible);
        }
    }

    pub fn is_visible(&self, selector: &str) -> bool {
        self.elements
            .get(selector)
            .map_or(false, |els| els.iter().any(|el| el.visible))
    }

    /// Issue a request through the registry the way the page's own code
    /// would. Pass-through and rejected requests yield `None`.
    pub fn request(
        &mut self,
        registry: &RouteRegistry,
        method: &str,
        url: &str,
        body: Option<Value>,
    ) -> Option<MockResponse> {
        let mut request = InterceptedRequest::new(method, url);
        if let Some(body) = body {
            request = request.with_json(&body);
        }
        match registry.dispatch(&request) {
            Ok(Dispatch::Fulfill(response)) => Some(response),
            Ok(Dispatch::PassThrough) => None,
            Err(e) => {
                self.console.push(format!("[error] {}", e));
                None
            }
        }
    }

    fn apply(&mut self, mutation: &Mutation) -> Value {
        let each = |dom: &mut FakeDom, selector: &str, f: &dyn Fn(&mut FakeElement)| {
            match dom.elements.get_mut(selector) {
                Some(els) if !els.is_empty() => {
                    els.iter_mut().for_each(|el| f(el));
                    json!({ "affected": els.len() })
                }
                _ => json!({ "affected": 0, "missing": selector }),
            }
        };

        match mutation {
            Mutation::Reveal { selector } => each(self, selector, &|el| {
                el.visible = true;
                el.classes.remove("hidden");
            }),
            Mutation::Hide { selector } => each(self, selector, &|el| {
                el.visible = false;
                el.classes.insert("hidden".to_string());
            }),
            Mutation::AddClass { selector, class } => each(self, selector, &|el| {
                el.classes.insert(class.clone());
                if class == "hidden" {
                    el.visible = false;
                }
            }),
            Mutation::RemoveClass { selector, class } => each(self, selector, &|el| {
                el.classes.remove(class);
                if class == "hidden" {
                    el.visible = true;
                }
            }),
            Mutation::SetVariable { name, value } => {
                self.variables.insert(name.clone(), value.clone());
                json!({ "affected": 1 })
            }
            Mutation::View(view) => {
                for (name, value) in &view.variables {
                    self.variables.insert(name.clone(), value.clone());
                }
                let prefix = format!("#{}", view.view_prefix);
                let target = format!("#{}", view.element_id());
                let mut affected = 0;
                for (selector, els) in self.elements.iter_mut() {
                    if selector.starts_with(&prefix) {
                        let active = *selector == target;
                        els.iter_mut().for_each(|el| el.visible = active);
                        if active {
                            affected += els.len();
                        }
                    }
                }
                if affected == 0 {
                    return json!({ "affected": 0, "missing": target });
                }
                for selector in &view.reveal {
                    let result = each(self, selector, &|el| el.visible = true);
                    if result.get("missing").is_some() {
                        return result;
                    }
                    affected += result["affected"].as_u64().unwrap_or(0) as usize;
                }
                json!({ "affected": affected })
            }
            Mutation::Script { .. } => json!({ "affected": 0, "value": null }),
        }
    }
}

/// Blueprint of a fake application
#[derive(Clone, Default)]
pub struct AppModel {
    pages: BTreeMap<String, Handler>,
    clicks: BTreeMap<String, Handler>,
    changes: BTreeMap<String, Handler>,
    evaluations: BTreeMap<String, Evaluator>,
    resources: BTreeMap<String, ProbeResponse>,
    stalled: BTreeSet<String>,
}

impl AppModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render `path` (URL path without origin or query)
    pub fn page<F>(mut self, path: &str, f: F) -> Self
    where
        F: Fn(&mut FakeDom, &RouteRegistry) + Send + Sync + 'static,
    {
        self.pages.insert(path.to_string(), Arc::new(f));
        self
    }

    pub fn on_click<F>(mut self, selector: &str, f: F) -> Self
    where
        F: Fn(&mut FakeDom, &RouteRegistry) + Send + Sync + 'static,
    {
        self.clicks.insert(selector.to_string(), Arc::new(f));
        self
    }

    /// Runs after `fill` or `select_option` on `selector`
    pub fn on_change<F>(mut self, selector: &str, f: F) -> Self
    where
        F: Fn(&mut FakeDom, &RouteRegistry) + Send + Sync + 'static,
    {
        self.changes.insert(selector.to_string(), Arc::new(f));
        self
    }

    pub fn on_evaluate<F>(mut self, expression: &str, f: F) -> Self
    where
        F: Fn(&mut FakeDom) -> HarnessResult<Value> + Send + Sync + 'static,
    {
        self.evaluations.insert(expression.to_string(), Arc::new(f));
        self
    }

    /// Response for a direct fetch of `url` that the registry does not answer
    pub fn resource(mut self, url: &str, response: ProbeResponse) -> Self {
        self.resources.insert(url.to_string(), response);
        self
    }

    /// Every operation on `selector` (or navigation to this path) hangs
    pub fn stall(mut self, selector: &str) -> Self {
        self.stalled.insert(selector.to_string());
        self
    }
}

fn url_path(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = rest.find('/').map_or("/", |idx| &rest[idx..]);
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}

/// A page over a [`FakeDom`]
pub struct ScriptedPage {
    app: Arc<AppModel>,
    dom: Arc<Mutex<FakeDom>>,
    registry: Arc<RouteRegistry>,
}

impl ScriptedPage {
    pub fn new(app: Arc<AppModel>, registry: Arc<RouteRegistry>) -> Self {
        Self {
            app,
            dom: Arc::new(Mutex::new(FakeDom::default())),
            registry,
        }
    }

    pub fn dom(&self) -> Arc<Mutex<FakeDom>> {
        Arc::clone(&self.dom)
    }

    async fn stall_if(&self, key: &str) {
        if self.app.stalled.contains(key) {
            std::future::pending::<()>().await;
        }
    }

    fn require_visible(&self, dom: &FakeDom, selector: &str) -> HarnessResult<()> {
        match dom.elements.get(selector) {
            Some(els) if els.iter().filter(|el| el.visible).count() == 1 => Ok(()),
            Some(els) if els.iter().any(|el| el.visible) => Err(HarnessError::TargetNotFound {
                target: selector.to_string(),
                reason: "more than one visible match".to_string(),
            }),
            Some(_) => Err(HarnessError::TargetNotFound {
                target: selector.to_string(),
                reason: "not visible".to_string(),
            }),
            None => Err(HarnessError::TargetNotFound {
                target: selector.to_string(),
                reason: "no match".to_string(),
            }),
        }
    }

    fn changed(&self, dom: &mut FakeDom, selector: &str) {
        if let Some(handler) = self.app.changes.get(selector) {
            handler(dom, self.registry.as_ref());
        }
    }
}

#[async_trait]
impl PageDriver for ScriptedPage {
    async fn goto(&self, url: &str, _timeout: Duration) -> HarnessResult<()> {
        let path = url_path(url).to_string();
        self.stall_if(&path).await;
        let handler = self.app.pages.get(&path).cloned().ok_or_else(|| {
            HarnessError::Navigation {
                url: url.to_string(),
                reason: "404 Not Found".to_string(),
            }
        })?;
        let mut dom = self.dom.lock();
        dom.url = url.to_string();
        dom.elements.clear();
        handler(&mut *dom, self.registry.as_ref());
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str, _timeout: Duration) -> HarnessResult<()> {
        self.stall_if(selector).await;
        let mut dom = self.dom.lock();
        self.require_visible(&dom, selector)?;
        if let Some(el) = dom.element_mut(selector) {
            el.value = value.to_string();
        }
        self.changed(&mut dom, selector);
        Ok(())
    }

    async fn click(&self, selector: &str, _timeout: Duration) -> HarnessResult<()> {
        self.stall_if(selector).await;
        let handler = {
            let dom = self.dom.lock();
            self.require_visible(&dom, selector)?;
            self.app.clicks.get(selector).cloned()
        };
        if let Some(handler) = handler {
            handler(&mut *self.dom.lock(), self.registry.as_ref());
        }
        Ok(())
    }

    async fn select_option(
        &self,
        selector: &str,
        choice: &SelectChoice,
        _timeout: Duration,
    ) -> HarnessResult<()> {
        self.stall_if(selector).await;
        let mut dom = self.dom.lock();
        self.require_visible(&dom, selector)?;
        let el = dom.element_mut(selector).ok_or_else(|| HarnessError::TargetNotFound {
            target: selector.to_string(),
            reason: "no match".to_string(),
        })?;
        let option = el
            .options
            .iter()
            .find(|o| match choice {
                SelectChoice::Label(label) => &o.label == label,
                SelectChoice::Value(value) => &o.value == value,
            })
            .cloned()
            .ok_or_else(|| HarnessError::TargetNotFound {
                target: selector.to_string(),
                reason: format!("no option {:?}", choice),
            })?;
        el.value = option.value;
        self.changed(&mut dom, selector);
        Ok(())
    }

    async fn query(&self, selector: &str) -> HarnessResult<ElementState> {
        self.stall_if(selector).await;
        let dom = self.dom.lock();
        let els = dom.elements.get(selector).map(Vec::as_slice).unwrap_or(&[]);
        let first_visible = els.iter().find(|el| el.visible).or(els.first());
        Ok(ElementState {
            count: els.len(),
            visible: els.iter().filter(|el| el.visible).count(),
            text: first_visible.map(|el| el.text.clone()),
        })
    }

    async fn attribute(&self, selector: &str, name: &str) -> HarnessResult<Option<String>> {
        let dom = self.dom.lock();
        Ok(dom
            .element(selector)
            .and_then(|el| el.attributes.get(name).cloned()))
    }

    async fn evaluate(&self, expression: &str) -> HarnessResult<Value> {
        let mut dom = self.dom.lock();
        if let Some(mutation) = inject::decode(expression) {
            return Ok(dom.apply(&mutation));
        }
        match self.app.evaluations.get(expression) {
            Some(evaluator) => evaluator(&mut *dom),
            None => Err(HarnessError::Evaluation(format!(
                "no scripted result for `{}`",
                expression
            ))),
        }
    }

    async fn url(&self) -> HarnessResult<String> {
        Ok(self.dom.lock().url.clone())
    }

    async fn screenshot(&self, target: &ScreenshotTarget, path: &Path) -> HarnessResult<()> {
        let contents = {
            let dom = self.dom.lock();
            format!("{:?} {}", target, dom.url)
        };
        std::fs::write(path, contents)?;
        Ok(())
    }

    async fn fetch(&self, request: &ProbeRequest) -> HarnessResult<ProbeResponse> {
        Ok(self
            .app
            .resources
            .get(&request.url)
            .cloned()
            .unwrap_or(ProbeResponse {
                status: 404,
                ..ProbeResponse::default()
            }))
    }

    async fn console(&self) -> Vec<String> {
        self.dom.lock().console.clone()
    }
}

/// Counters shared by a launcher and its sessions
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub opened: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub released: AtomicUsize,
}

impl SessionCounters {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// Session provider over an [`AppModel`]
#[derive(Clone)]
pub struct ScriptedLauncher {
    app: Arc<AppModel>,
    base_url: String,
    counters: Arc<SessionCounters>,
    fail_start: Option<String>,
}

impl ScriptedLauncher {
    pub fn new(app: AppModel) -> Self {
        Self {
            app: Arc::new(app),
            base_url: "http://app.test".to_string(),
            counters: Arc::new(SessionCounters::default()),
            fail_start: None,
        }
    }

    /// Make every `open` fail with `SessionStart`
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_start: Some(reason.to_string()),
            ..Self::new(AppModel::new())
        }
    }

    pub fn counters(&self) -> Arc<SessionCounters> {
        Arc::clone(&self.counters)
    }
}

#[async_trait]
impl SessionProvider for ScriptedLauncher {
    async fn open(
        &self,
        spec: &SessionSpec,
        registry: Arc<RouteRegistry>,
    ) -> HarnessResult<Box<dyn ActiveSession>> {
        if let Some(reason) = &self.fail_start {
            return Err(HarnessError::SessionStart(reason.clone()));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            app: Arc::clone(&self.app),
            registry,
            base_url: spec.base_url.clone().unwrap_or_else(|| self.base_url.clone()),
            counters: Arc::clone(&self.counters),
            released: AtomicBool::new(false),
        }))
    }
}

struct ScriptedSession {
    app: Arc<AppModel>,
    registry: Arc<RouteRegistry>,
    base_url: String,
    counters: Arc<SessionCounters>,
    released: AtomicBool,
}

#[async_trait]
impl ActiveSession for ScriptedSession {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn new_page(&self) -> HarnessResult<Box<dyn PageDriver>> {
        Ok(Box::new(ScriptedPage::new(
            Arc::clone(&self.app),
            Arc::clone(&self.registry),
        )))
    }

    async fn close(&self) {
        self.counters.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}
