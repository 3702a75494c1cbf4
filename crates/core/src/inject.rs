//! State injection: force in-page state the mocked network cannot reach
//!
//! A [`Mutation`] compiles to one synchronous evaluation. The injector does
//! not wait for rendering; follow it with an assertion when the page needs
//! to react.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};
use crate::page::PageDriver;

/// Explicit description of which view is active
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    /// View name, e.g. `stream` for `#view-stream`
    pub view: String,
    #[serde(default = "default_view_prefix")]
    pub view_prefix: String,
    /// `window` variables set before the switch (dotted paths allowed)
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Selectors revealed after the switch
    #[serde(default)]
    pub reveal: Vec<String>,
}

fn default_view_prefix() -> String {
    "view-".to_string()
}

impl ViewState {
    pub fn new(view: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            view_prefix: default_view_prefix(),
            variables: BTreeMap::new(),
            reveal: Vec::new(),
        }
    }

    pub fn element_id(&self) -> String {
        format!("{}{}", self.view_prefix, self.view)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    /// Make matches visible (drop `hidden` class/attribute, undo `display: none`)
    Reveal { selector: String },
    /// Add the `hidden` class to matches
    Hide { selector: String },
    AddClass { selector: String, class: String },
    RemoveClass { selector: String, class: String },
    SetVariable { name: String, value: Value },
    View(ViewState),
    Script { source: String },
}

impl Mutation {
    /// Selector a zero-match result should be reported against
    fn target(&self) -> Option<String> {
        match self {
            Mutation::Reveal { selector }
            | Mutation::Hide { selector }
            | Mutation::AddClass { selector, .. }
            | Mutation::RemoveClass { selector, .. } => Some(selector.clone()),
            Mutation::View(view) => Some(format!("#{}", view.element_id())),
            Mutation::SetVariable { .. } | Mutation::Script { .. } => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Mutation::Reveal { selector } => format!("reveal {}", selector),
            Mutation::Hide { selector } => format!("hide {}", selector),
            Mutation::AddClass { selector, class } => format!("add .{} to {}", class, selector),
            Mutation::RemoveClass { selector, class } => {
                format!("remove .{} from {}", class, selector)
            }
            Mutation::SetVariable { name, .. } => format!("set window.{}", name),
            Mutation::View(view) => format!("activate view '{}'", view.view),
            Mutation::Script { .. } => "run script".to_string(),
        }
    }
}

/// Result of one injection
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Injection {
    pub affected: usize,
    /// Selector that matched nothing, if any
    #[serde(default)]
    pub missing: Option<String>,
    /// Return value of a `script` mutation
    #[serde(default)]
    pub value: Option<Value>,
}

const PRELUDE: &str = r#"/*pagewright:inject*/(function (m) {
  const all = (sel) => Array.from(document.querySelectorAll(sel));
  const setPath = (path, value) => {
    const parts = path.split('.');
    let target = window;
    for (const part of parts.slice(0, -1)) {
      if (target[part] === undefined || target[part] === null) target[part] = {};
      target = target[part];
    }
    target[parts[parts.length - 1]] = value;
  };
  const reveal = (el) => {
    el.classList.remove('hidden');
    el.removeAttribute('hidden');
    if (el.style.display === 'none') el.style.display = '';
    if (getComputedStyle(el).display === 'none') el.style.display = 'block';
  };
  const each = (sel, fn) => {
    const els = all(sel);
    els.forEach(fn);
    return els.length ? { affected: els.length } : { affected: 0, missing: sel };
  };
  switch (m.kind) {
    case 'reveal': return each(m.selector, reveal);
    case 'hide': return each(m.selector, (el) => el.classList.add('hidden'));
    case 'add_class': return each(m.selector, (el) => el.classList.add(m.class));
    case 'remove_class': return each(m.selector, (el) => el.classList.remove(m.class));
    case 'set_variable': setPath(m.name, m.value); return { affected: 1 };
    case 'view': {
      Object.entries(m.variables || {}).forEach(([k, v]) => setPath(k, v));
      const id = m.view_prefix + m.view;
      let affected = 0;
      if (typeof window.switchView === 'function') {
        window.switchView(m.view);
        affected = document.getElementById(id) ? 1 : 0;
      } else {
        const views = all('[id^="' + m.view_prefix + '"]');
        views.forEach((el) => el.classList.toggle('hidden', el.id !== id));
        affected = views.filter((el) => el.id === id).length;
      }
      if (!affected) return { affected: 0, missing: '#' + id };
      for (const sel of m.reveal || []) {
        const r = each(sel, reveal);
        if (!r.affected) return r;
        affected += r.affected;
      }
      return { affected };
    }
    case 'script': {
      const value = (0, eval)(m.source);
      return { affected: 0, value: value === undefined ? null : value };
    }
  }
  throw new Error('unknown mutation ' + m.kind);
})("#;

/// Compile a mutation into a single evaluable expression
pub fn compile(mutation: &Mutation) -> HarnessResult<String> {
    let args = serde_json::to_string(mutation)?;
    Ok(format!("{}{})", PRELUDE, args))
}

/// Recover the mutation from a compiled expression. Lets in-memory pages
/// apply injections without a JavaScript engine.
pub fn decode(expression: &str) -> Option<Mutation> {
    let args = expression.strip_prefix(PRELUDE)?.strip_suffix(')')?;
    serde_json::from_str(args).ok()
}

/// Applies mutations to a page
#[derive(Debug, Clone, Copy, Default)]
pub struct StateInjector;

impl StateInjector {
    pub async fn apply(&self, page: &dyn PageDriver, mutation: &Mutation) -> HarnessResult<Injection> {
        debug!("Injecting state: {}", mutation.describe());
        let raw = page.evaluate(&compile(mutation)?).await?;
        let injection: Injection = serde_json::from_value(raw).map_err(|e| {
            HarnessError::Evaluation(format!("unexpected injection result: {}", e))
        })?;

        if let Some(missing) = &injection.missing {
            return Err(HarnessError::TargetNotFound {
                target: missing.clone(),
                reason: format!("{} matched no elements", mutation.describe()),
            });
        }
        if injection.affected == 0 {
            if let Some(target) = mutation.target() {
                return Err(HarnessError::TargetNotFound {
                    target,
                    reason: format!("{} matched no elements", mutation.describe()),
                });
            }
        }
        Ok(injection)
    }
}
