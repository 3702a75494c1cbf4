//! Declarative YAML scenarios

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::condition::Condition;
use crate::config::{MockMode, Viewport};
use crate::error::{HarnessError, HarnessResult};
use crate::evidence::sanitize;
use crate::inject::Mutation;
use crate::mock::RouteSpec;
use crate::page::SelectChoice;

/// A named, ordered sequence of steps verifying one user-facing behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique name for this scenario
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Tags for filtering
    #[serde(default)]
    pub tags: Vec<String>,

    /// Overrides the configured base URL
    #[serde(default)]
    pub base_url: Option<String>,

    /// Overrides the configured output root
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    #[serde(default)]
    pub viewport: Option<Viewport>,

    #[serde(default)]
    pub mock_mode: Option<MockMode>,

    /// Only used through `include`, never run standalone
    #[serde(default)]
    pub fragment: bool,

    /// Mock routes, highest priority first
    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    pub steps: Vec<StepSpec>,
}

/// Whether a step failure halts the scenario
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    #[default]
    Required,
    BestEffort,
}

/// A step plus its execution policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(flatten)]
    pub step: Step,

    #[serde(default)]
    pub criticality: Criticality,

    /// Overrides the configured step timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl StepSpec {
    pub fn required(step: Step) -> Self {
        Self {
            step,
            criticality: Criticality::Required,
            timeout_ms: None,
        }
    }

    pub fn best_effort(step: Step) -> Self {
        Self {
            criticality: Criticality::BestEffort,
            ..Self::required(step)
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Navigate to a URL (relative to the base URL)
    Navigate { url: String },

    Fill { selector: String, value: String },

    Click { selector: String },

    /// Pick an option by visible label or by value
    Select {
        selector: String,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        value: Option<String>,
    },

    /// Wait for an element state or a truthy expression
    WaitFor {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        expression: Option<String>,
        #[serde(default)]
        state: WaitState,
    },

    /// Run JavaScript; with `expect`, wait until it returns that value
    Evaluate {
        script: String,
        #[serde(default)]
        expect: Option<Value>,
    },

    Inject { mutation: Mutation },

    Assert {
        condition: Condition,
        #[serde(default)]
        description: Option<String>,
    },

    /// Capture the page, or one element when `target` is set
    Screenshot {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        full_page: bool,
    },

    /// Splice another scenario's steps in place
    Include { scenario: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl Step {
    /// Short label used in logs and reports
    pub fn label(&self) -> String {
        match self {
            Step::Navigate { url } => format!("navigate:{}", url),
            Step::Fill { selector, .. } => format!("fill:{}", selector),
            Step::Click { selector } => format!("click:{}", selector),
            Step::Select { selector, .. } => format!("select:{}", selector),
            Step::WaitFor {
                selector,
                expression,
                ..
            } => match (selector, expression) {
                (Some(sel), _) => format!("wait_for:{}", sel),
                (None, Some(expr)) => format!("wait_for:`{}`", truncate(expr, 40)),
                (None, None) => "wait_for".to_string(),
            },
            Step::Evaluate { script, .. } => format!("evaluate:`{}`", truncate(script, 40)),
            Step::Inject { mutation } => format!("inject:{}", mutation.describe()),
            Step::Assert {
                condition,
                description,
            } => format!(
                "assert:{}",
                description.clone().unwrap_or_else(|| condition.describe())
            ),
            Step::Screenshot { name, target, .. } => format!(
                "screenshot:{}",
                name.as_deref()
                    .or(target.as_deref())
                    .unwrap_or("page")
            ),
            Step::Include { scenario } => format!("include:{}", scenario),
        }
    }

    /// Choice for a `select` step; exactly one of label/value must be set
    pub fn select_choice(label: &Option<String>, value: &Option<String>) -> HarnessResult<SelectChoice> {
        match (label, value) {
            (Some(label), None) => Ok(SelectChoice::Label(label.clone())),
            (None, Some(value)) => Ok(SelectChoice::Value(value.clone())),
            _ => Err(HarnessError::Scenario(
                "select needs exactly one of label or value".to_string(),
            )),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl Scenario {
    /// Parse a scenario from YAML text
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        let scenario: Self = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|e| {
            HarnessError::Scenario(format!("{}: {}", path.display(), e))
        })
    }

    fn validate(&self) -> HarnessResult<()> {
        if self.name.trim().is_empty() {
            return Err(HarnessError::Scenario("scenario name is empty".to_string()));
        }
        for (index, spec) in self.steps.iter().enumerate() {
            let bad = |msg: &str| {
                HarnessError::Scenario(format!("{} step {}: {}", self.name, index, msg))
            };
            match &spec.step {
                Step::Select { label, value, .. } => {
                    Step::select_choice(label, value).map_err(|_| bad("select needs exactly one of label or value"))?;
                }
                Step::WaitFor {
                    selector: None,
                    expression: None,
                    ..
                } => return Err(bad("wait_for needs selector or expression")),
                Step::WaitFor {
                    selector: Some(_),
                    expression: Some(_),
                    ..
                } => return Err(bad("wait_for takes selector or expression, not both")),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Every scenario in a directory, indexed by name
#[derive(Debug, Clone, Default)]
pub struct ScenarioSet {
    scenarios: BTreeMap<String, Scenario>,
}

impl ScenarioSet {
    pub fn new(scenarios: impl IntoIterator<Item = Scenario>) -> HarnessResult<Self> {
        let mut set = Self::default();
        for scenario in scenarios {
            set.insert(scenario)?;
        }
        Ok(set)
    }

    /// Load all scenarios from a directory (`*.yaml` / `*.yml`, recursive)
    pub fn load_all(dir: &Path) -> HarnessResult<Self> {
        if !dir.is_dir() {
            return Err(HarnessError::Scenario(format!(
                "scenario directory {} does not exist",
                dir.display()
            )));
        }

        let mut set = Self::default();
        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            let scenario = Scenario::from_file(entry.path())?;
            debug!("Loaded scenario '{}' from {}", scenario.name, entry.path().display());
            set.insert(scenario)?;
        }
        Ok(set)
    }

    fn insert(&mut self, scenario: Scenario) -> HarnessResult<()> {
        if self.scenarios.contains_key(&scenario.name) {
            return Err(HarnessError::Scenario(format!(
                "duplicate scenario name '{}'",
                scenario.name
            )));
        }
        // Evidence directories are keyed by the sanitized name
        let stem = sanitize(&scenario.name);
        if let Some(other) = self.scenarios.values().find(|s| sanitize(&s.name) == stem) {
            return Err(HarnessError::Scenario(format!(
                "scenarios '{}' and '{}' would share the evidence directory '{}'",
                other.name, scenario.name, stem
            )));
        }
        self.scenarios.insert(scenario.name.clone(), scenario);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.get(name)
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.values()
    }

    /// Scenarios that may run standalone
    pub fn runnable(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.values().filter(|s| !s.fragment)
    }

    /// The named scenario with every `include` expanded in place
    pub fn resolve(&self, name: &str) -> HarnessResult<Scenario> {
        let scenario = self.lookup(name)?;
        let mut stack = vec![name.to_string()];
        let steps = self.expand(&scenario.steps, &mut stack)?;
        Ok(Scenario {
            steps,
            ..scenario.clone()
        })
    }

    /// Resolve scenarios by name, or every runnable one when `names` is
    /// empty, keeping those carrying `tag` when given
    pub fn select(&self, names: &[String], tag: Option<&str>) -> HarnessResult<Vec<Scenario>> {
        let chosen: Vec<&Scenario> = if names.is_empty() {
            self.runnable().collect()
        } else {
            names
                .iter()
                .map(|n| self.lookup(n))
                .collect::<HarnessResult<_>>()?
        };

        chosen
            .into_iter()
            .filter(|s| tag.map_or(true, |t| s.has_tag(t)))
            .map(|s| self.resolve(&s.name))
            .collect()
    }

    fn lookup(&self, name: &str) -> HarnessResult<&Scenario> {
        self.scenarios
            .get(name)
            .ok_or_else(|| HarnessError::Scenario(format!("unknown scenario '{}'", name)))
    }

    fn expand(&self, steps: &[StepSpec], stack: &mut Vec<String>) -> HarnessResult<Vec<StepSpec>> {
        let mut out = Vec::with_capacity(steps.len());
        for spec in steps {
            match &spec.step {
                Step::Include { scenario } => {
                    if stack.contains(scenario) {
                        return Err(HarnessError::Scenario(format!(
                            "include cycle: {} -> {}",
                            stack.join(" -> "),
                            scenario
                        )));
                    }
                    let included = self.lookup(scenario)?;
                    stack.push(scenario.clone());
                    out.extend(self.expand(&included.steps, stack)?);
                    stack.pop();
                }
                _ => out.push(spec.clone()),
            }
        }
        Ok(out)
    }
}
