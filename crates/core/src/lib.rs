//! Pagewright browser verification harness
//!
//! This crate drives a real browser through declarative scenarios and
//! reports what the user would have seen:
//! - Serves canned API responses from a fixture store through one route table
//! - Controls Playwright via a line-delimited JSON protocol over stdio
//! - Forces hard-to-reach page states through explicit state injection
//! - Captures screenshots and logs as evidence for every failure
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Scenario Runner (Rust)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScenarioRunner<P: SessionProvider>                         │
//! │    ├── run(scenario) -> RunReport                           │
//! │    ├── run_all(scenarios) -> SuiteReport                    │
//! │    └── with_session(...)   open → steps → close, once       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Session (PlaywrightLauncher)                               │
//! │    ├── AuxServer          optional app server + health      │
//! │    └── DriverBridge       node driver.js  ◄── route events  │
//! │                                │                            │
//! │                          RouteRegistry ◄── FixtureStore     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Scenario (YAML)                                            │
//! │    ├── routes: [pattern → fixture | body | branch | dir]    │
//! │    └── steps:  navigate | fill | click | select | wait_for  │
//! │                evaluate | inject | assert | screenshot      │
//! │                include                                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  EvidenceCollector → <output>/<scenario>/*.png|*.log        │
//! │  VisualComparator  → baselines + diff images                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bridge;
pub mod condition;
pub mod config;
pub mod error;
pub mod evidence;
pub mod fixture;
pub mod inject;
pub mod mock;
pub mod page;
pub mod poll;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod server;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod visual;

pub use config::{HarnessConfig, MockMode};
pub use error::{FailureKind, HarnessError, HarnessResult};
pub use fixture::FixtureStore;
pub use mock::RouteRegistry;
pub use report::{RunReport, ScenarioStatus, StepStatus, SuiteReport};
pub use runner::{RunOptions, ScenarioRunner};
pub use scenario::{Scenario, ScenarioSet, Step, StepSpec};
pub use session::{PlaywrightLauncher, SessionProvider};
