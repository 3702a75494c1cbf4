//! Fixture store: named, immutable payloads backing mock routes
//!
//! Layout of a fixtures directory:
//!
//! ```text
//! fixtures/
//!   pricing.json                  -> "pricing"            (JSON body)
//!   payment_initiate.branch.json  -> "payment_initiate"   (branch rule)
//!   audio/lofi_chill.mp3          -> "audio/lofi_chill"   (binary, audio/mpeg)
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};
use crate::mock::BranchRule;

const BRANCH_SUFFIX: &str = ".branch.json";

/// Payload of a fixture
#[derive(Debug, Clone, PartialEq)]
pub enum FixturePayload {
    Json(Value),
    Binary { content_type: String, bytes: Vec<u8> },
    Branch(BranchRule),
}

/// A named fixture. Never mutated after loading.
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub name: String,
    pub source: PathBuf,
    pub payload: FixturePayload,
}

impl Fixture {
    pub fn json(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            source: PathBuf::new(),
            payload: FixturePayload::Json(value),
        }
    }

    pub fn binary(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source: PathBuf::new(),
            payload: FixturePayload::Binary {
                content_type: content_type.into(),
                bytes,
            },
        }
    }

    pub fn branch(name: impl Into<String>, rule: BranchRule) -> Self {
        Self {
            name: name.into(),
            source: PathBuf::new(),
            payload: FixturePayload::Branch(rule),
        }
    }
}

/// Read-only collection of fixtures, shared across concurrent runs
#[derive(Debug, Clone, Default)]
pub struct FixtureStore {
    fixtures: BTreeMap<String, Arc<Fixture>>,
}

impl FixtureStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a store from already constructed fixtures. Duplicate names are
    /// rejected the same way [`FixtureStore::load`] rejects them.
    pub fn from_fixtures(fixtures: impl IntoIterator<Item = Fixture>) -> HarnessResult<Self> {
        let mut store = Self::default();
        for fixture in fixtures {
            store.insert(fixture)?;
        }
        Ok(store)
    }

    /// Load every fixture under `dir`
    pub fn load(dir: &Path) -> HarnessResult<Self> {
        if !dir.is_dir() {
            return Err(HarnessError::FixtureLoad {
                path: dir.to_path_buf(),
                reason: "not a readable directory".to_string(),
            });
        }

        let mut store = Self::default();
        let walker = walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

        for entry in walker {
            let entry = entry.map_err(|e| HarnessError::FixtureLoad {
                path: e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf()),
                reason: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let fixture = load_file(dir, entry.path())?;
            debug!("Loaded fixture '{}' from {}", fixture.name, fixture.source.display());
            store.insert(fixture)?;
        }

        Ok(store)
    }

    fn insert(&mut self, fixture: Fixture) -> HarnessResult<()> {
        if let Some(existing) = self.fixtures.get(&fixture.name) {
            return Err(HarnessError::FixtureLoad {
                path: fixture.source.clone(),
                reason: format!(
                    "fixture name '{}' already defined by {}",
                    fixture.name,
                    existing.source.display()
                ),
            });
        }
        self.fixtures.insert(fixture.name.clone(), Arc::new(fixture));
        Ok(())
    }

    pub fn get(&self, name: &str) -> HarnessResult<Arc<Fixture>> {
        self.fixtures
            .get(name)
            .cloned()
            .ok_or_else(|| HarnessError::UnknownFixture(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fixtures.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

fn load_file(root: &Path, path: &Path) -> HarnessResult<Fixture> {
    let load_err = |reason: String| HarnessError::FixtureLoad {
        path: path.to_path_buf(),
        reason,
    };

    let relative = path
        .strip_prefix(root)
        .map_err(|e| load_err(e.to_string()))?
        .to_string_lossy()
        .replace('\\', "/");

    let bytes = std::fs::read(path).map_err(|e| load_err(e.to_string()))?;

    let (name, payload) = if let Some(stem) = relative.strip_suffix(BRANCH_SUFFIX) {
        let rule: BranchRule =
            serde_json::from_slice(&bytes).map_err(|e| load_err(e.to_string()))?;
        (stem.to_string(), FixturePayload::Branch(rule))
    } else if let Some(stem) = relative.strip_suffix(".json") {
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| load_err(e.to_string()))?;
        (stem.to_string(), FixturePayload::Json(value))
    } else {
        let name = match relative.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() && !stem.ends_with('/') => stem.to_string(),
            _ => relative.clone(),
        };
        (
            name,
            FixturePayload::Binary {
                content_type: content_type_for(path).to_string(),
                bytes,
            },
        )
    };

    Ok(Fixture {
        name,
        source: path.to_path_buf(),
        payload,
    })
}

/// Content type inferred from a file extension
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "woff2" => "font/woff2",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}
