//! State store implementations
//!
//! `JsonFileStore` keeps the record as a pretty-printed JSON object on disk.
//! `MemoryStore` is the in-process variant used by the unit tests.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Store Trait
// ─────────────────────────────────────────────────────────────────

/// Durable key/value store for connection facts
pub trait StateStore: Send {
    /// Read a value, `None` when absent
    fn get(&self, key: &str) -> Option<String>;

    /// Persist a value; durable once this returns `Ok`
    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    /// Delete a value; absent keys are not an error
    fn remove(&mut self, key: &str) -> Result<()>;

    /// Copy of the whole record, sorted by key
    fn snapshot(&self) -> BTreeMap<String, String>;

    /// Read a value or fall back to `fallback`
    fn get_or(&self, key: &str, fallback: &str) -> String {
        self.get(key).unwrap_or_else(|| fallback.to_string())
    }
}

/// Render a stored JSON value as the string the store hands out
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────
// JSON File Store
// ─────────────────────────────────────────────────────────────────

/// File-backed store holding one flat JSON object
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    record: Map<String, Value>,
}

impl JsonFileStore {
    /// Open the store at `path`.
    ///
    /// A missing file yields an empty record. A file that is not a JSON
    /// object is logged and treated as empty; the next write replaces it.
    /// Only real IO failures (permissions, unreadable device) are errors.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let record = match fs::read_to_string(&path) {
            Ok(content) => match parse_record(&path, &content) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable state file");
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file yet, starting empty");
                Map::new()
            }
            Err(e) => {
                return Err(Error::IoRead { path, source: e });
            }
        };

        Ok(Self { path, record })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the record through a temp file so a crash never leaves a torn file
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let content = serde_json::to_string_pretty(&self.record)?;
        let tmp_path = self.path.with_extension("json.tmp");

        let write_tmp = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };

        write_tmp().map_err(|e| Error::IoWrite {
            path: self.path.clone(),
            source: e,
        })
    }
}

fn parse_record(path: &Path, content: &str) -> Result<Map<String, Value>> {
    if content.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::StateCorrupt {
            path: path.to_path_buf(),
            message: format!("expected a JSON object, found {}", json_kind(&other)),
        }),
        Err(e) => Err(Error::StateCorrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.record.get(key).map(value_to_string)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.record
            .insert(key.to_string(), Value::String(value.to_string()));
        self.save()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.record.remove(key).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.record
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────
// Memory Store
// ─────────────────────────────────────────────────────────────────

/// Non-durable store used by the unit tests
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    record: BTreeMap<String, String>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.record.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.record.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.record.remove(key);
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.record.clone()
    }
}
