// Module: Cache
// Memoization for callonce (feature scope), callSingle (suite scope, with
// optional disk TTL) and setupOnce (feature scope).
//
// Per-key slots give double-checked semantics: the shared map is locked only
// to fetch the slot, and the slot's own lock is held while the body runs, so
// concurrent callers of the same key serialize while other keys proceed.
// Returned values are deep copies; failures are recorded and re-raised with
// the original message on every subsequent read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{EngineError, Result};

type CachedOutcome = std::result::Result<Value, String>;
type Slot = Arc<Mutex<Option<CachedOutcome>>>;

#[derive(Default)]
pub struct CallCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl CallCache {
    /// Runs `compute` at most once per key. Every caller gets a deep copy of
    /// the cached value, or the original failure message re-raised.
    pub fn get_or_compute<F>(&self, key: &str, compute: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        let slot = {
            let mut slots = self.slots.lock();
            slots.entry(key.to_string()).or_default().clone()
        };
        let mut guard = slot.lock();
        if let Some(outcome) = guard.as_ref() {
            debug!(key = %key, "cache hit");
            return replay(outcome);
        }
        match compute() {
            Ok(value) => {
                *guard = Some(Ok(value.clone()));
                Ok(value)
            }
            Err(err) => {
                *guard = Some(Err(err.to_string()));
                Err(err)
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let slots = self.slots.lock();
        slots
            .get(key)
            .map(|slot| slot.lock().is_some())
            .unwrap_or(false)
    }
}

fn replay(outcome: &CachedOutcome) -> Result<Value> {
    match outcome {
        // serde_json::Value clones are deep; mutating the returned value
        // cannot touch the cache
        Ok(value) => Ok(value.clone()),
        Err(message) => Err(EngineError::CallFailed(message.clone())),
    }
}

/// Suite-scoped cache with optional disk persistence. A file is fresh while
/// `now - mtime < minutes`. Only map and list results are persisted; IO
/// failures degrade to in-memory caching with a warning.
#[derive(Default)]
pub struct CallSingleCache {
    inner: CallCache,
}

impl CallSingleCache {
    pub fn get_or_compute<F>(
        &self,
        key: &str,
        cache_minutes: u64,
        cache_dir: &Path,
        compute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        if cache_minutes == 0 {
            return self.inner.get_or_compute(key, compute);
        }
        let key_owned = key.to_string();
        let dir = cache_dir.to_path_buf();
        self.inner.get_or_compute(key, move || {
            if let Some(value) = read_disk(&key_owned, cache_minutes, &dir) {
                return Ok(value);
            }
            let value = compute()?;
            if value.is_object() || value.is_array() {
                write_disk(&key_owned, &dir, &value);
            }
            Ok(value)
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains(key)
    }
}

/// Non-alphanumerics collapse to `_` to keep keys filesystem-safe.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn cache_file(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.txt", sanitize_key(key)))
}

fn read_disk(key: &str, cache_minutes: u64, dir: &Path) -> Option<Value> {
    let path = cache_file(dir, key);
    let meta = std::fs::metadata(&path).ok()?;
    let modified = meta.modified().ok()?;
    let age_millis = SystemTime::now()
        .duration_since(modified)
        .ok()?
        .as_millis() as u64;
    if age_millis >= cache_minutes.saturating_mul(60_000) {
        debug!(path = %path.display(), "disk cache entry is stale");
        return None;
    }
    match std::fs::read_to_string(&path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable disk cache entry");
                None
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "disk cache read failed");
            None
        }
    }
}

fn write_disk(key: &str, dir: &Path, value: &Value) {
    let path = cache_file(dir, key);
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), error = %e, "disk cache dir creation failed");
        return;
    }
    let text = match serde_json::to_string_pretty(value) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "disk cache serialization failed");
            return;
        }
    };
    if let Err(e) = std::fs::write(&path, text) {
        warn!(path = %path.display(), error = %e, "disk cache write failed");
    }
}
