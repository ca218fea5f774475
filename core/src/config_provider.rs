// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Holds the gate configuration snapshot behind an atomically replaceable
//! reference.
//!
//! Readers take the `Arc` once per observation and never see a partial
//! update: every change (file reload, reflex override) builds a whole new
//! [`GateConfig`] and swaps the reference. A failed reload keeps the old
//! snapshot in effect.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::SystemTime;

use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::gate::config::GateConfig;
use crate::gate::config::OverridePatch;

pub struct GateConfigProvider {
    path: Option<PathBuf>,
    current: RwLock<Arc<GateConfig>>,
    last_mtime: Mutex<Option<SystemTime>>,
}

impl Default for GateConfigProvider {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}

impl GateConfigProvider {
    /// Provider over an in-memory config with no backing file.
    pub fn new(config: GateConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
            last_mtime: Mutex::new(None),
        }
    }

    /// Load the initial snapshot from disk. Unlike later reloads, a broken
    /// document here is an error: there is no previous snapshot to keep.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = GateConfig::load(&path)?;
        let mtime = file_mtime(&path);
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
            last_mtime: Mutex::new(mtime),
        })
    }

    pub fn snapshot(&self) -> Arc<GateConfig> {
        self.current.read().unwrap().clone()
    }

    /// Reload when the backing file's mtime advanced. Returns `true` when a
    /// new snapshot was installed.
    pub fn reload_if_changed(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let Some(mtime) = file_mtime(path) else {
            warn!(path = %path.display(), "gate config stat failed");
            return false;
        };
        {
            let last = self.last_mtime.lock().unwrap();
            if last.is_some_and(|last| mtime <= last) {
                return false;
            }
        }
        self.force_reload()
    }

    /// Re-read the backing file. Fail-open: a broken document logs a
    /// warning and keeps the current snapshot.
    pub fn force_reload(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        match GateConfig::load(path) {
            Ok(config) => {
                *self.current.write().unwrap() = Arc::new(config);
                *self.last_mtime.lock().unwrap() = file_mtime(path);
                info!(path = %path.display(), "gate config reloaded");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), "gate config reload failed: {e}");
                false
            }
        }
    }

    /// Apply a runtime override patch by whole-value replacement. Returns
    /// `true` when the snapshot actually changed.
    pub fn update_overrides(&self, patch: OverridePatch) -> bool {
        if patch.is_empty() {
            return false;
        }
        let mut current = self.current.write().unwrap();
        match current.apply_override_patch(patch) {
            Some(updated) => {
                *current = Arc::new(updated);
                true
            }
            None => false,
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
