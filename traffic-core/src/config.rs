//! Persisted configuration.
//!
//! One JSON file, passed on the command line, is the single source of
//! truth across restarts: profiles are recreated from it in their
//! last-known enabled state, and every successful mutation rewrites it
//! atomically (temp file in the same directory, then rename).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::profile::ProfileDescriptor;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(default)]
    pub profiles: Vec<ProfileDescriptor>,
}

impl PersistedConfig {
    /// Load from `path`. A missing file is an empty configuration; a
    /// malformed one is an error rather than a silent wipe.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no persisted config, starting empty");
                return Ok(Self::default());
            }
            Err(e) => return Err(CoreError::Config(format!("{}: {e}", path.display()))),
        };
        serde_json::from_str(&text)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    /// Atomic rewrite: temp file alongside the target, then rename.
    pub fn save_atomic(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::Config(e.to_string()))?;
        let tmp: PathBuf = path.with_extension("json.tmp");
        std::fs::write(&tmp, json.as_bytes())
            .map_err(|e| CoreError::Config(format!("{}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    /// Persist, logging rather than failing the mutation that triggered
    /// the save: the registry already committed.
    pub fn save_best_effort(&self, path: &Path) {
        if let Err(e) = self.save_atomic(path) {
            warn!(error = %e, "failed to persist configuration");
        }
    }
}
