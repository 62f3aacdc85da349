//! Repository configuration loaded from `.huella/config.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CONFIG_FILE: &str = "config.json";

/// Huella repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HuellaConfig {
    /// Default worker budget for run/status (0 = number of CPUs)
    pub workers: usize,

    /// Seconds to wait after SIGTERM before SIGKILL on cancellation
    pub term_grace_secs: u64,

    /// Override for the content cache directory
    pub cache_dir: Option<PathBuf>,
}

impl Default for HuellaConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            term_grace_secs: 10,
            cache_dir: None,
        }
    }
}

impl HuellaConfig {
    /// Load the config from the state directory, falling back to defaults
    /// when the file is absent or unreadable.
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("ignoring malformed {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Effective worker count: the configured value, an explicit override,
    /// or the machine's available parallelism.
    pub fn effective_workers(&self, override_jobs: Option<usize>) -> usize {
        let configured = override_jobs.unwrap_or(self.workers);
        if configured > 0 {
            configured
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}
