use serde::{Deserialize, Serialize};

use crate::store::DurableStore;

pub const SETTINGS_KEY: &str = "settings/app";

/// Application settings document. Unknown fields from newer releases are
/// ignored, missing fields take their defaults, so the document stays
/// readable across versions in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Global default shell; second tier of the restoration fallback chain.
    pub default_shell: Option<String>,
    /// Maximum scrollback lines captured per terminal.
    pub scrollback_limit: usize,
    /// Write-behind debounce interval in milliseconds.
    pub debounce_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_shell: None,
            scrollback_limit: 1000,
            debounce_ms: 500,
        }
    }
}

impl AppSettings {
    pub async fn load(store: &DurableStore) -> crate::Result<Self> {
        Ok(store.read_as(SETTINGS_KEY).await?.unwrap_or_default())
    }

    pub async fn save(&self, store: &DurableStore) -> crate::Result<()> {
        store.write_as(SETTINGS_KEY, self).await
    }
}
