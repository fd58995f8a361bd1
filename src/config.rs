//! Configuration types for the conversation lifecycle controller.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the lifecycle controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// End-of-conversation confirmation timing.
    pub confirmation: ConfirmationConfig,
    /// Snapshot autosave scheduling.
    pub autosave: AutosaveConfig,
    /// Persistence endpoint settings.
    pub persistence: PersistenceConfig,
    /// Advisory instructions sent to the remote model.
    pub directives: DirectiveConfig,
}

/// Confirmation state machine timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// How long an "are you sure you want to end" question stays answerable.
    pub ask_window_secs: u64,
    /// How long a user stop-intent phrase keeps the fallback permission path open.
    pub stop_intent_window_secs: u64,
    /// Lockout after a negative reply during which every finalize attempt is rejected.
    pub reject_lockout_ms: u64,
    /// Delay before the client finalizes on its own after an affirmative reply.
    ///
    /// Gives the remote model a chance to call the termination tool first.
    pub fallback_finalize_delay_ms: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            ask_window_secs: 90,
            stop_intent_window_secs: 20,
            reject_lockout_ms: 6_000,
            fallback_finalize_delay_ms: 1_800,
        }
    }
}

impl ConfirmationConfig {
    #[must_use]
    pub fn ask_window(&self) -> Duration {
        Duration::from_secs(self.ask_window_secs)
    }

    #[must_use]
    pub fn stop_intent_window(&self) -> Duration {
        Duration::from_secs(self.stop_intent_window_secs)
    }

    #[must_use]
    pub fn reject_lockout(&self) -> Duration {
        Duration::from_millis(self.reject_lockout_ms)
    }

    #[must_use]
    pub fn fallback_finalize_delay(&self) -> Duration {
        Duration::from_millis(self.fallback_finalize_delay_ms)
    }
}

/// Autosave scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Whether non-final snapshots are pushed during the conversation.
    pub enabled: bool,
    /// Idle time after the last transcript change before a snapshot is saved.
    pub idle_debounce_ms: u64,
    /// Shorter debounce used at turn boundaries.
    pub checkpoint_debounce_ms: u64,
    /// Minimum spacing between two successful autosaves.
    ///
    /// Never applied to finalize requests.
    pub min_interval_ms: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_debounce_ms: 8_000,
            checkpoint_debounce_ms: 3_000,
            min_interval_ms: 10_000,
        }
    }
}

impl AutosaveConfig {
    #[must_use]
    pub fn idle_debounce(&self) -> Duration {
        Duration::from_millis(self.idle_debounce_ms)
    }

    #[must_use]
    pub fn checkpoint_debounce(&self) -> Duration {
        Duration::from_millis(self.checkpoint_debounce_ms)
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Persistence endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Base URL of the conversation server.
    pub base_url: String,
    /// Path of the upsert endpoint, appended to `base_url`.
    pub save_path: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_owned(),
            save_path: "/api/save-conversation/".to_owned(),
            timeout_secs: 20,
        }
    }
}

impl PersistenceConfig {
    /// Full URL of the upsert endpoint.
    #[must_use]
    pub fn save_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if self.save_path.starts_with('/') {
            format!("{base}{}", self.save_path)
        } else {
            format!("{base}/{}", self.save_path)
        }
    }
}

/// Free-text instructions for the remote model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectiveConfig {
    /// Sent after the user declines to end the conversation.
    pub continue_text: String,
    /// Sent when a termination tool call is rejected.
    pub reject_finalize_text: String,
    /// Sent once the conversation has been finalized.
    pub closing_text: String,
}

impl Default for DirectiveConfig {
    fn default() -> Self {
        Self {
            continue_text: "The user wants to keep talking. Continue assisting them and do not \
                            end the conversation."
                .to_owned(),
            reject_finalize_text: "The conversation was not ended. Continue assisting the user. \
                                   Do not call finalize_conversation again unless the user \
                                   explicitly confirms they want to end."
                .to_owned(),
            closing_text: "The conversation has been saved. Thank the user briefly and say \
                           goodbye."
                .to_owned(),
        }
    }
}

impl LifecycleConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::LifecycleError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::LifecycleError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/voice-lifecycle/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("voice-lifecycle")
            .join("config.toml")
    }
}
