//! Debounced, throttled snapshot autosave bookkeeping.
//!
//! The scheduler decides *whether* a snapshot should be pushed; the
//! controller owns the debounce timer and the network call. Only one
//! autosave may be in flight at a time. Finalize requests never pass through
//! here, so neither the in-flight guard nor the throttle can delay them.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::AutosaveConfig;
use crate::transcript::Snapshot;

/// Why an autosave attempt did not reach the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "skip")]
pub enum SkipReason {
    Disabled,
    Finalized,
    /// Nothing changed since the last successful save.
    Clean,
    Empty,
    Unchanged,
    InFlight,
    Throttled { retry_in_ms: u64 },
}

/// Outcome of [`AutosaveScheduler::plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutosaveDecision {
    /// Send this snapshot; the in-flight guard is now held.
    Send { signature: String },
    Skip(SkipReason),
}

/// Debounce flavour requested by a transcript change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Debounce {
    /// Any transcript mutation.
    Idle,
    /// End of a user or assistant turn.
    Checkpoint,
}

#[derive(Debug)]
pub struct AutosaveScheduler {
    config: AutosaveConfig,
    dirty: bool,
    last_signature: Option<String>,
    last_save_at: Option<Instant>,
    saving: bool,
}

impl AutosaveScheduler {
    #[must_use]
    pub fn new(config: AutosaveConfig) -> Self {
        Self {
            config,
            dirty: false,
            last_signature: None,
            last_save_at: None,
            saving: false,
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.saving
    }

    #[must_use]
    pub fn last_signature(&self) -> Option<&str> {
        self.last_signature.as_deref()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[must_use]
    pub fn debounce(&self, kind: Debounce) -> Duration {
        match kind {
            Debounce::Idle => self.config.idle_debounce(),
            Debounce::Checkpoint => self.config.checkpoint_debounce(),
        }
    }

    /// Decide whether `snapshot` should be pushed now.
    pub fn plan(&mut self, snapshot: &Snapshot, finalized: bool, now: Instant) -> AutosaveDecision {
        if finalized {
            return AutosaveDecision::Skip(SkipReason::Finalized);
        }
        if !self.config.enabled {
            return AutosaveDecision::Skip(SkipReason::Disabled);
        }
        if !self.dirty {
            return AutosaveDecision::Skip(SkipReason::Clean);
        }
        if snapshot.is_empty() {
            self.dirty = false;
            return AutosaveDecision::Skip(SkipReason::Empty);
        }
        let signature = snapshot.signature();
        if self.last_signature.as_deref() == Some(signature.as_str()) {
            self.dirty = false;
            return AutosaveDecision::Skip(SkipReason::Unchanged);
        }
        if self.saving {
            return AutosaveDecision::Skip(SkipReason::InFlight);
        }
        if let Some(last) = self.last_save_at {
            let elapsed = now.saturating_duration_since(last);
            let min = self.config.min_interval();
            if elapsed < min {
                let retry_in = min - elapsed;
                return AutosaveDecision::Skip(SkipReason::Throttled {
                    retry_in_ms: u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
        self.saving = true;
        AutosaveDecision::Send { signature }
    }

    /// The in-flight autosave succeeded.
    ///
    /// `current` is the signature of the transcript right now; if it moved on
    /// while the request was in flight the scheduler stays dirty.
    pub fn complete_success(&mut self, saved: String, current: &str, now: Instant) {
        self.saving = false;
        self.dirty = saved != current;
        self.last_signature = Some(saved);
        self.last_save_at = Some(now);
    }

    /// The in-flight autosave failed; stay dirty for the next debounce.
    pub fn complete_failure(&mut self) {
        self.saving = false;
        self.dirty = true;
    }

    /// Record a save issued outside the autosave path (stop snapshot, finalize).
    pub fn record_save(&mut self, saved: String, now: Instant) {
        self.dirty = false;
        self.last_signature = Some(saved);
        self.last_save_at = Some(now);
    }

    pub fn reset(&mut self) {
        self.dirty = false;
        self.last_signature = None;
        self.last_save_at = None;
        self.saving = false;
    }
}
