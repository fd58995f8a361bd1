//! Inbound events, outbound notices and transition descriptions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::autosave::SkipReason;
use crate::confirmation::{LifecycleState, RejectReason};
use crate::error::{LifecycleError, Result};
use crate::persistence::SaveAck;
use crate::timers::TimerFired;
use crate::transcript::Speaker;

/// Structured events from the media/transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// Streamed transcript fragment.
    TranscriptDelta { speaker: Speaker, text: String },
    /// End of a turn. `text` is the full turn transcript when the transport
    /// delivers it in one piece instead of as deltas.
    TurnComplete {
        speaker: Speaker,
        #[serde(default)]
        text: Option<String>,
    },
    ToolCallStart { call_id: String, name: String },
    ToolCallArgsDelta { call_id: String, delta: String },
    ToolCallDone {
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: Option<String>,
    },
    /// The data channel or peer connection dropped.
    ConnectionLost,
}

/// Result of a background autosave, delivered on the loopback channel.
#[derive(Debug, Clone)]
pub struct AutosaveFinished {
    /// Session epoch the save was issued in; stale results are ignored.
    pub epoch: u64,
    pub signature: String,
    pub result: std::result::Result<SaveAck, String>,
}

/// Events the controller sends to itself (timers, background saves).
#[derive(Debug, Clone)]
pub enum InternalEvent {
    Timer(TimerFired),
    AutosaveFinished(AutosaveFinished),
}

/// Everything [`crate::controller::LifecycleController::handle`] accepts.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Start { session_id: String },
    Stop { reason: String },
    Transport(TransportEvent),
    Internal(InternalEvent),
}

impl From<TransportEvent> for LifecycleEvent {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

impl From<InternalEvent> for LifecycleEvent {
    fn from(event: InternalEvent) -> Self {
        Self::Internal(event)
    }
}

/// Broadcast to observing UIs on every lifecycle state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleNotice {
    pub session_id: String,
    pub state: LifecycleState,
    pub conversation_id: Option<i64>,
    pub at: DateTime<Utc>,
}

/// One observable consequence of handling an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum SideEffect {
    SessionStarted { session_id: String },
    SessionStopped { session_id: String, reason: String },
    ConfirmationRequested { turn_index: u64 },
    StopIntentObserved,
    ConfirmationGranted,
    ConfirmationDeclined { lockout_ms: u64 },
    AmbiguousReply,
    FallbackArmed { delay_ms: u64 },
    FallbackCancelled,
    LockoutExpired,
    InstructionSent { text: String },
    InstructionFailed { error: String },
    AutosaveScheduled { delay_ms: u64 },
    AutosaveStarted,
    AutosaveSkipped { reason: SkipReason },
    AutosaveSaved { conversation_id: Option<i64> },
    AutosaveFailed { error: String },
    SnapshotSaved { conversation_id: Option<i64> },
    SnapshotFailed { error: String },
    NothingToSave,
    FinalizeRejected { reason: RejectReason },
    Finalized { conversation_id: Option<i64> },
    FinalizeFailed { error: String },
    ToolCallIgnored { name: String },
}

/// What handling one event did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub effects: Vec<SideEffect>,
}

impl Transition {
    #[must_use]
    pub fn state_changed(&self) -> bool {
        self.from != self.to
    }
}

/// Outbound advisory channel to the remote model.
///
/// Instructions are fire-and-forget: not acknowledged and never retried.
#[async_trait]
pub trait ModelChannel: Send + Sync {
    async fn send_instruction(&self, text: &str) -> Result<()>;
}

/// Drops every instruction.
#[derive(Debug, Default)]
pub struct NoopModelChannel;

#[async_trait]
impl ModelChannel for NoopModelChannel {
    async fn send_instruction(&self, _text: &str) -> Result<()> {
        Ok(())
    }
}

/// Forwards instructions into an mpsc channel drained by the transport.
#[derive(Debug, Clone)]
pub struct ChannelModel {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelModel {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ModelChannel for ChannelModel {
    async fn send_instruction(&self, text: &str) -> Result<()> {
        self.tx
            .send(text.to_owned())
            .map_err(|_| LifecycleError::Transport("model channel is closed".to_owned()))
    }
}
