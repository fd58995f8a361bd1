//! Conversation lifecycle controller: the composition root.
//!
//! One controller instance owns one session at a time. Every input (transport
//! events, session start/stop, fired timers, finished background saves) goes
//! through [`LifecycleController::handle`], which runs to completion before
//! the next event is looked at. Timers and background autosaves report back
//! on the loopback channel returned by [`LifecycleController::new`]; the
//! driver feeds those events back in as [`LifecycleEvent::Internal`].

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::autosave::{AutosaveDecision, AutosaveScheduler, Debounce, SkipReason};
use crate::config::LifecycleConfig;
use crate::confirmation::{
    ConfirmationContext, ConfirmationMachine, FinalizeVerdict, LifecycleState, RejectReason,
    ReplyOutcome,
};
use crate::events::{
    AutosaveFinished, InternalEvent, LifecycleEvent, LifecycleNotice, ModelChannel, SideEffect,
    Transition, TransportEvent,
};
use crate::persistence::{ConversationStore, SaveAck, SaveRequest};
use crate::session::ConversationSession;
use crate::timers::{TimerFired, TimerKind, Timers};
use crate::tool_call::ToolCallBuffer;
use crate::transcript::Speaker;

/// Capacity of the lifecycle notice broadcast channel.
const NOTICE_CHANNEL_CAPACITY: usize = 32;

const REASON_AUTOSAVE: &str = "autosave";
const REASON_FALLBACK: &str = "client_fallback";
const REASON_MODEL: &str = "model_finalize";
pub const REASON_CONNECTION_LOST: &str = "connection_lost";
const REASON_RESTART: &str = "restart";

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Owns one conversation session at a time and turns every event into a
/// [`Transition`].
///
/// Timers and background autosaves report back through the loopback receiver
/// returned by [`LifecycleController::new`]; the caller feeds those events to
/// [`LifecycleController::handle`] like any other.
pub struct LifecycleController {
    config: LifecycleConfig,
    store: Arc<dyn ConversationStore>,
    model: Arc<dyn ModelChannel>,
    machine: ConfirmationMachine,
    autosave: AutosaveScheduler,
    timers: Timers,
    tool_calls: ToolCallBuffer,
    session: Option<ConversationSession>,
    /// Id and conversation id of the most recent session, kept for notices
    /// emitted after the session itself was dropped.
    last_session: Option<(String, Option<i64>)>,
    /// Bumped on every start/stop; background results from older epochs are dropped.
    epoch: u64,
    loopback: mpsc::UnboundedSender<InternalEvent>,
    notices: broadcast::Sender<LifecycleNotice>,
}

impl LifecycleController {
    /// Create a controller and the receiver for its loopback events.
    #[must_use]
    pub fn new(
        config: LifecycleConfig,
        store: Arc<dyn ConversationStore>,
        model: Arc<dyn ModelChannel>,
    ) -> (Self, mpsc::UnboundedReceiver<InternalEvent>) {
        let (loopback, loopback_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let controller = Self {
            machine: ConfirmationMachine::new(config.confirmation.clone()),
            autosave: AutosaveScheduler::new(config.autosave.clone()),
            config,
            store,
            model,
            timers: Timers::new(),
            tool_calls: ToolCallBuffer::new(),
            session: None,
            last_session: None,
            epoch: 0,
            loopback,
            notices,
        };
        (controller, loopback_rx)
    }

    /// Subscribe to lifecycle state change notices.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleNotice> {
        self.notices.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.machine.state()
    }

    #[must_use]
    pub fn session(&self) -> Option<&ConversationSession> {
        self.session.as_ref()
    }

    #[must_use]
    pub fn confirmation(&self) -> &ConfirmationContext {
        self.machine.context()
    }

    #[must_use]
    pub fn autosave(&self) -> &AutosaveScheduler {
        &self.autosave
    }

    #[must_use]
    pub fn is_timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.slot(kind).is_armed()
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Begin a new session, stopping the current one first.
    pub async fn start(&mut self, session_id: impl Into<String>) -> Transition {
        self.handle(LifecycleEvent::Start {
            session_id: session_id.into(),
        })
        .await
    }

    /// Stop the current session, persisting whatever it holds.
    pub async fn stop(&mut self, reason: impl Into<String>) -> Transition {
        self.handle(LifecycleEvent::Stop {
            reason: reason.into(),
        })
        .await
    }

    /// Process one event to completion and describe what happened.
    pub async fn handle(&mut self, event: impl Into<LifecycleEvent>) -> Transition {
        let event = event.into();
        let from = self.machine.state();
        let mut effects = Vec::new();
        let always_notify = matches!(event, LifecycleEvent::Start { .. });
        match event {
            LifecycleEvent::Start { session_id } => self.on_start(session_id, &mut effects).await,
            LifecycleEvent::Stop { reason } => self.on_stop(&reason, &mut effects).await,
            LifecycleEvent::Transport(event) => self.on_transport(event, &mut effects).await,
            LifecycleEvent::Internal(event) => self.on_internal(event, &mut effects).await,
        }
        let to = self.machine.state();
        if from != to || always_notify {
            self.notify(to);
        }
        Transition { from, to, effects }
    }

    fn notify(&self, state: LifecycleState) {
        let (session_id, conversation_id) = match &self.session {
            Some(s) => (s.session_id().to_owned(), s.conversation_id()),
            None => match &self.last_session {
                Some((id, conversation_id)) => (id.clone(), *conversation_id),
                None => return,
            },
        };
        // No subscribers is fine.
        let _ = self.notices.send(LifecycleNotice {
            session_id,
            state,
            conversation_id,
            at: chrono::Utc::now(),
        });
    }

    async fn on_start(&mut self, session_id: String, effects: &mut Vec<SideEffect>) {
        if self.session.is_some() {
            self.on_stop(REASON_RESTART, effects).await;
        }
        self.reset_session_state();
        info!(session_id = %session_id, "conversation session started");
        effects.push(SideEffect::SessionStarted {
            session_id: session_id.clone(),
        });
        self.session = Some(ConversationSession::new(session_id));
    }

    async fn on_stop(&mut self, reason: &str, effects: &mut Vec<SideEffect>) {
        if self.session.is_none() {
            debug!(reason, "stop without an active session");
            return;
        }
        self.timers.cancel_all();
        self.tool_calls.clear();

        let finalized = self.session.as_ref().is_some_and(ConversationSession::is_finalized);
        if !finalized {
            self.finalize(reason, false, effects).await;
        }

        self.machine.clear_context();
        self.epoch = self.epoch.wrapping_add(1);
        if let Some(session) = self.session.take() {
            info!(
                session_id = %session.session_id(),
                reason,
                finalized = session.is_finalized(),
                "conversation session stopped"
            );
            effects.push(SideEffect::SessionStopped {
                session_id: session.session_id().to_owned(),
                reason: reason.to_owned(),
            });
            self.last_session = Some((session.session_id().to_owned(), session.conversation_id()));
        }
    }

    fn reset_session_state(&mut self) {
        self.timers.cancel_all();
        self.tool_calls.clear();
        self.machine.reset();
        self.autosave.reset();
        self.epoch = self.epoch.wrapping_add(1);
    }

    async fn on_transport(&mut self, event: TransportEvent, effects: &mut Vec<SideEffect>) {
        if self.session.is_none() {
            debug!(?event, "transport event without an active session; ignoring");
            return;
        }
        let now = Instant::now();
        match event {
            TransportEvent::TranscriptDelta { speaker, text } => {
                if text.is_empty() {
                    return;
                }
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.transcript.on_delta(speaker, &text);
                if speaker == Speaker::Assistant {
                    let turn_index = session.transcript.turn_index();
                    let asked = self.machine.on_assistant_text(
                        session.transcript.current_turn(Speaker::Assistant),
                        turn_index,
                        now,
                    );
                    if asked {
                        info!(turn_index, "assistant asked to end the conversation");
                        effects.push(SideEffect::ConfirmationRequested { turn_index });
                    }
                }
                self.mark_dirty(Debounce::Idle, effects);
            }
            TransportEvent::TurnComplete { speaker, text } => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                // The question belongs to the turn still in progress.
                let open_turn_index = session.transcript.turn_index();
                let turn = session.transcript.on_turn_complete(speaker, text.as_deref());
                match speaker {
                    Speaker::Assistant => {
                        if self.machine.on_assistant_text(&turn.text, open_turn_index, now) {
                            info!(
                                turn_index = open_turn_index,
                                "assistant asked to end the conversation"
                            );
                            effects.push(SideEffect::ConfirmationRequested {
                                turn_index: open_turn_index,
                            });
                        }
                    }
                    Speaker::User => {
                        self.on_user_turn(&turn.text, turn.turn_index, now, effects)
                            .await;
                    }
                }
                self.mark_dirty(Debounce::Checkpoint, effects);
            }
            TransportEvent::ToolCallStart { call_id, name } => {
                self.tool_calls.start(&call_id, &name);
            }
            TransportEvent::ToolCallArgsDelta { call_id, delta } => {
                self.tool_calls.push_args(&call_id, &delta);
            }
            TransportEvent::ToolCallDone {
                call_id,
                name,
                arguments,
            } => {
                let Some(call) =
                    self.tool_calls
                        .finish(&call_id, name.as_deref(), arguments.as_deref())
                else {
                    debug!(call_id = %call_id, "completion for unknown tool call; ignoring");
                    return;
                };
                if !call.is_finalize() {
                    debug!(name = %call.name, "ignoring unrelated tool call");
                    effects.push(SideEffect::ToolCallIgnored { name: call.name });
                    return;
                }
                let args = call.finalize_args();
                self.on_remote_finalize(args.reason, args.confirmed, now, effects)
                    .await;
            }
            TransportEvent::ConnectionLost => {
                warn!("transport connection lost; stopping session");
                self.on_stop(REASON_CONNECTION_LOST, effects).await;
            }
        }
    }

    async fn on_user_turn(
        &mut self,
        text: &str,
        turn_index: u64,
        now: Instant,
        effects: &mut Vec<SideEffect>,
    ) {
        let outcome = self.machine.on_user_turn(text, turn_index, now);
        if outcome.intent.stop_intent {
            debug!(turn_index, "user stop intent observed");
            effects.push(SideEffect::StopIntentObserved);
        }
        match outcome.reply {
            ReplyOutcome::Idle => {}
            ReplyOutcome::Declined { lockout_until } => {
                if self.timers.cancel(TimerKind::FallbackFinalize) {
                    effects.push(SideEffect::FallbackCancelled);
                }
                let lockout = lockout_until.saturating_duration_since(now);
                self.timers
                    .arm(TimerKind::LockoutExpiry, lockout, &self.loopback);
                info!(lockout_ms = millis(lockout), "user declined to end the conversation");
                effects.push(SideEffect::ConfirmationDeclined {
                    lockout_ms: millis(lockout),
                });
                let text = self.config.directives.continue_text.clone();
                self.instruct(&text, effects).await;
            }
            ReplyOutcome::Granted => {
                let delay = self.config.confirmation.fallback_finalize_delay();
                self.timers
                    .arm(TimerKind::FallbackFinalize, delay, &self.loopback);
                info!(delay_ms = millis(delay), "user confirmed ending; fallback finalize armed");
                effects.push(SideEffect::ConfirmationGranted);
                effects.push(SideEffect::FallbackArmed {
                    delay_ms: millis(delay),
                });
            }
            ReplyOutcome::Ambiguous => {
                debug!(turn_index, "reply neither confirmed nor declined");
                effects.push(SideEffect::AmbiguousReply);
            }
        }
    }

    async fn on_remote_finalize(
        &mut self,
        reason: Option<String>,
        confirmed: Option<bool>,
        now: Instant,
        effects: &mut Vec<SideEffect>,
    ) {
        match self.machine.check_remote_finalize(confirmed, now) {
            FinalizeVerdict::Allowed => {
                if self.timers.cancel(TimerKind::FallbackFinalize) {
                    effects.push(SideEffect::FallbackCancelled);
                }
                let reason = reason.unwrap_or_else(|| REASON_MODEL.to_owned());
                info!(reason = %reason, "remote model finalize accepted");
                self.finalize(&reason, true, effects).await;
            }
            FinalizeVerdict::Rejected(RejectReason::AlreadyEnded) => {
                debug!("finalize call after the conversation ended; ignoring");
                effects.push(SideEffect::FinalizeRejected {
                    reason: RejectReason::AlreadyEnded,
                });
            }
            FinalizeVerdict::Rejected(rejection) => {
                if self.timers.cancel(TimerKind::FallbackFinalize) {
                    effects.push(SideEffect::FallbackCancelled);
                }
                warn!(?rejection, ?confirmed, "rejected finalize call from remote model");
                effects.push(SideEffect::FinalizeRejected { reason: rejection });
                let text = self.config.directives.reject_finalize_text.clone();
                self.instruct(&text, effects).await;
            }
        }
    }

    async fn on_internal(&mut self, event: InternalEvent, effects: &mut Vec<SideEffect>) {
        match event {
            InternalEvent::Timer(fired) => self.on_timer(fired, effects).await,
            InternalEvent::AutosaveFinished(finished) => self.on_autosave_finished(finished, effects),
        }
    }

    async fn on_timer(&mut self, fired: TimerFired, effects: &mut Vec<SideEffect>) {
        if !self.timers.accept(fired) {
            debug!(?fired, "stale timer fire; ignoring");
            return;
        }
        let now = Instant::now();
        match fired.kind {
            TimerKind::Autosave => self.try_autosave(now, effects),
            TimerKind::FallbackFinalize => match self.machine.check_fallback(now) {
                FinalizeVerdict::Allowed => {
                    info!("remote model did not finalize; finalizing from the client");
                    self.finalize(REASON_FALLBACK, true, effects).await;
                }
                FinalizeVerdict::Rejected(reason) => {
                    debug!(?reason, "fallback finalize no longer permitted");
                    effects.push(SideEffect::FinalizeRejected { reason });
                }
            },
            TimerKind::LockoutExpiry => {
                debug!("finalize lockout expired");
                effects.push(SideEffect::LockoutExpired);
            }
        }
    }

    fn mark_dirty(&mut self, debounce: Debounce, effects: &mut Vec<SideEffect>) {
        let finalized = self.session.as_ref().is_none_or(ConversationSession::is_finalized);
        if finalized || !self.autosave.enabled() {
            return;
        }
        self.autosave.mark_dirty();
        let delay = self.autosave.debounce(debounce);
        self.timers.arm(TimerKind::Autosave, delay, &self.loopback);
        effects.push(SideEffect::AutosaveScheduled {
            delay_ms: millis(delay),
        });
    }

    fn try_autosave(&mut self, now: Instant, effects: &mut Vec<SideEffect>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let snapshot = session.transcript.snapshot();
        match self.autosave.plan(&snapshot, session.is_finalized(), now) {
            AutosaveDecision::Send { signature } => {
                let request = SaveRequest::autosave(
                    session.session_id(),
                    session.conversation_id(),
                    &snapshot,
                    REASON_AUTOSAVE,
                );
                let store = Arc::clone(&self.store);
                let loopback = self.loopback.clone();
                let epoch = self.epoch;
                debug!(session_id = %session.session_id(), "autosave started");
                tokio::spawn(async move {
                    let result = match store.save(&request).await {
                        Ok(ack) if ack.ok => Ok(ack),
                        Ok(_) => Err("server did not acknowledge the save".to_owned()),
                        Err(e) => Err(e.to_string()),
                    };
                    let _ = loopback.send(InternalEvent::AutosaveFinished(AutosaveFinished {
                        epoch,
                        signature,
                        result,
                    }));
                });
                effects.push(SideEffect::AutosaveStarted);
            }
            AutosaveDecision::Skip(reason) => {
                debug!(?reason, "autosave skipped");
                effects.push(SideEffect::AutosaveSkipped { reason });
                if let SkipReason::Throttled { retry_in_ms } = reason {
                    let delay = std::time::Duration::from_millis(retry_in_ms);
                    self.timers.arm(TimerKind::Autosave, delay, &self.loopback);
                    effects.push(SideEffect::AutosaveScheduled {
                        delay_ms: retry_in_ms,
                    });
                }
            }
        }
    }

    fn on_autosave_finished(&mut self, finished: AutosaveFinished, effects: &mut Vec<SideEffect>) {
        if finished.epoch != self.epoch {
            debug!("autosave result from a previous session; ignoring");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match finished.result {
            Ok(ack) => {
                session.latch_conversation_id(ack.id);
                let current = session.transcript.snapshot().signature();
                self.autosave
                    .complete_success(finished.signature, &current, Instant::now());
                debug!(conversation_id = ?session.conversation_id(), "autosave stored");
                effects.push(SideEffect::AutosaveSaved {
                    conversation_id: session.conversation_id(),
                });
                let finalized = session.is_finalized();
                if self.autosave.is_dirty() && !finalized {
                    let delay = self.autosave.debounce(Debounce::Checkpoint);
                    self.timers.arm(TimerKind::Autosave, delay, &self.loopback);
                    effects.push(SideEffect::AutosaveScheduled {
                        delay_ms: millis(delay),
                    });
                }
            }
            Err(error) => {
                warn!(error = %error, "autosave failed; will retry on next change");
                self.autosave.complete_failure();
                effects.push(SideEffect::AutosaveFailed { error });
            }
        }
    }

    /// Two-phase save: a non-final snapshot, then the confirmed finalize.
    ///
    /// Bypasses the autosave throttle and in-flight guard. When
    /// `notify_model` is set the remote model is told the outcome.
    async fn finalize(&mut self, reason: &str, notify_model: bool, effects: &mut Vec<SideEffect>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.is_finalized() {
            return;
        }
        let snapshot = session.transcript.snapshot();
        let session_id = session.session_id().to_owned();
        if snapshot.is_empty() && session.conversation_id().is_none() {
            debug!(session_id = %session_id, "nothing to persist");
            effects.push(SideEffect::NothingToSave);
            self.machine.revert_to_active();
            return;
        }

        let phase_one =
            SaveRequest::snapshot(&session_id, session.conversation_id(), &snapshot, reason);
        match self.save(&phase_one).await {
            Ok(ack) => {
                if let Some(session) = self.session.as_mut() {
                    session.latch_conversation_id(ack.id);
                }
                self.autosave
                    .record_save(snapshot.signature(), Instant::now());
                effects.push(SideEffect::SnapshotSaved {
                    conversation_id: self.conversation_id(),
                });
            }
            Err(error) => {
                warn!(session_id = %session_id, error = %error, "snapshot save failed; not finalizing");
                effects.push(SideEffect::SnapshotFailed { error });
                self.after_failed_finalize(notify_model, effects).await;
                return;
            }
        }

        if self.session.as_ref().is_none_or(ConversationSession::is_finalized) {
            return;
        }
        let phase_two =
            SaveRequest::finalize(&session_id, self.conversation_id(), &snapshot, reason);
        match self.save(&phase_two).await {
            Ok(ack) => {
                if let Some(session) = self.session.as_mut() {
                    session.latch_conversation_id(ack.id);
                    session.mark_finalized();
                }
                self.machine.mark_ended();
                self.timers.cancel_all();
                let conversation_id = self.conversation_id();
                info!(session_id = %session_id, ?conversation_id, reason, "conversation finalized");
                effects.push(SideEffect::Finalized { conversation_id });
                if notify_model {
                    let text = self.config.directives.closing_text.clone();
                    self.instruct(&text, effects).await;
                }
            }
            Err(error) => {
                warn!(session_id = %session_id, error = %error, "finalize save failed");
                effects.push(SideEffect::FinalizeFailed { error });
                self.after_failed_finalize(notify_model, effects).await;
            }
        }
    }

    async fn after_failed_finalize(&mut self, notify_model: bool, effects: &mut Vec<SideEffect>) {
        self.machine.revert_to_active();
        if notify_model {
            let text = self.config.directives.continue_text.clone();
            self.instruct(&text, effects).await;
        }
    }

    async fn save(&self, request: &SaveRequest) -> std::result::Result<SaveAck, String> {
        match self.store.save(request).await {
            Ok(ack) if ack.ok => Ok(ack),
            Ok(_) => Err("server did not acknowledge the save".to_owned()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn conversation_id(&self) -> Option<i64> {
        self.session.as_ref().and_then(ConversationSession::conversation_id)
    }

    async fn instruct(&self, text: &str, effects: &mut Vec<SideEffect>) {
        match self.model.send_instruction(text).await {
            Ok(()) => effects.push(SideEffect::InstructionSent {
                text: text.to_owned(),
            }),
            Err(e) => {
                warn!("failed to send instruction to remote model: {e}");
                effects.push(SideEffect::InstructionFailed {
                    error: e.to_string(),
                });
            }
        }
    }
}
