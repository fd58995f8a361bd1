//! End-of-conversation confirmation state machine.
//!
//! ```text
//!            assistant asks "are you sure you want to end the call?"
//!   Active ─────────────────────────────────────────────▶ PendingConfirm
//!     ▲                                                        │
//!     │ negative reply / rejected finalize                     │ confirmed finalize
//!     └────────────────────────────────────────────────────────┤ acknowledged
//!                                                              ▼
//!                                                            Ended
//! ```
//!
//! Every finalize path (remote tool call, client fallback timer) is gated by
//! the same [`ConfirmationMachine::has_finalize_permission`] predicate, so the
//! order in which signals arrive decides the outcome rather than timer jitter.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ConfirmationConfig;
use crate::intent::{DEFAULT_PHRASES, IntentReport, PhraseTable};

/// Lifecycle state broadcast to observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Active,
    PendingConfirm,
    Ended,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingConfirm => "pending_confirm",
            Self::Ended => "ended",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grant/deny/lockout bookkeeping for the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationContext {
    /// The assistant asked whether to end and no reply has declined it yet.
    pub requested: bool,
    pub asked_at: Option<Instant>,
    /// Shared turn counter at the moment the question was detected.
    pub asked_turn_index: u64,
    /// The user affirmed ending.
    pub granted: bool,
    /// Finalize attempts before this instant are rejected unconditionally.
    pub reject_finalize_until: Option<Instant>,
    pub last_stop_intent_at: Option<Instant>,
    pub last_user_turn_index: u64,
}

/// What a completed user reply did to the pending confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Nothing was pending and no stop intent is recent.
    Idle,
    Declined { lockout_until: Instant },
    Granted,
    /// Something is pending but the reply was neither yes nor no.
    Ambiguous,
}

/// Result of feeding one user turn to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserTurnOutcome {
    pub intent: IntentReport,
    pub reply: ReplyOutcome,
}

/// Why a finalize attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Inside the lockout window that follows a negative reply.
    Lockout,
    /// Neither the classic nor the stop-intent permission holds.
    NoPermission,
    /// The tool call itself said the user did not confirm.
    ModelUnconfirmed,
    /// The conversation is already finalized.
    AlreadyEnded,
}

/// Decision on a finalize attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeVerdict {
    Allowed,
    Rejected(RejectReason),
}

/// Owns the lifecycle state and the confirmation context of one session.
#[derive(Debug)]
pub struct ConfirmationMachine {
    config: ConfirmationConfig,
    phrases: &'static PhraseTable,
    state: LifecycleState,
    ctx: ConfirmationContext,
}

impl ConfirmationMachine {
    #[must_use]
    pub fn new(config: ConfirmationConfig) -> Self {
        Self {
            config,
            phrases: &DEFAULT_PHRASES,
            state: LifecycleState::Active,
            ctx: ConfirmationContext::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    #[must_use]
    pub fn context(&self) -> &ConfirmationContext {
        &self.ctx
    }

    /// Scan assistant text (streaming or complete) for an end-confirmation question.
    ///
    /// Fires at most once per assistant turn. Returns `true` when the machine
    /// moved to [`LifecycleState::PendingConfirm`].
    pub fn on_assistant_text(&mut self, text: &str, turn_index: u64, now: Instant) -> bool {
        if self.state == LifecycleState::Ended {
            return false;
        }
        if self.ctx.asked_at.is_some() && self.ctx.asked_turn_index == turn_index {
            return false;
        }
        if !self.phrases.is_end_confirmation_question(text) {
            return false;
        }
        self.ctx.requested = true;
        self.ctx.granted = false;
        self.ctx.asked_at = Some(now);
        self.ctx.asked_turn_index = turn_index;
        self.state = LifecycleState::PendingConfirm;
        true
    }

    /// Feed a completed user utterance.
    pub fn on_user_turn(&mut self, text: &str, turn_index: u64, now: Instant) -> UserTurnOutcome {
        let intent = self.phrases.analyze(text);
        if self.state == LifecycleState::Ended {
            return UserTurnOutcome {
                intent,
                reply: ReplyOutcome::Idle,
            };
        }

        self.ctx.last_user_turn_index = turn_index;
        if intent.stop_intent {
            self.ctx.last_stop_intent_at = Some(now);
        }

        if !self.ctx.requested && !self.stop_intent_recent(now) {
            return UserTurnOutcome {
                intent,
                reply: ReplyOutcome::Idle,
            };
        }

        let reply = if intent.negative {
            let lockout_until = now + self.config.reject_lockout();
            self.ctx.requested = false;
            self.ctx.granted = false;
            self.ctx.reject_finalize_until = Some(lockout_until);
            self.state = LifecycleState::Active;
            ReplyOutcome::Declined { lockout_until }
        } else if intent.affirmative {
            self.ctx.granted = true;
            self.state = LifecycleState::PendingConfirm;
            ReplyOutcome::Granted
        } else {
            ReplyOutcome::Ambiguous
        };

        UserTurnOutcome { intent, reply }
    }

    fn stop_intent_recent(&self, now: Instant) -> bool {
        self.ctx
            .last_stop_intent_at
            .is_some_and(|at| now.saturating_duration_since(at) <= self.config.stop_intent_window())
    }

    /// Whether finalize attempts are currently locked out.
    #[must_use]
    pub fn in_lockout(&self, now: Instant) -> bool {
        self.ctx.reject_finalize_until.is_some_and(|until| now < until)
    }

    /// Shared gate for every finalize path.
    ///
    /// Classic: the assistant asked within the ask window, the user replied
    /// after the question, and the reply was affirmative.
    /// Fallback: a recent stop intent plus an affirmative reply, outside the lockout.
    #[must_use]
    pub fn has_finalize_permission(&self, now: Instant) -> bool {
        let ctx = &self.ctx;
        let classic = ctx.requested
            && ctx.asked_at.is_some_and(|at| {
                now.saturating_duration_since(at) <= self.config.ask_window()
            })
            && ctx.last_user_turn_index > ctx.asked_turn_index
            && ctx.granted;
        let fallback = self.stop_intent_recent(now) && ctx.granted && !self.in_lockout(now);
        classic || fallback
    }

    /// Validate a termination tool call from the remote model.
    ///
    /// A rejection returns the machine to [`LifecycleState::Active`].
    pub fn check_remote_finalize(&mut self, confirmed: Option<bool>, now: Instant) -> FinalizeVerdict {
        if self.state == LifecycleState::Ended {
            return FinalizeVerdict::Rejected(RejectReason::AlreadyEnded);
        }
        let reason = if self.in_lockout(now) {
            Some(RejectReason::Lockout)
        } else if confirmed == Some(false) {
            Some(RejectReason::ModelUnconfirmed)
        } else if !self.has_finalize_permission(now) {
            Some(RejectReason::NoPermission)
        } else {
            None
        };
        match reason {
            Some(reason) => {
                self.state = LifecycleState::Active;
                FinalizeVerdict::Rejected(reason)
            }
            None => FinalizeVerdict::Allowed,
        }
    }

    /// Re-check permission when the client fallback timer fires.
    ///
    /// The lockout applies here exactly as it does to a remote call.
    pub fn check_fallback(&mut self, now: Instant) -> FinalizeVerdict {
        if self.state == LifecycleState::Ended {
            return FinalizeVerdict::Rejected(RejectReason::AlreadyEnded);
        }
        let reason = if self.in_lockout(now) {
            RejectReason::Lockout
        } else if self.has_finalize_permission(now) {
            return FinalizeVerdict::Allowed;
        } else {
            RejectReason::NoPermission
        };
        self.state = LifecycleState::Active;
        FinalizeVerdict::Rejected(reason)
    }

    /// The finalize request was acknowledged.
    pub fn mark_ended(&mut self) {
        self.state = LifecycleState::Ended;
        self.ctx.requested = false;
        self.ctx.granted = false;
    }

    /// A finalize attempt failed; a fresh confirmation is required.
    pub fn revert_to_active(&mut self) {
        if self.state == LifecycleState::Ended {
            return;
        }
        self.state = LifecycleState::Active;
        self.ctx.requested = false;
        self.ctx.granted = false;
    }

    /// Drop all grant, lockout and stop-intent bookkeeping, keeping the state.
    pub fn clear_context(&mut self) {
        self.ctx = ConfirmationContext::default();
    }

    /// Back to a fresh session.
    pub fn reset(&mut self) {
        self.clear_context();
        self.state = LifecycleState::Active;
    }
}
