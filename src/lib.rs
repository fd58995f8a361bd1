//! Voice conversation lifecycle controller.
//!
//! Decides, from a live and untrusted realtime event stream, when a voice
//! conversation is really over, and persists the conversation record exactly
//! once in its final form.
//!
//! # Architecture
//!
//! Events flow leaves-first through independent components:
//! - **Transcript**: accumulates streamed user/assistant text and counts turns
//! - **Intent**: phrase-table classifier for affirmative, negative and stop replies
//! - **Confirmation**: `active` / `pending_confirm` / `ended` state machine with lockout
//! - **Autosave**: debounced, throttled non-final snapshot scheduling
//! - **Persistence**: two-phase stop (snapshot, then confirmed finalize)
//! - **Controller**: single `handle(event)` entry point wiring everything together
//!
//! The `lifecycle-bridge` binary drives a controller over newline-delimited JSON.

pub mod autosave;
pub mod bridge;
pub mod config;
pub mod confirmation;
pub mod controller;
pub mod error;
pub mod events;
pub mod intent;
pub mod persistence;
pub mod session;
pub mod timers;
pub mod tool_call;
pub mod transcript;

pub use config::LifecycleConfig;
pub use confirmation::LifecycleState;
pub use controller::LifecycleController;
pub use error::{LifecycleError, Result};
pub use events::{LifecycleEvent, LifecycleNotice, ModelChannel, SideEffect, Transition, TransportEvent};
pub use persistence::{ConversationStore, HttpConversationStore, SaveAck, SaveRequest};
