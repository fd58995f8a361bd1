//! Shared helpers for integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use voice_lifecycle::config::LifecycleConfig;
use voice_lifecycle::controller::LifecycleController;
use voice_lifecycle::events::{
    InternalEvent, LifecycleEvent, ModelChannel, SideEffect, Transition, TransportEvent,
};
use voice_lifecycle::persistence::{ConversationStore, SaveAck, SaveRequest};
use voice_lifecycle::timers::TimerKind;
use voice_lifecycle::tool_call::FINALIZE_TOOL_NAME;
use voice_lifecycle::transcript::Speaker;
use voice_lifecycle::{LifecycleError, Result};

pub(crate) const QUESTION: &str = "Are you sure you want to end this conversation?";

/// Conversation id every successful mock save acknowledges with.
pub(crate) const MOCK_CONVERSATION_ID: i64 = 42;

/// In-memory store that records every request and can be told to fail.
#[derive(Default)]
pub(crate) struct MockStore {
    requests: Mutex<Vec<(Instant, SaveRequest)>>,
    pub(crate) fail_autosave: AtomicBool,
    pub(crate) fail_snapshot: AtomicBool,
    pub(crate) fail_finalize: AtomicBool,
}

impl MockStore {
    pub(crate) fn requests(&self) -> Vec<SaveRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub(crate) fn timed_requests(&self) -> Vec<(Instant, SaveRequest)> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn finalize_requests(&self) -> Vec<SaveRequest> {
        self.requests().into_iter().filter(|r| r.finalize).collect()
    }

    pub(crate) fn autosave_requests(&self) -> Vec<(Instant, SaveRequest)> {
        self.timed_requests()
            .into_iter()
            .filter(|(_, r)| r.autosave)
            .collect()
    }
}

#[async_trait]
impl ConversationStore for MockStore {
    async fn save(&self, request: &SaveRequest) -> Result<SaveAck> {
        self.requests
            .lock()
            .unwrap()
            .push((Instant::now(), request.clone()));
        let fail = if request.finalize {
            &self.fail_finalize
        } else if request.autosave {
            &self.fail_autosave
        } else {
            &self.fail_snapshot
        };
        if fail.load(Ordering::SeqCst) {
            return Err(LifecycleError::Persistence("mock store failure".into()));
        }
        Ok(SaveAck {
            ok: true,
            id: Some(MOCK_CONVERSATION_ID),
        })
    }
}

/// Model channel that records every instruction.
#[derive(Default)]
pub(crate) struct RecordingModel {
    sent: Mutex<Vec<String>>,
}

impl RecordingModel {
    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelChannel for RecordingModel {
    async fn send_instruction(&self, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push(text.to_owned());
        Ok(())
    }
}

/// A controller wired to a mock store and recording model.
pub(crate) struct Harness {
    pub(crate) controller: LifecycleController,
    pub(crate) loopback: mpsc::UnboundedReceiver<InternalEvent>,
    pub(crate) store: Arc<MockStore>,
    pub(crate) model: Arc<RecordingModel>,
}

impl Harness {
    pub(crate) fn new(config: LifecycleConfig) -> Self {
        let store = Arc::new(MockStore::default());
        let model = Arc::new(RecordingModel::default());
        let (controller, loopback) = LifecycleController::new(
            config,
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Arc::clone(&model) as Arc<dyn ModelChannel>,
        );
        Self {
            controller,
            loopback,
            store,
            model,
        }
    }

    /// Default config with autosave switched off.
    pub(crate) fn without_autosave() -> Self {
        let mut config = LifecycleConfig::default();
        config.autosave.enabled = false;
        Self::new(config)
    }

    pub(crate) async fn start(&mut self, session_id: &str) -> Transition {
        self.controller.start(session_id).await
    }

    /// Deliver a complete turn in one piece.
    pub(crate) async fn say(&mut self, speaker: Speaker, text: &str) -> Transition {
        self.controller
            .handle(TransportEvent::TurnComplete {
                speaker,
                text: Some(text.to_owned()),
            })
            .await
    }

    pub(crate) async fn stream(&mut self, speaker: Speaker, text: &str) -> Transition {
        self.controller
            .handle(TransportEvent::TranscriptDelta {
                speaker,
                text: text.to_owned(),
            })
            .await
    }

    /// The remote model calls the termination tool with `arguments`.
    pub(crate) async fn finalize_call(&mut self, call_id: &str, arguments: &str) -> Transition {
        self.controller
            .handle(TransportEvent::ToolCallDone {
                call_id: call_id.to_owned(),
                name: Some(FINALIZE_TOOL_NAME.to_owned()),
                arguments: Some(arguments.to_owned()),
            })
            .await
    }

    /// Feed loopback events until one satisfies `pred`; returns that transition.
    pub(crate) async fn drive_until(
        &mut self,
        pred: impl Fn(&InternalEvent) -> bool,
    ) -> Transition {
        loop {
            let event = self.loopback.recv().await.expect("loopback open");
            let matched = pred(&event);
            let transition = self.controller.handle(LifecycleEvent::Internal(event)).await;
            if matched {
                return transition;
            }
        }
    }

    /// Feed loopback events until a timer of `kind` fires.
    pub(crate) async fn until_timer(&mut self, kind: TimerKind) -> Transition {
        self.drive_until(|e| matches!(e, InternalEvent::Timer(f) if f.kind == kind))
            .await
    }

    /// Feed loopback events until a background autosave reports back.
    pub(crate) async fn until_autosave_finished(&mut self) -> Transition {
        self.drive_until(|e| matches!(e, InternalEvent::AutosaveFinished(_)))
            .await
    }
}

pub(crate) fn has(transition: &Transition, effect: &SideEffect) -> bool {
    transition.effects.contains(effect)
}
