//! Per-call session record.

use crate::transcript::Transcript;

/// One realtime call. Created at session start, discarded at stop.
#[derive(Debug)]
pub struct ConversationSession {
    session_id: String,
    conversation_id: Option<i64>,
    pub transcript: Transcript,
    finalized: bool,
}

impl ConversationSession {
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            conversation_id: None,
            transcript: Transcript::new(),
            finalized: false,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Server-assigned upsert key, once the first save was acknowledged.
    #[must_use]
    pub fn conversation_id(&self) -> Option<i64> {
        self.conversation_id
    }

    /// Record the id from an acknowledgement. The first id wins.
    pub fn latch_conversation_id(&mut self, id: Option<i64>) {
        if self.conversation_id.is_none() {
            self.conversation_id = id;
        }
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Latch after a finalize request was acknowledged.
    pub fn mark_finalized(&mut self) {
        self.finalized = true;
    }
}
