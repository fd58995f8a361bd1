//! Streamed transcript accumulation.
//!
//! The transport delivers transcript text as per-speaker fragments followed by
//! a turn-completion marker. [`Transcript`] appends every fragment, keeps the
//! text of the turn in progress for each speaker, and counts completed turns
//! with one shared counter.

use serde::{Deserialize, Serialize};

/// Appended to a speaker's buffer at the end of each turn.
pub const TURN_SEPARATOR: char = '\n';

/// Conversation participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A turn that just completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTurn {
    pub speaker: Speaker,
    /// Text of this turn only.
    pub text: String,
    /// Shared turn counter after this turn was counted.
    pub turn_index: u64,
}

/// Point-in-time copy of both transcript buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub user_text: String,
    pub ai_text: String,
}

impl Snapshot {
    /// Whether neither speaker has said anything yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.user_text.trim().is_empty() && self.ai_text.trim().is_empty()
    }

    /// Content hash used to skip saving an unchanged snapshot twice.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.user_text.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.ai_text.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Append-only user/assistant transcript with turn bookkeeping.
#[derive(Debug, Default)]
pub struct Transcript {
    user: String,
    assistant: String,
    user_turn: String,
    assistant_turn: String,
    turn_index: u64,
}

impl Transcript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn buffers_mut(&mut self, speaker: Speaker) -> (&mut String, &mut String) {
        match speaker {
            Speaker::User => (&mut self.user, &mut self.user_turn),
            Speaker::Assistant => (&mut self.assistant, &mut self.assistant_turn),
        }
    }

    /// Append a streamed fragment to `speaker`'s buffer.
    pub fn on_delta(&mut self, speaker: Speaker, fragment: &str) {
        let (full, turn) = self.buffers_mut(speaker);
        full.push_str(fragment);
        turn.push_str(fragment);
    }

    /// Close the current turn of `speaker`.
    ///
    /// `final_text` is used only when no fragments were streamed for this turn
    /// (some transports deliver user transcripts in one piece).
    pub fn on_turn_complete(&mut self, speaker: Speaker, final_text: Option<&str>) -> CompletedTurn {
        let (full, turn) = self.buffers_mut(speaker);
        if turn.is_empty()
            && let Some(text) = final_text
        {
            full.push_str(text);
            turn.push_str(text);
        }
        full.push(TURN_SEPARATOR);
        let text = std::mem::take(turn);
        self.turn_index += 1;
        CompletedTurn {
            speaker,
            text,
            turn_index: self.turn_index,
        }
    }

    /// Text streamed so far for `speaker`'s turn in progress.
    #[must_use]
    pub fn current_turn(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::User => &self.user_turn,
            Speaker::Assistant => &self.assistant_turn,
        }
    }

    #[must_use]
    pub fn turn_index(&self) -> u64 {
        self.turn_index
    }

    #[must_use]
    pub fn user_text(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn assistant_text(&self) -> &str {
        &self.assistant
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            user_text: self.user.clone(),
            ai_text: self.assistant.clone(),
        }
    }

    /// Render as alternating `User:` / `AI:` lines.
    #[must_use]
    pub fn interleaved(&self) -> String {
        interleave(&self.user, &self.assistant)
    }
}

fn split_turns(text: &str) -> Vec<&str> {
    text.split(TURN_SEPARATOR)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Pair user and assistant turns by index, user first.
fn interleave(user_text: &str, ai_text: &str) -> String {
    let user_turns = split_turns(user_text);
    let ai_turns = split_turns(ai_text);
    let n = user_turns.len().max(ai_turns.len());
    let mut parts = Vec::with_capacity(user_turns.len() + ai_turns.len());
    for i in 0..n {
        if let Some(turn) = user_turns.get(i) {
            parts.push(format!("User: {turn}"));
        }
        if let Some(turn) = ai_turns.get(i) {
            parts.push(format!("AI: {turn}"));
        }
    }
    parts.join("\n")
}
