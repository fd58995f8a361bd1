//! Save requests and the persistence collaborator.
//!
//! Two kinds of request reach the server: non-final snapshots (autosave and
//! the first phase of a stop) and the finalize request. The server upserts
//! one row per conversation, keyed by the id it returns on the first
//! acknowledgement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::PersistenceConfig;
use crate::error::{LifecycleError, Result};
use crate::transcript::Snapshot;

/// Body of one save call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    pub user_text: String,
    pub ai_text: String,
    pub autosave: bool,
    pub finalize: bool,
    pub confirmed: bool,
    pub close: bool,
    pub reason: String,
}

impl SaveRequest {
    fn base(
        session_id: &str,
        conversation_id: Option<i64>,
        snapshot: &Snapshot,
        reason: &str,
    ) -> Self {
        Self {
            session_id: session_id.to_owned(),
            conversation_id,
            user_text: snapshot.user_text.clone(),
            ai_text: snapshot.ai_text.clone(),
            autosave: false,
            finalize: false,
            confirmed: false,
            close: false,
            reason: reason.to_owned(),
        }
    }

    /// Debounced background snapshot.
    #[must_use]
    pub fn autosave(
        session_id: &str,
        conversation_id: Option<i64>,
        snapshot: &Snapshot,
        reason: &str,
    ) -> Self {
        Self {
            autosave: true,
            ..Self::base(session_id, conversation_id, snapshot, reason)
        }
    }

    /// Non-final snapshot issued before a finalize.
    #[must_use]
    pub fn snapshot(
        session_id: &str,
        conversation_id: Option<i64>,
        snapshot: &Snapshot,
        reason: &str,
    ) -> Self {
        Self::base(session_id, conversation_id, snapshot, reason)
    }

    /// Confirmed, closing finalize request.
    #[must_use]
    pub fn finalize(
        session_id: &str,
        conversation_id: Option<i64>,
        snapshot: &Snapshot,
        reason: &str,
    ) -> Self {
        Self {
            finalize: true,
            confirmed: true,
            close: true,
            ..Self::base(session_id, conversation_id, snapshot, reason)
        }
    }

    /// A finalize request must always carry `confirmed`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        !self.finalize || self.confirmed
    }
}

/// Server acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveAck {
    pub ok: bool,
    pub id: Option<i64>,
}

#[derive(Deserialize)]
struct RawAck {
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    id: Option<i64>,
}

impl From<RawAck> for SaveAck {
    fn from(raw: RawAck) -> Self {
        let ok = raw
            .ok
            .unwrap_or_else(|| raw.status.as_deref() == Some("ok"));
        Self { ok, id: raw.id }
    }
}

impl SaveAck {
    /// Parse either `{"ok": true, "id": 1}` or `{"status": "ok", "id": 1, ...}`.
    ///
    /// # Errors
    ///
    /// Returns an error if `body` is not a JSON object of either shape.
    pub fn parse(body: &str) -> Result<Self> {
        let raw: RawAck = serde_json::from_str(body)?;
        Ok(raw.into())
    }
}

/// Persistence collaborator: one synchronous request/acknowledgement per save.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn save(&self, request: &SaveRequest) -> Result<SaveAck>;
}

/// Posts save requests as JSON to the conversation server.
#[derive(Debug, Clone)]
pub struct HttpConversationStore {
    client: reqwest::Client,
    url: String,
}

impl HttpConversationStore {
    /// Build a store for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &PersistenceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LifecycleError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.save_url(),
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ConversationStore for HttpConversationStore {
    async fn save(&self, request: &SaveRequest) -> Result<SaveAck> {
        if !request.is_consistent() {
            return Err(LifecycleError::Persistence(
                "refusing to send finalize request without confirmation".to_owned(),
            ));
        }

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| LifecycleError::Persistence(format!("save request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LifecycleError::Persistence(format!("failed to read save response: {e}")))?;

        if !status.is_success() {
            return Err(LifecycleError::Persistence(format!(
                "save rejected with HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        SaveAck::parse(&body)
            .map_err(|e| LifecycleError::Persistence(format!("invalid save response: {e}")))
    }
}
