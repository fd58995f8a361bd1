//! Newline-delimited JSON driver for the lifecycle controller.
//!
//! Reads [`BridgeCommand`] lines from an input stream, feeds them to a
//! [`LifecycleController`] together with its loopback events, and writes
//! [`BridgeOutput`] lines to the output stream. The transport process on the
//! other side forwards `instruction` lines to the remote model and renders
//! `notice` and `transcript` lines for observers.
//!
//! The output stream is reserved for the protocol; diagnostics go to tracing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::controller::LifecycleController;
use crate::error::{LifecycleError, Result};
use crate::events::{ChannelModel, LifecycleEvent, LifecycleNotice, Transition, TransportEvent};
use crate::persistence::ConversationStore;
use crate::tool_call::{FINALIZE_TOOL_DIRECTIVE, finalize_tool_definition};

const DEFAULT_STOP_REASON: &str = "user_stop";
const INPUT_CLOSED_REASON: &str = "input_closed";

/// One input line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum BridgeCommand {
    /// Begin a session. A missing id gets a fresh UUID.
    Start {
        #[serde(default)]
        session_id: Option<String>,
    },
    Stop {
        #[serde(default)]
        reason: Option<String>,
    },
    Event { event: TransportEvent },
    /// Ask for the current session's transcript as `User:` / `AI:` lines.
    Transcript,
}

/// One output line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeOutput {
    /// Written once at startup so the transport can configure the remote model.
    ToolDefinition { tool: Value, directive: String },
    Notice { notice: LifecycleNotice },
    /// Advisory text to forward to the remote model.
    Instruction { text: String },
    Transition { transition: Transition },
    Transcript { session_id: String, text: String },
    Error { message: String },
}

struct Bridge<W> {
    controller: LifecycleController,
    instructions: mpsc::UnboundedReceiver<String>,
    notices: broadcast::Receiver<LifecycleNotice>,
    output: W,
}

impl<W: AsyncWrite + Unpin> Bridge<W> {
    async fn write(&mut self, out: &BridgeOutput) -> Result<()> {
        let json = serde_json::to_string(out)?;
        self.output
            .write_all(json.as_bytes())
            .await
            .map_err(|e| LifecycleError::Channel(format!("failed to write output: {e}")))?;
        self.output
            .write_all(b"\n")
            .await
            .map_err(|e| LifecycleError::Channel(format!("failed to write newline: {e}")))?;
        self.output
            .flush()
            .await
            .map_err(|e| LifecycleError::Channel(format!("failed to flush output: {e}")))?;
        Ok(())
    }

    /// Handle one event, then write everything it produced in order:
    /// instructions, notices, and finally the transition itself.
    async fn dispatch(&mut self, event: LifecycleEvent) -> Result<()> {
        let transition = self.controller.handle(event).await;

        while let Ok(text) = self.instructions.try_recv() {
            self.write(&BridgeOutput::Instruction { text }).await?;
        }
        loop {
            match self.notices.try_recv() {
                Ok(notice) => self.write(&BridgeOutput::Notice { notice }).await?,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(lagged = n, "notice reader lagged; some notices were dropped");
                }
                Err(_) => break,
            }
        }

        if !transition.effects.is_empty() || transition.state_changed() {
            self.write(&BridgeOutput::Transition { transition }).await?;
        }
        Ok(())
    }

    async fn write_transcript(&mut self) -> Result<()> {
        let out = match self.controller.session() {
            Some(session) => BridgeOutput::Transcript {
                session_id: session.session_id().to_owned(),
                text: session.transcript.interleaved(),
            },
            None => BridgeOutput::Error {
                message: "no active session".to_owned(),
            },
        };
        self.write(&out).await
    }

    async fn on_line(&mut self, line: &str) -> Result<()> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let command: BridgeCommand = match serde_json::from_str(trimmed) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, raw_line = %trimmed, "failed to parse bridge command");
                return self
                    .write(&BridgeOutput::Error {
                        message: format!("failed to parse command: {e}"),
                    })
                    .await;
            }
        };
        let event = match command {
            BridgeCommand::Start { session_id } => LifecycleEvent::Start {
                session_id: session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            },
            BridgeCommand::Stop { reason } => LifecycleEvent::Stop {
                reason: reason.unwrap_or_else(|| DEFAULT_STOP_REASON.to_owned()),
            },
            BridgeCommand::Event { event } => LifecycleEvent::Transport(event),
            BridgeCommand::Transcript => return self.write_transcript().await,
        };
        self.dispatch(event).await
    }
}

/// Run the bridge until `input` reaches EOF.
///
/// On EOF the current session, if any, is stopped (and persisted) before
/// returning.
///
/// # Errors
///
/// Returns an error if reading input or writing output fails.
pub async fn run_bridge<R, W>(
    config: LifecycleConfig,
    store: Arc<dyn ConversationStore>,
    input: R,
    output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (instruction_tx, instructions) = mpsc::unbounded_channel();
    let model = Arc::new(ChannelModel::new(instruction_tx));
    let (controller, mut internal_rx) = LifecycleController::new(config, store, model);
    let notices = controller.subscribe();
    let mut bridge = Bridge {
        controller,
        instructions,
        notices,
        output,
    };

    bridge
        .write(&BridgeOutput::ToolDefinition {
            tool: finalize_tool_definition(),
            directive: FINALIZE_TOOL_DIRECTIVE.to_owned(),
        })
        .await?;

    let mut lines = input.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line
                    .map_err(|e| LifecycleError::Channel(format!("failed to read input: {e}")))?;
                match line {
                    Some(line) => bridge.on_line(&line).await?,
                    None => {
                        info!("input closed; shutting down bridge");
                        break;
                    }
                }
            }
            Some(internal) = internal_rx.recv() => {
                debug!(?internal, "loopback event");
                bridge.dispatch(LifecycleEvent::Internal(internal)).await?;
            }
        }
    }

    if bridge.controller.session().is_some() {
        bridge
            .dispatch(LifecycleEvent::Stop {
                reason: INPUT_CLOSED_REASON.to_owned(),
            })
            .await?;
    }
    Ok(())
}
