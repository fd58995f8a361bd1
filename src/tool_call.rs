//! Termination tool call buffering and tolerant argument parsing.
//!
//! The remote model invokes `finalize_conversation` as a function call whose
//! JSON arguments arrive as deltas keyed by call id. Arguments are untrusted:
//! truncated or malformed JSON degrades to empty arguments, never to an error.

use std::collections::HashMap;

use serde_json::Value;

/// Function name the remote model calls to end the conversation.
pub const FINALIZE_TOOL_NAME: &str = "finalize_conversation";

/// Instruction appended to the remote model's session prompt.
pub const FINALIZE_TOOL_DIRECTIVE: &str = "When the user indicates they are ready to end \
(e.g. 'that's all', 'no thanks', 'bye', 'end the conversation'), first ask them to confirm. \
Only after they explicitly confirm, call finalize_conversation with a short 'reason' and \
'confirmed': true.";

/// JSON function-tool definition for [`FINALIZE_TOOL_NAME`].
#[must_use]
pub fn finalize_tool_definition() -> Value {
    serde_json::json!({
        "type": "function",
        "name": FINALIZE_TOOL_NAME,
        "description": "Persist final state when the user has confirmed they want to end the conversation.",
        "parameters": {
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Why the session is finishing"
                },
                "confirmed": {
                    "type": "boolean",
                    "description": "True only if the user explicitly confirmed ending"
                }
            },
            "required": ["reason"],
            "additionalProperties": false
        }
    })
}

/// Arguments of a finalize call. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeArgs {
    pub reason: Option<String>,
    pub confirmed: Option<bool>,
}

impl FinalizeArgs {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let reason = obj
            .get("reason")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);
        let confirmed = match obj.get("confirmed") {
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        };
        Some(Self { reason, confirmed })
    }
}

/// First balanced `{...}` in `text`, ignoring braces inside string literals.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let (mut depth, mut quoted, mut escaped) = (0usize, false, false);
    for (offset, &byte) in text.as_bytes()[start..].iter().enumerate() {
        if quoted {
            match (escaped, byte) {
                (true, _) => escaped = false,
                (false, b'\\') => escaped = true,
                (false, b'"') => quoted = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => quoted = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return text.get(start..=start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_object(candidate: &str) -> Option<FinalizeArgs> {
    serde_json::from_str::<Value>(candidate)
        .ok()
        .and_then(|v| FinalizeArgs::from_value(&v))
}

/// Best-effort parse of finalize arguments.
///
/// Tries the whole string, then the outermost balanced object, then the text
/// up to the last closing brace. Anything else yields empty arguments.
#[must_use]
pub fn parse_finalize_args(raw: &str) -> FinalizeArgs {
    let raw = raw.trim();
    if raw.is_empty() {
        return FinalizeArgs::default();
    }
    if let Some(args) = parse_object(raw) {
        return args;
    }
    if let Some(args) = balanced_object(raw).and_then(parse_object) {
        return args;
    }
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}'))
        && start < end
        && let Some(args) = parse_object(&raw[start..=end])
    {
        return args;
    }
    tracing::debug!(raw_len = raw.len(), "unparseable finalize arguments; using defaults");
    FinalizeArgs::default()
}

/// A tool call whose arguments are complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments_json: String,
}

impl CompletedToolCall {
    #[must_use]
    pub fn is_finalize(&self) -> bool {
        self.name == FINALIZE_TOOL_NAME
    }

    #[must_use]
    pub fn finalize_args(&self) -> FinalizeArgs {
        parse_finalize_args(&self.arguments_json)
    }
}

#[derive(Debug)]
struct ToolCallInProgress {
    name: String,
    args_buffer: String,
}

/// Accumulates argument deltas per call id until the call completes.
#[derive(Debug, Default)]
pub struct ToolCallBuffer {
    in_progress: HashMap<String, ToolCallInProgress>,
}

impl ToolCallBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, call_id: &str, name: &str) {
        self.in_progress.insert(
            call_id.to_owned(),
            ToolCallInProgress {
                name: name.to_owned(),
                args_buffer: String::new(),
            },
        );
    }

    /// Append an argument fragment. Fragments for unknown call ids are dropped.
    pub fn push_args(&mut self, call_id: &str, fragment: &str) {
        if let Some(call) = self.in_progress.get_mut(call_id) {
            call.args_buffer.push_str(fragment);
        }
    }

    /// Complete a call.
    ///
    /// Full `arguments` supplied by the completion event win over the buffer.
    /// A call that was never started is accepted when the completion names it.
    pub fn finish(
        &mut self,
        call_id: &str,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Option<CompletedToolCall> {
        let buffered = self.in_progress.remove(call_id);
        let name = name
            .map(str::to_owned)
            .or_else(|| buffered.as_ref().map(|c| c.name.clone()))?;
        let arguments_json = match arguments {
            Some(full) => full.to_owned(),
            None => buffered.map(|c| c.args_buffer).unwrap_or_default(),
        };
        Some(CompletedToolCall {
            call_id: call_id.to_owned(),
            name,
            arguments_json,
        })
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.in_progress.len()
    }

    pub fn clear(&mut self) {
        self.in_progress.clear();
    }
}
