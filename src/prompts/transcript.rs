//! Transcript types and agent chat-log parsing.
//!
//! The agent appends one JSON object per completed turn to a JSONL file
//! inside the drone; the hub tails that file, assigns dense turn numbers,
//! and reconciles pending prompts against the `id` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a chat's transcript log lives inside the drone.
#[must_use]
pub fn chat_log_path(chat: &str) -> String {
    format!("/work/.dronehub/chats/{chat}/transcript.jsonl")
}

/// One completed turn in a chat, as served to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptItem {
    /// Dense, monotonic position within the chat, starting at 1.
    pub turn: u64,

    /// When the prompt was submitted.
    pub prompt_at: DateTime<Utc>,

    /// When the agent finished the turn.
    pub completed_at: DateTime<Utc>,

    /// The prompt id this turn answers, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The prompt text.
    pub prompt: String,

    /// Agent session the turn ran in.
    pub session: String,

    /// Path of the raw agent log for this turn, inside the drone.
    pub log_path: String,

    /// Whether the turn completed without error.
    pub ok: bool,

    /// Failure detail when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The agent's final output for the turn.
    pub output: String,
}

/// One line of the agent's chat log, before the hub assigns a turn number.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogTurn {
    /// Prompt id echoed by the agent, when the hub supplied one.
    #[serde(default)]
    pub id: Option<String>,

    /// The prompt text.
    #[serde(default)]
    pub prompt: String,

    /// When the prompt was submitted.
    #[serde(default = "Utc::now")]
    pub prompt_at: DateTime<Utc>,

    /// When the turn completed.
    #[serde(default = "Utc::now")]
    pub completed_at: DateTime<Utc>,

    /// Agent session name.
    #[serde(default)]
    pub session: String,

    /// Raw log path for the turn.
    #[serde(default)]
    pub log_path: String,

    /// Whether the turn succeeded.
    #[serde(default = "default_ok")]
    pub ok: bool,

    /// Failure detail.
    #[serde(default)]
    pub error: Option<String>,

    /// Final output text.
    #[serde(default)]
    pub output: String,
}

fn default_ok() -> bool {
    true
}

impl LogTurn {
    /// Attach a turn number, producing the client-facing item.
    #[must_use]
    pub fn into_item(self, turn: u64) -> TranscriptItem {
        TranscriptItem {
            turn,
            prompt_at: self.prompt_at,
            completed_at: self.completed_at,
            id: self.id,
            prompt: self.prompt,
            session: self.session,
            log_path: self.log_path,
            ok: self.ok,
            error: self.error,
            output: self.output,
        }
    }
}

/// Split a chunk of chat-log bytes into complete JSON lines.
///
/// Returns the parsed turns and the byte length consumed; a trailing
/// partial line is left for the next poll. Unparseable complete lines are
/// skipped (and counted as consumed) so one bad line cannot wedge the
/// cursor forever.
#[must_use]
pub fn parse_log_chunk(chunk: &str) -> (Vec<LogTurn>, u64) {
    let mut turns = Vec::new();
    let mut consumed = 0u64;

    let mut rest = chunk;
    while let Some(newline) = rest.find('\n') {
        let line = &rest[..newline];
        consumed += newline as u64 + 1;
        rest = &rest[newline + 1..];

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogTurn>(line) {
            Ok(turn) => turns.push(turn),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable transcript line");
            }
        }
    }

    (turns, consumed)
}
