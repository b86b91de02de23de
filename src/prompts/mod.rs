//! Prompt Dispatcher: per-(drone, chat) FIFO prompt delivery with pending
//! tracking and transcript reconciliation.
//!
//! Each chat has one lock spanning the whole accept-and-deliver sequence:
//! the pending push, the `session_send` + `session_type(Enter)` pair, and
//! the sent/failed update. Concurrent sends never interleave on the agent
//! session and at most one pending prompt per (drone, chat) is in
//! `sending` at any instant. Pending prompts are reconciled against
//! transcript turns by id match, never by position.

pub mod transcript;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::engine::{ContainerEngine, CopyOptions, SessionKey, TypeInput};
use crate::error::{HubError, HubResult};
use crate::registry::{HubPhase, Registry};

pub use transcript::{TranscriptItem, chat_log_path};

/// Pending entries kept per chat (most recent).
pub const PENDING_LIMIT: usize = 60;

/// Minimum age before a pending prompt may be unstuck.
pub const UNSTICK_MIN_AGE: Duration = Duration::from_secs(120);

/// Attachment policy: images only, bounded count and sizes.
pub const MAX_ATTACHMENTS: usize = 8;
/// Per-image size cap.
pub const MAX_ATTACHMENT_BYTES: usize = 6 * 1024 * 1024;
/// Total attachment size cap per send.
pub const MAX_TOTAL_ATTACHMENT_BYTES: usize = 20 * 1024 * 1024;

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "svg", "avif", "tiff",
];

/// Server-side state of a pending prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingState {
    /// Client-side optimistic state; the server never produces it.
    Queued,
    /// Accepted, write to the agent session in progress.
    Sending,
    /// Written to the agent session; waiting for its turn to appear.
    Sent,
    /// The write failed.
    Failed,
}

/// A prompt accepted by the hub whose completion turn has not appeared yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPrompt {
    /// Fresh id assigned at acceptance.
    pub id: String,
    /// When the prompt was accepted.
    pub at: DateTime<Utc>,
    /// The prompt text.
    pub prompt: String,
    /// Current state.
    pub state: PendingState,
    /// Last state change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Failure detail when `state` is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One image attached to a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Client-supplied file name.
    pub name: String,
    /// Declared mime type, if any.
    #[serde(default)]
    pub mime: Option<String>,
    /// Base64-encoded content.
    pub data: String,
}

/// Request body for a prompt send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPrompt {
    /// The prompt text; may be empty when attachments are present.
    #[serde(default)]
    pub prompt: String,
    /// Attached images.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Acceptance receipt for a prompt send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    /// The assigned prompt id.
    pub prompt_id: String,
    /// Always true; acceptance does not mean completion.
    pub accepted: bool,
}

#[derive(Debug, Default)]
struct ChatState {
    /// Serialises agent-session writes for this chat.
    write_lock: tokio::sync::Mutex<()>,
    pending: std::sync::Mutex<Vec<PendingPrompt>>,
    transcript: std::sync::Mutex<Vec<TranscriptItem>>,
    /// Bytes of the chat log already consumed.
    log_cursor: std::sync::Mutex<u64>,
}

/// The dispatcher. One per hub process.
pub struct PromptDispatcher {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<Registry>,
    chats: DashMap<(String, String), Arc<ChatState>>,
}

impl std::fmt::Debug for PromptDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptDispatcher").finish_non_exhaustive()
    }
}

/// Name of the agent session carrying a chat.
#[must_use]
pub fn agent_session_name(chat: &str) -> String {
    format!("agent-{chat}")
}

impl PromptDispatcher {
    /// Build a dispatcher over the engine and registry.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>, registry: Arc<Registry>) -> Self {
        Self {
            engine,
            registry,
            chats: DashMap::new(),
        }
    }

    fn chat(&self, drone_id: &str, chat: &str) -> Arc<ChatState> {
        self.chats
            .entry((drone_id.to_owned(), chat.to_owned()))
            .or_default()
            .clone()
    }

    /// Accept and deliver a prompt.
    pub async fn send(
        &self,
        drone_id: &str,
        chat: &str,
        request: SendPrompt,
    ) -> HubResult<SendReceipt> {
        let drone = self
            .registry
            .get(drone_id)
            .await
            .ok_or_else(|| HubError::not_found(format!("drone {drone_id}")))?;
        if drone.hub_phase != HubPhase::Ready {
            return Err(HubError::StateViolation {
                action: "send prompt".to_owned(),
                phase: drone.hub_phase,
            });
        }
        if request.prompt.trim().is_empty() && request.attachments.is_empty() {
            return Err(HubError::InvalidName {
                reason: "prompt must not be empty without attachments".to_owned(),
            });
        }
        validate_attachments(&request.attachments)?;

        let prompt_id = uuid::Uuid::new_v4().simple().to_string();
        let state = self.chat(drone_id, chat);
        let session = agent_session_name(chat);

        // The chat lock covers the pending push, the session_send + Enter
        // pair, and the sent/failed update: concurrent sends queue here in
        // arrival order, and at most one pending prompt per (drone, chat)
        // is ever in `sending`.
        let write_result = {
            let _guard = state.write_lock.lock().await;

            {
                let mut pending = state.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.push(PendingPrompt {
                    id: prompt_id.clone(),
                    at: Utc::now(),
                    prompt: request.prompt.clone(),
                    state: PendingState::Sending,
                    updated_at: None,
                    error: None,
                });
                let excess = pending.len().saturating_sub(PENDING_LIMIT);
                if excess > 0 {
                    pending.drain(..excess);
                }
            }

            // Containers are addressed by display name; renames keep the
            // engine-side name in sync.
            let result = self
                .deliver(&drone.name, &session, &prompt_id, &request)
                .await;

            let (new_state, error) = match &result {
                Ok(()) => (PendingState::Sent, None),
                Err(e) => (PendingState::Failed, Some(e.to_string())),
            };
            {
                let mut pending = state.pending.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = pending.iter_mut().find(|p| p.id == prompt_id) {
                    entry.state = new_state;
                    entry.updated_at = Some(Utc::now());
                    entry.error = error;
                }
            }
            result
        };
        write_result?;

        tracing::debug!(drone = drone_id, chat, prompt_id = %prompt_id, "prompt dispatched");
        Ok(SendReceipt {
            prompt_id,
            accepted: true,
        })
    }

    /// Write attachments (if any) and the prompt text to the agent session.
    async fn deliver(
        &self,
        container: &str,
        session: &str,
        prompt_id: &str,
        request: &SendPrompt,
    ) -> HubResult<()> {
        let mut text = request.prompt.clone();

        if !request.attachments.is_empty() {
            let scratch = tempfile::tempdir().map_err(|e| {
                HubError::Internal(anyhow::anyhow!("attachment scratch dir: {e}"))
            })?;
            for attachment in &request.attachments {
                let bytes = decode_attachment(attachment)?;
                let safe_name = sanitize_file_name(&attachment.name);
                let host_file = scratch.path().join(&safe_name);
                let mut f = std::fs::File::create(&host_file).map_err(|e| {
                    HubError::Internal(anyhow::anyhow!("writing attachment: {e}"))
                })?;
                f.write_all(&bytes).map_err(|e| {
                    HubError::Internal(anyhow::anyhow!("writing attachment: {e}"))
                })?;

                let dest = format!("/tmp/dronehub/attachments/{prompt_id}/{safe_name}");
                self.engine
                    .copy(container, &host_file, &dest, CopyOptions::default())
                    .await?;
                text.push_str(&format!("\n[image: {dest}]"));
            }
        }

        self.engine.session_send(container, session, &text).await?;
        self.engine
            .session_type(container, session, TypeInput::key(SessionKey::Enter))
            .await
    }

    /// The pending list: last [`PENDING_LIMIT`] entries sorted by `at`.
    pub async fn pending(&self, drone_id: &str, chat: &str) -> Vec<PendingPrompt> {
        let state = self.chat(drone_id, chat);
        let mut pending = state
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        pending.sort_by(|a, b| a.at.cmp(&b.at));
        pending
    }

    /// Drop a stuck prompt, emitting a synthetic terminating turn.
    ///
    /// Only allowed when the prompt has been `sending` or `sent` for at
    /// least [`UNSTICK_MIN_AGE`].
    pub async fn unstick(&self, drone_id: &str, chat: &str, prompt_id: &str) -> HubResult<()> {
        let drone = self
            .registry
            .get(drone_id)
            .await
            .ok_or_else(|| HubError::not_found(format!("drone {drone_id}")))?;
        let state = self.chat(drone_id, chat);

        let entry = {
            let pending = state.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.iter().find(|p| p.id == prompt_id).cloned()
        }
        .ok_or_else(|| HubError::not_found(format!("pending prompt {prompt_id}")))?;

        if !matches!(entry.state, PendingState::Sending | PendingState::Sent) {
            return Err(HubError::StateViolation {
                action: format!("unstick a {:?} prompt", entry.state),
                phase: drone.hub_phase,
            });
        }
        let age = Utc::now().signed_duration_since(entry.at);
        if age.to_std().unwrap_or(Duration::ZERO) < UNSTICK_MIN_AGE {
            return Err(HubError::StateViolation {
                action: "unstick a prompt before its timeout".to_owned(),
                phase: drone.hub_phase,
            });
        }

        let now = Utc::now();
        self.append_turn(
            &state,
            transcript::LogTurn {
                id: Some(entry.id.clone()),
                prompt: entry.prompt.clone(),
                prompt_at: entry.at,
                completed_at: now,
                session: agent_session_name(chat),
                log_path: chat_log_path(chat),
                ok: false,
                error: Some("prompt unstuck before the agent completed it".to_owned()),
                output: String::new(),
            },
        );
        // append_turn reconciles the pending entry away by id.

        tracing::info!(drone = drone_id, chat, prompt_id, "pending prompt unstuck");
        Ok(())
    }

    /// The transcript, optionally only turns after `since_turn`.
    pub async fn transcript(
        &self,
        drone_id: &str,
        chat: &str,
        since_turn: Option<u64>,
    ) -> Vec<TranscriptItem> {
        let state = self.chat(drone_id, chat);
        let transcript = state
            .transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match since_turn {
            None => transcript.clone(),
            Some(n) => transcript.iter().filter(|t| t.turn > n).cloned().collect(),
        }
    }

    /// Poll the drone's chat log and fold new turns into the transcript.
    ///
    /// Called periodically by the orchestrator's watcher task for each chat
    /// of a ready drone. Reads are incremental: only bytes past the stored
    /// cursor are fetched.
    pub async fn poll_chat_log(&self, drone_id: &str, chat: &str) -> HubResult<usize> {
        let drone = self
            .registry
            .get(drone_id)
            .await
            .ok_or_else(|| HubError::not_found(format!("drone {drone_id}")))?;
        let state = self.chat(drone_id, chat);
        let cursor = *state.log_cursor.lock().unwrap_or_else(|e| e.into_inner());
        let path = chat_log_path(chat);

        let out = self
            .engine
            .exec(
                &drone.name,
                "tail",
                &["-c".to_owned(), format!("+{}", cursor + 1), path],
                None,
            )
            .await?;
        if !out.success() {
            // Missing log file just means no turns yet.
            return Ok(0);
        }

        let (turns, consumed) = transcript::parse_log_chunk(&out.stdout);
        if consumed > 0 {
            *state.log_cursor.lock().unwrap_or_else(|e| e.into_inner()) = cursor + consumed;
        }
        let count = turns.len();
        for turn in turns {
            self.append_turn(&state, turn);
        }
        Ok(count)
    }

    /// Append a turn with the next dense number and reconcile pending by id.
    fn append_turn(&self, state: &ChatState, raw: transcript::LogTurn) {
        let item = {
            let mut transcript = state
                .transcript
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let turn = transcript.len() as u64 + 1;
            let item = raw.into_item(turn);
            transcript.push(item.clone());
            item
        };

        if let Some(id) = &item.id {
            let mut pending = state.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.retain(|p| &p.id != id);
        }
    }

    /// Drop all chat state of a deleted drone.
    pub fn gc_drone(&self, drone_id: &str) {
        self.chats.retain(|(id, _), _| id != drone_id);
    }
}

/// Enforce the attachment policy.
fn validate_attachments(attachments: &[Attachment]) -> HubResult<()> {
    if attachments.len() > MAX_ATTACHMENTS {
        return Err(HubError::InvalidName {
            reason: format!("at most {MAX_ATTACHMENTS} attachments per prompt"),
        });
    }
    let mut total = 0usize;
    for attachment in attachments {
        if !is_image(attachment) {
            return Err(HubError::InvalidName {
                reason: format!("attachment {} is not an image", attachment.name),
            });
        }
        // Base64 over-estimates by ~1/3; the decoded check in
        // `decode_attachment` is authoritative, this is the cheap gate.
        let approx = attachment.data.len() / 4 * 3;
        if approx > MAX_ATTACHMENT_BYTES {
            return Err(HubError::InvalidName {
                reason: format!("attachment {} exceeds 6 MiB", attachment.name),
            });
        }
        total += approx;
    }
    if total > MAX_TOTAL_ATTACHMENT_BYTES {
        return Err(HubError::InvalidName {
            reason: "attachments exceed 20 MiB total".to_owned(),
        });
    }
    Ok(())
}

fn is_image(attachment: &Attachment) -> bool {
    if let Some(mime) = &attachment.mime {
        if mime.starts_with("image/") {
            return true;
        }
    }
    let guessed = mime_guess::from_path(&attachment.name).first();
    if let Some(mime) = guessed {
        if mime.type_().as_str() == "image" {
            return true;
        }
    }
    std::path::Path::new(&attachment.name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

fn decode_attachment(attachment: &Attachment) -> HubResult<Vec<u8>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(attachment.data.as_bytes())
        .map_err(|e| HubError::InvalidName {
            reason: format!("attachment {} is not valid base64: {e}", attachment.name),
        })?;
    if bytes.len() > MAX_ATTACHMENT_BYTES {
        return Err(HubError::InvalidName {
            reason: format!("attachment {} exceeds 6 MiB", attachment.name),
        });
    }
    Ok(bytes)
}

/// Keep only the final path component and drop anything shell-hostile.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    if cleaned.is_empty() {
        "attachment".to_owned()
    } else {
        cleaned
    }
}
