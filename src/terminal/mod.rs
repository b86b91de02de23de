//! Terminal Stream Hub: engine-backed terminal sessions per (drone, chat).
//!
//! Each session has a single server-side writer task; all client inputs for
//! one session funnel through its queue in arrival order, get coalesced,
//! and are retried with backoff until the write lands or the session
//! closes. Reads are addressed by cumulative byte offset and served either
//! over WebSocket or the polling endpoint.

pub mod coalesce;
/// WebSocket transport for terminal sessions.
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::{ContainerEngine, ReadOptions, SessionChunk};
use crate::error::{HubError, HubResult};
use crate::registry::Registry;

pub use ws::terminal_stream_handler;

/// Sessions allowed per drone.
pub const MAX_SESSIONS_PER_DRONE: usize = 8;

/// Deadline for one WebSocket send.
pub const WS_WRITE_TIMEOUT: Duration = Duration::from_secs(120);

/// Command queue depth per session; input beyond this backpressures.
const INPUT_QUEUE_DEPTH: usize = 64;

/// First retry delay for failed input writes.
const INPUT_RETRY_BASE: Duration = Duration::from_millis(100);

/// Retry delay cap for failed input writes.
const INPUT_RETRY_CAP: Duration = Duration::from_millis(6000);

/// What runs inside a terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalMode {
    /// Interactive shell.
    Shell,
    /// The chat's agent process.
    Agent,
}

/// Parameters for opening (or reusing) a session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequest {
    /// Session mode.
    pub mode: TerminalMode,
    /// Chat the session belongs to.
    #[serde(default = "default_chat")]
    pub chat: String,
    /// Working directory for new shell sessions.
    #[serde(default)]
    pub cwd: Option<String>,
}

fn default_chat() -> String {
    "default".to_owned()
}

#[derive(Debug)]
struct SessionState {
    name: String,
    mode: TerminalMode,
    chat: String,
    cwd: Option<String>,
    input_tx: mpsc::Sender<Vec<u8>>,
    /// Last client-requested size; the engine session has no resize
    /// control, so this is informational.
    size: std::sync::Mutex<Option<(u16, u16)>>,
    cancel: CancellationToken,
}

/// The process-wide terminal hub.
pub struct TerminalHub {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<Registry>,
    agent_command: Vec<String>,
    sessions: DashMap<(String, String), Arc<SessionState>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for TerminalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalHub")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl TerminalHub {
    /// Build the hub.
    #[must_use]
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<Registry>,
        agent_command: Vec<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            registry,
            agent_command,
            sessions: DashMap::new(),
            shutdown,
        }
    }

    /// Open a terminal session, reusing an existing one for the same
    /// (mode, chat) tuple. Returns the session name.
    pub async fn open(&self, drone_id: &str, request: OpenRequest) -> HubResult<String> {
        let drone = self
            .registry
            .get(drone_id)
            .await
            .ok_or_else(|| HubError::not_found(format!("drone {drone_id}")))?;

        let name = match request.mode {
            TerminalMode::Shell => format!("shell-{}", request.chat),
            TerminalMode::Agent => crate::prompts::agent_session_name(&request.chat),
        };

        let key = (drone_id.to_owned(), name.clone());
        if self.sessions.contains_key(&key) {
            return Ok(name);
        }

        let open_count = self
            .sessions
            .iter()
            .filter(|entry| entry.key().0 == drone_id)
            .count();
        if open_count >= MAX_SESSIONS_PER_DRONE {
            return Err(HubError::Internal(anyhow::anyhow!(
                "drone {drone_id} already has {MAX_SESSIONS_PER_DRONE} terminal sessions"
            )));
        }

        let (cmd, args): (String, Vec<String>) = match request.mode {
            TerminalMode::Shell => match &request.cwd {
                Some(cwd) => {
                    let quoted = cwd.replace('\'', "'\\''");
                    (
                        "bash".to_owned(),
                        vec![
                            "-lc".to_owned(),
                            format!("cd '{quoted}' && exec bash -l"),
                        ],
                    )
                }
                None => ("bash".to_owned(), vec!["-l".to_owned()]),
            },
            TerminalMode::Agent => {
                let mut command = self.agent_command.clone();
                if command.is_empty() {
                    command.push("claude".to_owned());
                }
                let cmd = command.remove(0);
                (cmd, command)
            }
        };
        self.engine
            .session_start(&drone.name, &name, &cmd, &args, true)
            .await?;

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let cancel = self.shutdown.child_token();
        let state = Arc::new(SessionState {
            name: name.clone(),
            mode: request.mode,
            chat: request.chat,
            cwd: request.cwd,
            input_tx,
            size: std::sync::Mutex::new(None),
            cancel: cancel.clone(),
        });

        tokio::spawn(writer_task(
            Arc::clone(&self.engine),
            drone.name.clone(),
            name.clone(),
            input_rx,
            cancel,
        ));

        self.sessions.insert(key, state);
        tracing::info!(drone = drone_id, session = %name, "terminal session opened");
        Ok(name)
    }

    /// Read session output by offset or tail.
    pub async fn read(
        &self,
        drone_id: &str,
        session: &str,
        opts: ReadOptions,
    ) -> HubResult<SessionChunk> {
        let drone = self
            .registry
            .get(drone_id)
            .await
            .ok_or_else(|| HubError::not_found(format!("drone {drone_id}")))?;
        self.session(drone_id, session)?;
        self.engine.session_read(&drone.name, session, opts).await
    }

    /// Queue client input for the session's writer task.
    ///
    /// Inputs from all clients merge into one stream ordered by server
    /// arrival time; a full queue backpressures the caller.
    pub async fn send_input(&self, drone_id: &str, session: &str, data: Vec<u8>) -> HubResult<()> {
        let state = self.session(drone_id, session)?;
        state
            .input_tx
            .send(data)
            .await
            .map_err(|_| HubError::not_found(format!("terminal session {session}")))
    }

    /// Record the client's requested terminal size.
    pub fn record_resize(&self, drone_id: &str, session: &str, cols: u16, rows: u16) {
        if let Ok(state) = self.session(drone_id, session) {
            *state.size.lock().unwrap_or_else(|e| e.into_inner()) = Some((cols, rows));
            tracing::debug!(
                drone = drone_id,
                session,
                cols,
                rows,
                "terminal resize recorded (engine sessions have no resize control)"
            );
        }
    }

    /// Terminal sessions currently tracked for a drone.
    #[must_use]
    pub fn sessions_for(&self, drone_id: &str) -> Vec<TerminalSessionInfo> {
        let mut sessions: Vec<TerminalSessionInfo> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().0 == drone_id)
            .map(|entry| TerminalSessionInfo {
                session_name: entry.name.clone(),
                mode: entry.mode,
                chat: entry.chat.clone(),
                cwd: entry.cwd.clone(),
                size: *entry.size.lock().unwrap_or_else(|e| e.into_inner()),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_name.cmp(&b.session_name));
        sessions
    }

    /// Tear down all sessions of a drone (delete path).
    pub fn close_drone(&self, drone_id: &str) {
        self.sessions.retain(|(id, _), state| {
            if id == drone_id {
                state.cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    fn session(&self, drone_id: &str, session: &str) -> HubResult<Arc<SessionState>> {
        self.sessions
            .get(&(drone_id.to_owned(), session.to_owned()))
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| HubError::not_found(format!("terminal session {session}")))
    }
}

/// A tracked session, for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSessionInfo {
    /// Engine session name.
    pub session_name: String,
    /// Session mode.
    pub mode: TerminalMode,
    /// Owning chat.
    pub chat: String,
    /// Working directory, when one was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Last client-requested (cols, rows).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<(u16, u16)>,
}

/// The single writer for one session: coalesces queued input and retries
/// failed writes with exponential backoff until the session closes.
async fn writer_task(
    engine: Arc<dyn ContainerEngine>,
    container: String,
    session: String,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    use coalesce::{COALESCE_WINDOW, InputCoalescer, PushOutcome};

    let mut coalescer = InputCoalescer::new();
    let mut deadline = tokio::time::Instant::now();

    loop {
        let flush_now = tokio::select! {
            data = input_rx.recv() => {
                match data {
                    Some(data) => {
                        if coalescer.is_empty() {
                            deadline = tokio::time::Instant::now() + COALESCE_WINDOW;
                        }
                        coalescer.push(&data) == PushOutcome::FlushNow
                    }
                    None => {
                        flush(&*engine, &container, &session, &mut coalescer, &cancel).await;
                        break;
                    }
                }
            }
            () = tokio::time::sleep_until(deadline), if !coalescer.is_empty() => true,
            () = cancel.cancelled() => break,
        };

        if flush_now {
            flush(&*engine, &container, &session, &mut coalescer, &cancel).await;
        }
    }
    tracing::debug!(container = %container, session = %session, "terminal writer stopped");
}

/// Write everything buffered, in order, retrying each chunk until it lands
/// or the session is cancelled.
async fn flush(
    engine: &dyn ContainerEngine,
    container: &str,
    session: &str,
    coalescer: &mut coalesce::InputCoalescer,
    cancel: &CancellationToken,
) {
    for chunk in coalescer.drain_chunks() {
        let text = String::from_utf8_lossy(&chunk).into_owned();
        let mut delay = INPUT_RETRY_BASE;
        loop {
            match engine.session_send(container, session, &text).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(
                        container,
                        session,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "terminal input write failed; retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return,
                    }
                    delay = (delay * 2).min(INPUT_RETRY_CAP);
                }
            }
        }
    }
}
