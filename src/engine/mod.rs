//! Container Adapter: the single point of contact with the container engine.
//!
//! Everything the hub knows about containers goes through the
//! [`ContainerEngine`] trait. The production implementation ([`DvmEngine`])
//! shells out to the `dvm` CLI; [`MockEngine`] backs containers with host
//! temp directories for tests.

mod dvm;
pub mod mock;
mod parse;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HubResult;

pub use dvm::DvmEngine;
pub use mock::MockEngine;

/// Default deadline for short engine operations (exec, ports, ls).
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for heavyweight operations (seed, export, base-set).
pub const LONG_OP_TIMEOUT: Duration = Duration::from_secs(600);

/// Grace period between SIGTERM and SIGKILL when a deadline elapses.
pub const KILL_GRACE: Duration = Duration::from_millis(1500);

/// One published port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// Port bound on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}

/// Captured output of an `exec` or `script` run.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Process exit code (0 on success).
    pub code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the process exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// A slice of session output addressed by cumulative byte offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionChunk {
    /// Cumulative byte count of session stdout *after* `text`.
    pub offset_bytes: u64,
    /// The bytes read, as UTF-8 text.
    pub text: String,
}

/// How to address a `session_read`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Return bytes at and after this cumulative offset.
    pub since: Option<u64>,
    /// Cap on returned bytes.
    pub max_bytes: Option<u64>,
    /// Return only the last N lines (mutually exclusive with `since`).
    pub tail_lines: Option<u64>,
}

/// Symbolic keys understood by `session type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKey {
    /// Carriage return / submit.
    Enter,
    /// Escape.
    Esc,
    /// Horizontal tab.
    Tab,
}

impl SessionKey {
    /// The engine's symbolic name for the key.
    #[must_use]
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Enter => "Enter",
            Self::Esc => "Esc",
            Self::Tab => "Tab",
        }
    }
}

/// Payload for `session_type`: literal text, symbolic keys, or both.
#[derive(Debug, Clone, Default)]
pub struct TypeInput {
    /// Text typed as keystrokes.
    pub text: Option<String>,
    /// Symbolic keys pressed after the text.
    pub keys: Vec<SessionKey>,
}

impl TypeInput {
    /// A single symbolic key press.
    #[must_use]
    pub fn key(key: SessionKey) -> Self {
        Self {
            text: None,
            keys: vec![key],
        }
    }
}

/// Whether a renamed container should come back up afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartMode {
    /// Keep the container's previous run state.
    #[default]
    Preserve,
    /// Always start after the rename.
    Always,
    /// Never start after the rename.
    Never,
}

/// Options for [`ContainerEngine::rename`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RenameOptions {
    /// Run-state policy after the rename.
    pub start_mode: StartMode,
    /// Also rename the container's volume.
    pub migrate_volume_name: bool,
}

/// Options for [`ContainerEngine::copy`].
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Remove the destination before copying.
    pub clean: bool,
    /// Overall deadline; defaults to [`EXEC_TIMEOUT`].
    pub timeout: Option<Duration>,
}

/// Request for [`ContainerEngine::repo_seed`].
#[derive(Debug, Clone)]
pub struct SeedRequest {
    /// Target container.
    pub container: String,
    /// Host repository to clone from.
    pub host_path: PathBuf,
    /// Destination inside the container; engine default when `None`.
    pub dest: Option<String>,
    /// Ref to seed from; host HEAD when `None`.
    pub base_ref: Option<String>,
    /// Branch to create inside the drone.
    pub branch: Option<String>,
    /// Wipe the destination first.
    pub clean: bool,
    /// Overall deadline; defaults to [`LONG_OP_TIMEOUT`].
    pub timeout: Option<Duration>,
}

/// Export formats understood by `repo export`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One mailbox patch per commit.
    Patches,
    /// A git bundle of `base..HEAD`.
    Bundle,
    /// A single combined diff.
    Diff,
}

impl ExportFormat {
    /// The engine's name for the format.
    #[must_use]
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Patches => "patches",
            Self::Bundle => "bundle",
            Self::Diff => "diff",
        }
    }
}

/// Request for [`ContainerEngine::repo_export`].
#[derive(Debug, Clone)]
pub struct ExportRequest {
    /// Source container.
    pub container: String,
    /// Repository path inside the container.
    pub repo_path: String,
    /// Host directory the export lands in.
    pub out_dir: PathBuf,
    /// Export format.
    pub format: ExportFormat,
    /// Export `base..HEAD`; full history when `None`.
    pub base: Option<String>,
}

/// Typed operations over the container engine.
///
/// Implementations must be safe to call concurrently; the engine process is
/// the serialiser for container state.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Published ports of a container, deduplicated and sorted by container
    /// port then host port.
    async fn ports(&self, container: &str) -> HubResult<Vec<PortMapping>>;

    /// Create a container. `args` are passed through to the engine verbatim.
    async fn create(&self, container: &str, args: &[String]) -> HubResult<()>;

    /// Start a stopped container.
    async fn start(&self, container: &str) -> HubResult<()>;

    /// Stop a running container.
    async fn stop(&self, container: &str) -> HubResult<()>;

    /// Remove a container, optionally keeping its volume.
    async fn remove(&self, container: &str, keep_volume: bool) -> HubResult<()>;

    /// Names of all containers known to the engine, deduplicated.
    async fn ls(&self) -> HubResult<Vec<String>>;

    /// Rename a container.
    async fn rename(&self, old: &str, new: &str, opts: RenameOptions) -> HubResult<()>;

    /// Run a command inside a container and capture its output.
    ///
    /// Exceeding the deadline surfaces the `timeout` error kind after
    /// SIGTERM, then SIGKILL [`KILL_GRACE`] later.
    async fn exec(
        &self,
        container: &str,
        cmd: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> HubResult<ExecOutput>;

    /// Start (or reuse) a named long-lived session running `cmd`.
    async fn session_start(
        &self,
        container: &str,
        session: &str,
        cmd: &str,
        args: &[String],
        reuse: bool,
    ) -> HubResult<()>;

    /// Append raw text to a session's input. No key parsing.
    async fn session_send(&self, container: &str, session: &str, text: &str) -> HubResult<()>;

    /// Type text and/or symbolic keys into a session.
    async fn session_type(
        &self,
        container: &str,
        session: &str,
        input: TypeInput,
    ) -> HubResult<()>;

    /// Read session output by offset or tail.
    async fn session_read(
        &self,
        container: &str,
        session: &str,
        opts: ReadOptions,
    ) -> HubResult<SessionChunk>;

    /// Copy a host file or directory into a container.
    async fn copy(
        &self,
        container: &str,
        src: &std::path::Path,
        dest: &str,
        opts: CopyOptions,
    ) -> HubResult<()>;

    /// Upload and run a script inside a container.
    async fn script(
        &self,
        container: &str,
        path: &std::path::Path,
        args: &[String],
    ) -> HubResult<ExecOutput>;

    /// Clone a host repository into a container.
    async fn repo_seed(&self, req: SeedRequest) -> HubResult<()>;

    /// Export drone commits; returns the host path of the artifact.
    async fn repo_export(&self, req: ExportRequest) -> HubResult<PathBuf>;

    /// Current HEAD commit of the drone repository.
    async fn repo_head_sha(&self, container: &str, repo_path: &str) -> HubResult<String>;

    /// Record the seed point as `git config dvm.baseSha`, verifying the
    /// readback equals the input.
    async fn repo_set_base_sha(
        &self,
        container: &str,
        repo_path: &str,
        base_sha: &str,
    ) -> HubResult<()>;

    /// Read the configured `dvm.baseSha` of the drone repository.
    async fn repo_base_sha(&self, container: &str, repo_path: &str) -> HubResult<String>;

    /// Commit the container as a new base image; returns the tag when the
    /// engine reports one.
    async fn base_set(&self, container: &str) -> HubResult<Option<String>>;
}
