//! In-tree mock of the container engine for tests.
//!
//! A mock "container" is a host directory under the mock's root; container
//! paths map onto it by prefix. `exec` runs real subprocesses inside that
//! directory, so git-driven flows (seed, export, status) exercise real git
//! against the mock. Sessions are in-memory byte buffers that echo input.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{
    ContainerEngine, CopyOptions, ExecOutput, ExportFormat, ExportRequest, PortMapping,
    ReadOptions, RenameOptions, SeedRequest, SessionChunk, SessionKey, TypeInput,
};
use crate::error::{HubError, HubResult};

#[derive(Debug, Default)]
struct MockSession {
    /// Cumulative output since session start; the offset is its length.
    output: Vec<u8>,
    /// Everything sent via `session_send`/`session_type`, in arrival order.
    inputs: Vec<String>,
}

#[derive(Debug)]
struct MockContainer {
    dir: PathBuf,
    running: bool,
    ports: Vec<PortMapping>,
    sessions: HashMap<String, MockSession>,
}

/// Directory-backed [`ContainerEngine`] for tests.
pub struct MockEngine {
    root: PathBuf,
    containers: Mutex<HashMap<String, MockContainer>>,
    /// Operation name → error message for injected failures.
    failures: Mutex<HashMap<String, String>>,
    /// Operation name → injected latency, for observing in-flight states.
    delays: Mutex<HashMap<String, Duration>>,
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEngine")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl MockEngine {
    /// Create a mock rooted at `root` (typically a `TempDir` path).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            containers: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
        }
    }

    /// Make the named operation fail with `message` until cleared.
    pub async fn fail_op(&self, op: &str, message: impl Into<String>) {
        self.failures
            .lock()
            .await
            .insert(op.to_owned(), message.into());
    }

    /// Clear an injected failure.
    pub async fn clear_failure(&self, op: &str) {
        self.failures.lock().await.remove(op);
    }

    /// Make the named operation sleep before running, so tests can sample
    /// state while it is in flight.
    pub async fn delay_op(&self, op: &str, delay: Duration) {
        self.delays.lock().await.insert(op.to_owned(), delay);
    }

    /// Host directory backing a container.
    #[must_use]
    pub fn container_dir(&self, container: &str) -> PathBuf {
        self.root.join(container)
    }

    /// Map an absolute container path onto the backing directory.
    #[must_use]
    pub fn host_path(&self, container: &str, container_path: &str) -> PathBuf {
        let rel = container_path.trim_start_matches('/');
        self.container_dir(container).join(rel)
    }

    /// Append scripted output to a session, as if the process wrote it.
    pub async fn push_session_output(&self, container: &str, session: &str, bytes: &[u8]) {
        let mut containers = self.containers.lock().await;
        if let Some(c) = containers.get_mut(container) {
            if let Some(s) = c.sessions.get_mut(session) {
                s.output.extend_from_slice(bytes);
            }
        }
    }

    /// Inputs a session has received, in arrival order.
    pub async fn session_inputs(&self, container: &str, session: &str) -> Vec<String> {
        let containers = self.containers.lock().await;
        containers
            .get(container)
            .and_then(|c| c.sessions.get(session))
            .map(|s| s.inputs.clone())
            .unwrap_or_default()
    }

    /// Whether a container is in the running state.
    pub async fn is_running(&self, container: &str) -> bool {
        self.containers
            .lock()
            .await
            .get(container)
            .is_some_and(|c| c.running)
    }

    /// Publish a port mapping on a container.
    pub async fn set_ports(&self, container: &str, ports: Vec<PortMapping>) {
        let mut containers = self.containers.lock().await;
        if let Some(c) = containers.get_mut(container) {
            c.ports = ports;
        }
    }

    async fn check_failure(&self, op: &str) -> HubResult<()> {
        let delay = self.delays.lock().await.get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.failures.lock().await.get(op) {
            return Err(HubError::EngineFailure {
                message: message.clone(),
            });
        }
        Ok(())
    }

    async fn with_container<T>(
        &self,
        container: &str,
        f: impl FnOnce(&mut MockContainer) -> T,
    ) -> HubResult<T> {
        let mut containers = self.containers.lock().await;
        let c = containers
            .get_mut(container)
            .ok_or_else(|| HubError::EngineFailure {
                message: format!("no such container: {container}"),
            })?;
        Ok(f(c))
    }

    /// Run a real subprocess with the container directory as cwd, mapping
    /// absolute argument paths into the backing directory.
    async fn run_in_container(
        &self,
        container: &str,
        cmd: &str,
        args: &[String],
    ) -> HubResult<ExecOutput> {
        let dir = self
            .with_container(container, |c| c.dir.clone())
            .await?;
        // Map absolute container paths onto the backing directory, token by
        // token so `sh -c` scripts work too. /dev/* stays host-side.
        let mapped: Vec<String> = args
            .iter()
            .map(|a| {
                a.split(' ')
                    .map(|token| {
                        if token.starts_with('/') && !token.starts_with("/dev/") {
                            self.host_path(container, token).display().to_string()
                        } else {
                            token.to_owned()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();

        let output = Command::new(cmd)
            .args(&mapped)
            .current_dir(&dir)
            .output()
            .await
            .map_err(|e| HubError::EngineFailure {
                message: format!("mock exec spawn {cmd}: {e}"),
            })?;

        Ok(ExecOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ports(&self, container: &str) -> HubResult<Vec<PortMapping>> {
        self.check_failure("ports").await?;
        self.with_container(container, |c| c.ports.clone()).await
    }

    async fn create(&self, container: &str, _args: &[String]) -> HubResult<()> {
        self.check_failure("create").await?;
        let dir = self.container_dir(container);
        std::fs::create_dir_all(&dir).map_err(|e| HubError::EngineFailure {
            message: format!("mock create: {e}"),
        })?;
        self.containers.lock().await.insert(
            container.to_owned(),
            MockContainer {
                dir,
                running: true,
                ports: Vec::new(),
                sessions: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn start(&self, container: &str) -> HubResult<()> {
        self.check_failure("start").await?;
        self.with_container(container, |c| c.running = true).await
    }

    async fn stop(&self, container: &str) -> HubResult<()> {
        self.check_failure("stop").await?;
        self.with_container(container, |c| c.running = false).await
    }

    async fn remove(&self, container: &str, _keep_volume: bool) -> HubResult<()> {
        self.check_failure("remove").await?;
        let removed = self.containers.lock().await.remove(container);
        if let Some(c) = removed {
            let _ = std::fs::remove_dir_all(&c.dir);
        }
        Ok(())
    }

    async fn ls(&self) -> HubResult<Vec<String>> {
        self.check_failure("ls").await?;
        let mut names: Vec<String> = self.containers.lock().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn rename(&self, old: &str, new: &str, _opts: RenameOptions) -> HubResult<()> {
        self.check_failure("rename").await?;
        let mut containers = self.containers.lock().await;
        if containers.contains_key(new) {
            return Err(HubError::EngineFailure {
                message: format!("container name taken: {new}"),
            });
        }
        let c = containers
            .remove(old)
            .ok_or_else(|| HubError::EngineFailure {
                message: format!("no such container: {old}"),
            })?;
        containers.insert(new.to_owned(), c);
        Ok(())
    }

    async fn exec(
        &self,
        container: &str,
        cmd: &str,
        args: &[String],
        _timeout: Option<Duration>,
    ) -> HubResult<ExecOutput> {
        self.check_failure("exec").await?;
        self.run_in_container(container, cmd, args).await
    }

    async fn session_start(
        &self,
        container: &str,
        session: &str,
        _cmd: &str,
        _args: &[String],
        reuse: bool,
    ) -> HubResult<()> {
        self.check_failure("session_start").await?;
        self.with_container(container, |c| {
            if reuse && c.sessions.contains_key(session) {
                return;
            }
            c.sessions.insert(session.to_owned(), MockSession::default());
        })
        .await
    }

    async fn session_send(&self, container: &str, session: &str, text: &str) -> HubResult<()> {
        self.check_failure("session_send").await?;
        self.with_container(container, |c| {
            let s = c.sessions.entry(session.to_owned()).or_default();
            s.inputs.push(text.to_owned());
            // The mock pty echoes input.
            s.output.extend_from_slice(text.as_bytes());
        })
        .await
    }

    async fn session_type(
        &self,
        container: &str,
        session: &str,
        input: TypeInput,
    ) -> HubResult<()> {
        self.check_failure("session_type").await?;
        self.with_container(container, |c| {
            let s = c.sessions.entry(session.to_owned()).or_default();
            if let Some(text) = input.text {
                s.inputs.push(text.clone());
                s.output.extend_from_slice(text.as_bytes());
            }
            for key in input.keys {
                let rendered = match key {
                    SessionKey::Enter => "\n",
                    SessionKey::Esc => "\u{1b}",
                    SessionKey::Tab => "\t",
                };
                s.inputs.push(rendered.to_owned());
                s.output.extend_from_slice(rendered.as_bytes());
            }
        })
        .await
    }

    async fn session_read(
        &self,
        container: &str,
        session: &str,
        opts: ReadOptions,
    ) -> HubResult<SessionChunk> {
        self.check_failure("session_read").await?;
        self.with_container(container, |c| {
            let s = c.sessions.entry(session.to_owned()).or_default();
            let total = s.output.len() as u64;

            let (start, end) = if let Some(tail) = opts.tail_lines {
                (tail_start(&s.output, tail), total)
            } else {
                let since = opts.since.unwrap_or(total).min(total);
                let mut end = total;
                if let Some(max) = opts.max_bytes {
                    end = end.min(since.saturating_add(max));
                }
                (since, end)
            };

            let slice = &s.output[usize::try_from(start).unwrap_or(0)
                ..usize::try_from(end).unwrap_or(s.output.len())];
            SessionChunk {
                offset_bytes: end,
                text: String::from_utf8_lossy(slice).into_owned(),
            }
        })
        .await
    }

    async fn copy(
        &self,
        container: &str,
        src: &Path,
        dest: &str,
        opts: CopyOptions,
    ) -> HubResult<()> {
        self.check_failure("copy").await?;
        let target = self.host_path(container, dest);
        if opts.clean && target.exists() {
            let _ = std::fs::remove_dir_all(&target);
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HubError::EngineFailure {
                message: format!("mock copy mkdir: {e}"),
            })?;
        }
        let status = Command::new("cp")
            .arg("-r")
            .arg(src)
            .arg(&target)
            .status()
            .await
            .map_err(|e| HubError::EngineFailure {
                message: format!("mock copy spawn: {e}"),
            })?;
        if !status.success() {
            return Err(HubError::EngineFailure {
                message: format!("mock copy {} -> {}", src.display(), target.display()),
            });
        }
        Ok(())
    }

    async fn script(
        &self,
        container: &str,
        path: &Path,
        args: &[String],
    ) -> HubResult<ExecOutput> {
        self.check_failure("script").await?;
        let mut argv = vec![path.display().to_string()];
        argv.extend_from_slice(args);
        self.run_in_container(container, "sh", &argv).await
    }

    async fn repo_seed(&self, req: SeedRequest) -> HubResult<()> {
        self.check_failure("repo_seed").await?;
        let dest = req.dest.as_deref().unwrap_or("/work/repo");
        let target = self.host_path(&req.container, dest);
        if req.clean && target.exists() {
            let _ = std::fs::remove_dir_all(&target);
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HubError::EngineFailure {
                message: format!("mock seed mkdir: {e}"),
            })?;
        }

        let args = vec![
            "clone".to_owned(),
            req.host_path.display().to_string(),
            target.display().to_string(),
        ];
        let out = git(&args, None).await?;
        if !out.success() {
            return Err(HubError::engine_failure(&out.stderr, &out.stdout));
        }

        // Checkout after clone so a SHA works as the base ref too.
        if let Some(base_ref) = &req.base_ref {
            let out = git(
                &["checkout".to_owned(), base_ref.clone()],
                Some(&target),
            )
            .await?;
            if !out.success() {
                return Err(HubError::engine_failure(&out.stderr, &out.stdout));
            }
        }

        if let Some(branch) = &req.branch {
            let out = git(
                &["checkout".to_owned(), "-b".to_owned(), branch.clone()],
                Some(&target),
            )
            .await?;
            if !out.success() {
                return Err(HubError::engine_failure(&out.stderr, &out.stdout));
            }
        }
        Ok(())
    }

    async fn repo_export(&self, req: ExportRequest) -> HubResult<PathBuf> {
        self.check_failure("repo_export").await?;
        let repo = self.host_path(&req.container, &req.repo_path);
        std::fs::create_dir_all(&req.out_dir).map_err(|e| HubError::EngineFailure {
            message: format!("mock export mkdir: {e}"),
        })?;

        let range = req
            .base
            .as_ref()
            .map_or_else(|| "HEAD".to_owned(), |base| format!("{base}..HEAD"));

        let artifact = match req.format {
            ExportFormat::Bundle => {
                let path = req.out_dir.join(format!("{}.bundle", req.container));
                let out = git(
                    &[
                        "bundle".to_owned(),
                        "create".to_owned(),
                        path.display().to_string(),
                        range,
                    ],
                    Some(&repo),
                )
                .await?;
                if !out.success() {
                    return Err(HubError::engine_failure(&out.stderr, &out.stdout));
                }
                path
            }
            ExportFormat::Patches => {
                let out = git(
                    &[
                        "format-patch".to_owned(),
                        "-o".to_owned(),
                        req.out_dir.display().to_string(),
                        range,
                    ],
                    Some(&repo),
                )
                .await?;
                if !out.success() {
                    return Err(HubError::engine_failure(&out.stderr, &out.stdout));
                }
                req.out_dir.clone()
            }
            ExportFormat::Diff => {
                let path = req.out_dir.join(format!("{}.diff", req.container));
                let out = git(&["diff".to_owned(), range], Some(&repo)).await?;
                if !out.success() {
                    return Err(HubError::engine_failure(&out.stderr, &out.stdout));
                }
                std::fs::write(&path, out.stdout).map_err(|e| HubError::EngineFailure {
                    message: format!("mock export write: {e}"),
                })?;
                path
            }
        };
        Ok(artifact)
    }

    async fn repo_head_sha(&self, container: &str, repo_path: &str) -> HubResult<String> {
        self.check_failure("repo_head_sha").await?;
        let repo = self.host_path(container, repo_path);
        let out = git(&["rev-parse".to_owned(), "HEAD".to_owned()], Some(&repo)).await?;
        if !out.success() {
            return Err(HubError::engine_failure(&out.stderr, &out.stdout));
        }
        Ok(out.stdout.trim().to_owned())
    }

    async fn repo_set_base_sha(
        &self,
        container: &str,
        repo_path: &str,
        base_sha: &str,
    ) -> HubResult<()> {
        self.check_failure("repo_set_base_sha").await?;
        let repo = self.host_path(container, repo_path);
        let out = git(
            &[
                "config".to_owned(),
                "dvm.baseSha".to_owned(),
                base_sha.to_owned(),
            ],
            Some(&repo),
        )
        .await?;
        if !out.success() {
            return Err(HubError::engine_failure(&out.stderr, &out.stdout));
        }
        let _ = std::fs::remove_file(repo.join(".dvm-base-sha"));
        Ok(())
    }

    async fn repo_base_sha(&self, container: &str, repo_path: &str) -> HubResult<String> {
        self.check_failure("repo_base_sha").await?;
        let repo = self.host_path(container, repo_path);
        let out = git(
            &["config".to_owned(), "--get".to_owned(), "dvm.baseSha".to_owned()],
            Some(&repo),
        )
        .await?;
        if !out.success() {
            return Err(HubError::engine_failure(&out.stderr, &out.stdout));
        }
        Ok(out.stdout.trim().to_owned())
    }

    async fn base_set(&self, container: &str) -> HubResult<Option<String>> {
        self.check_failure("base_set").await?;
        self.with_container(container, |_| ()).await?;
        Ok(Some(format!("dronehub/base:{container}")))
    }
}

/// Byte offset where the last `lines` lines begin.
fn tail_start(output: &[u8], lines: u64) -> u64 {
    if lines == 0 {
        return output.len() as u64;
    }
    let mut remaining = lines;
    // A trailing newline does not count as starting a new line.
    let mut idx = output.len();
    if idx > 0 && output[idx - 1] == b'\n' {
        idx -= 1;
    }
    while idx > 0 {
        if output[idx - 1] == b'\n' {
            remaining -= 1;
            if remaining == 0 {
                return idx as u64;
            }
        }
        idx -= 1;
    }
    0
}

async fn git(args: &[String], cwd: Option<&Path>) -> HubResult<ExecOutput> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = cmd.output().await.map_err(|e| HubError::EngineFailure {
        message: format!("mock git spawn: {e}"),
    })?;
    Ok(ExecOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
