//! Production engine adapter: shells out to the `dvm` CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::parse;
use super::{
    ContainerEngine, CopyOptions, EXEC_TIMEOUT, ExecOutput, ExportRequest, KILL_GRACE,
    LONG_OP_TIMEOUT, PortMapping, ReadOptions, RenameOptions, SeedRequest, SessionChunk,
    StartMode, TypeInput,
};
use crate::error::{HubError, HubResult};

/// Engine adapter that drives the `dvm` CLI as subprocesses.
pub struct DvmEngine {
    binary: String,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for DvmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DvmEngine")
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

impl DvmEngine {
    /// Create an adapter for the given engine binary.
    ///
    /// `shutdown` is the daemon-wide cancellation token; cancelling it kills
    /// in-flight engine subprocesses (TERM, then KILL after the grace
    /// period).
    #[must_use]
    pub fn new(binary: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            binary: binary.into(),
            shutdown,
        }
    }

    /// Run `dvm <args…>`, enforcing the deadline, and fail on non-zero exit.
    async fn run(&self, args: &[String], timeout: Duration) -> HubResult<ExecOutput> {
        let action = args.first().cloned().unwrap_or_default();
        let output = self.run_raw(args, timeout, &action).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(HubError::engine_failure(&output.stderr, &output.stdout))
        }
    }

    /// Run `dvm <args…>` and return the captured output regardless of exit
    /// code. Only deadline and spawn failures are errors here.
    async fn run_raw(
        &self,
        args: &[String],
        timeout: Duration,
        action: &str,
    ) -> HubResult<ExecOutput> {
        tracing::trace!(binary = %self.binary, ?args, "running engine command");

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HubError::EngineFailure {
                message: format!("failed to spawn {}: {e}", self.binary),
            })?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => Some(status),
            () = tokio::time::sleep(timeout) => None,
            () = self.shutdown.cancelled() => None,
        };

        let Some(status) = status else {
            terminate(&mut child).await;
            return Err(HubError::Timeout {
                action: format!("engine {action}"),
                seconds: timeout.as_secs(),
            });
        };

        let status = status.map_err(|e| HubError::EngineFailure {
            message: format!("waiting for {}: {e}", self.binary),
        })?;
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(ExecOutput {
            code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// SIGTERM the child, then SIGKILL after [`KILL_GRACE`].
async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .await;
        tokio::select! {
            _ = child.wait() => return,
            () = tokio::time::sleep(KILL_GRACE) => {}
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn strings<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.into_iter().map(str::to_owned).collect()
}

#[async_trait]
impl ContainerEngine for DvmEngine {
    async fn ports(&self, container: &str) -> HubResult<Vec<PortMapping>> {
        let out = self.run(&strings(["ports", container]), EXEC_TIMEOUT).await?;
        Ok(parse::parse_ports(&out.stdout))
    }

    async fn create(&self, container: &str, args: &[String]) -> HubResult<()> {
        let mut argv = strings(["create", container]);
        argv.extend_from_slice(args);
        self.run(&argv, LONG_OP_TIMEOUT).await?;
        Ok(())
    }

    async fn start(&self, container: &str) -> HubResult<()> {
        self.run(&strings(["start", container]), EXEC_TIMEOUT).await?;
        Ok(())
    }

    async fn stop(&self, container: &str) -> HubResult<()> {
        self.run(&strings(["stop", container]), EXEC_TIMEOUT).await?;
        Ok(())
    }

    async fn remove(&self, container: &str, keep_volume: bool) -> HubResult<()> {
        let mut argv = strings(["rm", container]);
        if keep_volume {
            argv.push("--keep-volume".to_owned());
        }
        self.run(&argv, EXEC_TIMEOUT).await?;
        Ok(())
    }

    async fn ls(&self) -> HubResult<Vec<String>> {
        let out = self.run(&strings(["ls"]), EXEC_TIMEOUT).await?;
        Ok(parse::parse_ls(&out.stdout))
    }

    async fn rename(&self, old: &str, new: &str, opts: RenameOptions) -> HubResult<()> {
        let mut argv = strings(["rename", old, new]);
        match opts.start_mode {
            StartMode::Preserve => {}
            StartMode::Always => argv.push("--start".to_owned()),
            StartMode::Never => argv.push("--no-start".to_owned()),
        }
        if opts.migrate_volume_name {
            argv.push("--migrate-volume-name".to_owned());
        }
        self.run(&argv, EXEC_TIMEOUT).await?;
        Ok(())
    }

    async fn exec(
        &self,
        container: &str,
        cmd: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> HubResult<ExecOutput> {
        let mut argv = strings(["exec", container, "--", cmd]);
        argv.extend_from_slice(args);
        self.run_raw(&argv, timeout.unwrap_or(EXEC_TIMEOUT), "exec")
            .await
    }

    async fn session_start(
        &self,
        container: &str,
        session: &str,
        cmd: &str,
        args: &[String],
        reuse: bool,
    ) -> HubResult<()> {
        let mut argv = strings(["session", "start", container, session]);
        if reuse {
            argv.push("--reuse".to_owned());
        }
        argv.push("--".to_owned());
        argv.push(cmd.to_owned());
        argv.extend_from_slice(args);
        self.run(&argv, EXEC_TIMEOUT).await?;
        Ok(())
    }

    async fn session_send(&self, container: &str, session: &str, text: &str) -> HubResult<()> {
        self.run(
            &strings(["session", "send", container, session, text]),
            EXEC_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn session_type(
        &self,
        container: &str,
        session: &str,
        input: TypeInput,
    ) -> HubResult<()> {
        let mut argv = strings(["session", "type", container, session]);
        if let Some(text) = input.text {
            argv.push("--text".to_owned());
            argv.push(text);
        }
        for key in input.keys {
            argv.push("--key".to_owned());
            argv.push(key.as_arg().to_owned());
        }
        self.run(&argv, EXEC_TIMEOUT).await?;
        Ok(())
    }

    async fn session_read(
        &self,
        container: &str,
        session: &str,
        opts: ReadOptions,
    ) -> HubResult<SessionChunk> {
        let mut argv = strings(["session", "read", container, session, "--json"]);
        if let Some(since) = opts.since {
            argv.push("--since".to_owned());
            argv.push(since.to_string());
        }
        if let Some(max_bytes) = opts.max_bytes {
            argv.push("--max-bytes".to_owned());
            argv.push(max_bytes.to_string());
        }
        if let Some(tail) = opts.tail_lines {
            argv.push("--tail".to_owned());
            argv.push(tail.to_string());
        }
        let out = self.run(&argv, EXEC_TIMEOUT).await?;
        parse::parse_session_chunk(&out.stdout)
    }

    async fn copy(
        &self,
        container: &str,
        src: &Path,
        dest: &str,
        opts: CopyOptions,
    ) -> HubResult<()> {
        let mut argv = strings(["copy", container]);
        argv.push(src.display().to_string());
        argv.push(dest.to_owned());
        if opts.clean {
            argv.push("--clean".to_owned());
        }
        self.run(&argv, opts.timeout.unwrap_or(EXEC_TIMEOUT)).await?;
        Ok(())
    }

    async fn script(
        &self,
        container: &str,
        path: &Path,
        args: &[String],
    ) -> HubResult<ExecOutput> {
        let mut argv = strings(["script", container]);
        argv.push(path.display().to_string());
        argv.push("--".to_owned());
        argv.extend_from_slice(args);
        self.run_raw(&argv, LONG_OP_TIMEOUT, "script").await
    }

    async fn repo_seed(&self, req: SeedRequest) -> HubResult<()> {
        let mut argv = strings(["repo", "seed", &req.container]);
        argv.push(req.host_path.display().to_string());
        if let Some(dest) = &req.dest {
            argv.push("--dest".to_owned());
            argv.push(dest.clone());
        }
        if let Some(base_ref) = &req.base_ref {
            argv.push("--base-ref".to_owned());
            argv.push(base_ref.clone());
        }
        if let Some(branch) = &req.branch {
            argv.push("--branch".to_owned());
            argv.push(branch.clone());
        }
        if req.clean {
            argv.push("--clean".to_owned());
        }
        self.run(&argv, req.timeout.unwrap_or(LONG_OP_TIMEOUT)).await?;
        Ok(())
    }

    async fn repo_export(&self, req: ExportRequest) -> HubResult<PathBuf> {
        let mut argv = strings(["repo", "export", &req.container]);
        argv.push("--repo".to_owned());
        argv.push(req.repo_path.clone());
        argv.push("--out".to_owned());
        argv.push(req.out_dir.display().to_string());
        argv.push("--format".to_owned());
        argv.push(req.format.as_arg().to_owned());
        if let Some(base) = &req.base {
            argv.push("--base".to_owned());
            argv.push(base.clone());
        }
        let out = self.run(&argv, LONG_OP_TIMEOUT).await?;
        parse::parse_exported_path(&out.stdout)
            .map(PathBuf::from)
            .ok_or_else(|| HubError::EngineFailure {
                message: format!(
                    "repo export reported no artifact path: {}",
                    out.stdout.trim()
                ),
            })
    }

    async fn repo_head_sha(&self, container: &str, repo_path: &str) -> HubResult<String> {
        let out = self
            .exec(
                container,
                "git",
                &strings(["-C", repo_path, "rev-parse", "HEAD"]),
                None,
            )
            .await?;
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
        let out = self
            .exec(
                container,
                "git",
                &strings(["-C", repo_path, "config", "dvm.baseSha", base_sha]),
                None,
            )
            .await?;
        if !out.success() {
            return Err(HubError::engine_failure(&out.stderr, &out.stdout));
        }

        // Remove the legacy file marker; the config entry is canonical.
        let _ = self
            .exec(
                container,
                "rm",
                &strings(["-f", &format!("{repo_path}/.dvm-base-sha")]),
                None,
            )
            .await;

        let readback = self.repo_base_sha(container, repo_path).await?;
        if readback != base_sha {
            return Err(HubError::EngineFailure {
                message: format!(
                    "dvm.baseSha readback mismatch: wrote {base_sha}, read {readback}"
                ),
            });
        }
        Ok(())
    }

    async fn repo_base_sha(&self, container: &str, repo_path: &str) -> HubResult<String> {
        let out = self
            .exec(
                container,
                "git",
                &strings(["-C", repo_path, "config", "--get", "dvm.baseSha"]),
                None,
            )
            .await?;
        if !out.success() {
            return Err(HubError::engine_failure(&out.stderr, &out.stdout));
        }
        Ok(out.stdout.trim().to_owned())
    }

    async fn base_set(&self, container: &str) -> HubResult<Option<String>> {
        let out = self
            .run(&strings(["base", "set", container]), LONG_OP_TIMEOUT)
            .await?;
        Ok(parse::parse_base_image(&out.stdout))
    }
}
