//! Host-side git subprocess runner.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

use crate::engine::ExecOutput;
use crate::error::{HubError, HubResult};

/// Deadline for host git invocations.
const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Run `git <args…>` in `repo` and capture output. Non-zero exit is not an
/// error here; callers decide what a failure means.
pub(crate) async fn git_raw(repo: &Path, args: &[&str]) -> HubResult<ExecOutput> {
    let future = Command::new("git").args(args).current_dir(repo).output();

    let output = match tokio::time::timeout(GIT_TIMEOUT, future).await {
        Ok(result) => result.map_err(|e| HubError::Internal(anyhow::anyhow!(
            "failed to spawn git {}: {e}",
            args.first().copied().unwrap_or_default()
        )))?,
        Err(_) => {
            return Err(HubError::Timeout {
                action: format!("git {}", args.first().copied().unwrap_or_default()),
                seconds: GIT_TIMEOUT.as_secs(),
            });
        }
    };

    Ok(ExecOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run `git <args…>` in `repo`, failing on non-zero exit.
pub(crate) async fn git(repo: &Path, args: &[&str]) -> HubResult<ExecOutput> {
    let out = git_raw(repo, args).await?;
    if out.success() {
        Ok(out)
    } else {
        Err(HubError::Internal(anyhow::anyhow!(
            "git {} failed: {}",
            args.join(" "),
            out.stderr.trim()
        )))
    }
}

/// Resolve a rev to a full SHA in the host repo.
pub(crate) async fn rev_parse(repo: &Path, rev: &str) -> HubResult<String> {
    let out = git(repo, &["rev-parse", rev]).await?;
    Ok(out.stdout.trim().to_owned())
}

/// Whether `repo` is inside a git working tree.
pub(crate) async fn is_work_tree(repo: &Path) -> bool {
    matches!(
        git_raw(repo, &["rev-parse", "--is-inside-work-tree"]).await,
        Ok(out) if out.success() && out.stdout.trim() == "true"
    )
}

/// Whether the host working tree has no pending changes.
pub(crate) async fn is_clean(repo: &Path) -> HubResult<bool> {
    let out = git(repo, &["status", "--porcelain"]).await?;
    Ok(out.stdout.trim().is_empty())
}

/// Current branch name, or the literal `HEAD` when detached.
pub(crate) async fn current_branch(repo: &Path) -> HubResult<String> {
    let out = git(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    Ok(out.stdout.trim().to_owned())
}
