//! Repo Sync Engine: git-native movement of code between host and drones.
//!
//! Host-side operations run `git` directly; container-side operations go
//! through the Container Adapter. The pull pipeline imports drone commits
//! into a temporary host ref and merges without committing so the user can
//! review; conflicts are left in place and reported with the file list.

mod git;
pub mod status;

use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::engine::{ContainerEngine, ExportFormat, ExportRequest, SeedRequest};
use crate::error::{HubError, HubResult};

pub use status::{ChangeCounts, ChangeEntry, ChangeKind, WorkingTreeChanges};

/// Repository path inside every drone.
pub const DRONE_REPO_PATH: &str = "/work/repo";

/// Per-file diff output cap.
pub const MAX_DIFF_BYTES: usize = 262_144;

/// Where bundles land inside a drone during push-host.
const DRONE_BUNDLE_PATH: &str = "/tmp/dronehub/host.bundle";

/// Outcome of seeding a drone.
#[derive(Debug, Clone)]
pub struct SeedOutcome {
    /// The shared ancestor recorded as `dvm.baseSha`.
    pub base_sha: String,
}

/// Outcome of a successful pull (host ← drone).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullOutcome {
    /// The commit imported from the drone bundle.
    pub imported_sha: String,
    /// The drone's configured base SHA.
    pub base_sha: String,
    /// Whether the merge staged any changes (false when already up to date).
    pub merged: bool,
}

/// Branch names relevant to a pull, for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchContext {
    /// Branch checked out on the host.
    pub host_current: String,
    /// Branch checked out inside the drone.
    pub drone_current: Option<String>,
    /// Branch configured at seed time (`dvm.branch`).
    pub drone_configured: Option<String>,
    /// Ref the drone was seeded from (`dvm.fromRef`).
    pub drone_from_ref: Option<String>,
}

/// One file in the pull preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewEntry {
    /// Path relative to the repository root.
    pub path: String,
    /// Source path for renames and copies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
    /// Single status character from `diff --name-status`.
    pub status_char: char,
    /// Inferred change type.
    pub change_type: Option<ChangeKind>,
}

/// Files changed `dvm.baseSha..HEAD` inside the drone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPreview {
    /// The drone's configured base SHA.
    pub base_sha: String,
    /// Current drone HEAD.
    pub head_sha: String,
    /// Branch names for display.
    pub branch_context: BranchContext,
    /// Changed files, sorted by path.
    pub entries: Vec<PreviewEntry>,
}

/// Which side of the index a working-tree diff addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    /// Index vs HEAD.
    Staged,
    /// Working tree vs index.
    Unstaged,
}

/// A single file diff, possibly truncated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    /// The file the diff is for.
    pub path: String,
    /// Unified diff text.
    pub diff: String,
    /// Whether the output hit [`MAX_DIFF_BYTES`].
    pub truncated: bool,
    /// True when synthesised against `/dev/null` for an untracked file.
    pub from_untracked: bool,
}

/// Probe a host repository path: it must be a git working tree. Returns
/// the `origin` remote URL when one is configured.
pub async fn probe_host_repo(path: &Path) -> HubResult<Option<String>> {
    if !git::is_work_tree(path).await {
        return Err(HubError::NotFound {
            what: format!("git working tree at {}", path.display()),
        });
    }
    let out = git::git_raw(path, &["config", "--get", "remote.origin.url"]).await?;
    Ok(out
        .success()
        .then(|| out.stdout.trim().to_owned())
        .filter(|url| !url.is_empty()))
}

/// The sync engine. Cheap to clone via the shared engine handle.
pub struct RepoSync {
    engine: Arc<dyn ContainerEngine>,
}

impl std::fmt::Debug for RepoSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoSync").finish_non_exhaustive()
    }
}

impl RepoSync {
    /// Build a sync engine on top of a container adapter.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Seed a drone's working copy from the host repository.
    ///
    /// Postcondition: `dvm.baseSha(drone) == HEAD(drone) ==` the resolved
    /// host commit at seed time.
    pub async fn seed(
        &self,
        host_repo: &Path,
        container: &str,
        base_ref: Option<&str>,
        branch: Option<&str>,
    ) -> HubResult<SeedOutcome> {
        if !git::is_work_tree(host_repo).await {
            return Err(HubError::Internal(anyhow::anyhow!(
                "{} is not a git working tree",
                host_repo.display()
            )));
        }
        let base_sha = git::rev_parse(host_repo, base_ref.unwrap_or("HEAD")).await?;

        self.engine
            .repo_seed(SeedRequest {
                container: container.to_owned(),
                host_path: host_repo.to_path_buf(),
                dest: Some(DRONE_REPO_PATH.to_owned()),
                base_ref: base_ref.map(str::to_owned),
                branch: branch.map(str::to_owned),
                clean: true,
                timeout: None,
            })
            .await?;

        let drone_head = self
            .engine
            .repo_head_sha(container, DRONE_REPO_PATH)
            .await?;
        if drone_head != base_sha {
            return Err(HubError::SeedMismatch {
                drone_head,
                host_head: base_sha,
            });
        }

        self.engine
            .repo_set_base_sha(container, DRONE_REPO_PATH, &base_sha)
            .await?;

        // Record the seed branch context for pull previews; best-effort.
        if let Some(branch) = branch {
            let _ = self
                .drone_git(container, &["config", "dvm.branch", branch])
                .await;
        }
        if let Some(base_ref) = base_ref {
            let _ = self
                .drone_git(container, &["config", "dvm.fromRef", base_ref])
                .await;
        }

        tracing::info!(container, base_sha = %base_sha, "seeded drone working copy");
        Ok(SeedOutcome { base_sha })
    }

    /// Apply committed drone work onto the host's current branch.
    ///
    /// On a clean merge the staged, uncommitted state is left for review.
    /// On conflict the conflicted state is left in place and the error
    /// carries the conflicted paths. The temporary import ref and the
    /// bundle are removed on every exit path.
    pub async fn pull_into_host(
        &self,
        drone_id: &str,
        container: &str,
        host_repo: &Path,
    ) -> HubResult<PullOutcome> {
        let base_sha = self
            .engine
            .repo_base_sha(container, DRONE_REPO_PATH)
            .await?;

        if !git::is_clean(host_repo).await? {
            return Err(HubError::PatchApplyError {
                message: "host working tree has uncommitted changes".to_owned(),
            });
        }

        let scratch = tempfile::tempdir().map_err(|e| {
            HubError::Internal(anyhow::anyhow!("creating bundle scratch dir: {e}"))
        })?;
        let bundle = self
            .engine
            .repo_export(ExportRequest {
                container: container.to_owned(),
                repo_path: DRONE_REPO_PATH.to_owned(),
                out_dir: scratch.path().to_path_buf(),
                format: ExportFormat::Bundle,
                base: Some(base_sha.clone()),
            })
            .await?;

        let suffix: u32 = rand::rng().random();
        let import_ref = format!("refs/drone/imports/{drone_id}/{suffix:08x}");

        let result = self
            .import_and_merge(host_repo, &bundle, &import_ref, &base_sha)
            .await;

        // The ref must not outlive the operation, success or not.
        let _ = git::git_raw(host_repo, &["update-ref", "-d", &import_ref]).await;
        drop(scratch);

        result
    }

    async fn import_and_merge(
        &self,
        host_repo: &Path,
        bundle: &Path,
        import_ref: &str,
        base_sha: &str,
    ) -> HubResult<PullOutcome> {
        let bundle_arg = bundle.display().to_string();
        let fetch = git::git_raw(
            host_repo,
            &["fetch", &bundle_arg, &format!("HEAD:{import_ref}")],
        )
        .await?;
        if !fetch.success() {
            return Err(HubError::PatchApplyError {
                message: format!("importing bundle failed: {}", fetch.stderr.trim()),
            });
        }
        let imported_sha = git::rev_parse(host_repo, import_ref).await?;

        let merge = git::git_raw(
            host_repo,
            &["merge", "--no-commit", "--no-ff", &imported_sha],
        )
        .await?;

        if merge.success() {
            // "Already up to date" stages nothing and leaves no MERGE_HEAD.
            let merged = host_repo.join(".git").join("MERGE_HEAD").exists()
                || !git::is_clean(host_repo).await.unwrap_or(true);
            tracing::info!(
                imported_sha = %imported_sha,
                merged,
                "imported drone changes into host"
            );
            return Ok(PullOutcome {
                imported_sha,
                base_sha: base_sha.to_owned(),
                merged,
            });
        }

        let conflicts = git::git_raw(
            host_repo,
            &["diff", "--name-only", "--diff-filter=U"],
        )
        .await?;
        let conflict_files: Vec<String> = conflicts
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();

        if conflict_files.is_empty() {
            // Not a conflict: restore the tree and report the failure.
            let _ = git::git_raw(host_repo, &["merge", "--abort"]).await;
            return Err(HubError::PatchApplyError {
                message: merge.stderr.trim().to_owned(),
            });
        }

        tracing::warn!(
            files = conflict_files.len(),
            "pull produced conflicts; leaving merge state for inspection"
        );
        Err(HubError::PatchApplyConflict { conflict_files })
    }

    /// Merge the host's current branch into the drone.
    ///
    /// Requires a clean drone tree. On conflict the merge is aborted inside
    /// the drone (nobody is there to resolve it) and the conflicted paths
    /// are reported.
    pub async fn push_host_into_drone(
        &self,
        container: &str,
        host_repo: &Path,
    ) -> HubResult<()> {
        let status = self
            .drone_git(container, &["status", "--porcelain"])
            .await?;
        if !status.trim().is_empty() {
            return Err(HubError::PatchApplyError {
                message: "drone working tree has uncommitted changes".to_owned(),
            });
        }

        let scratch = tempfile::tempdir().map_err(|e| {
            HubError::Internal(anyhow::anyhow!("creating bundle scratch dir: {e}"))
        })?;
        let bundle_path = scratch.path().join("host.bundle");
        let host_ref = git::current_branch(host_repo).await?;
        git::git(
            host_repo,
            &[
                "bundle",
                "create",
                &bundle_path.display().to_string(),
                "HEAD",
            ],
        )
        .await?;

        self.engine
            .copy(
                container,
                &bundle_path,
                DRONE_BUNDLE_PATH,
                crate::engine::CopyOptions {
                    clean: true,
                    timeout: None,
                },
            )
            .await?;

        let result = self.fetch_and_merge_in_drone(container, &host_ref).await;

        let _ = self
            .engine
            .exec(
                container,
                "rm",
                &["-f".to_owned(), DRONE_BUNDLE_PATH.to_owned()],
                None,
            )
            .await;
        result
    }

    async fn fetch_and_merge_in_drone(&self, container: &str, host_ref: &str) -> HubResult<()> {
        self.drone_git(container, &["fetch", DRONE_BUNDLE_PATH, "HEAD"])
            .await?;

        let merge = self
            .drone_git_raw(container, &["merge", "--no-ff", "FETCH_HEAD"])
            .await?;
        if merge.success() {
            tracing::info!(container, host_ref, "merged host branch into drone");
            return Ok(());
        }

        let conflicts = self
            .drone_git_raw(container, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        let conflict_files: Vec<String> = conflicts
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();

        let _ = self
            .drone_git_raw(container, &["merge", "--abort"])
            .await;

        if conflict_files.is_empty() {
            Err(HubError::PatchApplyError {
                message: merge.stderr.trim().to_owned(),
            })
        } else {
            Err(HubError::PatchApplyConflict { conflict_files })
        }
    }

    /// List files changed `dvm.baseSha..HEAD` inside the drone.
    pub async fn pull_preview(
        &self,
        container: &str,
        host_repo: &Path,
    ) -> HubResult<PullPreview> {
        let base_sha = self
            .engine
            .repo_base_sha(container, DRONE_REPO_PATH)
            .await?;
        let head_sha = self
            .engine
            .repo_head_sha(container, DRONE_REPO_PATH)
            .await?;

        let raw = self
            .drone_git(
                container,
                &[
                    "diff",
                    "--name-status",
                    "-z",
                    &format!("{base_sha}..{head_sha}"),
                ],
            )
            .await?;
        let mut entries = parse_name_status(&raw);
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let branch_context = BranchContext {
            host_current: git::current_branch(host_repo).await?,
            drone_current: self
                .drone_git(container, &["rev-parse", "--abbrev-ref", "HEAD"])
                .await
                .ok()
                .map(|s| s.trim().to_owned()),
            drone_configured: self
                .drone_git(container, &["config", "--get", "dvm.branch"])
                .await
                .ok()
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty()),
            drone_from_ref: self
                .drone_git(container, &["config", "--get", "dvm.fromRef"])
                .await
                .ok()
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty()),
        };

        Ok(PullPreview {
            base_sha,
            head_sha,
            branch_context,
            entries,
        })
    }

    /// Diff one file `base..head` inside the drone, truncated at the cap.
    pub async fn pull_diff(
        &self,
        container: &str,
        path: &str,
        base: &str,
        head: &str,
    ) -> HubResult<FileDiff> {
        let raw = self
            .drone_git(
                container,
                &["diff", &format!("{base}..{head}"), "--", path],
            )
            .await?;
        Ok(truncate_diff(path, raw, false))
    }

    /// Working-tree listing inside the drone: `git status --porcelain=v2`.
    pub async fn working_tree_changes(&self, container: &str) -> HubResult<WorkingTreeChanges> {
        let raw = self
            .drone_git(
                container,
                &[
                    "status",
                    "--porcelain=v2",
                    "-z",
                    "-uall",
                    "--ignored=no",
                ],
            )
            .await?;
        Ok(status::parse_porcelain_v2(&raw))
    }

    /// Working-tree diff of one file inside the drone.
    ///
    /// Untracked files are synthesised against `/dev/null` and flagged with
    /// `from_untracked`.
    pub async fn working_tree_diff(
        &self,
        container: &str,
        path: &str,
        kind: DiffKind,
    ) -> HubResult<FileDiff> {
        if kind == DiffKind::Unstaged && self.is_untracked(container, path).await? {
            let out = self
                .drone_git_raw(
                    container,
                    &[
                        "diff",
                        "--no-index",
                        "--",
                        "/dev/null",
                        &format!("{DRONE_REPO_PATH}/{path}"),
                    ],
                )
                .await?;
            // --no-index exits 1 when the files differ.
            if out.code > 1 {
                return Err(HubError::engine_failure(&out.stderr, &out.stdout));
            }
            return Ok(truncate_diff(path, out.stdout, true));
        }

        let args: &[&str] = match kind {
            DiffKind::Staged => &["diff", "--cached", "--", path],
            DiffKind::Unstaged => &["diff", "--", path],
        };
        let raw = self.drone_git(container, args).await?;
        Ok(truncate_diff(path, raw, false))
    }

    async fn is_untracked(&self, container: &str, path: &str) -> HubResult<bool> {
        let out = self
            .drone_git_raw(
                container,
                &["ls-files", "--error-unmatch", "--", path],
            )
            .await?;
        Ok(!out.success())
    }

    /// Run git inside the drone repository, failing on non-zero exit.
    async fn drone_git(&self, container: &str, args: &[&str]) -> HubResult<String> {
        let out = self.drone_git_raw(container, args).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(HubError::engine_failure(&out.stderr, &out.stdout))
        }
    }

    async fn drone_git_raw(
        &self,
        container: &str,
        args: &[&str],
    ) -> HubResult<crate::engine::ExecOutput> {
        let mut argv: Vec<String> = vec!["-C".to_owned(), DRONE_REPO_PATH.to_owned()];
        argv.extend(args.iter().map(|s| (*s).to_owned()));
        self.engine.exec(container, "git", &argv, None).await
    }
}

/// Parse `git diff --name-status -z` output into preview entries.
fn parse_name_status(raw: &str) -> Vec<PreviewEntry> {
    let mut entries = Vec::new();
    let mut tokens = raw.split('\0').filter(|t| !t.is_empty());

    while let Some(status) = tokens.next() {
        let status_char = status.chars().next().unwrap_or('.');
        let Some(path) = tokens.next() else { break };

        // Renames and copies carry the destination as a second path token.
        if matches!(status_char, 'R' | 'C') {
            let Some(dest) = tokens.next() else { break };
            entries.push(PreviewEntry {
                path: dest.to_owned(),
                original_path: Some(path.to_owned()),
                status_char,
                change_type: ChangeKind::from_status_char(status_char),
            });
        } else {
            entries.push(PreviewEntry {
                path: path.to_owned(),
                original_path: None,
                status_char,
                change_type: ChangeKind::from_status_char(status_char),
            });
        }
    }
    entries
}

fn truncate_diff(path: &str, diff: String, from_untracked: bool) -> FileDiff {
    if diff.len() <= MAX_DIFF_BYTES {
        return FileDiff {
            path: path.to_owned(),
            diff,
            truncated: false,
            from_untracked,
        };
    }
    let mut end = MAX_DIFF_BYTES;
    while !diff.is_char_boundary(end) {
        end -= 1;
    }
    FileDiff {
        path: path.to_owned(),
        diff: diff[..end].to_owned(),
        truncated: true,
        from_untracked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_status_parses_plain_and_rename() {
        let raw = "M\0src/lib.rs\0R100\0old.rs\0new.rs\0A\0added.rs\0";
        let entries = parse_name_status(raw);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].path, "src/lib.rs");
        assert_eq!(entries[0].change_type, Some(ChangeKind::Modified));

        assert_eq!(entries[1].path, "new.rs");
        assert_eq!(entries[1].original_path.as_deref(), Some("old.rs"));
        assert_eq!(entries[1].change_type, Some(ChangeKind::Renamed));

        assert_eq!(entries[2].change_type, Some(ChangeKind::Added));
    }

    #[test]
    fn truncation_sets_flag_and_respects_boundaries() {
        let big = "é".repeat(MAX_DIFF_BYTES);
        let diff = truncate_diff("f", big, false);
        assert!(diff.truncated);
        assert!(diff.diff.len() <= MAX_DIFF_BYTES);
        assert!(diff.diff.chars().all(|c| c == 'é'));

        let small = truncate_diff("f", "tiny".to_owned(), false);
        assert!(!small.truncated);
    }
}
