#![allow(dead_code)]
//! Shared test utilities for integration tests.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dronehub::config::HubConfig;
use dronehub::engine::MockEngine;
use dronehub::error::HubResult;
use dronehub::hub::Hub;
use dronehub::prs::{MergeMethod, PrApi, PullRequestSummary};
use dronehub::registry::{GithubRepo, HubPhase};

/// Check if git is available on the system.
#[must_use]
pub fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

/// Initialize a git repository in the given directory with an initial commit.
///
/// # Panics
///
/// Panics if any git command fails.
pub fn init_git_repo(path: &Path) {
    run_git(path, &["init", "-b", "main"]);
    run_git(path, &["config", "user.email", "test@test.com"]);
    run_git(path, &["config", "user.name", "Test User"]);
    run_git(path, &["config", "commit.gpgsign", "false"]);

    std::fs::write(path.join("README.md"), "# Test Repository\n")
        .expect("Failed to write README.md");
    run_git(path, &["add", "."]);
    run_git(path, &["commit", "-m", "Initial commit"]);
}

/// Stage and commit one file.
pub fn commit_file(repo: &Path, file: &str, content: &str, message: &str) {
    std::fs::write(repo.join(file), content).expect("write file");
    run_git(repo, &["add", "."]);
    run_git(repo, &["commit", "-m", message]);
}

/// Current HEAD of a repo.
#[must_use]
pub fn head_sha(repo: &Path) -> String {
    let out = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo)
        .output()
        .expect("git rev-parse");
    assert!(out.status.success(), "rev-parse failed");
    String::from_utf8_lossy(&out.stdout).trim().to_owned()
}

/// Run a git command, asserting success.
pub fn run_git(repo: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn git {args:?}: {e}"));
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Canned PR API with scripted summaries and recorded merges.
#[derive(Default)]
pub struct MockPrApi {
    pub open: std::sync::Mutex<Vec<PullRequestSummary>>,
    pub merged: std::sync::Mutex<Vec<u64>>,
    pub closed: std::sync::Mutex<Vec<u64>>,
}

#[async_trait]
impl PrApi for MockPrApi {
    async fn list_open(&self, _repo: &GithubRepo) -> HubResult<Vec<PullRequestSummary>> {
        Ok(self.open.lock().expect("lock").clone())
    }

    async fn fetch(&self, _repo: &GithubRepo, number: u64) -> HubResult<PullRequestSummary> {
        self.open
            .lock()
            .expect("lock")
            .iter()
            .find(|p| p.number == number)
            .cloned()
            .ok_or_else(|| dronehub::error::HubError::not_found("pull request"))
    }

    async fn merge(
        &self,
        _repo: &GithubRepo,
        number: u64,
        _method: MergeMethod,
    ) -> HubResult<()> {
        self.merged.lock().expect("lock").push(number);
        Ok(())
    }

    async fn close(&self, _repo: &GithubRepo, number: u64) -> HubResult<()> {
        self.closed.lock().expect("lock").push(number);
        Ok(())
    }
}

/// Everything a hub test needs, with mocks injected.
pub struct TestHub {
    pub hub: Arc<Hub>,
    pub engine: Arc<MockEngine>,
    pub prs: Arc<MockPrApi>,
    pub dir: tempfile::TempDir,
}

/// Build a hub over a `MockEngine` and `MockPrApi` in a temp data dir.
#[must_use]
pub fn test_hub() -> TestHub {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(MockEngine::new(dir.path().join("containers")));
    let prs = Arc::new(MockPrApi::default());

    let hub = Hub::assemble(
        HubConfig::default(),
        &dir.path().join("registry.json"),
        Arc::clone(&engine) as _,
        Arc::clone(&prs) as _,
        None,
        CancellationToken::new(),
    )
    .expect("assemble hub");

    TestHub {
        hub,
        engine,
        prs,
        dir,
    }
}

/// Poll the registry until the drone reaches `phase` (or panic after the
/// deadline, printing the record for diagnosis).
pub async fn wait_for_phase(hub: &Arc<Hub>, id: &str, phase: HubPhase) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let drone = hub.registry().get(id).await;
        if let Some(d) = &drone {
            if d.hub_phase == phase {
                return;
            }
            if d.hub_phase == HubPhase::Error && phase != HubPhase::Error {
                panic!("drone entered error instead of {phase}: {d:?}");
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "drone {id} never reached {phase}: {drone:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
