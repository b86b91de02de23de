//! PR Controller: list, merge, and close pull requests for a drone's repo,
//! with status gating and bulk-merge aggregation.

mod github;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};
use crate::registry::{GithubRepo, Registry};

pub use github::{GithubClient, PrApi};

/// Aggregated CI state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksState {
    /// All checks green.
    Success,
    /// At least one check failed.
    Failing,
    /// Checks still running.
    Pending,
    /// No data.
    Unknown,
}

/// Aggregated review state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    /// Approved by at least one reviewer, none blocking.
    Approved,
    /// A reviewer requested changes.
    ChangesRequested,
    /// No blocking or approving review yet.
    ReviewRequired,
    /// No data.
    Unknown,
}

/// How to merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    /// Merge commit.
    Merge,
    /// Squash into one commit.
    Squash,
    /// Rebase onto the base branch.
    Rebase,
}

impl MergeMethod {
    /// The API's name for the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Squash => "squash",
            Self::Rebase => "rebase",
        }
    }
}

/// One open pull request as served to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSummary {
    /// PR number.
    pub number: u64,
    /// Title.
    pub title: String,
    /// Upstream state string (`open`, …).
    pub state: String,
    /// Whether the PR is a draft.
    pub draft: bool,
    /// Web URL.
    pub html_url: String,
    /// Author login, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_login: Option<String>,
    /// Base branch name.
    pub base_ref_name: String,
    /// Head branch name.
    pub head_ref_name: String,
    /// Whether the head lives in a fork.
    pub is_cross_repository: bool,
    /// Aggregated check state.
    pub checks_state: ChecksState,
    /// Aggregated review state.
    pub review_state: ReviewState,
    /// Whether the PR cannot merge cleanly.
    pub has_merge_conflicts: bool,
}

/// One skipped entry of a bulk merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedMerge {
    /// PR number.
    pub number: u64,
    /// `blocked_conflict` or `blocked_policy`.
    pub reason: String,
    /// Human detail.
    pub detail: String,
}

/// One failed entry of a bulk merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedMerge {
    /// PR number.
    pub number: u64,
    /// The upstream error.
    pub error: String,
}

/// Aggregated result of a bulk merge; failures never abort the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkMergeOutcome {
    /// Successfully merged count.
    pub merged: u32,
    /// Gated entries, with reasons.
    pub skipped: Vec<SkippedMerge>,
    /// Upstream failures.
    pub failed: Vec<FailedMerge>,
}

/// Gate a merge request against the summary's status fields.
///
/// Conflicts and hard policy blocks (draft, changes requested) always
/// refuse; non-green checks refuse unless `force` is set.
pub fn merge_gate(summary: &PullRequestSummary, force: bool) -> HubResult<()> {
    if summary.has_merge_conflicts {
        return Err(HubError::BlockedConflict {
            number: summary.number,
        });
    }
    if summary.draft {
        return Err(HubError::BlockedPolicy {
            number: summary.number,
            reason: "pull request is a draft".to_owned(),
        });
    }
    if summary.review_state == ReviewState::ChangesRequested {
        return Err(HubError::BlockedPolicy {
            number: summary.number,
            reason: "changes requested by a reviewer".to_owned(),
        });
    }
    if !force && matches!(summary.checks_state, ChecksState::Pending | ChecksState::Failing) {
        let state = match summary.checks_state {
            ChecksState::Pending => "pending",
            _ => "failing",
        };
        return Err(HubError::BlockedPolicy {
            number: summary.number,
            reason: format!("checks are {state}; pass force to merge anyway"),
        });
    }
    Ok(())
}

/// The controller: resolves a drone to GitHub coordinates and applies the
/// gating policy around the raw API.
pub struct PrController {
    api: Arc<dyn PrApi>,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for PrController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrController").finish_non_exhaustive()
    }
}

impl PrController {
    /// Build the controller.
    #[must_use]
    pub fn new(api: Arc<dyn PrApi>, registry: Arc<Registry>) -> Self {
        Self { api, registry }
    }

    /// GitHub coordinates of a drone's attached repository.
    async fn coords(&self, drone_id: &str) -> HubResult<GithubRepo> {
        let drone = self
            .registry
            .get(drone_id)
            .await
            .ok_or_else(|| HubError::not_found(format!("drone {drone_id}")))?;
        let repo_path = drone
            .repo_path
            .as_ref()
            .ok_or_else(|| HubError::not_found("repository for drone"))?;
        let repo = self
            .registry
            .get_repo(repo_path)
            .await
            .ok_or_else(|| HubError::not_found("repository record"))?;
        repo.github
            .ok_or_else(|| HubError::not_found("GitHub coordinates for repository"))
    }

    /// Open pull requests for the drone's repo.
    pub async fn list(&self, drone_id: &str) -> HubResult<Vec<PullRequestSummary>> {
        let coords = self.coords(drone_id).await?;
        self.api.list_open(&coords).await
    }

    /// Merge one PR, gated on fresh status.
    pub async fn merge(
        &self,
        drone_id: &str,
        number: u64,
        method: MergeMethod,
        force: bool,
    ) -> HubResult<()> {
        let coords = self.coords(drone_id).await?;
        let summary = self.api.fetch(&coords, number).await?;
        merge_gate(&summary, force)?;
        self.api.merge(&coords, number, method).await?;
        tracing::info!(drone = drone_id, number, method = method.as_str(), "merged PR");
        Ok(())
    }

    /// Close one PR without merging.
    pub async fn close(&self, drone_id: &str, number: u64) -> HubResult<()> {
        let coords = self.coords(drone_id).await?;
        self.api.close(&coords, number).await?;
        tracing::info!(drone = drone_id, number, "closed PR");
        Ok(())
    }

    /// Merge every open PR sequentially; blocked items are skipped with a
    /// reason, upstream failures are collected, nothing aborts the batch.
    pub async fn merge_all(
        &self,
        drone_id: &str,
        method: MergeMethod,
        force: bool,
    ) -> HubResult<BulkMergeOutcome> {
        let coords = self.coords(drone_id).await?;
        let open = self.api.list_open(&coords).await?;

        let mut outcome = BulkMergeOutcome::default();
        for summary in open {
            if let Err(gate) = merge_gate(&summary, force) {
                outcome.skipped.push(SkippedMerge {
                    number: summary.number,
                    reason: gate.code().to_owned(),
                    detail: gate.to_string(),
                });
                continue;
            }
            match self.api.merge(&coords, summary.number, method).await {
                Ok(()) => outcome.merged += 1,
                Err(e) => outcome.failed.push(FailedMerge {
                    number: summary.number,
                    error: e.to_string(),
                }),
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(number: u64) -> PullRequestSummary {
        PullRequestSummary {
            number,
            title: format!("PR {number}"),
            state: "open".to_owned(),
            draft: false,
            html_url: format!("https://github.com/octo/hub/pull/{number}"),
            author_login: Some("octocat".to_owned()),
            base_ref_name: "main".to_owned(),
            head_ref_name: format!("feature-{number}"),
            is_cross_repository: false,
            checks_state: ChecksState::Success,
            review_state: ReviewState::Approved,
            has_merge_conflicts: false,
        }
    }

    #[test]
    fn clean_pr_passes_the_gate() {
        assert!(merge_gate(&summary(1), false).is_ok());
    }

    #[test]
    fn conflicts_always_block() {
        let mut pr = summary(2);
        pr.has_merge_conflicts = true;
        let err = merge_gate(&pr, true).expect_err("conflict blocks even with force");
        assert_eq!(err.code(), "blocked_conflict");
    }

    #[test]
    fn draft_and_changes_requested_block_regardless_of_force() {
        let mut pr = summary(3);
        pr.draft = true;
        assert_eq!(
            merge_gate(&pr, true).expect_err("draft").code(),
            "blocked_policy"
        );

        let mut pr = summary(4);
        pr.review_state = ReviewState::ChangesRequested;
        assert_eq!(
            merge_gate(&pr, true).expect_err("changes requested").code(),
            "blocked_policy"
        );
    }

    #[test]
    fn non_green_checks_require_force() {
        for state in [ChecksState::Pending, ChecksState::Failing] {
            let mut pr = summary(5);
            pr.checks_state = state;
            assert_eq!(
                merge_gate(&pr, false).expect_err("gated").code(),
                "blocked_policy"
            );
            assert!(merge_gate(&pr, true).is_ok(), "force overrides {state:?}");
        }
    }

    #[test]
    fn unknown_checks_do_not_gate() {
        let mut pr = summary(6);
        pr.checks_state = ChecksState::Unknown;
        assert!(merge_gate(&pr, false).is_ok());
    }
}
