//! GitHub REST client for pull-request operations.

use async_trait::async_trait;
use serde::Deserialize;

use super::{ChecksState, MergeMethod, PullRequestSummary, ReviewState};
use crate::error::{HubError, HubResult};
use crate::registry::GithubRepo;

/// Hosting-service operations the controller needs. Tests substitute a
/// canned implementation.
#[async_trait]
pub trait PrApi: Send + Sync {
    /// All open pull requests with gating info.
    async fn list_open(&self, repo: &GithubRepo) -> HubResult<Vec<PullRequestSummary>>;

    /// One pull request, freshly fetched (for pre-merge gating).
    async fn fetch(&self, repo: &GithubRepo, number: u64) -> HubResult<PullRequestSummary>;

    /// Merge with the chosen method.
    async fn merge(&self, repo: &GithubRepo, number: u64, method: MergeMethod) -> HubResult<()>;

    /// Close without merging.
    async fn close(&self, repo: &GithubRepo, number: u64) -> HubResult<()>;
}

/// Production client for the GitHub REST API.
pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl std::fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

// Wire shapes; GitHub uses snake_case.
#[derive(Debug, Deserialize)]
struct WireUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct WireRepoRef {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct WireBranch {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: String,
    repo: Option<WireRepoRef>,
}

#[derive(Debug, Deserialize)]
struct WirePull {
    number: u64,
    title: String,
    state: String,
    draft: bool,
    html_url: String,
    user: Option<WireUser>,
    base: WireBranch,
    head: WireBranch,
    mergeable: Option<bool>,
    mergeable_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCheckRuns {
    check_runs: Vec<WireCheckRun>,
}

#[derive(Debug, Deserialize)]
struct WireCheckRun {
    status: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireReview {
    user: Option<WireUser>,
    state: String,
}

impl GithubClient {
    /// Build a client; `token` comes from config or `GITHUB_TOKEN`.
    pub fn new(api_base: String, token: Option<String>) -> HubResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent("dronehub")
            .build()
            .map_err(|e| HubError::Internal(anyhow::anyhow!("building http client: {e}")))?;
        Ok(Self {
            http,
            api_base,
            token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{path}", self.api_base))
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> HubResult<reqwest::Response> {
        let response = builder.send().await.map_err(|e| HubError::UpstreamHttp {
            status: 0,
            body: e.to_string(),
        })?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(HubError::AuthFailure);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(HubError::not_found("pull request"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::UpstreamHttp {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }
        Ok(response)
    }

    async fn checks_state(&self, repo: &GithubRepo, head_sha: &str) -> ChecksState {
        let path = format!(
            "/repos/{}/{}/commits/{head_sha}/check-runs",
            repo.owner, repo.repo
        );
        let response = match self.send(self.request(reqwest::Method::GET, &path)).await {
            Ok(r) => r,
            Err(_) => return ChecksState::Unknown,
        };
        let runs: WireCheckRuns = match response.json().await {
            Ok(r) => r,
            Err(_) => return ChecksState::Unknown,
        };
        aggregate_checks(&runs.check_runs)
    }

    async fn review_state(&self, repo: &GithubRepo, number: u64) -> ReviewState {
        let path = format!("/repos/{}/{}/pulls/{number}/reviews", repo.owner, repo.repo);
        let response = match self.send(self.request(reqwest::Method::GET, &path)).await {
            Ok(r) => r,
            Err(_) => return ReviewState::Unknown,
        };
        let reviews: Vec<WireReview> = match response.json().await {
            Ok(r) => r,
            Err(_) => return ReviewState::Unknown,
        };
        aggregate_reviews(&reviews)
    }

    async fn summarise(&self, repo: &GithubRepo, pull: WirePull) -> PullRequestSummary {
        let checks_state = self.checks_state(repo, &pull.head.sha).await;
        let review_state = self.review_state(repo, pull.number).await;
        summary_from_wire(pull, checks_state, review_state)
    }
}

/// Aggregate check runs: any failure wins, then any incompleteness, then
/// all-green; no runs at all is unknown.
fn aggregate_checks(runs: &[WireCheckRun]) -> ChecksState {
    if runs.is_empty() {
        return ChecksState::Unknown;
    }
    let failing = runs.iter().any(|r| {
        matches!(
            r.conclusion.as_deref(),
            Some("failure" | "cancelled" | "timed_out" | "action_required")
        )
    });
    if failing {
        return ChecksState::Failing;
    }
    if runs.iter().any(|r| r.status != "completed") {
        return ChecksState::Pending;
    }
    if runs
        .iter()
        .all(|r| matches!(r.conclusion.as_deref(), Some("success" | "skipped" | "neutral")))
    {
        ChecksState::Success
    } else {
        ChecksState::Pending
    }
}

/// Aggregate reviews by latest verdict per reviewer.
fn aggregate_reviews(reviews: &[WireReview]) -> ReviewState {
    use std::collections::HashMap;

    let mut latest: HashMap<&str, &str> = HashMap::new();
    for review in reviews {
        let Some(user) = &review.user else { continue };
        match review.state.as_str() {
            "APPROVED" | "CHANGES_REQUESTED" | "DISMISSED" => {
                latest.insert(user.login.as_str(), review.state.as_str());
            }
            _ => {}
        }
    }

    if latest.values().any(|s| *s == "CHANGES_REQUESTED") {
        ReviewState::ChangesRequested
    } else if latest.values().any(|s| *s == "APPROVED") {
        ReviewState::Approved
    } else {
        ReviewState::ReviewRequired
    }
}

fn summary_from_wire(
    pull: WirePull,
    checks_state: ChecksState,
    review_state: ReviewState,
) -> PullRequestSummary {
    let is_cross_repository = match (&pull.head.repo, &pull.base.repo) {
        (Some(head), Some(base)) => head.full_name != base.full_name,
        _ => false,
    };
    let has_merge_conflicts = pull.mergeable == Some(false)
        || pull.mergeable_state.as_deref() == Some("dirty");

    PullRequestSummary {
        number: pull.number,
        title: pull.title,
        state: pull.state,
        draft: pull.draft,
        html_url: pull.html_url,
        author_login: pull.user.map(|u| u.login),
        base_ref_name: pull.base.ref_name,
        head_ref_name: pull.head.ref_name,
        is_cross_repository,
        checks_state,
        review_state,
        has_merge_conflicts,
    }
}

#[async_trait]
impl PrApi for GithubClient {
    async fn list_open(&self, repo: &GithubRepo) -> HubResult<Vec<PullRequestSummary>> {
        let path = format!(
            "/repos/{}/{}/pulls?state=open&per_page=50",
            repo.owner, repo.repo
        );
        let response = self.send(self.request(reqwest::Method::GET, &path)).await?;
        let pulls: Vec<WirePull> =
            response.json().await.map_err(|e| HubError::UpstreamHttp {
                status: 0,
                body: format!("unparseable pull list: {e}"),
            })?;

        let mut summaries = Vec::with_capacity(pulls.len());
        for pull in pulls {
            // The list payload omits mergeability; fetch the detail view.
            let detailed = self.fetch(repo, pull.number).await.unwrap_or_else(|_| {
                summary_from_wire(pull, ChecksState::Unknown, ReviewState::Unknown)
            });
            summaries.push(detailed);
        }
        summaries.sort_by_key(|s| s.number);
        Ok(summaries)
    }

    async fn fetch(&self, repo: &GithubRepo, number: u64) -> HubResult<PullRequestSummary> {
        let path = format!("/repos/{}/{}/pulls/{number}", repo.owner, repo.repo);
        let response = self.send(self.request(reqwest::Method::GET, &path)).await?;
        let pull: WirePull = response.json().await.map_err(|e| HubError::UpstreamHttp {
            status: 0,
            body: format!("unparseable pull request: {e}"),
        })?;
        Ok(self.summarise(repo, pull).await)
    }

    async fn merge(&self, repo: &GithubRepo, number: u64, method: MergeMethod) -> HubResult<()> {
        let path = format!("/repos/{}/{}/pulls/{number}/merge", repo.owner, repo.repo);
        let body = serde_json::json!({ "merge_method": method.as_str() });
        self.send(self.request(reqwest::Method::PUT, &path).json(&body))
            .await?;
        Ok(())
    }

    async fn close(&self, repo: &GithubRepo, number: u64) -> HubResult<()> {
        let path = format!("/repos/{}/{}/pulls/{number}", repo.owner, repo.repo);
        let body = serde_json::json!({ "state": "closed" });
        self.send(self.request(reqwest::Method::PATCH, &path).json(&body))
            .await?;
        Ok(())
    }
}

/// Keep upstream error bodies bounded in diagnostics.
fn truncate_body(body: &str) -> String {
    let limit = crate::error::STDERR_TAIL_LIMIT;
    if body.len() <= limit {
        return body.to_owned();
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: &str, conclusion: Option<&str>) -> WireCheckRun {
        WireCheckRun {
            status: status.to_owned(),
            conclusion: conclusion.map(str::to_owned),
        }
    }

    #[test]
    fn checks_aggregation_rules() {
        assert_eq!(aggregate_checks(&[]), ChecksState::Unknown);
        assert_eq!(
            aggregate_checks(&[run("completed", Some("success"))]),
            ChecksState::Success
        );
        assert_eq!(
            aggregate_checks(&[
                run("completed", Some("success")),
                run("in_progress", None)
            ]),
            ChecksState::Pending
        );
        assert_eq!(
            aggregate_checks(&[
                run("completed", Some("success")),
                run("completed", Some("failure"))
            ]),
            ChecksState::Failing
        );
        assert_eq!(
            aggregate_checks(&[run("completed", Some("skipped"))]),
            ChecksState::Success
        );
    }

    fn review(login: &str, state: &str) -> WireReview {
        WireReview {
            user: Some(WireUser {
                login: login.to_owned(),
            }),
            state: state.to_owned(),
        }
    }

    #[test]
    fn review_aggregation_uses_latest_per_reviewer() {
        assert_eq!(aggregate_reviews(&[]), ReviewState::ReviewRequired);
        assert_eq!(
            aggregate_reviews(&[review("a", "APPROVED")]),
            ReviewState::Approved
        );
        // A later approval supersedes the same reviewer's earlier block.
        assert_eq!(
            aggregate_reviews(&[
                review("a", "CHANGES_REQUESTED"),
                review("a", "APPROVED")
            ]),
            ReviewState::Approved
        );
        assert_eq!(
            aggregate_reviews(&[review("a", "APPROVED"), review("b", "CHANGES_REQUESTED")]),
            ReviewState::ChangesRequested
        );
    }
}
