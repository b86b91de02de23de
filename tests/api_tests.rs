//! HTTP contract tests: envelope shape, status codes, PR gating.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{git_available, init_git_repo, run_git, test_hub, wait_for_phase};
use dronehub::lifecycle::DroneQueueSpec;
use dronehub::prs::{ChecksState, PullRequestSummary, ReviewState};
use dronehub::registry::HubPhase;
use http_body_util::BodyExt;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

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

#[tokio::test]
async fn status_endpoint_reports_fleet_and_engine() {
    let t = test_hub();
    let app = dronehub::api::router(std::sync::Arc::clone(&t.hub));

    let response = app.oneshot(get("/api/status")).await.expect("status");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["drones"], 0);
    assert_eq!(body["engineOk"], true);
}

#[tokio::test]
async fn unknown_drone_is_404_with_error_envelope() {
    let t = test_hub();
    let app = dronehub::api::router(std::sync::Arc::clone(&t.hub));

    let response = app
        .oneshot(get("/api/drones/deadbeef"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["code"], "not_found");
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
}

#[tokio::test]
async fn malformed_drone_id_is_400() {
    let t = test_hub();
    let app = dronehub::api::router(std::sync::Arc::clone(&t.hub));

    let response = app
        .oneshot(get("/api/drones/..%2Fetc"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "invalid_name");
}

#[tokio::test]
async fn queue_then_poll_until_ready() {
    let t = test_hub();
    let app = dronehub::api::router(std::sync::Arc::clone(&t.hub));

    let response = app
        .clone()
        .oneshot(post(
            "/api/drones",
            serde_json::json!({
                "drones": [{ "name": "via-http", "seedAgent": "true" }]
            }),
        ))
        .await
        .expect("queue");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["accepted"][0]["name"], "via-http");
    let id = body["accepted"][0]["id"].as_str().expect("id").to_owned();

    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;

    let response = app
        .oneshot(get(&format!("/api/drones/{id}")))
        .await
        .expect("get drone");
    let body = body_json(response).await;
    assert_eq!(body["drone"]["hubPhase"], "ready");
    assert_eq!(body["drone"]["busy"], false);
}

#[tokio::test]
async fn delete_is_idempotent_over_http() {
    let t = test_hub();
    let app = dronehub::api::router(std::sync::Arc::clone(&t.hub));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/drones/neverexisted")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("delete");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn prompt_flow_over_http() {
    let t = test_hub();
    let app = dronehub::api::router(std::sync::Arc::clone(&t.hub));

    let response = app
        .clone()
        .oneshot(post(
            "/api/drones",
            serde_json::json!({
                "drones": [{ "name": "http-prompt", "seedAgent": "true" }]
            }),
        ))
        .await
        .expect("queue");
    let body = body_json(response).await;
    let id = body["accepted"][0]["id"].as_str().expect("id").to_owned();
    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;

    let response = app
        .clone()
        .oneshot(post(
            &format!("/api/drones/{id}/chats/default/prompt"),
            serde_json::json!({ "prompt": "hello" }),
        ))
        .await
        .expect("prompt");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["accepted"], true);
    let prompt_id = body["promptId"].as_str().expect("prompt id").to_owned();

    let response = app
        .clone()
        .oneshot(get(&format!("/api/drones/{id}/chats/default/pending")))
        .await
        .expect("pending");
    let body = body_json(response).await;
    assert_eq!(body["pending"][0]["id"], prompt_id.as_str());
    assert_eq!(body["pending"][0]["state"], "sent");

    // Unsticking a fresh prompt is a 409.
    let response = app
        .oneshot(post(
            &format!("/api/drones/{id}/chats/default/pending/{prompt_id}/unstick"),
            serde_json::json!({}),
        ))
        .await
        .expect("unstick");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["code"], "state_violation");
}

#[tokio::test]
async fn terminal_open_and_output_over_http() {
    let t = test_hub();
    let app = dronehub::api::router(std::sync::Arc::clone(&t.hub));

    let response = app
        .clone()
        .oneshot(post(
            "/api/drones",
            serde_json::json!({
                "drones": [{ "name": "http-term", "seedAgent": "true" }]
            }),
        ))
        .await
        .expect("queue");
    let body = body_json(response).await;
    let id = body["accepted"][0]["id"].as_str().expect("id").to_owned();
    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;

    let response = app
        .clone()
        .oneshot(post(
            &format!("/api/drones/{id}/terminal/open?mode=shell&chat=default"),
            serde_json::json!({}),
        ))
        .await
        .expect("open");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let session = body["sessionName"].as_str().expect("session").to_owned();
    assert_eq!(session, "shell-default");

    t.engine
        .push_session_output("http-term", &session, b"boot banner\n")
        .await;

    let response = app
        .oneshot(get(&format!(
            "/api/drones/{id}/terminal/{session}/output?since=0&maxBytes=1024"
        )))
        .await
        .expect("output");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["text"], "boot banner\n");
    assert_eq!(body["offsetBytes"], 12);
}

#[tokio::test]
async fn bulk_merge_with_mixed_gating() {
    if !git_available() {
        eprintln!("skipping: git not available");
        return;
    }
    let t = test_hub();

    // A repo with GitHub coordinates from its origin remote.
    let host_repo = t.dir.path().join("host-repo");
    std::fs::create_dir_all(&host_repo).expect("mkdir");
    init_git_repo(&host_repo);
    run_git(
        &host_repo,
        &["remote", "add", "origin", "git@github.com:octo/hub.git"],
    );
    t.hub.register_repo(&host_repo).await.expect("register repo");

    let outcome = t
        .hub
        .lifecycle()
        .queue(vec![DroneQueueSpec {
            name: "pr-drone".to_owned(),
            group: None,
            repo_path: Some(host_repo.clone()),
            build: None,
            seed_agent: "true".to_owned(),
            seed_model: None,
            seed_chat: None,
            seed_prompt: None,
        }])
        .await;
    let id = outcome.accepted[0].id.clone();
    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;

    // Three open PRs: one clean, one conflicted, one with failing checks.
    {
        let mut open = t.prs.open.lock().expect("lock");
        open.push(summary(1));
        let mut conflicted = summary(2);
        conflicted.has_merge_conflicts = true;
        open.push(conflicted);
        let mut failing = summary(3);
        failing.checks_state = ChecksState::Failing;
        open.push(failing);
    }

    let app = dronehub::api::router(std::sync::Arc::clone(&t.hub));
    let response = app
        .clone()
        .oneshot(post(
            &format!("/api/drones/{id}/repo/pull-requests/merge-all"),
            serde_json::json!({ "method": "squash" }),
        ))
        .await
        .expect("merge all");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["merged"], 1);
    let skipped = body["skipped"].as_array().expect("skipped");
    assert_eq!(skipped.len(), 2);
    let reasons: Vec<&str> = skipped
        .iter()
        .map(|s| s["reason"].as_str().expect("reason"))
        .collect();
    assert!(reasons.contains(&"blocked_conflict"));
    assert!(reasons.contains(&"blocked_policy"));
    assert_eq!(body["failed"].as_array().expect("failed").len(), 0);
    assert_eq!(*t.prs.merged.lock().expect("lock"), vec![1]);

    // Single merge of the failing-checks PR: 409 without force, 200 with.
    let response = app
        .clone()
        .oneshot(post(
            &format!("/api/drones/{id}/repo/pull-requests/3/merge"),
            serde_json::json!({ "method": "merge" }),
        ))
        .await
        .expect("gated merge");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["code"], "blocked_policy");

    let response = app
        .oneshot(post(
            &format!("/api/drones/{id}/repo/pull-requests/3/merge"),
            serde_json::json!({ "method": "merge", "force": true }),
        ))
        .await
        .expect("forced merge");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(*t.prs.merged.lock().expect("lock"), vec![1, 3]);
}

#[tokio::test]
async fn working_tree_changes_over_http() {
    if !git_available() {
        eprintln!("skipping: git not available");
        return;
    }
    let t = test_hub();
    let host_repo = t.dir.path().join("host-repo");
    std::fs::create_dir_all(&host_repo).expect("mkdir");
    init_git_repo(&host_repo);
    t.hub.register_repo(&host_repo).await.expect("register repo");

    let outcome = t
        .hub
        .lifecycle()
        .queue(vec![DroneQueueSpec {
            name: "dirty-drone".to_owned(),
            group: None,
            repo_path: Some(host_repo),
            build: None,
            seed_agent: "true".to_owned(),
            seed_model: None,
            seed_chat: None,
            seed_prompt: None,
        }])
        .await;
    let id = outcome.accepted[0].id.clone();
    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;

    // One modification, one untracked file inside the drone.
    let drone_repo = t
        .engine
        .host_path("dirty-drone", dronehub::sync::DRONE_REPO_PATH);
    std::fs::write(drone_repo.join("README.md"), "changed\n").expect("modify");
    std::fs::write(drone_repo.join("notes.txt"), "scratch\n").expect("untracked");

    let app = dronehub::api::router(std::sync::Arc::clone(&t.hub));
    let response = app
        .oneshot(get(&format!("/api/drones/{id}/repo/changes")))
        .await
        .expect("changes");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["counts"]["untracked"], 1);
    assert_eq!(body["counts"]["unstaged"], 1);

    let entries = body["entries"].as_array().expect("entries");
    let paths: Vec<&str> = entries
        .iter()
        .map(|e| e["path"].as_str().expect("path"))
        .collect();
    assert_eq!(paths, vec!["README.md", "notes.txt"], "sorted by path");
}
