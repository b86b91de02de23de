//! Lifecycle orchestrator scenarios: queue batches, rename gating,
//! idempotent delete, clone, base image.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{git_available, init_git_repo, test_hub, wait_for_phase};
use dronehub::engine::ContainerEngine;
use dronehub::lifecycle::{CloneRequest, DroneQueueSpec};
use dronehub::registry::{HubPhase, NewDrone, TransitionUpdate};
use dronehub::sync::DRONE_REPO_PATH;

fn bare_spec(name: &str) -> DroneQueueSpec {
    DroneQueueSpec {
        name: name.to_owned(),
        group: None,
        repo_path: None,
        build: None,
        seed_agent: "true".to_owned(),
        seed_model: None,
        seed_chat: None,
        seed_prompt: None,
    }
}

#[tokio::test]
async fn queue_reports_accepted_and_rejected_by_name() {
    let t = test_hub();

    let outcome = t
        .hub
        .lifecycle()
        .queue(vec![bare_spec("alpha"), bare_spec("alpha"), bare_spec("beta")])
        .await;

    assert_eq!(outcome.accepted.len(), 2);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].name, "alpha");
    assert_eq!(outcome.rejected[0].code, "name_conflict");

    for accepted in &outcome.accepted {
        wait_for_phase(&t.hub, &accepted.id, HubPhase::Ready).await;
    }
}

#[tokio::test]
async fn queue_rejects_unregistered_repo() {
    let t = test_hub();
    let mut spec = bare_spec("needs-repo");
    spec.repo_path = Some(t.dir.path().join("nope"));

    let outcome = t.hub.lifecycle().queue(vec![spec]).await;
    assert_eq!(outcome.accepted.len(), 0);
    assert_eq!(outcome.rejected[0].code, "not_found");
}

#[tokio::test]
async fn rename_while_seeding_is_a_state_violation() {
    let t = test_hub();
    // Drive the record into seeding directly; the orchestrator's rename
    // precondition is what's under test.
    let drone = t
        .hub
        .registry()
        .insert_starting(NewDrone {
            name: "mid-seed".to_owned(),
            group: None,
            repo_path: None,
            container_port: 3000,
        })
        .await
        .expect("insert");
    t.hub
        .registry()
        .transition(&drone.id, HubPhase::Starting, TransitionUpdate::default())
        .await
        .expect("starting");
    t.hub
        .registry()
        .transition(&drone.id, HubPhase::Seeding, TransitionUpdate::default())
        .await
        .expect("seeding");
    t.hub
        .registry()
        .set_busy(&drone.id, false)
        .await
        .expect("clear busy");

    let err = t
        .hub
        .lifecycle()
        .rename(&drone.id, "new-name", false)
        .await
        .expect_err("rename mid-seed");
    assert_eq!(err.code(), "state_violation");
}

#[tokio::test]
async fn rename_updates_registry_and_engine() {
    let t = test_hub();
    let outcome = t.hub.lifecycle().queue(vec![bare_spec("old-name")]).await;
    let id = outcome.accepted[0].id.clone();
    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;

    let (old, new) = t
        .hub
        .lifecycle()
        .rename(&id, "new-name", false)
        .await
        .expect("rename");
    assert_eq!(old, "old-name");
    assert_eq!(new, "new-name");

    let names = t.engine.ls().await.expect("ls");
    assert!(names.contains(&"new-name".to_owned()), "engine renamed: {names:?}");
    assert!(!names.contains(&"old-name".to_owned()));
    assert_eq!(
        t.hub.registry().get(&id).await.expect("drone").name,
        "new-name"
    );
}

#[tokio::test]
async fn delete_is_idempotent() {
    let t = test_hub();
    let outcome = t.hub.lifecycle().queue(vec![bare_spec("short-lived")]).await;
    let id = outcome.accepted[0].id.clone();
    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;

    assert!(t.hub.lifecycle().delete(&id).await.expect("first delete"));
    assert!(!t.hub.lifecycle().delete(&id).await.expect("repeat delete"));
    assert!(t.hub.registry().get(&id).await.is_none());
    assert!(t.engine.ls().await.expect("ls").is_empty());
}

#[tokio::test]
async fn base_image_requires_ready() {
    let t = test_hub();
    let drone = t
        .hub
        .registry()
        .insert_starting(NewDrone {
            name: "still-creating".to_owned(),
            group: None,
            repo_path: None,
            container_port: 3000,
        })
        .await
        .expect("insert");
    t.hub
        .registry()
        .set_busy(&drone.id, false)
        .await
        .expect("clear busy");

    let err = t
        .hub
        .lifecycle()
        .set_base_image(&drone.id)
        .await
        .expect_err("not ready");
    assert_eq!(err.code(), "state_violation");
}

#[tokio::test]
async fn base_image_returns_the_new_tag() {
    let t = test_hub();
    let outcome = t.hub.lifecycle().queue(vec![bare_spec("imaged")]).await;
    let id = outcome.accepted[0].id.clone();
    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;

    let tag = t.hub.lifecycle().set_base_image(&id).await.expect("base set");
    assert_eq!(tag.as_deref(), Some("dronehub/base:imaged"));
}

#[tokio::test]
async fn startup_reconcile_restarts_stopped_ready_drones_via_starting() {
    let t = test_hub();
    let outcome = t.hub.lifecycle().queue(vec![bare_spec("restarted")]).await;
    let id = outcome.accepted[0].id.clone();
    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;

    // The container lost its running state while the hub was down.
    t.engine.stop("restarted").await.expect("stop");
    assert!(!t.engine.is_running("restarted").await);
    // Slow the restart down so the intermediate phase is observable.
    t.engine.delay_op("start", Duration::from_millis(100)).await;

    let lifecycle = Arc::clone(t.hub.lifecycle());
    let reconcile = tokio::spawn(async move { lifecycle.startup_reconcile().await });

    // Clients polling hubPhase see the drone pass through `starting`.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let drone = t.hub.registry().get(&id).await.expect("drone");
        if drone.hub_phase == HubPhase::Starting {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "never observed starting during restart: {drone:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    reconcile.await.expect("join").expect("reconcile");
    let drone = t.hub.registry().get(&id).await.expect("drone");
    assert_eq!(drone.hub_phase, HubPhase::Ready);
    assert!(drone.status_ok);
    assert!(t.engine.is_running("restarted").await);
}

#[tokio::test]
async fn startup_reconcile_errors_drones_that_fail_to_restart() {
    let t = test_hub();
    let outcome = t.hub.lifecycle().queue(vec![bare_spec("wedged")]).await;
    let id = outcome.accepted[0].id.clone();
    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;

    t.engine.stop("wedged").await.expect("stop");
    t.engine.fail_op("start", "engine refused to start").await;

    t.hub
        .lifecycle()
        .startup_reconcile()
        .await
        .expect("reconcile");

    let drone = t.hub.registry().get(&id).await.expect("drone");
    assert_eq!(drone.hub_phase, HubPhase::Error);
    assert!(
        drone
            .status_error
            .as_deref()
            .is_some_and(|e| e.contains("engine refused")),
        "start failure surfaced: {drone:?}"
    );
}

#[tokio::test]
async fn startup_reconcile_marks_vanished_containers_as_error() {
    let t = test_hub();
    let outcome = t.hub.lifecycle().queue(vec![bare_spec("vanished")]).await;
    let id = outcome.accepted[0].id.clone();
    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;

    // The container was removed behind the hub's back.
    t.engine.remove("vanished", false).await.expect("remove");

    t.hub
        .lifecycle()
        .startup_reconcile()
        .await
        .expect("reconcile");

    let drone = t.hub.registry().get(&id).await.expect("drone");
    assert_eq!(drone.hub_phase, HubPhase::Error);
    assert!(!drone.status_ok);
}

#[tokio::test]
async fn clone_reuses_repo_and_base_sha_and_copies_chats() {
    if !git_available() {
        eprintln!("skipping: git not available");
        return;
    }
    let t = test_hub();
    let host_repo = t.dir.path().join("host-repo");
    std::fs::create_dir_all(&host_repo).expect("mkdir");
    init_git_repo(&host_repo);
    t.hub.register_repo(&host_repo).await.expect("register repo");

    let mut spec = bare_spec("clone-source");
    spec.repo_path = Some(host_repo.clone());
    let outcome = t.hub.lifecycle().queue(vec![spec]).await;
    let source_id = outcome.accepted[0].id.clone();
    wait_for_phase(&t.hub, &source_id, HubPhase::Ready).await;

    let source_base = t
        .engine
        .repo_base_sha("clone-source", DRONE_REPO_PATH)
        .await
        .expect("source base");

    // Something to carry across in the chats directory.
    let chats_dir = t
        .engine
        .host_path("clone-source", "/work/.dronehub/chats/default");
    std::fs::create_dir_all(&chats_dir).expect("mkdir chats");
    std::fs::write(chats_dir.join("transcript.jsonl"), "{}\n").expect("write chat");

    let accepted = t
        .hub
        .lifecycle()
        .clone_drone(
            &source_id,
            CloneRequest {
                name: "clone-copy".to_owned(),
                include_chats: true,
            },
        )
        .await
        .expect("clone");
    wait_for_phase(&t.hub, &accepted.id, HubPhase::Ready).await;

    let clone = t.hub.registry().get(&accepted.id).await.expect("clone record");
    assert_eq!(clone.repo_path.as_deref(), Some(host_repo.canonicalize().expect("canon").as_path()));

    let clone_base = t
        .engine
        .repo_base_sha("clone-copy", DRONE_REPO_PATH)
        .await
        .expect("clone base");
    assert_eq!(clone_base, source_base, "clone seeded at the source base SHA");

    let copied = t
        .engine
        .host_path("clone-copy", "/work/.dronehub/chats/default/transcript.jsonl");
    assert!(copied.exists(), "chats copied into the clone");
}
