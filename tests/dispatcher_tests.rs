//! Prompt dispatch, pending reconciliation, and unstick gating.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_hub, wait_for_phase};
use dronehub::lifecycle::DroneQueueSpec;
use dronehub::prompts::{PendingState, SendPrompt, chat_log_path};
use dronehub::registry::HubPhase;

fn spec(name: &str) -> DroneQueueSpec {
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

async fn ready_drone(t: &common::TestHub, name: &str) -> String {
    let outcome = t.hub.lifecycle().queue(vec![spec(name)]).await;
    assert!(outcome.rejected.is_empty(), "{:?}", outcome.rejected);
    let id = outcome.accepted[0].id.clone();
    wait_for_phase(&t.hub, &id, HubPhase::Ready).await;
    id
}

#[tokio::test]
async fn send_reaches_the_agent_session_and_pending_shows_sent() {
    let t = test_hub();
    let id = ready_drone(&t, "prompted").await;

    let receipt = t
        .hub
        .prompts()
        .send(
            &id,
            "default",
            SendPrompt {
                prompt: "hello".to_owned(),
                attachments: Vec::new(),
            },
        )
        .await
        .expect("send");

    let pending = t.hub.prompts().pending(&id, "default").await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, receipt.prompt_id);
    assert_eq!(pending[0].state, PendingState::Sent);

    // The agent session received the text and an Enter press, in order.
    let inputs = t.engine.session_inputs("prompted", "agent-default").await;
    assert_eq!(inputs, vec!["hello".to_owned(), "\n".to_owned()]);
}

#[tokio::test]
async fn concurrent_sends_never_overlap_in_sending() {
    let t = test_hub();
    let id = ready_drone(&t, "serialised").await;
    // Slow the session write down so the in-flight window is observable.
    t.engine
        .delay_op("session_send", Duration::from_millis(60))
        .await;

    let hub_a = Arc::clone(&t.hub);
    let hub_b = Arc::clone(&t.hub);
    let id_a = id.clone();
    let id_b = id.clone();
    let a = tokio::spawn(async move {
        hub_a
            .prompts()
            .send(
                &id_a,
                "default",
                SendPrompt {
                    prompt: "first".to_owned(),
                    attachments: Vec::new(),
                },
            )
            .await
    });
    let b = tokio::spawn(async move {
        hub_b
            .prompts()
            .send(
                &id_b,
                "default",
                SendPrompt {
                    prompt: "second".to_owned(),
                    attachments: Vec::new(),
                },
            )
            .await
    });

    // Sample the pending list while both sends are in flight: at no
    // observed instant may more than one prompt be `sending`.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !(a.is_finished() && b.is_finished()) {
        let sending = t
            .hub
            .prompts()
            .pending(&id, "default")
            .await
            .iter()
            .filter(|p| p.state == PendingState::Sending)
            .count();
        assert!(sending <= 1, "observed {sending} prompts in sending at once");
        assert!(
            tokio::time::Instant::now() < deadline,
            "sends never finished"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    a.await.expect("join a").expect("send a");
    b.await.expect("join b").expect("send b");

    let pending = t.hub.prompts().pending(&id, "default").await;
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|p| p.state == PendingState::Sent));

    // Deliveries did not interleave: each prompt's text is immediately
    // followed by its Enter press.
    let inputs = t.engine.session_inputs("serialised", "agent-default").await;
    assert_eq!(inputs.len(), 4, "two text writes and two Enter presses: {inputs:?}");
    assert_eq!(inputs[1], "\n");
    assert_eq!(inputs[3], "\n");
    let mut texts = vec![inputs[0].clone(), inputs[2].clone()];
    texts.sort();
    assert_eq!(texts, vec!["first".to_owned(), "second".to_owned()]);
}

#[tokio::test]
async fn send_rejects_drones_that_are_not_ready() {
    let t = test_hub();
    let drone = t
        .hub
        .registry()
        .insert_starting(dronehub::registry::NewDrone {
            name: "not-ready".to_owned(),
            group: None,
            repo_path: None,
            container_port: 3000,
        })
        .await
        .expect("insert");

    let err = t
        .hub
        .prompts()
        .send(
            &drone.id,
            "default",
            SendPrompt {
                prompt: "hello".to_owned(),
                attachments: Vec::new(),
            },
        )
        .await
        .expect_err("not ready");
    assert_eq!(err.code(), "state_violation");
}

#[tokio::test]
async fn empty_prompt_without_attachments_is_rejected() {
    let t = test_hub();
    let id = ready_drone(&t, "empty-prompt").await;

    let err = t
        .hub
        .prompts()
        .send(
            &id,
            "default",
            SendPrompt {
                prompt: "   ".to_owned(),
                attachments: Vec::new(),
            },
        )
        .await
        .expect_err("empty prompt");
    assert_eq!(err.code(), "invalid_name");
}

#[tokio::test]
async fn transcript_turn_with_matching_id_clears_pending() {
    let t = test_hub();
    let id = ready_drone(&t, "reconciled").await;

    let receipt = t
        .hub
        .prompts()
        .send(
            &id,
            "default",
            SendPrompt {
                prompt: "do the thing".to_owned(),
                attachments: Vec::new(),
            },
        )
        .await
        .expect("send");

    // The agent completes the turn: one JSONL line in the chat log.
    let log = t
        .engine
        .host_path("reconciled", &chat_log_path("default"));
    std::fs::create_dir_all(log.parent().expect("parent")).expect("mkdir");
    std::fs::write(
        &log,
        format!(
            "{}\n",
            serde_json::json!({
                "id": receipt.prompt_id,
                "prompt": "do the thing",
                "ok": true,
                "output": "done",
                "session": "agent-default",
            })
        ),
    )
    .expect("write log");

    let folded = t
        .hub
        .prompts()
        .poll_chat_log(&id, "default")
        .await
        .expect("poll");
    assert_eq!(folded, 1);

    // Turn is dense starting at 1; the pending entry is gone for good.
    let transcript = t.hub.prompts().transcript(&id, "default", None).await;
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].turn, 1);
    assert_eq!(transcript[0].id.as_deref(), Some(receipt.prompt_id.as_str()));

    let pending = t.hub.prompts().pending(&id, "default").await;
    assert!(pending.is_empty(), "pending cleared: {pending:?}");

    // Re-polling consumes nothing further and never resurrects it.
    let folded = t
        .hub
        .prompts()
        .poll_chat_log(&id, "default")
        .await
        .expect("re-poll");
    assert_eq!(folded, 0);
    assert!(t.hub.prompts().pending(&id, "default").await.is_empty());
}

#[tokio::test]
async fn turns_stay_dense_across_polls() {
    let t = test_hub();
    let id = ready_drone(&t, "dense-turns").await;

    let log = t.engine.host_path("dense-turns", &chat_log_path("default"));
    std::fs::create_dir_all(log.parent().expect("parent")).expect("mkdir");
    std::fs::write(&log, "{\"prompt\":\"one\",\"output\":\"a\"}\n").expect("write");
    t.hub
        .prompts()
        .poll_chat_log(&id, "default")
        .await
        .expect("poll 1");

    let mut contents = std::fs::read_to_string(&log).expect("read");
    contents.push_str("{\"prompt\":\"two\",\"output\":\"b\"}\n");
    std::fs::write(&log, contents).expect("append");
    t.hub
        .prompts()
        .poll_chat_log(&id, "default")
        .await
        .expect("poll 2");

    let transcript = t.hub.prompts().transcript(&id, "default", None).await;
    let turns: Vec<u64> = transcript.iter().map(|t| t.turn).collect();
    assert_eq!(turns, vec![1, 2]);

    // turn=<n> returns only later turns.
    let after_one = t.hub.prompts().transcript(&id, "default", Some(1)).await;
    assert_eq!(after_one.len(), 1);
    assert_eq!(after_one[0].turn, 2);
}

#[tokio::test]
async fn unstick_rejects_fresh_prompts_and_unknown_ids() {
    let t = test_hub();
    let id = ready_drone(&t, "unstickable").await;

    let receipt = t
        .hub
        .prompts()
        .send(
            &id,
            "default",
            SendPrompt {
                prompt: "working on it".to_owned(),
                attachments: Vec::new(),
            },
        )
        .await
        .expect("send");

    // Too fresh: the two-minute window has not elapsed.
    let err = t
        .hub
        .prompts()
        .unstick(&id, "default", &receipt.prompt_id)
        .await
        .expect_err("fresh prompt");
    assert_eq!(err.code(), "state_violation");

    let err = t
        .hub
        .prompts()
        .unstick(&id, "default", "no-such-prompt")
        .await
        .expect_err("unknown prompt");
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn failed_write_marks_the_pending_entry() {
    let t = test_hub();
    let id = ready_drone(&t, "flaky").await;
    t.engine.fail_op("session_send", "session vanished").await;

    let err = t
        .hub
        .prompts()
        .send(
            &id,
            "default",
            SendPrompt {
                prompt: "hello".to_owned(),
                attachments: Vec::new(),
            },
        )
        .await
        .expect_err("engine write fails");
    assert_eq!(err.code(), "engine_failure");

    let pending = t.hub.prompts().pending(&id, "default").await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, PendingState::Failed);
    assert!(pending[0].error.as_deref().is_some_and(|e| e.contains("session vanished")));

    // Prompt failures never change the hub phase.
    assert_eq!(
        t.hub.registry().get(&id).await.expect("drone").hub_phase,
        HubPhase::Ready
    );
}
