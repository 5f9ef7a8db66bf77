//! Unit tests for the update router's debounce state machine, run on the
//! paused tokio clock for determinism.

use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use acp_bridge::acp::protocol::{ContentBlock, SessionNotification, SessionUpdate};
use acp_bridge::models::update::{ActionStatus, BridgeUpdate, PlanEntry, PlanEntryStatus};
use acp_bridge::router::{self, RouterControl, RouterEvent, RouterHandle, TurnOutcome};

const WINDOW: Duration = Duration::from_secs(2);

fn notif(update: SessionUpdate) -> SessionNotification {
    SessionNotification {
        session_id: "sess-1".to_owned(),
        update,
    }
}

fn text_block(text: &str) -> ContentBlock {
    ContentBlock::Text {
        text: text.to_owned(),
    }
}

fn message_chunk(text: &str) -> SessionUpdate {
    SessionUpdate::AgentMessageChunk {
        content: text_block(text),
    }
}

fn thought_chunk(text: &str) -> SessionUpdate {
    SessionUpdate::AgentThoughtChunk {
        content: text_block(text),
    }
}

fn tool_event(id: &str, status: Option<&str>, output: Option<serde_json::Value>) -> SessionUpdate {
    let mut payload = json!({
        "sessionId": "sess-1",
        "update": { "sessionUpdate": "tool_call_update", "toolCallId": id }
    });
    if let Some(status) = status {
        payload["update"]["status"] = json!(status);
    }
    if let Some(output) = output {
        payload["update"]["rawOutput"] = output;
    }
    let parsed: SessionNotification = serde_json::from_value(payload).expect("tool event");
    parsed.update
}

struct Rig {
    notif_tx: mpsc::Sender<SessionNotification>,
    out_rx: mpsc::Receiver<RouterEvent>,
    handle: RouterHandle,
}

fn rig() -> Rig {
    let (notif_tx, notif_rx) = mpsc::channel(256);
    let (out_tx, out_rx) = mpsc::channel(256);
    let handle = router::spawn("sess-1".to_owned(), notif_rx, out_tx, WINDOW);
    Rig {
        notif_tx,
        out_rx,
        handle,
    }
}

async fn end_turn(handle: &RouterHandle, outcome: TurnOutcome) {
    let (ack_tx, ack_rx) = oneshot::channel();
    handle
        .control_tx
        .send(RouterControl::EndTurn {
            outcome,
            ack: ack_tx,
        })
        .await
        .expect("router must accept control messages");
    ack_rx.await.expect("router must acknowledge end-of-turn");
}

/// Collect events until (and including) the `TurnEnded` marker.
async fn collect_turn(out_rx: &mut mpsc::Receiver<RouterEvent>) -> Vec<RouterEvent> {
    let mut events = Vec::new();
    loop {
        let event = out_rx.recv().await.expect("router output closed early");
        let done = matches!(event, RouterEvent::TurnEnded { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}

/// 100 chunks of 10 characters spaced 50 ms apart, then silence: exactly one
/// `message_chunk` update carrying the full concatenated text.
#[tokio::test(start_paused = true)]
async fn message_chunks_coalesce_into_one_update() {
    let mut rig = rig();

    for _ in 0..100 {
        rig.notif_tx
            .send(notif(message_chunk("aaaaaaaaaa")))
            .await
            .expect("send");
        tokio::time::advance(Duration::from_millis(50)).await;
    }

    // Silence; the debounce timer fires on the paused clock.
    let event = rig.out_rx.recv().await.expect("debounce flush");
    match event {
        RouterEvent::Update(BridgeUpdate::MessageChunk { text }) => {
            assert_eq!(text.len(), 1000, "all chunks must be concatenated");
        }
        other => panic!("expected one MessageChunk, got: {other:?}"),
    }
    assert!(
        rig.out_rx.try_recv().is_err(),
        "no further update may be emitted for the same chunk group"
    );
}

/// Successive tool-call updates for one id collapse to the latest state;
/// the terminal state and its result are always delivered.
#[tokio::test(start_paused = true)]
async fn tool_call_collapses_to_terminal_state() {
    let mut rig = rig();

    rig.notif_tx
        .send(notif(tool_event("T", Some("pending"), None)))
        .await
        .expect("send");
    rig.notif_tx
        .send(notif(tool_event("T", Some("in_progress"), None)))
        .await
        .expect("send");
    rig.notif_tx
        .send(notif(tool_event("T", Some("completed"), Some(json!({ "lines": 3 })))))
        .await
        .expect("send");

    end_turn(&rig.handle, TurnOutcome::Completed).await;
    let events = collect_turn(&mut rig.out_rx).await;

    let actions: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            RouterEvent::Update(BridgeUpdate::Action { id, status, result, .. }) => {
                Some((id.clone(), *status, result.clone()))
            }
            _ => None,
        })
        .collect();

    assert_eq!(actions.len(), 1, "states must collapse to one action");
    let (id, status, result) = &actions[0];
    assert_eq!(id, "T");
    assert_eq!(*status, ActionStatus::Completed);
    assert_eq!(result.as_ref(), Some(&json!({ "lines": 3 })));
}

/// A kind change flushes the open buffer immediately, before the window
/// elapses.
#[tokio::test(start_paused = true)]
async fn kind_change_flushes_previous_group() {
    let mut rig = rig();

    rig.notif_tx
        .send(notif(thought_chunk("first ")))
        .await
        .expect("send");
    rig.notif_tx
        .send(notif(thought_chunk("thought")))
        .await
        .expect("send");
    rig.notif_tx
        .send(notif(message_chunk("answer")))
        .await
        .expect("send");

    let event = rig.out_rx.recv().await.expect("kind-change flush");
    assert_eq!(
        event,
        RouterEvent::Update(BridgeUpdate::Thought {
            text: "first thought".into()
        }),
        "the buffered thought must flush before the message buffers"
    );
}

/// Plans bypass the debounce window entirely, after the open buffer.
#[tokio::test(start_paused = true)]
async fn plan_flushes_immediately_in_order() {
    let mut rig = rig();

    rig.notif_tx
        .send(notif(message_chunk("working…")))
        .await
        .expect("send");
    rig.notif_tx
        .send(notif(SessionUpdate::Plan {
            entries: vec![PlanEntry {
                content: "fix the typo".into(),
                status: PlanEntryStatus::InProgress,
            }],
        }))
        .await
        .expect("send");

    let first = rig.out_rx.recv().await.expect("buffer flush");
    let second = rig.out_rx.recv().await.expect("plan emission");

    assert!(
        matches!(first, RouterEvent::Update(BridgeUpdate::MessageChunk { .. })),
        "buffered message must precede the plan, got: {first:?}"
    );
    match second {
        RouterEvent::Update(BridgeUpdate::Plan { entries }) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].status, PlanEntryStatus::InProgress);
        }
        other => panic!("expected Plan, got: {other:?}"),
    }
}

/// End-of-turn flushes open buffers and reports the turn's accumulated
/// message text.
#[tokio::test(start_paused = true)]
async fn end_of_turn_flushes_and_reports_final_message() {
    let mut rig = rig();

    rig.notif_tx
        .send(notif(message_chunk("Hello, ")))
        .await
        .expect("send");
    rig.notif_tx
        .send(notif(message_chunk("world.")))
        .await
        .expect("send");

    end_turn(&rig.handle, TurnOutcome::Completed).await;
    let events = collect_turn(&mut rig.out_rx).await;

    assert_eq!(events.len(), 2, "one update plus the turn marker");
    assert_eq!(
        events[0],
        RouterEvent::Update(BridgeUpdate::MessageChunk {
            text: "Hello, world.".into()
        })
    );
    match &events[1] {
        RouterEvent::TurnEnded {
            outcome: TurnOutcome::Completed,
            final_message,
        } => assert_eq!(final_message.as_deref(), Some("Hello, world.")),
        other => panic!("expected TurnEnded(Completed), got: {other:?}"),
    }
}

/// A cancelled turn discards buffered updates; only the terminal marker is
/// emitted.
#[tokio::test(start_paused = true)]
async fn cancellation_discards_buffered_updates() {
    let mut rig = rig();

    rig.notif_tx
        .send(notif(thought_chunk("about to be dropped")))
        .await
        .expect("send");

    end_turn(&rig.handle, TurnOutcome::Cancelled).await;
    let events = collect_turn(&mut rig.out_rx).await;

    assert_eq!(events.len(), 1, "no update may survive a cancellation");
    assert!(matches!(
        events[0],
        RouterEvent::TurnEnded {
            outcome: TurnOutcome::Cancelled,
            ..
        }
    ));
}

/// A failed turn still flushes what the agent produced before dying.
#[tokio::test(start_paused = true)]
async fn failure_flushes_buffers_before_the_error() {
    let mut rig = rig();

    rig.notif_tx
        .send(notif(thought_chunk("partial progress")))
        .await
        .expect("send");

    end_turn(
        &rig.handle,
        TurnOutcome::Failed {
            message: "agent crashed".into(),
        },
    )
    .await;
    let events = collect_turn(&mut rig.out_rx).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[0],
        RouterEvent::Update(BridgeUpdate::Thought { .. })
    ));
    assert!(matches!(
        events[1],
        RouterEvent::TurnEnded {
            outcome: TurnOutcome::Failed { .. },
            ..
        }
    ));
}

/// Identical input streams produce identical emissions (debounce
/// idempotence, modulo absolute time).
#[tokio::test(start_paused = true)]
async fn identical_streams_emit_identical_sequences() {
    let feed = |text_a: &str| {
        vec![
            notif(thought_chunk(text_a)),
            notif(message_chunk("one ")),
            notif(message_chunk("two")),
            notif(tool_event("T", Some("completed"), None)),
        ]
    };

    let mut sequences = Vec::new();
    for _ in 0..2 {
        let mut rig = rig();
        for item in feed("same thought") {
            rig.notif_tx.send(item).await.expect("send");
        }
        end_turn(&rig.handle, TurnOutcome::Completed).await;
        sequences.push(collect_turn(&mut rig.out_rx).await);
    }

    let second = sequences.pop().expect("second run");
    let first = sequences.pop().expect("first run");
    assert_eq!(first, second, "router must be deterministic");
}
