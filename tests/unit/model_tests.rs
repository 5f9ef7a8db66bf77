//! Unit tests for the serde shapes of the domain models and ACP wire types.

use serde_json::json;

use acp_bridge::acp::protocol::{SessionNotification, SessionUpdate, StopReason};
use acp_bridge::models::request::BridgeSessionRequest;
use acp_bridge::models::session::PersistedSession;
use acp_bridge::models::update::{ActionStatus, BridgeUpdate, PlanEntryStatus};

#[test]
fn bridge_update_serialises_with_kind_tag() {
    let update = BridgeUpdate::Thought {
        text: "thinking".into(),
    };
    let value = serde_json::to_value(&update).expect("must serialise");

    assert_eq!(value["kind"], "thought");
    assert_eq!(value["text"], "thinking");
}

#[test]
fn action_update_omits_absent_result() {
    let update = BridgeUpdate::Action {
        id: "T1".into(),
        title: "Read file".into(),
        tool_kind: Some("read".into()),
        status: ActionStatus::InProgress,
        result: None,
    };
    let value = serde_json::to_value(&update).expect("must serialise");

    assert_eq!(value["kind"], "action");
    assert_eq!(value["status"], "in_progress");
    assert!(
        value.get("result").is_none(),
        "absent result must be omitted, got: {value}"
    );
}

#[test]
fn plan_status_accepts_wire_aliases() {
    // Agents send snake_case plan states; the bridge serialises camelCase.
    let status: PlanEntryStatus =
        serde_json::from_value(json!("in_progress")).expect("alias must parse");
    assert_eq!(status, PlanEntryStatus::InProgress);
    assert_eq!(
        serde_json::to_value(status).expect("must serialise"),
        json!("inProgress")
    );
}

#[test]
fn stop_reasons_parse_snake_case() {
    for (raw, expected) in [
        ("end_turn", StopReason::EndTurn),
        ("max_tokens", StopReason::MaxTokens),
        ("max_turn_requests", StopReason::MaxTurnRequests),
        ("refusal", StopReason::Refusal),
        ("cancelled", StopReason::Cancelled),
    ] {
        let parsed: StopReason = serde_json::from_value(json!(raw)).expect("must parse");
        assert_eq!(parsed, expected, "wire value '{raw}'");
    }
}

#[test]
fn session_notification_parses_message_chunk() {
    let raw = json!({
        "sessionId": "sess-1",
        "update": {
            "sessionUpdate": "agent_message_chunk",
            "content": { "type": "text", "text": "Hello" }
        }
    });
    let parsed: SessionNotification = serde_json::from_value(raw).expect("must parse");

    assert_eq!(parsed.session_id, "sess-1");
    match parsed.update {
        SessionUpdate::AgentMessageChunk { content } => {
            assert_eq!(content.text(), Some("Hello"));
        }
        other => panic!("expected AgentMessageChunk, got: {other:?}"),
    }
}

#[test]
fn session_notification_parses_tool_call() {
    let raw = json!({
        "sessionId": "sess-1",
        "update": {
            "sessionUpdate": "tool_call",
            "toolCallId": "T1",
            "title": "Read main.rs",
            "kind": "read",
            "status": "pending"
        }
    });
    let parsed: SessionNotification = serde_json::from_value(raw).expect("must parse");

    match parsed.update {
        SessionUpdate::ToolCall(event) => {
            assert_eq!(event.tool_call_id, "T1");
            assert_eq!(event.title.as_deref(), Some("Read main.rs"));
            assert_eq!(event.status, Some(ActionStatus::Pending));
        }
        other => panic!("expected ToolCall, got: {other:?}"),
    }
}

#[test]
fn unknown_session_update_kind_is_tolerated() {
    let raw = json!({
        "sessionId": "sess-1",
        "update": { "sessionUpdate": "available_commands_update", "commands": [] }
    });
    let parsed: SessionNotification = serde_json::from_value(raw).expect("must parse");
    assert_eq!(parsed.update, SessionUpdate::Unknown);
}

#[test]
fn session_request_defaults() {
    let raw = json!({
        "external_session_id": "webhook:i-1",
        "service_name": "webhook",
        "agent_name": "claude",
        "prompt": "fix it",
        "descriptive_name": "fix-it"
    });
    let request: BridgeSessionRequest = serde_json::from_value(raw).expect("must parse");

    assert!(!request.is_followup, "is_followup must default to false");
    assert!(request.service_metadata.is_null());
}

/// Records written by a newer build keep their unknown fields through a
/// parse → serialise round-trip.
#[test]
fn persisted_session_preserves_unknown_fields() {
    let raw = json!({
        "external_session_id": "webhook:i-1",
        "service_name": "webhook",
        "agent_name": "claude",
        "acp_session_id": "sess-9",
        "cwd": "/data/worktrees/i-1",
        "branch_name": "acp-agent/i-1-42",
        "service_metadata": { "callback_url": null },
        "future_field": { "nested": true }
    });
    let record: PersistedSession = serde_json::from_value(raw).expect("must parse");
    assert!(record.is_resumable());
    assert_eq!(record.extra.get("future_field"), Some(&json!({ "nested": true })));

    let rewritten = serde_json::to_value(&record).expect("must serialise");
    assert_eq!(rewritten["future_field"]["nested"], true);
}

#[test]
fn persisted_session_without_acp_id_is_not_resumable() {
    let raw = json!({
        "external_session_id": "webhook:i-2",
        "service_name": "webhook",
        "agent_name": "claude",
        "cwd": "/data/worktrees/i-2",
        "branch_name": "acp-agent/i-2-43"
    });
    let record: PersistedSession = serde_json::from_value(raw).expect("must parse");
    assert!(!record.is_resumable());
}
