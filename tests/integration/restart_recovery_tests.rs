//! Restart recovery: a persisted session survives a process restart and a
//! follow-up resumes the agent's stored conversation in the same worktree.

use std::time::Duration;

use super::mock_agent::MockAgentScript;
use super::test_helpers::{
    harness, request, restarted, RecordingAdapter, REFRESHED_TOKEN, TEST_TOKEN_VAR,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn followup_after_restart_resumes_the_session() {
    // ── First process lifetime ──────────────────────────
    let first = harness(MockAgentScript::default());
    let adapter = RecordingAdapter::new("svc-a");

    first
        .manager
        .handle_new_session(adapter.clone(), request("svc-a:issue-1", "svc-a", "fix the typo"))
        .await
        .expect("create");
    adapter
        .wait_for_terminal_events("svc-a:issue-1", 1, WAIT)
        .await;

    let record = first
        .store
        .load_all()
        .await
        .expect("store")
        .remove("svc-a:issue-1")
        .expect("record persisted");
    assert!(record.is_resumable());

    // Kill the process: close agents, keep persistence.
    first.manager.shutdown().await;

    // ── Second process lifetime over the same state dir ─
    let second = restarted(&first, MockAgentScript::default());
    let adapter2 = RecordingAdapter::new("svc-a");

    let restored = second
        .manager
        .restore_sessions_for_adapter(adapter2.clone())
        .await
        .expect("restore must read the store");
    assert_eq!(restored, 1, "the persisted session must be reconstructed");
    assert!(second.manager.has_session("svc-a:issue-1").await);

    second
        .manager
        .handle_followup("svc-a:issue-1", "revert it", None)
        .await
        .expect("follow-up on a restored session");
    adapter2
        .wait_for_terminal_events("svc-a:issue-1", 1, WAIT)
        .await;

    // The new agent was resumed with the persisted session id and worktree.
    let state = second.state.lock().await;
    assert_eq!(
        state.loaded_sessions,
        vec![record.acp_session_id.clone()],
        "the agent must be resumed via session/load"
    );
    assert!(state.new_sessions.is_empty(), "no fresh agent session may be created");
    assert_eq!(state.prompts, vec!["revert it".to_owned()]);
    drop(state);

    let specs = second.specs.lock().await;
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].cwd, record.cwd, "resume must target the original worktree");

    // Tokens are never persisted: the respawn environment was re-vended by
    // the provider, not replayed from the first process lifetime.
    let token = specs[0]
        .env
        .iter()
        .find(|(key, _)| key == TEST_TOKEN_VAR)
        .map(|(_, value)| value.as_str());
    assert_eq!(
        token,
        Some(REFRESHED_TOKEN),
        "respawn must use a freshly vended session environment"
    );

    assert_eq!(adapter2.completions("svc-a:issue-1").await.len(), 1);
}

/// Restore only picks up sessions for the matching adapter and skips
/// records that never obtained an agent session id.
#[tokio::test]
async fn restore_filters_by_service_and_resumability() {
    let first = harness(MockAgentScript::default());
    let adapter_a = RecordingAdapter::new("svc-a");
    let adapter_b = RecordingAdapter::new("svc-b");

    first
        .manager
        .handle_new_session(adapter_a.clone(), request("svc-a:issue-1", "svc-a", "one"))
        .await
        .expect("create a");
    first
        .manager
        .handle_new_session(adapter_b.clone(), request("svc-b:issue-2", "svc-b", "two"))
        .await
        .expect("create b");
    adapter_a
        .wait_for_terminal_events("svc-a:issue-1", 1, WAIT)
        .await;
    adapter_b
        .wait_for_terminal_events("svc-b:issue-2", 1, WAIT)
        .await;

    first.manager.shutdown().await;

    let second = restarted(&first, MockAgentScript::default());
    let adapter = RecordingAdapter::new("svc-a");
    let restored = second
        .manager
        .restore_sessions_for_adapter(adapter)
        .await
        .expect("restore");

    assert_eq!(restored, 1, "only svc-a sessions may be restored");
    assert!(second.manager.has_session("svc-a:issue-1").await);
    assert!(!second.manager.has_session("svc-b:issue-2").await);
}
