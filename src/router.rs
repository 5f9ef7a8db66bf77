//! Update router: turns the raw ACP notification stream into a sparse,
//! user-facing [`BridgeUpdate`] sequence.
//!
//! Chunks and tool-call events arrive at LLM-token cadence — many per
//! second. The router coalesces them per kind inside a rolling debounce
//! window and emits at most a handful of updates per turn:
//!
//! | Raw update | Emitted as | Coalescing key |
//! |---|---|---|
//! | `agent_thought_chunk` | `thought` | single per-buffer text |
//! | `agent_message_chunk` | `message_chunk` | single per-buffer text |
//! | `tool_call` / `tool_call_update` | `action` | `tool_call_id`, latest state wins |
//! | `plan` | `plan` | none — flushed immediately |
//! | `user_message_chunk` | *(ignored)* | |
//!
//! A flush happens when the window elapses with no further update of the
//! buffered kind, when an update of a different kind arrives, or when the
//! turn ends. Emissions travel through one ordered channel per session;
//! turn-completion events use the same channel so a completion can never
//! overtake the updates that precede it.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::acp::protocol::{SessionNotification, SessionUpdate, ToolCallEvent};
use crate::models::update::{ActionStatus, BridgeUpdate, PlanEntry};

/// How a prompt turn ended, as decided by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The agent finished normally; the adapter gets a completion message.
    Completed,
    /// The user stopped the turn; buffered updates are discarded.
    Cancelled,
    /// The turn failed (refusal, token ceiling, agent crash).
    Failed {
        /// Human-readable description for the adapter.
        message: String,
    },
}

/// Ordered event stream consumed by the per-session forwarder.
#[derive(Debug, PartialEq)]
pub enum RouterEvent {
    /// A debounced user-facing update.
    Update(BridgeUpdate),
    /// The turn ended after all of its updates were emitted.
    TurnEnded {
        /// Terminal state of the turn.
        outcome: TurnOutcome,
        /// Full accumulated message text of the turn, if any.
        final_message: Option<String>,
    },
}

/// Control messages from the session manager.
#[derive(Debug)]
pub enum RouterControl {
    /// Flush (or discard, on cancellation) open buffers and emit
    /// [`RouterEvent::TurnEnded`]; `ack` fires once the event is queued.
    EndTurn {
        /// Terminal state of the turn.
        outcome: TurnOutcome,
        /// Acknowledgment channel.
        ack: oneshot::Sender<()>,
    },
}

/// Handle to a spawned router task.
pub struct RouterHandle {
    /// Control channel for end-of-turn signalling.
    pub control_tx: mpsc::Sender<RouterControl>,
    /// The router task itself.
    pub task: JoinHandle<()>,
}

/// Spawn the router task for one session.
///
/// `notif_rx` carries raw notifications in arrival order; `out_tx` receives
/// the debounced events, strictly ordered. The task exits when both input
/// channels close or the output side goes away.
#[must_use]
pub fn spawn(
    label: String,
    mut notif_rx: mpsc::Receiver<SessionNotification>,
    out_tx: mpsc::Sender<RouterEvent>,
    window: Duration,
) -> RouterHandle {
    let (control_tx, mut control_rx) = mpsc::channel::<RouterControl>(8);

    let task = tokio::spawn(async move {
        let mut state = Coalescer::new(window);

        loop {
            let deadline = state.deadline();
            tokio::select! {
                biased;

                notif = notif_rx.recv() => {
                    let Some(notification) = notif else {
                        // Session torn down; flush what is left and stop.
                        for update in state.flush() {
                            if out_tx.send(RouterEvent::Update(update)).await.is_err() {
                                break;
                            }
                        }
                        debug!(session = label.as_str(), "router: input closed, stopping");
                        break;
                    };
                    for update in state.ingest(notification.update) {
                        if out_tx.send(RouterEvent::Update(update)).await.is_err() {
                            return;
                        }
                    }
                }

                ctrl = control_rx.recv() => {
                    let Some(RouterControl::EndTurn { outcome, ack }) = ctrl else {
                        debug!(session = label.as_str(), "router: control closed, stopping");
                        break;
                    };
                    let trailing = if outcome == TurnOutcome::Cancelled {
                        // No further updates from a stopped turn.
                        state.discard();
                        Vec::new()
                    } else {
                        state.flush()
                    };
                    for update in trailing {
                        if out_tx.send(RouterEvent::Update(update)).await.is_err() {
                            return;
                        }
                    }
                    let final_message = state.take_turn_message();
                    if out_tx
                        .send(RouterEvent::TurnEnded { outcome, final_message })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    let _ = ack.send(());
                }

                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    for update in state.flush() {
                        if out_tx.send(RouterEvent::Update(update)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    RouterHandle { control_tx, task }
}

// ── Coalescing state machine ──────────────────────────────────────────────────

/// Latest observed state of one tool call.
struct ActionState {
    title: Option<String>,
    tool_kind: Option<String>,
    status: ActionStatus,
    result: Option<Value>,
}

/// The currently buffered update group.
enum Buffer {
    Empty,
    Thought(String),
    Message(String),
    Actions {
        /// First-seen order of tool call ids.
        order: Vec<String>,
        calls: HashMap<String, ActionState>,
    },
}

/// Pure coalescing state: identical input streams produce identical output
/// sequences (modulo absolute time).
struct Coalescer {
    window: Duration,
    buffer: Buffer,
    touched: Instant,
    turn_message: String,
}

impl Coalescer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            buffer: Buffer::Empty,
            touched: Instant::now(),
            turn_message: String::new(),
        }
    }

    /// When the open buffer should be flushed, if anything is buffered.
    fn deadline(&self) -> Option<Instant> {
        match self.buffer {
            Buffer::Empty => None,
            _ => Some(self.touched + self.window),
        }
    }

    /// Feed one raw update; returns updates that must be emitted right away
    /// (kind-change flushes and immediate kinds).
    fn ingest(&mut self, update: SessionUpdate) -> Vec<BridgeUpdate> {
        match update {
            SessionUpdate::AgentThoughtChunk { content } => {
                let Some(text) = content.text() else { return Vec::new() };
                let text = text.to_owned();
                self.touched = Instant::now();
                if let Buffer::Thought(buf) = &mut self.buffer {
                    buf.push_str(&text);
                    return Vec::new();
                }
                let flushed = self.flush();
                self.buffer = Buffer::Thought(text);
                flushed
            }
            SessionUpdate::AgentMessageChunk { content } => {
                let Some(text) = content.text() else { return Vec::new() };
                let text = text.to_owned();
                self.turn_message.push_str(&text);
                self.touched = Instant::now();
                if let Buffer::Message(buf) = &mut self.buffer {
                    buf.push_str(&text);
                    return Vec::new();
                }
                let flushed = self.flush();
                self.buffer = Buffer::Message(text);
                flushed
            }
            SessionUpdate::ToolCall(event) | SessionUpdate::ToolCallUpdate(event) => {
                self.touched = Instant::now();
                if let Buffer::Actions { order, calls } = &mut self.buffer {
                    merge_action(order, calls, event);
                    return Vec::new();
                }
                let flushed = self.flush();
                let mut order = Vec::new();
                let mut calls = HashMap::new();
                merge_action(&mut order, &mut calls, event);
                self.buffer = Buffer::Actions { order, calls };
                flushed
            }
            // Plans are rare and carry meaningful state; emit immediately,
            // after whatever was buffered so ordering is preserved.
            SessionUpdate::Plan { entries } => {
                let mut out = self.flush();
                out.push(plan_update(entries));
                out
            }
            // Echo of our own prompt, or a kind this build does not know.
            SessionUpdate::UserMessageChunk { .. } | SessionUpdate::Unknown => Vec::new(),
        }
    }

    /// Drain the open buffer into emitted updates.
    fn flush(&mut self) -> Vec<BridgeUpdate> {
        match std::mem::replace(&mut self.buffer, Buffer::Empty) {
            Buffer::Empty => Vec::new(),
            Buffer::Thought(text) => vec![BridgeUpdate::Thought { text }],
            Buffer::Message(text) => vec![BridgeUpdate::MessageChunk { text }],
            Buffer::Actions { order, mut calls } => order
                .into_iter()
                .filter_map(|id| {
                    calls.remove(&id).map(|state| BridgeUpdate::Action {
                        title: state.title.unwrap_or_else(|| id.clone()),
                        id,
                        tool_kind: state.tool_kind,
                        status: state.status,
                        result: state.result,
                    })
                })
                .collect(),
        }
    }

    /// Drop the open buffer without emitting (user cancellation).
    fn discard(&mut self) {
        self.buffer = Buffer::Empty;
    }

    /// Take the turn's accumulated message text, resetting for the next turn.
    fn take_turn_message(&mut self) -> Option<String> {
        if self.turn_message.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.turn_message))
    }
}

/// Fold a tool-call event into the buffered per-id state; later updates
/// supersede earlier ones, so intermediate states may never be emitted as
/// long as the final state is.
fn merge_action(order: &mut Vec<String>, calls: &mut HashMap<String, ActionState>, event: ToolCallEvent) {
    let ToolCallEvent {
        tool_call_id,
        title,
        kind,
        status,
        raw_output,
    } = event;

    if let Some(state) = calls.get_mut(&tool_call_id) {
        if let Some(title) = title {
            state.title = Some(title);
        }
        if let Some(kind) = kind {
            state.tool_kind = Some(kind);
        }
        if let Some(status) = status {
            state.status = status;
        }
        if let Some(result) = raw_output {
            state.result = Some(result);
        }
        return;
    }

    order.push(tool_call_id.clone());
    calls.insert(
        tool_call_id,
        ActionState {
            title,
            tool_kind: kind,
            status: status.unwrap_or(ActionStatus::Pending),
            result: raw_output,
        },
    );
}

fn plan_update(entries: Vec<PlanEntry>) -> BridgeUpdate {
    BridgeUpdate::Plan { entries }
}
