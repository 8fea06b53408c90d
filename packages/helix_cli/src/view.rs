//! Plain-text rendering of store contents.

use helix_channel::{ChatTurn, ConnectionState, WorkspaceSnapshot};

pub fn turn_line(turn: &ChatTurn) -> String {
    format!("[{}] {}", turn.sender, turn.text)
}

pub fn workspace_lines(snapshot: &WorkspaceSnapshot) -> Vec<String> {
    if snapshot.is_empty() {
        return vec!["-- workspace: no tasks --".to_string()];
    }
    let mut lines = Vec::with_capacity(snapshot.len() + 1);
    lines.push(format!("-- workspace: {} task(s) --", snapshot.len()));
    lines.extend(
        snapshot
            .tasks
            .iter()
            .map(|task| format!("  #{} {}", task.id, task.description)),
    );
    lines
}

/// Status line shown when the connection changes state.
pub fn state_line(state: ConnectionState) -> String {
    let note = match state {
        ConnectionState::Connected => "ready",
        ConnectionState::Reconnecting => "connection lost, retrying",
        ConnectionState::Failed => "gave up reconnecting",
        ConnectionState::Connecting | ConnectionState::Disconnected => return format!("* {}", state),
    };
    format!("* {} ({})", state, note)
}
