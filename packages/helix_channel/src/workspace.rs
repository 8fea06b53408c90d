//! Last-writer-wins task list.

use std::sync::Arc;

use tokio::sync::watch;

use crate::protocol::{Task, WorkspaceSnapshot};

#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    snapshot: Arc<watch::Sender<WorkspaceSnapshot>>,
}

impl Default for WorkspaceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceStore {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(WorkspaceSnapshot::default());
        Self {
            snapshot: Arc::new(snapshot),
        }
    }

    /// Total overwrite. No merge, no per-id diff.
    pub fn replace(&self, snapshot: WorkspaceSnapshot) {
        self.snapshot.send_replace(snapshot);
    }

    /// Overwrite from a payload whose task list may be missing.
    pub fn replace_tasks(&self, tasks: Option<Vec<Task>>) {
        self.replace(WorkspaceSnapshot::new(tasks.unwrap_or_default()));
    }

    pub fn snapshot(&self) -> WorkspaceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.snapshot.borrow().tasks.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkspaceSnapshot> {
        self.snapshot.subscribe()
    }
}
