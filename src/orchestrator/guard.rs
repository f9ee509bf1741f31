use std::sync::Arc;

use dashmap::DashSet;

/// Tracks which projects currently have a phase execution in flight.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGuard {
    running: Arc<DashSet<i64>>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the project. Returns `None` if another execution holds it.
    pub fn try_acquire(&self, project_id: i64) -> Option<ExecutionPermit> {
        if self.running.insert(project_id) {
            Some(ExecutionPermit {
                running: Arc::clone(&self.running),
                project_id,
            })
        } else {
            None
        }
    }

    pub fn is_running(&self, project_id: i64) -> bool {
        self.running.contains(&project_id)
    }
}

/// Held for the duration of one execution; releases the project on drop,
/// including when the execution future is cancelled.
#[derive(Debug)]
pub struct ExecutionPermit {
    running: Arc<DashSet<i64>>,
    project_id: i64,
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.running.remove(&self.project_id);
    }
}
