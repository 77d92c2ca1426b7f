//! Durable schedule of runs and deferred tasks.
//!
//! Claims are leases: a worker that crashes mid-task leaves a `running` row
//! whose lease expires and is returned to `pending` by [`TaskStore::requeue_expired`].

use std::collections::{BTreeSet, VecDeque};

use anyhow::Result;
use factory_core::model::{NewTask, PipelineRun, ScheduledTask, TaskOutcome, TaskStatus};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("task {0} is not leased under this token")]
    LeaseMismatch(String),
    #[error("unknown task {0}")]
    UnknownTask(String),
}

/// Result of [`TaskStore::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Outcome recorded; `skipped` dependents were cascaded.
    Recorded { skipped: Vec<String> },
    /// The task was already terminal; nothing changed.
    AlreadyTerminal,
}

/// Whether a pending task may run given its dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyGate {
    /// Runnable; carries the dependency's result.
    Ready(Option<String>),
    /// Dependency still pending or running.
    Wait,
    /// Dependency failed, was skipped, or no longer exists.
    Skip,
}

/// Gate for a task with dependency id `depends_on`; `dep` is the looked-up
/// row, `None` when it no longer exists.
pub fn dependency_gate(depends_on: Option<&str>, dep: Option<&ScheduledTask>) -> DependencyGate {
    let Some(_) = depends_on else {
        return DependencyGate::Ready(None);
    };
    match dep {
        None => DependencyGate::Skip,
        Some(d) => match d.status {
            TaskStatus::Succeeded => DependencyGate::Ready(d.result.clone()),
            TaskStatus::Pending | TaskStatus::Running => DependencyGate::Wait,
            TaskStatus::Failed | TaskStatus::Skipped => DependencyGate::Skip,
        },
    }
}

/// Breadth-first walk over dependents of `root`, excluding `root`.
pub(crate) fn collect_dependents(
    root: &str,
    mut children_of: impl FnMut(&str) -> Result<Vec<String>>,
) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut order = Vec::new();
    let mut queue = VecDeque::from([root.to_string()]);
    while let Some(id) = queue.pop_front() {
        for child in children_of(&id)? {
            if seen.insert(child.clone()) {
                order.push(child.clone());
                queue.push_back(child);
            }
        }
    }
    Ok(order)
}

pub(crate) fn new_task_row(t: &NewTask, now_ms: i64) -> ScheduledTask {
    ScheduledTask {
        task_id: t.task_id.clone(),
        run_id: t.run_id.clone(),
        kind: t.kind.clone(),
        eta_ms: t.eta_ms,
        depends_on: t.depends_on.clone(),
        status: TaskStatus::Pending,
        attempts: 0,
        lease_owner: None,
        lease_token: None,
        lease_expires_at_ms: None,
        result: None,
        error: None,
        dependency_result: None,
        created_at_ms: now_ms,
        updated_at_ms: now_ms,
    }
}

pub(crate) fn new_lease_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Storage for runs and the deferred task schedule.
///
/// Every method is a short synchronous critical section; async callers
/// may invoke them directly.
pub trait TaskStore: Send + Sync {
    fn insert_run(&self, run: &PipelineRun) -> Result<()>;
    fn update_run(&self, run: &PipelineRun) -> Result<()>;
    fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>>;
    /// Newest first.
    fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRun>>;

    fn enqueue(&self, task: &NewTask, now_ms: i64) -> Result<()>;

    /// Leases the oldest due task whose dependency has succeeded. Tasks whose
    /// dependency failed are marked skipped on the way.
    fn claim_due(&self, worker: &str, now_ms: i64, lease_ms: i64) -> Result<Option<ScheduledTask>>;

    /// Leases one specific task if it is claimable right now.
    fn claim_task(
        &self,
        task_id: &str,
        worker: &str,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<ScheduledTask>>;

    /// Records the outcome and enqueues `follow_ups` in one transaction.
    /// A failure skips every pending dependent transitively.
    fn complete(
        &self,
        task_id: &str,
        lease_token: &str,
        outcome: &TaskOutcome,
        follow_ups: &[NewTask],
        now_ms: i64,
    ) -> Result<Completion>;

    /// Pushes a held lease out to `now_ms + lease_ms`. Returns false when
    /// the token no longer holds the task.
    fn renew_lease(&self, task_id: &str, lease_token: &str, now_ms: i64, lease_ms: i64) -> Result<bool>;

    /// Returns tasks with expired leases to `pending`.
    fn requeue_expired(&self, now_ms: i64) -> Result<usize>;

    /// Deletes a still-pending task. Returns false otherwise.
    fn cancel(&self, task_id: &str) -> Result<bool>;

    fn get_task(&self, task_id: &str) -> Result<Option<ScheduledTask>>;
    /// Pending and running tasks by eta.
    fn open_tasks(&self) -> Result<Vec<ScheduledTask>>;
    fn tasks_for_run(&self, run_id: &str) -> Result<Vec<ScheduledTask>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use factory_core::model::TaskKind;
    use std::path::PathBuf;

    fn task(status: TaskStatus, result: Option<&str>) -> ScheduledTask {
        let mut t = new_task_row(
            &NewTask::new(
                "r",
                TaskKind::ManageStorage {
                    topic: "t".into(),
                    video_path: PathBuf::from("v.mp4"),
                },
                0,
            ),
            0,
        );
        t.status = status;
        t.result = result.map(str::to_string);
        t
    }

    #[test]
    fn gate_decisions() {
        assert_eq!(dependency_gate(None, None), DependencyGate::Ready(None));
        assert_eq!(dependency_gate(Some("x"), None), DependencyGate::Skip);
        let ok = task(TaskStatus::Succeeded, Some("abc123"));
        assert_eq!(
            dependency_gate(Some("x"), Some(&ok)),
            DependencyGate::Ready(Some("abc123".into()))
        );
        assert_eq!(
            dependency_gate(Some("x"), Some(&task(TaskStatus::Running, None))),
            DependencyGate::Wait
        );
        assert_eq!(
            dependency_gate(Some("x"), Some(&task(TaskStatus::Failed, None))),
            DependencyGate::Skip
        );
    }

    #[test]
    fn dependents_are_breadth_first() {
        let edges = [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("d", "e")];
        let order = collect_dependents("a", |id| {
            Ok(edges
                .iter()
                .filter(|(p, _)| *p == id)
                .map(|(_, c)| c.to_string())
                .collect())
        })
        .unwrap();
        assert_eq!(order, vec!["b", "c", "d", "e"]);
    }
}
