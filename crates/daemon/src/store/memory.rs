use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use factory_core::model::{NewTask, PipelineRun, ScheduledTask, TaskOutcome, TaskStatus};

use super::{
    collect_dependents, dependency_gate, new_lease_token, new_task_row, Completion,
    DependencyGate, StoreError, TaskStore,
};

#[derive(Default)]
struct Inner {
    runs: BTreeMap<String, PipelineRun>,
    tasks: BTreeMap<String, ScheduledTask>,
}

impl Inner {
    fn gate(&self, t: &ScheduledTask) -> DependencyGate {
        let dep = t.depends_on.as_deref().and_then(|d| self.tasks.get(d));
        dependency_gate(t.depends_on.as_deref(), dep)
    }

    fn skip_dependents(&mut self, root: &str, now_ms: i64) -> Result<Vec<String>> {
        let ids = collect_dependents(root, |id| {
            Ok(self
                .tasks
                .values()
                .filter(|t| t.depends_on.as_deref() == Some(id))
                .map(|t| t.task_id.clone())
                .collect())
        })?;
        let mut skipped = Vec::new();
        for id in ids {
            if let Some(t) = self.tasks.get_mut(&id) {
                if t.status == TaskStatus::Pending {
                    t.status = TaskStatus::Skipped;
                    t.error = Some(format!("dependency of {root} did not succeed"));
                    t.updated_at_ms = now_ms;
                    skipped.push(id);
                }
            }
        }
        Ok(skipped)
    }

    fn mark_skipped(&mut self, task_id: &str, now_ms: i64) -> Result<()> {
        if let Some(t) = self.tasks.get_mut(task_id) {
            t.status = TaskStatus::Skipped;
            t.error = Some("dependency did not succeed".to_string());
            t.updated_at_ms = now_ms;
        }
        self.skip_dependents(task_id, now_ms)?;
        Ok(())
    }

    /// Leases `task_id` if claimable; skips it if its dependency is dead.
    fn try_claim(
        &mut self,
        task_id: &str,
        worker: &str,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<ScheduledTask>> {
        let Some(t) = self.tasks.get(task_id) else {
            return Ok(None);
        };
        if t.status != TaskStatus::Pending || t.eta_ms > now_ms {
            return Ok(None);
        }
        match self.gate(t) {
            DependencyGate::Wait => Ok(None),
            DependencyGate::Skip => {
                self.mark_skipped(task_id, now_ms)?;
                Ok(None)
            }
            DependencyGate::Ready(input) => {
                let Some(t) = self.tasks.get_mut(task_id) else {
                    return Ok(None);
                };
                t.status = TaskStatus::Running;
                t.attempts += 1;
                t.lease_owner = Some(worker.to_string());
                t.lease_token = Some(new_lease_token());
                t.lease_expires_at_ms = Some(now_ms + lease_ms);
                t.dependency_result = input;
                t.updated_at_ms = now_ms;
                Ok(Some(t.clone()))
            }
        }
    }
}

/// In-process store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("memory store mutex poisoned"))
    }
}

fn by_eta(tasks: &mut [ScheduledTask]) {
    tasks.sort_by(|a, b| {
        (a.eta_ms, a.created_at_ms, &a.task_id).cmp(&(b.eta_ms, b.created_at_ms, &b.task_id))
    });
}

impl TaskStore for MemoryStore {
    fn insert_run(&self, run: &PipelineRun) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.runs.contains_key(&run.run_id) {
            anyhow::bail!("run {} already exists", run.run_id);
        }
        inner.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn update_run(&self, run: &PipelineRun) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.runs.get_mut(&run.run_id) {
            Some(slot) => {
                *slot = run.clone();
                Ok(())
            }
            None => anyhow::bail!("unknown run {}", run.run_id),
        }
    }

    fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let inner = self.lock()?;
        let mut runs: Vec<PipelineRun> = inner.runs.values().cloned().collect();
        runs.sort_by(|a, b| (b.created_at_ms, &b.run_id).cmp(&(a.created_at_ms, &a.run_id)));
        runs.truncate(limit);
        Ok(runs)
    }

    fn enqueue(&self, task: &NewTask, now_ms: i64) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.tasks.contains_key(&task.task_id) {
            anyhow::bail!("task {} already exists", task.task_id);
        }
        inner.tasks.insert(task.task_id.clone(), new_task_row(task, now_ms));
        Ok(())
    }

    fn claim_due(&self, worker: &str, now_ms: i64, lease_ms: i64) -> Result<Option<ScheduledTask>> {
        let mut inner = self.lock()?;
        let mut due: Vec<ScheduledTask> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.eta_ms <= now_ms)
            .cloned()
            .collect();
        by_eta(&mut due);
        for candidate in due {
            if let Some(t) = inner.try_claim(&candidate.task_id, worker, now_ms, lease_ms)? {
                return Ok(Some(t));
            }
        }
        Ok(None)
    }

    fn claim_task(
        &self,
        task_id: &str,
        worker: &str,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<ScheduledTask>> {
        self.lock()?.try_claim(task_id, worker, now_ms, lease_ms)
    }

    fn complete(
        &self,
        task_id: &str,
        lease_token: &str,
        outcome: &TaskOutcome,
        follow_ups: &[NewTask],
        now_ms: i64,
    ) -> Result<Completion> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let Some(t) = inner.tasks.get_mut(task_id) else {
            return Err(StoreError::UnknownTask(task_id.to_string()).into());
        };
        if t.status.is_terminal() {
            return Ok(Completion::AlreadyTerminal);
        }
        if t.status != TaskStatus::Running || t.lease_token.as_deref() != Some(lease_token) {
            return Err(StoreError::LeaseMismatch(task_id.to_string()).into());
        }
        for f in follow_ups {
            if inner.tasks.contains_key(&f.task_id) {
                anyhow::bail!("follow-up task {} already exists", f.task_id);
            }
        }

        let Some(t) = inner.tasks.get_mut(task_id) else {
            return Err(StoreError::UnknownTask(task_id.to_string()).into());
        };
        t.lease_owner = None;
        t.lease_token = None;
        t.lease_expires_at_ms = None;
        t.updated_at_ms = now_ms;
        let skipped = match outcome {
            TaskOutcome::Succeeded { result } => {
                t.status = TaskStatus::Succeeded;
                t.result = result.clone();
                t.error = None;
                for f in follow_ups {
                    inner.tasks.insert(f.task_id.clone(), new_task_row(f, now_ms));
                }
                Vec::new()
            }
            TaskOutcome::Failed { error } => {
                t.status = TaskStatus::Failed;
                t.error = Some(error.clone());
                inner.skip_dependents(task_id, now_ms)?
            }
        };
        Ok(Completion::Recorded { skipped })
    }

    fn renew_lease(&self, task_id: &str, lease_token: &str, now_ms: i64, lease_ms: i64) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.tasks.get_mut(task_id) {
            Some(t) if t.status == TaskStatus::Running && t.lease_token.as_deref() == Some(lease_token) => {
                t.lease_expires_at_ms = Some(now_ms + lease_ms);
                t.updated_at_ms = now_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn requeue_expired(&self, now_ms: i64) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut n = 0;
        for t in inner.tasks.values_mut() {
            let expired = t.status == TaskStatus::Running
                && t.lease_expires_at_ms.is_some_and(|exp| exp < now_ms);
            if expired {
                t.status = TaskStatus::Pending;
                t.lease_owner = None;
                t.lease_token = None;
                t.lease_expires_at_ms = None;
                t.updated_at_ms = now_ms;
                n += 1;
            }
        }
        Ok(n)
    }

    fn cancel(&self, task_id: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        let pending = inner
            .tasks
            .get(task_id)
            .is_some_and(|t| t.status == TaskStatus::Pending);
        if pending {
            inner.tasks.remove(task_id);
        }
        Ok(pending)
    }

    fn get_task(&self, task_id: &str) -> Result<Option<ScheduledTask>> {
        Ok(self.lock()?.tasks.get(task_id).cloned())
    }

    fn open_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let inner = self.lock()?;
        let mut open: Vec<ScheduledTask> = inner
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();
        by_eta(&mut open);
        Ok(open)
    }

    fn tasks_for_run(&self, run_id: &str) -> Result<Vec<ScheduledTask>> {
        let inner = self.lock()?;
        let mut tasks: Vec<ScheduledTask> = inner
            .tasks
            .values()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect();
        by_eta(&mut tasks);
        Ok(tasks)
    }
}
