use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use factory_core::model::{
    NewTask, PipelineRun, ScheduledTask, TaskKind, TaskOutcome, TaskStatus,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use super::{
    collect_dependents, dependency_gate, new_lease_token, Completion, DependencyGate, StoreError,
    TaskStore,
};

const TASK_COLUMNS: &str = "task_id, run_id, kind_json, eta_ms, depends_on, status, attempts, \
     lease_owner, lease_token, lease_expires_at_ms, result, error, dependency_result, \
     created_at_ms, updated_at_ms";

/// SQLite-backed schedule; survives restarts.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open sqlite db {}", db_path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory sqlite")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let init_sql = include_str!("../../migrations/0001_init.sql");
        conn.execute_batch(init_sql).context("apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

fn row_to_task(r: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let kind_json: String = r.get(2)?;
    let kind: TaskKind = serde_json::from_str(&kind_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(ScheduledTask {
        task_id: r.get(0)?,
        run_id: r.get(1)?,
        kind,
        eta_ms: r.get(3)?,
        depends_on: r.get(4)?,
        status: TaskStatus::parse(&r.get::<_, String>(5)?),
        attempts: r.get::<_, i64>(6)? as u32,
        lease_owner: r.get(7)?,
        lease_token: r.get(8)?,
        lease_expires_at_ms: r.get(9)?,
        result: r.get(10)?,
        error: r.get(11)?,
        dependency_result: r.get(12)?,
        created_at_ms: r.get(13)?,
        updated_at_ms: r.get(14)?,
    })
}

fn row_to_run(r: &Row<'_>) -> rusqlite::Result<PipelineRun> {
    let body: String = r.get(0)?;
    serde_json::from_str(&body)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn load_task(conn: &Connection, task_id: &str) -> Result<Option<ScheduledTask>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1");
    Ok(conn.query_row(&sql, [task_id], row_to_task).optional()?)
}

fn query_tasks<P: rusqlite::Params>(
    conn: &Connection,
    where_clause: &str,
    params: P,
) -> Result<Vec<ScheduledTask>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE {where_clause} \
         ORDER BY eta_ms ASC, created_at_ms ASC, task_id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, row_to_task)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn insert_task(tx: &Transaction<'_>, t: &NewTask, now_ms: i64) -> Result<()> {
    tx.execute(
        "INSERT INTO tasks(task_id, run_id, kind_json, eta_ms, depends_on, status, attempts, \
         created_at_ms, updated_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
        params![
            t.task_id,
            t.run_id,
            serde_json::to_string(&t.kind)?,
            t.eta_ms,
            t.depends_on,
            TaskStatus::Pending.as_str(),
            now_ms,
        ],
    )
    .with_context(|| format!("insert task {}", t.task_id))?;
    Ok(())
}

fn skip_dependents(tx: &Transaction<'_>, root: &str, now_ms: i64) -> Result<Vec<String>> {
    let ids = collect_dependents(root, |id| {
        let mut stmt = tx.prepare_cached("SELECT task_id FROM tasks WHERE depends_on = ?1")?;
        let rows = stmt.query_map([id], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })?;
    let mut skipped = Vec::new();
    let reason = format!("dependency of {root} did not succeed");
    for id in ids {
        let n = tx.execute(
            "UPDATE tasks SET status = 'skipped', error = ?2, updated_at_ms = ?3 \
             WHERE task_id = ?1 AND status = 'pending'",
            params![id, reason, now_ms],
        )?;
        if n > 0 {
            skipped.push(id);
        }
    }
    Ok(skipped)
}

fn try_claim(
    tx: &Transaction<'_>,
    task_id: &str,
    worker: &str,
    now_ms: i64,
    lease_ms: i64,
) -> Result<Option<ScheduledTask>> {
    let Some(t) = load_task(tx, task_id)? else {
        return Ok(None);
    };
    if t.status != TaskStatus::Pending || t.eta_ms > now_ms {
        return Ok(None);
    }
    let dep = match t.depends_on.as_deref() {
        Some(d) => load_task(tx, d)?,
        None => None,
    };
    match dependency_gate(t.depends_on.as_deref(), dep.as_ref()) {
        DependencyGate::Wait => Ok(None),
        DependencyGate::Skip => {
            tx.execute(
                "UPDATE tasks SET status = 'skipped', error = 'dependency did not succeed', \
                 updated_at_ms = ?2 WHERE task_id = ?1",
                params![task_id, now_ms],
            )?;
            skip_dependents(tx, task_id, now_ms)?;
            Ok(None)
        }
        DependencyGate::Ready(input) => {
            tx.execute(
                "UPDATE tasks SET status = 'running', attempts = attempts + 1, lease_owner = ?2, \
                 lease_token = ?3, lease_expires_at_ms = ?4, dependency_result = ?5, \
                 updated_at_ms = ?6 WHERE task_id = ?1",
                params![task_id, worker, new_lease_token(), now_ms + lease_ms, input, now_ms],
            )?;
            load_task(tx, task_id)
        }
    }
}

impl TaskStore for SqliteStore {
    fn insert_run(&self, run: &PipelineRun) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs(run_id, topic, status, body_json, created_at_ms, updated_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.run_id,
                run.topic,
                run.status.as_str(),
                serde_json::to_string(run)?,
                run.created_at_ms,
                run.updated_at_ms,
            ],
        )
        .with_context(|| format!("insert run {}", run.run_id))?;
        Ok(())
    }

    fn update_run(&self, run: &PipelineRun) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE runs SET status = ?2, body_json = ?3, updated_at_ms = ?4 WHERE run_id = ?1",
            params![
                run.run_id,
                run.status.as_str(),
                serde_json::to_string(run)?,
                run.updated_at_ms,
            ],
        )?;
        if n == 0 {
            anyhow::bail!("unknown run {}", run.run_id);
        }
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row("SELECT body_json FROM runs WHERE run_id = ?1", [run_id], row_to_run)
            .optional()?)
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT body_json FROM runs ORDER BY created_at_ms DESC, run_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn enqueue(&self, task: &NewTask, now_ms: i64) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_task(&tx, task, now_ms)?;
        tx.commit()?;
        Ok(())
    }

    fn claim_due(&self, worker: &str, now_ms: i64, lease_ms: i64) -> Result<Option<ScheduledTask>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let candidates: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT task_id FROM tasks WHERE status = 'pending' AND eta_ms <= ?1 \
                 ORDER BY eta_ms ASC, created_at_ms ASC, task_id ASC",
            )?;
            let rows = stmt.query_map([now_ms], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };
        let mut claimed = None;
        for id in candidates {
            if let Some(t) = try_claim(&tx, &id, worker, now_ms, lease_ms)? {
                claimed = Some(t);
                break;
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    fn claim_task(
        &self,
        task_id: &str,
        worker: &str,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<ScheduledTask>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let claimed = try_claim(&tx, task_id, worker, now_ms, lease_ms)?;
        tx.commit()?;
        Ok(claimed)
    }

    fn complete(
        &self,
        task_id: &str,
        lease_token: &str,
        outcome: &TaskOutcome,
        follow_ups: &[NewTask],
        now_ms: i64,
    ) -> Result<Completion> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let Some(t) = load_task(&tx, task_id)? else {
            return Err(StoreError::UnknownTask(task_id.to_string()).into());
        };
        if t.status.is_terminal() {
            return Ok(Completion::AlreadyTerminal);
        }
        if t.status != TaskStatus::Running || t.lease_token.as_deref() != Some(lease_token) {
            return Err(StoreError::LeaseMismatch(task_id.to_string()).into());
        }

        let skipped = match outcome {
            TaskOutcome::Succeeded { result } => {
                tx.execute(
                    "UPDATE tasks SET status = 'succeeded', result = ?2, error = NULL, \
                     lease_owner = NULL, lease_token = NULL, lease_expires_at_ms = NULL, \
                     updated_at_ms = ?3 WHERE task_id = ?1",
                    params![task_id, result, now_ms],
                )?;
                for f in follow_ups {
                    insert_task(&tx, f, now_ms)?;
                }
                Vec::new()
            }
            TaskOutcome::Failed { error } => {
                tx.execute(
                    "UPDATE tasks SET status = 'failed', error = ?2, \
                     lease_owner = NULL, lease_token = NULL, lease_expires_at_ms = NULL, \
                     updated_at_ms = ?3 WHERE task_id = ?1",
                    params![task_id, error, now_ms],
                )?;
                skip_dependents(&tx, task_id, now_ms)?
            }
        };
        tx.commit()?;
        Ok(Completion::Recorded { skipped })
    }

    fn renew_lease(&self, task_id: &str, lease_token: &str, now_ms: i64, lease_ms: i64) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE tasks SET lease_expires_at_ms = ?3, updated_at_ms = ?4 \
             WHERE task_id = ?1 AND lease_token = ?2 AND status = 'running'",
            params![task_id, lease_token, now_ms + lease_ms, now_ms],
        )?;
        Ok(n > 0)
    }

    fn requeue_expired(&self, now_ms: i64) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE tasks SET status = 'pending', lease_owner = NULL, lease_token = NULL, \
             lease_expires_at_ms = NULL, updated_at_ms = ?1 \
             WHERE status = 'running' AND lease_expires_at_ms IS NOT NULL AND lease_expires_at_ms < ?1",
            [now_ms],
        )?;
        Ok(n)
    }

    fn cancel(&self, task_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM tasks WHERE task_id = ?1 AND status = 'pending'",
            [task_id],
        )?;
        Ok(n > 0)
    }

    fn get_task(&self, task_id: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.lock()?;
        load_task(&conn, task_id)
    }

    fn open_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let conn = self.lock()?;
        query_tasks(&conn, "status IN ('pending', 'running')", params![])
    }

    fn tasks_for_run(&self, run_id: &str) -> Result<Vec<ScheduledTask>> {
        let conn = self.lock()?;
        query_tasks(&conn, "run_id = ?1", params![run_id])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use factory_core::model::{LengthCategory, RunStatus};
    use factory_core::policy::PolicyState;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn run(id: &str, created: i64) -> PipelineRun {
        PipelineRun {
            run_id: id.into(),
            topic: "MikroTik QoS".into(),
            length_category: LengthCategory::Short,
            estimated_duration_sec: 180,
            state: PolicyState::default(),
            stage_outputs: BTreeMap::new(),
            status: RunStatus::Pending,
            duration_sec: None,
            error: None,
            created_at_ms: created,
            updated_at_ms: created,
        }
    }

    #[test]
    fn runs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("factory.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_run(&run("r1", 1)).unwrap();
            let mut r2 = run("r2", 2);
            store.insert_run(&r2).unwrap();
            r2.status = RunStatus::Failed;
            r2.error = Some("voice: tts offline".into());
            store.update_run(&r2).unwrap();
            store
                .enqueue(
                    &NewTask::new(
                        "r2",
                        TaskKind::ManageStorage {
                            topic: "MikroTik QoS".into(),
                            video_path: PathBuf::from("videos/MikroTik_QoS.mp4"),
                        },
                        10,
                    ),
                    5,
                )
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let recent = store.recent_runs(10).unwrap();
        assert_eq!(recent.iter().map(|r| r.run_id.as_str()).collect::<Vec<_>>(), ["r2", "r1"]);
        assert_eq!(recent[0].status, RunStatus::Failed);
        assert_eq!(store.tasks_for_run("r2").unwrap().len(), 1);
        assert_eq!(store.open_tasks().unwrap().len(), 1);
        assert!(store.update_run(&run("missing", 3)).is_err());
    }
}
