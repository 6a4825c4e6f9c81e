use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{from_ms, parse_column, to_ms, StateStore};
use crate::error::{JobMgrError, Result};
use crate::job::{GoalState, PendingAction, TaskId, TaskRecord, TaskState};
use crate::master::MasterHandle;

const TASK_COLUMNS: &str = "job_id, instance, actual_state, desired_state, master_handle, \
     run_id, retry_count, failure_count, pending_action, pending_handle, halted, message, \
     version, updated_at_ms";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let job_id: String = row.get(0)?;
    let actual: String = row.get(2)?;
    let desired: String = row.get(3)?;
    let master_handle: Option<String> = row.get(4)?;
    let pending_action: Option<String> = row.get(8)?;
    let pending_handle: Option<String> = row.get(9)?;

    let pending = match (pending_action, pending_handle) {
        (Some(kind), Some(handle)) => Some(
            PendingAction::from_parts(&kind, MasterHandle::new(handle)).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    8,
                    rusqlite::types::Type::Text,
                    format!("unknown pending action '{}'", kind).into(),
                )
            })?,
        ),
        _ => None,
    };

    Ok(TaskRecord {
        id: TaskId::new(parse_column::<Uuid>(0, &job_id)?, row.get(1)?),
        actual: parse_column::<TaskState>(2, &actual)?,
        desired: parse_column::<GoalState>(3, &desired)?,
        master_handle: master_handle.map(MasterHandle::new),
        run_id: row.get::<_, i64>(5)? as u64,
        retry_count: row.get(6)?,
        failure_count: row.get(7)?,
        pending,
        halted: row.get(10)?,
        message: row.get(11)?,
        version: row.get::<_, i64>(12)? as u64,
        updated_at: from_ms(row.get(13)?),
    })
}

impl StateStore {
    pub(super) fn insert_task(conn: &Connection, task: &TaskRecord) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                TASK_COLUMNS
            ),
            params![
                task.id.job_id.to_string(),
                task.id.instance,
                task.actual.as_str(),
                task.desired.as_str(),
                task.master_handle.as_ref().map(|h| h.as_str()),
                task.run_id as i64,
                task.retry_count,
                task.failure_count,
                task.pending.as_ref().map(|p| p.kind()),
                task.pending.as_ref().map(|p| p.handle().as_str()),
                task.halted,
                task.message,
                task.version as i64,
                to_ms(task.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>> {
        let task = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT {} FROM tasks WHERE job_id = ?1 AND instance = ?2",
                    TASK_COLUMNS
                ),
                params![task_id.job_id.to_string(), task_id.instance],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// Write `task` if its `version` is still the stored one.
    ///
    /// Returns the stored record, whose version is one higher. Fails with
    /// [`JobMgrError::Conflict`] when another writer got there first.
    pub fn put(&self, task: &TaskRecord) -> Result<TaskRecord> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE tasks
             SET actual_state = ?3, desired_state = ?4, master_handle = ?5, run_id = ?6,
                 retry_count = ?7, failure_count = ?8, pending_action = ?9,
                 pending_handle = ?10, halted = ?11, message = ?12,
                 version = version + 1, updated_at_ms = ?13
             WHERE job_id = ?1 AND instance = ?2 AND version = ?14",
            params![
                task.id.job_id.to_string(),
                task.id.instance,
                task.actual.as_str(),
                task.desired.as_str(),
                task.master_handle.as_ref().map(|h| h.as_str()),
                task.run_id as i64,
                task.retry_count,
                task.failure_count,
                task.pending.as_ref().map(|p| p.kind()),
                task.pending.as_ref().map(|p| p.handle().as_str()),
                task.halted,
                task.message,
                to_ms(task.updated_at),
                task.version as i64,
            ],
        )?;

        if updated == 0 {
            let current: Option<i64> = conn
                .query_row(
                    "SELECT version FROM tasks WHERE job_id = ?1 AND instance = ?2",
                    params![task.id.job_id.to_string(), task.id.instance],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match current {
                Some(actual) => JobMgrError::Conflict {
                    task: task.id,
                    expected: task.version,
                    actual: actual as u64,
                },
                None => JobMgrError::TaskNotFound(task.id),
            });
        }

        let mut stored = task.clone();
        stored.version += 1;
        stored.updated_at = from_ms(to_ms(task.updated_at));
        Ok(stored)
    }

    /// Read-modify-write a task, re-reading and re-applying `mutate` when a
    /// concurrent writer bumps the version in between.
    ///
    /// Nothing is written when `mutate` leaves the record unchanged.
    pub fn update_task<F>(&self, task_id: &TaskId, retries: u32, mut mutate: F) -> Result<TaskRecord>
    where
        F: FnMut(&mut TaskRecord),
    {
        let mut attempt = 0;
        loop {
            let current = self
                .get(task_id)?
                .ok_or(JobMgrError::TaskNotFound(*task_id))?;
            let mut next = current.clone();
            mutate(&mut next);
            if next == current {
                return Ok(current);
            }
            next.version = current.version;

            match self.put(&next) {
                Err(JobMgrError::Conflict { .. }) if attempt < retries => {
                    attempt += 1;
                    tracing::debug!(task_id = %task_id, attempt, "Version conflict, re-reading task");
                }
                other => return other,
            }
        }
    }

    pub fn count_tasks(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Tasks of a job ordered by instance.
    pub fn list_by_job(&self, job_id: &Uuid) -> Result<Vec<TaskRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE job_id = ?1 ORDER BY instance",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![job_id.to_string()], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Tasks with work left: desired differs from actual on a task that is
    /// not halted, or a directive outcome is still unverified.
    pub fn scan_desired_not_actual(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn()?;
        // Goal names coincide with the task states that realize them
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks
             WHERE (actual_state <> desired_state AND halted = 0)
                OR pending_action IS NOT NULL
             ORDER BY job_id, instance",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Tasks whose last directive outcome is unknown.
    pub fn list_pending(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE pending_action IS NOT NULL ORDER BY job_id, instance",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// The task that owns `handle`, either as its current instance or as the
    /// target of its unverified directive.
    pub fn get_by_handle(&self, handle: &MasterHandle) -> Result<Option<TaskRecord>> {
        let task = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT {} FROM tasks WHERE master_handle = ?1 OR pending_handle = ?1 LIMIT 1",
                    TASK_COLUMNS
                ),
                params![handle.as_str()],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }
}
