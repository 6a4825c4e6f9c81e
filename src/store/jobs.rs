use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{from_ms, parse_column, to_ms, StateStore};
use crate::error::{JobMgrError, Result};
use crate::job::{GoalState, JobRecord, JobSpec, TaskRecord};

const JOB_COLUMNS: &str = "id, spec_json, goal_state, created_at_ms, updated_at_ms";

struct JobRow {
    id: String,
    spec_json: String,
    goal_state: String,
    created_at_ms: i64,
    updated_at_ms: i64,
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        spec_json: row.get(1)?,
        goal_state: row.get(2)?,
        created_at_ms: row.get(3)?,
        updated_at_ms: row.get(4)?,
    })
}

fn decode(row: JobRow) -> Result<JobRecord> {
    Ok(JobRecord {
        id: parse_column::<Uuid>(0, &row.id)?,
        spec: serde_json::from_str::<JobSpec>(&row.spec_json)?,
        goal_state: parse_column::<GoalState>(2, &row.goal_state)?,
        created_at: from_ms(row.created_at_ms),
        updated_at: from_ms(row.updated_at_ms),
    })
}

impl StateStore {
    /// Insert a job and all of its tasks in one transaction.
    pub fn create_job(&self, job: &JobRecord, tasks: &[TaskRecord]) -> Result<()> {
        let spec_json = serde_json::to_string(&job.spec)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO jobs (id, name, spec_json, goal_state, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id.to_string(),
                job.spec.name,
                spec_json,
                job.goal_state.as_str(),
                to_ms(job.created_at),
                to_ms(job.updated_at),
            ],
        )?;
        for task in tasks {
            Self::insert_task(&tx, task)?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &Uuid) -> Result<Option<JobRecord>> {
        let row = self
            .conn()?
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![job_id.to_string()],
                job_from_row,
            )
            .optional()?;
        row.map(decode).transpose()
    }

    /// All jobs, oldest first.
    pub fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs ORDER BY created_at_ms, id",
                JOB_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], job_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(decode).collect()
    }

    pub fn count_jobs(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Set the goal of a job and of every task whose goal differs, atomically.
    ///
    /// Each changed task gets a new version, so an in-flight read-modify-write
    /// of that task fails with a conflict and re-reads the new goal. Returns
    /// the number of tasks whose goal changed; 0 means the call was a no-op.
    pub fn set_job_goal(&self, job_id: &Uuid, goal: GoalState) -> Result<usize> {
        let now_ms = to_ms(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT goal_state FROM jobs WHERE id = ?1",
                params![job_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(JobMgrError::JobNotFound(*job_id));
        }

        tx.execute(
            "UPDATE jobs SET goal_state = ?1, updated_at_ms = ?2
             WHERE id = ?3 AND goal_state <> ?1",
            params![goal.as_str(), now_ms, job_id.to_string()],
        )?;
        let changed = tx.execute(
            "UPDATE tasks
             SET desired_state = ?1, halted = 0, failure_count = 0,
                 version = version + 1, updated_at_ms = ?2
             WHERE job_id = ?3 AND desired_state <> ?1",
            params![goal.as_str(), now_ms, job_id.to_string()],
        )?;

        tx.commit()?;
        Ok(changed)
    }

    /// Remove a job and its tasks. Only allowed once no instance can be alive.
    pub fn delete_job(&self, job_id: &Uuid) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let found = tx
            .query_row(
                "SELECT 1 FROM jobs WHERE id = ?1",
                params![job_id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        if found.is_none() {
            return Err(JobMgrError::JobNotFound(*job_id));
        }

        let live: i64 = tx.query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE job_id = ?1
               AND (actual_state NOT IN ('KILLED', 'LOST', 'FAILED', 'INITIALIZED')
                    OR pending_action IS NOT NULL)",
            params![job_id.to_string()],
            |row| row.get(0),
        )?;
        if live > 0 {
            return Err(JobMgrError::JobNotTerminal(*job_id));
        }

        tx.execute(
            "DELETE FROM tasks WHERE job_id = ?1",
            params![job_id.to_string()],
        )?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", params![job_id.to_string()])?;
        tx.commit()?;
        Ok(())
    }
}
