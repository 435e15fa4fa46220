//! Job persistence: suspended and in-flight orchestrator jobs.
//!
//! The job body is opaque JSON owned by the orchestrator. Storage only
//! understands the columns it must index: the cold-start key, the state
//! name and the in-flight flag.

use chrono::Utc;
use curricula_shared::{CurriculaError, Result};
use libsql::params;

use crate::{Storage, db_err};

/// One persisted job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    /// Cold-start key, set once the job claims one.
    pub job_key: Option<String>,
    pub state: String,
    /// True while the job holds its key.
    pub in_flight: bool,
    pub resume_token: Option<String>,
    pub body_json: String,
    pub last_error: Option<String>,
}

impl Storage {
    /// Insert or update a job row by id.
    pub async fn save_job(&self, job: &JobRow) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO jobs (id, job_key, state, in_flight, resume_token, body_json,
                    last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                   job_key = excluded.job_key,
                   state = excluded.state,
                   in_flight = excluded.in_flight,
                   resume_token = excluded.resume_token,
                   body_json = excluded.body_json,
                   last_error = excluded.last_error,
                   updated_at = excluded.updated_at",
                params![
                    job.id.as_str(),
                    job.job_key.as_deref(),
                    job.state.as_str(),
                    i64::from(job.in_flight),
                    job.resume_token.as_deref(),
                    job.body_json.as_str(),
                    job.last_error.as_deref(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    CurriculaError::Conflict(format!(
                        "job key {:?} is already held by an in-flight job",
                        job.job_key
                    ))
                } else {
                    db_err(e)
                }
            })?;
        Ok(())
    }

    /// Atomically claim `job_key` for `job`.
    ///
    /// Returns `None` when the claim succeeded and the job was saved as
    /// in-flight, or the id of the job already holding the key.
    pub async fn claim_job_key(&self, job: &JobRow, job_key: &str) -> Result<Option<String>> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.in_flight_holder(job_key).await? {
            if existing != job.id {
                return Ok(Some(existing));
            }
        }

        let now = Utc::now().to_rfc3339();
        let result = self
            .conn
            .execute(
                "INSERT INTO jobs (id, job_key, state, in_flight, resume_token, body_json,
                    last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   job_key = excluded.job_key,
                   state = excluded.state,
                   in_flight = 1,
                   resume_token = excluded.resume_token,
                   body_json = excluded.body_json,
                   last_error = excluded.last_error,
                   updated_at = excluded.updated_at",
                params![
                    job.id.as_str(),
                    job_key,
                    job.state.as_str(),
                    job.resume_token.as_deref(),
                    job.body_json.as_str(),
                    job.last_error.as_deref(),
                    now.as_str(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(None),
            // Another process won the partial unique index.
            Err(e) if e.to_string().contains("UNIQUE") => {
                match self.in_flight_holder(job_key).await? {
                    Some(existing) => Ok(Some(existing)),
                    None => Err(db_err(e)),
                }
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn in_flight_holder(&self, job_key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM jobs WHERE job_key = ?1 AND in_flight = 1",
                params![job_key],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Load a job by id.
    pub async fn load_job(&self, id: &str) -> Result<Option<JobRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, job_key, state, in_flight, resume_token, body_json, last_error
                 FROM jobs WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Jobs currently in any of `states`, oldest first.
    pub async fn list_jobs_in_states(&self, states: &[&str]) -> Result<Vec<JobRow>> {
        let mut results = Vec::new();
        for state in states {
            let mut rows = self
                .conn
                .query(
                    "SELECT id, job_key, state, in_flight, resume_token, body_json, last_error
                     FROM jobs WHERE state = ?1 ORDER BY id",
                    params![*state],
                )
                .await
                .map_err(db_err)?;
            while let Some(row) = rows.next().await.map_err(db_err)? {
                results.push(row_to_job(&row)?);
            }
        }
        results.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(results)
    }
}

fn row_to_job(row: &libsql::Row) -> Result<JobRow> {
    Ok(JobRow {
        id: row.get::<String>(0).map_err(db_err)?,
        job_key: row.get::<String>(1).ok(),
        state: row.get::<String>(2).map_err(db_err)?,
        in_flight: row.get::<i64>(3).map_err(db_err)? != 0,
        resume_token: row.get::<String>(4).ok(),
        body_json: row.get::<String>(5).map_err(db_err)?,
        last_error: row.get::<String>(6).ok(),
    })
}
