//! In-flight job registry: at most one cold start per key.
//!
//! The in-process map answers the common case without touching storage;
//! the partial unique index on `jobs(job_key) WHERE in_flight = 1` covers
//! other processes sharing the database.

use std::collections::HashMap;
use std::sync::Arc;

use curricula_shared::{CurriculaError, JobId, Result};
use curricula_storage::Storage;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This job now owns the key.
    Owner,
    /// Another job already holds the key.
    Joined(JobId),
}

pub struct JobRegistry {
    storage: Arc<Storage>,
    in_flight: Mutex<HashMap<String, JobId>>,
}

impl JobRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the job's key and persist it as in-flight.
    ///
    /// On `Joined` the job is left unclaimed and nothing is written.
    pub async fn claim(&self, job: &mut Job) -> Result<Claim> {
        let key = job
            .key
            .as_ref()
            .map(ToString::to_string)
            .ok_or_else(|| CurriculaError::Unclassified(format!("job {} has no key", job.id)))?;

        let mut map = self.in_flight.lock().await;
        if let Some(holder) = map.get(&key) {
            if *holder != job.id {
                debug!(key = %key, holder = %holder, "joining in-process job");
                return Ok(Claim::Joined(*holder));
            }
        }

        job.claimed = true;
        let row = job.to_row()?;
        match self.storage.claim_job_key(&row, &key).await {
            Ok(None) => {
                map.insert(key.clone(), job.id);
                info!(job_id = %job.id, key = %key, "job key claimed");
                Ok(Claim::Owner)
            }
            Ok(Some(holder)) => {
                job.claimed = false;
                let holder: JobId = holder.parse().map_err(|e| {
                    CurriculaError::Storage(format!("invalid job id '{holder}': {e}"))
                })?;
                debug!(key = %key, holder = %holder, "joining persisted job");
                Ok(Claim::Joined(holder))
            }
            Err(e) => {
                job.claimed = false;
                Err(e)
            }
        }
    }

    /// Register a job recovered from storage that already holds its key.
    pub async fn adopt(&self, job: &Job) {
        if let Some(key) = &job.key {
            self.in_flight.lock().await.insert(key.to_string(), job.id);
        }
    }

    /// Drop the in-process claim. The storage flag clears when the job is
    /// saved in a terminal state.
    pub async fn release(&self, job: &Job) {
        let Some(key) = &job.key else {
            return;
        };
        let key = key.to_string();
        let mut map = self.in_flight.lock().await;
        if map.get(&key) == Some(&job.id) {
            map.remove(&key);
            debug!(job_id = %job.id, key = %key, "job key released");
        }
    }

    pub async fn holder(&self, key: &str) -> Option<JobId> {
        self.in_flight.lock().await.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKey;
    use crate::state::JobState;
    use crate::testkit::{curriculum_request, test_storage};

    fn keyed_job() -> Job {
        let mut job = Job::new(curriculum_request("JSS 1 biology for Nigeria"));
        job.state = JobState::EnqueueColdStart;
        job.key = Some(JobKey {
            country_code: "ng".into(),
            jurisdiction_key: "national".into(),
            grade: "jss 1".into(),
            subject: "biology".into(),
        });
        job
    }

    #[tokio::test]
    async fn second_claim_joins_first() {
        let storage = Arc::new(test_storage().await);
        let registry = JobRegistry::new(storage.clone());

        let mut first = keyed_job();
        let mut second = keyed_job();
        assert_eq!(registry.claim(&mut first).await.unwrap(), Claim::Owner);
        assert_eq!(
            registry.claim(&mut second).await.unwrap(),
            Claim::Joined(first.id)
        );
        assert!(first.claimed);
        assert!(!second.claimed);
        assert!(storage.load_job(&second.id.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_held_by_another_process_joins() {
        let storage = Arc::new(test_storage().await);
        let mut other = keyed_job();
        JobRegistry::new(storage.clone())
            .claim(&mut other)
            .await
            .unwrap();

        // A fresh registry has an empty map and must fall back to storage.
        let registry = JobRegistry::new(storage);
        let mut mine = keyed_job();
        assert_eq!(
            registry.claim(&mut mine).await.unwrap(),
            Claim::Joined(other.id)
        );
    }

    #[tokio::test]
    async fn release_after_terminal_save_frees_key() {
        let storage = Arc::new(test_storage().await);
        let registry = JobRegistry::new(storage.clone());

        let mut first = keyed_job();
        registry.claim(&mut first).await.unwrap();
        first.state = JobState::End;
        storage.save_job(&first.to_row().unwrap()).await.unwrap();
        registry.release(&first).await;

        let mut second = keyed_job();
        assert_eq!(registry.claim(&mut second).await.unwrap(), Claim::Owner);
    }
}
