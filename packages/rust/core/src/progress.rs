//! Progress callbacks for callers that want to watch a job move.

use curricula_shared::JobId;

use crate::state::JobState;

/// Progress callback for orchestrator jobs.
pub trait ProgressReporter: Send + Sync {
    /// Called when a job enters a new state.
    fn phase(&self, job_id: JobId, state: JobState);
    /// Called when a job stops: terminal or suspended.
    fn done(&self, job_id: JobId, state: JobState);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _job_id: JobId, _state: JobState) {}
    fn done(&self, _job_id: JobId, _state: JobState) {}
}
