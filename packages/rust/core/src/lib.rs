//! Decision and orchestration engine for Curricula.
//!
//! This crate turns a free-form curriculum request into a job and drives it
//! through normalization, jurisdiction resolution, the vault, the cold-start
//! stages (search, validation, parsing, embedding), replica storage, and
//! grounded generation. [`Orchestrator`] is the entry point.

pub mod bridge;
pub mod job;
pub mod jurisdiction;
pub mod normalizer;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod stages;
pub mod state;
pub mod vault;

#[cfg(test)]
mod testkit;

pub use bridge::{BridgeConfig, BridgeModel};
pub use job::{AlertKind, Job, JobKey, TierRecord};
pub use jurisdiction::{Question, QuestionKind};
pub use orchestrator::{
    Collaborators, JobStatus, KillSwitch, KillSwitches, Orchestrator, ResumeEvent, SubmitOutcome,
};
pub use progress::{ProgressReporter, SilentProgress};
pub use state::JobState;
