//! Job model: the durable record of one admitted generation request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a job.  Stored as its snake_case string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, waiting for a dispatcher claim.
    Pending,
    /// Claimed; exactly one monitor owns the job.
    Processing,
    /// Terminal: results saved.
    Completed,
    /// Terminal: the generation could not be completed.
    Failed,
    /// Terminal: cancelled by an external request.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Returns `true` if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The set of statuses that are valid successors of `self`.
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Pending => &[
                JobStatus::Processing,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
            JobStatus::Processing => &[
                JobStatus::Pending,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    ///
    /// `Processing -> Pending` is the retryable-failure path: the caller of
    /// [`fail`](crate::queue::QueueStore::fail) opted to re-queue instead of
    /// terminating.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(CoreError::InvalidFieldValue(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Backend protocol dialect tag.  A job is pinned to one dialect at
/// admission; only `forge` is currently spoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    #[default]
    Forge,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Forge => "forge",
        }
    }
}

impl std::fmt::Display for AppType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AppType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forge" => Ok(AppType::Forge),
            other => Err(CoreError::InvalidFieldValue(format!(
                "unknown app_type '{other}'"
            ))),
        }
    }
}

/// The mutable result section of a job.
///
/// During `processing` it mirrors the latest progress frame; on success it
/// holds the ordered saved filenames and the generation-info blob; on
/// failure, the error kind and message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filenames: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<i64>,
}

/// One admitted generation request and its lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Serialized as `job_id`: every wire surface (REST, push channel)
    /// uses that name.
    #[serde(rename = "job_id")]
    pub id: String,
    pub status: JobStatus,
    pub target_backend: String,
    /// Opaque per-generation handle returned by the backend.  Set at most
    /// once; never reused.
    pub backend_session: Option<String>,
    pub app_type: AppType,
    pub source_info: Option<String>,
    pub api_key_ref: Option<String>,
    /// Preserved verbatim apart from checkpoint-path canonicalization.
    pub generation_params: serde_json::Value,
    pub result: JobResult,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, when the job reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Ephemeral progress record published on the bus while a job generates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFrame {
    pub job_id: String,
    /// In `[0, 100]`; non-decreasing per job until a terminal event.
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_filename: Option<String>,
    pub current_step: i64,
    pub total_steps: i64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn terminal_statuses_have_no_successors() {
        for s in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(s.is_terminal());
            assert!(s.valid_transitions().is_empty());
        }
    }

    #[test]
    fn pending_can_be_claimed_or_cancelled() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn processing_can_requeue() {
        // Retryable-failure path opted into by the fail() caller.
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_str(s.as_str()).unwrap(), s);
        }
        assert!(JobStatus::from_str("interrupted").is_err());
    }

    #[test]
    fn app_type_defaults_to_forge() {
        assert_eq!(AppType::default(), AppType::Forge);
        assert!(AppType::from_str("comfy").is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn any_status() -> impl Strategy<Value = JobStatus> {
            prop_oneof![
                Just(JobStatus::Pending),
                Just(JobStatus::Processing),
                Just(JobStatus::Completed),
                Just(JobStatus::Failed),
                Just(JobStatus::Cancelled),
            ]
        }

        proptest! {
            #[test]
            fn terminal_states_admit_no_successor(a in any_status(), b in any_status()) {
                if a.is_terminal() {
                    prop_assert!(!a.can_transition_to(b));
                }
            }

            #[test]
            fn transitions_are_never_reflexive(a in any_status()) {
                prop_assert!(!a.can_transition_to(a));
            }

            #[test]
            fn every_successor_is_reachable_per_table(a in any_status()) {
                for b in a.valid_transitions() {
                    prop_assert!(a.can_transition_to(*b));
                }
            }
        }
    }
}
