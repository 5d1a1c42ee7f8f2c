mod ephemeral;
mod tracker;

pub use ephemeral::{EphemeralStore, MemoryEphemeralStore};
#[cfg(feature = "cache")]
pub use ephemeral::RedisEphemeralStore;
pub use tracker::{JobSnapshot, JobTracker, JobUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Forward-only lifecycle. Same-state moves are allowed only while active
/// (progress updates); terminal states are absorbing.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    match from {
        JobStatus::Pending => matches!(
            to,
            JobStatus::Pending | JobStatus::Processing | JobStatus::Failed
        ),
        JobStatus::Processing => matches!(
            to,
            JobStatus::Processing | JobStatus::Completed | JobStatus::Failed
        ),
        JobStatus::Completed | JobStatus::Failed => false,
    }
}

/// Quoted list of statuses that may move to `to`, for SQL `IN (…)` guards.
pub(crate) fn allowed_sources_sql(to: JobStatus) -> String {
    JobStatus::ALL
        .iter()
        .filter(|from| can_transition(**from, to))
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests;
