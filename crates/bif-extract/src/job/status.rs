//! Job lifecycle states and the legal transitions between them

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ExtractError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Finalizing,
    Stopped,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Finalizing,
        JobStatus::Stopped,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Finalizing => "FINALIZING",
            JobStatus::Stopped => "STOPPED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// No outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Waiting for a worker slot
    pub fn is_launchable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Queued)
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Queued | Processing | Stopped | Failed)
                | (Queued, Processing | Failed)
                | (Processing, Finalizing | Stopped | Failed)
                | (Finalizing, Completed | Failed)
                | (Stopped, Processing | Failed | Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ExtractError::Store(format!("unknown job status {s:?}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [JobStatus::Completed, JobStatus::Failed] {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn test_transition_table() {
        use JobStatus::*;
        let legal = [
            (Pending, Queued),
            (Pending, Processing),
            (Pending, Stopped),
            (Pending, Failed),
            (Queued, Processing),
            (Queued, Failed),
            (Processing, Finalizing),
            (Processing, Stopped),
            (Processing, Failed),
            (Finalizing, Completed),
            (Finalizing, Failed),
            (Stopped, Processing),
            (Stopped, Failed),
            (Stopped, Pending),
        ];
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_parse_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!("processing".parse::<JobStatus>().unwrap(), JobStatus::Processing);
        assert!("RUNNING".parse::<JobStatus>().is_err());
    }
}
