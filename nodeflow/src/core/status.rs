//! Node status enum and the status utilities used by the state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a node execution.
///
/// Terminal statuses are final: once a node reaches one, the store refuses
/// any further status mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Node is scheduled but has not started.
    Queued,
    /// Node is executing or suspended on a wait-id.
    Running,
    /// Node awaits manual intervention.
    Paused,
    /// Node is being torn down as part of an abort.
    Discontinuing,
    /// Node completed successfully.
    Succeeded,
    /// Node failed.
    Failed,
    /// Node was aborted.
    Aborted,
    /// Node exceeded its deadline.
    Expired,
    /// Node was skipped.
    Skipped,
    /// Node failed but the failure strategy chose to ignore it.
    IgnoreFailed,
}

impl Default for Status {
    fn default() -> Self {
        Self::Queued
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Discontinuing => "DISCONTINUING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
            Self::Expired => "EXPIRED",
            Self::Skipped => "SKIPPED",
            Self::IgnoreFailed => "IGNORE_FAILED",
        };
        f.write_str(s)
    }
}

const FINAL_STATUSES: &[Status] = &[
    Status::Succeeded,
    Status::Failed,
    Status::Aborted,
    Status::Expired,
    Status::Skipped,
    Status::IgnoreFailed,
];

const FLOWING_STATUSES: &[Status] = &[Status::Queued, Status::Running, Status::Discontinuing];

impl Status {
    /// Returns true if the status is terminal.
    #[must_use]
    pub fn is_final(self) -> bool {
        FINAL_STATUSES.contains(&self)
    }

    /// Returns true if the node is still making progress on its own.
    #[must_use]
    pub fn is_flowing(self) -> bool {
        FLOWING_STATUSES.contains(&self)
    }

    /// Returns true for terminal statuses that let downstream work continue.
    #[must_use]
    pub fn is_positive(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::IgnoreFailed)
    }

    /// Returns true for terminal statuses that represent a broken node.
    #[must_use]
    pub fn is_broke(self) -> bool {
        matches!(self, Self::Failed | Self::Expired)
    }

    /// Returns true if `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_final() {
            return false;
        }
        match self {
            Self::Queued => matches!(
                next,
                Self::Running | Self::Skipped | Self::Aborted | Self::Expired | Self::Discontinuing
            ),
            Self::Running => next != Self::Queued && next != Self::Running,
            Self::Paused => next != Self::Queued && next != Self::Paused,
            Self::Discontinuing => matches!(next, Self::Aborted | Self::Expired),
            _ => false,
        }
    }

    /// Severity used when folding child statuses into a parent status.
    fn severity(self) -> u8 {
        match self {
            Self::Aborted => 6,
            Self::Expired => 5,
            Self::Failed => 4,
            Self::IgnoreFailed => 3,
            Self::Succeeded => 2,
            Self::Skipped => 1,
            _ => 0,
        }
    }
}

/// Returns the terminal statuses.
#[must_use]
pub fn final_statuses() -> &'static [Status] {
    FINAL_STATUSES
}

/// Returns the statuses in which a node progresses without outside help.
#[must_use]
pub fn flowing_statuses() -> &'static [Status] {
    FLOWING_STATUSES
}

/// Returns true if `status` is terminal.
#[must_use]
pub fn is_final_status(status: Status) -> bool {
    status.is_final()
}

/// Status reported to observers for a plan execution.
///
/// A queued plan that already has started work is reported as running.
#[must_use]
pub fn calculate_status_for_plan_execution(status: Status, has_started_work: bool) -> Status {
    if status == Status::Queued && has_started_work {
        Status::Running
    } else {
        status
    }
}

/// Folds terminal child statuses into a single parent status.
///
/// The most severe status wins. An empty input yields `Succeeded`, and a
/// non-terminal child status is treated as a failure.
#[must_use]
pub fn aggregate_status<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut worst: Option<Status> = None;
    for status in statuses {
        worst = match worst {
            Some(current) if current.severity() >= status.severity() => Some(current),
            _ => Some(status),
        };
    }
    match worst {
        None => Status::Succeeded,
        Some(status) if status.severity() == 0 => Status::Failed,
        Some(status) => status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Queued.to_string(), "QUEUED");
        assert_eq!(Status::IgnoreFailed.to_string(), "IGNORE_FAILED");
        assert_eq!(Status::Expired.to_string(), "EXPIRED");
    }

    #[test]
    fn test_final_statuses() {
        for status in final_statuses() {
            assert!(is_final_status(*status));
        }
        assert!(!Status::Running.is_final());
        assert!(!Status::Paused.is_final());
        assert!(!Status::Discontinuing.is_final());
    }

    #[test]
    fn test_terminal_statuses_reject_transitions() {
        for status in final_statuses() {
            assert!(!status.can_transition_to(Status::Running));
            assert!(!status.can_transition_to(Status::Failed));
        }
    }

    #[test]
    fn test_transitions() {
        assert!(Status::Queued.can_transition_to(Status::Running));
        assert!(!Status::Queued.can_transition_to(Status::Succeeded));
        assert!(Status::Running.can_transition_to(Status::Paused));
        assert!(Status::Paused.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::Expired));
        assert!(!Status::Running.can_transition_to(Status::Queued));
        assert!(Status::Discontinuing.can_transition_to(Status::Aborted));
        assert!(!Status::Discontinuing.can_transition_to(Status::Succeeded));
    }

    #[test]
    fn test_plan_status_calculation() {
        assert_eq!(calculate_status_for_plan_execution(Status::Queued, true), Status::Running);
        assert_eq!(calculate_status_for_plan_execution(Status::Queued, false), Status::Queued);
        assert_eq!(calculate_status_for_plan_execution(Status::Failed, true), Status::Failed);
    }

    #[test]
    fn test_aggregate_status() {
        assert_eq!(aggregate_status([]), Status::Succeeded);
        assert_eq!(aggregate_status([Status::Skipped, Status::Skipped]), Status::Skipped);
        assert_eq!(aggregate_status([Status::Succeeded, Status::Skipped]), Status::Succeeded);
        assert_eq!(aggregate_status([Status::Succeeded, Status::Failed]), Status::Failed);
        assert_eq!(aggregate_status([Status::Expired, Status::Aborted]), Status::Aborted);
        assert_eq!(aggregate_status([Status::IgnoreFailed, Status::Succeeded]), Status::IgnoreFailed);
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&Status::IgnoreFailed).unwrap();
        assert_eq!(json, r#""IGNORE_FAILED""#);

        let deserialized: Status = serde_json::from_str(r#""RUNNING""#).unwrap();
        assert_eq!(deserialized, Status::Running);
    }
}
