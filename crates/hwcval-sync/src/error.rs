use std::time::Duration;

use thiserror::Error;

use crate::table::FenceHandle;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the synthetic fence engine.
///
/// None of these are fatal to a validation run. Harness code is expected to count them through
/// [`SyncError::check`] and keep going.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("timeline {name} is not initialised")]
    InvalidTimeline { name: String },

    #[error("fence allocation failed: {0}")]
    AllocationFailed(String),

    #[error("release fence pool is full ({pool_size} slots pending)")]
    Full { pool_size: usize },

    #[error("fence handle {0} closed twice")]
    DoubleClose(FenceHandle),

    #[error("unknown fence handle {0}")]
    UnknownFence(FenceHandle),

    #[error("timed out after {waited:?} waiting for fence (timeout {timeout:?})")]
    Timeout { waited: Duration, timeout: Duration },

    #[error("retain-oldest release needs a full pool ({occupied}/{pool_size} slots pending)")]
    BadPolicyPrecondition { occupied: usize, pool_size: usize },

    #[error("no pending release fence to signal")]
    PoolEmpty,

    #[error("release fence slot {0} has no pending fence")]
    SlotNotPending(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// How much a [`SyncCheck`] matters to the validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Warning,
    Error,
}

/// Harness check categories that fence anomalies are counted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncCheck {
    TimelineNotInitialised,
    FenceAllocation,
    ReleaseFencePoolFull,
    FenceDoubleClose,
    FenceHandleUnknown,
    FenceTimeout,
    ReleasePolicyPrecondition,
    ReleasePoolEmpty,
    Configuration,
}

impl SyncCheck {
    pub fn severity(self) -> Severity {
        match self {
            SyncCheck::ReleaseFencePoolFull
            | SyncCheck::ReleasePolicyPrecondition
            | SyncCheck::ReleasePoolEmpty => Severity::Warning,
            SyncCheck::TimelineNotInitialised
            | SyncCheck::FenceAllocation
            | SyncCheck::FenceDoubleClose
            | SyncCheck::FenceHandleUnknown
            | SyncCheck::FenceTimeout
            | SyncCheck::Configuration => Severity::Error,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SyncCheck::TimelineNotInitialised => "timeline_not_initialised",
            SyncCheck::FenceAllocation => "fence_allocation",
            SyncCheck::ReleaseFencePoolFull => "release_fence_pool_full",
            SyncCheck::FenceDoubleClose => "fence_double_close",
            SyncCheck::FenceHandleUnknown => "fence_handle_unknown",
            SyncCheck::FenceTimeout => "fence_timeout",
            SyncCheck::ReleasePolicyPrecondition => "release_policy_precondition",
            SyncCheck::ReleasePoolEmpty => "release_pool_empty",
            SyncCheck::Configuration => "configuration",
        }
    }
}

impl SyncError {
    pub fn check(&self) -> SyncCheck {
        match self {
            SyncError::InvalidTimeline { .. } => SyncCheck::TimelineNotInitialised,
            SyncError::AllocationFailed(_) => SyncCheck::FenceAllocation,
            SyncError::Full { .. } => SyncCheck::ReleaseFencePoolFull,
            SyncError::DoubleClose(_) => SyncCheck::FenceDoubleClose,
            SyncError::UnknownFence(_) => SyncCheck::FenceHandleUnknown,
            SyncError::Timeout { .. } => SyncCheck::FenceTimeout,
            SyncError::BadPolicyPrecondition { .. } => SyncCheck::ReleasePolicyPrecondition,
            SyncError::PoolEmpty | SyncError::SlotNotPending(_) => SyncCheck::ReleasePoolEmpty,
            SyncError::InvalidConfig(_) => SyncCheck::Configuration,
        }
    }

    pub fn severity(&self) -> Severity {
        self.check().severity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_and_capacity_errors_are_warnings() {
        assert_eq!(SyncError::Full { pool_size: 4 }.severity(), Severity::Warning);
        assert_eq!(
            SyncError::BadPolicyPrecondition {
                occupied: 2,
                pool_size: 4
            }
            .severity(),
            Severity::Warning
        );
        assert_eq!(SyncError::PoolEmpty.severity(), Severity::Warning);
    }

    #[test]
    fn timeouts_are_errors_and_report_the_wait() {
        let err = SyncError::Timeout {
            waited: Duration::from_millis(12),
            timeout: Duration::from_millis(10),
        };
        assert_eq!(err.check(), SyncCheck::FenceTimeout);
        assert_eq!(err.severity(), Severity::Error);
        assert!(err.to_string().contains("12ms"), "{err}");
    }
}
