//! Synthetic sync fences and timelines for compositor validation.
//!
//! This crate emulates the kernel software-sync model closely enough to drive buffer-acquire and
//! buffer-release signaling between a producer and a consumer without real hardware:
//! - [`Timeline`]: a monotonic counter that fences are created against.
//! - [`Fence`]: a move-only handle that signals once its timeline point(s) are reached, with
//!   AND-merge and duplication.
//! - [`FenceTable`]: fd-style integer handles over [`Fence`], with double-close detection.
//! - [`ClosedFenceReconciler`]: maps "N input fences closed" onto advancing an output timeline.
//! - [`ReleaseFencePool`]: a bounded set of per-slot timelines released in sequential, random or
//!   retain-oldest order.
//! - [`TimelineTicker`]: a timeline advanced by wall-clock time.
//!
//! Everything is owned explicitly by the harness; there are no process-wide registries.
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod fence;
pub mod reconciler;
pub mod release_pool;
pub mod table;
pub mod ticker;
pub mod timeline;

pub use config::{ConfigError, SyncConfig};
pub use error::{Result, Severity, SyncCheck, SyncError};
pub use fence::{Fence, FenceId, SyncPointInfo, WaitOutcome};
pub use reconciler::{ClosedFenceReconciler, ReconcilerCounters};
pub use release_pool::{ReleaseFencePool, ReleaseMode, ReleasePolicy, ReleasePoolConfig};
pub use table::{FenceHandle, FenceTable, FenceTableStats};
pub use ticker::TimelineTicker;
pub use timeline::{Timeline, TimelineId};
