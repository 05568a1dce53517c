//! Strata: a versioned, layered virtual filesystem.
//!
//! Named stores hold trees of nodes. Every store has a mutable head and a
//! series of immutable snapshots. Layered directories and files delegate to
//! another store path and copy on write, per level, when modified. On top of
//! that sit branching with ancestry, tree comparison, update and flatten, and
//! a background reaper for nodes nothing can reach any more.

/// Runs an async operation body and records its duration and outcome.
macro_rules! instrumented {
    ($repo:expr, $operation:literal, { $($body:tt)* }) => {{
        let started = std::time::Instant::now();
        let result: $crate::fs::error::AvmResult<_> = async { $($body)* }.await;
        $repo.record($operation, started, &result);
        result
    }};
}

pub mod composition;
pub mod config;
pub mod fs;
pub mod layer;
pub mod metrics;
pub mod reaper;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::Config;
pub use fs::{AvmError, AvmPath, AvmResult, AvmService};
pub use metrics::AvmMetrics;
pub use reaper::{OrphanReaper, ReapStats};
pub use storage::{AvmRepository, RepositoryBuilder};
pub use sync::{DiffCode, Difference, NameFilter, UpdateOptions};
pub use types::{NodeId, StoreId, VersionId, VersionRef};
