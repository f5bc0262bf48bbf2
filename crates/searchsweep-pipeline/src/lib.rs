//! # SearchSweep Pipeline
//!
//! Post-search decision engine: clusters capture rows by (platform, book,
//! user), keeps clusters whose watched duration clears a fraction of the
//! book's reference duration, fans each one out into follow-up tasks and
//! folds the group into a per-day webhook plan.
//!
//! ## Flow
//! ```text
//! parent task ──closure──▶ capture rows ──ClusterContext──▶ ClusterReport
//!                                                              │ selected
//!                                   ChildTaskGenerator ◀───────┤
//!                                      (EnsureUnique)          │
//!                                                              ▼
//!                                       PlanBook::upsert (TaskIDs union)
//!                                              │
//!                         pending ─▶ success | failed (retry) | error
//! ```
//!
//! Everything is invocation-local. Re-running an invocation is the retry
//! mechanism: creates are existence-checked and plan TaskIDs only ever grow.

pub mod capture;
pub mod children;
pub mod cluster;
pub mod lookup;
pub mod plan;
pub mod runner;
pub mod unique;

pub use capture::CaptureRow;
pub use children::{ChildOutcome, ChildTaskGenerator, build_child_tasks};
pub use cluster::{Cluster, ClusterContext, ClusterReport, ScoredCluster, Verdict};
pub use lookup::TaskDirectory;
pub use plan::{PlanBook, PlanCandidate, Readiness, UpsertOutcome};
pub use runner::{Pipeline, RunSummary};
pub use unique::{CheckThenCreate, EnsureUnique, UniqueBatch, UniqueEntry, UniqueOutcome};
