//! # SearchSweep Core
//!
//! Shared vocabulary for the post-search pipeline: configuration, errors,
//! domain records, the record-store filter model and the collaborator traits
//! every backend implements.
//!
//! ## Architecture
//! ```text
//! RecordStore (trait)              CaptureStore (trait)
//!   ├── Feishu Bitable (store)       ├── SQLite capture db (store)
//!   ├── MemoryRecordStore            └── MemoryCaptureStore
//!   └── DryRunStore (reads pass, writes swallowed)
//!
//! Task / ContentMeta / WebhookPlan  ←  Fields (raw column → cell map)
//!                                       └── normalize_value + ordered aliases
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod memory;
pub mod store;
pub mod types;
pub mod value;

pub use config::SweepConfig;
pub use error::{Result, SweepError};
pub use filter::{Condition, Filter, FilterValue};
pub use memory::{MemoryCaptureStore, MemoryRecordStore};
pub use store::{CaptureStore, DryRunStore, RecordStore};
pub use types::{
    ContentMeta, Day, Fields, NewTask, PlanStatus, Record, Table, Task, TaskStatus, WebhookPlan,
};

/// Maximum rows per batch create/update call.
pub const MAX_BATCH_SIZE: usize = 500;

/// Page size used when the caller passes 0.
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// Largest page the record store accepts.
pub const MAX_PAGE_SIZE: usize = 500;

/// Values per OR-group in a single id lookup query.
pub const MAX_FILTER_VALUES: usize = 50;
