//! # SearchSweep Store
//!
//! Production collaborators behind the core traits:
//! - [`BitableRecordStore`]: Task / ContentMeta / WebhookPlan tables in Feishu Bitable.
//! - [`SqliteCaptureStore`]: raw capture rows from the device capture database.

pub mod bitable;
pub mod capture;

pub use bitable::{BitableRecordStore, BitableRef, FeishuClient};
pub use capture::SqliteCaptureStore;

use searchsweep_core::config::SweepConfig;
use searchsweep_core::error::Result;

/// Build both production stores from configuration.
pub async fn connect(config: &SweepConfig) -> Result<(BitableRecordStore, SqliteCaptureStore)> {
    let records = BitableRecordStore::connect(&config.feishu).await?;
    let capture = SqliteCaptureStore::open(&config.capture.expanded_db_path(), &config.capture.table)?;
    Ok((records, capture))
}
