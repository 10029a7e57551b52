//! Dry rendering of everything waiting for upload, to catch formatting errors
//! before a real transfer writes a file.
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::batch::{chunk_for_upload, EmployeeRecordBatch};
use crate::db::{self, Pool};
use crate::error::Result;
use crate::formatter::{render_batch, DocumentFormatter};
use crate::model::ItemKind;

/// Renders every pending item of `kind` in batch-sized chunks.
///
/// Returns the number of items checked, or the first `Serialization` error
/// naming the offending item. Nothing is written anywhere.
#[instrument(skip_all, fields(kind = ?kind))]
pub async fn check_pending(
    pool: &Pool,
    formatter: &dyn DocumentFormatter,
    kind: ItemKind,
    now: DateTime<Utc>,
) -> Result<usize> {
    let pending = db::list_pending_documents(pool, kind, i64::MAX).await?;
    let total = pending.len();
    for chunk in chunk_for_upload(pending, usize::MAX) {
        let batch = EmployeeRecordBatch::new(chunk, now)?;
        render_batch(formatter, &batch)?;
    }
    info!(items = total, "preflight passed");
    Ok(total)
}
