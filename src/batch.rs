//! Grouping of ready records / new notifications into bounded upload batches.
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{ExchangeError, Result};
use crate::filename;
use crate::model::{EmployeeRecord, ExchangeInfo, ItemKind, ItemRef};

/// Hard cap on lines per uploaded file.
pub const MAX_BATCH_SIZE: usize = 700;
/// Advisory cap on rendered bytes per uploaded file.
pub const MAX_BATCH_BYTES: usize = 2 * 1024 * 1024;

/// Everything needed to render one line: the batched item, the record it is
/// about, and the person fragments of the underlying hiring.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDocument {
    pub item: ItemRef,
    pub exchange: ExchangeInfo,
    pub record: EmployeeRecord,
    pub person: Option<Value>,
    pub address: Option<Value>,
    pub situation: Option<Value>,
}

impl RecordDocument {
    pub fn kind(&self) -> ItemKind {
        self.item.kind
    }
}

/// In-memory batch for one transfer cycle. Never persisted.
#[derive(Debug, Clone)]
pub struct EmployeeRecordBatch {
    filename: String,
    items: Vec<RecordDocument>,
}

impl EmployeeRecordBatch {
    /// Builds a batch named after `now`.
    ///
    /// Clears stale processing code/label on every member and numbers them
    /// from 1 in the given order.
    pub fn new(mut items: Vec<RecordDocument>, now: DateTime<Utc>) -> Result<Self> {
        if items.is_empty() || items.len() > MAX_BATCH_SIZE {
            return Err(ExchangeError::BatchSize {
                size: items.len(),
                max: MAX_BATCH_SIZE,
            });
        }
        for (idx, item) in items.iter_mut().enumerate() {
            item.exchange.processing_code = None;
            item.exchange.processing_label = None;
            item.exchange.batch_line_number = Some(idx as i64 + 1);
        }
        Ok(Self {
            filename: filename::upload_filename(now),
            items,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn items(&self) -> &[RecordDocument] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// `(line_number, item)` pairs in file order.
    pub fn lines(&self) -> impl Iterator<Item = (i64, &RecordDocument)> {
        self.items
            .iter()
            .enumerate()
            .map(|(idx, item)| (idx as i64 + 1, item))
    }
}

/// Splits `items` (already ordered oldest first) into chunks of at most
/// `MAX_BATCH_SIZE`, keeping no more than `max_batches` of them.
pub fn chunk_for_upload<T>(items: Vec<T>, max_batches: usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() && chunks.len() < max_batches {
        chunks.push(iter.by_ref().take(MAX_BATCH_SIZE).collect());
    }
    chunks
}
