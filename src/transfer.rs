//! Upload of pending batches to ASP and download of their feedback.
use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::batch::{chunk_for_upload, EmployeeRecordBatch, MAX_BATCH_SIZE};
use crate::db::{self, Pool};
use crate::error::{ExchangeError, Result as ExchangeResult};
use crate::feedback::{parse_feedback, FeedbackProcessor};
use crate::filename::{self, batch_filename_from_feedback};
use crate::formatter::{render_batch, DocumentFormatter, RenderedLine};
use crate::model::ItemKind;
use crate::records;
use crate::state::notification::{self, NotificationEvent};
use crate::state::record::{self, RecordEvent};
use crate::state::TransitionContext;
use crate::transport::{RemoteDir, Transport};

#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    pub kind: ItemKind,
    pub dry_run: bool,
    /// Upper bound on files produced by one upload pass.
    pub max_batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: Vec<String>,
    pub items_sent: usize,
    pub failed_batches: usize,
    pub failed_items: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub files: usize,
    pub completed: Vec<String>,
    pub kept: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct TransferClient<'a> {
    pool: &'a Pool,
    transport: &'a dyn Transport,
    formatter: &'a dyn DocumentFormatter,
    options: TransferOptions,
}

impl<'a> TransferClient<'a> {
    pub fn new(
        pool: &'a Pool,
        transport: &'a dyn Transport,
        formatter: &'a dyn DocumentFormatter,
        options: TransferOptions,
    ) -> Self {
        Self {
            pool,
            transport,
            formatter,
            options,
        }
    }

    /// Uploads pending items in batches.
    ///
    /// A batch that fails to render is skipped and its items left as they are.
    /// A failed write aborts the pass. Items of a written batch move to SENT one
    /// by one.
    #[instrument(skip_all, fields(kind = ?self.options.kind, dry_run = self.options.dry_run))]
    pub async fn upload(&self) -> Result<UploadReport> {
        let kind = self.options.kind;
        let limit = (self.options.max_batches * MAX_BATCH_SIZE) as i64;
        let pending = db::list_pending_documents(self.pool, kind, limit)
            .await
            .context("listing pending items")?;
        let mut report = UploadReport::default();
        if pending.is_empty() {
            info!("nothing to upload");
            return Ok(report);
        }

        let mut previous: Option<String> = None;
        for chunk in chunk_for_upload(pending, self.options.max_batches) {
            let now = next_distinct_second(previous.as_deref()).await;
            let batch = EmployeeRecordBatch::new(chunk, now)?;
            previous = Some(batch.filename().to_string());

            let rendered = match render_batch(self.formatter, &batch) {
                Ok(rendered) => rendered,
                Err(err) => {
                    error!(
                        %err,
                        filename = batch.filename(),
                        size = batch.len(),
                        "batch serialization failed; items left untouched"
                    );
                    report.failed_batches += 1;
                    continue;
                }
            };

            if self.options.dry_run {
                info!(
                    filename = %rendered.filename,
                    lines = rendered.lines.len(),
                    bytes = rendered.bytes.len(),
                    dry_run = true,
                    "would upload batch"
                );
                continue;
            }

            self.transport
                .upload(&rendered.filename, &rendered.bytes)
                .await
                .with_context(|| format!("uploading {}", rendered.filename))?;
            info!(filename = %rendered.filename, lines = rendered.lines.len(), "batch uploaded");

            for line in &rendered.lines {
                match self.mark_sent(&rendered.filename, line, now).await {
                    Ok(()) => report.items_sent += 1,
                    Err(err) => {
                        error!(
                            %err,
                            item = %line.item,
                            filename = %rendered.filename,
                            line = line.line_number,
                            "could not mark item as sent"
                        );
                        report.failed_items += 1;
                    }
                }
            }
            report.uploaded.push(rendered.filename);
        }
        Ok(report)
    }

    async fn mark_sent(
        &self,
        batch_file: &str,
        line: &RenderedLine,
        now: DateTime<Utc>,
    ) -> ExchangeResult<()> {
        let ctx = TransitionContext::at(now);
        match line.item.kind {
            ItemKind::Record => {
                let current = records::fetch(self.pool, line.item.id).await?;
                let applied = record::apply(
                    &current,
                    RecordEvent::WaitForAspResponse {
                        batch_file: batch_file.to_string(),
                        line_number: line.line_number,
                        archive: line.archive.clone(),
                    },
                    &ctx,
                )?;
                db::save_record_transition(self.pool, &applied, None).await
            }
            ItemKind::Notification => {
                let current = db::fetch_notification(self.pool, line.item.id)
                    .await?
                    .ok_or_else(|| ExchangeError::NotFound(line.item.to_string()))?;
                let applied = notification::apply(
                    &current,
                    NotificationEvent::WaitForAspResponse {
                        batch_file: batch_file.to_string(),
                        line_number: line.line_number,
                        archive: line.archive.clone(),
                    },
                    &ctx,
                )?;
                db::save_notification_transition(self.pool, &applied, None).await
            }
        }
    }

    /// Processes every feedback file found in the withdrawal directory.
    ///
    /// Listing failures abort. A file that cannot be fetched or parsed is
    /// skipped; a file with line errors is kept for the next run; a fully
    /// processed file is deleted.
    #[instrument(skip_all, fields(kind = ?self.options.kind, dry_run = self.options.dry_run))]
    pub async fn download(&self) -> Result<DownloadReport> {
        let names = self
            .transport
            .list(RemoteDir::Withdrawal)
            .await
            .context("listing feedback files")?;
        let mut report = DownloadReport {
            files: names.len(),
            ..Default::default()
        };
        let processor = FeedbackProcessor::new(self.pool, self.options.kind, self.options.dry_run);

        for name in names {
            let batch_file = match batch_filename_from_feedback(&name) {
                Ok(batch_file) => batch_file,
                Err(err) => {
                    warn!(%err, filename = %name, "ignoring file with unexpected name");
                    report.skipped.push(name);
                    continue;
                }
            };
            let bytes = match self.transport.download(RemoteDir::Withdrawal, &name).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!(%err, filename = %name, "could not fetch feedback file");
                    report.skipped.push(name);
                    continue;
                }
            };
            let lines = match parse_feedback(&bytes, self.options.kind) {
                Ok(lines) => lines,
                Err(err) => {
                    error!(%err, filename = %name, "could not parse feedback file");
                    report.skipped.push(name);
                    continue;
                }
            };

            let result = processor
                .process(&batch_file, &lines, Utc::now())
                .await
                .with_context(|| format!("processing {name}"))?;
            if result.errors > 0 {
                warn!(filename = %name, errors = result.errors, "feedback file kept for next run");
                report.kept.push(name);
                continue;
            }

            if self.options.dry_run {
                info!(filename = %name, dry_run = true, "would delete feedback file");
            } else if let Err(err) = self.transport.delete(RemoteDir::Withdrawal, &name).await {
                error!(%err, filename = %name, "could not delete feedback file");
                report.kept.push(name);
                continue;
            } else {
                info!(filename = %name, "feedback file processed and deleted");
            }
            report.completed.push(name);
        }
        Ok(report)
    }
}

/// Current time, waiting for the next second if `previous` was already named
/// after this one. Upload filenames only have second resolution.
async fn next_distinct_second(previous: Option<&str>) -> DateTime<Utc> {
    loop {
        let now = Utc::now();
        match previous {
            Some(prev) if prev == filename::upload_filename(now) => {
                let to_next = 1_000_000_000u32.saturating_sub(now.nanosecond() % 1_000_000_000);
                tokio::time::sleep(Duration::from_nanos(u64::from(to_next) + 1_000_000)).await;
            }
            _ => return now,
        }
    }
}
