//! Reconciliation of ASP feedback files with stored records and notifications.
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info, instrument, warn};

use crate::db;
use crate::error::{ExchangeError, Result};
use crate::model::{ItemKind, NotificationStatus, RecordStatus, DUPLICATE_CODE, SUCCESS_CODE};
use crate::state::notification::{self, NotificationEvent};
use crate::state::record::{self, RecordEvent};
use crate::state::TransitionContext;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackDocument {
    lignes_telechargement: Vec<Value>,
}

/// The fields of a feedback line the processor acts on.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackLine {
    pub num_ligne: Option<i64>,
    pub type_mouvement: Option<String>,
    pub code_traitement: Option<String>,
    pub libelle_traitement: Option<String>,
}

/// Parses a feedback file and checks that every line is of `expected` kind.
///
/// Any failure here concerns the whole file.
pub fn parse_feedback(bytes: &[u8], expected: ItemKind) -> Result<Vec<Value>> {
    let doc: FeedbackDocument = serde_json::from_slice(bytes)
        .map_err(|err| ExchangeError::MalformedFeedback(err.to_string()))?;
    let wanted = expected.movement_type();
    for line in &doc.lignes_telechargement {
        let found = line
            .get("typeMouvement")
            .and_then(Value::as_str)
            .unwrap_or("");
        if found != wanted {
            return Err(ExchangeError::FeedbackKind {
                expected: wanted.to_string(),
                found: found.to_string(),
            });
        }
    }
    Ok(doc.lignes_telechargement)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackReport {
    pub lines: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Lines whose target already had the reported outcome.
    pub unchanged: usize,
    /// Lines matching nothing stored (handled or deleted elsewhere).
    pub unmatched: usize,
    pub notifications_armed: usize,
    pub errors: usize,
}

/// What a line asks for, once its code is interpreted.
enum Verdict {
    Processed,
    Duplicate,
    Rejected,
}

fn verdict(code: &str, kind: ItemKind) -> Verdict {
    match (code, kind) {
        (SUCCESS_CODE, _) => Verdict::Processed,
        (DUPLICATE_CODE, ItemKind::Record) => Verdict::Duplicate,
        _ => Verdict::Rejected,
    }
}

enum LineOutcome {
    Transitioned(Verdict, bool),
    Unchanged,
    Unmatched,
}

pub struct FeedbackProcessor<'a> {
    pool: &'a SqlitePool,
    kind: ItemKind,
    dry_run: bool,
}

impl<'a> FeedbackProcessor<'a> {
    pub fn new(pool: &'a SqlitePool, kind: ItemKind, dry_run: bool) -> Self {
        Self {
            pool,
            kind,
            dry_run,
        }
    }

    /// Applies every line of a parsed feedback file for `batch_file`.
    ///
    /// Line-level problems are counted in the report; only storage errors
    /// abort.
    #[instrument(
        skip_all,
        fields(batch_file = %batch_file, kind = ?self.kind, dry_run = self.dry_run)
    )]
    pub async fn process(
        &self,
        batch_file: &str,
        lines: &[Value],
        now: DateTime<Utc>,
    ) -> Result<FeedbackReport> {
        let mut report = FeedbackReport {
            lines: lines.len(),
            ..Default::default()
        };

        for raw in lines {
            let line = match FeedbackLine::deserialize(raw) {
                Ok(line) => line,
                Err(err) => {
                    warn!(%err, batch_file, "unreadable feedback line");
                    report.errors += 1;
                    continue;
                }
            };
            let (Some(line_number), Some(code)) = (line.num_ligne, line.code_traitement.clone())
            else {
                warn!(batch_file, ?line.num_ligne, "feedback line without line number or code");
                report.errors += 1;
                continue;
            };
            let label = line.libelle_traitement.clone().unwrap_or_default();

            let outcome = match self.kind {
                ItemKind::Record => {
                    self.apply_to_record(batch_file, line_number, &code, label, raw, now)
                        .await
                }
                ItemKind::Notification => {
                    self.apply_to_notification(batch_file, line_number, &code, label, raw, now)
                        .await
                }
            };

            match outcome {
                Ok(LineOutcome::Transitioned(v, armed)) => {
                    match v {
                        Verdict::Processed => report.processed += 1,
                        Verdict::Duplicate => report.duplicates += 1,
                        Verdict::Rejected => report.rejected += 1,
                    }
                    if armed {
                        report.notifications_armed += 1;
                    }
                }
                Ok(LineOutcome::Unchanged) => report.unchanged += 1,
                Ok(LineOutcome::Unmatched) => {
                    debug!(batch_file, line_number, "no object for feedback line");
                    report.unmatched += 1;
                }
                Err(err @ ExchangeError::InvalidStatus { .. })
                | Err(err @ ExchangeError::GuardFailed { .. }) => {
                    warn!(
                        %err,
                        batch_file,
                        line_number,
                        code = %code,
                        "feedback line not applicable"
                    );
                    report.errors += 1;
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            batch_file,
            lines = report.lines,
            processed = report.processed,
            duplicates = report.duplicates,
            rejected = report.rejected,
            unchanged = report.unchanged,
            unmatched = report.unmatched,
            errors = report.errors,
            "feedback file processed"
        );
        Ok(report)
    }

    async fn apply_to_record(
        &self,
        batch_file: &str,
        line_number: i64,
        code: &str,
        label: String,
        raw: &Value,
        now: DateTime<Utc>,
    ) -> Result<LineOutcome> {
        let found = db::fetch_record_by_batch_line(self.pool, batch_file, line_number).await?;
        let Some(current) = found else {
            return Ok(LineOutcome::Unmatched);
        };

        let v = verdict(code, ItemKind::Record);
        let processed = current.status == RecordStatus::Processed;
        let event = match v {
            Verdict::Processed | Verdict::Duplicate if processed => {
                return Ok(LineOutcome::Unchanged)
            }
            Verdict::Rejected if current.status == RecordStatus::Rejected => {
                return Ok(LineOutcome::Unchanged)
            }
            Verdict::Processed | Verdict::Duplicate => RecordEvent::Process {
                code: code.to_string(),
                label,
                archive: raw.clone(),
                as_duplicate: matches!(v, Verdict::Duplicate),
            },
            Verdict::Rejected => RecordEvent::Reject {
                code: code.to_string(),
                label,
                archive: raw.clone(),
            },
        };

        let ctx = TransitionContext::at(now);
        let applied = record::apply(&current, event, &ctx)?;

        // ASP already holds this record, maybe with older dates: schedule an
        // update if a suspension or prolongation may not have reached it.
        let arm = matches!(v, Verdict::Duplicate)
            && db::has_pending_period(self.pool, current.id, ctx.today()).await?;

        if self.dry_run {
            info!(
                record_id = current.id,
                transition = applied.transition,
                to = applied.to,
                arm_notification = arm,
                dry_run = true,
                "would apply feedback"
            );
            return Ok(LineOutcome::Transitioned(v, arm));
        }

        let mut tx = self.pool.begin().await?;
        db::save_record_transition_tx(&mut tx, &applied, None).await?;
        if arm {
            db::upsert_new_notification_tx(&mut tx, current.id, now).await?;
        }
        tx.commit().await?;
        info!(
            record_id = current.id,
            line_number,
            code,
            transition = applied.transition,
            notification_armed = arm,
            "feedback applied to employee record"
        );
        Ok(LineOutcome::Transitioned(v, arm))
    }

    async fn apply_to_notification(
        &self,
        batch_file: &str,
        line_number: i64,
        code: &str,
        label: String,
        raw: &Value,
        now: DateTime<Utc>,
    ) -> Result<LineOutcome> {
        let Some(current) =
            db::fetch_notification_by_batch_line(self.pool, batch_file, line_number).await?
        else {
            return Ok(LineOutcome::Unmatched);
        };

        let v = verdict(code, ItemKind::Notification);
        let event = match v {
            Verdict::Processed if current.status == NotificationStatus::Processed => {
                return Ok(LineOutcome::Unchanged)
            }
            Verdict::Rejected if current.status == NotificationStatus::Rejected => {
                return Ok(LineOutcome::Unchanged)
            }
            Verdict::Rejected => NotificationEvent::Reject {
                code: code.to_string(),
                label,
                archive: raw.clone(),
            },
            Verdict::Processed | Verdict::Duplicate => NotificationEvent::Process {
                code: code.to_string(),
                label,
                archive: raw.clone(),
            },
        };

        let applied = notification::apply(&current, event, &TransitionContext::at(now))?;
        if self.dry_run {
            info!(
                notification_id = current.id,
                transition = applied.transition,
                to = applied.to,
                dry_run = true,
                "would apply feedback"
            );
        } else {
            db::save_notification_transition(self.pool, &applied, None).await?;
            info!(
                notification_id = current.id,
                line_number,
                code,
                transition = applied.transition,
                "feedback applied to update notification"
            );
        }
        Ok(LineOutcome::Transitioned(v, false))
    }
}
