//! Scheduled sweep keeping stored records consistent with their approvals.
//!
//! Three passes, each independent of upload/download:
//! - purge records whose hiring lost its approval;
//! - re-arm archived records whose approval changed after ASP last heard of
//!   them (capped per run by ASP's quota on corrective messages);
//! - optionally archive records whose approval expired past the grace period.
use chrono::{DateTime, Months, Utc};
use tracing::{info, instrument, warn};

use crate::db::{self, Pool};
use crate::error::{ExchangeError, Result};
use crate::model::PROLONGATION_GRACE_MONTHS;
use crate::records;
use crate::state::record::{self, RecordEvent};
use crate::state::TransitionContext;

#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    pub dry_run: bool,
    pub max_notifications: usize,
    pub max_archive: usize,
    pub archive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged: usize,
    pub rearmed: usize,
    pub archived: usize,
    pub skipped: usize,
}

/// Deletes records that can no longer be corrected: their approval is gone.
#[instrument(skip_all, fields(dry_run = dry_run))]
pub async fn purge_orphans(pool: &Pool, dry_run: bool) -> Result<usize> {
    let ids = db::list_orphan_record_ids(pool).await?;
    for id in &ids {
        if dry_run {
            info!(record_id = id, dry_run = true, "would delete orphan employee record");
            continue;
        }
        db::delete_employee_record(pool, *id).await?;
        warn!(record_id = id, "orphan employee record deleted");
    }
    Ok(ids.len())
}

/// Schedules an update notification for archived records whose approval moved
/// since, and brings them back to the status of their last ASP verdict.
#[instrument(skip_all, fields(dry_run = dry_run, limit = limit))]
pub async fn rearm_stale_archived(
    pool: &Pool,
    limit: usize,
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<usize> {
    let stale = db::list_stale_archived_records(pool, limit as i64).await?;
    let ctx = TransitionContext::at(now);
    let mut done = 0;
    for candidate in stale {
        let current = records::fetch(pool, candidate.record_id).await?;
        let target = current.exchange.last_asp_verdict();
        let applied = match record::apply(&current, RecordEvent::Unarchive(target), &ctx) {
            Ok(applied) => applied,
            Err(err) => {
                warn!(%err, record_id = current.id, "archived employee record left as is");
                continue;
            }
        };
        if dry_run {
            info!(
                record_id = current.id,
                approval = %candidate.approval_number,
                to = applied.to,
                dry_run = true,
                "would unarchive and notify"
            );
            done += 1;
            continue;
        }

        let mut tx = pool.begin().await?;
        let notification_id = db::upsert_new_notification_tx(&mut tx, current.id, now).await?;
        db::save_record_transition_tx(&mut tx, &applied, None).await?;
        tx.commit().await?;
        info!(
            record_id = current.id,
            notification_id,
            approval = %candidate.approval_number,
            to = applied.to,
            "archived employee record re-armed"
        );
        done += 1;
    }
    Ok(done)
}

/// Archives records whose approval ended more than the grace period ago.
///
/// Returns `(archived, skipped)`. Candidates are re-checked by the state
/// machine; a failing guard only skips the record.
#[instrument(skip_all, fields(dry_run = dry_run, limit = limit))]
pub async fn archive_expired(
    pool: &Pool,
    limit: usize,
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<(usize, usize)> {
    let today = now.date_naive();
    let Some(end_before) = today.checked_sub_months(Months::new(PROLONGATION_GRACE_MONTHS)) else {
        return Ok((0, 0));
    };
    let candidates = db::list_archivable_records(pool, end_before, limit as i64).await?;
    let (mut archived, mut skipped) = (0, 0);
    for candidate in candidates {
        if dry_run {
            info!(
                record_id = candidate.record_id,
                approval_end_at = %candidate.approval_end_at,
                dry_run = true,
                "would archive employee record"
            );
            archived += 1;
            continue;
        }
        match records::archive(pool, candidate.record_id, None, now).await {
            Ok(_) => archived += 1,
            Err(
                err @ (ExchangeError::InvalidStatus { .. } | ExchangeError::GuardFailed { .. }),
            ) => {
                warn!(%err, record_id = candidate.record_id, "employee record not archived");
                skipped += 1;
            }
            Err(err) => return Err(err),
        }
    }
    Ok((archived, skipped))
}

/// Runs every pass in order and logs the totals.
pub async fn run(pool: &Pool, options: SweepOptions, now: DateTime<Utc>) -> Result<SweepReport> {
    let mut report = SweepReport {
        purged: purge_orphans(pool, options.dry_run).await?,
        ..Default::default()
    };
    report.rearmed =
        rearm_stale_archived(pool, options.max_notifications, options.dry_run, now).await?;
    if options.archive {
        let (archived, skipped) =
            archive_expired(pool, options.max_archive, options.dry_run, now).await?;
        report.archived = archived;
        report.skipped = skipped;
    }
    info!(
        purged = report.purged,
        rearmed = report.rearmed,
        archived = report.archived,
        skipped = report.skipped,
        dry_run = options.dry_run,
        "sweep finished"
    );
    Ok(report)
}
