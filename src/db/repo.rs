use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

use super::model::{ArchivableRecord, HiringContext, NewHiring, StaleArchivedRecord};
use crate::batch::RecordDocument;
use crate::error::{ExchangeError, Result};
use crate::model::{
    Approval, Company, EmployeeRecord, ExchangeInfo, Hiring, ItemKind, NotificationStatus,
    RecordIdentity, RecordStatus, TransitionLog, UpdateNotification,
};
use crate::state::Applied;

pub type Pool = SqlitePool;
type Tx<'a> = Transaction<'a, Sqlite>;

pub async fn init_pool(database_url: &str) -> anyhow::Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass
/// through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping

fn json_column(row: &SqliteRow, name: &str) -> Result<Option<Value>> {
    let raw: Option<String> = row.try_get(name)?;
    Ok(match raw {
        Some(text) => Some(serde_json::from_str(&text)?),
        None => None,
    })
}

fn json_text(value: &Option<Value>) -> Result<Option<String>> {
    Ok(match value {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    })
}

fn exchange_from_row(row: &SqliteRow, prefix: &str) -> Result<ExchangeInfo> {
    Ok(ExchangeInfo {
        processing_code: row.try_get(format!("{prefix}asp_processing_code").as_str())?,
        processing_label: row.try_get(format!("{prefix}asp_processing_label").as_str())?,
        archived_json: json_column(row, &format!("{prefix}archived_json"))?,
        batch_file: row.try_get(format!("{prefix}asp_batch_file").as_str())?,
        batch_line_number: row.try_get(format!("{prefix}asp_batch_line_number").as_str())?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<EmployeeRecord> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = RecordStatus::parse_state(&status).ok_or_else(|| {
        ExchangeError::Validation(format!("employee record {id} has unknown status {status}"))
    })?;
    Ok(EmployeeRecord {
        id,
        hiring_id: row.try_get("hiring_id")?,
        approval_number: row.try_get("approval_number")?,
        siret: row.try_get("siret")?,
        asp_id: row.try_get("asp_id")?,
        asp_measure: row.try_get("asp_measure")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        processed_at: row.try_get("processed_at")?,
        processed_as_duplicate: row.try_get("processed_as_duplicate")?,
        exchange: exchange_from_row(row, "")?,
    })
}

fn notification_from_row(row: &SqliteRow, prefix: &str) -> Result<UpdateNotification> {
    let id: i64 = row.try_get(format!("{prefix}id").as_str())?;
    let status: String = row.try_get(format!("{prefix}status").as_str())?;
    let status = NotificationStatus::parse_state(&status).ok_or_else(|| {
        ExchangeError::Validation(format!("notification {id} has unknown status {status}"))
    })?;
    Ok(UpdateNotification {
        id,
        employee_record_id: row.try_get(format!("{prefix}employee_record_id").as_str())?,
        status,
        created_at: row.try_get(format!("{prefix}created_at").as_str())?,
        updated_at: row.try_get(format!("{prefix}updated_at").as_str())?,
        exchange: exchange_from_row(row, prefix)?,
    })
}

fn approval_from_row(row: &SqliteRow) -> Result<Approval> {
    Ok(Approval {
        id: row.try_get("id")?,
        number: row.try_get("number")?,
        start_at: row.try_get("start_at")?,
        end_at: row.try_get("end_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn company_from_row(row: &SqliteRow) -> Result<Company> {
    Ok(Company {
        id: row.try_get("id")?,
        siret: row.try_get("siret")?,
        kind: row.try_get("kind")?,
        asp_id: row.try_get("asp_id")?,
        parent_id: row.try_get("parent_id")?,
    })
}

fn log_from_row(row: &SqliteRow, subject_column: &str) -> Result<TransitionLog> {
    Ok(TransitionLog {
        id: row.try_get("id")?,
        subject_id: row.try_get(subject_column)?,
        transition: row.try_get("transition")?,
        from_state: row.try_get("from_state")?,
        to_state: row.try_get("to_state")?,
        user_id: row.try_get("user_id")?,
        timestamp: row.try_get("timestamp")?,
        exchange: exchange_from_row(row, "")?,
    })
}

const NOTIFICATION_COLUMNS: &str = "n.id AS n_id, n.employee_record_id AS n_employee_record_id, \
     n.status AS n_status, n.created_at AS n_created_at, n.updated_at AS n_updated_at, \
     n.asp_processing_code AS n_asp_processing_code, \
     n.asp_processing_label AS n_asp_processing_label, \
     n.archived_json AS n_archived_json, n.asp_batch_file AS n_asp_batch_file, \
     n.asp_batch_line_number AS n_asp_batch_line_number";

// ---------------------------------------------------------------------------
// Upstream entities: companies, approvals, hirings

#[instrument(skip_all)]
pub async fn insert_company(
    pool: &Pool,
    siret: &str,
    kind: &str,
    asp_id: Option<i64>,
    parent_id: Option<i64>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO companies (siret, kind, asp_id, parent_id) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(siret)
    .bind(kind)
    .bind(asp_id)
    .bind(parent_id)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn fetch_company(pool: &Pool, id: i64) -> Result<Option<Company>> {
    let row = sqlx::query("SELECT id, siret, kind, asp_id, parent_id FROM companies WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(company_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn insert_approval(
    pool: &Pool,
    number: &str,
    start_at: NaiveDate,
    end_at: NaiveDate,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO approvals (number, start_at, end_at, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(number)
    .bind(start_at)
    .bind(end_at)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn fetch_approval(pool: &Pool, id: i64) -> Result<Option<Approval>> {
    let row = sqlx::query(
        "SELECT id, number, start_at, end_at, created_at, updated_at FROM approvals WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(approval_from_row).transpose()
}

/// Deleting an approval detaches it from its hirings; their records become
/// orphans for the reconciliation sweep.
#[instrument(skip_all)]
pub async fn delete_approval(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM approvals WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_hiring(pool: &Pool, hiring: &NewHiring, now: DateTime<Utc>) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO hirings \
         (approval_id, company_id, person_json, address_json, situation_json, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(hiring.approval_id)
    .bind(hiring.company_id)
    .bind(json_text(&hiring.person)?)
    .bind(json_text(&hiring.address)?)
    .bind(json_text(&hiring.situation)?)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn fetch_hiring(pool: &Pool, id: i64) -> Result<Option<Hiring>> {
    let row = sqlx::query(
        "SELECT id, approval_id, company_id, person_json, address_json, situation_json, created_at \
         FROM hirings WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(Hiring {
        id: row.try_get("id")?,
        approval_id: row.try_get("approval_id")?,
        company_id: row.try_get("company_id")?,
        person: json_column(&row, "person_json")?,
        address: json_column(&row, "address_json")?,
        situation: json_column(&row, "situation_json")?,
        created_at: row.try_get("created_at")?,
    }))
}

/// Hiring with its company, the company's mother (if any) and its approval.
#[instrument(skip_all)]
pub async fn fetch_hiring_context(pool: &Pool, hiring_id: i64) -> Result<HiringContext> {
    let hiring = fetch_hiring(pool, hiring_id)
        .await?
        .ok_or_else(|| ExchangeError::NotFound(format!("hiring {hiring_id}")))?;
    let company = fetch_company(pool, hiring.company_id)
        .await?
        .ok_or_else(|| ExchangeError::NotFound(format!("company {}", hiring.company_id)))?;
    let parent = match company.parent_id {
        Some(parent_id) => fetch_company(pool, parent_id).await?,
        None => None,
    };
    let approval = match hiring.approval_id {
        Some(approval_id) => fetch_approval(pool, approval_id).await?,
        None => None,
    };
    Ok(HiringContext {
        hiring,
        company,
        parent,
        approval,
    })
}

/// Approval attached to a record through its hiring.
pub async fn fetch_record_approval(pool: &Pool, record_id: i64) -> Result<Option<Approval>> {
    let row = sqlx::query(
        "SELECT a.id, a.number, a.start_at, a.end_at, a.created_at, a.updated_at \
         FROM employee_records r \
         JOIN hirings h ON h.id = r.hiring_id \
         JOIN approvals a ON a.id = h.approval_id \
         WHERE r.id = ?",
    )
    .bind(record_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(approval_from_row).transpose()
}

// ---------------------------------------------------------------------------
// Approval changes. Each one bumps `approvals.updated_at` and re-arms a NEW
// notification for the processed records of the approval, in one transaction.

async fn touch_approval_tx(tx: &mut Tx<'_>, approval_id: i64, now: DateTime<Utc>) -> Result<()> {
    let affected = sqlx::query("UPDATE approvals SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(approval_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(ExchangeError::NotFound(format!("approval {approval_id}")));
    }
    Ok(())
}

async fn notify_processed_records_tx(
    tx: &mut Tx<'_>,
    approval_id: i64,
    now: DateTime<Utc>,
) -> Result<u64> {
    let record_ids: Vec<i64> = sqlx::query_scalar(
        "SELECT r.id FROM employee_records r \
         JOIN hirings h ON h.id = r.hiring_id \
         WHERE h.approval_id = ? AND r.status = ?",
    )
    .bind(approval_id)
    .bind(RecordStatus::Processed.as_str())
    .fetch_all(&mut **tx)
    .await?;
    for record_id in &record_ids {
        upsert_new_notification_tx(tx, *record_id, now).await?;
    }
    Ok(record_ids.len() as u64)
}

async fn approval_changed_tx(tx: &mut Tx<'_>, approval_id: i64, now: DateTime<Utc>) -> Result<()> {
    touch_approval_tx(tx, approval_id, now).await?;
    let notified = notify_processed_records_tx(tx, approval_id, now).await?;
    debug!(approval_id, notified, "approval changed");
    Ok(())
}

#[instrument(skip_all)]
pub async fn update_approval_dates(
    pool: &Pool,
    approval_id: i64,
    start_at: NaiveDate,
    end_at: NaiveDate,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE approvals SET start_at = ?, end_at = ? WHERE id = ?")
        .bind(start_at)
        .bind(end_at)
        .bind(approval_id)
        .execute(&mut *tx)
        .await?;
    approval_changed_tx(&mut tx, approval_id, now).await?;
    tx.commit().await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodKind {
    Suspension,
    Prolongation,
}

impl PeriodKind {
    fn table(&self) -> &'static str {
        match self {
            PeriodKind::Suspension => "suspensions",
            PeriodKind::Prolongation => "prolongations",
        }
    }
}

#[instrument(skip_all)]
pub async fn add_period(
    pool: &Pool,
    kind: PeriodKind,
    approval_id: i64,
    start_at: NaiveDate,
    end_at: NaiveDate,
    now: DateTime<Utc>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id: i64 = sqlx::query_scalar(&format!(
        "INSERT INTO {} (approval_id, start_at, end_at, created_at) \
         VALUES (?, ?, ?, ?) RETURNING id",
        kind.table()
    ))
    .bind(approval_id)
    .bind(start_at)
    .bind(end_at)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    approval_changed_tx(&mut tx, approval_id, now).await?;
    tx.commit().await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn delete_period(
    pool: &Pool,
    kind: PeriodKind,
    period_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let approval_id: Option<i64> = sqlx::query_scalar(&format!(
        "DELETE FROM {} WHERE id = ? RETURNING approval_id",
        kind.table()
    ))
    .bind(period_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(approval_id) = approval_id else {
        return Err(ExchangeError::NotFound(format!("{:?} {period_id}", kind)));
    };
    approval_changed_tx(&mut tx, approval_id, now).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn add_suspension(
    pool: &Pool,
    approval_id: i64,
    start_at: NaiveDate,
    end_at: NaiveDate,
    now: DateTime<Utc>,
) -> Result<i64> {
    add_period(pool, PeriodKind::Suspension, approval_id, start_at, end_at, now).await
}

pub async fn add_prolongation(
    pool: &Pool,
    approval_id: i64,
    start_at: NaiveDate,
    end_at: NaiveDate,
    now: DateTime<Utc>,
) -> Result<i64> {
    add_period(pool, PeriodKind::Prolongation, approval_id, start_at, end_at, now).await
}

pub async fn delete_suspension(pool: &Pool, id: i64, now: DateTime<Utc>) -> Result<()> {
    delete_period(pool, PeriodKind::Suspension, id, now).await
}

pub async fn delete_prolongation(pool: &Pool, id: i64, now: DateTime<Utc>) -> Result<()> {
    delete_period(pool, PeriodKind::Prolongation, id, now).await
}

/// Whether the record's approval has a suspension or prolongation that has
/// not ended by `today`, whether it already started or not.
#[instrument(skip_all)]
pub async fn has_pending_period(pool: &Pool, record_id: i64, today: NaiveDate) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM employee_records r \
         JOIN hirings h ON h.id = r.hiring_id \
         WHERE r.id = ?1 AND ( \
             EXISTS (SELECT 1 FROM suspensions s \
                     WHERE s.approval_id = h.approval_id AND s.end_at >= ?2) \
          OR EXISTS (SELECT 1 FROM prolongations p \
                     WHERE p.approval_id = h.approval_id AND p.end_at >= ?2))",
    )
    .bind(record_id)
    .bind(today)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

// ---------------------------------------------------------------------------
// Employee records

#[instrument(skip_all)]
pub async fn insert_employee_record(
    pool: &Pool,
    hiring_id: i64,
    identity: &RecordIdentity,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO employee_records \
         (hiring_id, approval_number, siret, asp_id, asp_measure, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(hiring_id)
    .bind(&identity.approval_number)
    .bind(&identity.siret)
    .bind(identity.asp_id)
    .bind(&identity.asp_measure)
    .bind(RecordStatus::New.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn record_exists_for_identity(pool: &Pool, identity: &RecordIdentity) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM employee_records \
         WHERE asp_measure = ? AND siret = ? AND approval_number = ?",
    )
    .bind(&identity.asp_measure)
    .bind(&identity.siret)
    .bind(&identity.approval_number)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

pub async fn fetch_employee_record(pool: &Pool, id: i64) -> Result<Option<EmployeeRecord>> {
    let row = sqlx::query("SELECT * FROM employee_records WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

pub async fn fetch_record_by_batch_line(
    pool: &Pool,
    batch_file: &str,
    line_number: i64,
) -> Result<Option<EmployeeRecord>> {
    let row = sqlx::query(
        "SELECT * FROM employee_records WHERE asp_batch_file = ? AND asp_batch_line_number = ?",
    )
    .bind(batch_file)
    .bind(line_number)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn delete_employee_record(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM employee_records WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Append-only log table of one kind of subject.
struct LogTable {
    table: &'static str,
    subject_column: &'static str,
}

const RECORD_LOGS: LogTable = LogTable {
    table: "employee_record_transition_logs",
    subject_column: "employee_record_id",
};

const NOTIFICATION_LOGS: LogTable = LogTable {
    table: "employee_record_update_notification_transition_logs",
    subject_column: "notification_id",
};

/// One log row: the transition names plus the exchange data after it.
struct LogEntry<'a> {
    subject_id: i64,
    transition: &'static str,
    from: &'static str,
    to: &'static str,
    exchange: &'a ExchangeInfo,
    user_id: Option<i64>,
    at: DateTime<Utc>,
}

impl<'a> LogEntry<'a> {
    fn of<T>(
        applied: &Applied<T>,
        subject_id: i64,
        exchange: &'a ExchangeInfo,
        user_id: Option<i64>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_id,
            transition: applied.transition,
            from: applied.from,
            to: applied.to,
            exchange,
            user_id,
            at,
        }
    }
}

async fn insert_log_tx(tx: &mut Tx<'_>, logs: &LogTable, entry: LogEntry<'_>) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO {} ({}, transition, from_state, to_state, user_id, timestamp, \
         asp_processing_code, asp_processing_label, archived_json, asp_batch_file, \
         asp_batch_line_number) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        logs.table, logs.subject_column
    ))
    .bind(entry.subject_id)
    .bind(entry.transition)
    .bind(entry.from)
    .bind(entry.to)
    .bind(entry.user_id)
    .bind(entry.at)
    .bind(&entry.exchange.processing_code)
    .bind(&entry.exchange.processing_label)
    .bind(json_text(&entry.exchange.archived_json)?)
    .bind(&entry.exchange.batch_file)
    .bind(entry.exchange.batch_line_number)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Persists a record transition and its audit log row.
///
/// The update only applies if the stored status is still the one the
/// transition started from; otherwise nothing is written.
pub async fn save_record_transition_tx(
    tx: &mut Tx<'_>,
    applied: &Applied<EmployeeRecord>,
    user_id: Option<i64>,
) -> Result<()> {
    let r = &applied.subject;
    let affected = sqlx::query(
        "UPDATE employee_records SET approval_number = ?, siret = ?, asp_id = ?, asp_measure = ?, \
         status = ?, updated_at = ?, processed_at = ?, processed_as_duplicate = ?, \
         asp_processing_code = ?, asp_processing_label = ?, archived_json = ?, \
         asp_batch_file = ?, asp_batch_line_number = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(&r.approval_number)
    .bind(&r.siret)
    .bind(r.asp_id)
    .bind(&r.asp_measure)
    .bind(r.status.as_str())
    .bind(r.updated_at)
    .bind(r.processed_at)
    .bind(r.processed_as_duplicate)
    .bind(&r.exchange.processing_code)
    .bind(&r.exchange.processing_label)
    .bind(json_text(&r.exchange.archived_json)?)
    .bind(&r.exchange.batch_file)
    .bind(r.exchange.batch_line_number)
    .bind(r.id)
    .bind(applied.from)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if affected == 0 {
        return Err(ExchangeError::InvalidStatus {
            transition: applied.transition,
            from: applied.from,
        });
    }
    let entry = LogEntry::of(applied, r.id, &r.exchange, user_id, r.updated_at);
    insert_log_tx(tx, &RECORD_LOGS, entry).await
}

#[instrument(skip_all, fields(record_id = applied.subject.id, transition = applied.transition))]
pub async fn save_record_transition(
    pool: &Pool,
    applied: &Applied<EmployeeRecord>,
    user_id: Option<i64>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    save_record_transition_tx(&mut tx, applied, user_id).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn list_record_logs(pool: &Pool, record_id: i64) -> Result<Vec<TransitionLog>> {
    let rows = sqlx::query(
        "SELECT * FROM employee_record_transition_logs WHERE employee_record_id = ? ORDER BY id",
    )
    .bind(record_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| log_from_row(row, "employee_record_id"))
        .collect()
}

// ---------------------------------------------------------------------------
// Update notifications

/// Creates the NEW notification of a record, or refreshes the existing one.
pub async fn upsert_new_notification_tx(
    tx: &mut Tx<'_>,
    record_id: i64,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO employee_record_update_notifications \
         (employee_record_id, status, created_at, updated_at) VALUES (?, 'NEW', ?, ?) \
         ON CONFLICT (employee_record_id) WHERE status = 'NEW' \
         DO UPDATE SET updated_at = excluded.updated_at \
         RETURNING id",
    )
    .bind(record_id)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

#[instrument(skip_all, fields(record_id = record_id))]
pub async fn upsert_new_notification(
    pool: &Pool,
    record_id: i64,
    now: DateTime<Utc>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = upsert_new_notification_tx(&mut tx, record_id, now).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn fetch_notification(pool: &Pool, id: i64) -> Result<Option<UpdateNotification>> {
    let row = sqlx::query(&format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM employee_record_update_notifications n WHERE n.id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref()
        .map(|row| notification_from_row(row, "n_"))
        .transpose()
}

pub async fn fetch_notification_by_batch_line(
    pool: &Pool,
    batch_file: &str,
    line_number: i64,
) -> Result<Option<UpdateNotification>> {
    let row = sqlx::query(&format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM employee_record_update_notifications n \
         WHERE n.asp_batch_file = ? AND n.asp_batch_line_number = ?"
    ))
    .bind(batch_file)
    .bind(line_number)
    .fetch_optional(pool)
    .await?;
    row.as_ref()
        .map(|row| notification_from_row(row, "n_"))
        .transpose()
}

pub async fn list_notifications_for_record(
    pool: &Pool,
    record_id: i64,
) -> Result<Vec<UpdateNotification>> {
    let rows = sqlx::query(&format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM employee_record_update_notifications n \
         WHERE n.employee_record_id = ? ORDER BY n.id"
    ))
    .bind(record_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| notification_from_row(row, "n_"))
        .collect()
}

pub async fn save_notification_transition(
    pool: &Pool,
    applied: &Applied<UpdateNotification>,
    user_id: Option<i64>,
) -> Result<()> {
    let n = &applied.subject;
    let mut tx = pool.begin().await?;
    let affected = sqlx::query(
        "UPDATE employee_record_update_notifications SET status = ?, updated_at = ?, \
         asp_processing_code = ?, asp_processing_label = ?, archived_json = ?, \
         asp_batch_file = ?, asp_batch_line_number = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(n.status.as_str())
    .bind(n.updated_at)
    .bind(&n.exchange.processing_code)
    .bind(&n.exchange.processing_label)
    .bind(json_text(&n.exchange.archived_json)?)
    .bind(&n.exchange.batch_file)
    .bind(n.exchange.batch_line_number)
    .bind(n.id)
    .bind(applied.from)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if affected == 0 {
        return Err(ExchangeError::InvalidStatus {
            transition: applied.transition,
            from: applied.from,
        });
    }
    let entry = LogEntry::of(applied, n.id, &n.exchange, user_id, n.updated_at);
    insert_log_tx(&mut tx, &NOTIFICATION_LOGS, entry).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn list_notification_logs(
    pool: &Pool,
    notification_id: i64,
) -> Result<Vec<TransitionLog>> {
    let rows = sqlx::query(
        "SELECT * FROM employee_record_update_notification_transition_logs \
         WHERE notification_id = ? ORDER BY id",
    )
    .bind(notification_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| log_from_row(row, "notification_id"))
        .collect()
}

// ---------------------------------------------------------------------------
// Batch documents

fn document_from_record_row(row: &SqliteRow, kind: ItemKind) -> Result<RecordDocument> {
    let record = record_from_row(row)?;
    let (item, exchange) = match kind {
        ItemKind::Record => (record.item_ref(), record.exchange.clone()),
        ItemKind::Notification => {
            let notification = notification_from_row(row, "n_")?;
            (notification.item_ref(), notification.exchange)
        }
    };
    Ok(RecordDocument {
        item,
        exchange,
        record,
        person: json_column(row, "person_json")?,
        address: json_column(row, "address_json")?,
        situation: json_column(row, "situation_json")?,
    })
}

/// Documents waiting for upload: READY records or NEW notifications, oldest
/// first, at most `limit`.
#[instrument(skip_all)]
pub async fn list_pending_documents(
    pool: &Pool,
    kind: ItemKind,
    limit: i64,
) -> Result<Vec<RecordDocument>> {
    let rows = match kind {
        ItemKind::Record => {
            sqlx::query(
                "SELECT r.*, h.person_json, h.address_json, h.situation_json \
                 FROM employee_records r JOIN hirings h ON h.id = r.hiring_id \
                 WHERE r.status = ? \
                 ORDER BY r.updated_at ASC, r.created_at ASC, r.id ASC LIMIT ?",
            )
            .bind(RecordStatus::Ready.as_str())
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        ItemKind::Notification => {
            sqlx::query(&format!(
                "SELECT r.*, {NOTIFICATION_COLUMNS}, \
                 h.person_json, h.address_json, h.situation_json \
                 FROM employee_record_update_notifications n \
                 JOIN employee_records r ON r.id = n.employee_record_id \
                 JOIN hirings h ON h.id = r.hiring_id \
                 WHERE n.status = ? \
                 ORDER BY n.created_at ASC, n.id ASC LIMIT ?"
            ))
            .bind(NotificationStatus::New.as_str())
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    rows.iter()
        .map(|row| document_from_record_row(row, kind))
        .collect()
}

// ---------------------------------------------------------------------------
// Reconciliation read models

/// Records whose hiring lost its approval.
#[instrument(skip_all)]
pub async fn list_orphan_record_ids(pool: &Pool) -> Result<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT r.id FROM employee_records r \
         JOIN hirings h ON h.id = r.hiring_id \
         WHERE h.approval_id IS NULL ORDER BY r.id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Archived records whose approval changed after the last thing ASP heard of
/// them: the later of the record's `updated_at` and its latest notification.
#[instrument(skip_all)]
pub async fn list_stale_archived_records(
    pool: &Pool,
    limit: i64,
) -> Result<Vec<StaleArchivedRecord>> {
    let rows = sqlx::query(
        "SELECT r.id AS record_id, a.number AS approval_number \
         FROM employee_records r \
         JOIN hirings h ON h.id = r.hiring_id \
         JOIN approvals a ON a.id = h.approval_id \
         WHERE r.status = ? \
           AND julianday(a.updated_at) > MAX( \
                 julianday(r.updated_at), \
                 COALESCE((SELECT MAX(julianday(n.created_at)) \
                           FROM employee_record_update_notifications n \
                           WHERE n.employee_record_id = r.id), 0)) \
         ORDER BY julianday(a.updated_at) ASC, r.id ASC LIMIT ?",
    )
    .bind(RecordStatus::Archived.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(StaleArchivedRecord {
                record_id: row.try_get("record_id")?,
                approval_number: row.try_get("approval_number")?,
            })
        })
        .collect()
}

/// Archivable candidates: approval ended before `end_before`.
#[instrument(skip_all)]
pub async fn list_archivable_records(
    pool: &Pool,
    end_before: NaiveDate,
    limit: i64,
) -> Result<Vec<ArchivableRecord>> {
    let rows = sqlx::query(
        "SELECT r.id AS record_id, a.end_at AS approval_end_at \
         FROM employee_records r \
         JOIN hirings h ON h.id = r.hiring_id \
         JOIN approvals a ON a.id = h.approval_id \
         WHERE r.status IN ('NEW', 'READY', 'REJECTED', 'PROCESSED', 'DISABLED') \
           AND a.end_at < ? \
         ORDER BY a.end_at ASC, r.id ASC LIMIT ?",
    )
    .bind(end_before)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(ArchivableRecord {
                record_id: row.try_get("record_id")?,
                approval_end_at: row.try_get("approval_end_at")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        // A single connection: every new one would open an empty database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn processed_record(pool: &Pool) -> (i64, i64) {
        let now = Utc::now();
        let company = insert_company(pool, "12345678900012", "ACI", Some(10), None)
            .await
            .unwrap();
        let (start, end) = (date(2021, 1, 1), date(2023, 1, 1));
        let approval = insert_approval(pool, "999990000001", start, end, now)
            .await
            .unwrap();
        let hiring = insert_hiring(
            pool,
            &NewHiring {
                approval_id: Some(approval),
                company_id: company,
                person: Some(json!({"nom": "DOE"})),
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap();
        let identity = RecordIdentity {
            approval_number: "999990000001".into(),
            siret: "12345678900012".into(),
            asp_id: Some(10),
            asp_measure: "ACI_DC".into(),
        };
        let record = insert_employee_record(pool, hiring, &identity, now).await.unwrap();
        sqlx::query("UPDATE employee_records SET status = 'PROCESSED' WHERE id = ?")
            .bind(record)
            .execute(pool)
            .await
            .unwrap();
        (record, approval)
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/sub/exchange.db", td.path().display());
        let prepared = prepare_sqlite_url(&url);
        assert!(prepared.ends_with("exchange.db?mode=rwc"));
        assert!(td.path().join("sub").exists());
    }

    #[tokio::test]
    async fn record_round_trips_through_storage() {
        let pool = setup_pool().await;
        let (record_id, _) = processed_record(&pool).await;
        let record = fetch_employee_record(&pool, record_id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Processed);
        assert_eq!(record.asp_id, Some(10));
        assert!(!record.processed_as_duplicate);
        assert_eq!(record.exchange, ExchangeInfo::default());
    }

    #[tokio::test]
    async fn one_new_notification_per_record() {
        let pool = setup_pool().await;
        let (record_id, _) = processed_record(&pool).await;
        let first = upsert_new_notification(&pool, record_id, Utc::now()).await.unwrap();
        let second = upsert_new_notification(&pool, record_id, Utc::now()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(list_notifications_for_record(&pool, record_id).await.unwrap().len(), 1);

        // Once the first one left NEW, a new one can be armed.
        sqlx::query("UPDATE employee_record_update_notifications SET status = 'SENT' WHERE id = ?")
            .bind(first)
            .execute(&pool)
            .await
            .unwrap();
        let third = upsert_new_notification(&pool, record_id, Utc::now()).await.unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn suspension_rearms_notification_for_processed_records() {
        let pool = setup_pool().await;
        let (record_id, approval_id) = processed_record(&pool).await;
        let before = fetch_approval(&pool, approval_id).await.unwrap().unwrap();

        add_suspension(&pool, approval_id, date(2022, 1, 1), date(2022, 3, 1), Utc::now())
            .await
            .unwrap();
        add_prolongation(&pool, approval_id, date(2023, 1, 2), date(2023, 6, 1), Utc::now())
            .await
            .unwrap();

        let notifications = list_notifications_for_record(&pool, record_id).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].status, NotificationStatus::New);
        let after = fetch_approval(&pool, approval_id).await.unwrap().unwrap();
        assert!(after.updated_at > before.updated_at);

        assert!(has_pending_period(&pool, record_id, date(2021, 12, 1)).await.unwrap());
        assert!(has_pending_period(&pool, record_id, date(2022, 2, 1)).await.unwrap());
        // Only the prolongation is left, and it has not started yet.
        assert!(has_pending_period(&pool, record_id, date(2022, 6, 1)).await.unwrap());
        assert!(has_pending_period(&pool, record_id, date(2023, 6, 1)).await.unwrap());
        assert!(!has_pending_period(&pool, record_id, date(2023, 6, 2)).await.unwrap());
    }

    #[tokio::test]
    async fn transition_logs_are_append_only() {
        let pool = setup_pool().await;
        let (record_id, _) = processed_record(&pool).await;
        let record = fetch_employee_record(&pool, record_id).await.unwrap().unwrap();
        let ctx = crate::state::TransitionContext::at(Utc::now());
        let applied =
            crate::state::record::apply(&record, crate::state::RecordEvent::Disable, &ctx).unwrap();
        save_record_transition(&pool, &applied, Some(7)).await.unwrap();

        let logs = list_record_logs(&pool, record_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].transition, "disable");
        assert_eq!(logs[0].from_state, "PROCESSED");
        assert_eq!(logs[0].to_state, "DISABLED");
        assert_eq!(logs[0].user_id, Some(7));

        let res = sqlx::query("UPDATE employee_record_transition_logs SET transition = 'x'")
            .execute(&pool)
            .await;
        assert!(res.is_err());

        // Replaying the same transition finds the status changed and writes nothing.
        assert!(matches!(
            save_record_transition(&pool, &applied, None).await,
            Err(ExchangeError::InvalidStatus { .. })
        ));
        assert_eq!(list_record_logs(&pool, record_id).await.unwrap().len(), 1);
    }
}
