//! Employee record operations: creation from a hiring, lifecycle transitions
//! with their audit trail, and administrative cloning.
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::db::{self, HiringContext, Pool};
use crate::error::{ExchangeError, Result};
use crate::formatter::is_valid_siret;
use crate::model::{asp_measure_for_kind, Company, EmployeeRecord, RecordIdentity};
use crate::state::record::{self, RecordEvent, RecordTransition};
use crate::state::TransitionContext;

fn mother_company(ctx: &HiringContext) -> &Company {
    ctx.parent.as_ref().unwrap_or(&ctx.company)
}

/// Identity a record of this hiring must carry right now.
///
/// Branches submit under their mother company's SIRET and ASP id; the measure
/// follows the hiring company's own kind.
pub fn identity_from_context(ctx: &HiringContext) -> Result<RecordIdentity> {
    let approval = ctx.approval.as_ref().ok_or_else(|| {
        ExchangeError::Validation(format!("hiring {} has no approval", ctx.hiring.id))
    })?;
    identity_for_company(ctx, &ctx.company, mother_company(ctx), &approval.number)
}

fn identity_for_company(
    ctx: &HiringContext,
    company: &Company,
    mother: &Company,
    approval_number: &str,
) -> Result<RecordIdentity> {
    let measure = asp_measure_for_kind(&company.kind).ok_or_else(|| {
        ExchangeError::Validation(format!(
            "company {} of kind {} is not eligible to employee records",
            company.id, company.kind
        ))
    })?;
    if mother.asp_id.is_none() {
        return Err(ExchangeError::Validation(format!(
            "company {} has no ASP id",
            mother.id
        )));
    }
    if !is_valid_siret(&mother.siret) {
        return Err(ExchangeError::Validation(format!(
            "company {} has a malformed SIRET",
            mother.id
        )));
    }
    if ctx.hiring.person.is_none() {
        return Err(ExchangeError::Validation(format!(
            "hiring {} has no person data",
            ctx.hiring.id
        )));
    }
    Ok(RecordIdentity {
        approval_number: approval_number.to_string(),
        siret: mother.siret.clone(),
        asp_id: mother.asp_id,
        asp_measure: measure.to_string(),
    })
}

/// Creates the NEW record of an accepted hiring.
#[instrument(skip_all, fields(hiring_id = hiring_id))]
pub async fn create_from_hiring(
    pool: &Pool,
    hiring_id: i64,
    now: DateTime<Utc>,
) -> Result<EmployeeRecord> {
    let ctx = db::fetch_hiring_context(pool, hiring_id).await?;
    let identity = identity_from_context(&ctx)?;
    if db::record_exists_for_identity(pool, &identity).await? {
        return Err(ExchangeError::Validation(format!(
            "an employee record already exists for approval {}",
            identity.approval_number
        )));
    }
    let id = db::insert_employee_record(pool, hiring_id, &identity, now).await?;
    info!(record_id = id, hiring_id, "employee record created");
    fetch(pool, id).await
}

pub async fn fetch(pool: &Pool, id: i64) -> Result<EmployeeRecord> {
    db::fetch_employee_record(pool, id)
        .await?
        .ok_or_else(|| ExchangeError::NotFound(format!("employee record {id}")))
}

/// Applies `event` to the stored record and persists it with its log row.
#[instrument(skip_all, fields(record_id = id))]
pub async fn transition(
    pool: &Pool,
    id: i64,
    event: RecordEvent,
    actor: Option<i64>,
    now: DateTime<Utc>,
) -> Result<EmployeeRecord> {
    let current = fetch(pool, id).await?;
    let approval = match event {
        RecordEvent::Archive => db::fetch_record_approval(pool, id).await?,
        _ => None,
    };
    let ctx = TransitionContext::at(now).with_approval(approval.as_ref());
    let applied = record::apply(&current, event, &ctx)?;
    db::save_record_transition(pool, &applied, actor).await?;
    info!(
        record_id = id,
        transition = applied.transition,
        from = applied.from,
        to = applied.to,
        "employee record transition"
    );
    Ok(applied.subject)
}

async fn fresh_identity(pool: &Pool, record: &EmployeeRecord) -> Result<RecordIdentity> {
    let ctx = db::fetch_hiring_context(pool, record.hiring_id).await?;
    identity_from_context(&ctx)
}

/// Validates the hiring and moves the record to READY with a refreshed identity.
pub async fn ready(
    pool: &Pool,
    id: i64,
    actor: Option<i64>,
    now: DateTime<Utc>,
) -> Result<EmployeeRecord> {
    let current = fetch(pool, id).await?;
    // Check the status before the hiring so a wrong state reports as such.
    record::target(current.status, RecordTransition::Ready)?;
    let identity = fresh_identity(pool, &current).await?;
    transition(pool, id, RecordEvent::Ready(identity), actor, now).await
}

pub async fn enable(
    pool: &Pool,
    id: i64,
    actor: Option<i64>,
    now: DateTime<Utc>,
) -> Result<EmployeeRecord> {
    let current = fetch(pool, id).await?;
    record::target(current.status, RecordTransition::Enable)?;
    let identity = fresh_identity(pool, &current).await?;
    transition(pool, id, RecordEvent::Enable(identity), actor, now).await
}

pub async fn disable(
    pool: &Pool,
    id: i64,
    actor: Option<i64>,
    now: DateTime<Utc>,
) -> Result<EmployeeRecord> {
    transition(pool, id, RecordEvent::Disable, actor, now).await
}

pub async fn archive(
    pool: &Pool,
    id: i64,
    actor: Option<i64>,
    now: DateTime<Utc>,
) -> Result<EmployeeRecord> {
    transition(pool, id, RecordEvent::Archive, actor, now).await
}

/// Leaves the archive towards the status implied by the last ASP verdict.
pub async fn unarchive(
    pool: &Pool,
    id: i64,
    actor: Option<i64>,
    now: DateTime<Utc>,
) -> Result<EmployeeRecord> {
    let current = fetch(pool, id).await?;
    let target = current.exchange.last_asp_verdict();
    transition(pool, id, RecordEvent::Unarchive(target), actor, now).await
}

/// Administrative repair: creates a NEW record carrying `company_id`'s
/// identity for the same hiring and approval, then disables the source when
/// its status allows it.
#[instrument(skip_all, fields(record_id = record_id, company_id = company_id))]
pub async fn clone_for_company(
    pool: &Pool,
    record_id: i64,
    company_id: i64,
    actor: Option<i64>,
    now: DateTime<Utc>,
) -> Result<EmployeeRecord> {
    let source = fetch(pool, record_id).await?;
    let ctx = db::fetch_hiring_context(pool, source.hiring_id).await?;
    let company = db::fetch_company(pool, company_id)
        .await?
        .ok_or_else(|| ExchangeError::Cloning(format!("company {company_id} not found")))?;
    let mother = match company.parent_id {
        Some(parent_id) => db::fetch_company(pool, parent_id)
            .await?
            .ok_or_else(|| ExchangeError::Cloning(format!("company {parent_id} not found")))?,
        None => company.clone(),
    };

    let identity = identity_for_company(&ctx, &company, &mother, &source.approval_number)
        .map_err(|err| ExchangeError::Cloning(err.to_string()))?;
    if identity == source.identity() {
        return Err(ExchangeError::Cloning(format!(
            "employee record {record_id} already carries this identity"
        )));
    }
    if db::record_exists_for_identity(pool, &identity).await? {
        return Err(ExchangeError::DuplicateCloning {
            measure: identity.asp_measure,
            siret: identity.siret,
            approval_number: identity.approval_number,
        });
    }

    let clone_id = db::insert_employee_record(pool, source.hiring_id, &identity, now).await?;
    if record::is_allowed(source.status, RecordTransition::Disable) {
        disable(pool, record_id, actor, now).await?;
    }
    info!(record_id, clone_id, "employee record cloned");
    fetch(pool, clone_id).await
}
