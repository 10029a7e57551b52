//! Database view models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::NaiveDate;
use serde_json::Value;

use crate::model::{Approval, Company, Hiring};

/// A hiring with everything needed to (re)compute a record identity.
#[derive(Debug, Clone)]
pub struct HiringContext {
    pub hiring: Hiring,
    pub company: Company,
    /// Mother company when `company` is a branch.
    pub parent: Option<Company>,
    pub approval: Option<Approval>,
}

/// Fields of a hiring accepted from upstream.
#[derive(Debug, Clone, Default)]
pub struct NewHiring {
    pub approval_id: Option<i64>,
    pub company_id: i64,
    pub person: Option<Value>,
    pub address: Option<Value>,
    pub situation: Option<Value>,
}

/// Row of the stale-archive read model.
#[derive(Debug, Clone)]
pub struct StaleArchivedRecord {
    pub record_id: i64,
    pub approval_number: String,
}

/// Row of the archivable read model.
#[derive(Debug, Clone)]
pub struct ArchivableRecord {
    pub record_id: i64,
    pub approval_end_at: NaiveDate,
}
