use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// ASP processing code for an accepted line.
pub const SUCCESS_CODE: &str = "0000";
/// ASP processing code for a record ASP already knows about.
pub const DUPLICATE_CODE: &str = "3436";
/// Label stored instead of ASP's own when a duplicate is force-processed.
pub const DUPLICATE_LABEL: &str = "Statut forcé à 'Intégré' (déjà existant dans l'extranet ASP)";

/// An approval can still be prolonged this many months after its end date.
pub const PROLONGATION_GRACE_MONTHS: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    New,
    Ready,
    Sent,
    Rejected,
    Processed,
    Disabled,
    Archived,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::New => "NEW",
            RecordStatus::Ready => "READY",
            RecordStatus::Sent => "SENT",
            RecordStatus::Rejected => "REJECTED",
            RecordStatus::Processed => "PROCESSED",
            RecordStatus::Disabled => "DISABLED",
            RecordStatus::Archived => "ARCHIVED",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(RecordStatus::New),
            "READY" => Some(RecordStatus::Ready),
            "SENT" => Some(RecordStatus::Sent),
            "REJECTED" => Some(RecordStatus::Rejected),
            "PROCESSED" => Some(RecordStatus::Processed),
            "DISABLED" => Some(RecordStatus::Disabled),
            "ARCHIVED" => Some(RecordStatus::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NotificationStatus {
    New,
    Sent,
    Processed,
    Rejected,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::New => "NEW",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Processed => "PROCESSED",
            NotificationStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(NotificationStatus::New),
            "SENT" => Some(NotificationStatus::Sent),
            "PROCESSED" => Some(NotificationStatus::Processed),
            "REJECTED" => Some(NotificationStatus::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of object carried by a batch; maps to the wire `typeMouvement`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Record,
    Notification,
}

impl ItemKind {
    pub fn movement_type(&self) -> &'static str {
        match self {
            ItemKind::Record => "C",
            ItemKind::Notification => "M",
        }
    }
}

/// Identity of a record or notification, used in error reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemRef {
    pub kind: ItemKind,
    pub id: i64,
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ItemKind::Record => write!(f, "employee record #{}", self.id),
            ItemKind::Notification => write!(f, "update notification #{}", self.id),
        }
    }
}

/// Exchange metadata shared by records, notifications and their logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeInfo {
    pub processing_code: Option<String>,
    pub processing_label: Option<String>,
    pub archived_json: Option<Value>,
    pub batch_file: Option<String>,
    pub batch_line_number: Option<i64>,
}

impl ExchangeInfo {
    /// Status implied by the last processing code ASP returned.
    pub fn last_asp_verdict(&self) -> RecordStatus {
        match self.processing_code.as_deref() {
            None => RecordStatus::New,
            Some(SUCCESS_CODE) | Some(DUPLICATE_CODE) => RecordStatus::Processed,
            // 32xx/33xx/34xx are rejections; unknown codes are treated the same way.
            Some(_) => RecordStatus::Rejected,
        }
    }
}

/// Denormalized identity of a record; refreshed whenever it is made ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIdentity {
    pub approval_number: String,
    pub siret: String,
    pub asp_id: Option<i64>,
    pub asp_measure: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmployeeRecord {
    pub id: i64,
    pub hiring_id: i64,
    pub approval_number: String,
    pub siret: String,
    pub asp_id: Option<i64>,
    pub asp_measure: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_as_duplicate: bool,
    pub exchange: ExchangeInfo,
}

impl EmployeeRecord {
    pub fn item_ref(&self) -> ItemRef {
        ItemRef {
            kind: ItemKind::Record,
            id: self.id,
        }
    }

    pub fn identity(&self) -> RecordIdentity {
        RecordIdentity {
            approval_number: self.approval_number.clone(),
            siret: self.siret.clone(),
            asp_id: self.asp_id,
            asp_measure: self.asp_measure.clone(),
        }
    }

    pub fn set_identity(&mut self, identity: RecordIdentity) {
        self.approval_number = identity.approval_number;
        self.siret = identity.siret;
        self.asp_id = identity.asp_id;
        self.asp_measure = identity.asp_measure;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateNotification {
    pub id: i64,
    pub employee_record_id: i64,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exchange: ExchangeInfo,
}

impl UpdateNotification {
    pub fn item_ref(&self) -> ItemRef {
        ItemRef {
            kind: ItemKind::Notification,
            id: self.id,
        }
    }
}

/// One row of an audit trail. Never updated once written.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionLog {
    pub id: i64,
    pub subject_id: i64,
    pub transition: String,
    pub from_state: String,
    pub to_state: String,
    pub user_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub exchange: ExchangeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub id: i64,
    pub number: String,
    pub start_at: NaiveDate,
    pub end_at: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Approval {
    pub fn is_valid(&self, today: NaiveDate) -> bool {
        self.start_at <= today && today <= self.end_at
    }

    /// Last day on which a prolongation may still be requested.
    pub fn prolongation_deadline(&self) -> NaiveDate {
        self.end_at
            .checked_add_months(Months::new(PROLONGATION_GRACE_MONTHS))
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn can_be_prolonged(&self, today: NaiveDate) -> bool {
        today <= self.prolongation_deadline()
    }

    /// Expired and no longer prolongable: records attached to it may be archived.
    pub fn is_archivable(&self, today: NaiveDate) -> bool {
        !self.is_valid(today) && !self.can_be_prolonged(today)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Company {
    pub id: i64,
    pub siret: String,
    pub kind: String,
    pub asp_id: Option<i64>,
    pub parent_id: Option<i64>,
}

/// ASP measure code for a company kind, if the kind is eligible.
pub fn asp_measure_for_kind(kind: &str) -> Option<&'static str> {
    match kind {
        "ACI" => Some("ACI_DC"),
        "AI" => Some("AI_DC"),
        "EI" => Some("EI_DC"),
        "EITI" => Some("EITI_DC"),
        "ETTI" => Some("ETTI_DC"),
        _ => None,
    }
}

/// Accepted hiring an employee record is created from.
#[derive(Debug, Clone, PartialEq)]
pub struct Hiring {
    pub id: i64,
    pub approval_id: Option<i64>,
    pub company_id: i64,
    pub person: Option<Value>,
    pub address: Option<Value>,
    pub situation: Option<Value>,
    pub created_at: DateTime<Utc>,
}
