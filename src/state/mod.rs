//! Lifecycle state machines for employee records and update notifications.
//!
//! Each machine is a static transition table plus a pure `apply` function:
//! given the current object, an event and a context, it returns a mutated copy
//! or an error. Nothing here touches storage; persisting the copy and writing
//! the audit log is the caller's job (see `crate::records` and `crate::db`).

use chrono::{DateTime, NaiveDate, Utc};

use crate::model::Approval;

pub mod notification;
pub mod record;

pub use notification::{NotificationEvent, NotificationTransition};
pub use record::{RecordEvent, RecordTransition};

/// Inputs that guards and effects may read.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub now: DateTime<Utc>,
    pub approval: Option<&'a Approval>,
}

impl<'a> TransitionContext<'a> {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            approval: None,
        }
    }

    pub fn with_approval(mut self, approval: Option<&'a Approval>) -> Self {
        self.approval = approval;
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }
}

/// A successful transition: the object as it must be persisted, plus the
/// names the audit log records.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied<T> {
    pub transition: &'static str,
    pub from: &'static str,
    pub to: &'static str,
    pub subject: T,
}
