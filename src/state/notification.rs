use serde_json::Value;

use super::{Applied, TransitionContext};
use crate::error::{ExchangeError, Result};
use crate::model::{NotificationStatus, UpdateNotification};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationTransition {
    WaitForAspResponse,
    Reject,
    Process,
}

impl NotificationTransition {
    pub fn name(&self) -> &'static str {
        match self {
            NotificationTransition::WaitForAspResponse => "wait_for_asp_response",
            NotificationTransition::Reject => "reject",
            NotificationTransition::Process => "process",
        }
    }

    fn rule(&self) -> (&'static [NotificationStatus], NotificationStatus) {
        use NotificationStatus::{New, Processed, Rejected, Sent};
        match self {
            NotificationTransition::WaitForAspResponse => (&[New], Sent),
            NotificationTransition::Reject => (&[Sent], Rejected),
            NotificationTransition::Process => (&[Sent], Processed),
        }
    }
}

pub fn target(
    from: NotificationStatus,
    transition: NotificationTransition,
) -> Result<NotificationStatus> {
    let (allowed, to) = transition.rule();
    if allowed.contains(&from) {
        Ok(to)
    } else {
        Err(ExchangeError::InvalidStatus {
            transition: transition.name(),
            from: from.as_str(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    WaitForAspResponse {
        batch_file: String,
        line_number: i64,
        archive: Value,
    },
    Reject {
        code: String,
        label: String,
        archive: Value,
    },
    Process {
        code: String,
        label: String,
        archive: Value,
    },
}

impl NotificationEvent {
    pub fn transition(&self) -> NotificationTransition {
        match self {
            NotificationEvent::WaitForAspResponse { .. } => {
                NotificationTransition::WaitForAspResponse
            }
            NotificationEvent::Reject { .. } => NotificationTransition::Reject,
            NotificationEvent::Process { .. } => NotificationTransition::Process,
        }
    }
}

pub fn apply(
    notification: &UpdateNotification,
    event: NotificationEvent,
    ctx: &TransitionContext<'_>,
) -> Result<Applied<UpdateNotification>> {
    let transition = event.transition();
    let to = target(notification.status, transition)?;
    let mut next = notification.clone();

    match event {
        NotificationEvent::WaitForAspResponse {
            batch_file,
            line_number,
            archive,
        } => {
            next.exchange.processing_code = None;
            next.exchange.processing_label = None;
            next.exchange.batch_file = Some(batch_file);
            next.exchange.batch_line_number = Some(line_number);
            next.exchange.archived_json = Some(archive);
        }
        NotificationEvent::Reject {
            code,
            label,
            archive,
        }
        | NotificationEvent::Process {
            code,
            label,
            archive,
        } => {
            next.exchange.processing_code = Some(code);
            next.exchange.processing_label = Some(label);
            next.exchange.archived_json = Some(archive);
        }
    }

    next.status = to;
    next.updated_at = ctx.now;
    Ok(Applied {
        transition: transition.name(),
        from: notification.status.as_str(),
        to: to.as_str(),
        subject: next,
    })
}
