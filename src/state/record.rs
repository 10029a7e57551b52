use serde_json::Value;

use super::{Applied, TransitionContext};
use crate::error::{ExchangeError, Result};
use crate::model::{EmployeeRecord, RecordIdentity, RecordStatus, DUPLICATE_LABEL};

use RecordStatus::{Archived, Disabled, New, Processed, Ready, Rejected, Sent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordTransition {
    Ready,
    WaitForAspResponse,
    Reject,
    Process,
    Disable,
    Enable,
    Archive,
    UnarchiveNew,
    UnarchiveProcessed,
    UnarchiveRejected,
}

impl RecordTransition {
    pub fn name(&self) -> &'static str {
        match self {
            RecordTransition::Ready => "ready",
            RecordTransition::WaitForAspResponse => "wait_for_asp_response",
            RecordTransition::Reject => "reject",
            RecordTransition::Process => "process",
            RecordTransition::Disable => "disable",
            RecordTransition::Enable => "enable",
            RecordTransition::Archive => "archive",
            RecordTransition::UnarchiveNew => "unarchive_new",
            RecordTransition::UnarchiveProcessed => "unarchive_processed",
            RecordTransition::UnarchiveRejected => "unarchive_rejected",
        }
    }
}

struct Rule {
    transition: RecordTransition,
    from: &'static [RecordStatus],
    to: RecordStatus,
}

const RULES: &[Rule] = &[
    Rule {
        transition: RecordTransition::Ready,
        from: &[New, Rejected, Disabled, Processed],
        to: Ready,
    },
    Rule {
        transition: RecordTransition::WaitForAspResponse,
        from: &[Ready],
        to: Sent,
    },
    Rule {
        transition: RecordTransition::Reject,
        from: &[Sent],
        to: Rejected,
    },
    Rule {
        transition: RecordTransition::Process,
        from: &[Sent],
        to: Processed,
    },
    Rule {
        transition: RecordTransition::Disable,
        from: &[New, Rejected, Processed],
        to: Disabled,
    },
    Rule {
        transition: RecordTransition::Enable,
        from: &[Disabled],
        to: New,
    },
    Rule {
        transition: RecordTransition::Archive,
        from: &[New, Ready, Rejected, Processed, Disabled],
        to: Archived,
    },
    Rule {
        transition: RecordTransition::UnarchiveNew,
        from: &[Archived],
        to: New,
    },
    Rule {
        transition: RecordTransition::UnarchiveProcessed,
        from: &[Archived],
        to: Processed,
    },
    Rule {
        transition: RecordTransition::UnarchiveRejected,
        from: &[Archived],
        to: Rejected,
    },
];

/// Destination of `transition` from `from`, or `InvalidStatus`.
pub fn target(from: RecordStatus, transition: RecordTransition) -> Result<RecordStatus> {
    RULES
        .iter()
        .find(|rule| rule.transition == transition && rule.from.contains(&from))
        .map(|rule| rule.to)
        .ok_or(ExchangeError::InvalidStatus {
            transition: transition.name(),
            from: from.as_str(),
        })
}

pub fn is_allowed(from: RecordStatus, transition: RecordTransition) -> bool {
    target(from, transition).is_ok()
}

/// A transition request together with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    /// Carries the identity freshly recomputed from the hiring.
    Ready(RecordIdentity),
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
        as_duplicate: bool,
    },
    Disable,
    Enable(RecordIdentity),
    Archive,
    /// Leave the archive towards the given status.
    Unarchive(RecordStatus),
}

impl RecordEvent {
    pub fn transition(&self) -> Result<RecordTransition> {
        Ok(match self {
            RecordEvent::Ready(_) => RecordTransition::Ready,
            RecordEvent::WaitForAspResponse { .. } => RecordTransition::WaitForAspResponse,
            RecordEvent::Reject { .. } => RecordTransition::Reject,
            RecordEvent::Process { .. } => RecordTransition::Process,
            RecordEvent::Disable => RecordTransition::Disable,
            RecordEvent::Enable(_) => RecordTransition::Enable,
            RecordEvent::Archive => RecordTransition::Archive,
            RecordEvent::Unarchive(New) => RecordTransition::UnarchiveNew,
            RecordEvent::Unarchive(Processed) => RecordTransition::UnarchiveProcessed,
            RecordEvent::Unarchive(Rejected) => RecordTransition::UnarchiveRejected,
            RecordEvent::Unarchive(other) => {
                return Err(ExchangeError::InvalidStatus {
                    transition: "unarchive",
                    from: other.as_str(),
                })
            }
        })
    }
}

/// Apply `event` to a copy of `record`.
///
/// Fails without producing anything when the status does not allow the
/// transition or a guard rejects it.
pub fn apply(
    record: &EmployeeRecord,
    event: RecordEvent,
    ctx: &TransitionContext<'_>,
) -> Result<Applied<EmployeeRecord>> {
    let transition = event.transition()?;
    let to = target(record.status, transition)?;
    let mut next = record.clone();

    match event {
        RecordEvent::Ready(identity) | RecordEvent::Enable(identity) => {
            next.set_identity(identity);
        }
        RecordEvent::WaitForAspResponse {
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
        RecordEvent::Reject {
            code,
            label,
            archive,
        } => {
            next.exchange.processing_code = Some(code);
            next.exchange.processing_label = Some(label);
            next.exchange.archived_json = Some(archive);
        }
        RecordEvent::Process {
            code,
            label,
            archive,
            as_duplicate,
        } => {
            next.processed_at = Some(ctx.now);
            next.processed_as_duplicate = as_duplicate;
            next.exchange.processing_code = Some(code);
            next.exchange.processing_label = Some(if as_duplicate {
                DUPLICATE_LABEL.to_string()
            } else {
                label
            });
            next.exchange.archived_json = Some(archive);
        }
        RecordEvent::Disable => {}
        RecordEvent::Archive => {
            let archivable = ctx
                .approval
                .map(|approval| approval.is_archivable(ctx.today()))
                .unwrap_or(false);
            if !archivable {
                return Err(ExchangeError::GuardFailed {
                    transition: transition.name(),
                    reason: "approval is still valid or can be prolonged".into(),
                });
            }
            next.exchange.archived_json = None;
        }
        RecordEvent::Unarchive(wanted) => {
            let verdict = record.exchange.last_asp_verdict();
            if verdict != wanted {
                return Err(ExchangeError::GuardFailed {
                    transition: transition.name(),
                    reason: format!("last known ASP verdict is {verdict}"),
                });
            }
        }
    }

    next.status = to;
    next.updated_at = ctx.now;
    Ok(Applied {
        transition: transition.name(),
        from: record.status.as_str(),
        to: to.as_str(),
        subject: next,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Approval, ExchangeInfo};
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;

    fn record(status: RecordStatus) -> EmployeeRecord {
        let ts = Utc.with_ymd_and_hms(2021, 4, 1, 12, 0, 0).unwrap();
        EmployeeRecord {
            id: 1,
            hiring_id: 1,
            approval_number: "999990000001".into(),
            siret: "12345678900012".into(),
            asp_id: Some(42),
            asp_measure: "ACI_DC".into(),
            status,
            created_at: ts,
            updated_at: ts,
            processed_at: None,
            processed_as_duplicate: false,
            exchange: ExchangeInfo::default(),
        }
    }

    fn identity() -> RecordIdentity {
        RecordIdentity {
            approval_number: "999990000001".into(),
            siret: "98765432100012".into(),
            asp_id: Some(7),
            asp_measure: "EI_DC".into(),
        }
    }

    fn ctx() -> TransitionContext<'static> {
        TransitionContext::at(Utc.with_ymd_and_hms(2021, 4, 10, 13, 0, 0).unwrap())
    }

    fn approval(end: NaiveDate) -> Approval {
        Approval {
            id: 1,
            number: "999990000001".into(),
            start_at: NaiveDate::from_ymd_opt(2019, 1, 1).unwrap(),
            end_at: end,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn ready_send_process_ends_processed() {
        for from in [New, Rejected, Disabled, Processed] {
            let r = record(from);
            let r = apply(&r, RecordEvent::Ready(identity()), &ctx())
                .unwrap()
                .subject;
            assert_eq!(r.status, Ready);
            assert_eq!(r.siret, "98765432100012");
            let r = apply(
                &r,
                RecordEvent::WaitForAspResponse {
                    batch_file: "RIAE_FS_20210410130000.json".into(),
                    line_number: 1,
                    archive: json!({"numLigne": 1}),
                },
                &ctx(),
            )
            .unwrap()
            .subject;
            assert_eq!(r.status, Sent);
            let r = apply(
                &r,
                RecordEvent::Process {
                    code: "0000".into(),
                    label: "Données intégrées".into(),
                    archive: json!({}),
                    as_duplicate: false,
                },
                &ctx(),
            )
            .unwrap()
            .subject;
            assert_eq!(r.status, Processed);
            assert!(r.processed_at.is_some());
            assert!(!r.processed_as_duplicate);
        }
    }

    #[test]
    fn duplicate_process_forces_label() {
        let r = record(Sent);
        let applied = apply(
            &r,
            RecordEvent::Process {
                code: "3436".into(),
                label: "Doublon".into(),
                archive: json!({}),
                as_duplicate: true,
            },
            &ctx(),
        )
        .unwrap();
        assert!(applied.subject.processed_as_duplicate);
        assert_eq!(
            applied.subject.exchange.processing_label.as_deref(),
            Some(DUPLICATE_LABEL)
        );
    }

    #[test]
    fn disable_rules() {
        for from in [Ready, Sent, Archived, Disabled] {
            let err = apply(&record(from), RecordEvent::Disable, &ctx()).unwrap_err();
            assert!(matches!(err, ExchangeError::InvalidStatus { .. }));
        }
        for from in [New, Rejected, Processed] {
            let r = apply(&record(from), RecordEvent::Disable, &ctx()).unwrap();
            assert_eq!(r.subject.status, Disabled);
        }
        let r = apply(&record(Disabled), RecordEvent::Enable(identity()), &ctx())
            .unwrap()
            .subject;
        assert_eq!(r.status, New);
        let r = apply(&r, RecordEvent::Disable, &ctx()).unwrap().subject;
        assert_eq!(r.status, Disabled);
    }

    #[test]
    fn archive_guarded_by_approval() {
        let mut r = record(Processed);
        r.exchange.archived_json = Some(json!({"a": 1}));

        let valid = approval(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
        let c = ctx().with_approval(Some(&valid));
        assert!(matches!(
            apply(&r, RecordEvent::Archive, &c),
            Err(ExchangeError::GuardFailed { .. })
        ));

        let prolongable = approval(NaiveDate::from_ymd_opt(2021, 3, 1).unwrap());
        let c = ctx().with_approval(Some(&prolongable));
        assert!(apply(&r, RecordEvent::Archive, &c).is_err());

        let expired = approval(NaiveDate::from_ymd_opt(2020, 12, 1).unwrap());
        let c = ctx().with_approval(Some(&expired));
        let archived = apply(&r, RecordEvent::Archive, &c).unwrap().subject;
        assert_eq!(archived.status, Archived);
        assert_eq!(archived.exchange.archived_json, None);

        assert!(apply(&record(Sent), RecordEvent::Archive, &c).is_err());
    }

    #[test]
    fn unarchive_must_match_last_verdict() {
        let mut r = record(Archived);
        assert_eq!(
            apply(&r, RecordEvent::Unarchive(New), &ctx())
                .unwrap()
                .subject
                .status,
            New
        );
        assert!(apply(&r, RecordEvent::Unarchive(Processed), &ctx()).is_err());

        r.exchange.processing_code = Some("3436".into());
        assert!(apply(&r, RecordEvent::Unarchive(Processed), &ctx()).is_ok());
        r.exchange.processing_code = Some("3417".into());
        assert!(apply(&r, RecordEvent::Unarchive(Rejected), &ctx()).is_ok());
        assert!(apply(&r, RecordEvent::Unarchive(Processed), &ctx()).is_err());
        assert!(matches!(
            apply(&r, RecordEvent::Unarchive(Sent), &ctx()),
            Err(ExchangeError::InvalidStatus { .. })
        ));
    }

    #[test]
    fn invalid_transition_does_not_mutate() {
        let r = record(New);
        let before = r.clone();
        assert!(apply(
            &r,
            RecordEvent::Reject {
                code: "3308".into(),
                label: "x".into(),
                archive: json!({})
            },
            &ctx()
        )
        .is_err());
        assert_eq!(r, before);
    }
}
