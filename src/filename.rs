//! Upload and feedback filename grammar.
//!
//! Uploads are named `RIAE_FS_<YYYYMMDDHHMMSS>.json` (27 characters); ASP
//! answers each one with `RIAE_FS_<YYYYMMDDHHMMSS>_FichierRetour.json`.
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ExchangeError, Result};

pub const UPLOAD_FILENAME_LEN: usize = 27;
const PREFIX: &str = "RIAE_FS_";
const FEEDBACK_SUFFIX: &str = "_FichierRetour";
const EXTENSION: &str = ".json";

static UPLOAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^RIAE_FS_\d{14}\.json$").expect("valid upload filename regex"));
static FEEDBACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^RIAE_FS_\d{14}_FichierRetour\.json$").expect("valid feedback filename regex")
});

/// Upload filename for a batch built at `now` (second resolution).
pub fn upload_filename(now: DateTime<Utc>) -> String {
    format!("{PREFIX}{}{EXTENSION}", now.format("%Y%m%d%H%M%S"))
}

pub fn validate_upload_filename(name: &str) -> Result<()> {
    if name.len() == UPLOAD_FILENAME_LEN && UPLOAD_RE.is_match(name) {
        Ok(())
    } else {
        Err(ExchangeError::InvalidFilename(name.to_string()))
    }
}

pub fn is_feedback_filename(name: &str) -> bool {
    FEEDBACK_RE.is_match(name)
}

/// Name ASP gives to the feedback of the upload `upload_name`.
pub fn feedback_filename(upload_name: &str) -> Result<String> {
    validate_upload_filename(upload_name)?;
    let stem = &upload_name[..upload_name.len() - EXTENSION.len()];
    Ok(format!("{stem}{FEEDBACK_SUFFIX}{EXTENSION}"))
}

/// Upload filename a feedback file answers to.
pub fn batch_filename_from_feedback(feedback_name: &str) -> Result<String> {
    if !is_feedback_filename(feedback_name) {
        return Err(ExchangeError::InvalidFilename(feedback_name.to_string()));
    }
    let stem = &feedback_name[..feedback_name.len() - FEEDBACK_SUFFIX.len() - EXTENSION.len()];
    Ok(format!("{stem}{EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn upload_name_from_timestamp() {
        let now = Utc.with_ymd_and_hms(2021, 4, 10, 13, 0, 0).unwrap();
        let name = upload_filename(now);
        assert_eq!(name, "RIAE_FS_20210410130000.json");
        assert_eq!(name.len(), UPLOAD_FILENAME_LEN);
        validate_upload_filename(&name).unwrap();
    }

    #[test]
    fn feedback_name() {
        assert_eq!(
            feedback_filename("RIAE_FS_20210410130000.json").unwrap(),
            "RIAE_FS_20210410130000_FichierRetour.json"
        );
    }

    #[test]
    fn feedback_round_trip() {
        let f = "RIAE_FS_20231231235959.json";
        assert_eq!(
            batch_filename_from_feedback(&feedback_filename(f).unwrap()).unwrap(),
            f
        );
    }

    #[test]
    fn malformed_names_rejected() {
        assert!(feedback_filename("test.json").is_err());
        assert!(batch_filename_from_feedback("test.json").is_err());
        assert!(feedback_filename("RIAE_FS_2021041013000.json").is_err());
        assert!(batch_filename_from_feedback("RIAE_FS_20210410130000.json").is_err());
        assert!(validate_upload_filename("RIAE_FS_20210410130000_FichierRetour.json").is_err());
    }
}
