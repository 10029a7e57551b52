//! Wire format of upload/feedback files and the document formatter seam.
//!
//! The mapping of person, address and employment situation into ASP fields is
//! owned upstream; the hiring already stores those three fragments as JSON.
//! `FragmentFormatter` assembles them into a line and enforces the bits ASP
//! rejects outright (missing fragments, malformed SIRET).
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use crate::batch::{EmployeeRecordBatch, RecordDocument, MAX_BATCH_BYTES};
use crate::error::{ExchangeError, Result};
use crate::model::{ItemKind, ItemRef};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLine {
    pub num_ligne: i64,
    pub type_mouvement: String,
    pub siret: String,
    pub mesure: String,
    pub personne_physique: Value,
    pub adresse: Value,
    pub situation_salarie: Value,
    pub code_traitement: Option<String>,
    pub libelle_traitement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBatch {
    pub msg_informatif: String,
    pub tel_id: Option<String>,
    pub lignes_telechargement: Vec<WireLine>,
}

/// Turns one batched document into its wire line.
pub trait DocumentFormatter: Send + Sync {
    fn format_line(&self, doc: &RecordDocument, line_number: i64) -> Result<WireLine>;
}

/// Default formatter: assembles the stored fragments, optionally swapping the
/// SIRET for a sandbox one keyed by measure.
#[derive(Debug, Clone, Default)]
pub struct FragmentFormatter {
    sandbox_sirets: Option<BTreeMap<String, String>>,
}

impl FragmentFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formatter for ASP's test platform.
    pub fn sandboxed(sirets: BTreeMap<String, String>) -> Self {
        Self {
            sandbox_sirets: Some(sirets),
        }
    }

    fn siret_for(&self, doc: &RecordDocument) -> Result<String> {
        let record = &doc.record;
        match &self.sandbox_sirets {
            None => Ok(record.siret.clone()),
            Some(map) => map.get(&record.asp_measure).cloned().ok_or_else(|| {
                ExchangeError::Serialization {
                    item: doc.item,
                    reason: format!("no sandbox SIRET for measure {}", record.asp_measure),
                }
            }),
        }
    }
}

fn fragment(item: ItemRef, name: &str, value: &Option<Value>) -> Result<Value> {
    match value {
        Some(v @ Value::Object(_)) => Ok(v.clone()),
        Some(_) => Err(ExchangeError::Serialization {
            item,
            reason: format!("{name} is not a JSON object"),
        }),
        None => Err(ExchangeError::Serialization {
            item,
            reason: format!("{name} is missing"),
        }),
    }
}

pub fn is_valid_siret(siret: &str) -> bool {
    siret.len() == 14 && siret.bytes().all(|b| b.is_ascii_digit())
}

impl DocumentFormatter for FragmentFormatter {
    fn format_line(&self, doc: &RecordDocument, line_number: i64) -> Result<WireLine> {
        let siret = self.siret_for(doc)?;
        if !is_valid_siret(&siret) {
            return Err(ExchangeError::Serialization {
                item: doc.item,
                reason: format!("malformed SIRET {siret:?}"),
            });
        }
        Ok(WireLine {
            num_ligne: line_number,
            type_mouvement: doc.kind().movement_type().to_string(),
            siret,
            mesure: doc.record.asp_measure.clone(),
            personne_physique: fragment(doc.item, "personnePhysique", &doc.person)?,
            adresse: fragment(doc.item, "adresse", &doc.address)?,
            situation_salarie: fragment(doc.item, "situationSalarie", &doc.situation)?,
            code_traitement: None,
            libelle_traitement: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedLine {
    pub item: ItemRef,
    pub line_number: i64,
    /// The line's own JSON, archived on the item once the file is written.
    pub archive: Value,
}

#[derive(Debug, Clone)]
pub struct RenderedBatch {
    pub filename: String,
    pub kind: ItemKind,
    pub bytes: Vec<u8>,
    pub lines: Vec<RenderedLine>,
}

/// Formats and serializes a whole batch. The first failing line aborts it.
pub fn render_batch(
    formatter: &dyn DocumentFormatter,
    batch: &EmployeeRecordBatch,
) -> Result<RenderedBatch> {
    let mut wire_lines = Vec::with_capacity(batch.len());
    let mut lines = Vec::with_capacity(batch.len());
    let mut kind = None;

    for (line_number, doc) in batch.lines() {
        match kind {
            None => kind = Some(doc.kind()),
            Some(k) if k != doc.kind() => {
                return Err(ExchangeError::Serialization {
                    item: doc.item,
                    reason: "a batch cannot mix records and notifications".into(),
                })
            }
            Some(_) => {}
        }
        let line = formatter.format_line(doc, line_number)?;
        let archive = serde_json::to_value(&line).map_err(|err| ExchangeError::Serialization {
            item: doc.item,
            reason: err.to_string(),
        })?;
        lines.push(RenderedLine {
            item: doc.item,
            line_number,
            archive,
        });
        wire_lines.push(line);
    }

    let Some(kind) = kind else {
        return Err(ExchangeError::BatchSize {
            size: 0,
            max: crate::batch::MAX_BATCH_SIZE,
        });
    };

    let envelope = WireBatch {
        msg_informatif: format!("Batch {}", batch.filename()),
        tel_id: None,
        lignes_telechargement: wire_lines,
    };
    // serde_json cannot tell which line broke; blame the first one.
    let bytes = serde_json::to_vec(&envelope).map_err(|err| ExchangeError::Serialization {
        item: lines[0].item,
        reason: err.to_string(),
    })?;
    if bytes.len() > MAX_BATCH_BYTES {
        warn!(
            filename = batch.filename(),
            size = bytes.len(),
            "rendered batch exceeds the advisory size limit"
        );
    }

    Ok(RenderedBatch {
        filename: batch.filename().to_string(),
        kind,
        bytes,
        lines,
    })
}
