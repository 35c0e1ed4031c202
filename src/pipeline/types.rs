//! Core data types flowing through the dispatcher
//!
//! - `Record` - one received instance, an opaque bundle of named fields
//! - `SeriesSummary` - the payload submitted to the sink for a completed series
//! - `Ack` - sink acknowledgement

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Correlation key: records sharing it belong to the same series
pub const SERIES_UID_FIELD: &str = "SeriesInstanceUID";
/// Parent key of a series
pub const STUDY_UID_FIELD: &str = "StudyInstanceUID";
pub const PATIENT_NAME_FIELD: &str = "PatientName";
pub const PATIENT_ID_FIELD: &str = "PatientID";

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record has no SeriesInstanceUID correlation key")]
    MissingCorrelationKey,

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("invalid record JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A received record (one instance of a series)
///
/// Immutable once built. Cloning is cheap: fields are shared behind an `Arc`.
/// The correlation key is extracted and validated at construction, so every
/// `Record` in the system is routable.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    series_uid: String,
    fields: Arc<Map<String, Value>>,
}

impl Record {
    /// Build a record from a field map
    ///
    /// Rejects the record if the correlation key is missing, null or empty.
    pub fn from_fields(fields: Map<String, Value>) -> Result<Self, RecordError> {
        let series_uid = fields
            .get(SERIES_UID_FIELD)
            .and_then(render_value)
            .filter(|uid| !uid.is_empty())
            .ok_or(RecordError::MissingCorrelationKey)?;

        Ok(Self {
            series_uid,
            fields: Arc::new(fields),
        })
    }

    /// Parse a record from a single JSON object
    pub fn from_json(json: &str) -> Result<Self, RecordError> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(fields) => Self::from_fields(fields),
            _ => Err(RecordError::NotAnObject),
        }
    }

    pub fn series_uid(&self) -> &str {
        &self.series_uid
    }

    pub fn study_uid(&self) -> String {
        self.field(STUDY_UID_FIELD).unwrap_or_default()
    }

    pub fn patient_name(&self) -> String {
        self.field(PATIENT_NAME_FIELD).unwrap_or_default()
    }

    pub fn patient_id(&self) -> String {
        self.field(PATIENT_ID_FIELD).unwrap_or_default()
    }

    /// Read any field as text. Strings are returned as-is, other scalars as
    /// their JSON text. Null and missing fields yield `None`.
    pub fn field(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(render_value)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Summary of a completed series, submitted to the sink
///
/// Identity fields come from the first member of the series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesSummary {
    #[serde(rename = "StudyInstanceUID")]
    pub parent_key: String,

    #[serde(rename = "PatientName")]
    pub patient_name: String,

    #[serde(rename = "PatientID")]
    pub patient_id: String,

    /// Number of member records (always >= 1)
    #[serde(rename = "NumberOfInstances")]
    pub count: usize,

    #[serde(rename = "SeriesInstanceUID")]
    pub series_uid: String,
}

/// Sink acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    /// Status reported by the sink, when it reports one
    pub status: Option<String>,
}
