//! Core domain model for contact extra-field enrichment.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "xfields-core";

/// Error text is capped to fit the error-log column.
pub const MAX_ERROR_CHARS: usize = 999;

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Contact identifier shared by the warehouse and the CRM (`vanid`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl ContactId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContactId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ContactId)
    }
}

impl From<i64> for ContactId {
    fn from(value: i64) -> Self {
        ContactId(value)
    }
}

/// Person record as returned by the CRM `people/{id}` endpoint.
///
/// Only the keys needed for enrichment are modelled; everything else in the
/// payload is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPersonRecord {
    #[serde(default)]
    pub van_id: Option<ContactId>,
    /// Kept loose: anything other than a string maps to an unknown birth date.
    #[serde(default)]
    pub date_of_birth: Option<JsonValue>,
    #[serde(default)]
    pub self_reported_races: Option<Vec<ReportedRace>>,
    #[serde(default)]
    pub self_reported_genders: Option<Vec<ReportedGender>>,
    #[serde(default)]
    pub custom_fields: Option<Vec<CustomFieldEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedRace {
    #[serde(default)]
    pub reported_race_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedGender {
    #[serde(default)]
    pub reported_gender_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomFieldEntry {
    pub custom_field_id: i64,
    #[serde(default)]
    pub assigned_value: Option<JsonValue>,
    #[serde(default)]
    pub custom_field: Option<CustomFieldDefinition>,
}

impl CustomFieldEntry {
    /// Assigned value rendered as text, without label resolution.
    pub fn assigned_text(&self) -> Option<String> {
        match self.assigned_value.as_ref()? {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomFieldDefinition {
    #[serde(default)]
    pub available_values: Option<Vec<AvailableValue>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableValue {
    pub id: i64,
    pub name: String,
}

/// Custom column resolved from a mapped custom field id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedValue {
    pub column: String,
    pub value: Option<String>,
}

/// One appended row of the enrichment table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedRow {
    pub vanid: ContactId,
    pub dob: Option<String>,
    pub race: String,
    pub gender: String,
    /// Mapped custom columns, in mapping order.
    pub custom: Vec<MappedValue>,
    pub active: Option<String>,
    pub date_updated: NaiveDate,
}

impl TransformedRow {
    pub fn custom_value(&self, column: &str) -> Option<&str> {
        self.custom
            .iter()
            .find(|m| m.column == column)
            .and_then(|m| m.value.as_deref())
    }
}

/// One appended row of the error-log table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub vanid: ContactId,
    pub error: String,
    pub errored_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(vanid: ContactId, message: impl fmt::Display, errored_at: DateTime<Utc>) -> Self {
        Self {
            vanid,
            error: truncate_chars(&message.to_string(), MAX_ERROR_CHARS),
            errored_at,
        }
    }
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => input[..byte_idx].to_string(),
        None => input.to_string(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("person record is missing vanId")]
    MissingIdentifier,
    #[error("requested vanid {requested} but CRM returned {returned}")]
    IdentifierMismatch {
        requested: ContactId,
        returned: ContactId,
    },
    #[error("required custom field {field_id} ({column}) is missing")]
    MissingRequiredField { field_id: i64, column: &'static str },
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("reading field mapping {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing field mapping: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported field mapping version {0}")]
    Version(u32),
    #[error("invalid column name `{0}`")]
    InvalidColumn(String),
    #[error("column `{0}` is mapped more than once or shadows a fixed column")]
    DuplicateColumn(String),
}

/// Custom field id to destination column table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub active_field_id: i64,
    pub fields: Vec<FieldColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldColumn {
    pub field_id: i64,
    pub column: String,
}

pub const FIXED_ROW_COLUMNS: [&str; 6] = ["vanid", "dob", "race", "gender", "active", "date_updated"];

#[derive(Debug, Deserialize)]
struct FieldMappingFile {
    version: u32,
    #[serde(default = "default_active_field_id")]
    active_field_id: i64,
    #[serde(default)]
    fields: Vec<FieldColumn>,
}

fn default_active_field_id() -> i64 {
    6
}

impl Default for FieldMapping {
    fn default() -> Self {
        let field = |field_id, column: &str| FieldColumn {
            field_id,
            column: column.to_string(),
        };
        Self {
            active_field_id: default_active_field_id(),
            fields: vec![
                field(19, "class"),
                field(12, "hub"),
                field(7, "hub_role"),
                field(8, "secondary_hub_role"),
                field(9, "other_hub_role"),
            ],
        }
    }
}

impl FieldMapping {
    pub fn from_yaml_str(text: &str) -> Result<Self, MappingError> {
        let file: FieldMappingFile = serde_yaml::from_str(text)?;
        if file.version != 1 {
            return Err(MappingError::Version(file.version));
        }
        let mapping = Self {
            active_field_id: file.active_field_id,
            fields: file.fields,
        };
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| MappingError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), MappingError> {
        let mut seen: HashSet<&str> = FIXED_ROW_COLUMNS.into_iter().collect();
        for field in &self.fields {
            if !is_plain_identifier(&field.column) {
                return Err(MappingError::InvalidColumn(field.column.clone()));
            }
            if !seen.insert(field.column.as_str()) {
                return Err(MappingError::DuplicateColumn(field.column.clone()));
            }
        }
        Ok(())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.column.as_str())
    }
}

/// Lower-case SQL identifier: `[a-z_][a-z0-9_]*`.
pub fn is_plain_identifier(input: &str) -> bool {
    let mut chars = input.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
