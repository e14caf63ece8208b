//! CRM person adapter plus the record-to-row transform.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use tracing::debug;
use xfields_core::{
    ContactId, CustomFieldEntry, FieldMapping, MappedValue, RawPersonRecord, TransformError,
    TransformedRow,
};
use xfields_storage::{ApiClient, ApiClientConfig, BasicAuth, FetchError};

pub const CRATE_NAME: &str = "xfields-adapters";

pub const DEFAULT_VAN_API_URL: &str = "https://api.securevan.com/v4/";

/// Expansions requested for every sync fetch.
pub const PERSON_SYNC_EXPAND: [ExpandField; 2] =
    [ExpandField::ReportedDemographics, ExpandField::CustomFields];

/// Outcome of resolving one custom field to its display label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldResolution {
    Resolved(String),
    /// No entry with the requested id.
    Absent,
    /// Entry present but its value or definition is unusable.
    Malformed(String),
    /// Assigned value is not one of the available values.
    Unmatched(i64),
}

impl FieldResolution {
    pub fn into_value(self) -> Option<String> {
        match self {
            FieldResolution::Resolved(name) => Some(name),
            _ => None,
        }
    }
}

/// First entry with `field_id` in CRM order, for optional fields and `active` alike.
/// A payload repeating an id keeps its earliest value rather than its latest.
fn find_entry(custom_fields: &[CustomFieldEntry], field_id: i64) -> Option<&CustomFieldEntry> {
    custom_fields.iter().find(|f| f.custom_field_id == field_id)
}

pub fn resolve_custom_field(custom_fields: &[CustomFieldEntry], field_id: i64) -> FieldResolution {
    let Some(entry) = find_entry(custom_fields, field_id) else {
        return FieldResolution::Absent;
    };
    let Some(raw) = entry.assigned_text() else {
        return FieldResolution::Malformed("assigned value is null".to_string());
    };
    let assigned = match raw.trim().parse::<i64>() {
        Ok(v) => v,
        Err(_) => return FieldResolution::Malformed(format!("assigned value `{raw}` is not an integer")),
    };
    let Some(available) = entry
        .custom_field
        .as_ref()
        .and_then(|def| def.available_values.as_ref())
    else {
        return FieldResolution::Malformed("custom field has no available values".to_string());
    };
    available
        .iter()
        .find(|v| v.id == assigned)
        .map(|v| FieldResolution::Resolved(v.name.clone()))
        .unwrap_or(FieldResolution::Unmatched(assigned))
}

/// Human-readable value of an optional custom field, or `None` if it cannot be resolved.
pub fn extract_custom_field(custom_fields: &[CustomFieldEntry], field_id: i64) -> Option<String> {
    resolve_custom_field(custom_fields, field_id).into_value()
}

const RACE_RELABELS: [(&str, &str); 5] = [
    ("Asian", "Asian/Asian American"),
    ("Black or African American", "Black/African American"),
    ("Caucasian or White", "Caucasian/White"),
    ("Hispanic", "Latino/Latina/Latinx"),
    ("Native American", "Native American/First Nations/Alaska Native"),
];

/// Rewrites CRM race categories to the organization's display labels.
///
/// Substring based and case-sensitive. Text already in display form is left
/// alone, so normalizing twice is the same as normalizing once.
pub fn normalize_race(label: &str) -> String {
    RACE_RELABELS
        .iter()
        .fold(label.to_string(), |acc, (from, to)| replace_unnormalized(&acc, from, to))
}

fn replace_unnormalized(input: &str, from: &str, to: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while !rest.is_empty() {
        if rest.starts_with(to) {
            out.push_str(to);
            rest = &rest[to.len()..];
        } else if rest.starts_with(from) {
            out.push_str(to);
            rest = &rest[from.len()..];
        } else {
            let ch = rest.chars().next().unwrap_or_default();
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
    }
    out
}

/// Maps one CRM person record onto the flat enrichment row.
#[derive(Debug, Clone, Default)]
pub struct PersonTransformer {
    mapping: FieldMapping,
}

impl PersonTransformer {
    pub fn new(mapping: FieldMapping) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn transform(
        &self,
        record: &RawPersonRecord,
        today: NaiveDate,
    ) -> Result<TransformedRow, TransformError> {
        let vanid = record.van_id.ok_or(TransformError::MissingIdentifier)?;
        let custom_fields = record.custom_fields.as_deref().unwrap_or_default();

        let dob = record
            .date_of_birth
            .as_ref()
            .and_then(|v| v.as_str())
            .map(|s| s.chars().take(10).collect::<String>());

        let race = record
            .self_reported_races
            .iter()
            .flatten()
            .filter_map(|r| r.reported_race_name.as_deref())
            .map(normalize_race)
            .collect::<Vec<_>>()
            .join(",");

        let gender = record
            .self_reported_genders
            .iter()
            .flatten()
            .filter_map(|g| g.reported_gender_name.as_deref())
            .collect::<Vec<_>>()
            .join(",");

        let custom = self
            .mapping
            .fields
            .iter()
            .map(|field| {
                let resolution = resolve_custom_field(custom_fields, field.field_id);
                match &resolution {
                    FieldResolution::Malformed(reason) => {
                        debug!(%vanid, field_id = field.field_id, reason = %reason, "unresolvable custom field");
                    }
                    FieldResolution::Unmatched(value) => {
                        debug!(%vanid, field_id = field.field_id, value, "custom field value not in available values");
                    }
                    _ => {}
                }
                MappedValue {
                    column: field.column.clone(),
                    value: resolution.into_value(),
                }
            })
            .collect();

        let active = find_entry(custom_fields, self.mapping.active_field_id)
            .ok_or(TransformError::MissingRequiredField {
                field_id: self.mapping.active_field_id,
                column: "active",
            })?
            .assigned_text();

        Ok(TransformedRow {
            vanid,
            dob,
            race,
            gender,
            custom,
            active,
            date_updated: today,
        })
    }

    /// Transform a record fetched for `requested`, rejecting a record for anyone else.
    pub fn transform_fetched(
        &self,
        requested: ContactId,
        record: &RawPersonRecord,
        today: NaiveDate,
    ) -> Result<TransformedRow, TransformError> {
        let row = self.transform(record, today)?;
        if row.vanid != requested {
            return Err(TransformError::IdentifierMismatch {
                requested,
                returned: row.vanid,
            });
        }
        Ok(row)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpandField {
    ContributionHistory,
    Addresses,
    Phones,
    Emails,
    Codes,
    CustomFields,
    ExternalIds,
    Preferences,
    RecordedAddresses,
    ReportedDemographics,
    Suppressions,
    Cases,
    CustomProperties,
    Districts,
    ElectionRecords,
    MembershipStatuses,
    Notes,
    OrganizationRoles,
    Scores,
    DisclosureFieldValues,
}

impl ExpandField {
    pub const ALL: [ExpandField; 20] = [
        ExpandField::ContributionHistory,
        ExpandField::Addresses,
        ExpandField::Phones,
        ExpandField::Emails,
        ExpandField::Codes,
        ExpandField::CustomFields,
        ExpandField::ExternalIds,
        ExpandField::Preferences,
        ExpandField::RecordedAddresses,
        ExpandField::ReportedDemographics,
        ExpandField::Suppressions,
        ExpandField::Cases,
        ExpandField::CustomProperties,
        ExpandField::Districts,
        ExpandField::ElectionRecords,
        ExpandField::MembershipStatuses,
        ExpandField::Notes,
        ExpandField::OrganizationRoles,
        ExpandField::Scores,
        ExpandField::DisclosureFieldValues,
    ];

    /// Value as accepted by the `$expand` query parameter.
    pub fn as_param(self) -> &'static str {
        match self {
            ExpandField::ContributionHistory => "contributionHistory",
            ExpandField::Addresses => "addresses",
            ExpandField::Phones => "phones",
            ExpandField::Emails => "emails",
            ExpandField::Codes => "codes",
            ExpandField::CustomFields => "customFields",
            ExpandField::ExternalIds => "externalIds",
            ExpandField::Preferences => "preferences",
            ExpandField::RecordedAddresses => "recordedAddresses",
            ExpandField::ReportedDemographics => "reportedDemographics",
            ExpandField::Suppressions => "suppressions",
            ExpandField::Cases => "cases",
            ExpandField::CustomProperties => "customProperties",
            ExpandField::Districts => "districts",
            ExpandField::ElectionRecords => "electionRecords",
            ExpandField::MembershipStatuses => "membershipStatuses",
            ExpandField::Notes => "notes",
            ExpandField::OrganizationRoles => "organizationRoles",
            ExpandField::Scores => "scores",
            ExpandField::DisclosureFieldValues => "disclosureFieldValues",
        }
    }

    /// Expansions the MyVoters side does not return.
    pub fn available_in_my_voters(self) -> bool {
        !matches!(
            self,
            ExpandField::Codes | ExpandField::ContributionHistory | ExpandField::OrganizationRoles
        )
    }
}

#[derive(Debug, Error)]
pub enum PersonFetchError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("decoding person {id}: {source}")]
    Decode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PersonFetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            PersonFetchError::Http(err) => err.status(),
            PersonFetchError::Decode { .. } => None,
        }
    }
}

/// Fetches one person record from the CRM.
#[async_trait]
pub trait PersonSource: Send + Sync {
    async fn fetch_person(
        &self,
        id: ContactId,
        expand: &[ExpandField],
    ) -> Result<RawPersonRecord, PersonFetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VanDatabase {
    MyVoters,
    EveryAction,
}

impl VanDatabase {
    pub fn db_code(self) -> u8 {
        match self {
            VanDatabase::MyVoters => 0,
            VanDatabase::EveryAction => 1,
        }
    }
}

impl FromStr for VanDatabase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "everyaction" | "1" => Ok(VanDatabase::EveryAction),
            "myvoters" | "myvoterfile" | "0" => Ok(VanDatabase::MyVoters),
            other => Err(format!("unknown VAN database `{other}` (expected EveryAction or MyVoters)")),
        }
    }
}

#[derive(Clone)]
pub struct VanCredentials {
    pub app_name: String,
    pub api_key: String,
    pub database: VanDatabase,
}

impl std::fmt::Debug for VanCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VanCredentials")
            .field("app_name", &self.app_name)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl VanCredentials {
    pub fn basic_auth(&self) -> BasicAuth {
        BasicAuth {
            username: self.app_name.clone(),
            password: format!("{}|{}", self.api_key, self.database.db_code()),
        }
    }
}

/// `PersonSource` backed by the VAN / EveryAction `people` endpoint.
#[derive(Debug, Clone)]
pub struct VanPersonSource {
    api: ApiClient,
    database: VanDatabase,
}

impl VanPersonSource {
    pub fn new(api: ApiClient, database: VanDatabase) -> Self {
        Self { api, database }
    }

    pub fn connect(
        base_url: &str,
        credentials: &VanCredentials,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut config = ApiClientConfig::new(base_url);
        config.timeout = timeout;
        config.user_agent = Some(format!("{}/{}", credentials.app_name, env!("CARGO_PKG_VERSION")));
        config.auth = Some(credentials.basic_auth());
        Ok(Self::new(ApiClient::new(config)?, credentials.database))
    }

    pub fn person_path(id: &str, id_type: &str) -> String {
        if id_type.is_empty() || id_type == "vanid" {
            format!("people/{id}")
        } else {
            format!("people/{id_type}:{id}")
        }
    }

    pub fn expand_param(database: VanDatabase, expand: &[ExpandField]) -> String {
        expand
            .iter()
            .filter(|f| database != VanDatabase::MyVoters || f.available_in_my_voters())
            .map(|f| f.as_param())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Fetch by any person identifier type known to the CRM instance.
    pub async fn get_person(
        &self,
        id: &str,
        id_type: &str,
        expand: &[ExpandField],
    ) -> Result<RawPersonRecord, PersonFetchError> {
        let path = Self::person_path(id, id_type);
        let expand = Self::expand_param(self.database, expand);
        let query = if expand.is_empty() {
            Vec::new()
        } else {
            vec![("$expand", expand)]
        };
        let value = self.api.get_json(&path, &query).await?;
        serde_json::from_value(value).map_err(|source| PersonFetchError::Decode {
            id: id.to_string(),
            source,
        })
    }
}

#[async_trait]
impl PersonSource for VanPersonSource {
    async fn fetch_person(
        &self,
        id: ContactId,
        expand: &[ExpandField],
    ) -> Result<RawPersonRecord, PersonFetchError> {
        self.get_person(&id.to_string(), "vanid", expand).await
    }
}
