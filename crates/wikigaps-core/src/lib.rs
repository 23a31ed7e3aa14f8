//! Core domain model for the wikigaps collection pipeline.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "wikigaps-core";

/// Sentinel used wherever a label or attribute value cannot be determined.
pub const UNKNOWN: &str = "unknown";

/// Separator for identifier lists stored in a single CSV cell.
pub const ID_LIST_SEPARATOR: char = '|';

/// Watermark used when no checkpoint has ever been written.
pub fn project_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// ISO-8601 UTC timestamps as exchanged with the remote APIs and written to artifacts.
pub mod iso8601 {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.format(FORMAT).to_string()
    }

    /// Lenient parse: RFC 3339 with any offset, or a naive date-time taken as UTC.
    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid ISO-8601 timestamp `{raw}`")))
    }
}

/// Process-wide collection watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "iso8601")]
    pub last_run_ts: DateTime<Utc>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            last_run_ts: project_start(),
        }
    }
}

/// A newly created record reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredRecord {
    pub record_id: u64,
    pub title: String,
    #[serde(with = "iso8601")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryAssignment {
    pub record_id: u64,
    pub category_name: String,
    pub is_biography_like: bool,
}

/// Link between a source record and its knowledge-base identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedId {
    pub record_id: u64,
    pub external_id: String,
}

/// Tracked knowledge-base properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Gender,
    Country,
    Occupation,
}

impl AttributeKind {
    pub const ALL: [AttributeKind; 3] = [Self::Gender, Self::Country, Self::Occupation];

    pub fn property_id(self) -> &'static str {
        match self {
            Self::Gender => "P21",
            Self::Country => "P27",
            Self::Occupation => "P106",
        }
    }
}

/// Claim lists for one knowledge-base entity, as returned by the attribute lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityAttributes {
    pub external_id: String,
    pub gender_ids: Vec<String>,
    pub country_ids: Vec<String>,
    pub occupation_ids: Vec<String>,
    pub label: Option<String>,
}

impl EntityAttributes {
    pub fn ids(&self, kind: AttributeKind) -> &[String] {
        match kind {
            AttributeKind::Gender => &self.gender_ids,
            AttributeKind::Country => &self.country_ids,
            AttributeKind::Occupation => &self.occupation_ids,
        }
    }

    pub fn ids_mut(&mut self, kind: AttributeKind) -> &mut Vec<String> {
        match kind {
            AttributeKind::Gender => &mut self.gender_ids,
            AttributeKind::Country => &mut self.country_ids,
            AttributeKind::Occupation => &mut self.occupation_ids,
        }
    }
}

/// Enriched entity keyed by the source record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEntity {
    pub record_id: u64,
    pub attributes: EntityAttributes,
}

impl ExternalEntity {
    pub fn external_id(&self) -> &str {
        &self.attributes.external_id
    }
}

/// Timestamp of the oldest revision of a record. The raw API value is kept so that
/// re-materialization can apply its own parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationEvent {
    pub record_id: u64,
    pub first_revision_ts: String,
}

/// Analysis-ready row: one label per tracked attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub record_key: String,
    pub gender: String,
    pub country: String,
    pub occupation: String,
}

/// Creation date keyed by knowledge-base identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRecord {
    pub record_key: String,
    pub first_edit_ts: String,
}

pub fn join_ids(ids: &[String]) -> String {
    ids.join(&ID_LIST_SEPARATOR.to_string())
}

pub fn split_ids(cell: &str) -> Vec<String> {
    cell.split(ID_LIST_SEPARATOR)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_serializes_with_z_suffix() {
        let json = serde_json::to_string(&Checkpoint::default()).unwrap();
        assert_eq!(json, r#"{"last_run_ts":"2025-01-01T00:00:00Z"}"#);
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Checkpoint::default());
    }

    #[test]
    fn lenient_parse_accepts_offsets_and_naive_values() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(iso8601::parse("2024-01-01T12:00:00Z"), Some(expected));
        assert_eq!(iso8601::parse("2024-01-01T13:00:00+01:00"), Some(expected));
        assert_eq!(iso8601::parse("2024-01-01 12:00:00"), Some(expected));
        assert_eq!(iso8601::parse("not a date"), None);
        assert_eq!(iso8601::parse(""), None);
    }

    #[test]
    fn id_lists_survive_a_csv_cell() {
        let ids = vec!["Q30".to_string(), "Q145".to_string()];
        assert_eq!(join_ids(&ids), "Q30|Q145");
        assert_eq!(split_ids("Q30| Q145|"), ids);
        assert!(split_ids("").is_empty());
    }
}
