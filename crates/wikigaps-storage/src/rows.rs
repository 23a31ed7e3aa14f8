//! Column layouts of the persisted artifacts.

use serde::{Deserialize, Serialize};
use wikigaps_core::{
    join_ids, split_ids, CategoryAssignment, CreationEvent, DiscoveredRecord, EntityAttributes,
    ExternalEntity, NormalizedRecord, SeedRecord,
};

use crate::merge::{CsvRecord, KeyedRecord};

/// `creations` artifact row, keyed on the source record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationRow {
    pub record_key: u64,
    pub first_revision_ts: String,
}

impl CsvRecord for CreationRow {
    const COLUMNS: &'static [&'static str] = &["record_key", "first_revision_ts"];
}

impl KeyedRecord for CreationRow {
    type Key = u64;

    fn key(&self) -> u64 {
        self.record_key
    }
}

impl From<CreationEvent> for CreationRow {
    fn from(event: CreationEvent) -> Self {
        Self {
            record_key: event.record_id,
            first_revision_ts: event.first_revision_ts,
        }
    }
}

impl From<CreationRow> for CreationEvent {
    fn from(row: CreationRow) -> Self {
        Self {
            record_id: row.record_key,
            first_revision_ts: row.first_revision_ts,
        }
    }
}

/// `entities` artifact row. Attribute lists are `|`-joined identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRow {
    pub record_key: u64,
    pub external_id: String,
    pub gender_ids: String,
    pub country_ids: String,
    pub occupation_ids: String,
    pub label: String,
}

impl CsvRecord for EntityRow {
    const COLUMNS: &'static [&'static str] = &[
        "record_key",
        "external_id",
        "gender_ids",
        "country_ids",
        "occupation_ids",
        "label",
    ];
}

impl KeyedRecord for EntityRow {
    type Key = u64;

    fn key(&self) -> u64 {
        self.record_key
    }
}

impl From<ExternalEntity> for EntityRow {
    fn from(entity: ExternalEntity) -> Self {
        let attrs = entity.attributes;
        Self {
            record_key: entity.record_id,
            gender_ids: join_ids(&attrs.gender_ids),
            country_ids: join_ids(&attrs.country_ids),
            occupation_ids: join_ids(&attrs.occupation_ids),
            label: attrs.label.unwrap_or_default(),
            external_id: attrs.external_id,
        }
    }
}

impl From<EntityRow> for ExternalEntity {
    fn from(row: EntityRow) -> Self {
        let label = row.label.trim();
        Self {
            record_id: row.record_key,
            attributes: EntityAttributes {
                external_id: row.external_id.trim().to_string(),
                gender_ids: split_ids(&row.gender_ids),
                country_ids: split_ids(&row.country_ids),
                occupation_ids: split_ids(&row.occupation_ids),
                label: (!label.is_empty()).then(|| label.to_string()),
            },
        }
    }
}

/// `id_labels` cache row. An empty label marks an id the knowledge base could not label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRow {
    pub id: String,
    pub label: String,
}

impl CsvRecord for LabelRow {
    const COLUMNS: &'static [&'static str] = &["id", "label"];
}

impl KeyedRecord for LabelRow {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl CsvRecord for NormalizedRecord {
    const COLUMNS: &'static [&'static str] = &["record_key", "gender", "country", "occupation"];
}

impl CsvRecord for SeedRecord {
    const COLUMNS: &'static [&'static str] = &["record_key", "first_edit_ts"];
}

impl CsvRecord for DiscoveredRecord {
    const COLUMNS: &'static [&'static str] = &["record_id", "title", "created_at"];
}

impl CsvRecord for CategoryAssignment {
    const COLUMNS: &'static [&'static str] = &["record_id", "category_name", "is_biography_like"];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_row_keeps_lists_and_optional_label() {
        let entity = ExternalEntity {
            record_id: 42,
            attributes: EntityAttributes {
                external_id: "Q42".into(),
                gender_ids: vec!["Q6581097".into()],
                country_ids: vec!["Q145".into(), "Q30".into()],
                occupation_ids: vec![],
                label: None,
            },
        };

        let row = EntityRow::from(entity.clone());
        assert_eq!(row.country_ids, "Q145|Q30");
        assert_eq!(row.occupation_ids, "");
        assert_eq!(row.label, "");
        assert_eq!(ExternalEntity::from(row), entity);
    }
}
