//! Projection of persisted entities and creation events into analysis-ready rows.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::warn;
use wikigaps_core::{
    iso8601, AttributeKind, CreationEvent, ExternalEntity, NormalizedRecord, SeedRecord, UNKNOWN,
};
use wikigaps_storage::select_label;

/// Every attribute id referenced by `entities`, de-duplicated and sorted.
pub fn attribute_ids(entities: &[ExternalEntity]) -> Vec<String> {
    entities
        .iter()
        .flat_map(|e| AttributeKind::ALL.into_iter().flat_map(move |k| e.attributes.ids(k)))
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn or_unknown(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value.to_string()
    }
}

/// One normalized row per entity with a knowledge-base id. Labels come from `labels`
/// using the first-hit rule; gender is lower-cased.
pub fn materialize(
    entities: &[ExternalEntity],
    labels: &HashMap<String, String>,
) -> Vec<NormalizedRecord> {
    entities
        .iter()
        .filter_map(|entity| {
            let record_key = entity.external_id().trim();
            if record_key.is_empty() {
                return None;
            }
            let label = |kind| select_label(entity.attributes.ids(kind), labels);
            Some(NormalizedRecord {
                record_key: record_key.to_string(),
                gender: or_unknown(&label(AttributeKind::Gender).to_lowercase()),
                country: or_unknown(label(AttributeKind::Country)),
                occupation: or_unknown(label(AttributeKind::Occupation)),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedOutcome {
    pub rows: Vec<SeedRecord>,
    pub unmatched: usize,
    pub malformed: usize,
}

/// Join creation events to their entity's knowledge-base id. Events without a linked
/// entity are skipped; unparseable timestamps are dropped and counted.
pub fn seed_records(creations: &[CreationEvent], entities: &[ExternalEntity]) -> SeedOutcome {
    let external_ids: HashMap<u64, &str> = entities
        .iter()
        .map(|e| (e.record_id, e.external_id().trim()))
        .filter(|(_, id)| !id.is_empty())
        .collect();

    let mut outcome = SeedOutcome::default();
    let mut seen = HashSet::new();
    for event in creations {
        let Some(record_key) = external_ids.get(&event.record_id) else {
            outcome.unmatched += 1;
            continue;
        };
        let Some(ts) = iso8601::parse(&event.first_revision_ts) else {
            warn!(
                record_id = event.record_id,
                first_revision_ts = %event.first_revision_ts,
                "dropping seed row with malformed timestamp"
            );
            outcome.malformed += 1;
            continue;
        };
        let row = SeedRecord {
            record_key: record_key.to_string(),
            first_edit_ts: iso8601::format(&ts),
        };
        if seen.insert((row.record_key.clone(), row.first_edit_ts.clone())) {
            outcome.rows.push(row);
        }
    }
    outcome
}
