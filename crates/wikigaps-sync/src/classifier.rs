//! Keyword heuristic that flags biography-like records from their category names.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use wikigaps_adapters::CategoryMap;
use wikigaps_core::{CategoryAssignment, DiscoveredRecord};

pub const BUILTIN_RULES_VERSION: u32 = 1;

/// Case-insensitive substrings that mark a category as biographical.
pub const BIO_CATEGORY_KEYWORDS: &[&str] = &[
    "living people",
    "births",
    "deaths",
    "people from",
    "footballers",
    "cricketers",
    "basketball players",
    "ice hockey players",
    "actors",
    "actresses",
    "singers",
    "musicians",
    "rappers",
    "politicians",
    "writers",
    "poets",
    "painters",
    "sculptors",
    "journalists",
    "philanthropists",
    "bishops",
    "saints",
];

#[derive(Debug, Clone, Deserialize)]
struct ClassifierRulesFile {
    version: u32,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub bio_like: BTreeSet<u64>,
    pub rest: BTreeSet<u64>,
    pub assignments: Vec<CategoryAssignment>,
}

impl Classification {
    /// Biography-like records in discovery order.
    pub fn bio_records(&self, records: &[DiscoveredRecord]) -> Vec<DiscoveredRecord> {
        records
            .iter()
            .filter(|r| self.bio_like.contains(&r.record_id))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct BioClassifier {
    version: u32,
    keywords: Vec<String>,
}

impl Default for BioClassifier {
    fn default() -> Self {
        Self::new(BUILTIN_RULES_VERSION, BIO_CATEGORY_KEYWORDS)
    }
}

impl BioClassifier {
    pub fn new<S: AsRef<str>>(version: u32, keywords: impl IntoIterator<Item = S>) -> Self {
        Self {
            version,
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Load a `{ version, keywords }` YAML rules file.
    pub fn from_rules_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let rules: ClassifierRulesFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        if rules.keywords.is_empty() {
            anyhow::bail!("{} defines no keywords", path.display());
        }
        Ok(Self::new(rules.version, rules.keywords))
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn is_bio_like(&self, category: &str) -> bool {
        let category = category.to_lowercase();
        self.keywords.iter().any(|k| category.contains(k.as_str()))
    }

    /// Split `records` into biography-like and the rest. A record without categories
    /// is never biography-like.
    pub fn classify(
        &self,
        records: &[DiscoveredRecord],
        categories: &CategoryMap,
    ) -> Classification {
        let mut classification = Classification::default();
        for record in records {
            let names = categories
                .get(&record.record_id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut any_bio = false;
            for name in names {
                let is_biography_like = self.is_bio_like(name);
                any_bio |= is_biography_like;
                classification.assignments.push(CategoryAssignment {
                    record_id: record.record_id,
                    category_name: name.clone(),
                    is_biography_like,
                });
            }
            if any_bio {
                classification.bio_like.insert(record.record_id);
            } else {
                classification.rest.insert(record.record_id);
            }
        }
        classification
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(id: u64, title: &str) -> DiscoveredRecord {
        DiscoveredRecord {
            record_id: id,
            title: title.to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 10, 3, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn births_are_biographies_rivers_are_not() {
        let records = vec![record(1, "A"), record(2, "B"), record(3, "Seine tributary")];
        let mut categories = CategoryMap::new();
        categories.insert(1, vec!["Category:1990s births".into()]);
        categories.insert(2, vec!["Category:1990s births".into()]);
        categories.insert(3, vec!["Category:Rivers in France".into()]);

        let result = BioClassifier::default().classify(&records, &categories);

        assert_eq!(result.bio_like, BTreeSet::from([1, 2]));
        assert_eq!(result.rest, BTreeSet::from([3]));
        assert_eq!(result.assignments.len(), 3);
        assert!(!result.assignments[2].is_biography_like);
        assert_eq!(result.bio_records(&records).len(), 2);
    }

    #[test]
    fn record_without_categories_is_not_biography_like() {
        let records = vec![record(7, "Orphan")];
        let result = BioClassifier::default().classify(&records, &CategoryMap::new());

        assert!(result.bio_like.is_empty());
        assert_eq!(result.rest, BTreeSet::from([7]));
        assert!(result.assignments.is_empty());
    }

    #[test]
    fn matching_ignores_case_and_any_single_hit_suffices() {
        let classifier = BioClassifier::default();
        assert!(classifier.is_bio_like("Category:LIVING PEOPLE"));
        assert!(classifier.is_bio_like("Category:English Footballers"));
        assert!(!classifier.is_bio_like("Category:Populated places in Kent"));

        let records = vec![record(1, "Mixed")];
        let mut categories = CategoryMap::new();
        categories.insert(
            1,
            vec!["Category:Rivers in France".into(), "Category:French painters".into()],
        );
        let result = classifier.classify(&records, &categories);
        assert!(result.bio_like.contains(&1));
    }

    #[test]
    fn rules_file_replaces_builtin_keywords() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bio_categories.yaml");
        std::fs::write(&path, "version: 2\nkeywords:\n  - Astronauts\n").unwrap();

        let classifier = BioClassifier::from_rules_file(&path).unwrap();

        assert_eq!(classifier.version(), 2);
        assert!(classifier.is_bio_like("Category:American astronauts"));
        assert!(!classifier.is_bio_like("Category:Living people"));
    }

    #[test]
    fn shipped_rules_match_builtin_list() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/bio_keywords.yaml");
        let shipped = BioClassifier::from_rules_file(&path).unwrap();
        let builtin = BioClassifier::default();

        assert_eq!(shipped.version(), builtin.version());
        assert_eq!(shipped.keywords(), builtin.keywords());
    }
}
