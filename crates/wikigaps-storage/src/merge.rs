//! Keyed CSV artifacts merged with last-write-wins semantics.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::debug;

use crate::write_atomic;

/// A row type with a fixed column layout.
pub trait CsvRecord: Serialize + DeserializeOwned {
    const COLUMNS: &'static [&'static str];
}

/// A row type with a natural key used for upserts.
pub trait KeyedRecord: CsvRecord {
    type Key: Eq + Hash;

    fn key(&self) -> Self::Key;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertReport {
    pub existing_rows: usize,
    pub new_rows: usize,
    pub merged_rows: usize,
}

/// Read every row of a CSV artifact; a missing file reads as empty.
pub async fn read_rows<R: CsvRecord>(path: &Path) -> Result<Vec<R>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes.as_slice());
    reader
        .deserialize()
        .collect::<Result<Vec<R>, _>>()
        .with_context(|| format!("parsing {}", path.display()))
}

pub fn encode_rows<R: CsvRecord>(rows: &[R]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!rows.is_empty())
        .from_writer(Vec::new());
    if rows.is_empty() {
        writer.write_record(R::COLUMNS).context("writing csv header")?;
    }
    for row in rows {
        writer.serialize(row).context("serializing csv row")?;
    }
    writer.into_inner().context("flushing csv buffer")
}

/// Replace the artifact at `path` with exactly `rows`.
pub async fn write_rows<R: CsvRecord>(path: &Path, rows: &[R]) -> Result<()> {
    let bytes = encode_rows(rows)?;
    write_atomic(path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// Concatenate `existing` and `incoming`, then keep only the last occurrence of each key.
/// Surviving rows stay at the position of that last occurrence.
pub fn merge_last_wins<R: KeyedRecord>(existing: Vec<R>, incoming: Vec<R>) -> Vec<R> {
    let combined: Vec<R> = existing.into_iter().chain(incoming).collect();
    let mut last_index: HashMap<R::Key, usize> = HashMap::with_capacity(combined.len());
    for (index, row) in combined.iter().enumerate() {
        last_index.insert(row.key(), index);
    }
    combined
        .into_iter()
        .enumerate()
        .filter(|(index, row)| last_index.get(&row.key()) == Some(index))
        .map(|(_, row)| row)
        .collect()
}

/// Insert-or-update `new_rows` into the artifact at `path`, keyed by [`KeyedRecord::key`].
pub async fn upsert<R: KeyedRecord>(path: &Path, new_rows: Vec<R>) -> Result<UpsertReport> {
    let existing = read_rows::<R>(path).await?;
    let existing_rows = existing.len();
    let new_count = new_rows.len();
    let merged = merge_last_wins(existing, new_rows);
    write_rows(path, &merged).await?;
    debug!(
        path = %path.display(),
        existing_rows,
        new_rows = new_count,
        merged_rows = merged.len(),
        "upserted artifact"
    );
    Ok(UpsertReport {
        existing_rows,
        new_rows: new_count,
        merged_rows: merged.len(),
    })
}
