//! Parquet snapshots of materialized output with a digest manifest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use wikigaps_core::{iso8601, NormalizedRecord, SeedRecord};
use wikigaps_storage::write_atomic;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub generated_at: String,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

fn encode_parquet(batch: RecordBatch) -> Result<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}

fn string_column<'a>(values: impl Iterator<Item = &'a str>) -> StringArray {
    StringArray::from(values.map(Some).collect::<Vec<_>>())
}

fn normalized_batch(rows: &[NormalizedRecord]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("record_key", DataType::Utf8, false),
        ArrowField::new("gender", DataType::Utf8, false),
        ArrowField::new("country", DataType::Utf8, false),
        ArrowField::new("occupation", DataType::Utf8, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(string_column(rows.iter().map(|r| r.record_key.as_str()))),
            Arc::new(string_column(rows.iter().map(|r| r.gender.as_str()))),
            Arc::new(string_column(rows.iter().map(|r| r.country.as_str()))),
            Arc::new(string_column(rows.iter().map(|r| r.occupation.as_str()))),
        ],
    )
    .context("building normalized record batch")
}

fn seed_batch(rows: &[SeedRecord]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("record_key", DataType::Utf8, false),
        ArrowField::new("first_edit_ts", DataType::Utf8, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(string_column(rows.iter().map(|r| r.record_key.as_str()))),
            Arc::new(string_column(rows.iter().map(|r| r.first_edit_ts.as_str()))),
        ],
    )
    .context("building seed record batch")
}

async fn write_snapshot_file(
    dir: &Path,
    name: &str,
    rows: usize,
    bytes: Vec<u8>,
) -> Result<SnapshotFile> {
    let file_name = format!("{name}.parquet");
    let path = dir.join(&file_name);
    write_atomic(&path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(SnapshotFile {
        name: name.to_string(),
        path: file_name,
        rows,
        sha256: hex::encode(Sha256::digest(&bytes)),
        bytes: bytes.len() as u64,
    })
}

/// Write `normalized.parquet`, `seed.parquet` and `manifest.json` into `dir`.
pub async fn export_snapshot(
    dir: &Path,
    generated_at: DateTime<Utc>,
    normalized: &[NormalizedRecord],
    seed: &[SeedRecord],
) -> Result<PathBuf> {
    let normalized_bytes = encode_parquet(normalized_batch(normalized)?)?;
    let seed_bytes = encode_parquet(seed_batch(seed)?)?;

    let manifest = SnapshotManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        generated_at: iso8601::format(&generated_at),
        files: vec![
            write_snapshot_file(dir, "normalized", normalized.len(), normalized_bytes).await?,
            write_snapshot_file(dir, "seed", seed.len(), seed_bytes).await?,
        ],
    };

    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    write_atomic(&manifest_path, &bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parquet::file::reader::{FileReader, SerializedFileReader};

    #[tokio::test]
    async fn manifest_digests_match_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let generated_at = Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap();
        let normalized = vec![NormalizedRecord {
            record_key: "Q1".into(),
            gender: "female".into(),
            country: "France".into(),
            occupation: "painter".into(),
        }];

        let manifest_path = export_snapshot(dir.path(), generated_at, &normalized, &[])
            .await
            .unwrap();

        let manifest: SnapshotManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            let bytes = std::fs::read(dir.path().join(&file.path)).unwrap();
            assert_eq!(hex::encode(Sha256::digest(&bytes)), file.sha256);
        }

        let file = std::fs::File::open(dir.path().join("normalized.parquet")).unwrap();
        let reader = SerializedFileReader::new(file).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 1);
    }
}
