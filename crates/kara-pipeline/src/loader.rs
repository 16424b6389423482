use std::path::{Path, PathBuf};

use anyhow::Context;
use kara_core::{ErrorKind, NewRawRecord, UnitFailure};
use kara_storage::{RawRecordSink, BATCH_FILE_NAME};
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tracing::{error, info, warn};

/// Records parsed from a set of JSON files, ready for a single insert.
#[derive(Debug, Clone, Default)]
pub struct CollectedRecords {
    pub records: Vec<NewRawRecord>,
    pub files_seen: usize,
    pub files_loaded: usize,
    pub failures: Vec<UnitFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub files_seen: usize,
    pub files_loaded: usize,
    pub rows_inserted: u64,
    pub failures: Vec<UnitFailure>,
}

/// Channel a file belongs to: its stem, or the parent directory for data lake batches.
pub fn channel_for_file(path: &Path) -> String {
    let is_batch = path.file_name().is_some_and(|name| name == BATCH_FILE_NAME);
    let source = if is_batch {
        path.parent().and_then(Path::file_name)
    } else {
        path.file_stem()
    };
    source
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Every `*.json` file below `dir`, sorted by path. Hidden entries are ignored.
pub async fn find_json_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current)
            .await
            .with_context(|| format!("reading {}", current.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

pub async fn collect_raw_records(dir: &Path, expected: usize) -> anyhow::Result<CollectedRecords> {
    let files = find_json_files(dir).await?;
    info!(dir = %dir.display(), files = files.len(), "scanning raw import directory");
    Ok(collect_from_files(&files, expected).await)
}

/// Parses each file into staging records. A top-level array yields one record per
/// element; any other value yields one record. Unreadable files are skipped.
pub async fn collect_from_files(files: &[PathBuf], expected: usize) -> CollectedRecords {
    let mut collected = CollectedRecords {
        files_seen: files.len(),
        ..CollectedRecords::default()
    };

    if files.len() != expected {
        warn!(
            kind = %ErrorKind::ConfigurationMismatch,
            expected,
            found = files.len(),
            "unexpected number of JSON files"
        );
    }

    for path in files {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let unit = path.display().to_string();

        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(file = %unit, error = %err, "could not read file");
                collected
                    .failures
                    .push(UnitFailure::new(ErrorKind::Parse, unit, err));
                continue;
            }
        };
        let value: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                error!(file = %unit, error = %err, "invalid JSON, skipping file");
                collected
                    .failures
                    .push(UnitFailure::new(ErrorKind::Parse, unit, err));
                continue;
            }
        };

        let channel_name = channel_for_file(path);
        let before = collected.records.len();
        let rows = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        collected
            .records
            .extend(rows.into_iter().map(|json_data| NewRawRecord {
                json_data,
                file_name: file_name.clone(),
                channel_name: channel_name.clone(),
            }));
        collected.files_loaded += 1;
        info!(
            file = %unit,
            channel = %channel_name,
            rows = collected.records.len() - before,
            "parsed file"
        );
    }
    collected
}

pub async fn load_raw_directory(
    sink: &dyn RawRecordSink,
    dir: &Path,
    expected: usize,
) -> anyhow::Result<LoadSummary> {
    let collected = collect_raw_records(dir, expected).await?;
    insert_collected(sink, collected).await
}

pub async fn load_raw_files(
    sink: &dyn RawRecordSink,
    files: &[PathBuf],
    expected: usize,
) -> anyhow::Result<LoadSummary> {
    let collected = collect_from_files(files, expected).await;
    insert_collected(sink, collected).await
}

async fn insert_collected(
    sink: &dyn RawRecordSink,
    collected: CollectedRecords,
) -> anyhow::Result<LoadSummary> {
    let rows_inserted = if collected.records.is_empty() {
        0
    } else {
        sink.insert_raw_records(&collected.records)
            .await
            .context("inserting raw records")?
    };
    info!(
        files = collected.files_loaded,
        rows = rows_inserted,
        skipped = collected.failures.len(),
        "raw load committed"
    );
    Ok(LoadSummary {
        files_seen: collected.files_seen,
        files_loaded: collected.files_loaded,
        rows_inserted,
        failures: collected.failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kara_storage::MemoryStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, value: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create dir");
        }
        std::fs::write(&path, value).expect("write file");
        path
    }

    #[tokio::test]
    async fn single_object_and_arrays_yield_one_row_per_record() {
        let dir = tempdir().expect("tempdir");
        write(dir.path(), "Chemed123.json", r#"{"message_id": 1, "text": "Paracetamol"}"#);
        write(
            dir.path(),
            "lobelia4cosmetics.json",
            &json!([{"message_id": 1}, {"message_id": 2}, {"message_id": 3}]).to_string(),
        );
        write(
            dir.path(),
            "tikvahpharma.json",
            &json!([{"message_id": 10}, {"message_id": 11}]).to_string(),
        );

        let store = MemoryStore::new();
        let summary = load_raw_directory(&store, dir.path(), 3).await.expect("load directory");
        assert_eq!(summary.files_loaded, 3);
        assert_eq!(summary.rows_inserted, 1 + 3 + 2);

        let rows = store.raw_records().await;
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0].channel_name, "Chemed123");
        assert_eq!(rows[0].file_name, "Chemed123.json");
        assert_eq!(rows[0].json_data["text"], "Paracetamol");
        assert!(rows[1..4].iter().all(|r| r.channel_name == "lobelia4cosmetics"));
        assert!(rows[4..].iter().all(|r| r.file_name == "tikvahpharma.json"));
    }

    #[tokio::test]
    async fn malformed_file_is_skipped_and_reported() {
        let dir = tempdir().expect("tempdir");
        write(dir.path(), "a.json", "[1, 2]");
        write(dir.path(), "b.json", "{\"broken\": ");
        write(dir.path(), "c.json", "\"lonely string\"");

        let store = MemoryStore::new();
        let summary = load_raw_directory(&store, dir.path(), 3).await.expect("load directory");
        assert_eq!(summary.files_seen, 3);
        assert_eq!(summary.files_loaded, 2);
        assert_eq!(summary.rows_inserted, 3);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].kind, ErrorKind::Parse);
        assert!(summary.failures[0].unit.ends_with("b.json"));
    }

    #[tokio::test]
    async fn file_count_mismatch_still_loads() {
        let dir = tempdir().expect("tempdir");
        write(dir.path(), "only.json", "{}");
        write(dir.path(), "notes.txt", "ignored");

        let store = MemoryStore::new();
        let summary = load_raw_directory(&store, dir.path(), 3).await.expect("load directory");
        assert_eq!(summary.files_seen, 1);
        assert_eq!(summary.rows_inserted, 1);
        assert!(summary.failures.is_empty());
    }

    #[tokio::test]
    async fn data_lake_batches_take_channel_from_directory() {
        let dir = tempdir().expect("tempdir");
        write(dir.path(), "2025-01-18/Chemed123/messages.json", "[{}, {}]");
        write(dir.path(), "2025-01-18/Chemed123/.tmp.json", "[{}]");

        let files = find_json_files(dir.path()).await.expect("find json files");
        assert_eq!(files.len(), 1);

        let store = MemoryStore::new();
        let summary = load_raw_files(&store, &files, 1).await.expect("load raw files");
        assert_eq!(summary.rows_inserted, 2);
        let rows = store.raw_records().await;
        assert_eq!(rows[0].channel_name, "Chemed123");
        assert_eq!(rows[0].file_name, "messages.json");
    }

    #[tokio::test]
    async fn unreachable_store_fails_the_load() {
        let dir = tempdir().expect("tempdir");
        write(dir.path(), "a.json", "{}");
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(load_raw_directory(&store, dir.path(), 1).await.is_err());
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let store = MemoryStore::new();
        assert!(load_raw_directory(&store, &dir.path().join("absent"), 3).await.is_err());
    }
}
