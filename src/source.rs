//! Loading raw records and table snapshots from local files.
//!
//! Batch files hold change records either as one JSON array or as JSON lines.
//! Table snapshots are CSV with a header row, or JSON lines of trip rows.
//! Any of them may be gzip-compressed, signalled by a `.gz` extension.

use crate::decoder::RawRecord;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

fn is_gzip(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

/// Extension of the payload, looking through a trailing `.gz`.
fn payload_extension(path: &Path) -> Option<String> {
    let inner = if is_gzip(path) {
        Path::new(path.file_stem()?)
    } else {
        path
    };
    inner
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn open(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = BufReader::new(file);
    Ok(if is_gzip(path) {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    })
}

fn read_text(path: &Path) -> Result<String> {
    let mut text = String::new();
    open(path)?
        .read_to_string(&mut text)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(text)
}

/// Parses a JSON array or JSON lines document into values of `T`.
fn parse_json_values<T: serde::de::DeserializeOwned>(text: &str, origin: &Path) -> Result<Vec<T>> {
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(text)
            .with_context(|| format!("parsing JSON array in {}", origin.display()));
    }
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parsing {} line {}", origin.display(), n + 1))
        })
        .collect()
}

/// Loads the change records of one batch file, in file order.
pub fn load_records(path: &Path) -> Result<Vec<RawRecord>> {
    let records: Vec<RawRecord> = parse_json_values(&read_text(path)?, path)?;
    debug!(path = %path.display(), records = records.len(), "Batch file loaded");
    Ok(records)
}

/// Batch files in `dir`, sorted by file name.
pub fn list_batch_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if matches!(
            payload_extension(&path).as_deref(),
            Some("json" | "jsonl" | "ndjson")
        ) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Groups records by partition, keeping source order, and cuts each
/// partition's stream into batches of at most `batch_size` records.
pub fn split_batches(
    records: impl IntoIterator<Item = RawRecord>,
    batch_size: usize,
) -> BTreeMap<String, Vec<Vec<RawRecord>>> {
    let batch_size = batch_size.max(1);
    let mut partitions: BTreeMap<String, Vec<Vec<RawRecord>>> = BTreeMap::new();
    for record in records {
        let batches = partitions.entry(record.partition.clone()).or_default();
        match batches.last_mut() {
            Some(batch) if batch.len() < batch_size => batch.push(record),
            _ => batches.push(vec![record]),
        }
    }
    partitions
}

/// Loads the rows of a full table snapshot.
///
/// CSV values arrive as strings; the decoder accepts numeric strings, so rows
/// from either format aggregate identically.
pub fn load_table_rows(path: &Path) -> Result<Vec<Map<String, Value>>> {
    if payload_extension(path).as_deref() == Some("csv") {
        let mut reader = csv::Reader::from_reader(open(path)?);
        let headers = reader
            .headers()
            .with_context(|| format!("reading CSV header of {}", path.display()))?
            .clone();
        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result.with_context(|| format!("reading {}", path.display()))?;
            let row: Map<String, Value> = headers
                .iter()
                .zip(record.iter())
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect();
            rows.push(row);
        }
        return Ok(rows);
    }
    parse_json_values(&read_text(path)?, path)
}
