//! JSONL visit export reading

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use glob::glob;
use log::{debug, warn};

use crate::history::aggregator::extract_domain;
use crate::history::models::{VisitEvent, VisitRecord};
use crate::history::sources::{HistoryQuery, HistorySource, SourceError};

/// Error type for reader operations
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("No input files matched: {0}")]
    NoMatches(String),
}

/// Read all visit records from a JSONL file
///
/// Blank lines are ignored; malformed lines and records without a usable
/// URL or timestamp are skipped.
pub fn read_visit_file(path: &Path) -> Result<Vec<VisitRecord>, ReaderError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = match line_result {
            Ok(l) => l,
            Err(e) => {
                debug!("Failed to read line {} in {:?}: {}", line_num, path, e);
                continue;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<VisitRecord>(line) {
            Ok(record) if record.timestamp > 0 && extract_domain(&record.url).is_some() => {
                records.push(record)
            }
            Ok(record) => {
                warn!("Skipping unusable record at line {} in {:?}: {}", line_num, path, record.url);
            }
            Err(e) => {
                debug!("Failed to parse JSON at line {} in {:?}: {}", line_num, path, e);
            }
        }
    }

    Ok(records)
}

/// Expand plain paths and glob patterns into existing files, sorted
pub fn expand_inputs(inputs: &[String]) -> Result<Vec<PathBuf>, ReaderError> {
    let mut files = Vec::new();
    for input in inputs {
        let path = PathBuf::from(input);
        if path.is_file() {
            files.push(path);
            continue;
        }
        let matched: Vec<PathBuf> = glob(input)?.filter_map(Result::ok).filter(|p| p.is_file()).collect();
        if matched.is_empty() {
            return Err(ReaderError::NoMatches(input.clone()));
        }
        files.extend(matched);
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Read several files, logging and skipping the ones that cannot be opened
pub fn read_visit_files(paths: &[PathBuf]) -> Vec<VisitRecord> {
    let mut records = Vec::new();
    for path in paths {
        match read_visit_file(path) {
            Ok(mut file_records) => {
                debug!("Read {} records from {:?}", file_records.len(), path);
                records.append(&mut file_records);
            }
            Err(e) => warn!("Failed to read {:?}: {}", path, e),
        }
    }
    records
}

/// History source backed by exported JSONL files
///
/// Files are re-read on every search; deletions are remembered in memory.
pub struct JsonlHistorySource {
    paths: Vec<PathBuf>,
    deleted: Mutex<HashSet<String>>,
}

impl JsonlHistorySource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            deleted: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_patterns(patterns: &[String]) -> Result<Self, ReaderError> {
        Ok(Self::new(expand_inputs(patterns)?))
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn live_records(&self) -> Result<Vec<VisitRecord>, SourceError> {
        let deleted = self
            .deleted
            .lock()
            .map_err(|_| SourceError::Unavailable("history lock poisoned".to_string()))?;
        let mut records = read_visit_files(&self.paths);
        records.retain(|record| !deleted.contains(&record.url));
        Ok(records)
    }
}

impl HistorySource for JsonlHistorySource {
    fn search(&self, query: &HistoryQuery) -> Result<Vec<VisitRecord>, SourceError> {
        let mut records: Vec<VisitRecord> = self
            .live_records()?
            .into_iter()
            .filter(|record| query.matches(record))
            .collect();
        // newest first, like the browser
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if query.max_results > 0 {
            records.truncate(query.max_results);
        }
        Ok(records)
    }

    fn get_visits(&self, url: &str) -> Result<Vec<VisitEvent>, SourceError> {
        let mut visits: Vec<VisitEvent> = self
            .live_records()?
            .into_iter()
            .filter(|record| record.url == url)
            .enumerate()
            .map(|(index, record)| VisitEvent {
                visit_id: format!("{}-{}", record.timestamp, index),
                visit_time: record.timestamp,
                transition: None,
            })
            .collect();
        visits.sort_by(|a, b| b.visit_time.cmp(&a.visit_time));
        Ok(visits)
    }

    fn delete_url(&self, url: &str) -> Result<(), SourceError> {
        let mut deleted = self
            .deleted
            .lock()
            .map_err(|_| SourceError::Unavailable("history lock poisoned".to_string()))?;
        deleted.insert(url.to_string());
        Ok(())
    }
}
