//! Per-URL active/open time accounting

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::history::aggregator::is_web_url as is_trackable;
use crate::history::kv::{KeyValueStore, StorageError, ValueMap};
use crate::history::models::{
    date_key, parse_date_key, TimeRecord, Timestamp, UrlTimeAggregate, DATE_KEY_FORMAT,
};

/// Stable short hash of a URL used in time record keys
pub fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..8])
}

/// Store key of the time record for `url` on `date`
pub fn time_record_key(url: &str, date: &str) -> String {
    format!("{}:{}", url_hash(url), date)
}

/// Accumulates seconds per (url, date) between flushes
#[derive(Debug, Clone)]
pub struct TimeTracker {
    max_gap_ms: i64,
    active_url: Option<String>,
    open_urls: BTreeSet<String>,
    pending: BTreeMap<(String, String), TimeRecord>,
    last_tick: Option<Timestamp>,
}

impl TimeTracker {
    pub fn new(max_gap_secs: u64) -> Self {
        Self {
            max_gap_ms: (max_gap_secs as i64).saturating_mul(1000),
            active_url: None,
            open_urls: BTreeSet::new(),
            pending: BTreeMap::new(),
            last_tick: None,
        }
    }

    pub fn active_url(&self) -> Option<&str> {
        self.active_url.as_deref()
    }

    pub fn open_urls(&self) -> impl Iterator<Item = &str> {
        self.open_urls.iter().map(String::as_str)
    }

    /// Focus moved to `url` (or to nothing trackable)
    pub fn set_active(&mut self, url: Option<&str>) {
        self.active_url = url.filter(|url| is_trackable(url)).map(str::to_string);
    }

    /// Replace the open set with the URLs of all current tabs
    pub fn set_open_urls<'a, I>(&mut self, urls: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.open_urls = urls
            .into_iter()
            .filter(|url| is_trackable(url))
            .map(str::to_string)
            .collect();
    }

    pub fn add_open(&mut self, url: &str) {
        if is_trackable(url) {
            self.open_urls.insert(url.to_string());
        }
    }

    pub fn remove_open(&mut self, url: &str) {
        self.open_urls.remove(url);
        if self.active_url.as_deref() == Some(url) {
            self.active_url = None;
        }
    }

    /// Attribute the time since the previous tick
    ///
    /// Gaps longer than the max gap (sleep, suspended host) or non-positive
    /// gaps are discarded. Sub-second remainders carry over to the next tick.
    /// Returns the number of seconds attributed.
    pub fn tick(&mut self, now: Timestamp) -> u64 {
        let Some(last) = self.last_tick else {
            self.last_tick = Some(now);
            return 0;
        };

        let elapsed_ms = now - last;
        if elapsed_ms <= 0 || elapsed_ms > self.max_gap_ms {
            if elapsed_ms > self.max_gap_ms {
                log::debug!("Discarding {} ms tick gap", elapsed_ms);
            }
            self.last_tick = Some(now);
            return 0;
        }

        let seconds = (elapsed_ms / 1000) as u64;
        if seconds == 0 {
            return 0;
        }
        self.last_tick = Some(last + seconds as i64 * 1000);

        let Some(date) = date_key(now) else {
            return 0;
        };

        if let Some(active) = &self.active_url {
            self.pending
                .entry((active.clone(), date.clone()))
                .or_default()
                .active += seconds;
        }
        for url in &self.open_urls {
            if self.active_url.as_ref() == Some(url) {
                continue;
            }
            self.pending
                .entry((url.clone(), date.clone()))
                .or_default()
                .open += seconds;
        }

        seconds
    }

    /// Unflushed seconds for `url` on `date`
    pub fn pending_for(&self, url: &str, date: &str) -> TimeRecord {
        self.pending
            .get(&(url.to_string(), date.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Merge pending seconds into the store and clear them
    ///
    /// Stored records are added to, never overwritten. On a storage error the
    /// pending set is kept for the next flush.
    pub fn flush(&mut self, store: &dyn KeyValueStore) -> Result<usize, StorageError> {
        let mut merged: BTreeMap<String, TimeRecord> = BTreeMap::new();
        for ((url, date), record) in &self.pending {
            if record.is_empty() {
                continue;
            }
            merged
                .entry(time_record_key(url, date))
                .or_default()
                .merge(record);
        }
        if merged.is_empty() {
            self.pending.clear();
            return Ok(0);
        }

        let keys: Vec<&str> = merged.keys().map(String::as_str).collect();
        let existing = store.get(&keys)?;

        let mut values = ValueMap::new();
        for (key, mut record) in merged {
            if let Some(stored) = existing.get(&key).and_then(parse_record) {
                record.merge(&stored);
            }
            values.insert(key, serde_json::to_value(record)?);
        }

        let written = values.len();
        store.set(values)?;
        self.pending.clear();
        log::debug!("Flushed {} time records", written);
        Ok(written)
    }

    /// Stored totals for `url` plus whatever has not been flushed yet
    pub fn time_data(
        &self,
        store: &dyn KeyValueStore,
        url: &str,
        today: NaiveDate,
    ) -> Result<UrlTimeAggregate, StorageError> {
        let mut aggregate = url_time_aggregate(store, url, today)?;
        let today_key = today.format(DATE_KEY_FORMAT).to_string();
        for ((pending_url, date), record) in &self.pending {
            if pending_url != url {
                continue;
            }
            aggregate.active_seconds += record.active;
            aggregate.open_seconds += record.open;
            if *date == today_key {
                aggregate.active_today_seconds += record.active;
                aggregate.open_today_seconds += record.open;
            }
        }
        Ok(aggregate)
    }
}

fn parse_record(value: &Value) -> Option<TimeRecord> {
    match serde_json::from_value(value.clone()) {
        Ok(record) => Some(record),
        Err(e) => {
            log::debug!("Skipping malformed time record: {}", e);
            None
        }
    }
}

/// Sum every `{hash(url)}:{date}` record of `url`
///
/// The `today` fields only count records dated `today`.
pub fn url_time_aggregate(
    store: &dyn KeyValueStore,
    url: &str,
    today: NaiveDate,
) -> Result<UrlTimeAggregate, StorageError> {
    let prefix = format!("{}:", url_hash(url));
    let mut aggregate = UrlTimeAggregate::default();

    for (key, value) in store.scan_prefix(&prefix)? {
        let Some(record) = parse_record(&value) else {
            continue;
        };
        aggregate.active_seconds += record.active;
        aggregate.open_seconds += record.open;

        let is_today = key
            .strip_prefix(&prefix)
            .and_then(parse_date_key)
            .map(|date| date == today)
            .unwrap_or(false);
        if is_today {
            aggregate.active_today_seconds += record.active;
            aggregate.open_today_seconds += record.open;
        }
    }

    Ok(aggregate)
}
