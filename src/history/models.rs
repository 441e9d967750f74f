//! Data models for the history heatmap

use chrono::{DateTime, Local, NaiveDate, TimeZone, Timelike};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Milliseconds since the Unix epoch, as reported by the browser
pub type Timestamp = i64;

/// Date key format used for day buckets (`YYYY-MM-DD`)
pub const DATE_KEY_FORMAT: &str = "%Y-%m-%d";

/// A raw visit record delivered by the history source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitRecord {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(alias = "lastVisitTime", deserialize_with = "deserialize_millis")]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub visit_count: Option<u32>,
    #[serde(default, alias = "favIconUrl")]
    pub favicon_url: Option<String>,
}

impl VisitRecord {
    pub fn new(url: impl Into<String>, title: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            timestamp,
            visit_count: None,
            favicon_url: None,
        }
    }

    pub fn with_visit_count(mut self, visit_count: u32) -> Self {
        self.visit_count = Some(visit_count);
        self
    }

    /// Visits this record contributes; a missing or zero count counts once
    pub fn visit_increment(&self) -> u32 {
        match self.visit_count {
            Some(count) if count > 0 => count,
            _ => 1,
        }
    }
}

/// Browser timestamps arrive as floating point milliseconds
fn deserialize_millis<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Ok(value as Timestamp)
}

/// A single visit event for one URL (used by drill-down "visits" lists)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitEvent {
    pub visit_id: String,
    pub visit_time: Timestamp,
    #[serde(default)]
    pub transition: Option<String>,
}

/// One distinct URL inside a day or hour bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlEntry {
    pub url: String,
    pub title: String,
    pub last_visit: Timestamp,
    pub visit_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_url: Option<String>,
}

impl UrlEntry {
    pub fn from_record(record: &VisitRecord) -> Self {
        Self {
            url: record.url.clone(),
            title: record.title.clone(),
            last_visit: record.timestamp,
            visit_count: record.visit_increment(),
            favicon_url: record.favicon_url.clone(),
        }
    }
}

/// Aggregate container for a day (or an hour, see [`HourBucket`])
///
/// `count` is the sum of the contained `visit_count` values, not the number
/// of entries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayBucket {
    pub count: u32,
    pub urls: Vec<UrlEntry>,
}

/// Hour buckets share the day bucket shape, keyed by `{date}T{HH}`
pub type HourBucket = DayBucket;

impl DayBucket {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// Merge a record into the bucket, matching entries by exact URL string
    pub fn merge_record(&mut self, record: &VisitRecord) {
        let increment = record.visit_increment();
        self.count = self.count.saturating_add(increment);

        match self.urls.iter_mut().find(|entry| entry.url == record.url) {
            Some(entry) => {
                entry.visit_count = entry.visit_count.saturating_add(increment);
                if record.timestamp > entry.last_visit {
                    entry.last_visit = record.timestamp;
                }
                if entry.title.is_empty() && !record.title.is_empty() {
                    entry.title = record.title.clone();
                }
                if entry.favicon_url.is_none() {
                    entry.favicon_url = record.favicon_url.clone();
                }
            }
            None => self.urls.push(UrlEntry::from_record(record)),
        }
    }

    /// Append an already aggregated entry (hour derivation)
    pub fn push_entry(&mut self, entry: &UrlEntry) {
        self.count = self.count.saturating_add(entry.visit_count);
        self.urls.push(entry.clone());
    }

    /// Remove the entry for `url`, returning it and keeping `count` consistent
    pub fn remove_url(&mut self, url: &str) -> Option<UrlEntry> {
        let index = self.urls.iter().position(|entry| entry.url == url)?;
        let entry = self.urls.remove(index);
        self.count = self.count.saturating_sub(entry.visit_count);
        Some(entry)
    }

    pub fn max_last_visit(&self) -> Option<Timestamp> {
        self.urls.iter().map(|entry| entry.last_visit).max()
    }
}

/// Per-domain aggregate: one bucket per local date with activity
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainData {
    pub last_visit: Timestamp,
    pub days: BTreeMap<String, DayBucket>,
}

impl DomainData {
    /// Recompute `last_visit` from the remaining entries
    pub fn refresh_last_visit(&mut self) {
        self.last_visit = self
            .days
            .values()
            .filter_map(DayBucket::max_last_visit)
            .max()
            .unwrap_or(0);
    }

    pub fn total_visits(&self) -> u64 {
        self.days.values().map(|day| day.count as u64).sum()
    }

    pub fn active_days(&self) -> usize {
        self.days.len()
    }
}

/// Domain → aggregate, in first-seen order
pub type HistoryMatrix = IndexMap<String, DomainData>;

/// Domain → hour key → bucket, derived from a [`HistoryMatrix`]
pub type HourMatrix = IndexMap<String, BTreeMap<String, HourBucket>>;

/// Persisted per-URL time record stored under `{hash(url)}:{date}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRecord {
    #[serde(default)]
    pub active: u64,
    #[serde(default)]
    pub open: u64,
}

impl TimeRecord {
    pub fn merge(&mut self, other: &TimeRecord) {
        self.active += other.active;
        self.open += other.open;
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0 && self.open == 0
    }
}

/// Time spent on a URL, summed over all of its time records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlTimeAggregate {
    pub active_seconds: u64,
    pub open_seconds: u64,
    pub active_today_seconds: u64,
    pub open_today_seconds: u64,
}

/// Which axis the grid columns use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Days,
    Hours,
}

/// Row ordering policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    #[default]
    Recent,
    #[serde(alias = "frequency")]
    Popular,
    Alphabetical,
}

/// What "popular" counts in day view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PopularityMetric {
    /// Number of distinct days with activity
    #[default]
    ActiveDays,
    /// Sum of visit counts over all days
    TotalVisits,
}

/// Persisted UI preferences (advisory)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiPrefs {
    #[serde(default)]
    pub view_mode: ViewMode,
    #[serde(default)]
    pub sort_mode: SortMode,
    #[serde(default = "default_domain_column_width")]
    pub domain_column_width: f64,
    #[serde(default)]
    pub panel_heights: BTreeMap<String, f64>,
}

fn default_domain_column_width() -> f64 {
    220.0
}

impl Default for UiPrefs {
    fn default() -> Self {
        Self {
            view_mode: ViewMode::Days,
            sort_mode: SortMode::Recent,
            domain_column_width: default_domain_column_width(),
            panel_heights: BTreeMap::new(),
        }
    }
}

/// Local date-time for a browser timestamp
pub fn local_datetime(timestamp: Timestamp) -> Option<DateTime<Local>> {
    Local.timestamp_millis_opt(timestamp).single()
}

/// Local calendar date for a browser timestamp
pub fn local_date(timestamp: Timestamp) -> Option<NaiveDate> {
    local_datetime(timestamp).map(|dt| dt.date_naive())
}

/// `YYYY-MM-DD` key of the local day containing `timestamp`
pub fn date_key(timestamp: Timestamp) -> Option<String> {
    local_date(timestamp).map(|date| date.format(DATE_KEY_FORMAT).to_string())
}

/// Local hour (0-23) of `timestamp`
pub fn local_hour(timestamp: Timestamp) -> Option<u32> {
    local_datetime(timestamp).map(|dt| dt.hour())
}

/// `{date}T{HH}` key for an hour bucket
pub fn hour_key(date: &str, hour: u32) -> String {
    format!("{}T{:02}", date, hour)
}

/// Date part of a day or hour key
pub fn date_part(key: &str) -> &str {
    key.split('T').next().unwrap_or(key)
}

pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date_part(key), DATE_KEY_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_increment_defaults_to_one() {
        let record = VisitRecord::new("https://a.com/", "", 0);
        assert_eq!(record.visit_increment(), 1);
        assert_eq!(record.clone().with_visit_count(0).visit_increment(), 1);
        assert_eq!(record.with_visit_count(4).visit_increment(), 4);
    }

    #[test]
    fn test_merge_record_counts_visits_not_entries() {
        let mut bucket = DayBucket::default();
        bucket.merge_record(&VisitRecord::new("https://a.com/1", "A1", 100));
        bucket.merge_record(&VisitRecord::new("https://a.com/1", "", 50).with_visit_count(2));

        assert_eq!(bucket.count, 3);
        assert_eq!(bucket.urls.len(), 1);
        assert_eq!(bucket.urls[0].visit_count, 3);
        assert_eq!(bucket.urls[0].last_visit, 100);
        assert_eq!(bucket.urls[0].title, "A1");
    }

    #[test]
    fn test_remove_url_decrements_count() {
        let mut bucket = DayBucket::default();
        bucket.merge_record(&VisitRecord::new("https://a.com/1", "", 1).with_visit_count(3));
        bucket.merge_record(&VisitRecord::new("https://a.com/2", "", 2));

        let removed = bucket.remove_url("https://a.com/1").unwrap();
        assert_eq!(removed.visit_count, 3);
        assert_eq!(bucket.count, 1);
        assert!(bucket.remove_url("https://a.com/missing").is_none());
    }

    #[test]
    fn test_deserialize_browser_record() {
        let json = r#"{"url":"https://a.com/","title":"A","lastVisitTime":1718182800000.5,"visitCount":3}"#;
        let record: VisitRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.timestamp, 1718182800000);
        assert_eq!(record.visit_count, Some(3));
    }

    #[test]
    fn test_hour_key_and_date_part() {
        assert_eq!(hour_key("2024-06-12", 9), "2024-06-12T09");
        assert_eq!(date_part("2024-06-12T09"), "2024-06-12");
        assert_eq!(date_part("2024-06-12"), "2024-06-12");
        assert!(parse_date_key("2024-06-12T23").is_some());
        assert!(parse_date_key("garbage").is_none());
    }
}
