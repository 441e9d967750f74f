//! Aggregation of raw visit records into the domain × day matrix

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use log::warn;
use url::Url;

use crate::history::models::{
    date_key, date_part, hour_key, local_hour, parse_date_key, DayBucket, DomainData,
    HistoryMatrix, HourMatrix, ViewMode, VisitRecord, DATE_KEY_FORMAT,
};

/// Extract the domain of a URL (`www.` stripped)
///
/// Returns `None` for unparseable URLs and URLs without a host.
pub fn extract_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.trim_end_matches('.');
    if host.is_empty() {
        return None;
    }
    let domain = host.strip_prefix("www.").unwrap_or(host);
    if domain.is_empty() {
        return None;
    }
    Some(domain.to_string())
}

/// `http`/`https` URL with a usable domain
pub fn is_web_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && extract_domain(url).is_some(),
        Err(_) => false,
    }
}

/// Where a record landed in the matrix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub domain: String,
    pub date: String,
    /// The domain had no entry before this record
    pub new_domain: bool,
}

/// Merge one record into the matrix
///
/// Malformed records are skipped with a warning and yield `None`.
pub fn ingest_record(matrix: &mut HistoryMatrix, record: &VisitRecord) -> Option<IngestOutcome> {
    let Some(domain) = extract_domain(&record.url) else {
        warn!("Skipping visit with malformed URL: {:?}", record.url);
        return None;
    };
    let Some(date) = date_key(record.timestamp) else {
        warn!(
            "Skipping visit with out-of-range timestamp {} for {}",
            record.timestamp, record.url
        );
        return None;
    };

    let new_domain = !matrix.contains_key(&domain);
    let data = matrix.entry(domain.clone()).or_insert_with(DomainData::default);
    data.days.entry(date.clone()).or_default().merge_record(record);
    if record.timestamp > data.last_visit {
        data.last_visit = record.timestamp;
    }

    Some(IngestOutcome {
        domain,
        date,
        new_domain,
    })
}

/// Build a matrix from scratch; domains keep first-seen order
pub fn build_matrix<'a, I>(records: I) -> HistoryMatrix
where
    I: IntoIterator<Item = &'a VisitRecord>,
{
    let mut matrix = HistoryMatrix::new();
    let mut skipped = 0usize;
    for record in records {
        if ingest_record(&mut matrix, record).is_none() {
            skipped += 1;
        }
    }
    if skipped > 0 {
        log::info!("Skipped {} malformed visit records during full build", skipped);
    }
    matrix
}

/// Re-bucket every URL entry into the local hour of its `last_visit`
///
/// With `date` set only that day is derived.
pub fn organize_by_hour(matrix: &HistoryMatrix, date: Option<&str>) -> HourMatrix {
    let mut hours = HourMatrix::new();
    for (domain, data) in matrix {
        let buckets = derive_domain_hours(data, date);
        if !buckets.is_empty() {
            hours.insert(domain.clone(), buckets);
        }
    }
    hours
}

fn derive_domain_hours(data: &DomainData, date: Option<&str>) -> BTreeMap<String, DayBucket> {
    let mut buckets: BTreeMap<String, DayBucket> = BTreeMap::new();
    for (day, bucket) in &data.days {
        if date.is_some_and(|d| d != day.as_str()) {
            continue;
        }
        for entry in &bucket.urls {
            let Some(hour) = local_hour(entry.last_visit) else {
                continue;
            };
            buckets.entry(hour_key(day, hour)).or_default().push_entry(entry);
        }
    }
    buckets
}

/// Replace the hour buckets of one date with a fresh derivation
pub fn rederive_hours_for_date(hours: &mut HourMatrix, matrix: &HistoryMatrix, date: &str) {
    for buckets in hours.values_mut() {
        buckets.retain(|key, _| date_part(key) != date);
    }

    for (domain, data) in matrix {
        if !data.days.contains_key(date) {
            continue;
        }
        let fresh = derive_domain_hours(data, Some(date));
        if fresh.is_empty() {
            continue;
        }
        hours.entry(domain.clone()).or_default().extend(fresh);
    }

    hours.retain(|_, buckets| !buckets.is_empty());
}

/// Result of a deletion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Visits subtracted from bucket counts
    pub removed_visits: u32,
    /// Number of URL entries removed
    pub removed_entries: usize,
    /// Dates whose day bucket disappeared
    pub pruned_dates: Vec<String>,
    /// The domain itself was pruned
    pub domain_removed: bool,
}

impl DeleteOutcome {
    pub fn is_empty(&self) -> bool {
        self.removed_entries == 0
    }
}

/// Remove `url` from the bucket at `key` (a date or an hour key)
///
/// The day bucket and, when present, the hour bucket are both patched; empty
/// buckets and domains are pruned bottom-up.
pub fn delete_url(
    matrix: &mut HistoryMatrix,
    mut hours: Option<&mut HourMatrix>,
    domain: &str,
    key: &str,
    url: &str,
) -> DeleteOutcome {
    let date = date_part(key).to_string();
    let mut outcome = DeleteOutcome::default();

    let Some(data) = matrix.get_mut(domain) else {
        return outcome;
    };
    let Some(bucket) = data.days.get_mut(&date) else {
        return outcome;
    };
    // an hour key only matches the entry whose last visit falls in that hour
    if key != date {
        let in_hour = bucket
            .urls
            .iter()
            .find(|entry| entry.url == url)
            .and_then(|entry| local_hour(entry.last_visit))
            .is_some_and(|hour| hour_key(&date, hour) == key);
        if !in_hour {
            return outcome;
        }
    }
    let Some(entry) = bucket.remove_url(url) else {
        return outcome;
    };

    outcome.removed_visits = entry.visit_count;
    outcome.removed_entries = 1;

    if bucket.is_empty() {
        data.days.remove(&date);
        outcome.pruned_dates.push(date.clone());
    }
    data.refresh_last_visit();

    if data.days.is_empty() {
        matrix.shift_remove(domain);
        outcome.domain_removed = true;
    }

    if let Some(hours) = hours.as_deref_mut() {
        if let Some(hour) = local_hour(entry.last_visit) {
            remove_from_hours(hours, domain, &hour_key(&date, hour), url);
        }
    }

    outcome
}

fn remove_from_hours(hours: &mut HourMatrix, domain: &str, key: &str, url: &str) {
    let Some(buckets) = hours.get_mut(domain) else {
        return;
    };
    if let Some(bucket) = buckets.get_mut(key) {
        bucket.remove_url(url);
        if bucket.is_empty() {
            buckets.remove(key);
        }
    }
    if buckets.is_empty() {
        hours.shift_remove(domain);
    }
}

/// Remove every entry of `url` across all days of its domain
pub fn delete_url_everywhere(
    matrix: &mut HistoryMatrix,
    mut hours: Option<&mut HourMatrix>,
    url: &str,
) -> DeleteOutcome {
    let mut total = DeleteOutcome::default();
    let Some(domain) = extract_domain(url) else {
        return total;
    };
    let dates: Vec<String> = match matrix.get(&domain) {
        Some(data) => data
            .days
            .iter()
            .filter(|(_, bucket)| bucket.urls.iter().any(|e| e.url == url))
            .map(|(date, _)| date.clone())
            .collect(),
        None => return total,
    };

    for date in dates {
        let outcome = delete_url(matrix, hours.as_deref_mut(), &domain, &date, url);
        total.removed_visits += outcome.removed_visits;
        total.removed_entries += outcome.removed_entries;
        total.pruned_dates.extend(outcome.pruned_dates);
        total.domain_removed |= outcome.domain_removed;
    }
    total
}

/// Remove a whole domain from both matrices
pub fn delete_domain(
    matrix: &mut HistoryMatrix,
    hours: Option<&mut HourMatrix>,
    domain: &str,
) -> Option<DomainData> {
    if let Some(hours) = hours {
        hours.shift_remove(domain);
    }
    matrix.shift_remove(domain)
}

/// Contiguous range of local dates forming the grid's column axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Range from the oldest visit to max(today, newest visit)
    pub fn covering(matrix: &HistoryMatrix, today: NaiveDate) -> Self {
        let mut start = today;
        let mut end = today;
        for data in matrix.values() {
            for key in data.days.keys() {
                if let Some(date) = parse_date_key(key) {
                    start = start.min(date);
                    end = end.max(date);
                }
            }
        }
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn contains_key(&self, key: &str) -> bool {
        parse_date_key(key).is_some_and(|date| self.contains(date))
    }

    /// Grow the range to include `date`, returning whether it changed
    pub fn extend_to(&mut self, date: NaiveDate) -> bool {
        if self.contains(date) {
            return false;
        }
        self.start = self.start.min(date);
        self.end = self.end.max(date);
        true
    }

    pub fn num_days(&self) -> usize {
        ((self.end - self.start).num_days() + 1).max(0) as usize
    }

    /// Ascending date keys
    pub fn dates(&self) -> Vec<String> {
        (0..self.num_days() as i64)
            .map(|offset| {
                (self.start + Duration::days(offset))
                    .format(DATE_KEY_FORMAT)
                    .to_string()
            })
            .collect()
    }

    pub fn num_columns(&self, view: ViewMode) -> usize {
        match view {
            ViewMode::Days => self.num_days(),
            ViewMode::Hours => self.num_days() * 24,
        }
    }

    /// Key of the column at `index` without building the whole axis
    pub fn column_key(&self, view: ViewMode, index: usize) -> Option<String> {
        if index >= self.num_columns(view) {
            return None;
        }
        let (offset, hour) = match view {
            ViewMode::Days => (index, None),
            ViewMode::Hours => (index / 24, Some((index % 24) as u32)),
        };
        let date = (self.start + Duration::days(offset as i64))
            .format(DATE_KEY_FORMAT)
            .to_string();
        Some(match hour {
            Some(hour) => hour_key(&date, hour),
            None => date,
        })
    }

    /// Column keys for a view mode: dates, or 24 hour keys per date
    pub fn columns(&self, view: ViewMode) -> Vec<String> {
        match view {
            ViewMode::Days => self.dates(),
            ViewMode::Hours => self
                .dates()
                .iter()
                .flat_map(|date| (0..24).map(move |hour| hour_key(date, hour)))
                .collect(),
        }
    }
}
