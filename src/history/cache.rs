//! Grid store: live aggregate state plus incremental deltas

use std::collections::HashSet;
use std::ops::Range;
use std::time::Instant;

use chrono::NaiveDate;
use serde::Serialize;

use crate::history::aggregator::{
    build_matrix, delete_domain, delete_url, delete_url_everywhere, ingest_record, organize_by_hour,
    rederive_hours_for_date, DateRange, DeleteOutcome,
};
use crate::history::color::{color_for, DomainColors};
use crate::history::kv::{load_json, store_json, KeyValueStore, StorageError, DOMAIN_COLORS_KEY};
use crate::history::models::{
    date_part, hour_key, local_hour, parse_date_key, DayBucket, HistoryMatrix, HourMatrix,
    UrlEntry, ViewMode, VisitRecord,
};
use crate::history::sort::{SortFilterIndex, SortRequest};
use crate::history::window::{
    build_flat_rows, FlatRow, GroupedList, GroupedListWindow, RowHeights, VirtualState,
};

/// What changed after a load or mutation, pushed to the UI
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridDelta {
    /// Whether there are actual data changes
    pub has_changes: bool,
    /// Whether the UI should rebuild everything
    pub full_refresh: bool,
    /// The column axis must be regenerated
    pub date_range_changed: bool,
    /// Domains whose rows changed
    pub updated_domains: Vec<String>,
    /// Domains whose rows disappeared
    pub removed_domains: Vec<String>,
    pub generation: u64,
}

impl GridDelta {
    pub fn unchanged(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridCell {
    pub col: usize,
    pub key: String,
    pub count: u32,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridRow {
    pub row: usize,
    pub domain: String,
    pub base_color: String,
    pub bookmarked: bool,
    /// Row-local maximum used for color quantization
    pub max_count: u32,
    pub cells: Vec<GridCell>,
}

/// Materialized part of the grid for one window state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSlice {
    pub state: VirtualState,
    pub total_rows: usize,
    pub total_cols: usize,
    pub columns: Vec<String>,
    pub rows: Vec<GridRow>,
    pub generation: u64,
}

/// Drill-down target
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(tag = "scope", rename_all = "camelCase")]
pub enum DrillDownScope {
    /// One cell: a date or `{date}T{HH}` key
    Cell { domain: String, key: String },
    /// Every day of a domain, grouped by date
    Domain { domain: String },
    /// Every domain on a date, grouped by domain
    Day { date: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillDownItem {
    pub group: String,
    pub entry: UrlEntry,
}

/// URL list of a drill-down view with its flattened grouped rows
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillDown {
    pub items: Vec<DrillDownItem>,
    pub rows: Vec<FlatRow>,
    pub total_visits: u64,
}

impl DrillDown {
    fn from_items(items: Vec<DrillDownItem>, collapsed: &HashSet<String>) -> Self {
        let rows = build_flat_rows(&items, |item| item.group.clone(), collapsed);
        let total_visits = items.iter().map(|item| item.entry.visit_count as u64).sum();
        Self {
            items,
            rows,
            total_visits,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Rows of `list` in `range`, each item row carrying its entry
    pub fn page(&self, list: &GroupedList, range: Range<usize>) -> DrillDownPage {
        let rows = list.rows()[range.clone()]
            .iter()
            .enumerate()
            .map(|(i, row)| PageRow {
                top: list.offset_of(range.start + i),
                item: match row {
                    FlatRow::Item { index, .. } => self.items.get(*index).cloned(),
                    FlatRow::Header { .. } => None,
                },
                row: row.clone(),
            })
            .collect();
        DrillDownPage {
            start: range.start,
            end: range.end,
            total_items: self.items.len(),
            total_visits: self.total_visits,
            rows,
        }
    }
}

/// One realized row of a drill-down page
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRow {
    /// Top offset in pixels
    pub top: f64,
    #[serde(flatten)]
    pub row: FlatRow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<DrillDownItem>,
}

/// Visible rows `[start, end)` of a drill-down list
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillDownPage {
    pub start: usize,
    pub end: usize,
    pub total_items: usize,
    pub total_visits: u64,
    pub rows: Vec<PageRow>,
}

/// Drill-down list windowed by scroll position
///
/// Rebuilt when the grid generation, scope or collapsed groups change.
#[derive(Debug, Clone)]
pub struct DrillDownWindow {
    generation: u64,
    scope: DrillDownScope,
    collapsed: HashSet<String>,
    view: DrillDown,
    window: GroupedListWindow,
}

impl DrillDownWindow {
    pub fn new(
        generation: u64,
        scope: DrillDownScope,
        collapsed: HashSet<String>,
        view: DrillDown,
        heights: RowHeights,
        buffer: usize,
    ) -> Self {
        let list = GroupedList::new(view.rows.clone(), heights);
        Self {
            generation,
            scope,
            collapsed,
            view,
            window: GroupedListWindow::new(list, buffer),
        }
    }

    /// Whether this window still shows `scope` for `generation`
    pub fn shows(&self, generation: u64, scope: &DrillDownScope, collapsed: &HashSet<String>) -> bool {
        self.generation == generation && &self.scope == scope && &self.collapsed == collapsed
    }

    pub fn total_rows(&self) -> usize {
        self.window.list().len()
    }

    pub fn total_height(&self) -> f64 {
        self.window.list().total_height()
    }

    pub fn materializations(&self) -> u64 {
        self.window.materializations()
    }

    /// Visible page, or `None` while the visible range is unchanged
    pub fn update(&mut self, scroll_top: f64, viewport_height: f64, force: bool) -> Option<DrillDownPage> {
        let range = self.window.update(scroll_top, viewport_height, force)?;
        Some(self.view.page(self.window.list(), range))
    }
}

fn newest_first(entries: &mut [UrlEntry]) {
    entries.sort_by(|a, b| b.last_visit.cmp(&a.last_visit));
}

/// Entries of a day bucket falling into `key` (a date or an hour key)
fn entries_for_key(bucket: &DayBucket, date: &str, key: &str) -> Vec<UrlEntry> {
    if key == date {
        return bucket.urls.clone();
    }
    bucket
        .urls
        .iter()
        .filter(|entry| local_hour(entry.last_visit).map(|hour| hour_key(date, hour)).as_deref() == Some(key))
        .cloned()
        .collect()
}

/// Live grid state
///
/// Holds the day matrix, the hour matrix while the hour view is active, the
/// domain colors, the date range and the memoized ordering. Every mutation
/// bumps `generation`.
#[derive(Debug, Default)]
pub struct GridCache {
    matrix: HistoryMatrix,
    hours: Option<HourMatrix>,
    colors: DomainColors,
    colors_dirty: bool,
    range: Option<DateRange>,
    view: ViewMode,
    sort: SortFilterIndex,
    bookmarked: HashSet<String>,
    generation: u64,
    last_full_load: Option<Instant>,
}

impl GridCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view
    }

    pub fn matrix(&self) -> &HistoryMatrix {
        &self.matrix
    }

    pub fn hours(&self) -> Option<&HourMatrix> {
        self.hours.as_ref()
    }

    pub fn colors(&self) -> &DomainColors {
        &self.colors
    }

    pub fn date_range(&self) -> Option<DateRange> {
        self.range
    }

    /// Seconds since the last full load
    pub fn seconds_since_full_load(&self) -> Option<u64> {
        self.last_full_load.map(|t| t.elapsed().as_secs())
    }

    /// Restore persisted colors; a read failure keeps the current ones
    pub fn load_colors(&mut self, store: &dyn KeyValueStore) {
        match load_json::<DomainColors, _>(store, DOMAIN_COLORS_KEY) {
            Ok(Some(colors)) => {
                self.colors = colors;
                self.colors_dirty = false;
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to load domain colors: {}", e),
        }
    }

    /// Write colors when new ones were assigned since the last save
    pub fn persist_colors(&mut self, store: &dyn KeyValueStore) -> Result<bool, StorageError> {
        if !self.colors_dirty {
            return Ok(false);
        }
        store_json(store, DOMAIN_COLORS_KEY, &self.colors)?;
        self.colors_dirty = false;
        Ok(true)
    }

    pub fn set_bookmarked_domains(&mut self, domains: HashSet<String>) {
        if self.bookmarked != domains {
            self.bookmarked = domains;
            self.bump();
        }
    }

    fn bump(&mut self) {
        self.generation += 1;
    }

    fn assign_color(&mut self, domain: &str) {
        if self.colors.ensure(domain) {
            self.colors_dirty = true;
        }
    }

    /// Rebuild everything from a full history scan
    pub fn full_load(&mut self, records: &[VisitRecord], today: NaiveDate) -> GridDelta {
        self.matrix = build_matrix(records);
        let domains: Vec<String> = self.matrix.keys().cloned().collect();
        for domain in &domains {
            self.assign_color(domain);
        }

        self.range = Some(DateRange::covering(&self.matrix, today));
        if self.view == ViewMode::Hours {
            self.hours = Some(organize_by_hour(&self.matrix, None));
        }
        self.sort.invalidate();
        self.bump();
        self.last_full_load = Some(Instant::now());

        log::info!(
            "Full load: {} records into {} domains",
            records.len(),
            self.matrix.len()
        );

        GridDelta {
            has_changes: true,
            full_refresh: true,
            date_range_changed: true,
            updated_domains: domains,
            removed_domains: Vec::new(),
            generation: self.generation,
        }
    }

    /// Apply one new visit to the live structure
    pub fn handle_new_visit(&mut self, record: &VisitRecord, today: NaiveDate) -> GridDelta {
        let Some(outcome) = ingest_record(&mut self.matrix, record) else {
            return GridDelta::unchanged(self.generation);
        };
        self.assign_color(&outcome.domain);

        let date_range_changed = match (self.range, parse_date_key(&outcome.date)) {
            (Some(mut range), Some(date)) => {
                let grew = range.extend_to(date);
                let grew = range.extend_to(today) || grew;
                self.range = Some(range);
                grew
            }
            _ => {
                self.range = Some(DateRange::covering(&self.matrix, today));
                true
            }
        };

        if let Some(hours) = self.hours.as_mut() {
            rederive_hours_for_date(hours, &self.matrix, &outcome.date);
        }
        self.bump();

        GridDelta {
            has_changes: true,
            full_refresh: false,
            date_range_changed,
            updated_domains: vec![outcome.domain],
            removed_domains: Vec::new(),
            generation: self.generation,
        }
    }

    /// Extend the range at midnight rollover; returns whether it changed
    pub fn refresh_today(&mut self, today: NaiveDate) -> bool {
        let changed = match &mut self.range {
            Some(range) => range.extend_to(today),
            None => false,
        };
        if changed {
            self.bump();
        }
        changed
    }

    fn deletion_delta(&mut self, domain: &str, outcome: DeleteOutcome) -> GridDelta {
        if outcome.is_empty() {
            return GridDelta::unchanged(self.generation);
        }
        self.bump();
        let (updated_domains, removed_domains) = if outcome.domain_removed {
            (Vec::new(), vec![domain.to_string()])
        } else {
            (vec![domain.to_string()], Vec::new())
        };
        GridDelta {
            has_changes: true,
            full_refresh: false,
            date_range_changed: false,
            updated_domains,
            removed_domains,
            generation: self.generation,
        }
    }

    /// Remove `url` from one bucket (date or hour key)
    pub fn delete_url(&mut self, domain: &str, key: &str, url: &str) -> GridDelta {
        let outcome = delete_url(&mut self.matrix, self.hours.as_mut(), domain, key, url);
        self.deletion_delta(domain, outcome)
    }

    /// Remove `url` from every bucket of its domain
    pub fn delete_url_everywhere(&mut self, url: &str) -> GridDelta {
        let Some(domain) = crate::history::aggregator::extract_domain(url) else {
            return GridDelta::unchanged(self.generation);
        };
        let outcome = delete_url_everywhere(&mut self.matrix, self.hours.as_mut(), url);
        self.deletion_delta(&domain, outcome)
    }

    /// Remove a whole domain; returns its former URLs for the history source
    pub fn delete_domain(&mut self, domain: &str) -> (GridDelta, Vec<String>) {
        let Some(data) = delete_domain(&mut self.matrix, self.hours.as_mut(), domain) else {
            return (GridDelta::unchanged(self.generation), Vec::new());
        };
        let mut urls: Vec<String> = data
            .days
            .values()
            .flat_map(|bucket| bucket.urls.iter().map(|entry| entry.url.clone()))
            .collect();
        urls.sort();
        urls.dedup();

        self.bump();
        let delta = GridDelta {
            has_changes: true,
            full_refresh: false,
            date_range_changed: false,
            updated_domains: Vec::new(),
            removed_domains: vec![domain.to_string()],
            generation: self.generation,
        };
        (delta, urls)
    }

    /// Switch between day and hour columns, re-deriving hour buckets
    pub fn set_view_mode(&mut self, view: ViewMode) -> bool {
        if self.view == view {
            return false;
        }
        self.view = view;
        self.hours = match view {
            ViewMode::Hours => Some(organize_by_hour(&self.matrix, None)),
            ViewMode::Days => None,
        };
        self.bump();
        true
    }

    /// Ordered, filtered domain keys (memoized per generation and request)
    pub fn ordered_domains(&mut self, request: &SortRequest) -> &[String] {
        let request = SortRequest {
            view: self.view,
            ..request.clone()
        };
        self.sort
            .get(self.generation, &request, &self.matrix, self.hours.as_ref())
    }

    /// Column keys of the current view
    pub fn columns(&self) -> Vec<String> {
        match &self.range {
            Some(range) => range.columns(self.view),
            None => Vec::new(),
        }
    }

    /// Number of columns in the current view
    pub fn column_count(&self) -> usize {
        self.range.map_or(0, |range| range.num_columns(self.view))
    }

    /// Count of `domain` in column `key`
    pub fn cell_count(&self, domain: &str, key: &str) -> u32 {
        match (self.view, &self.hours) {
            (ViewMode::Hours, Some(hours)) => hours
                .get(domain)
                .and_then(|buckets| buckets.get(key))
                .map(|bucket| bucket.count)
                .unwrap_or(0),
            _ => self
                .matrix
                .get(domain)
                .and_then(|data| data.days.get(key))
                .map(|bucket| bucket.count)
                .unwrap_or(0),
        }
    }

    /// Row-local maximum, at least 1
    pub fn row_max(&self, domain: &str) -> u32 {
        let max = match (self.view, &self.hours) {
            (ViewMode::Hours, Some(hours)) => hours
                .get(domain)
                .and_then(|buckets| buckets.values().map(|b| b.count).max()),
            _ => self
                .matrix
                .get(domain)
                .and_then(|data| data.days.values().map(|b| b.count).max()),
        };
        max.unwrap_or(0).max(1)
    }

    /// Cells inside `state`, colored by the domain's hue and row maximum
    pub fn grid_slice(&mut self, request: &SortRequest, state: &VirtualState) -> GridSlice {
        let domains = self.ordered_domains(request).to_vec();
        let total_cols = self.column_count();

        let rows_range = state.start_row.min(domains.len())..state.end_row.min(domains.len());
        let cols_range = state.start_col.min(total_cols)..state.end_col.min(total_cols);
        let columns: Vec<String> = match self.range {
            Some(range) => cols_range
                .clone()
                .filter_map(|col| range.column_key(self.view, col))
                .collect(),
            None => Vec::new(),
        };

        let rows = rows_range
            .map(|row| {
                let domain = &domains[row];
                let base_color = self.colors.color_of(domain);
                let max_count = self.row_max(domain);
                let cells = cols_range
                    .clone()
                    .zip(&columns)
                    .map(|(col, key)| {
                        let count = self.cell_count(domain, key);
                        GridCell {
                            col,
                            key: key.clone(),
                            count,
                            color: color_for(count, max_count, &base_color),
                        }
                    })
                    .collect();
                GridRow {
                    row,
                    domain: domain.clone(),
                    bookmarked: self.bookmarked.contains(domain),
                    base_color,
                    max_count,
                    cells,
                }
            })
            .collect();

        GridSlice {
            state: *state,
            total_rows: domains.len(),
            total_cols,
            columns,
            rows,
            generation: self.generation,
        }
    }

    /// URL list for a drill-down view, newest first within each group
    pub fn drill_down(&self, scope: &DrillDownScope, collapsed: &HashSet<String>) -> DrillDown {
        let items = match scope {
            DrillDownScope::Cell { domain, key } => self.cell_items(domain, key),
            DrillDownScope::Domain { domain } => self.domain_items(domain),
            DrillDownScope::Day { date } => self.day_items(date),
        };
        DrillDown::from_items(items, collapsed)
    }

    fn cell_items(&self, domain: &str, key: &str) -> Vec<DrillDownItem> {
        let date = date_part(key);
        let Some(bucket) = self.matrix.get(domain).and_then(|data| data.days.get(date)) else {
            return Vec::new();
        };
        let mut entries = entries_for_key(bucket, date, key);
        newest_first(&mut entries);
        entries
            .into_iter()
            .map(|entry| DrillDownItem {
                group: key.to_string(),
                entry,
            })
            .collect()
    }

    fn domain_items(&self, domain: &str) -> Vec<DrillDownItem> {
        let Some(data) = self.matrix.get(domain) else {
            return Vec::new();
        };
        data.days
            .iter()
            .rev()
            .flat_map(|(date, bucket)| {
                let mut entries = bucket.urls.clone();
                newest_first(&mut entries);
                entries.into_iter().map(move |entry| DrillDownItem {
                    group: date.clone(),
                    entry,
                })
            })
            .collect()
    }

    fn day_items(&self, date: &str) -> Vec<DrillDownItem> {
        let mut groups: Vec<(&String, Vec<UrlEntry>)> = self
            .matrix
            .iter()
            .filter_map(|(domain, data)| {
                data.days.get(date).map(|bucket| {
                    let mut entries = bucket.urls.clone();
                    newest_first(&mut entries);
                    (domain, entries)
                })
            })
            .collect();
        // most recently active domain first
        groups.sort_by_key(|(_, entries)| {
            std::cmp::Reverse(entries.first().map(|e| e.last_visit).unwrap_or(0))
        });

        groups
            .into_iter()
            .flat_map(|(domain, entries)| {
                entries.into_iter().map(move |entry| DrillDownItem {
                    group: domain.clone(),
                    entry,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::kv::MemoryKvStore;
    use crate::history::models::{PopularityMetric, SortMode};
    use crate::history::window::{VirtualWindow, Viewport, WindowConfig};
    use chrono::{Local, TimeZone};

    fn ts(day: u32, hour: u32, minute: u32) -> i64 {
        Local
            .with_ymd_and_hms(2024, 6, day, hour, minute, 0)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 14).unwrap()
    }

    fn recent() -> SortRequest {
        SortRequest::new(SortMode::Recent, ViewMode::Days, PopularityMetric::ActiveDays, None)
    }

    fn loaded() -> GridCache {
        let mut cache = GridCache::new();
        cache.full_load(
            &[
                VisitRecord::new("https://a.com/1", "A1", ts(12, 9, 0)),
                VisitRecord::new("https://a.com/1", "A1", ts(12, 9, 5)),
                VisitRecord::new("https://b.com/x", "BX", ts(12, 10, 0)),
                VisitRecord::new("https://b.com/y", "BY", ts(13, 8, 0)).with_visit_count(4),
            ],
            today(),
        );
        cache
    }

    #[test]
    fn test_full_load_builds_range_and_colors() {
        let cache = loaded();
        assert_eq!(cache.matrix().len(), 2);
        assert_eq!(cache.colors().len(), 2);
        let range = cache.date_range().unwrap();
        assert_eq!(range.num_days(), 3);
        assert_eq!(cache.columns(), vec!["2024-06-12", "2024-06-13", "2024-06-14"]);
    }

    #[test]
    fn test_new_visit_outside_range_flags_change() {
        let mut cache = loaded();
        let inside = cache.handle_new_visit(&VisitRecord::new("https://c.com/", "", ts(13, 12, 0)), today());
        assert!(inside.has_changes);
        assert!(!inside.date_range_changed);
        assert_eq!(inside.updated_domains, vec!["c.com"]);

        let before = cache.handle_new_visit(&VisitRecord::new("https://c.com/", "", ts(10, 12, 0)), today());
        assert!(before.date_range_changed);
        assert_eq!(cache.columns().first().unwrap(), "2024-06-10");
    }

    #[test]
    fn test_malformed_visit_is_not_a_change() {
        let mut cache = loaded();
        let generation = cache.generation();
        let delta = cache.handle_new_visit(&VisitRecord::new("::nope::", "", ts(12, 1, 0)), today());
        assert!(!delta.has_changes);
        assert_eq!(cache.generation(), generation);
    }

    #[test]
    fn test_incremental_matches_full_rebuild() {
        let records = vec![
            VisitRecord::new("https://a.com/1", "", ts(12, 9, 0)),
            VisitRecord::new("https://a.com/1", "", ts(12, 9, 5)),
        ];
        let mut full = GridCache::new();
        full.full_load(&records, today());

        let mut incremental = GridCache::new();
        incremental.full_load(&records[..1], today());
        incremental.handle_new_visit(&records[1], today());

        assert_eq!(full.matrix(), incremental.matrix());
    }

    #[test]
    fn test_hour_view_tracks_new_visits() {
        let mut cache = loaded();
        assert!(cache.set_view_mode(ViewMode::Hours));
        assert_eq!(cache.columns().len(), 3 * 24);
        assert_eq!(cache.cell_count("b.com", "2024-06-13T08"), 4);

        cache.handle_new_visit(&VisitRecord::new("https://b.com/z", "", ts(13, 8, 30)), today());
        assert_eq!(cache.cell_count("b.com", "2024-06-13T08"), 5);

        cache.delete_url("b.com", "2024-06-13T08", "https://b.com/y");
        assert_eq!(cache.cell_count("b.com", "2024-06-13T08"), 1);
        assert_eq!(cache.cell_count("b.com", "2024-06-13"), 0);

        assert!(cache.set_view_mode(ViewMode::Days));
        assert!(cache.hours().is_none());
        assert_eq!(cache.cell_count("b.com", "2024-06-13"), 1);
    }

    #[test]
    fn test_delete_last_url_removes_domain() {
        let mut cache = loaded();
        let delta = cache.delete_url("a.com", "2024-06-12", "https://a.com/1");
        assert_eq!(delta.removed_domains, vec!["a.com"]);
        assert!(!cache.matrix().contains_key("a.com"));

        let noop = cache.delete_url("a.com", "2024-06-12", "https://a.com/1");
        assert!(!noop.has_changes);
    }

    #[test]
    fn test_delete_domain_returns_urls() {
        let mut cache = loaded();
        let (delta, urls) = cache.delete_domain("b.com");
        assert!(delta.has_changes);
        assert_eq!(urls, vec!["https://b.com/x", "https://b.com/y"]);
        assert_eq!(cache.ordered_domains(&recent()), ["a.com".to_string()]);
    }

    #[test]
    fn test_ordering_is_memoized_until_mutation() {
        let mut cache = loaded();
        assert_eq!(cache.ordered_domains(&recent()), ["b.com".to_string(), "a.com".to_string()]);
        cache.ordered_domains(&recent());
        assert_eq!(cache.sort.recomputations(), 1);

        cache.handle_new_visit(&VisitRecord::new("https://a.com/2", "", ts(14, 7, 0)), today());
        assert_eq!(cache.ordered_domains(&recent())[0], "a.com");
        assert_eq!(cache.sort.recomputations(), 2);
    }

    #[test]
    fn test_grid_slice_colors_visible_cells() {
        let mut cache = loaded();
        let mut window = VirtualWindow::new(WindowConfig::new(20.0, 30.0, 0, 0));
        let rows = cache.ordered_domains(&recent()).len();
        let cols = cache.column_count();
        let state = window.update(&Viewport::new(0.0, 0.0, 20.0, 60.0), rows, cols, false).unwrap();

        let slice = cache.grid_slice(&recent(), &state);
        assert_eq!(slice.total_rows, 2);
        assert_eq!(slice.rows.len(), 1);
        assert_eq!(slice.columns, vec!["2024-06-12", "2024-06-13"]);

        let row = &slice.rows[0];
        assert_eq!(row.domain, "b.com");
        assert_eq!(row.max_count, 4);
        assert_eq!(row.cells[0].count, 1);
        assert!(row.cells[1].color.ends_with("58%, 60%)"));
    }

    #[test]
    fn test_grid_slice_builds_only_visible_column_keys() {
        let mut cache = GridCache::new();
        cache.full_load(
            &[
                VisitRecord::new("https://old.com/", "", ts(1, 0, 0) - 2 * 365 * 86_400_000),
                VisitRecord::new("https://b.com/y", "", ts(13, 8, 0)),
            ],
            today(),
        );
        cache.set_view_mode(ViewMode::Hours);
        let total = cache.column_count();
        assert!(total > 700 * 24);

        let start_col = total - 24 * 2 + 8;
        let state = VirtualState {
            start_row: 0,
            end_row: 2,
            start_col,
            end_col: start_col + 3,
            viewport_height: 40.0,
            viewport_width: 90.0,
        };
        let slice = cache.grid_slice(&recent(), &state);
        assert_eq!(slice.total_cols, total);
        assert_eq!(slice.columns, vec!["2024-06-13T08", "2024-06-13T09", "2024-06-13T10"]);
        assert_eq!(slice.columns, cache.columns()[start_col..start_col + 3].to_vec());

        let b = slice.rows.iter().find(|row| row.domain == "b.com").unwrap();
        assert_eq!(b.cells.len(), 3);
        assert_eq!(b.cells[0].col, start_col);
        assert_eq!(b.cells[0].count, 1);

        let past_end = VirtualState { start_col: total - 1, end_col: total + 50, ..state };
        assert_eq!(cache.grid_slice(&recent(), &past_end).columns, vec!["2024-06-14T23"]);
    }

    #[test]
    fn test_drill_down_window_realizes_visible_rows() {
        let records: Vec<VisitRecord> = (0..200)
            .map(|i| VisitRecord::new(&format!("https://a.com/{}", i), "", ts(12, 9, 0) + i * 1000))
            .collect();
        let mut cache = GridCache::new();
        cache.full_load(&records, today());
        let scope = DrillDownScope::Domain { domain: "a.com".into() };
        let collapsed = HashSet::new();
        let view = cache.drill_down(&scope, &collapsed);
        let heights = RowHeights { header: 30.0, item: 40.0 };
        let mut window = DrillDownWindow::new(cache.generation(), scope.clone(), collapsed.clone(), view, heights, 2);

        assert_eq!(window.total_rows(), 201);
        assert_eq!(window.total_height(), 30.0 + 200.0 * 40.0);
        assert!(window.shows(cache.generation(), &scope, &collapsed));
        assert!(!window.shows(cache.generation() + 1, &scope, &collapsed));

        // header plus rows 1..=10 intersect 0..400, then 2 buffer rows
        let page = window.update(0.0, 400.0, false).unwrap();
        assert_eq!((page.start, page.end), (0, 13));
        assert_eq!(page.rows.len(), 13);
        assert_eq!(page.total_items, 200);
        assert!(page.rows[0].row.is_header());
        assert!(page.rows[0].item.is_none());
        assert_eq!(page.rows[1].top, 30.0);
        assert_eq!(page.rows[1].item.as_ref().unwrap().entry.url, "https://a.com/199");

        assert!(window.update(0.0, 400.0, false).is_none());
        let page = window.update(4000.0, 400.0, false).unwrap();
        assert!(page.start > 90 && page.end < 115);
        assert_eq!(window.materializations(), 2);

        let json = serde_json::to_value(&page.rows[0]).unwrap();
        assert_eq!(json["kind"], "item");
        assert!(json["item"]["entry"]["url"].is_string());
    }

    #[test]
    fn test_drill_down_scopes() {
        let cache = loaded();
        let collapsed = HashSet::new();

        let cell = cache.drill_down(
            &DrillDownScope::Cell { domain: "a.com".into(), key: "2024-06-12".into() },
            &collapsed,
        );
        assert_eq!(cell.items.len(), 1);
        assert_eq!(cell.items[0].entry.visit_count, 2);
        assert_eq!(cell.items[0].entry.last_visit, ts(12, 9, 5));

        let domain = cache.drill_down(&DrillDownScope::Domain { domain: "b.com".into() }, &collapsed);
        assert_eq!(domain.items[0].group, "2024-06-13");
        assert_eq!(domain.rows.iter().filter(|r| r.is_header()).count(), 2);
        assert_eq!(domain.total_visits, 5);

        let day = cache.drill_down(&DrillDownScope::Day { date: "2024-06-12".into() }, &collapsed);
        assert_eq!(day.items[0].group, "b.com");

        let folded: HashSet<String> = ["b.com".to_string()].into_iter().collect();
        let day = cache.drill_down(&DrillDownScope::Day { date: "2024-06-12".into() }, &folded);
        // header + header + one a.com item
        assert_eq!(day.rows.len(), 3);

        let hour = cache.drill_down(
            &DrillDownScope::Cell { domain: "b.com".into(), key: "2024-06-12T10".into() },
            &collapsed,
        );
        assert_eq!(hour.items.len(), 1);
        assert!(cache
            .drill_down(&DrillDownScope::Cell { domain: "b.com".into(), key: "2024-06-12T11".into() }, &collapsed)
            .is_empty());
    }

    #[test]
    fn test_colors_persist_once() {
        let store = MemoryKvStore::new();
        let mut cache = loaded();
        assert!(cache.persist_colors(&store).unwrap());
        assert!(!cache.persist_colors(&store).unwrap());

        let mut restored = GridCache::new();
        restored.load_colors(&store);
        assert_eq!(restored.colors(), cache.colors());
    }
}
