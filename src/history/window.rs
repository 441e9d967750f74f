//! Viewport windowing for the heatmap grid and long drill-down lists
//!
//! Only rows and columns inside the visible range (plus a buffer) are
//! materialized. A re-materialization fires only when the computed bounds
//! change or the caller forces one after a structural change.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::history::config::AppConfig;

/// Fixed geometry of the grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowConfig {
    pub row_height: f64,
    pub col_width: f64,
    pub row_buffer: usize,
    pub col_buffer: usize,
}

impl WindowConfig {
    pub fn new(row_height: f64, col_width: f64, row_buffer: usize, col_buffer: usize) -> Self {
        Self {
            row_height: positive_or(row_height, 1.0),
            col_width: positive_or(col_width, 1.0),
            row_buffer,
            col_buffer,
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::new(config.row_height, config.col_width, config.row_buffer, config.col_buffer)
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

fn positive_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Scroll offsets and viewport size supplied on every scroll/resize
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub scroll_top: f64,
    pub scroll_left: f64,
    pub height: f64,
    pub width: f64,
}

impl Viewport {
    pub fn new(scroll_top: f64, scroll_left: f64, height: f64, width: f64) -> Self {
        Self {
            scroll_top,
            scroll_left,
            height,
            width,
        }
    }
}

/// Index ranges to materialize, `[start, end)` on both axes
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualState {
    pub start_row: usize,
    pub end_row: usize,
    pub start_col: usize,
    pub end_col: usize,
    pub viewport_height: f64,
    pub viewport_width: f64,
}

impl VirtualState {
    pub fn same_bounds(&self, other: &VirtualState) -> bool {
        self.start_row == other.start_row
            && self.end_row == other.end_row
            && self.start_col == other.start_col
            && self.end_col == other.end_col
    }

    pub fn rows(&self) -> Range<usize> {
        self.start_row..self.end_row
    }

    pub fn cols(&self) -> Range<usize> {
        self.start_col..self.end_col
    }

    pub fn cell_count(&self) -> usize {
        self.rows().len() * self.cols().len()
    }
}

/// `[start, end)` of the items of size `size` intersecting `[offset, offset + extent)`
fn axis_range(offset: f64, extent: f64, size: f64, buffer: usize, total: usize) -> Range<usize> {
    let offset = non_negative(offset);
    let extent = non_negative(extent);

    let first = (offset / size).floor() as usize;
    let last = ((offset + extent) / size).ceil() as usize;

    let end = last.saturating_add(buffer).min(total);
    let start = first.saturating_sub(buffer).min(end);
    start..end
}

/// Pure window computation
pub fn compute_window(
    config: &WindowConfig,
    viewport: &Viewport,
    total_rows: usize,
    total_cols: usize,
) -> VirtualState {
    let rows = axis_range(
        viewport.scroll_top,
        viewport.height,
        config.row_height,
        config.row_buffer,
        total_rows,
    );
    let cols = axis_range(
        viewport.scroll_left,
        viewport.width,
        config.col_width,
        config.col_buffer,
        total_cols,
    );

    VirtualState {
        start_row: rows.start,
        end_row: rows.end,
        start_col: cols.start,
        end_col: cols.end,
        viewport_height: non_negative(viewport.height),
        viewport_width: non_negative(viewport.width),
    }
}

/// Stateful window with change detection
#[derive(Debug, Clone)]
pub struct VirtualWindow {
    config: WindowConfig,
    current: Option<VirtualState>,
    materializations: u64,
}

impl VirtualWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            current: None,
            materializations: 0,
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Last computed state
    pub fn current(&self) -> Option<&VirtualState> {
        self.current.as_ref()
    }

    /// Number of re-materializations requested so far
    pub fn materializations(&self) -> u64 {
        self.materializations
    }

    /// Scrollable content size `(height, width)`
    pub fn content_size(&self, total_rows: usize, total_cols: usize) -> (f64, f64) {
        (
            total_rows as f64 * self.config.row_height,
            total_cols as f64 * self.config.col_width,
        )
    }

    /// Recompute the window
    ///
    /// Returns the new state when the bounds changed (or `force` is set), and
    /// `None` when the caller can keep what is already materialized.
    pub fn update(
        &mut self,
        viewport: &Viewport,
        total_rows: usize,
        total_cols: usize,
        force: bool,
    ) -> Option<VirtualState> {
        let next = compute_window(&self.config, viewport, total_rows, total_cols);
        let changed = match &self.current {
            Some(current) => !current.same_bounds(&next),
            None => true,
        };
        self.current = Some(next);

        if changed || force {
            self.materializations += 1;
            Some(next)
        } else {
            None
        }
    }

    /// Like [`update`](Self::update), invoking `render` only on change
    pub fn update_with<F>(
        &mut self,
        viewport: &Viewport,
        total_rows: usize,
        total_cols: usize,
        force: bool,
        render: F,
    ) -> bool
    where
        F: FnOnce(&VirtualState),
    {
        match self.update(viewport, total_rows, total_cols, force) {
            Some(state) => {
                render(&state);
                true
            }
            None => false,
        }
    }

    /// Forget the last state so the next update materializes
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// One row of a grouped drill-down list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FlatRow {
    Header {
        group: String,
        item_count: usize,
        collapsed: bool,
    },
    Item {
        group: String,
        /// Index into the source item slice
        index: usize,
    },
}

impl FlatRow {
    pub fn is_header(&self) -> bool {
        matches!(self, FlatRow::Header { .. })
    }

    pub fn group(&self) -> &str {
        match self {
            FlatRow::Header { group, .. } | FlatRow::Item { group, .. } => group,
        }
    }
}

/// Interleave group headers with item rows
///
/// Counts are computed first; a header is emitted whenever the group key
/// changes from the previous item; items of collapsed groups are skipped.
pub fn build_flat_rows<T, F>(items: &[T], group_of: F, collapsed: &HashSet<String>) -> Vec<FlatRow>
where
    F: Fn(&T) -> String,
{
    let groups: Vec<String> = items.iter().map(&group_of).collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for group in &groups {
        *counts.entry(group.as_str()).or_insert(0) += 1;
    }

    let mut rows = Vec::with_capacity(items.len() + counts.len());
    let mut previous: Option<&str> = None;
    for (index, group) in groups.iter().enumerate() {
        let is_collapsed = collapsed.contains(group);
        if previous != Some(group.as_str()) {
            rows.push(FlatRow::Header {
                group: group.clone(),
                item_count: counts.get(group.as_str()).copied().unwrap_or(0),
                collapsed: is_collapsed,
            });
            previous = Some(group.as_str());
        }
        if !is_collapsed {
            rows.push(FlatRow::Item {
                group: group.clone(),
                index,
            });
        }
    }
    rows
}

/// Row heights by kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowHeights {
    pub header: f64,
    pub item: f64,
}

impl Default for RowHeights {
    fn default() -> Self {
        Self {
            header: 32.0,
            item: 44.0,
        }
    }
}

impl RowHeights {
    fn of(&self, row: &FlatRow) -> f64 {
        if row.is_header() {
            self.header
        } else {
            self.item
        }
    }
}

/// Flat rows with precomputed offsets
#[derive(Debug, Clone, Default)]
pub struct GroupedList {
    rows: Vec<FlatRow>,
    offsets: Vec<f64>,
    total_height: f64,
}

impl GroupedList {
    pub fn new(rows: Vec<FlatRow>, heights: RowHeights) -> Self {
        let heights = RowHeights {
            header: positive_or(heights.header, 1.0),
            item: positive_or(heights.item, 1.0),
        };
        let mut offsets = Vec::with_capacity(rows.len());
        let mut total_height = 0.0;
        for row in &rows {
            offsets.push(total_height);
            total_height += heights.of(row);
        }
        Self {
            rows,
            offsets,
            total_height,
        }
    }

    pub fn rows(&self) -> &[FlatRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sum of all row heights
    pub fn total_height(&self) -> f64 {
        self.total_height
    }

    /// Top offset of row `index`
    pub fn offset_of(&self, index: usize) -> f64 {
        self.offsets.get(index).copied().unwrap_or(self.total_height)
    }

    fn end_of(&self, index: usize) -> f64 {
        self.offset_of(index + 1)
    }

    /// Rows intersecting the viewport, widened by `buffer` rows each side
    pub fn visible_range(&self, scroll_top: f64, viewport_height: f64, buffer: usize) -> Range<usize> {
        let top = non_negative(scroll_top);
        let bottom = top + non_negative(viewport_height);

        // rows ending at or above the top edge are hidden
        let first = self.offsets.partition_point(|&offset| offset < top);
        let first = if first > 0 && self.end_of(first - 1) > top {
            first - 1
        } else {
            first
        };
        let last = self.offsets.partition_point(|&offset| offset < bottom);

        let end = last.saturating_add(buffer).min(self.rows.len());
        let start = first.saturating_sub(buffer).min(end);
        start..end
    }
}

/// Row-only window over a [`GroupedList`] with change detection
#[derive(Debug, Clone)]
pub struct GroupedListWindow {
    list: GroupedList,
    buffer: usize,
    current: Option<Range<usize>>,
    materializations: u64,
}

impl GroupedListWindow {
    pub fn new(list: GroupedList, buffer: usize) -> Self {
        Self {
            list,
            buffer,
            current: None,
            materializations: 0,
        }
    }

    pub fn list(&self) -> &GroupedList {
        &self.list
    }

    /// Replace the rows (collapse toggle, new data); the next update materializes
    pub fn set_list(&mut self, list: GroupedList) {
        self.list = list;
        self.current = None;
    }

    pub fn materializations(&self) -> u64 {
        self.materializations
    }

    pub fn update(&mut self, scroll_top: f64, viewport_height: f64, force: bool) -> Option<Range<usize>> {
        let next = self.list.visible_range(scroll_top, viewport_height, self.buffer);
        let changed = self.current.as_ref() != Some(&next);
        self.current = Some(next.clone());
        if changed || force {
            self.materializations += 1;
            Some(next)
        } else {
            None
        }
    }

    /// Rows currently realized
    pub fn visible_rows(&self) -> &[FlatRow] {
        match &self.current {
            Some(range) => &self.list.rows()[range.clone()],
            None => &[],
        }
    }
}

/// Fixed placeholder slots realized lazily as they become visible
///
/// Used for very large lists: visibility notifications populate slots once
/// and never un-realize them, so scrolling back costs nothing.
#[derive(Debug, Clone, Default)]
pub struct LazyRowSlots {
    realized: Vec<bool>,
    realized_count: usize,
}

impl LazyRowSlots {
    pub fn new(len: usize) -> Self {
        Self {
            realized: vec![false; len],
            realized_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.realized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.realized.is_empty()
    }

    pub fn is_realized(&self, index: usize) -> bool {
        self.realized.get(index).copied().unwrap_or(false)
    }

    pub fn realized_count(&self) -> usize {
        self.realized_count
    }

    /// Mark `range` visible and return the indices realized for the first time
    pub fn on_visible(&mut self, range: Range<usize>) -> Vec<usize> {
        let end = range.end.min(self.realized.len());
        let mut fresh = Vec::new();
        for index in range.start.min(end)..end {
            if !self.realized[index] {
                self.realized[index] = true;
                self.realized_count += 1;
                fresh.push(index);
            }
        }
        fresh
    }
}
