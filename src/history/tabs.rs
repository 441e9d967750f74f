//! Open-tabs snapshot and the closed-tabs ring buffer

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::history::aggregator::is_web_url;
use crate::history::kv::{load_json, store_json, KeyValueStore, StorageError, CLOSED_TABS_KEY};
use crate::history::models::Timestamp;
use crate::history::sources::{ClosedSession, SourceEvent, Tab};
use crate::history::tracker::TimeTracker;

/// Tabs of one browser window
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowGroup {
    pub window_id: i64,
    pub tabs: Vec<Tab>,
}

/// Group tabs by window, windows ascending, tabs in input order
pub fn group_by_window(tabs: &[Tab]) -> Vec<WindowGroup> {
    let mut groups: BTreeMap<i64, Vec<Tab>> = BTreeMap::new();
    for tab in tabs {
        groups.entry(tab.window_id).or_default().push(tab.clone());
    }
    groups
        .into_iter()
        .map(|(window_id, tabs)| WindowGroup { window_id, tabs })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedTab {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub favicon_url: Option<String>,
    pub closed_at: Timestamp,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ClosedTab {
    fn from_tab(tab: &Tab, closed_at: Timestamp, session_id: Option<String>) -> Self {
        Self {
            url: tab.url.clone(),
            title: tab.title.clone(),
            favicon_url: tab.favicon_url.clone(),
            closed_at,
            session_id,
        }
    }
}

/// Newest-first buffer; the oldest entry is evicted past `limit`
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTabs {
    entries: VecDeque<ClosedTab>,
    limit: usize,
    dirty: bool,
}

impl ClosedTabs {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ClosedTab> {
        self.entries.iter()
    }

    pub fn push(&mut self, tab: ClosedTab) {
        // reopening and closing the same page again keeps a single entry
        self.entries.retain(|entry| entry.url != tab.url);
        self.entries.push_front(tab);
        self.entries.truncate(self.limit);
        self.dirty = true;
    }

    /// Fold in sessions reported by the browser, attaching session ids
    pub fn merge_sessions(&mut self, sessions: &[ClosedSession]) {
        let mut merged: Vec<ClosedTab> = self.entries.drain(..).collect();
        for session in sessions {
            let tabs = session.tab.iter().chain(session.window_tabs.iter());
            for tab in tabs {
                if !is_web_url(&tab.url) {
                    continue;
                }
                match merged.iter_mut().find(|entry| entry.url == tab.url) {
                    Some(entry) => {
                        entry.session_id = Some(session.session_id.clone());
                        entry.closed_at = entry.closed_at.max(session.closed_at);
                    }
                    None => merged.push(ClosedTab::from_tab(
                        tab,
                        session.closed_at,
                        Some(session.session_id.clone()),
                    )),
                }
            }
        }
        merged.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        merged.truncate(self.limit);
        self.entries = merged.into();
        self.dirty = true;
    }

    pub fn load(store: &dyn KeyValueStore, limit: usize) -> Self {
        let mut tabs = Self::new(limit);
        match load_json::<Vec<ClosedTab>, _>(store, CLOSED_TABS_KEY) {
            Ok(Some(mut entries)) => {
                entries.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
                entries.truncate(tabs.limit);
                tabs.entries = entries.into();
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to load closed tabs: {}", e),
        }
        tabs
    }

    pub fn persist(&mut self, store: &dyn KeyValueStore) -> Result<bool, StorageError> {
        if !self.dirty {
            return Ok(false);
        }
        let entries: Vec<&ClosedTab> = self.entries.iter().collect();
        store_json(store, CLOSED_TABS_KEY, &entries)?;
        self.dirty = false;
        Ok(true)
    }
}

/// Live tabs plus the closed-tabs buffer
#[derive(Debug, Clone)]
pub struct TabsState {
    tabs: BTreeMap<i64, Tab>,
    focused_window: Option<i64>,
    closed: ClosedTabs,
}

impl TabsState {
    pub fn new(closed: ClosedTabs) -> Self {
        Self {
            tabs: BTreeMap::new(),
            focused_window: None,
            closed,
        }
    }

    pub fn closed(&self) -> &ClosedTabs {
        &self.closed
    }

    pub fn closed_mut(&mut self) -> &mut ClosedTabs {
        &mut self.closed
    }

    pub fn snapshot(&self) -> Vec<WindowGroup> {
        let tabs: Vec<Tab> = self.tabs.values().cloned().collect();
        group_by_window(&tabs)
    }

    fn active_url(&self) -> Option<&str> {
        let window = self.focused_window?;
        self.tabs
            .values()
            .find(|tab| tab.window_id == window && tab.active)
            .map(|tab| tab.url.as_str())
    }

    fn sync_tracker(&self, tracker: &mut TimeTracker) {
        tracker.set_open_urls(self.tabs.values().map(|tab| tab.url.as_str()));
        tracker.set_active(self.active_url());
    }

    /// Replace the live tabs with a full query result
    pub fn replace(&mut self, tabs: Vec<Tab>, tracker: &mut TimeTracker) {
        self.focused_window = tabs
            .iter()
            .filter(|tab| tab.active)
            .max_by_key(|tab| tab.last_accessed.unwrap_or(0))
            .map(|tab| tab.window_id)
            .or(self.focused_window);
        self.tabs = tabs.into_iter().map(|tab| (tab.id, tab)).collect();
        self.sync_tracker(tracker);
    }

    /// Apply a tab lifecycle event; returns whether it was a tab event
    pub fn apply(&mut self, event: &SourceEvent, tracker: &mut TimeTracker, now: Timestamp) -> bool {
        match event {
            SourceEvent::TabCreated(tab) | SourceEvent::TabUpdated(tab) => {
                if tab.active {
                    self.focused_window = Some(tab.window_id);
                }
                self.tabs.insert(tab.id, tab.clone());
            }
            SourceEvent::TabRemoved { tab_id, .. } => {
                if let Some(tab) = self.tabs.remove(tab_id) {
                    if is_web_url(&tab.url) {
                        self.closed.push(ClosedTab::from_tab(&tab, now, None));
                    }
                }
            }
            SourceEvent::TabActivated { tab_id, window_id } => {
                self.focused_window = Some(*window_id);
                for tab in self.tabs.values_mut().filter(|tab| tab.window_id == *window_id) {
                    tab.active = tab.id == *tab_id;
                }
            }
            _ => return false,
        }
        self.sync_tracker(tracker);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::kv::MemoryKvStore;

    fn tab(id: i64, window_id: i64, url: &str, active: bool) -> Tab {
        Tab {
            id,
            window_id,
            url: url.to_string(),
            title: format!("tab {}", id),
            active,
            favicon_url: None,
            last_accessed: None,
        }
    }

    fn closed(url: &str, at: Timestamp) -> ClosedTab {
        ClosedTab {
            url: url.to_string(),
            title: String::new(),
            favicon_url: None,
            closed_at: at,
            session_id: None,
        }
    }

    #[test]
    fn test_group_by_window() {
        let groups = group_by_window(&[
            tab(1, 2, "https://a.com/", false),
            tab(2, 1, "https://b.com/", true),
            tab(3, 2, "https://c.com/", true),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].window_id, 1);
        assert_eq!(groups[1].tabs.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut buffer = ClosedTabs::new(50);
        for i in 0..55 {
            buffer.push(closed(&format!("https://site{}.com/", i), i));
        }
        assert_eq!(buffer.len(), 50);
        let entries: Vec<&ClosedTab> = buffer.entries().collect();
        assert_eq!(entries[0].url, "https://site54.com/");
        assert_eq!(entries[49].url, "https://site5.com/");
    }

    #[test]
    fn test_closed_tabs_persist_roundtrip() {
        let store = MemoryKvStore::new();
        let mut buffer = ClosedTabs::new(3);
        buffer.push(closed("https://a.com/", 1));
        buffer.push(closed("https://b.com/", 2));
        assert!(buffer.persist(&store).unwrap());
        assert!(!buffer.persist(&store).unwrap());

        let restored = ClosedTabs::load(&store, 3);
        assert_eq!(restored.entries().next().unwrap().url, "https://b.com/");
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn test_merge_sessions_attaches_ids() {
        let mut buffer = ClosedTabs::new(10);
        buffer.push(closed("https://a.com/", 5));
        buffer.merge_sessions(&[ClosedSession {
            session_id: "s1".to_string(),
            closed_at: 9,
            tab: Some(tab(7, 1, "https://a.com/", false)),
            window_tabs: vec![tab(8, 1, "https://b.com/", false), tab(9, 1, "chrome://newtab", false)],
        }]);

        let entries: Vec<&ClosedTab> = buffer.entries().collect();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.session_id.as_deref() == Some("s1")));
    }

    #[test]
    fn test_events_feed_tracker_and_closed_buffer() {
        let mut tracker = TimeTracker::new(90);
        let mut state = TabsState::new(ClosedTabs::new(50));
        state.replace(
            vec![tab(1, 1, "https://a.com/", true), tab(2, 1, "https://b.com/", false)],
            &mut tracker,
        );
        assert_eq!(tracker.active_url(), Some("https://a.com/"));
        assert_eq!(tracker.open_urls().count(), 2);

        assert!(state.apply(&SourceEvent::TabActivated { tab_id: 2, window_id: 1 }, &mut tracker, 10));
        assert_eq!(tracker.active_url(), Some("https://b.com/"));

        state.apply(&SourceEvent::TabRemoved { tab_id: 2, window_id: 1 }, &mut tracker, 20);
        assert_eq!(tracker.active_url(), None);
        assert_eq!(state.closed().entries().next().unwrap().closed_at, 20);
        assert_eq!(state.snapshot()[0].tabs.len(), 1);

        assert!(!state.apply(&SourceEvent::BookmarksChanged, &mut tracker, 30));
    }
}
