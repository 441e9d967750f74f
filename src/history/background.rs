//! Background loop: tracker ticks, debounced flushes and source events

use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::commands::Notification;
use crate::history::cache::GridDelta;
use crate::history::models::Timestamp;
use crate::history::sources::SourceEvent;
use crate::{lock, now_millis, today, AppState, SharedState};

/// Counts ticks between time-record flushes
#[derive(Debug, Clone)]
pub struct FlushSchedule {
    every: u64,
    ticks: u64,
}

impl FlushSchedule {
    pub fn new(tick_interval_secs: u64, flush_interval_secs: u64) -> Self {
        Self {
            every: (flush_interval_secs / tick_interval_secs.max(1)).max(1),
            ticks: 0,
        }
    }

    /// Register a tick; true when time records are due for a flush
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        if self.ticks >= self.every {
            self.ticks = 0;
            true
        } else {
            false
        }
    }
}

/// Push a delta to subscribers when it carries changes
fn publish(state: &AppState, delta: GridDelta) -> Option<GridDelta> {
    if !delta.has_changes {
        return None;
    }
    state.notify(Notification::HistoryUpdated(delta.clone()));
    Some(delta)
}

fn merge_delta(into: &mut GridDelta, delta: GridDelta) {
    if !delta.has_changes {
        return;
    }
    into.has_changes = true;
    into.full_refresh |= delta.full_refresh;
    into.date_range_changed |= delta.date_range_changed;
    into.updated_domains.extend(delta.updated_domains);
    into.removed_domains.extend(delta.removed_domains);
    into.generation = into.generation.max(delta.generation);
}

/// One timer tick
///
/// Attributes elapsed time, flushes time records and dirty state when
/// `flush_time` is set, extends the date range past midnight and writes the
/// debounced store once its window has elapsed.
pub fn handle_tick(state: &AppState, now: Timestamp, today: NaiveDate, flush_time: bool) {
    {
        let mut tracker = lock(&state.tracker);
        tracker.tick(now);
        if flush_time && tracker.has_pending() {
            if let Err(e) = tracker.flush(&state.store) {
                log::warn!("Failed to flush time records, keeping them: {}", e);
            }
        }
    }

    let rolled_over = {
        let mut grid = lock(&state.grid);
        grid.refresh_today(today).then(|| GridDelta {
            has_changes: true,
            date_range_changed: true,
            ..GridDelta::unchanged(grid.generation())
        })
    };
    if let Some(delta) = rolled_over {
        log::info!("Date range extended to {}", today);
        publish(state, delta);
    }

    if flush_time {
        let pruned = lock(&state.favicons).prune(now);
        if pruned > 0 {
            log::debug!("Pruned {} expired favicons", pruned);
        }
        state.persist();
    }

    match state.store.flush_if_due(Instant::now()) {
        Ok(0) => {}
        Ok(written) => log::debug!("Debounced flush wrote {} keys", written),
        Err(e) => log::warn!("Debounced flush failed, will retry: {}", e),
    }
}

/// Apply one collaborator event; returns the delta pushed to subscribers
pub fn handle_source_event(
    state: &AppState,
    event: SourceEvent,
    now: Timestamp,
    today: NaiveDate,
) -> Option<GridDelta> {
    match event {
        SourceEvent::NewVisit(record) => {
            lock(&state.favicons).observe_visit(&record, now);
            let delta = lock(&state.grid).handle_new_visit(&record, today);
            publish(state, delta)
        }
        SourceEvent::UrlsRemoved(urls) => {
            let mut combined = {
                let mut grid = lock(&state.grid);
                let mut combined = GridDelta::unchanged(grid.generation());
                for url in &urls {
                    merge_delta(&mut combined, grid.delete_url_everywhere(url));
                }
                combined
            };
            let removed = &combined.removed_domains;
            combined.updated_domains.retain(|domain| !removed.contains(domain));
            combined.updated_domains.dedup();
            publish(state, combined)
        }
        SourceEvent::BookmarksChanged => {
            let before = lock(&state.grid).generation();
            state.refresh_bookmarks();
            let after = lock(&state.grid).generation();
            if after == before {
                return None;
            }
            // bookmark flags can move on any row
            publish(
                state,
                GridDelta {
                    has_changes: true,
                    full_refresh: true,
                    ..GridDelta::unchanged(after)
                },
            )
        }
        tab_event => {
            let mut tabs = lock(&state.tabs);
            let mut tracker = lock(&state.tracker);
            tabs.apply(&tab_event, &mut tracker, now);
            None
        }
    }
}

/// Handle to the running background loop
pub struct BackgroundHandle {
    events: mpsc::UnboundedSender<SourceEvent>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl BackgroundHandle {
    pub fn sender(&self) -> mpsc::UnboundedSender<SourceEvent> {
        self.events.clone()
    }

    /// Queue an event; false once the loop has stopped
    pub fn send(&self, event: SourceEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Stop the loop after draining queued events, then wait for the final flush
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            log::error!("Background loop failed: {}", e);
        }
    }
}

/// Start the loop on the current tokio runtime
pub fn start_background_loop(state: SharedState) -> BackgroundHandle {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SourceEvent>();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let tick_secs = state.config.tick_interval_secs.max(1);
    let mut schedule = FlushSchedule::new(tick_secs, state.config.time_flush_interval_secs);

    let task = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(tick_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Background loop started with {}s ticks", tick_secs);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let flush_time = schedule.tick();
                    handle_tick(&state, now_millis(), today(), flush_time);
                }
                Some(event) = events_rx.recv() => {
                    handle_source_event(&state, event, now_millis(), today());
                }
                _ = &mut shutdown_rx => break,
            }
        }

        // events queued before shutdown still apply, in order
        while let Ok(event) = events_rx.try_recv() {
            handle_source_event(&state, event, now_millis(), today());
        }
        state.flush();
        log::info!("Background loop stopped");
    });

    BackgroundHandle {
        events: events_tx,
        shutdown: shutdown_tx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::history::config::AppConfig;
    use crate::history::kv::MemoryKvStore;
    use crate::history::models::VisitRecord;
    use crate::history::reader::JsonlHistorySource;
    use crate::history::sources::{Sources, Tab};
    use crate::history::tracker::url_time_aggregate;

    fn state() -> AppState {
        AppState::new(
            AppConfig::default(),
            Box::new(MemoryKvStore::new()),
            Sources::with_history(Arc::new(JsonlHistorySource::new(Vec::new()))),
        )
    }

    fn tab(id: i64, url: &str, active: bool) -> Tab {
        Tab {
            id,
            window_id: 1,
            url: url.to_string(),
            title: String::new(),
            active,
            favicon_url: None,
            last_accessed: None,
        }
    }

    #[test]
    fn test_flush_schedule() {
        let mut schedule = FlushSchedule::new(1, 3);
        let fired: Vec<bool> = (0..6).map(|_| schedule.tick()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true]);

        let mut every_tick = FlushSchedule::new(5, 1);
        assert!(every_tick.tick());
    }

    #[test]
    fn test_tick_attributes_and_flushes_time() {
        let state = state();
        let now = now_millis();
        let day = today();
        handle_source_event(&state, SourceEvent::TabCreated(tab(1, "https://a.com/", true)), now, day);
        handle_source_event(&state, SourceEvent::TabCreated(tab(2, "https://b.com/", false)), now, day);

        handle_tick(&state, now, day, false);
        handle_tick(&state, now + 10_000, day, true);

        let active = url_time_aggregate(&state.store, "https://a.com/", day).unwrap();
        let open = url_time_aggregate(&state.store, "https://b.com/", day).unwrap();
        assert_eq!(active.active_seconds, 10);
        assert_eq!(active.open_seconds, 0);
        assert_eq!(open.open_seconds, 10);
        assert!(!lock(&state.tracker).has_pending());
    }

    #[test]
    fn test_new_visit_publishes_delta() {
        let state = state();
        let mut updates = state.subscribe();

        let record = VisitRecord::new("https://www.a.com/1", "A", now_millis());
        let delta = handle_source_event(&state, SourceEvent::NewVisit(record), now_millis(), today())
            .expect("visit changes the grid");
        assert_eq!(delta.updated_domains, vec!["a.com".to_string()]);
        assert!(lock(&state.grid).matrix().contains_key("a.com"));

        match updates.try_recv() {
            Ok(Notification::HistoryUpdated(pushed)) => assert_eq!(pushed, delta),
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[test]
    fn test_urls_removed_prunes_domains() {
        let state = state();
        let now = now_millis();
        for url in ["https://a.com/1", "https://b.com/1", "https://b.com/2"] {
            handle_source_event(&state, SourceEvent::NewVisit(VisitRecord::new(url, "", now)), now, today());
        }

        let delta = handle_source_event(
            &state,
            SourceEvent::UrlsRemoved(vec!["https://a.com/1".to_string(), "https://b.com/1".to_string()]),
            now,
            today(),
        )
        .expect("removal changes the grid");
        assert_eq!(delta.removed_domains, vec!["a.com".to_string()]);
        assert_eq!(delta.updated_domains, vec!["b.com".to_string()]);

        let grid = lock(&state.grid);
        assert!(!grid.matrix().contains_key("a.com"));
        assert_eq!(grid.matrix()["b.com"].total_visits(), 1);
    }

    #[test]
    fn test_unknown_removals_publish_nothing() {
        let state = state();
        let mut updates = state.subscribe();
        let result = handle_source_event(
            &state,
            SourceEvent::UrlsRemoved(vec!["https://nowhere.com/".to_string()]),
            now_millis(),
            today(),
        );
        assert!(result.is_none());
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_loop_applies_events_and_flushes_on_shutdown() {
        let state: SharedState = Arc::new(state());
        let handle = start_background_loop(state.clone());

        let record = VisitRecord {
            favicon_url: Some("https://a.com/favicon.ico".to_string()),
            ..VisitRecord::new("https://a.com/x", "X", now_millis())
        };
        assert!(handle.send(SourceEvent::NewVisit(record)));
        handle.shutdown().await;

        assert!(lock(&state.grid).matrix().contains_key("a.com"));
        assert!(!state.store.has_pending());
        // colors and favicons reached the backing store
        let stored = state
            .store
            .inner()
            .get(&[crate::history::kv::DOMAIN_COLORS_KEY, crate::history::kv::FAVICON_CACHE_KEY])
            .unwrap();
        assert_eq!(stored.len(), 2);
    }
}
