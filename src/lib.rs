//! History Heatmap - browsing activity grid engine

pub mod commands;
pub mod history;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tokio::sync::broadcast;

use commands::Notification;
use history::{
    get_store_path, load_json, AppConfig, BookmarksView, ClosedTabs, CalendarOverlay, DebouncedStore,
    DrillDownWindow, FaviconCache, GridCache, GridDelta, HistoryQuery, HistorySource, KeyValueStore, MemoryKvStore,
    SortRequest, SqliteKvStore, Sources, TabsState, TimeTracker, Timestamp, UiPrefs, VirtualWindow, WindowConfig,
    UI_PREFS_KEY,
};

/// Capacity of the notification channel; slow subscribers skip old updates
const NOTIFICATION_CAPACITY: usize = 64;

/// State shared by the background loop and the message dispatcher
pub struct AppState {
    pub config: AppConfig,
    pub store: DebouncedStore<Box<dyn KeyValueStore>>,
    pub grid: Mutex<GridCache>,
    pub window: Mutex<VirtualWindow>,
    pub tracker: Mutex<TimeTracker>,
    pub tabs: Mutex<TabsState>,
    pub favicons: Mutex<FaviconCache>,
    pub calendar: Mutex<CalendarOverlay>,
    pub prefs: Mutex<UiPrefs>,
    /// Grid generation and ordering behind the last materialized slice
    pub slice_key: Mutex<Option<(u64, SortRequest)>>,
    /// Open drill-down list and its scroll window
    pub drill_window: Mutex<Option<DrillDownWindow>>,
    pub sources: Sources,
    updates: broadcast::Sender<Notification>,
}

/// Lock a state mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("Recovering poisoned state lock");
        poisoned.into_inner()
    })
}

pub fn now_millis() -> Timestamp {
    Local::now().timestamp_millis()
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

impl AppState {
    /// Build the state over `store`, restoring everything persisted in it
    pub fn new(config: AppConfig, store: Box<dyn KeyValueStore>, sources: Sources) -> Self {
        let store = DebouncedStore::new(store, Duration::from_millis(config.store_debounce_ms));
        let now = now_millis();

        let prefs = match load_json::<UiPrefs, _>(&store, UI_PREFS_KEY) {
            Ok(prefs) => prefs.unwrap_or_default(),
            Err(e) => {
                log::warn!("Failed to load UI prefs: {}", e);
                UiPrefs::default()
            }
        };

        let mut grid = GridCache::new();
        grid.load_colors(&store);
        grid.set_view_mode(prefs.view_mode);

        let tabs = TabsState::new(ClosedTabs::load(&store, config.closed_tabs_limit));
        let favicons = FaviconCache::load(&store, config.favicon_ttl_days, now);
        let calendar = CalendarOverlay::load(&store);
        let (updates, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Self {
            window: Mutex::new(VirtualWindow::new(WindowConfig::from_app_config(&config))),
            tracker: Mutex::new(TimeTracker::new(config.max_tick_gap_secs)),
            grid: Mutex::new(grid),
            tabs: Mutex::new(tabs),
            favicons: Mutex::new(favicons),
            calendar: Mutex::new(calendar),
            prefs: Mutex::new(prefs),
            slice_key: Mutex::new(None),
            drill_window: Mutex::new(None),
            config,
            store,
            sources,
            updates,
        }
    }

    /// Open the SQLite store in the data directory, falling back to memory
    pub fn open(config: AppConfig, sources: Sources) -> Self {
        let path = get_store_path(config.data_path.as_deref());
        let store: Box<dyn KeyValueStore> = match SqliteKvStore::open(&path) {
            Ok(store) => {
                log::info!("Using store at {:?}", path);
                Box::new(store)
            }
            Err(e) => {
                log::warn!("Failed to open store at {:?}, state will not persist: {}", path, e);
                Box::new(MemoryKvStore::new())
            }
        };
        Self::new(config, store, sources)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.updates.subscribe()
    }

    pub fn notify(&self, notification: Notification) {
        // no subscribers is fine
        let _ = self.updates.send(notification);
    }

    /// Full history scan into the grid
    pub fn load_history(&self) -> GridDelta {
        let records = match self.sources.history.search(&HistoryQuery::everything()) {
            Ok(records) => records,
            Err(e) => {
                log::warn!("History unavailable: {}", e);
                Vec::new()
            }
        };

        let now = now_millis();
        {
            let mut favicons = lock(&self.favicons);
            for record in &records {
                favicons.observe_visit(record, now);
            }
        }

        let delta = lock(&self.grid).full_load(&records, today());
        self.persist();
        delta
    }

    /// Re-query open tabs and recently closed sessions
    pub fn refresh_tabs(&self) {
        let tabs = match self.sources.tabs.query_all() {
            Ok(tabs) => tabs,
            Err(e) => {
                log::debug!("Tabs unavailable: {}", e);
                return;
            }
        };
        let sessions = self
            .sources
            .sessions
            .get_recently_closed(self.config.closed_tabs_limit)
            .unwrap_or_else(|e| {
                log::debug!("Sessions unavailable: {}", e);
                Vec::new()
            });

        let mut state = lock(&self.tabs);
        let mut tracker = lock(&self.tracker);
        state.replace(tabs, &mut tracker);
        if !sessions.is_empty() {
            state.closed_mut().merge_sessions(&sessions);
        }
    }

    /// Re-read bookmarks and annotate the grid rows
    pub fn refresh_bookmarks(&self) {
        let view = BookmarksView::load(self.sources.bookmarks.as_ref(), &Default::default());
        lock(&self.grid).set_bookmarked_domains(view.domains());
    }

    /// Queue every dirty piece of state into the debounced store
    pub fn persist(&self) {
        if let Err(e) = lock(&self.grid).persist_colors(&self.store) {
            log::warn!("Failed to persist domain colors: {}", e);
        }
        if let Err(e) = lock(&self.tabs).closed_mut().persist(&self.store) {
            log::warn!("Failed to persist closed tabs: {}", e);
        }
        if let Err(e) = lock(&self.favicons).persist(&self.store) {
            log::warn!("Failed to persist favicon cache: {}", e);
        }
        if let Err(e) = lock(&self.calendar).persist(&self.store) {
            log::warn!("Failed to persist calendar settings: {}", e);
        }
    }

    /// Write tracked time and every pending store write now
    pub fn flush(&self) {
        if let Err(e) = lock(&self.tracker).flush(&self.store) {
            log::warn!("Failed to flush time records: {}", e);
        }
        self.persist();
        match self.store.flush() {
            Ok(written) if written > 0 => log::debug!("Flushed {} store keys", written),
            Ok(_) => {}
            Err(e) => log::warn!("Store flush failed, keeping pending writes: {}", e),
        }
    }
}

/// Shared handle the background loop owns alongside its callers
pub type SharedState = Arc<AppState>;

/// Install the fmt subscriber for binaries (`RUST_LOG` controls the filter)
pub fn init_logging(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    // a second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
