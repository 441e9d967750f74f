//! Message protocol between the UI surface and the background process

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::history::{
    event_window, store_json, AuthState, CalendarBuckets, CalendarEvent, CalendarInfo,
    CalendarSettings, ClosedTab, DrillDownPage, DrillDownScope, DrillDownWindow, GridDelta, GridSlice, SortMode,
    RowHeights, SortRequest, Timestamp, UiPrefs, UrlTimeAggregate, ViewMode, Viewport, WindowGroup, UI_PREFS_KEY,
};
use crate::{lock, now_millis, today, AppState};

/// Explicit event fetch window in epoch milliseconds, end exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

/// Drill-down viewport height when the UI does not send one
const DEFAULT_LIST_HEIGHT: f64 = 600.0;

fn default_list_height() -> f64 {
    DEFAULT_LIST_HEIGHT
}

/// Requests sent by the UI
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    GetTimeData {
        url: String,
    },
    GetOpenTabs,
    GetFaviconCache,
    GetClosedTabs,
    GetGridSlice {
        viewport: Viewport,
        #[serde(default)]
        sort_mode: Option<SortMode>,
        #[serde(default)]
        query: Option<String>,
        #[serde(default)]
        force: bool,
    },
    GetDrillDown {
        #[serde(flatten)]
        scope: DrillDownScope,
        #[serde(default)]
        collapsed: HashSet<String>,
        #[serde(default)]
        scroll_top: f64,
        #[serde(default = "default_list_height")]
        viewport_height: f64,
        #[serde(default)]
        force: bool,
    },
    DeleteUrl {
        domain: String,
        key: String,
        url: String,
    },
    DeleteDomain {
        domain: String,
    },
    SetUiPrefs {
        prefs: UiPrefs,
    },
    CalendarGetSettings,
    CalendarSetSettings {
        settings: CalendarSettings,
    },
    CalendarListCalendars,
    CalendarGetEvents {
        #[serde(default)]
        range: Option<EventRange>,
    },
    CalendarSignOut,
}

/// Responses, one shape per request tag
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Response {
    TimeData {
        url: String,
        data: UrlTimeAggregate,
    },
    OpenTabs {
        windows: Vec<WindowGroup>,
    },
    FaviconCache {
        favicons: BTreeMap<String, String>,
    },
    ClosedTabs {
        tabs: Vec<ClosedTab>,
    },
    /// `slice` is absent when neither the bounds nor the grid changed
    GridSlice {
        slice: Option<GridSlice>,
        content_width: f64,
        content_height: f64,
        calendar_counts: Option<Vec<u32>>,
    },
    /// `page` is absent when neither the visible rows nor the list changed
    DrillDown {
        page: Option<DrillDownPage>,
        total_rows: usize,
        total_height: f64,
    },
    Deleted {
        delta: GridDelta,
    },
    UiPrefsSaved {
        prefs: UiPrefs,
    },
    CalendarSettings {
        settings: CalendarSettings,
        auth: AuthState,
    },
    Calendars {
        calendars: Vec<CalendarInfo>,
    },
    CalendarEvents {
        events: Vec<CalendarEvent>,
        buckets: CalendarBuckets,
    },
    Error {
        message: String,
    },
}

/// Pushed to every subscriber without a request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    HistoryUpdated(GridDelta),
}

/// Dispatch one request; failures become `Response::Error`
pub fn handle_request(state: &AppState, request: Request) -> Response {
    let result = match request {
        Request::GetTimeData { url } => get_time_data(state, url),
        Request::GetOpenTabs => Ok(get_open_tabs(state)),
        Request::GetFaviconCache => Ok(Response::FaviconCache {
            favicons: lock(&state.favicons).snapshot(now_millis()),
        }),
        Request::GetClosedTabs => Ok(Response::ClosedTabs {
            tabs: lock(&state.tabs).closed().entries().cloned().collect(),
        }),
        Request::GetGridSlice {
            viewport,
            sort_mode,
            query,
            force,
        } => Ok(get_grid_slice(state, &viewport, sort_mode, query.as_deref(), force)),
        Request::GetDrillDown {
            scope,
            collapsed,
            scroll_top,
            viewport_height,
            force,
        } => Ok(get_drill_down(state, scope, collapsed, scroll_top, viewport_height, force)),
        Request::DeleteUrl { domain, key, url } => delete_url(state, &domain, &key, &url),
        Request::DeleteDomain { domain } => Ok(delete_domain(state, &domain)),
        Request::SetUiPrefs { prefs } => set_ui_prefs(state, prefs),
        Request::CalendarGetSettings => Ok(calendar_settings(state)),
        Request::CalendarSetSettings { settings } => Ok(calendar_set_settings(state, settings)),
        Request::CalendarListCalendars => {
            let calendars = lock(&state.calendar)
                .list_calendars(state.sources.calendar.as_ref(), state.sources.identity.as_ref());
            Ok(Response::Calendars { calendars })
        }
        Request::CalendarGetEvents { range } => Ok(calendar_get_events(state, range)),
        Request::CalendarSignOut => {
            lock(&state.calendar).sign_out(state.sources.identity.as_ref());
            Ok(calendar_settings(state))
        }
    };

    result.unwrap_or_else(|message| {
        log::warn!("Request failed: {}", message);
        Response::Error { message }
    })
}

/// Parse a JSON request, dispatch it and encode the response
pub fn handle_message(state: &AppState, raw: &str) -> String {
    let response = match serde_json::from_str::<Request>(raw) {
        Ok(request) => handle_request(state, request),
        Err(e) => Response::Error {
            message: format!("Malformed request: {}", e),
        },
    };
    serde_json::to_string(&response).unwrap_or_else(|e| {
        log::error!("Failed to encode response: {}", e);
        r#"{"type":"ERROR","message":"encoding failed"}"#.to_string()
    })
}

fn get_time_data(state: &AppState, url: String) -> Result<Response, String> {
    let data = lock(&state.tracker)
        .time_data(&state.store, &url, today())
        .map_err(|e| e.to_string())?;
    Ok(Response::TimeData { url, data })
}

fn get_open_tabs(state: &AppState) -> Response {
    state.refresh_tabs();
    Response::OpenTabs {
        windows: lock(&state.tabs).snapshot(),
    }
}

fn get_grid_slice(
    state: &AppState,
    viewport: &Viewport,
    sort_mode: Option<SortMode>,
    query: Option<&str>,
    force: bool,
) -> Response {
    let mode = sort_mode.unwrap_or_else(|| lock(&state.prefs).sort_mode);

    let (slice, content_size, view) = {
        let mut grid = lock(&state.grid);
        let view = grid.view_mode();
        let request = SortRequest::new(mode, view, state.config.popularity_metric, query);
        let total_rows = grid.ordered_domains(&request).len();
        let total_cols = grid.column_count();

        // new data or a new ordering under unchanged bounds still re-renders
        let key = (grid.generation(), request.clone());
        let mut last_key = lock(&state.slice_key);
        let stale = last_key.as_ref() != Some(&key);

        let mut window = lock(&state.window);
        let content_size = window.content_size(total_rows, total_cols);
        let slice = window
            .update(viewport, total_rows, total_cols, force || stale)
            .map(|window_state| grid.grid_slice(&request, &window_state));
        if slice.is_some() {
            *last_key = Some(key);
        }
        (slice, content_size, view)
    };

    let calendar_counts = slice
        .as_ref()
        .and_then(|slice| calendar_row(state, &slice.columns, view));

    Response::GridSlice {
        slice,
        content_height: content_size.0,
        content_width: content_size.1,
        calendar_counts,
    }
}

fn get_drill_down(
    state: &AppState,
    scope: DrillDownScope,
    collapsed: HashSet<String>,
    scroll_top: f64,
    viewport_height: f64,
    force: bool,
) -> Response {
    let mut slot = lock(&state.drill_window);
    let (window, rebuilt) = {
        let grid = lock(&state.grid);
        let generation = grid.generation();
        match slot.take() {
            Some(window) if window.shows(generation, &scope, &collapsed) => (window, false),
            _ => {
                let view = grid.drill_down(&scope, &collapsed);
                let window = DrillDownWindow::new(
                    generation,
                    scope,
                    collapsed,
                    view,
                    RowHeights::default(),
                    state.config.row_buffer,
                );
                (window, true)
            }
        }
    };
    let window = slot.insert(window);
    let page = window.update(scroll_top, viewport_height, force || rebuilt);

    Response::DrillDown {
        page,
        total_rows: window.total_rows(),
        total_height: window.total_height(),
    }
}

/// Event counts for the annotated calendar row, when it is shown
fn calendar_row(state: &AppState, columns: &[String], view: ViewMode) -> Option<Vec<u32>> {
    let range = lock(&state.grid).date_range()?;
    let mut calendar = lock(&state.calendar);
    let settings = calendar.settings();
    if !settings.enabled || !settings.show_in_grid {
        return None;
    }
    let (start, end) = event_window(&range, state.config.calendar_lookahead_days)?;
    let events = calendar.events(
        state.sources.calendar.as_ref(),
        state.sources.identity.as_ref(),
        start,
        end,
    );
    Some(CalendarBuckets::from_events(&events).column_counts(columns, view))
}

fn delete_url(state: &AppState, domain: &str, key: &str, url: &str) -> Result<Response, String> {
    // the browser copy goes first; on failure the grid is left untouched
    state
        .sources
        .history
        .delete_url(url)
        .map_err(|e| format!("Failed to delete {}: {}", url, e))?;

    let delta = lock(&state.grid).delete_url(domain, key, url);
    if delta.has_changes {
        state.notify(Notification::HistoryUpdated(delta.clone()));
    }
    Ok(Response::Deleted { delta })
}

fn delete_domain(state: &AppState, domain: &str) -> Response {
    let (delta, urls) = lock(&state.grid).delete_domain(domain);
    for url in &urls {
        if let Err(e) = state.sources.history.delete_url(url) {
            log::warn!("Failed to delete {} from history: {}", url, e);
        }
    }
    if delta.has_changes {
        log::info!("Deleted domain {} ({} urls)", domain, urls.len());
        state.notify(Notification::HistoryUpdated(delta.clone()));
    }
    Response::Deleted { delta }
}

fn set_ui_prefs(state: &AppState, prefs: UiPrefs) -> Result<Response, String> {
    store_json(&state.store, UI_PREFS_KEY, &prefs).map_err(|e| e.to_string())?;

    let view_changed = lock(&state.grid).set_view_mode(prefs.view_mode);
    if view_changed {
        lock(&state.window).reset();
        let generation = lock(&state.grid).generation();
        state.notify(Notification::HistoryUpdated(GridDelta {
            has_changes: true,
            full_refresh: true,
            date_range_changed: true,
            ..GridDelta::unchanged(generation)
        }));
    }

    *lock(&state.prefs) = prefs.clone();
    Ok(Response::UiPrefsSaved { prefs })
}

fn calendar_settings(state: &AppState) -> Response {
    let calendar = lock(&state.calendar);
    Response::CalendarSettings {
        settings: calendar.settings().clone(),
        auth: calendar.auth_state(),
    }
}

fn calendar_set_settings(state: &AppState, settings: CalendarSettings) -> Response {
    {
        let mut calendar = lock(&state.calendar);
        let enabling = settings.enabled && !calendar.settings().enabled;
        calendar.set_settings(settings);
        if enabling {
            calendar.sign_in(state.sources.identity.as_ref());
        }
        if let Err(e) = calendar.persist(&state.store) {
            log::warn!("Failed to persist calendar settings: {}", e);
        }
    }
    calendar_settings(state)
}

fn calendar_get_events(state: &AppState, range: Option<EventRange>) -> Response {
    let window = match range {
        Some(range) => Some((range.start, range.end)),
        None => lock(&state.grid)
            .date_range()
            .and_then(|dates| event_window(&dates, state.config.calendar_lookahead_days)),
    };
    let events = match window {
        Some((start, end)) => lock(&state.calendar).events(
            state.sources.calendar.as_ref(),
            state.sources.identity.as_ref(),
            start,
            end,
        ),
        None => Vec::new(),
    };
    let buckets = CalendarBuckets::from_events(&events);
    Response::CalendarEvents { events, buckets }
}
