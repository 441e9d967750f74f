//! Calendar overlay: settings, token handling and events bucketed onto the
//! grid's columns

use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, Local, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};

use crate::history::aggregator::DateRange;
use crate::history::kv::{load_json, store_json, KeyValueStore, StorageError, CALENDAR_SETTINGS_KEY};
use crate::history::models::{date_key, hour_key, local_date, local_hour, Timestamp, ViewMode, DATE_KEY_FORMAT};
use crate::history::sources::{CalendarEvent, CalendarInfo, CalendarSource, IdentitySource, SourceError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub selected_calendar_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub show_all_day: bool,
    #[serde(default = "default_true")]
    pub show_in_grid: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            selected_calendar_ids: Vec::new(),
            show_all_day: true,
            show_in_grid: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthState {
    #[default]
    Unknown,
    Authenticated,
    NotAuthenticated,
}

type EventsKey = (String, Timestamp, Timestamp);

/// Calendar state held by the background process
#[derive(Debug, Clone, Default)]
pub struct CalendarOverlay {
    settings: CalendarSettings,
    settings_dirty: bool,
    token: Option<String>,
    auth: AuthState,
    events: HashMap<EventsKey, Vec<CalendarEvent>>,
}

impl CalendarOverlay {
    pub fn new(settings: CalendarSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn load(store: &dyn KeyValueStore) -> Self {
        match load_json::<CalendarSettings, _>(store, CALENDAR_SETTINGS_KEY) {
            Ok(settings) => Self::new(settings.unwrap_or_default()),
            Err(e) => {
                log::warn!("Failed to load calendar settings: {}", e);
                Self::default()
            }
        }
    }

    pub fn persist(&mut self, store: &dyn KeyValueStore) -> Result<bool, StorageError> {
        if !self.settings_dirty {
            return Ok(false);
        }
        store_json(store, CALENDAR_SETTINGS_KEY, &self.settings)?;
        self.settings_dirty = false;
        Ok(true)
    }

    pub fn settings(&self) -> &CalendarSettings {
        &self.settings
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth
    }

    pub fn set_settings(&mut self, settings: CalendarSettings) {
        if settings.selected_calendar_ids != self.settings.selected_calendar_ids {
            self.events.clear();
        }
        self.settings = settings;
        self.settings_dirty = true;
    }

    fn prune_calendars(&mut self, missing: &[String]) {
        if missing.is_empty() {
            return;
        }
        log::info!("Pruning {} missing calendars from selection", missing.len());
        self.settings
            .selected_calendar_ids
            .retain(|id| !missing.contains(id));
        self.events.retain(|(id, _, _), _| !missing.contains(id));
        self.settings_dirty = true;
    }

    fn acquire_token(&mut self, identity: &dyn IdentitySource, interactive: bool) -> Option<String> {
        if let Some(token) = &self.token {
            return Some(token.clone());
        }
        let result = match identity.get_token(false) {
            Err(SourceError::Auth(_)) if interactive => identity.get_token(true),
            other => other,
        };
        match result {
            Ok(token) => {
                self.token = Some(token.clone());
                self.auth = AuthState::Authenticated;
                Some(token)
            }
            Err(e) => {
                log::debug!("No calendar token: {}", e);
                self.auth = AuthState::NotAuthenticated;
                None
            }
        }
    }

    /// Drop a rejected token and retry non-interactively
    fn refresh_token(&mut self, identity: &dyn IdentitySource) -> Option<String> {
        if let Some(stale) = self.token.take() {
            if let Err(e) = identity.revoke(&stale) {
                log::debug!("Failed to revoke stale token: {}", e);
            }
        }
        self.acquire_token(identity, false)
    }

    /// Run `call` with a token, retrying once with a fresh token on auth failure
    fn with_token<T, F>(&mut self, identity: &dyn IdentitySource, mut call: F) -> Result<T, SourceError>
    where
        F: FnMut(&str) -> Result<T, SourceError>,
    {
        let Some(token) = self.acquire_token(identity, false) else {
            return Err(SourceError::Auth("not authenticated".to_string()));
        };
        match call(&token) {
            Err(SourceError::Auth(_)) => {
                let Some(fresh) = self.refresh_token(identity) else {
                    return Err(SourceError::Auth("token rejected".to_string()));
                };
                let result = call(&fresh);
                if matches!(result, Err(SourceError::Auth(_))) {
                    self.token = None;
                    self.auth = AuthState::NotAuthenticated;
                }
                result
            }
            other => other,
        }
    }

    /// Interactive sign-in
    pub fn sign_in(&mut self, identity: &dyn IdentitySource) -> AuthState {
        self.acquire_token(identity, true);
        self.auth
    }

    pub fn sign_out(&mut self, identity: &dyn IdentitySource) {
        if let Some(token) = self.token.take() {
            if let Err(e) = identity.revoke(&token) {
                log::warn!("Failed to revoke calendar token: {}", e);
            }
        }
        self.events.clear();
        self.auth = AuthState::NotAuthenticated;
    }

    /// Calendars of the signed-in user; selected ids that vanished are pruned
    pub fn list_calendars(
        &mut self,
        calendar: &dyn CalendarSource,
        identity: &dyn IdentitySource,
    ) -> Vec<CalendarInfo> {
        match self.with_token(identity, |token| calendar.list_calendars(token)) {
            Ok(calendars) => {
                let missing: Vec<String> = self
                    .settings
                    .selected_calendar_ids
                    .iter()
                    .filter(|id| !calendars.iter().any(|c| &c.id == *id))
                    .cloned()
                    .collect();
                self.prune_calendars(&missing);
                calendars
            }
            Err(e) => {
                log::warn!("Calendar list unavailable: {}", e);
                Vec::new()
            }
        }
    }

    /// Events of the selected calendars in `[range_start, range_end)`
    ///
    /// Results are cached per calendar and range. Network failures are cached
    /// as empty; calendars that no longer exist are pruned from the selection.
    pub fn events(
        &mut self,
        calendar: &dyn CalendarSource,
        identity: &dyn IdentitySource,
        range_start: Timestamp,
        range_end: Timestamp,
    ) -> Vec<CalendarEvent> {
        if !self.settings.enabled {
            return Vec::new();
        }

        let mut all = Vec::new();
        let mut missing = Vec::new();
        for id in self.settings.selected_calendar_ids.clone() {
            let key = (id.clone(), range_start, range_end);
            if let Some(cached) = self.events.get(&key) {
                all.extend(cached.iter().cloned());
                continue;
            }

            match self.with_token(identity, |token| calendar.list_events(token, &id, range_start, range_end)) {
                Ok(events) => {
                    all.extend(events.iter().cloned());
                    self.events.insert(key, events);
                }
                Err(SourceError::Network(e)) => {
                    log::warn!("Calendar {} unreachable: {}", id, e);
                    self.events.insert(key, Vec::new());
                }
                Err(SourceError::NotFound(_)) => missing.push(id),
                Err(SourceError::Auth(e)) => {
                    log::info!("Calendar not authenticated: {}", e);
                    break;
                }
                Err(e) => log::debug!("Calendar {} skipped: {}", id, e),
            }
        }
        self.prune_calendars(&missing);

        if !self.settings.show_all_day {
            all.retain(|event| !event.all_day);
        }
        all.sort_by_key(|event| event.start);
        all
    }
}

/// Local midnight of `date` in epoch milliseconds
pub fn day_start_millis(date: NaiveDate) -> Option<Timestamp> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Fetch window covering the grid's dates plus `lookahead_days`
pub fn event_window(range: &DateRange, lookahead_days: i64) -> Option<(Timestamp, Timestamp)> {
    let end = range.end + Duration::days(lookahead_days.max(0) + 1);
    Some((day_start_millis(range.start)?, day_start_millis(end)?))
}

/// Events keyed by date and by hour key
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarBuckets {
    pub by_date: BTreeMap<String, Vec<CalendarEvent>>,
    pub by_hour: BTreeMap<String, Vec<CalendarEvent>>,
}

impl CalendarBuckets {
    /// All-day events cover every date up to their exclusive end; timed events
    /// land on the date and hour of their start.
    pub fn from_events(events: &[CalendarEvent]) -> Self {
        let mut buckets = Self::default();
        for event in events {
            if event.all_day {
                let Some(start) = local_date(event.start) else {
                    continue;
                };
                let end = local_date(event.end).filter(|end| *end > start).unwrap_or(start + Duration::days(1));
                let mut date = start;
                while date < end {
                    buckets
                        .by_date
                        .entry(date.format(DATE_KEY_FORMAT).to_string())
                        .or_default()
                        .push(event.clone());
                    date += Duration::days(1);
                }
            } else {
                let (Some(date), Some(hour)) = (date_key(event.start), local_hour(event.start)) else {
                    continue;
                };
                buckets
                    .by_hour
                    .entry(hour_key(&date, hour))
                    .or_default()
                    .push(event.clone());
                buckets.by_date.entry(date).or_default().push(event.clone());
            }
        }
        buckets
    }

    /// Event count per column for the annotated calendar row
    pub fn column_counts(&self, columns: &[String], view: ViewMode) -> Vec<u32> {
        let source = match view {
            ViewMode::Days => &self.by_date,
            ViewMode::Hours => &self.by_hour,
        };
        columns
            .iter()
            .map(|key| source.get(key).map(|events| events.len() as u32).unwrap_or(0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ts(day: u32, hour: u32) -> Timestamp {
        Local
            .with_ymd_and_hms(2024, 6, day, hour, 0, 0)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    fn event(id: &str, calendar_id: &str, start: Timestamp, end: Timestamp, all_day: bool) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            calendar_id: calendar_id.to_string(),
            summary: id.to_string(),
            start,
            end,
            all_day,
            html_link: None,
        }
    }

    /// Identity that hands out numbered tokens and records revocations
    #[derive(Default)]
    struct Tokens {
        issued: Mutex<u32>,
        revoked: Mutex<Vec<String>>,
        deny: bool,
    }

    impl IdentitySource for Tokens {
        fn get_token(&self, _interactive: bool) -> Result<String, SourceError> {
            if self.deny {
                return Err(SourceError::Auth("denied".to_string()));
            }
            let mut issued = self.issued.lock().unwrap();
            *issued += 1;
            Ok(format!("token-{}", issued))
        }

        fn revoke(&self, token: &str) -> Result<(), SourceError> {
            self.revoked.lock().unwrap().push(token.to_string());
            Ok(())
        }
    }

    /// Calendar that only accepts `token-2` and counts event calls
    struct Remote {
        calls: Mutex<u32>,
    }

    impl Remote {
        fn new() -> Self {
            Self {
                calls: Mutex::new(0),
            }
        }
    }

    impl CalendarSource for Remote {
        fn list_calendars(&self, token: &str) -> Result<Vec<CalendarInfo>, SourceError> {
            if token != "token-2" {
                return Err(SourceError::Auth("expired".to_string()));
            }
            Ok(vec![CalendarInfo {
                id: "work".to_string(),
                summary: "Work".to_string(),
                primary: true,
                background_color: None,
            }])
        }

        fn list_events(
            &self,
            token: &str,
            calendar_id: &str,
            _range_start: Timestamp,
            _range_end: Timestamp,
        ) -> Result<Vec<CalendarEvent>, SourceError> {
            *self.calls.lock().unwrap() += 1;
            if token != "token-2" {
                return Err(SourceError::Auth("expired".to_string()));
            }
            match calendar_id {
                "work" => Ok(vec![
                    event("standup", "work", ts(12, 9), ts(12, 10), false),
                    event("offsite", "work", ts(13, 0), ts(15, 0), true),
                ]),
                "offline" => Err(SourceError::Network("timeout".to_string())),
                _ => Err(SourceError::NotFound(calendar_id.to_string())),
            }
        }
    }

    fn overlay(ids: &[&str]) -> CalendarOverlay {
        CalendarOverlay::new(CalendarSettings {
            enabled: true,
            selected_calendar_ids: ids.iter().map(|id| id.to_string()).collect(),
            ..CalendarSettings::default()
        })
    }

    #[test]
    fn test_rejected_token_is_revoked_and_retried() {
        let identity = Tokens::default();
        let remote = Remote::new();
        let mut overlay = overlay(&["work"]);

        let events = overlay.events(&remote, &identity, 0, 1);
        assert_eq!(events.len(), 2);
        assert_eq!(identity.revoked.lock().unwrap().as_slice(), ["token-1".to_string()]);
        assert_eq!(overlay.auth_state(), AuthState::Authenticated);
    }

    #[test]
    fn test_network_failure_cached_as_empty() {
        let identity = Tokens::default();
        let remote = Remote::new();
        let mut overlay = overlay(&["offline"]);
        overlay.token = Some("token-2".to_string());

        assert!(overlay.events(&remote, &identity, 0, 1).is_empty());
        assert!(overlay.events(&remote, &identity, 0, 1).is_empty());
        assert_eq!(*remote.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_missing_calendar_is_pruned() {
        let identity = Tokens::default();
        let remote = Remote::new();
        let mut overlay = overlay(&["work", "deleted"]);
        overlay.token = Some("token-2".to_string());

        overlay.events(&remote, &identity, 0, 1);
        assert_eq!(overlay.settings().selected_calendar_ids, vec!["work".to_string()]);

        let store = crate::history::kv::MemoryKvStore::new();
        assert!(overlay.persist(&store).unwrap());
        assert_eq!(CalendarOverlay::load(&store).settings(), overlay.settings());
    }

    #[test]
    fn test_denied_identity_is_not_authenticated() {
        let identity = Tokens {
            deny: true,
            ..Tokens::default()
        };
        let remote = Remote::new();
        let mut overlay = overlay(&["work"]);

        assert!(overlay.events(&remote, &identity, 0, 1).is_empty());
        assert!(overlay.list_calendars(&remote, &identity).is_empty());
        assert_eq!(overlay.auth_state(), AuthState::NotAuthenticated);
        assert_eq!(overlay.sign_in(&identity), AuthState::NotAuthenticated);
    }

    #[test]
    fn test_disabled_overlay_fetches_nothing() {
        let identity = Tokens::default();
        let remote = Remote::new();
        let mut overlay = CalendarOverlay::default();
        assert!(overlay.events(&remote, &identity, 0, 1).is_empty());
        assert_eq!(*remote.calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_sign_out_revokes_and_clears() {
        let identity = Tokens::default();
        let remote = Remote::new();
        let mut overlay = overlay(&["work"]);
        overlay.token = Some("token-2".to_string());
        overlay.events(&remote, &identity, 0, 1);

        overlay.sign_out(&identity);
        assert_eq!(overlay.auth_state(), AuthState::NotAuthenticated);
        assert_eq!(identity.revoked.lock().unwrap().as_slice(), ["token-2".to_string()]);
        assert!(overlay.events.is_empty());
    }

    #[test]
    fn test_buckets_and_column_counts() {
        let events = vec![
            event("standup", "work", ts(12, 9), ts(12, 10), false),
            event("offsite", "work", ts(13, 0), ts(15, 0), true),
        ];
        let buckets = CalendarBuckets::from_events(&events);
        assert_eq!(buckets.by_date.len(), 3);
        assert_eq!(buckets.by_hour.len(), 1);

        let days: Vec<String> = ["2024-06-12", "2024-06-13", "2024-06-14", "2024-06-15"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(buckets.column_counts(&days, ViewMode::Days), vec![1, 1, 1, 0]);

        let hours = vec!["2024-06-12T09".to_string(), "2024-06-12T10".to_string()];
        assert_eq!(buckets.column_counts(&hours, ViewMode::Hours), vec![1, 0]);
    }

    #[test]
    fn test_event_window_adds_lookahead() {
        let range = DateRange {
            start: NaiveDate::from_ymd_opt(2024, 6, 12).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 6, 14).unwrap(),
        };
        let (start, end) = event_window(&range, 7).unwrap();
        assert_eq!(start, ts(12, 0));
        assert_eq!(end, ts(22, 0));
    }
}
