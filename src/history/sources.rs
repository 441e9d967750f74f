//! External collaborators: browser history, tabs, bookmarks, sessions,
//! calendar and identity.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::models::{Timestamp, VisitEvent, VisitRecord};

/// Failure reported by an external collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Not authenticated: {0}")]
    Auth(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

/// History search parameters (`text` empty matches everything)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub start_time: Option<Timestamp>,
    #[serde(default)]
    pub end_time: Option<Timestamp>,
    /// Zero means unlimited
    #[serde(default)]
    pub max_results: usize,
}

impl HistoryQuery {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn matches(&self, record: &VisitRecord) -> bool {
        if let Some(start) = self.start_time {
            if record.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if record.timestamp >= end {
                return false;
            }
        }
        if self.text.is_empty() {
            return true;
        }
        let text = self.text.to_lowercase();
        record.url.to_lowercase().contains(&text) || record.title.to_lowercase().contains(&text)
    }
}

pub trait HistorySource: Send + Sync {
    fn search(&self, query: &HistoryQuery) -> Result<Vec<VisitRecord>, SourceError>;
    fn get_visits(&self, url: &str) -> Result<Vec<VisitEvent>, SourceError>;
    fn delete_url(&self, url: &str) -> Result<(), SourceError>;
}

/// A browser tab
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: i64,
    pub window_id: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default, alias = "favIconUrl")]
    pub favicon_url: Option<String>,
    #[serde(default)]
    pub last_accessed: Option<Timestamp>,
}

pub trait TabsSource: Send + Sync {
    fn query_all(&self) -> Result<Vec<Tab>, SourceError>;
}

/// Node of the bookmarks tree; folders have no URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkNode {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub date_added: Option<Timestamp>,
    #[serde(default)]
    pub children: Vec<BookmarkNode>,
}

impl BookmarkNode {
    pub fn is_folder(&self) -> bool {
        self.url.is_none()
    }
}

pub trait BookmarksSource: Send + Sync {
    fn get_tree(&self) -> Result<Vec<BookmarkNode>, SourceError>;
    fn search(&self, url: &str) -> Result<Vec<BookmarkNode>, SourceError>;
    fn create(&self, parent_id: &str, title: &str, url: &str) -> Result<BookmarkNode, SourceError>;
    fn remove(&self, id: &str) -> Result<(), SourceError>;
    fn move_node(&self, id: &str, parent_id: &str, index: Option<usize>) -> Result<(), SourceError>;
}

/// A recently closed tab or window as reported by the sessions API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedSession {
    pub session_id: String,
    pub closed_at: Timestamp,
    #[serde(default)]
    pub tab: Option<Tab>,
    /// Tabs of a closed window
    #[serde(default)]
    pub window_tabs: Vec<Tab>,
}

pub trait SessionsSource: Send + Sync {
    fn get_recently_closed(&self, limit: usize) -> Result<Vec<ClosedSession>, SourceError>;
    fn restore(&self, session_id: &str) -> Result<(), SourceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarInfo {
    pub id: String,
    pub summary: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub background_color: Option<String>,
}

/// Calendar event; all-day events carry their date instead of a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub calendar_id: String,
    #[serde(default)]
    pub summary: String,
    pub start: Timestamp,
    pub end: Timestamp,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub html_link: Option<String>,
}

pub trait CalendarSource: Send + Sync {
    fn list_calendars(&self, token: &str) -> Result<Vec<CalendarInfo>, SourceError>;
    fn list_events(
        &self,
        token: &str,
        calendar_id: &str,
        range_start: Timestamp,
        range_end: Timestamp,
    ) -> Result<Vec<CalendarEvent>, SourceError>;
}

pub trait IdentitySource: Send + Sync {
    fn get_token(&self, interactive: bool) -> Result<String, SourceError>;
    fn revoke(&self, token: &str) -> Result<(), SourceError>;
}

/// Collaborator that is not present in this host
#[derive(Debug, Clone, Copy, Default)]
pub struct Unavailable;

impl Unavailable {
    fn err<T>(what: &str) -> Result<T, SourceError> {
        Err(SourceError::Unavailable(what.to_string()))
    }
}

impl TabsSource for Unavailable {
    fn query_all(&self) -> Result<Vec<Tab>, SourceError> {
        Self::err("tabs")
    }
}

impl BookmarksSource for Unavailable {
    fn get_tree(&self) -> Result<Vec<BookmarkNode>, SourceError> {
        Self::err("bookmarks")
    }

    fn search(&self, _url: &str) -> Result<Vec<BookmarkNode>, SourceError> {
        Self::err("bookmarks")
    }

    fn create(&self, _parent_id: &str, _title: &str, _url: &str) -> Result<BookmarkNode, SourceError> {
        Self::err("bookmarks")
    }

    fn remove(&self, _id: &str) -> Result<(), SourceError> {
        Self::err("bookmarks")
    }

    fn move_node(&self, _id: &str, _parent_id: &str, _index: Option<usize>) -> Result<(), SourceError> {
        Self::err("bookmarks")
    }
}

impl SessionsSource for Unavailable {
    fn get_recently_closed(&self, _limit: usize) -> Result<Vec<ClosedSession>, SourceError> {
        Self::err("sessions")
    }

    fn restore(&self, _session_id: &str) -> Result<(), SourceError> {
        Self::err("sessions")
    }
}

impl CalendarSource for Unavailable {
    fn list_calendars(&self, _token: &str) -> Result<Vec<CalendarInfo>, SourceError> {
        Self::err("calendar")
    }

    fn list_events(
        &self,
        _token: &str,
        _calendar_id: &str,
        _range_start: Timestamp,
        _range_end: Timestamp,
    ) -> Result<Vec<CalendarEvent>, SourceError> {
        Self::err("calendar")
    }
}

impl IdentitySource for Unavailable {
    fn get_token(&self, _interactive: bool) -> Result<String, SourceError> {
        Err(SourceError::Auth("no identity provider".to_string()))
    }

    fn revoke(&self, _token: &str) -> Result<(), SourceError> {
        Ok(())
    }
}

/// The host collaborators; absent ones are filled with [`Unavailable`]
#[derive(Clone)]
pub struct Sources {
    pub history: Arc<dyn HistorySource>,
    pub tabs: Arc<dyn TabsSource>,
    pub bookmarks: Arc<dyn BookmarksSource>,
    pub sessions: Arc<dyn SessionsSource>,
    pub calendar: Arc<dyn CalendarSource>,
    pub identity: Arc<dyn IdentitySource>,
}

impl Sources {
    pub fn with_history(history: Arc<dyn HistorySource>) -> Self {
        Self {
            history,
            tabs: Arc::new(Unavailable),
            bookmarks: Arc::new(Unavailable),
            sessions: Arc::new(Unavailable),
            calendar: Arc::new(Unavailable),
            identity: Arc::new(Unavailable),
        }
    }
}

/// Events pushed by the collaborators into the background loop
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    NewVisit(VisitRecord),
    /// URLs removed from browser history outside this app
    UrlsRemoved(Vec<String>),
    TabCreated(Tab),
    TabUpdated(Tab),
    TabRemoved { tab_id: i64, window_id: i64 },
    TabActivated { tab_id: i64, window_id: i64 },
    BookmarksChanged,
}
