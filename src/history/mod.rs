//! History Heatmap - aggregation, windowing and persistence module

pub mod models;
pub mod config;
pub mod reader;
pub mod aggregator;
pub mod sort;
pub mod window;
pub mod scroll;
pub mod color;
pub mod kv;
pub mod tracker;
pub mod cache;
pub mod background;
pub mod sources;
pub mod tabs;
pub mod bookmarks;
pub mod favicon;
pub mod calendar;

pub use models::*;
pub use config::*;
pub use reader::*;
pub use aggregator::{extract_domain, is_web_url, DateRange};
pub use sort::*;
pub use window::*;
pub use scroll::*;
pub use color::*;
pub use kv::*;
pub use tracker::*;
pub use cache::*;
pub use background::*;
pub use sources::*;
pub use tabs::*;
pub use bookmarks::{BookmarkRow, BookmarksView};
pub use favicon::*;
pub use calendar::*;
