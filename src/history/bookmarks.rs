//! Bookmarks tree flattening and bookmarked-domain annotation

use std::collections::HashSet;

use serde::Serialize;

use crate::history::aggregator::extract_domain;
use crate::history::models::Timestamp;
use crate::history::sources::{BookmarkNode, BookmarksSource};
use crate::history::window::{build_flat_rows, FlatRow};

const FOLDER_SEPARATOR: &str = " / ";

/// A bookmark with the path of the folder holding it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkRow {
    pub id: String,
    pub title: String,
    pub url: String,
    pub folder: String,
    pub date_added: Option<Timestamp>,
}

/// Depth-first flattening; untitled root nodes do not appear in paths
pub fn flatten(tree: &[BookmarkNode]) -> Vec<BookmarkRow> {
    let mut rows = Vec::new();
    let mut path = Vec::new();
    for node in tree {
        walk(node, &mut path, &mut rows);
    }
    rows
}

fn walk<'a>(node: &'a BookmarkNode, path: &mut Vec<&'a str>, rows: &mut Vec<BookmarkRow>) {
    match &node.url {
        Some(url) => rows.push(BookmarkRow {
            id: node.id.clone(),
            title: node.title.clone(),
            url: url.clone(),
            folder: path.join(FOLDER_SEPARATOR),
            date_added: node.date_added,
        }),
        None => {
            let titled = !node.title.is_empty();
            if titled {
                path.push(&node.title);
            }
            for child in &node.children {
                walk(child, path, rows);
            }
            if titled {
                path.pop();
            }
        }
    }
}

/// Domains with at least one bookmark
pub fn bookmarked_domains(rows: &[BookmarkRow]) -> HashSet<String> {
    rows.iter().filter_map(|row| extract_domain(&row.url)).collect()
}

/// Bookmarks grouped by folder, ready for grouped-list windowing
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarksView {
    pub bookmarks: Vec<BookmarkRow>,
    pub rows: Vec<FlatRow>,
}

impl BookmarksView {
    pub fn new(mut bookmarks: Vec<BookmarkRow>, collapsed: &HashSet<String>) -> Self {
        // stable: keeps tree order inside each folder
        bookmarks.sort_by(|a, b| a.folder.cmp(&b.folder));
        let rows = build_flat_rows(&bookmarks, |row| row.folder.clone(), collapsed);
        Self { bookmarks, rows }
    }

    /// Read the tree from the source; failures yield an empty view
    pub fn load(source: &dyn BookmarksSource, collapsed: &HashSet<String>) -> Self {
        match source.get_tree() {
            Ok(tree) => Self::new(flatten(&tree), collapsed),
            Err(e) => {
                log::warn!("Bookmarks unavailable: {}", e);
                Self::default()
            }
        }
    }

    pub fn domains(&self) -> HashSet<String> {
        bookmarked_domains(&self.bookmarks)
    }
}

/// Whether `url` is bookmarked; lookup failures count as not bookmarked
pub fn is_bookmarked(source: &dyn BookmarksSource, url: &str) -> bool {
    match source.search(url) {
        Ok(nodes) => nodes.iter().any(|node| node.url.as_deref() == Some(url)),
        Err(e) => {
            log::debug!("Bookmark lookup failed for {}: {}", url, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::sources::{SourceError, Unavailable};

    fn folder(id: &str, title: &str, children: Vec<BookmarkNode>) -> BookmarkNode {
        BookmarkNode {
            id: id.to_string(),
            title: title.to_string(),
            url: None,
            parent_id: None,
            date_added: None,
            children,
        }
    }

    fn link(id: &str, title: &str, url: &str) -> BookmarkNode {
        BookmarkNode {
            id: id.to_string(),
            title: title.to_string(),
            url: Some(url.to_string()),
            parent_id: None,
            date_added: Some(1),
            children: Vec::new(),
        }
    }

    fn tree() -> Vec<BookmarkNode> {
        vec![folder(
            "0",
            "",
            vec![
                folder(
                    "1",
                    "Bar",
                    vec![
                        link("3", "Docs", "https://www.docs.rs/"),
                        folder("4", "Dev", vec![link("5", "Crates", "https://crates.io/")]),
                    ],
                ),
                folder("2", "Other", vec![link("6", "News", "https://news.example.com/")]),
            ],
        )]
    }

    struct FixedTree;

    impl BookmarksSource for FixedTree {
        fn get_tree(&self) -> Result<Vec<BookmarkNode>, SourceError> {
            Ok(tree())
        }

        fn search(&self, url: &str) -> Result<Vec<BookmarkNode>, SourceError> {
            Ok(flatten(&tree())
                .into_iter()
                .filter(|row| row.url.contains(url))
                .map(|row| link(&row.id, &row.title, &row.url))
                .collect())
        }

        fn create(&self, _parent_id: &str, title: &str, url: &str) -> Result<BookmarkNode, SourceError> {
            Ok(link("new", title, url))
        }

        fn remove(&self, _id: &str) -> Result<(), SourceError> {
            Ok(())
        }

        fn move_node(&self, _id: &str, _parent_id: &str, _index: Option<usize>) -> Result<(), SourceError> {
            Ok(())
        }
    }

    #[test]
    fn test_flatten_builds_folder_paths() {
        let rows = flatten(&tree());
        let folders: Vec<&str> = rows.iter().map(|r| r.folder.as_str()).collect();
        assert_eq!(folders, vec!["Bar", "Bar / Dev", "Other"]);
    }

    #[test]
    fn test_bookmarked_domains_strip_www() {
        let domains = bookmarked_domains(&flatten(&tree()));
        assert!(domains.contains("docs.rs"));
        assert!(domains.contains("crates.io"));
        assert_eq!(domains.len(), 3);
    }

    #[test]
    fn test_view_groups_by_folder() {
        let collapsed: HashSet<String> = ["Other".to_string()].into_iter().collect();
        let view = BookmarksView::load(&FixedTree, &collapsed);
        assert_eq!(view.bookmarks.len(), 3);
        // three headers, two visible items
        assert_eq!(view.rows.len(), 5);
        assert_eq!(view.rows.iter().filter(|r| r.is_header()).count(), 3);
    }

    #[test]
    fn test_unavailable_source_yields_empty_view() {
        let view = BookmarksView::load(&Unavailable, &HashSet::new());
        assert!(view.bookmarks.is_empty());
        assert!(!is_bookmarked(&Unavailable, "https://docs.rs/"));
        assert!(is_bookmarked(&FixedTree, "https://crates.io/"));
    }
}
