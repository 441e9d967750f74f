//! Scroll mirroring across the row-label, column-header and grid panes

use serde::{Deserialize, Serialize};

/// The three independently scrollable panes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Pane {
    /// Domain column, vertical only
    RowLabels,
    /// Date/hour header, horizontal only
    ColumnHeaders,
    /// Cell grid, both axes
    Grid,
}

/// Instruction for the render layer to move a pane
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "axis")]
pub enum ScrollCommand {
    SetTop { pane: Pane, offset: f64 },
    SetLeft { pane: Pane, offset: f64 },
}

/// Mirrors offsets between panes without feedback loops
///
/// Propagating in a direction raises that direction's guard; the echo scroll
/// event that the target pane fires back is swallowed until the next
/// animation frame clears the guard.
#[derive(Debug, Clone, Default)]
pub struct ScrollSync {
    top: f64,
    left: f64,
    syncing_vertical: bool,
    syncing_horizontal: bool,
    hover: Option<(usize, usize)>,
}

impl ScrollSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scroll_top(&self) -> f64 {
        self.top
    }

    pub fn scroll_left(&self) -> f64 {
        self.left
    }

    /// Row/column under the pointer, if still valid
    pub fn hover(&self) -> Option<(usize, usize)> {
        self.hover
    }

    pub fn set_hover(&mut self, row: usize, col: usize) {
        self.hover = Some((row, col));
    }

    pub fn clear_hover(&mut self) {
        self.hover = None;
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing_vertical || self.syncing_horizontal
    }

    /// Handle a scroll event fired by `pane`
    ///
    /// Offsets the pane does not scroll on are ignored. Returns the commands
    /// needed to bring the other panes in line.
    pub fn on_scroll(&mut self, pane: Pane, scroll_top: f64, scroll_left: f64) -> Vec<ScrollCommand> {
        // hover coordinates go stale as soon as content shifts
        self.hover = None;

        let mut commands = Vec::new();
        match pane {
            Pane::Grid => {
                if let Some(top) = self.accept_vertical(scroll_top) {
                    commands.push(ScrollCommand::SetTop {
                        pane: Pane::RowLabels,
                        offset: top,
                    });
                }
                if let Some(left) = self.accept_horizontal(scroll_left) {
                    commands.push(ScrollCommand::SetLeft {
                        pane: Pane::ColumnHeaders,
                        offset: left,
                    });
                }
            }
            Pane::RowLabels => {
                if let Some(top) = self.accept_vertical(scroll_top) {
                    commands.push(ScrollCommand::SetTop {
                        pane: Pane::Grid,
                        offset: top,
                    });
                }
            }
            Pane::ColumnHeaders => {
                if let Some(left) = self.accept_horizontal(scroll_left) {
                    commands.push(ScrollCommand::SetLeft {
                        pane: Pane::Grid,
                        offset: left,
                    });
                }
            }
        }
        commands
    }

    fn accept_vertical(&mut self, top: f64) -> Option<f64> {
        if self.syncing_vertical || top == self.top {
            self.top = top;
            return None;
        }
        self.top = top;
        self.syncing_vertical = true;
        Some(top)
    }

    fn accept_horizontal(&mut self, left: f64) -> Option<f64> {
        if self.syncing_horizontal || left == self.left {
            self.left = left;
            return None;
        }
        self.left = left;
        self.syncing_horizontal = true;
        Some(left)
    }

    /// Clear both guards; call once per animation frame
    pub fn on_animation_frame(&mut self) {
        self.syncing_vertical = false;
        self.syncing_horizontal = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_scroll_propagates_both_axes() {
        let mut sync = ScrollSync::new();
        let commands = sync.on_scroll(Pane::Grid, 120.0, 64.0);
        assert_eq!(
            commands,
            vec![
                ScrollCommand::SetTop { pane: Pane::RowLabels, offset: 120.0 },
                ScrollCommand::SetLeft { pane: Pane::ColumnHeaders, offset: 64.0 },
            ]
        );
        assert!(sync.is_syncing());
    }

    #[test]
    fn test_echo_events_do_not_loop() {
        let mut sync = ScrollSync::new();
        sync.on_scroll(Pane::Grid, 120.0, 0.0);

        // the row-label pane fires back after being moved programmatically
        assert!(sync.on_scroll(Pane::RowLabels, 120.0, 0.0).is_empty());
        sync.on_animation_frame();
        assert!(!sync.is_syncing());

        // next user scroll on the labels drives the grid
        let commands = sync.on_scroll(Pane::RowLabels, 80.0, 0.0);
        assert_eq!(commands, vec![ScrollCommand::SetTop { pane: Pane::Grid, offset: 80.0 }]);
    }

    #[test]
    fn test_guard_is_per_direction() {
        let mut sync = ScrollSync::new();
        sync.on_scroll(Pane::RowLabels, 40.0, 0.0);
        // vertical guard up, horizontal still free
        let commands = sync.on_scroll(Pane::ColumnHeaders, 0.0, 90.0);
        assert_eq!(commands, vec![ScrollCommand::SetLeft { pane: Pane::Grid, offset: 90.0 }]);
        assert_eq!(sync.scroll_top(), 40.0);
        assert_eq!(sync.scroll_left(), 90.0);
    }

    #[test]
    fn test_any_scroll_clears_hover() {
        let mut sync = ScrollSync::new();
        sync.set_hover(3, 7);
        assert_eq!(sync.hover(), Some((3, 7)));
        sync.on_scroll(Pane::ColumnHeaders, 0.0, 0.0);
        assert_eq!(sync.hover(), None);
    }
}
