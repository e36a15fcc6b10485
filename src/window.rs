use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coalescer::WriteCoalescer;
use crate::store::DurableStore;

pub const WINDOW_STATE_KEY: &str = "window-state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub is_maximized: bool,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            x: 100,
            y: 100,
            width: 1200,
            height: 800,
            is_maximized: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DisplayBounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl WindowState {
    fn overlaps(&self, display: &DisplayBounds) -> bool {
        let (wl, wr) = (self.x, self.x + self.width as i32);
        let (wt, wb) = (self.y, self.y + self.height as i32);
        let (dl, dr) = (display.x, display.x + display.width as i32);
        let (dt, db) = (display.y, display.y + display.height as i32);
        wl < dr && wr > dl && wt < db && wb > dt
    }

    /// Recover a window stored while a monitor was attached that no longer
    /// is: a state entirely outside every display is recentered on the
    /// primary display, keeping its size and maximized flag.
    pub fn sanitize(self, displays: &[DisplayBounds]) -> WindowState {
        if displays.is_empty() || displays.iter().any(|d| self.overlaps(d)) {
            return self;
        }
        let primary = &displays[0];
        debug!("Window off-screen at ({}, {}), recentering", self.x, self.y);
        WindowState {
            x: primary.x + (primary.width as i32 - self.width as i32) / 2,
            y: primary.y + (primary.height as i32 - self.height as i32) / 2,
            width: self.width,
            height: self.height,
            is_maximized: self.is_maximized,
        }
    }
}

/// Tracks window geometry and persists it through the coalescer, so a drag
/// that fires dozens of move events per second costs one disk write.
pub struct WindowTracker {
    coalescer: Arc<WriteCoalescer>,
    state: WindowState,
}

impl WindowTracker {
    pub async fn load(
        store: &DurableStore,
        coalescer: Arc<WriteCoalescer>,
        displays: &[DisplayBounds],
    ) -> crate::Result<Self> {
        let state = store
            .read_as::<WindowState>(WINDOW_STATE_KEY)
            .await?
            .unwrap_or_default()
            .sanitize(displays);
        Ok(Self { coalescer, state })
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Window moved while unmaximized. Maximized moves are reported by
    /// window systems with the maximized frame bounds and must not clobber
    /// the remembered unmaximized position.
    pub async fn moved(&mut self, x: i32, y: i32) -> crate::Result<()> {
        if self.state.is_maximized {
            return Ok(());
        }
        self.state.x = x;
        self.state.y = y;
        self.persist().await
    }

    pub async fn resized(&mut self, width: u32, height: u32) -> crate::Result<()> {
        if self.state.is_maximized {
            return Ok(());
        }
        self.state.width = width;
        self.state.height = height;
        self.persist().await
    }

    /// Only the flag changes; the unmaximized bounds stay underneath so
    /// unmaximizing restores them.
    pub async fn set_maximized(&mut self, maximized: bool) -> crate::Result<()> {
        self.state.is_maximized = maximized;
        self.persist().await
    }

    async fn persist(&self) -> crate::Result<()> {
        let document = serde_json::to_value(self.state)?;
        self.coalescer
            .write_debounced(WINDOW_STATE_KEY, document)
            .await;
        Ok(())
    }
}
