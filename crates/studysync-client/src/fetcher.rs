//! Paginated message history fetcher.
//!
//! Retrieves history newest-first in fixed-size windows, with an optional
//! server-side text search narrowing. Each distinct `(room, search)` pair
//! is its own [`PageKey`] with an independent offset cursor and
//! end-of-data flag, so the unfiltered view and any filtered views page
//! independently.

use std::{collections::HashMap, sync::Arc};

use studysync_core::{Message, RoomId, RowStore, message_from_row};

use crate::error::FetchError;

/// Fixed page size for history retrieval.
pub const PAGE_SIZE: usize = 50;

/// Composite cursor key: one pagination window per room and search text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    /// Room whose history is windowed.
    pub room_id: RoomId,
    /// Optional text-search narrowing. `None` is the unfiltered window.
    pub search: Option<String>,
}

impl PageKey {
    /// Unfiltered window for a room.
    pub fn unfiltered(room_id: RoomId) -> Self {
        Self { room_id, search: None }
    }

    /// Text-filtered window for a room.
    pub fn filtered(room_id: RoomId, search: impl Into<String>) -> Self {
        Self { room_id, search: Some(search.into()) }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    offset: usize,
    exhausted: bool,
}

/// Cursor-based history fetcher over the row store.
pub struct PageFetcher {
    rows: Arc<dyn RowStore>,
    cursors: HashMap<PageKey, Cursor>,
}

impl PageFetcher {
    /// Create a fetcher over the given row store.
    pub fn new(rows: Arc<dyn RowStore>) -> Self {
        Self { rows, cursors: HashMap::new() }
    }

    /// Fetch the next page for this window, newest-first.
    ///
    /// Advances the cursor only on success; a failed fetch leaves the
    /// window where it was so the caller can retry. Once the backend
    /// returns fewer than [`PAGE_SIZE`] raw rows the window is exhausted
    /// and further calls short-circuit to an empty page. Rows that fail to
    /// parse are skipped and logged, never aborting the page.
    pub async fn next_page(&mut self, key: &PageKey) -> Result<Vec<Message>, FetchError> {
        let cursor = self.cursors.entry(key.clone()).or_default();
        if cursor.exhausted {
            return Ok(Vec::new());
        }

        let raw = self
            .rows
            .message_page(key.room_id, cursor.offset, PAGE_SIZE, key.search.as_deref())
            .await?;

        cursor.offset += raw.len();
        cursor.exhausted = raw.len() < PAGE_SIZE;

        let mut page = Vec::with_capacity(raw.len());
        for row in &raw {
            match message_from_row(row) {
                Ok(message) => page.push(message),
                Err(error) => {
                    tracing::warn!(room_id = %key.room_id, %error, "skipping malformed row");
                },
            }
        }
        Ok(page)
    }

    /// True if this window has no further history.
    pub fn is_exhausted(&self, key: &PageKey) -> bool {
        self.cursors.get(key).is_some_and(|cursor| cursor.exhausted)
    }

    /// Drop a window's cursor so the next fetch starts from the top.
    pub fn reset(&mut self, key: &PageKey) {
        self.cursors.remove(key);
    }
}

impl std::fmt::Debug for PageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFetcher").field("cursors", &self.cursors).finish_non_exhaustive()
    }
}
