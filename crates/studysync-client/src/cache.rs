//! Message cache reconciler.
//!
//! The single source of truth for the messages currently visible in a
//! room. Reconciles three write sources - local optimistic sends, server
//! confirmations, and change-feed events - into one de-duplicated,
//! newest-first view.
//!
//! # Invariants
//!
//! - At most one entry per message identity across all loaded pages.
//! - The flattened sequence is sorted strictly descending by creation
//!   timestamp; ties keep insertion order (stable).
//! - All mutations are idempotent keyed by identity, so the final state
//!   converges regardless of the arrival order of confirmations and feed
//!   events.

use studysync_core::{Message, MessageId};

/// Paginated, de-duplicated, newest-first view of a room's messages.
#[derive(Debug, Clone, Default)]
pub struct MessageCache {
    /// Pages newest-first; `pages[0]` is the live page receiving new
    /// messages, later pages hold older history merged in by the fetcher.
    pages: Vec<Vec<Message>>,
}

impl MessageCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self { pages: vec![Vec::new()] }
    }

    /// Number of cached messages.
    pub fn len(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    /// True if no messages are cached.
    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(Vec::is_empty)
    }

    /// True if a message with this identity is cached.
    pub fn contains(&self, id: MessageId) -> bool {
        self.find(id).is_some()
    }

    /// Visible messages, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.pages.iter().flatten()
    }

    /// Insert a locally sent message (optimistic path).
    ///
    /// No-op if the identity is already cached (e.g. the change feed beat
    /// the optimistic insert).
    pub fn insert_optimistic(&mut self, message: Message) {
        if self.contains(message.id) {
            return;
        }
        self.insert_sorted(message);
    }

    /// Upsert by identity: replace the cached entry in place, or insert at
    /// sorted position if absent.
    ///
    /// Idempotent - re-applying the same message leaves the cache
    /// unchanged. A replaced entry keeps its position unless the
    /// authoritative timestamp moved it, in which case it is re-sorted.
    pub fn confirm(&mut self, message: Message) {
        match self.find(message.id) {
            Some((page, index)) => {
                if self.pages[page][index].created_at == message.created_at {
                    self.pages[page][index] = message;
                } else {
                    self.pages[page].remove(index);
                    self.insert_sorted(message);
                }
            },
            None => self.insert_sorted(message),
        }
    }

    /// Remove by identity from all pages. Idempotent; returns whether an
    /// entry was removed.
    pub fn remove(&mut self, id: MessageId) -> bool {
        match self.find(id) {
            Some((page, index)) => {
                self.pages[page].remove(index);
                true
            },
            None => false,
        }
    }

    /// Merge an older history page from the fetcher.
    ///
    /// Entries whose identity is already cached are dropped (the feed may
    /// have delivered them while the fetch was in flight). The rest land
    /// at their sorted position, so a page straddling feed-delivered
    /// timestamps cannot break the descending order.
    pub fn push_history_page(&mut self, page: Vec<Message>) {
        self.pages.push(Vec::new());
        for message in page {
            if !self.contains(message.id) {
                self.insert_sorted(message);
            }
        }
    }

    fn find(&self, id: MessageId) -> Option<(usize, usize)> {
        self.pages.iter().enumerate().find_map(|(page_index, page)| {
            page.iter().position(|message| message.id == id).map(|index| (page_index, index))
        })
    }

    /// Insert at the globally sorted position: after every cached entry
    /// with a timestamp greater than or equal to the new one.
    fn insert_sorted(&mut self, message: Message) {
        for page in &mut self.pages {
            let index = page.partition_point(|cached| cached.created_at >= message.created_at);
            if index < page.len() {
                page.insert(index, message);
                return;
            }
        }
        if let Some(last) = self.pages.last_mut() {
            last.push(message);
        } else {
            self.pages.push(vec![message]);
        }
    }
}
