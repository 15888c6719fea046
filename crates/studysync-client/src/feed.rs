//! Change-feed listener.
//!
//! Normalizes raw row-change notifications into message-cache operations.
//! The feed is at-least-once with no cross-row ordering guarantee, so every
//! application is an idempotent upsert or remove keyed by message identity.
//!
//! Inserts authored by this session are expected to already be cached via
//! the optimistic path; they are skipped by identity. If such an insert is
//! unexpectedly missing the listener warns and heals by inserting the
//! reconstructed record.

use studysync_core::{RowChange, RowChangeKind, UserId, draft_from_row};

use crate::{cache::MessageCache, roster::MemberRoster};

use serde_json::Value;
use studysync_core::{Message, MessageId};

/// What a feed event did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// A new message entered the cache.
    Inserted(MessageId),
    /// An existing entry was replaced.
    Updated(MessageId),
    /// An entry was removed.
    Removed(MessageId),
    /// Duplicate delivery, self-echo, or malformed payload; cache
    /// untouched.
    Ignored,
}

/// Routes change-feed events into the message cache.
#[derive(Debug, Clone, Copy)]
pub struct ChangeFeedListener {
    self_id: UserId,
}

impl ChangeFeedListener {
    /// Create a listener for this session's participant.
    pub fn new(self_id: UserId) -> Self {
        Self { self_id }
    }

    /// Apply one feed event to the cache.
    ///
    /// Author snapshots are resolved through the roster (cached, lazily
    /// fetched, or placeholder). Malformed payloads are skipped and
    /// logged, never aborting the feed.
    pub async fn apply(
        &self,
        change: &RowChange,
        cache: &mut MessageCache,
        roster: &mut MemberRoster,
    ) -> FeedOutcome {
        match change.kind {
            RowChangeKind::Insert => self.apply_insert(change.new.as_ref(), cache, roster).await,
            RowChangeKind::Update => self.apply_update(change.new.as_ref(), cache, roster).await,
            RowChangeKind::Delete => Self::apply_delete(change.old.as_ref(), cache),
        }
    }

    async fn apply_insert(
        &self,
        row: Option<&Value>,
        cache: &mut MessageCache,
        roster: &mut MemberRoster,
    ) -> FeedOutcome {
        let Some(draft) = parse_row(row, "insert") else {
            return FeedOutcome::Ignored;
        };

        if cache.contains(draft.id) {
            // At-least-once delivery, or the echo of our own optimistic
            // insert. Either way the identity is already represented.
            return FeedOutcome::Ignored;
        }

        if draft.author_id == self.self_id {
            tracing::warn!(
                message_id = %draft.id,
                "own insert missing from cache, healing"
            );
        }

        let author = roster.resolve(draft.author_id).await;
        let id = draft.id;
        cache.confirm(Message::from_draft(&draft, author));
        FeedOutcome::Inserted(id)
    }

    async fn apply_update(
        &self,
        row: Option<&Value>,
        cache: &mut MessageCache,
        roster: &mut MemberRoster,
    ) -> FeedOutcome {
        let Some(draft) = parse_row(row, "update") else {
            return FeedOutcome::Ignored;
        };

        let author = roster.resolve(draft.author_id).await;
        let id = draft.id;
        let existed = cache.contains(id);
        cache.confirm(Message::from_draft(&draft, author));
        if existed { FeedOutcome::Updated(id) } else { FeedOutcome::Inserted(id) }
    }

    fn apply_delete(row: Option<&Value>, cache: &mut MessageCache) -> FeedOutcome {
        let Some(draft) = parse_row(row, "delete") else {
            return FeedOutcome::Ignored;
        };

        if cache.remove(draft.id) { FeedOutcome::Removed(draft.id) } else { FeedOutcome::Ignored }
    }
}

fn parse_row(row: Option<&Value>, kind: &'static str) -> Option<studysync_core::DraftMessage> {
    let Some(row) = row else {
        tracing::warn!(kind, "feed event carried no row payload");
        return None;
    };
    match draft_from_row(row) {
        Ok(draft) => Some(draft),
        Err(error) => {
            tracing::warn!(kind, %error, "skipping malformed feed row");
            None
        },
    }
}
