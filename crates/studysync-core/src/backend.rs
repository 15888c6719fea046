//! Capability traits for the hosted data backend.
//!
//! The client consumes four capabilities: a row store (queries and
//! mutations), a row-level change feed (at-least-once, best-effort ordering),
//! an ephemeral pub/sub primitive (presence and typing), and a blob store
//! (message attachments). Each is a trait so tests inject in-memory doubles;
//! [`Backend`] bundles them into one passed-down handle.
//!
//! Subscriptions are scoped acquisitions: dropping a [`FeedSubscription`] or
//! a boxed [`RealtimeChannel`] releases the underlying stream.

use std::{any::Any, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    error::BackendError,
    types::{DraftMessage, MessageId, RoomId, UserId},
};

/// Kind of a row-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChangeKind {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

/// A row-level change notification from the backend.
///
/// Delivery is at-least-once and cross-row ordering is not guaranteed;
/// consumers must apply these idempotently, keyed by row identity.
#[derive(Debug, Clone)]
pub struct RowChange {
    /// What happened to the row.
    pub kind: RowChangeKind,
    /// Row state after the change. `None` for deletes.
    pub new: Option<Value>,
    /// Row state before the change. `None` for inserts.
    pub old: Option<Value>,
}

/// Row queries and mutations against the hosted store.
///
/// Rows cross this boundary as raw JSON and are validated by the caller at
/// the parse boundary in [`crate::row`](crate::draft_from_row).
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Fetch one page of message rows for a room, newest-first.
    ///
    /// Rows are ordered strictly descending by creation timestamp (ties
    /// stable by insertion order) and windowed by `offset`/`limit`. When
    /// `search` is present the backend narrows by text match on content.
    /// An empty result is valid and distinct from an error.
    async fn message_page(
        &self,
        room_id: RoomId,
        offset: usize,
        limit: usize,
        search: Option<&str>,
    ) -> Result<Vec<Value>, BackendError>;

    /// Insert a draft message row. Returns the confirmed row.
    async fn insert_message(&self, draft: &DraftMessage) -> Result<Value, BackendError>;

    /// Patch a message row's attachment URL. Returns the updated row.
    async fn set_attachment_url(&self, id: MessageId, url: &str) -> Result<Value, BackendError>;

    /// Fetch a single profile row.
    async fn profile(&self, id: UserId) -> Result<Value, BackendError>;

    /// Fetch the profile rows of a room's members.
    async fn room_members(&self, room_id: RoomId) -> Result<Vec<Value>, BackendError>;
}

/// Handle to an active change-feed subscription.
///
/// Dropping the subscription releases the stream on the backend side.
pub struct FeedSubscription {
    events: mpsc::UnboundedReceiver<RowChange>,
    _guard: Box<dyn Any + Send>,
}

impl FeedSubscription {
    /// Build a subscription from a receiver and a release-on-drop guard.
    pub fn new(events: mpsc::UnboundedReceiver<RowChange>, guard: Box<dyn Any + Send>) -> Self {
        Self { events, _guard: guard }
    }

    /// Next change notification. `None` once the backend closes the stream.
    ///
    /// Cancel-safe: a cancelled `recv` loses no events.
    pub async fn recv(&mut self) -> Option<RowChange> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription").finish_non_exhaustive()
    }
}

/// Row-level change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to insert/update/delete events for one room's messages.
    async fn subscribe_messages(&self, room_id: RoomId) -> Result<FeedSubscription, BackendError>;
}

/// Event delivered on an ephemeral pub/sub channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel is established; presence tracking may begin.
    Subscribed,
    /// Full presence snapshot, delivered once after announcing self.
    PresenceSync {
        /// All participant ids currently tracked on the topic.
        user_ids: Vec<UserId>,
    },
    /// Participants connected to the topic.
    PresenceJoin {
        /// Newly tracked participant ids.
        user_ids: Vec<UserId>,
    },
    /// Participants disconnected from the topic.
    PresenceLeave {
        /// No-longer-tracked participant ids.
        user_ids: Vec<UserId>,
    },
    /// An application broadcast (e.g. a typing signal).
    Broadcast {
        /// Application-defined event name.
        event: String,
        /// Application-defined payload.
        payload: Value,
    },
}

/// An open ephemeral channel on one topic.
///
/// Broadcasts are delivered to every subscriber of the topic, including the
/// publisher; consumers filter self-originated events where that matters.
/// Dropping the boxed channel unsubscribes and, if self was tracked,
/// removes self from the topic's presence state for other observers
/// (best-effort; a network partition may delay the remote side).
#[async_trait]
pub trait RealtimeChannel: Send {
    /// Announce self in the topic's presence state.
    async fn track(&mut self, user_id: UserId) -> Result<(), BackendError>;

    /// Publish a broadcast to all subscribers of the topic.
    async fn publish(&mut self, event: &str, payload: Value) -> Result<(), BackendError>;

    /// Next channel event. `None` once the channel is closed.
    ///
    /// Implementations must be cancel-safe.
    async fn recv(&mut self) -> Option<ChannelEvent>;
}

/// Ephemeral pub/sub channels, keyed by topic string.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Open a channel on `topic`.
    ///
    /// `presence_key` identifies this participant in the topic's presence
    /// state once [`RealtimeChannel::track`] is called.
    async fn channel(
        &self,
        topic: &str,
        presence_key: UserId,
    ) -> Result<Box<dyn RealtimeChannel>, BackendError>;
}

/// Object storage for message attachments.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload a blob. Returns the stored path.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError>;

    /// Publicly servable URL for a stored path.
    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Bundled backend handle, passed down explicitly (no global singleton).
#[derive(Clone)]
pub struct Backend {
    /// Row queries and mutations.
    pub rows: Arc<dyn RowStore>,
    /// Row-level change notifications.
    pub feed: Arc<dyn ChangeFeed>,
    /// Ephemeral pub/sub channels.
    pub pubsub: Arc<dyn PubSub>,
    /// Attachment blob storage.
    pub blobs: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

/// Presence topic for a room.
pub fn presence_topic(room_id: RoomId) -> String {
    format!("presence-{room_id}")
}

/// Typing-indicator topic for a room.
pub fn typing_topic(room_id: RoomId) -> String {
    format!("typing-{room_id}")
}
