//! In-memory backend double.
//!
//! Implements every backend capability over one shared state table:
//! message rows with stable newest-first ordering, profile and membership
//! tables, a per-room change feed, per-topic presence/broadcast channels
//! with publisher echo, and an attachment blob map. Fault flags let tests
//! fail individual operations. Feed and channel registrations are removed
//! when their handles drop, mirroring the release-on-drop contract of the
//! real backend.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde_json::{Value, json};
use studysync_core::{
    Backend, BackendError, BlobStore, ChangeFeed, ChannelEvent, DraftMessage, FeedSubscription,
    MessageId, Profile, PubSub, RealtimeChannel, RoomId, RowChange, RowChangeKind, RowStore,
    UserId,
};
use tokio::sync::mpsc;

/// Shared in-memory backend implementing all four capabilities.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Faults {
    inserts: bool,
    patches: bool,
    uploads: bool,
    profile_fetches: bool,
}

#[derive(Default)]
struct Inner {
    messages: Vec<DraftMessage>,
    profiles: HashMap<UserId, Profile>,
    members: HashMap<RoomId, Vec<UserId>>,
    blobs: HashMap<String, Vec<u8>>,
    feeds: HashMap<RoomId, Vec<FeedEntry>>,
    topics: HashMap<String, Vec<TopicEntry>>,
    next_handle: u64,
    faults: Faults,
}

struct FeedEntry {
    handle: u64,
    sender: mpsc::UnboundedSender<RowChange>,
}

struct TopicEntry {
    handle: u64,
    user_id: UserId,
    tracked: bool,
    sender: mpsc::UnboundedSender<ChannelEvent>,
}

fn flat_row(message: &DraftMessage) -> Value {
    json!({
        "id": message.id.as_uuid().to_string(),
        "study_room_id": message.study_room_id.as_uuid().to_string(),
        "author_id": message.author_id.as_uuid().to_string(),
        "content": message.content,
        "attachment_url": message.attachment_url,
        "created_at": message.created_at.to_rfc3339(),
    })
}

fn profile_row(profile: &Profile) -> Value {
    json!({
        "id": profile.id.as_uuid().to_string(),
        "name": profile.name,
        "handle": profile.handle,
        "avatar_url": profile.avatar_url,
        "major": profile.major,
    })
}

fn joined_row(message: &DraftMessage, author: Option<&Profile>) -> Value {
    json!({
        "id": message.id.as_uuid().to_string(),
        "study_room_id": message.study_room_id.as_uuid().to_string(),
        "author": author.map(profile_row),
        "content": message.content,
        "attachment_url": message.attachment_url,
        "created_at": message.created_at.to_rfc3339(),
    })
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())) }
    }

    /// Bundle this backend into the capability handle the client consumes.
    pub fn backend(&self) -> Backend {
        let this = Arc::new(self.clone());
        Backend { rows: this.clone(), feed: this.clone(), pubsub: this.clone(), blobs: this }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a test thread panicked; the state
        // itself is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a profile row.
    pub fn seed_profile(&self, profile: Profile) {
        self.lock().profiles.insert(profile.id, profile);
    }

    /// Register a user as a room member.
    pub fn add_member(&self, room_id: RoomId, user_id: UserId) {
        self.lock().members.entry(room_id).or_default().push(user_id);
    }

    /// Store a message row without emitting a feed event (history).
    pub fn seed_message(&self, message: DraftMessage) {
        self.lock().messages.push(message);
    }

    /// Re-emit the insert event for a stored row (duplicate delivery).
    pub fn replay_insert(&self, id: MessageId) -> bool {
        let mut inner = self.lock();
        let Some(message) = inner.messages.iter().find(|m| m.id == id).cloned() else {
            return false;
        };
        let change =
            RowChange { kind: RowChangeKind::Insert, new: Some(flat_row(&message)), old: None };
        inner.notify_feed(message.study_room_id, &change);
        true
    }

    /// Remove a stored row and emit a delete event.
    pub fn delete_message(&self, id: MessageId) -> bool {
        let mut inner = self.lock();
        let Some(index) = inner.messages.iter().position(|m| m.id == id) else {
            return false;
        };
        let message = inner.messages.remove(index);
        let change =
            RowChange { kind: RowChangeKind::Delete, new: None, old: Some(flat_row(&message)) };
        inner.notify_feed(message.study_room_id, &change);
        true
    }

    /// Number of stored rows for a room.
    pub fn message_count(&self, room_id: RoomId) -> usize {
        self.lock().messages.iter().filter(|m| m.study_room_id == room_id).count()
    }

    /// Stored blob contents, if any.
    pub fn blob(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(&format!("{bucket}/{path}")).cloned()
    }

    /// Fail subsequent message inserts.
    pub fn fail_inserts(&self, fail: bool) {
        self.lock().faults.inserts = fail;
    }

    /// Fail subsequent attachment patches.
    pub fn fail_patches(&self, fail: bool) {
        self.lock().faults.patches = fail;
    }

    /// Fail subsequent blob uploads.
    pub fn fail_uploads(&self, fail: bool) {
        self.lock().faults.uploads = fail;
    }

    /// Fail subsequent single-profile fetches.
    pub fn fail_profile_fetches(&self, fail: bool) {
        self.lock().faults.profile_fetches = fail;
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").finish_non_exhaustive()
    }
}

impl Inner {
    fn notify_feed(&mut self, room_id: RoomId, change: &RowChange) {
        if let Some(entries) = self.feeds.get_mut(&room_id) {
            entries.retain(|entry| entry.sender.send(change.clone()).is_ok());
        }
    }

    fn notify_topic(&mut self, topic: &str, event: &ChannelEvent, skip: Option<u64>) {
        if let Some(entries) = self.topics.get_mut(topic) {
            entries.retain(|entry| {
                if skip == Some(entry.handle) {
                    return true;
                }
                entry.sender.send(event.clone()).is_ok()
            });
        }
    }

    fn tracked_users(&self, topic: &str) -> Vec<UserId> {
        self.topics
            .get(topic)
            .map(|entries| {
                entries.iter().filter(|entry| entry.tracked).map(|entry| entry.user_id).collect()
            })
            .unwrap_or_default()
    }

    fn take_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

#[async_trait]
impl RowStore for MemoryBackend {
    async fn message_page(
        &self,
        room_id: RoomId,
        offset: usize,
        limit: usize,
        search: Option<&str>,
    ) -> Result<Vec<Value>, BackendError> {
        let inner = self.lock();
        let needle = search.map(str::to_lowercase);
        let mut rows: Vec<&DraftMessage> = inner
            .messages
            .iter()
            .filter(|m| m.study_room_id == room_id)
            .filter(|m| {
                needle.as_deref().is_none_or(|text| m.content.to_lowercase().contains(text))
            })
            .collect();
        // Stable sort keeps insertion order among equal timestamps.
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|m| joined_row(m, inner.profiles.get(&m.author_id)))
            .collect())
    }

    async fn insert_message(&self, draft: &DraftMessage) -> Result<Value, BackendError> {
        let mut inner = self.lock();
        if inner.faults.inserts {
            return Err(BackendError::Network("insert refused".to_string()));
        }

        inner.messages.push(draft.clone());
        let row = flat_row(draft);
        let change = RowChange { kind: RowChangeKind::Insert, new: Some(row.clone()), old: None };
        inner.notify_feed(draft.study_room_id, &change);
        Ok(row)
    }

    async fn set_attachment_url(&self, id: MessageId, url: &str) -> Result<Value, BackendError> {
        let mut inner = self.lock();
        if inner.faults.patches {
            return Err(BackendError::Query("patch refused".to_string()));
        }

        let Some(index) = inner.messages.iter().position(|m| m.id == id) else {
            return Err(BackendError::Query(format!("no message row {id}")));
        };
        let old = flat_row(&inner.messages[index]);
        inner.messages[index].attachment_url = Some(url.to_string());

        let message = inner.messages[index].clone();
        let row = flat_row(&message);
        let change =
            RowChange { kind: RowChangeKind::Update, new: Some(row.clone()), old: Some(old) };
        inner.notify_feed(message.study_room_id, &change);
        Ok(row)
    }

    async fn profile(&self, id: UserId) -> Result<Value, BackendError> {
        let inner = self.lock();
        if inner.faults.profile_fetches {
            return Err(BackendError::Network("profile fetch refused".to_string()));
        }
        inner
            .profiles
            .get(&id)
            .map(profile_row)
            .ok_or_else(|| BackendError::Query(format!("no profile row {id}")))
    }

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<Value>, BackendError> {
        let inner = self.lock();
        Ok(inner
            .members
            .get(&room_id)
            .map(|ids| {
                ids.iter().filter_map(|id| inner.profiles.get(id)).map(profile_row).collect()
            })
            .unwrap_or_default())
    }
}

/// Unregisters a feed entry when the subscription drops.
struct FeedGuard {
    inner: Arc<Mutex<Inner>>,
    room_id: RoomId,
    handle: u64,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = inner.feeds.get_mut(&self.room_id) {
            entries.retain(|entry| entry.handle != self.handle);
        }
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe_messages(&self, room_id: RoomId) -> Result<FeedSubscription, BackendError> {
        let mut inner = self.lock();
        let handle = inner.take_handle();
        let (sender, receiver) = mpsc::unbounded_channel();
        inner.feeds.entry(room_id).or_default().push(FeedEntry { handle, sender });
        tracing::trace!(%room_id, handle, "feed subscription registered");

        let guard = FeedGuard { inner: self.inner.clone(), room_id, handle };
        Ok(FeedSubscription::new(receiver, Box::new(guard)))
    }
}

/// One open pub/sub channel on a topic.
struct MemoryChannel {
    inner: Arc<Mutex<Inner>>,
    topic: String,
    handle: u64,
    user_id: UserId,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
impl RealtimeChannel for MemoryChannel {
    async fn track(&mut self, user_id: UserId) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = inner.topics.get_mut(&self.topic) else {
            return Err(BackendError::ChannelClosed);
        };
        let Some(entry) = entries.iter_mut().find(|entry| entry.handle == self.handle) else {
            return Err(BackendError::ChannelClosed);
        };
        entry.tracked = true;
        entry.user_id = user_id;

        // Full snapshot to the tracker, incremental join to everyone else.
        let snapshot = inner.tracked_users(&self.topic);
        inner.notify_topic(
            &self.topic,
            &ChannelEvent::PresenceJoin { user_ids: vec![user_id] },
            Some(self.handle),
        );
        if let Some(entries) = inner.topics.get(&self.topic)
            && let Some(entry) = entries.iter().find(|entry| entry.handle == self.handle)
        {
            let _ = entry.sender.send(ChannelEvent::PresenceSync { user_ids: snapshot });
        }
        Ok(())
    }

    async fn publish(&mut self, event: &str, payload: Value) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.topics.get(&self.topic).is_some_and(|entries| {
            entries.iter().any(|entry| entry.handle == self.handle)
        }) {
            return Err(BackendError::ChannelClosed);
        }
        // Publisher echo included, as on the real channel.
        inner.notify_topic(
            &self.topic,
            &ChannelEvent::Broadcast { event: event.to_string(), payload },
            None,
        );
        Ok(())
    }

    async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut was_tracked = false;
        if let Some(entries) = inner.topics.get_mut(&self.topic)
            && let Some(index) = entries.iter().position(|entry| entry.handle == self.handle)
        {
            was_tracked = entries[index].tracked;
            entries.remove(index);
        }
        if was_tracked {
            inner.notify_topic(
                &self.topic,
                &ChannelEvent::PresenceLeave { user_ids: vec![self.user_id] },
                None,
            );
        }
    }
}

#[async_trait]
impl PubSub for MemoryBackend {
    async fn channel(
        &self,
        topic: &str,
        presence_key: UserId,
    ) -> Result<Box<dyn RealtimeChannel>, BackendError> {
        let mut inner = self.lock();
        let handle = inner.take_handle();
        let (sender, events) = mpsc::unbounded_channel();
        let _ = sender.send(ChannelEvent::Subscribed);
        inner.topics.entry(topic.to_string()).or_default().push(TopicEntry {
            handle,
            user_id: presence_key,
            tracked: false,
            sender,
        });
        tracing::trace!(topic, handle, "channel opened");

        Ok(Box::new(MemoryChannel {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            handle,
            user_id: presence_key,
            events,
        }))
    }
}

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError> {
        let mut inner = self.lock();
        if inner.faults.uploads {
            return Err(BackendError::Storage("bucket unavailable".to_string()));
        }
        inner.blobs.insert(format!("{bucket}/{path}"), bytes);
        Ok(path.to_string())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("https://storage.test/{bucket}/{path}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{DateTime, TimeDelta, Utc};
    use studysync_core::{
        ChannelEvent, DraftMessage, MessageId, Profile, RoomId, RowStore, UserId,
    };
    use uuid::Uuid;

    use super::MemoryBackend;

    fn room() -> RoomId {
        RoomId::new(Uuid::from_u128(1))
    }

    fn user(id: u128) -> UserId {
        UserId::new(Uuid::from_u128(id))
    }

    fn message(id: u128, seconds: i64, content: &str) -> DraftMessage {
        DraftMessage {
            id: MessageId::new(Uuid::from_u128(id)),
            study_room_id: room(),
            author_id: user(0xa),
            content: content.to_string(),
            attachment_url: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(seconds),
        }
    }

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.seed_profile(Profile {
            id: user(0xa),
            name: "Ada".to_string(),
            handle: "ada".to_string(),
            avatar_url: None,
            major: "CS".to_string(),
        });
        backend
    }

    #[tokio::test]
    async fn pages_are_newest_first_and_windowed() {
        let backend = seeded();
        backend.seed_message(message(1, 10, "oldest"));
        backend.seed_message(message(2, 30, "newest"));
        backend.seed_message(message(3, 20, "middle"));

        let page = backend.message_page(room(), 0, 2, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0]["content"], "newest");
        assert_eq!(page[1]["content"], "middle");

        let rest = backend.message_page(room(), 2, 2, None).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0]["content"], "oldest");
    }

    #[tokio::test]
    async fn search_narrows_case_insensitively() {
        let backend = seeded();
        backend.seed_message(message(1, 10, "Exam notes"));
        backend.seed_message(message(2, 20, "lunch plans"));

        let page = backend.message_page(room(), 0, 50, Some("exam")).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["content"], "Exam notes");
    }

    #[tokio::test]
    async fn dropped_feed_subscription_unregisters() {
        let backend = seeded();
        let backend_handle = backend.backend();

        let subscription = backend_handle.feed.subscribe_messages(room()).await.unwrap();
        drop(subscription);

        // A later insert must not accumulate into a dead channel.
        let _ = backend_handle.rows.insert_message(&message(1, 10, "hello")).await.unwrap();
        assert!(backend.lock().feeds.get(&room()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_tracked_channel_emits_leave() {
        let backend = seeded();
        let backend_handle = backend.backend();

        let mut a = backend_handle.pubsub.channel("presence-x", user(1)).await.unwrap();
        let mut b = backend_handle.pubsub.channel("presence-x", user(2)).await.unwrap();
        a.track(user(1)).await.unwrap();
        b.track(user(2)).await.unwrap();
        drop(b);

        let mut saw_leave = false;
        while let Ok(event) = tokio::time::timeout(std::time::Duration::from_millis(10), a.recv())
            .await
        {
            if let Some(ChannelEvent::PresenceLeave { user_ids }) = event {
                saw_leave = user_ids == vec![user(2)];
                break;
            }
        }
        assert!(saw_leave);
    }
}
