//! Room session controller.
//!
//! Scoped acquisition bundling everything a visible room needs: the
//! message change feed, the presence channel, and the typing channel,
//! plus the cache, fetcher, and roster that serve the view. One
//! [`RoomSession::close`] (or drop) releases all three subscriptions
//! together, on every exit path.
//!
//! All state is owned by the session and mutated from the task driving
//! [`RoomSession::next_update`]; there is no shared-state locking.

use std::{collections::BTreeSet, time::Duration};

use studysync_core::{
    Backend, ChannelEvent, FeedSubscription, Message, MessageId, Profile, RealtimeChannel,
    RoomId, RowChange, UserId, env::Environment, presence_topic, typing_topic,
};

use crate::{
    cache::MessageCache,
    error::{ChannelKind, ComposeDraft, FetchError, SendError, SubscriptionError},
    feed::{ChangeFeedListener, FeedOutcome},
    fetcher::{PageFetcher, PageKey},
    presence::{PresenceDelta, PresenceState, PresenceTracker},
    roster::MemberRoster,
    send::{Attachment, SendPipeline},
    typing::{TYPING_END_EVENT, TYPING_START_EVENT, TypingTracker, typing_payload},
};

/// How often the multiplexer wakes to expire stale typing entries.
const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A state change the UI should render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The visible message sequence changed.
    Messages,
    /// The online set changed.
    Presence(PresenceDelta),
    /// The typing set changed; carries the current set excluding self.
    Typing(Vec<UserId>),
}

/// One open study-room view.
pub struct RoomSession<E: Environment> {
    room_id: RoomId,
    self_id: UserId,
    env: E,

    cache: MessageCache,
    fetcher: PageFetcher,
    roster: MemberRoster,
    listener: ChangeFeedListener,
    presence: PresenceTracker,
    typing: TypingTracker<E::Instant>,
    pipeline: SendPipeline<E>,

    feed: Option<FeedSubscription>,
    presence_channel: Option<Box<dyn RealtimeChannel>>,
    typing_channel: Option<Box<dyn RealtimeChannel>>,

    /// Active text filter; `None` shows the unfiltered window.
    filter: Option<String>,
    /// Messages of the filtered window (not reconciled with the feed).
    filtered: Vec<Message>,
    /// Local typing state, coalescing repeated signals.
    is_typing: bool,
}

enum Polled {
    Feed(Option<RowChange>),
    Presence(Option<ChannelEvent>),
    Typing(Option<ChannelEvent>),
    Sweep,
}

impl<E: Environment> RoomSession<E> {
    /// Open a session: acquire the three room-scoped subscriptions and
    /// seed the member roster.
    ///
    /// Fails only if a subscription cannot be established; a failed roster
    /// load degrades to lazy per-author resolution.
    pub async fn open(
        backend: &Backend,
        env: E,
        room_id: RoomId,
        self_id: UserId,
    ) -> Result<Self, SubscriptionError> {
        let feed = backend
            .feed
            .subscribe_messages(room_id)
            .await
            .map_err(|source| SubscriptionError { channel: ChannelKind::Messages, source })?;
        let presence_channel = backend
            .pubsub
            .channel(&presence_topic(room_id), self_id)
            .await
            .map_err(|source| SubscriptionError { channel: ChannelKind::Presence, source })?;
        let typing_channel = backend
            .pubsub
            .channel(&typing_topic(room_id), self_id)
            .await
            .map_err(|source| SubscriptionError { channel: ChannelKind::Typing, source })?;

        let mut roster = MemberRoster::new(backend.rows.clone());
        roster.load(room_id).await;

        let mut presence = PresenceTracker::new(self_id);
        presence.begin_subscribe();

        tracing::debug!(%room_id, %self_id, "room session opened");

        Ok(Self {
            room_id,
            self_id,
            env: env.clone(),
            cache: MessageCache::new(),
            fetcher: PageFetcher::new(backend.rows.clone()),
            roster,
            listener: ChangeFeedListener::new(self_id),
            presence,
            typing: TypingTracker::new(self_id),
            pipeline: SendPipeline::new(backend.rows.clone(), backend.blobs.clone(), env),
            feed: Some(feed),
            presence_channel: Some(presence_channel),
            typing_channel: Some(typing_channel),
            filter: None,
            filtered: Vec::new(),
            is_typing: false,
        })
    }

    /// Room this session is bound to.
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// This session's participant.
    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    /// Visible messages of the unfiltered view, newest first.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.cache.iter()
    }

    /// Messages of the active filtered view, newest first.
    pub fn filtered_messages(&self) -> &[Message] {
        &self.filtered
    }

    /// Currently online participants.
    pub fn online(&self) -> &BTreeSet<UserId> {
        self.presence.online()
    }

    /// Presence connection state.
    pub fn presence_state(&self) -> PresenceState {
        self.presence.state()
    }

    /// Participants currently typing, excluding self.
    pub fn typing_users(&self) -> Vec<UserId> {
        self.typing.typing()
    }

    /// Cached author snapshot, if known.
    pub fn member(&self, id: UserId) -> Option<&Profile> {
        self.roster.get(id)
    }

    /// Load the next (older) history page into the active view.
    ///
    /// Returns the number of fetched messages; fewer than a full page
    /// means the window is exhausted.
    pub async fn load_older(&mut self) -> Result<usize, FetchError> {
        let key = self.active_key();
        let page = self.fetcher.next_page(&key).await?;
        let count = page.len();
        match self.filter {
            None => self.cache.push_history_page(page),
            Some(_) => self.filtered.extend(page),
        }
        Ok(count)
    }

    /// True if the active view may have more history.
    pub fn has_more_history(&self) -> bool {
        !self.fetcher.is_exhausted(&self.active_key())
    }

    /// Switch the text filter. `None` returns to the unfiltered view.
    ///
    /// The filtered window restarts from the top; the unfiltered window
    /// and its cache are untouched.
    pub fn set_filter(&mut self, text: Option<String>) {
        self.filtered.clear();
        if let Some(text) = &text {
            self.fetcher.reset(&PageKey::filtered(self.room_id, text.clone()));
        }
        self.filter = text;
    }

    fn active_key(&self) -> PageKey {
        match &self.filter {
            None => PageKey::unfiltered(self.room_id),
            Some(text) => PageKey::filtered(self.room_id, text.clone()),
        }
    }

    /// Send a message, optimistically inserting it first.
    ///
    /// On failure the optimistic entry is rolled back and the returned
    /// [`SendError`] carries the compose state for restore.
    pub async fn send(
        &mut self,
        content: String,
        attachment: Option<Attachment>,
    ) -> Result<MessageId, SendError> {
        let draft = self.pipeline.compose(self.room_id, self.self_id, content.clone());
        // The optimistic insert never waits on a profile fetch: roster hit
        // or placeholder, backfilled when the confirmation resolves.
        let author = self
            .roster
            .get(self.self_id)
            .cloned()
            .unwrap_or_else(|| Profile::placeholder(self.self_id));
        self.cache.insert_optimistic(Message::from_draft(&draft, author));

        // Sending clears the compose box, and with it the typing signal.
        if let Err(error) = self.set_typing(false).await {
            tracing::warn!(%error, "typing-end publish failed during send");
        }

        match self.pipeline.deliver(&draft, attachment.as_ref()).await {
            Ok(confirmed) => {
                let author = self.roster.resolve(confirmed.author_id).await;
                self.cache.confirm(Message::from_draft(&confirmed, author));
                Ok(draft.id)
            },
            Err(failure) => {
                self.cache.remove(draft.id);
                Err(SendError {
                    stage: failure.stage,
                    source: failure.source,
                    draft: ComposeDraft { content, attachment },
                })
            },
        }
    }

    /// Publish the local typing state. Repeated identical states are
    /// coalesced into one signal.
    pub async fn set_typing(&mut self, is_typing: bool) -> Result<(), SubscriptionError> {
        if self.is_typing == is_typing {
            return Ok(());
        }
        self.is_typing = is_typing;

        let Some(channel) = self.typing_channel.as_mut() else {
            // Typing channel degraded; signal is dropped.
            return Ok(());
        };
        let event = if is_typing { TYPING_START_EVENT } else { TYPING_END_EVENT };
        channel
            .publish(event, typing_payload(self.self_id))
            .await
            .map_err(|source| SubscriptionError { channel: ChannelKind::Typing, source })
    }

    /// Expire stale typing entries against the current environment time.
    ///
    /// Driven periodically by [`RoomSession::next_update`]; exposed for
    /// callers that multiplex their own timers.
    pub fn expire_typing(&mut self) -> Option<SessionUpdate> {
        if self.typing.sweep(self.env.now()) {
            Some(SessionUpdate::Typing(self.typing.typing()))
        } else {
            None
        }
    }

    /// Next state change to render.
    ///
    /// Multiplexes the change feed, presence, typing, and the typing
    /// expiry sweep. Returns `None` once every live channel has closed;
    /// loaded history remains accessible. A closed individual channel
    /// degrades just that capability and is logged.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if self.feed.is_none()
                && self.presence_channel.is_none()
                && self.typing_channel.is_none()
            {
                return None;
            }

            let polled = {
                let has_feed = self.feed.is_some();
                let has_presence = self.presence_channel.is_some();
                let has_typing = self.typing_channel.is_some();
                let feed = self.feed.as_mut();
                let presence = self.presence_channel.as_deref_mut();
                let typing = self.typing_channel.as_deref_mut();
                let env = self.env.clone();

                tokio::select! {
                    change = recv_feed(feed), if has_feed => Polled::Feed(change),
                    event = recv_channel(presence), if has_presence => Polled::Presence(event),
                    event = recv_channel(typing), if has_typing => Polled::Typing(event),
                    () = env.sleep(TYPING_SWEEP_INTERVAL) => Polled::Sweep,
                }
            };

            if let Some(update) = self.handle_polled(polled).await {
                return Some(update);
            }
        }
    }

    async fn handle_polled(&mut self, polled: Polled) -> Option<SessionUpdate> {
        match polled {
            Polled::Feed(Some(change)) => {
                let outcome =
                    self.listener.apply(&change, &mut self.cache, &mut self.roster).await;
                (outcome != FeedOutcome::Ignored).then_some(SessionUpdate::Messages)
            },
            Polled::Feed(None) => {
                tracing::error!(room_id = %self.room_id, "message feed closed, live updates degraded");
                self.feed = None;
                None
            },
            Polled::Presence(Some(ChannelEvent::Subscribed)) => self.announce_self().await,
            Polled::Presence(Some(event)) => {
                self.presence.handle(&event).map(SessionUpdate::Presence)
            },
            Polled::Presence(None) => {
                tracing::error!(room_id = %self.room_id, "presence channel closed, online set frozen");
                self.presence_channel = None;
                None
            },
            Polled::Typing(Some(ChannelEvent::Broadcast { event, payload })) => self
                .typing
                .handle_broadcast(&event, &payload, self.env.now())
                .then(|| SessionUpdate::Typing(self.typing.typing())),
            Polled::Typing(Some(_)) => None,
            Polled::Typing(None) => {
                tracing::error!(room_id = %self.room_id, "typing channel closed, typing set frozen");
                self.typing_channel = None;
                None
            },
            Polled::Sweep => self.expire_typing(),
        }
    }

    /// Announce self on the presence channel once it is established.
    async fn announce_self(&mut self) -> Option<SessionUpdate> {
        let channel = self.presence_channel.as_mut()?;
        match channel.track(self.self_id).await {
            Ok(()) => {
                let delta = self.presence.mark_tracked();
                (!delta.is_empty()).then_some(SessionUpdate::Presence(delta))
            },
            Err(source) => {
                let error = SubscriptionError { channel: ChannelKind::Presence, source };
                tracing::error!(%error, "presence announce failed");
                None
            },
        }
    }

    /// Release all room-scoped subscriptions.
    ///
    /// Dropping the session releases them as well; `close` additionally
    /// clears a lingering typing signal for other observers.
    pub async fn close(mut self) {
        if self.is_typing
            && let Err(error) = self.set_typing(false).await
        {
            tracing::debug!(%error, "typing-end publish failed during close");
        }
        self.presence.close();
        self.typing.clear();
        self.feed = None;
        self.presence_channel = None;
        self.typing_channel = None;
        tracing::debug!(room_id = %self.room_id, "room session closed");
    }
}

impl<E: Environment> std::fmt::Debug for RoomSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_id", &self.room_id)
            .field("self_id", &self.self_id)
            .field("messages", &self.cache.len())
            .finish_non_exhaustive()
    }
}

async fn recv_feed(feed: Option<&mut FeedSubscription>) -> Option<RowChange> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_channel(
    channel: Option<&mut (dyn RealtimeChannel + 'static)>,
) -> Option<ChannelEvent> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}
