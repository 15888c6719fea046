//! Presence tracker.
//!
//! Pure state machine over a room's presence channel events:
//! `Disconnected -> Subscribing -> Tracked -> Disconnected`. While
//! `Subscribing` no deltas are emitted; on entering `Tracked` self is a
//! member and the first sync delivers the full online set, followed by
//! incremental join/leave deltas.

use std::collections::BTreeSet;

use studysync_core::{ChannelEvent, UserId};

/// Presence connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    /// Not connected to the presence topic.
    Disconnected,
    /// Channel requested, self not yet announced.
    Subscribing,
    /// Self announced; online set is live.
    Tracked,
}

/// Incremental change to the online set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceDelta {
    /// Participants that came online.
    pub joined: Vec<UserId>,
    /// Participants that went offline.
    pub left: Vec<UserId>,
}

impl PresenceDelta {
    /// True if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Per-room online-set tracker.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    self_id: UserId,
    state: PresenceState,
    online: BTreeSet<UserId>,
}

impl PresenceTracker {
    /// Create a disconnected tracker for this participant.
    pub fn new(self_id: UserId) -> Self {
        Self { self_id, state: PresenceState::Disconnected, online: BTreeSet::new() }
    }

    /// Current connection state.
    pub fn state(&self) -> PresenceState {
        self.state
    }

    /// Currently online participants. Always contains self while
    /// [`PresenceState::Tracked`].
    pub fn online(&self) -> &BTreeSet<UserId> {
        &self.online
    }

    /// Channel requested; deltas are suppressed until tracked.
    pub fn begin_subscribe(&mut self) {
        self.state = PresenceState::Subscribing;
    }

    /// Self was announced on the channel.
    ///
    /// Enters [`PresenceState::Tracked`] and reports self as joined.
    pub fn mark_tracked(&mut self) -> PresenceDelta {
        self.state = PresenceState::Tracked;
        if self.online.insert(self.self_id) {
            PresenceDelta { joined: vec![self.self_id], left: Vec::new() }
        } else {
            PresenceDelta::default()
        }
    }

    /// Apply a presence event from the channel.
    ///
    /// Returns the resulting delta; `None` while not tracked or when the
    /// event changed nothing. Self is never reported as left while
    /// tracked.
    pub fn handle(&mut self, event: &ChannelEvent) -> Option<PresenceDelta> {
        if self.state != PresenceState::Tracked {
            return None;
        }

        let delta = match event {
            ChannelEvent::PresenceSync { user_ids } => {
                let mut next: BTreeSet<UserId> = user_ids.iter().copied().collect();
                next.insert(self.self_id);

                let joined = next.difference(&self.online).copied().collect();
                let left = self.online.difference(&next).copied().collect();
                self.online = next;
                PresenceDelta { joined, left }
            },
            ChannelEvent::PresenceJoin { user_ids } => {
                let joined =
                    user_ids.iter().copied().filter(|id| self.online.insert(*id)).collect();
                PresenceDelta { joined, left: Vec::new() }
            },
            ChannelEvent::PresenceLeave { user_ids } => {
                let left = user_ids
                    .iter()
                    .copied()
                    .filter(|id| *id != self.self_id && self.online.remove(id))
                    .collect();
                PresenceDelta { joined: Vec::new(), left }
            },
            ChannelEvent::Subscribed | ChannelEvent::Broadcast { .. } => PresenceDelta::default(),
        };

        if delta.is_empty() { None } else { Some(delta) }
    }

    /// Teardown: stop tracking and clear the online set.
    pub fn close(&mut self) {
        self.state = PresenceState::Disconnected;
        self.online.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use uuid::Uuid;

    use super::{ChannelEvent, PresenceState, PresenceTracker, UserId};

    fn user(id: u128) -> UserId {
        UserId::new(Uuid::from_u128(id))
    }

    fn tracked(self_id: u128) -> PresenceTracker {
        let mut tracker = PresenceTracker::new(user(self_id));
        tracker.begin_subscribe();
        let _ = tracker.mark_tracked();
        tracker
    }

    #[test]
    fn self_is_member_once_tracked() {
        let mut tracker = PresenceTracker::new(user(1));
        assert_eq!(tracker.state(), PresenceState::Disconnected);

        tracker.begin_subscribe();
        assert!(tracker.online().is_empty());

        let delta = tracker.mark_tracked();
        assert_eq!(delta.joined, vec![user(1)]);
        assert!(tracker.online().contains(&user(1)));
    }

    #[test]
    fn no_deltas_while_subscribing() {
        let mut tracker = PresenceTracker::new(user(1));
        tracker.begin_subscribe();

        let delta = tracker.handle(&ChannelEvent::PresenceJoin { user_ids: vec![user(2)] });
        assert!(delta.is_none());
        assert!(tracker.online().is_empty());
    }

    #[test]
    fn sync_delivers_full_set_once() {
        let mut tracker = tracked(1);

        let delta = tracker
            .handle(&ChannelEvent::PresenceSync { user_ids: vec![user(2), user(3)] })
            .unwrap();
        assert_eq!(delta.joined, vec![user(2), user(3)]);
        assert_eq!(tracker.online().len(), 3);
    }

    #[test]
    fn join_and_leave_deltas_are_incremental() {
        let mut tracker = tracked(1);

        let delta = tracker.handle(&ChannelEvent::PresenceJoin { user_ids: vec![user(2)] });
        assert_eq!(delta.unwrap().joined, vec![user(2)]);

        // Duplicate join changes nothing.
        let delta = tracker.handle(&ChannelEvent::PresenceJoin { user_ids: vec![user(2)] });
        assert!(delta.is_none());

        let delta = tracker.handle(&ChannelEvent::PresenceLeave { user_ids: vec![user(2)] });
        assert_eq!(delta.unwrap().left, vec![user(2)]);
    }

    #[test]
    fn self_is_never_reported_left() {
        let mut tracker = tracked(1);

        let delta = tracker.handle(&ChannelEvent::PresenceLeave { user_ids: vec![user(1)] });
        assert!(delta.is_none());
        assert!(tracker.online().contains(&user(1)));
    }

    #[test]
    fn close_clears_state() {
        let mut tracker = tracked(1);
        let _ = tracker.handle(&ChannelEvent::PresenceJoin { user_ids: vec![user(2)] });

        tracker.close();
        assert_eq!(tracker.state(), PresenceState::Disconnected);
        assert!(tracker.online().is_empty());
    }
}
