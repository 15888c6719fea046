//! Typing-indicator tracker.
//!
//! Maintains the set of participants currently signaling "typing" on a
//! room's ephemeral broadcast topic. Signals carry no persistence: a new
//! observer starts with an empty set. Self-originated signals are never
//! added to the externally visible set (the channel echoes broadcasts back
//! to the publisher).
//!
//! A peer that disappears without sending `typingEnd` would otherwise stay
//! "typing" forever, so entries also expire after [`TYPING_EXPIRY`] of
//! inactivity, swept against environment time.

use std::{collections::HashMap, time::Duration};

use serde_json::{Value, json};
use studysync_core::UserId;

/// Broadcast event name signaling that a participant started typing.
pub const TYPING_START_EVENT: &str = "typingStart";

/// Broadcast event name signaling that a participant stopped typing.
pub const TYPING_END_EVENT: &str = "typingEnd";

/// Inactivity window after which a typing entry expires.
pub const TYPING_EXPIRY: Duration = Duration::from_secs(10);

/// Per-room typing set, generic over the environment's instant type.
#[derive(Debug, Clone)]
pub struct TypingTracker<I> {
    self_id: UserId,
    typing: HashMap<UserId, I>,
}

impl<I> TypingTracker<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Create an empty tracker for this participant.
    pub fn new(self_id: UserId) -> Self {
        Self { self_id, typing: HashMap::new() }
    }

    /// Participants currently typing, excluding self, in stable order.
    pub fn typing(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.typing.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// True if nobody (other than self) is typing.
    pub fn is_empty(&self) -> bool {
        self.typing.is_empty()
    }

    /// Apply a typing broadcast. Returns whether the visible set changed.
    ///
    /// The payload identifies the sender as `{"message": "<user id>"}`;
    /// unrecognized events or malformed payloads are ignored.
    pub fn handle_broadcast(&mut self, event: &str, payload: &Value, now: I) -> bool {
        let Some(user_id) = sender_from_payload(payload) else {
            tracing::warn!(event, "ignoring typing broadcast with malformed payload");
            return false;
        };
        if user_id == self.self_id {
            return false;
        }

        match event {
            TYPING_START_EVENT => {
                // Refreshing the timestamp is not a visible change.
                self.typing.insert(user_id, now).is_none()
            },
            TYPING_END_EVENT => self.typing.remove(&user_id).is_some(),
            _ => false,
        }
    }

    /// Expire entries older than [`TYPING_EXPIRY`]. Returns whether the
    /// visible set changed.
    pub fn sweep(&mut self, now: I) -> bool {
        let before = self.typing.len();
        self.typing.retain(|_, last_signal| now - *last_signal < TYPING_EXPIRY);
        self.typing.len() != before
    }

    /// Clear the set (teardown).
    pub fn clear(&mut self) {
        self.typing.clear();
    }
}

/// Payload for a typing broadcast identifying the sender.
pub(crate) fn typing_payload(user_id: UserId) -> Value {
    json!({ "message": user_id.as_uuid().to_string() })
}

fn sender_from_payload(payload: &Value) -> Option<UserId> {
    let raw = payload.get("message")?.as_str()?;
    raw.parse().ok().map(UserId::new)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;
    use uuid::Uuid;

    use super::{
        TYPING_END_EVENT, TYPING_EXPIRY, TYPING_START_EVENT, TypingTracker, UserId, typing_payload,
    };

    fn user(id: u128) -> UserId {
        UserId::new(Uuid::from_u128(id))
    }

    #[test]
    fn start_and_end_signals_update_set() {
        let mut tracker: TypingTracker<Instant> = TypingTracker::new(user(1));
        let now = Instant::now();

        assert!(tracker.handle_broadcast(TYPING_START_EVENT, &typing_payload(user(2)), now));
        assert_eq!(tracker.typing(), vec![user(2)]);

        assert!(tracker.handle_broadcast(TYPING_END_EVENT, &typing_payload(user(2)), now));
        assert!(tracker.is_empty());
    }

    #[test]
    fn self_signals_are_excluded() {
        let mut tracker: TypingTracker<Instant> = TypingTracker::new(user(1));
        let now = Instant::now();

        assert!(!tracker.handle_broadcast(TYPING_START_EVENT, &typing_payload(user(1)), now));
        assert!(tracker.is_empty());
    }

    #[test]
    fn refresh_is_not_a_visible_change() {
        let mut tracker: TypingTracker<Instant> = TypingTracker::new(user(1));
        let now = Instant::now();

        assert!(tracker.handle_broadcast(TYPING_START_EVENT, &typing_payload(user(2)), now));
        assert!(!tracker.handle_broadcast(
            TYPING_START_EVENT,
            &typing_payload(user(2)),
            now + Duration::from_secs(1)
        ));
        assert_eq!(tracker.typing(), vec![user(2)]);
    }

    #[test]
    fn entries_expire_after_inactivity() {
        let mut tracker: TypingTracker<Instant> = TypingTracker::new(user(1));
        let start = Instant::now();

        tracker.handle_broadcast(TYPING_START_EVENT, &typing_payload(user(2)), start);
        tracker.handle_broadcast(
            TYPING_START_EVENT,
            &typing_payload(user(3)),
            start + Duration::from_secs(5),
        );

        // Only the stale entry expires.
        assert!(tracker.sweep(start + TYPING_EXPIRY));
        assert_eq!(tracker.typing(), vec![user(3)]);

        assert!(!tracker.sweep(start + TYPING_EXPIRY));
    }

    #[test]
    fn malformed_payloads_are_ignored() {
        let mut tracker: TypingTracker<Instant> = TypingTracker::new(user(1));
        let now = Instant::now();

        assert!(!tracker.handle_broadcast(TYPING_START_EVENT, &json!({}), now));
        assert!(!tracker.handle_broadcast(TYPING_START_EVENT, &json!({ "message": 42 }), now));
        assert!(!tracker.handle_broadcast("somethingElse", &typing_payload(user(2)), now));
        assert!(tracker.is_empty());
    }
}
