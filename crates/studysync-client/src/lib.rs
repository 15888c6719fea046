//! Realtime chat synchronization client for study rooms.
//!
//! Reconciles three write sources - local optimistic sends, server
//! confirmations, and change-feed events - into one consistent,
//! de-duplicated, newest-first message view, while tracking ephemeral
//! presence and typing indicators over pub/sub channels and windowing
//! history through cursor-based pagination.
//!
//! # Components
//!
//! - [`MessageCache`]: source of truth for the visible message sequence
//! - [`PageFetcher`]: cursor-based history retrieval with optional search
//! - [`ChangeFeedListener`]: normalizes row changes into cache operations
//! - [`PresenceTracker`]: per-room online set
//! - [`TypingTracker`]: per-room typing set with inactivity expiry
//! - [`SendPipeline`]: two-phase optimistic send with attachment upload
//! - [`RoomSession`]: scoped bundle of the above, wired to one room
//!
//! All shared state is mutated from one logical task; components are plain
//! state machines fed by the session multiplexer.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod cache;
mod error;
mod feed;
mod fetcher;
mod presence;
mod roster;
mod send;
mod session;
mod typing;

pub use cache::MessageCache;
pub use error::{ChannelKind, ComposeDraft, FetchError, SendError, SendStage, SubscriptionError};
pub use feed::{ChangeFeedListener, FeedOutcome};
pub use fetcher::{PAGE_SIZE, PageFetcher, PageKey};
pub use presence::{PresenceDelta, PresenceState, PresenceTracker};
pub use roster::MemberRoster;
pub use send::{ATTACHMENT_BUCKET, Attachment, SendPipeline};
pub use session::{RoomSession, SessionUpdate};
pub use studysync_core::env::Environment;
pub use typing::{TYPING_END_EVENT, TYPING_EXPIRY, TYPING_START_EVENT, TypingTracker};
