//! Core types for the StudySync realtime chat layer.
//!
//! Defines the domain model (messages, author profiles, identifiers), the
//! parse-and-validate boundary for raw backend rows, and the capability
//! traits through which the client consumes the hosted backend: row store,
//! change feed, ephemeral pub/sub, and blob store.
//!
//! The backend is always passed in as an explicitly constructed [`Backend`]
//! handle so tests can inject in-memory doubles. System resources (time,
//! randomness) are likewise abstracted behind [`env::Environment`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backend;
pub mod env;
mod error;
mod row;
mod types;

pub use backend::{
    Backend, BlobStore, ChangeFeed, ChannelEvent, FeedSubscription, PubSub, RealtimeChannel,
    RowChange, RowChangeKind, RowStore, presence_topic, typing_topic,
};
pub use error::BackendError;
pub use row::{ParseError, draft_from_row, message_from_row, profile_from_row};
pub use types::{DraftMessage, Message, MessageId, Profile, RoomId, UserId};
