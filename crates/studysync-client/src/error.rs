//! Error taxonomy for the client.
//!
//! Each error is scoped to the operation that failed and never corrupts
//! shared state: fetch failures leave cursors unadvanced, send failures
//! roll back their optimistic entry and carry the compose state back to the
//! caller, and subscription failures degrade live updates without touching
//! already-loaded history. Author-lookup failures are not represented here
//! at all - they degrade to a placeholder snapshot inside the roster.

use studysync_core::BackendError;
use thiserror::Error;

use crate::send::Attachment;

/// A history page fetch failed. The pagination cursor was not advanced.
#[derive(Debug, Error)]
#[error("message page fetch failed: {0}")]
pub struct FetchError(#[from] pub BackendError);

/// Stage of the send pipeline that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStage {
    /// The message row insert failed.
    Insert,
    /// The attachment blob upload failed.
    Upload,
    /// The attachment-url row patch failed.
    Patch,
}

impl std::fmt::Display for SendStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            Self::Insert => "insert",
            Self::Upload => "upload",
            Self::Patch => "patch",
        };
        f.write_str(stage)
    }
}

/// Compose-box state restored to the caller after a failed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeDraft {
    /// Original message text.
    pub content: String,
    /// Original selected attachment, if any.
    pub attachment: Option<Attachment>,
}

/// A message send failed.
///
/// The optimistic cache entry has already been rolled back; `draft` holds
/// the compose state so the user can retry without data loss.
#[derive(Debug, Error)]
#[error("send failed at {stage} stage: {source}")]
pub struct SendError {
    /// Pipeline stage that failed.
    pub stage: SendStage,
    /// Underlying backend failure.
    #[source]
    pub source: BackendError,
    /// Compose state to restore.
    pub draft: ComposeDraft,
}

/// Which room-scoped subscription failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// The message change feed.
    Messages,
    /// The presence channel.
    Presence,
    /// The typing-indicator channel.
    Typing,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Messages => "message feed",
            Self::Presence => "presence",
            Self::Typing => "typing",
        };
        f.write_str(kind)
    }
}

/// A room-scoped subscription failed to establish or publish.
///
/// The affected live-update capability degrades; loaded history remains
/// visible.
#[derive(Debug, Error)]
#[error("{channel} subscription failed: {source}")]
pub struct SubscriptionError {
    /// Affected channel.
    pub channel: ChannelKind,
    /// Underlying backend failure.
    #[source]
    pub source: BackendError,
}
