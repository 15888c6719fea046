//! Domain model for study-room chat.
//!
//! Message identity is assigned client-side at draft creation so the
//! optimistic record and the server-confirmed record share one identity.
//! [`Message`] carries a denormalized [`Profile`] snapshot of its author for
//! rendering; [`DraftMessage`] is the pre-confirmation shape that carries
//! only the author identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a study room (chat conversation scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(Uuid);

/// Identifier of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

/// Identifier of a message, stable across optimistic and confirmed states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

macro_rules! id_impls {
    ($name:ident) => {
        impl $name {
            /// Wrap an existing UUID.
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            /// Underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

id_impls!(RoomId);
id_impls!(UserId);
id_impls!(MessageId);

/// Denormalized author snapshot embedded into a [`Message`] for rendering.
///
/// Not owned by the message; looked up by author id and cached. Falls back
/// to [`Profile::placeholder`] when the lookup fails so rendering never
/// blocks on missing profile data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Participant identifier.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Unique handle.
    pub handle: String,
    /// Avatar image URL. `None` if the participant has no avatar.
    pub avatar_url: Option<String>,
    /// Declared major (course-collaboration metadata).
    pub major: String,
}

impl Profile {
    /// Fallback snapshot used when an author lookup fails.
    pub fn placeholder(id: UserId) -> Self {
        Self {
            id,
            name: "Unknown User".to_string(),
            handle: "unknown".to_string(),
            avatar_url: None,
            major: "Undeclared".to_string(),
        }
    }
}

/// Client-constructed, not-yet-confirmed message record.
///
/// This is the shape sent to the row store on insert and the shape the
/// change feed delivers in raw row payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftMessage {
    /// Message identity, generated client-side.
    pub id: MessageId,
    /// Owning room.
    pub study_room_id: RoomId,
    /// Author identifier.
    pub author_id: UserId,
    /// Textual content.
    pub content: String,
    /// Attachment URL, populated after upload. `None` if no attachment.
    pub attachment_url: Option<String>,
    /// Creation timestamp (client wall clock until confirmed).
    pub created_at: DateTime<Utc>,
}

/// A chat entry in a room, with its author snapshot resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identity.
    pub id: MessageId,
    /// Owning room.
    pub study_room_id: RoomId,
    /// Author snapshot.
    pub author: Profile,
    /// Textual content.
    pub content: String,
    /// Attachment URL. `None` if no attachment.
    pub attachment_url: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Combine a draft with a resolved author snapshot.
    pub fn from_draft(draft: &DraftMessage, author: Profile) -> Self {
        Self {
            id: draft.id,
            study_room_id: draft.study_room_id,
            author,
            content: draft.content.clone(),
            attachment_url: draft.attachment_url.clone(),
            created_at: draft.created_at,
        }
    }
}
