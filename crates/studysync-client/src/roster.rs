//! Member roster: cached author snapshots for a room.
//!
//! The single normalization point for author resolution, shared by the
//! optimistic send path and the change-feed path. Resolution order: roster
//! hit, lazily fetched profile (cached for next time), placeholder. A
//! failed lookup is logged and degrades to the placeholder so message
//! display never blocks on missing profile data.

use std::{collections::HashMap, sync::Arc};

use studysync_core::{Profile, RoomId, RowStore, UserId, profile_from_row};

/// Cached author snapshots, seeded at session open and lazily extended.
pub struct MemberRoster {
    rows: Arc<dyn RowStore>,
    members: HashMap<UserId, Profile>,
}

impl MemberRoster {
    /// Create an empty roster over the given row store.
    pub fn new(rows: Arc<dyn RowStore>) -> Self {
        Self { rows, members: HashMap::new() }
    }

    /// Seed the roster with a room's current members.
    ///
    /// A failed load leaves the roster usable; individual authors are then
    /// resolved lazily. Malformed member rows are skipped and logged.
    pub async fn load(&mut self, room_id: RoomId) {
        match self.rows.room_members(room_id).await {
            Ok(rows) => {
                for row in &rows {
                    match profile_from_row(row) {
                        Ok(profile) => {
                            self.members.insert(profile.id, profile);
                        },
                        Err(error) => {
                            tracing::warn!(%room_id, %error, "skipping malformed member row");
                        },
                    }
                }
            },
            Err(error) => {
                tracing::warn!(%room_id, %error, "member roster load failed");
            },
        }
    }

    /// Insert or refresh a snapshot.
    pub fn insert(&mut self, profile: Profile) {
        self.members.insert(profile.id, profile);
    }

    /// Cached snapshot, if present.
    pub fn get(&self, id: UserId) -> Option<&Profile> {
        self.members.get(&id)
    }

    /// Number of cached snapshots.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if no snapshots are cached.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Resolve an author snapshot, never failing.
    ///
    /// Misses are fetched from the row store and cached; a failed fetch
    /// degrades to [`Profile::placeholder`] without caching it, so a later
    /// event retries the lookup.
    pub async fn resolve(&mut self, id: UserId) -> Profile {
        if let Some(profile) = self.members.get(&id) {
            return profile.clone();
        }

        match self.fetch(id).await {
            Ok(profile) => {
                self.members.insert(id, profile.clone());
                profile
            },
            Err(error) => {
                tracing::warn!(user_id = %id, %error, "author lookup failed, using placeholder");
                Profile::placeholder(id)
            },
        }
    }

    async fn fetch(&self, id: UserId) -> Result<Profile, Box<dyn std::error::Error + Send + Sync>> {
        let row = self.rows.profile(id).await?;
        Ok(profile_from_row(&row)?)
    }
}

impl std::fmt::Debug for MemberRoster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberRoster").field("members", &self.members.len()).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use studysync_core::{BackendError, DraftMessage, MessageId};
    use uuid::Uuid;

    use super::{Arc, MemberRoster, Profile, RoomId, RowStore, UserId};

    /// Row store stub serving a fixed profile table.
    pub(crate) struct ProfileStore {
        pub profiles: Vec<Profile>,
        pub fail_profile_fetch: bool,
    }

    pub(crate) fn profile_row(profile: &Profile) -> Value {
        json!({
            "id": profile.id.as_uuid().to_string(),
            "name": profile.name,
            "handle": profile.handle,
            "avatar_url": profile.avatar_url,
            "major": profile.major,
        })
    }

    #[async_trait]
    impl RowStore for ProfileStore {
        async fn message_page(
            &self,
            _room_id: RoomId,
            _offset: usize,
            _limit: usize,
            _search: Option<&str>,
        ) -> Result<Vec<Value>, BackendError> {
            Ok(Vec::new())
        }

        async fn insert_message(&self, _draft: &DraftMessage) -> Result<Value, BackendError> {
            Err(BackendError::Query("not supported".to_string()))
        }

        async fn set_attachment_url(
            &self,
            _id: MessageId,
            _url: &str,
        ) -> Result<Value, BackendError> {
            Err(BackendError::Query("not supported".to_string()))
        }

        async fn profile(&self, id: UserId) -> Result<Value, BackendError> {
            if self.fail_profile_fetch {
                return Err(BackendError::Network("unreachable".to_string()));
            }
            self.profiles
                .iter()
                .find(|profile| profile.id == id)
                .map(profile_row)
                .ok_or_else(|| BackendError::Query("no such profile".to_string()))
        }

        async fn room_members(&self, _room_id: RoomId) -> Result<Vec<Value>, BackendError> {
            Ok(self.profiles.iter().map(profile_row).collect())
        }
    }

    pub(crate) fn named_profile(id: u128, name: &str) -> Profile {
        Profile {
            id: UserId::new(Uuid::from_u128(id)),
            name: name.to_string(),
            handle: name.to_lowercase(),
            avatar_url: None,
            major: "CS".to_string(),
        }
    }

    #[tokio::test]
    async fn load_seeds_members() {
        let store = Arc::new(ProfileStore {
            profiles: vec![named_profile(1, "Ada"), named_profile(2, "Brian")],
            fail_profile_fetch: false,
        });
        let mut roster = MemberRoster::new(store);

        roster.load(RoomId::new(Uuid::from_u128(9))).await;

        assert_eq!(roster.len(), 2);
        assert_eq!(roster.get(UserId::new(Uuid::from_u128(1))).unwrap().name, "Ada");
    }

    #[tokio::test]
    async fn miss_is_fetched_and_cached() {
        let store = Arc::new(ProfileStore {
            profiles: vec![named_profile(3, "Grace")],
            fail_profile_fetch: false,
        });
        let mut roster = MemberRoster::new(store);

        let id = UserId::new(Uuid::from_u128(3));
        let resolved = roster.resolve(id).await;
        assert_eq!(resolved.name, "Grace");
        assert!(roster.get(id).is_some());
    }

    #[tokio::test]
    async fn failed_lookup_degrades_to_placeholder() {
        let store = Arc::new(ProfileStore { profiles: Vec::new(), fail_profile_fetch: true });
        let mut roster = MemberRoster::new(store);

        let id = UserId::new(Uuid::from_u128(7));
        let resolved = roster.resolve(id).await;

        assert_eq!(resolved, Profile::placeholder(id));
        // Placeholders are not cached; a later resolve retries.
        assert!(roster.get(id).is_none());
    }
}
