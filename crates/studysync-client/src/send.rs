//! Send pipeline.
//!
//! Two-phase delivery: insert the message row, then (if an attachment was
//! selected) upload the blob keyed by message id, resolve its public URL,
//! and patch the row. The caller inserts the draft optimistically before
//! delivery and rolls it back on failure; the pipeline reports which stage
//! failed so the compose state can be restored.

use std::sync::Arc;

use studysync_core::{
    BackendError, BlobStore, DraftMessage, RoomId, RowStore, UserId, draft_from_row,
    env::Environment,
};

use crate::error::SendStage;

/// Bucket holding message attachments, keyed by message id.
pub const ATTACHMENT_BUCKET: &str = "attachments";

/// An attachment selected in the compose box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Original file name, shown in the compose box.
    pub file_name: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

/// A pipeline stage failed. The caller owns rollback and draft restore.
#[derive(Debug)]
pub(crate) struct StageFailure {
    pub stage: SendStage,
    pub source: BackendError,
}

/// Delivers drafts to the row store and blob store.
pub struct SendPipeline<E> {
    rows: Arc<dyn RowStore>,
    blobs: Arc<dyn BlobStore>,
    env: E,
}

impl<E: Environment> SendPipeline<E> {
    /// Create a pipeline over the given stores.
    pub fn new(rows: Arc<dyn RowStore>, blobs: Arc<dyn BlobStore>, env: E) -> Self {
        Self { rows, blobs, env }
    }

    /// Build a draft with a fresh client-side identity and the current
    /// wall-clock timestamp.
    pub fn compose(&self, room_id: RoomId, author_id: UserId, content: String) -> DraftMessage {
        DraftMessage {
            id: self.env.new_message_id(),
            study_room_id: room_id,
            author_id,
            content,
            attachment_url: None,
            created_at: self.env.wall_clock(),
        }
    }

    /// Deliver a draft. Returns the confirmed record.
    ///
    /// If the confirmation row comes back malformed after a successful
    /// mutation, the local draft stands in for it - the write happened, so
    /// this is not a send failure.
    pub(crate) async fn deliver(
        &self,
        draft: &DraftMessage,
        attachment: Option<&Attachment>,
    ) -> Result<DraftMessage, StageFailure> {
        let inserted = self
            .rows
            .insert_message(draft)
            .await
            .map_err(|source| StageFailure { stage: SendStage::Insert, source })?;
        let mut confirmed = confirmed_or_local(&inserted, draft);

        let Some(attachment) = attachment else {
            return Ok(confirmed);
        };

        let path = self
            .blobs
            .upload(ATTACHMENT_BUCKET, &draft.id.to_string(), attachment.bytes.clone())
            .await
            .map_err(|source| StageFailure { stage: SendStage::Upload, source })?;

        let url = self.blobs.public_url(ATTACHMENT_BUCKET, &path);
        let patched = self
            .rows
            .set_attachment_url(draft.id, &url)
            .await
            .map_err(|source| StageFailure { stage: SendStage::Patch, source })?;

        confirmed.attachment_url = Some(url);
        Ok(confirmed_or_local(&patched, &confirmed))
    }
}

impl<E> std::fmt::Debug for SendPipeline<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPipeline").finish_non_exhaustive()
    }
}

fn confirmed_or_local(row: &serde_json::Value, local: &DraftMessage) -> DraftMessage {
    match draft_from_row(row) {
        Ok(confirmed) => confirmed,
        Err(error) => {
            tracing::warn!(message_id = %local.id, %error, "malformed confirmation row");
            local.clone()
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use studysync_core::{MessageId, env::test_utils::MockEnv};
    use uuid::Uuid;

    use crate::error::SendStage;

    use super::{
        Arc, Attachment, BackendError, BlobStore, DraftMessage, RoomId, RowStore, SendPipeline,
        UserId,
    };

    #[derive(Default)]
    struct RecordingStore {
        fail_insert: bool,
        fail_patch: bool,
        patched_url: Mutex<Option<String>>,
    }

    fn flat_row(draft: &DraftMessage) -> Value {
        json!({
            "id": draft.id.as_uuid().to_string(),
            "study_room_id": draft.study_room_id.as_uuid().to_string(),
            "author_id": draft.author_id.as_uuid().to_string(),
            "content": draft.content,
            "attachment_url": draft.attachment_url,
            "created_at": draft.created_at.to_rfc3339(),
        })
    }

    #[async_trait]
    impl RowStore for RecordingStore {
        async fn message_page(
            &self,
            _room_id: RoomId,
            _offset: usize,
            _limit: usize,
            _search: Option<&str>,
        ) -> Result<Vec<Value>, BackendError> {
            Ok(Vec::new())
        }

        async fn insert_message(&self, draft: &DraftMessage) -> Result<Value, BackendError> {
            if self.fail_insert {
                return Err(BackendError::Network("unreachable".to_string()));
            }
            Ok(flat_row(draft))
        }

        async fn set_attachment_url(
            &self,
            _id: MessageId,
            url: &str,
        ) -> Result<Value, BackendError> {
            if self.fail_patch {
                return Err(BackendError::Query("patch rejected".to_string()));
            }
            *self.patched_url.lock().unwrap() = Some(url.to_string());
            Ok(json!({ "not": "a message row" }))
        }

        async fn profile(&self, _id: UserId) -> Result<Value, BackendError> {
            Err(BackendError::Query("not supported".to_string()))
        }

        async fn room_members(&self, _room_id: RoomId) -> Result<Vec<Value>, BackendError> {
            Ok(Vec::new())
        }
    }

    struct MemoryBlobs {
        fail_upload: bool,
    }

    #[async_trait]
    impl BlobStore for MemoryBlobs {
        async fn upload(
            &self,
            _bucket: &str,
            path: &str,
            _bytes: Vec<u8>,
        ) -> Result<String, BackendError> {
            if self.fail_upload {
                return Err(BackendError::Storage("bucket unavailable".to_string()));
            }
            Ok(path.to_string())
        }

        fn public_url(&self, bucket: &str, path: &str) -> String {
            format!("https://blob.local/{bucket}/{path}")
        }
    }

    fn pipeline(
        store: RecordingStore,
        blobs: MemoryBlobs,
    ) -> (SendPipeline<MockEnv>, Arc<RecordingStore>) {
        let store = Arc::new(store);
        (SendPipeline::new(store.clone(), Arc::new(blobs), MockEnv::new()), store)
    }

    fn ids(room: u128, author: u128) -> (RoomId, UserId) {
        (RoomId::new(Uuid::from_u128(room)), UserId::new(Uuid::from_u128(author)))
    }

    #[tokio::test]
    async fn plain_send_confirms_draft() {
        let (pipeline, _) = pipeline(RecordingStore::default(), MemoryBlobs { fail_upload: false });
        let (room, author) = ids(1, 2);

        let draft = pipeline.compose(room, author, "hello".to_string());
        let confirmed = pipeline.deliver(&draft, None).await.unwrap();

        assert_eq!(confirmed.id, draft.id);
        assert!(confirmed.attachment_url.is_none());
    }

    #[tokio::test]
    async fn attachment_send_uploads_and_patches() {
        let (pipeline, store) =
            pipeline(RecordingStore::default(), MemoryBlobs { fail_upload: false });
        let (room, author) = ids(1, 2);

        let draft = pipeline.compose(room, author, "look".to_string());
        let attachment = Attachment { file_name: "notes.png".to_string(), bytes: vec![1, 2, 3] };
        let confirmed = pipeline.deliver(&draft, Some(&attachment)).await.unwrap();

        let expected = format!("https://blob.local/attachments/{}", draft.id);
        assert_eq!(store.patched_url.lock().unwrap().as_deref(), Some(expected.as_str()));
        // Patch confirmation row was malformed; local record stands in.
        assert_eq!(confirmed.attachment_url.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn insert_failure_reports_stage() {
        let (pipeline, _) = pipeline(
            RecordingStore { fail_insert: true, ..RecordingStore::default() },
            MemoryBlobs { fail_upload: false },
        );
        let (room, author) = ids(1, 2);

        let draft = pipeline.compose(room, author, "hello".to_string());
        let failure = pipeline.deliver(&draft, None).await.unwrap_err();
        assert_eq!(failure.stage, SendStage::Insert);
    }

    #[tokio::test]
    async fn upload_failure_reports_stage() {
        let (pipeline, _) = pipeline(RecordingStore::default(), MemoryBlobs { fail_upload: true });
        let (room, author) = ids(1, 2);

        let draft = pipeline.compose(room, author, "look".to_string());
        let attachment = Attachment { file_name: "notes.png".to_string(), bytes: vec![1] };
        let failure = pipeline.deliver(&draft, Some(&attachment)).await.unwrap_err();
        assert_eq!(failure.stage, SendStage::Upload);
    }

    #[tokio::test]
    async fn patch_failure_reports_stage() {
        let (pipeline, _) = pipeline(
            RecordingStore { fail_patch: true, ..RecordingStore::default() },
            MemoryBlobs { fail_upload: false },
        );
        let (room, author) = ids(1, 2);

        let draft = pipeline.compose(room, author, "look".to_string());
        let attachment = Attachment { file_name: "notes.png".to_string(), bytes: vec![1] };
        let failure = pipeline.deliver(&draft, Some(&attachment)).await.unwrap_err();
        assert_eq!(failure.stage, SendStage::Patch);
    }
}
