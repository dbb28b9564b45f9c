use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::storage::StorageBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCategory {
    ChatImage,
    ChatVideo,
    ChatVoice,
    AudioChunk,
    Avatar,
}

impl UploadCategory {
    fn prefix(&self) -> &'static str {
        match self {
            UploadCategory::ChatImage => "chat-image",
            UploadCategory::ChatVideo => "chat-video",
            UploadCategory::ChatVoice => "chat-voice",
            UploadCategory::AudioChunk => "audio-chunk",
            UploadCategory::Avatar => "avatar",
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            UploadCategory::ChatImage | UploadCategory::Avatar => "image/jpeg",
            UploadCategory::ChatVideo => "video/mp4",
            UploadCategory::ChatVoice | UploadCategory::AudioChunk => "audio/mp4",
        }
    }
}

/// Hosted-blob upload boundary: accepts a local media buffer plus a category
/// tag and returns the public URL the rest of the system passes around.
#[derive(Clone)]
pub struct UploadService {
    storage: Arc<dyn StorageBackend>,
    base_url: String,
    max_upload_bytes: usize,
}

impl UploadService {
    pub fn new(storage: Arc<dyn StorageBackend>, base_url: String, max_upload_bytes: usize) -> Self {
        Self {
            storage,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_upload_bytes,
        }
    }

    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        category: UploadCategory,
    ) -> Result<String, AppError> {
        if bytes.is_empty() {
            return Err(AppError::Upload("Upload payload is empty".into()));
        }

        if bytes.len() > self.max_upload_bytes {
            return Err(AppError::Upload(format!(
                "Upload exceeds limit of {} bytes",
                self.max_upload_bytes,
            )));
        }

        let key = format!("{}/{}", category.prefix(), Uuid::new_v4());
        let checksum = sha256_hex(&bytes);
        let byte_count = bytes.len();

        self.storage
            .put(&key, bytes, category.content_type())
            .await
            .map_err(|error| AppError::Upload(format!("Failed to persist upload: {error}")))?;

        tracing::debug!(key = %key, checksum = %checksum, bytes = byte_count, "Stored upload");
        Ok(format!("{}/{key}", self.base_url))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn service() -> UploadService {
        UploadService::new(
            Arc::new(MemoryStorage::new()),
            "https://media.test/".into(),
            64,
        )
    }

    #[tokio::test]
    async fn upload_returns_public_url_under_category() {
        let url = service()
            .upload(vec![1, 2, 3], UploadCategory::AudioChunk)
            .await
            .expect("upload");
        assert!(url.starts_with("https://media.test/audio-chunk/"));
    }

    #[tokio::test]
    async fn empty_payload_is_rejected() {
        let err = service()
            .upload(Vec::new(), UploadCategory::ChatImage)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Upload(_)));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let err = service()
            .upload(vec![0; 65], UploadCategory::ChatVideo)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Upload(_)));
    }
}
