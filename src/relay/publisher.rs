use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::errors::AppError;
use crate::models::AudioSlot;
use crate::paths;
use crate::store::{server_timestamp, DocumentStore};
use crate::telemetry::Telemetry;
use crate::uploads::{UploadCategory, UploadService};

use super::AudioCapture;

/// Publishing half of the relay: records fixed windows from the local
/// microphone and overwrites this user's audio slot with each uploaded
/// chunk. A failed window is skipped, never retried; the next window starts
/// regardless.
pub struct RelayPublisher {
    session_id: Uuid,
    user_id: Uuid,
    muted: Arc<AtomicBool>,
    cancel: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

impl RelayPublisher {
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        uploads: UploadService,
        capture: Arc<dyn AudioCapture>,
        telemetry: Arc<Telemetry>,
        config: RelayConfig,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Self {
        let muted = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let loop_muted = muted.clone();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            publish_loop(
                store,
                uploads,
                capture,
                telemetry,
                config,
                session_id,
                user_id,
                loop_muted,
                loop_cancel,
            )
            .await;
        });

        Self {
            session_id,
            user_id,
            muted,
            cancel,
            task,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Pauses the recording loop. The remote `is_speaking` flag is NOT
    /// cleared; it stays at its last written value until the next chunk.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RelayPublisher {
    fn drop(&mut self) {
        // Navigating away must not leak a timer that keeps uploading.
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn publish_loop(
    store: Arc<dyn DocumentStore>,
    uploads: UploadService,
    capture: Arc<dyn AudioCapture>,
    telemetry: Arc<Telemetry>,
    config: RelayConfig,
    session_id: Uuid,
    user_id: Uuid,
    muted: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let window = Duration::from_millis(config.chunk_window_ms);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if muted.load(Ordering::Relaxed) {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(window) => continue,
            }
        }

        // The device restarts for every window; there is no continuous
        // recording stream to pull from.
        let recorded = tokio::select! {
            _ = cancel.cancelled() => break,
            recorded = capture.record_window(window) => recorded,
        };

        let bytes = match recorded {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = ?error,
                    "Recording window failed, skipping"
                );
                continue;
            }
        };

        if bytes.is_empty() {
            continue;
        }

        let url = match uploads.upload(bytes, UploadCategory::AudioChunk).await {
            Ok(url) => url,
            Err(error) => {
                // The window is dropped and the next one starts on
                // schedule. The user is never told.
                telemetry.inc_chunk_upload_failure();
                tracing::warn!(
                    session_id = %session_id,
                    user_id = %user_id,
                    error = ?error,
                    "Chunk upload failed, window dropped"
                );
                continue;
            }
        };

        if let Err(error) = write_slot(store.as_ref(), session_id, user_id, &url).await {
            telemetry.inc_chunk_upload_failure();
            tracing::warn!(
                session_id = %session_id,
                user_id = %user_id,
                error = ?error,
                "Audio slot write failed, window dropped"
            );
        }
    }

    tracing::debug!(session_id = %session_id, user_id = %user_id, "Relay publisher stopped");
}

async fn write_slot(
    store: &dyn DocumentStore,
    session_id: Uuid,
    user_id: Uuid,
    url: &str,
) -> Result<(), AppError> {
    let slot = AudioSlot {
        user_id,
        audio_url: url.to_string(),
        published_at: Utc::now(),
        is_speaking: true,
    };

    let mut value = serde_json::to_value(&slot)?;
    value["published_at"] = server_timestamp();
    store
        .set(&paths::audio_slot(session_id, user_id), value)
        .await?;
    Ok(())
}
