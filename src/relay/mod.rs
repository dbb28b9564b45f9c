//! Chunked audio relay: simulates live voice by publishing 1-second
//! recordings through blob storage and a latest-value slot per speaker in
//! the document store. Lossy and overwrite-based: a new chunk replaces the
//! speaker's slot, nothing queues, and dropped windows stay dropped.

mod listener;
mod publisher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::AudioSlot;

pub use listener::RelayListener;
pub use publisher::RelayPublisher;

/// One local recording window. Wire-compatible: exactly 1000.
pub const CHUNK_WINDOW_MS: u64 = 1000;

/// Chunks older than this at notification time are never played.
/// Wire-compatible: exactly 3000.
pub const STALE_CHUNK_THRESHOLD_MS: i64 = 3000;

/// Microphone-side device boundary. Each call opens the device fresh,
/// records one window and releases it; there is no continuous stream.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    async fn record_window(&self, window: Duration) -> Result<Vec<u8>, AppError>;
}

/// Speaker-side device boundary. At most one chunk plays per remote speaker;
/// `play` replaces whatever that speaker was playing.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, speaker: Uuid, url: &str) -> Result<(), AppError>;
    async fn stop(&self, speaker: Uuid);
}

/// Last-known speaking view over a slot. The stored flag is sticky, so
/// without a configured silence timeout this simply echoes it; with one,
/// slots older than the timeout read as silent.
pub fn speaking_now(slot: &AudioSlot, silence_timeout_ms: Option<i64>, now: DateTime<Utc>) -> bool {
    if !slot.is_speaking {
        return false;
    }

    match silence_timeout_ms {
        Some(timeout) => now.timestamp_millis() - slot.timestamp_ms() < timeout,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn slot(age_ms: i64, is_speaking: bool) -> (AudioSlot, DateTime<Utc>) {
        let now = Utc::now();
        let slot = AudioSlot {
            user_id: Uuid::new_v4(),
            audio_url: "https://media.test/audio-chunk/a".into(),
            published_at: now - TimeDelta::milliseconds(age_ms),
            is_speaking,
        };
        (slot, now)
    }

    #[test]
    fn sticky_flag_reads_speaking_without_timeout() {
        let (slot, now) = slot(60_000, true);
        assert!(speaking_now(&slot, None, now));
    }

    #[test]
    fn silence_timeout_reads_old_slots_as_silent() {
        let (slot, now) = slot(6_000, true);
        assert!(!speaking_now(&slot, Some(5_000), now));

        let (fresh, now) = self::slot(1_000, true);
        assert!(speaking_now(&fresh, Some(5_000), now));
    }

    #[test]
    fn never_speaking_when_flag_is_false() {
        let (slot, now) = slot(0, false);
        assert!(!speaking_now(&slot, Some(5_000), now));
        assert!(!speaking_now(&slot, None, now));
    }
}
