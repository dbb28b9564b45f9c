use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::errors::AppError;
use crate::models::AudioSlot;
use crate::paths;
use crate::store::{Document, DocumentStore, Query};
use crate::telemetry::Telemetry;

use super::{speaking_now, AudioSink};

/// Receiving half of the relay: watches every audio slot in the session and
/// plays each remote speaker's newest live chunk. Strictly latest-value: a
/// new chunk replaces whatever that speaker was playing, nothing queues.
pub struct RelayListener {
    latest_slots: Arc<RwLock<HashMap<Uuid, AudioSlot>>>,
    silence_timeout_ms: Option<i64>,
    pub(crate) task: JoinHandle<()>,
    _guard: DropGuard,
}

impl RelayListener {
    pub async fn spawn(
        store: Arc<dyn DocumentStore>,
        sink: Arc<dyn AudioSink>,
        telemetry: Arc<Telemetry>,
        config: RelayConfig,
        session_id: Uuid,
        self_user_id: Uuid,
    ) -> Result<Self, AppError> {
        let query = Query::collection(paths::audio_collection(session_id));
        let mut snapshots = store.subscribe(query).await?;

        let latest_slots = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let child = cancel.child_token();
        let slots_for_task = latest_slots.clone();
        let stale_threshold_ms = config.stale_chunk_threshold_ms;

        let task = tokio::spawn(async move {
            // Last URL started per remote speaker; the duplicate filter.
            let mut last_played: HashMap<Uuid, String> = HashMap::new();

            loop {
                let snapshot = tokio::select! {
                    _ = child.cancelled() => break,
                    snapshot = snapshots.recv() => match snapshot {
                        Some(snapshot) => snapshot,
                        None => break,
                    },
                };

                handle_snapshot(
                    snapshot,
                    self_user_id,
                    stale_threshold_ms,
                    sink.as_ref(),
                    &telemetry,
                    &mut last_played,
                    &slots_for_task,
                )
                .await;
            }
            tracing::debug!(session_id = %session_id, "Relay listener stopped");
        });

        Ok(Self {
            latest_slots,
            silence_timeout_ms: config.silence_timeout_ms,
            task,
            _guard: cancel.drop_guard(),
        })
    }

    /// Users whose last-known slot still reads as speaking. Without a
    /// configured silence timeout this echoes the sticky stored flag.
    pub async fn speakers(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let slots = self.latest_slots.read().await;
        slots
            .values()
            .filter(|slot| speaking_now(slot, self.silence_timeout_ms, now))
            .map(|slot| slot.user_id)
            .collect()
    }
}

async fn handle_snapshot(
    snapshot: Vec<Document>,
    self_user_id: Uuid,
    stale_threshold_ms: i64,
    sink: &dyn AudioSink,
    telemetry: &Telemetry,
    last_played: &mut HashMap<Uuid, String>,
    latest_slots: &RwLock<HashMap<Uuid, AudioSlot>>,
) {
    for doc in snapshot {
        let slot = match doc.decode::<AudioSlot>() {
            Ok(slot) => slot,
            Err(error) => {
                tracing::warn!(path = %doc.path, error = ?error, "Skipping undecodable audio slot");
                continue;
            }
        };

        // Never play our own chunks back.
        if slot.user_id == self_user_id {
            continue;
        }

        {
            let mut slots = latest_slots.write().await;
            slots.insert(slot.user_id, slot.clone());
        }

        if last_played.get(&slot.user_id) == Some(&slot.audio_url) {
            telemetry.inc_duplicate_chunk_ignored();
            continue;
        }

        let age_ms = Utc::now().timestamp_millis() - slot.timestamp_ms();
        if age_ms >= stale_threshold_ms {
            // Too old to pass for live; skip it even though the URL is new.
            telemetry.inc_stale_chunk_dropped();
            continue;
        }

        // Replace, never overlap: whatever this speaker was playing stops
        // before the new chunk starts.
        sink.stop(slot.user_id).await;
        match sink.play(slot.user_id, &slot.audio_url).await {
            Ok(()) => {
                last_played.insert(slot.user_id, slot.audio_url);
            }
            Err(error) => {
                // Clear the tracking entry so a stuck reference cannot
                // block this speaker's future chunks.
                telemetry.inc_playback_failure();
                last_played.remove(&slot.user_id);
                tracing::warn!(
                    user_id = %slot.user_id,
                    error = ?error,
                    "Chunk playback failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{server_timestamp, MemoryStore};
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum SinkEvent {
        Stopped(Uuid),
        Started(Uuid, String),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<SinkEvent>>,
        fail_next_play: AtomicBool,
    }

    impl RecordingSink {
        async fn events(&self) -> Vec<SinkEvent> {
            self.events.lock().await.clone()
        }

        async fn started_urls(&self) -> Vec<String> {
            self.events()
                .await
                .into_iter()
                .filter_map(|event| match event {
                    SinkEvent::Started(_, url) => Some(url),
                    SinkEvent::Stopped(_) => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, speaker: Uuid, url: &str) -> Result<(), AppError> {
            if self.fail_next_play.swap(false, Ordering::Relaxed) {
                return Err(AppError::Internal("decoder refused the chunk".into()));
            }
            let mut events = self.events.lock().await;
            events.push(SinkEvent::Started(speaker, url.to_string()));
            Ok(())
        }

        async fn stop(&self, speaker: Uuid) {
            let mut events = self.events.lock().await;
            events.push(SinkEvent::Stopped(speaker));
        }
    }

    fn config() -> RelayConfig {
        // RUST_LOG=parlor_live=debug surfaces the pump traces when a test
        // here goes sideways.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        RelayConfig {
            chunk_window_ms: 1000,
            stale_chunk_threshold_ms: 3000,
            silence_timeout_ms: None,
        }
    }

    async fn write_live_slot(store: &MemoryStore, session_id: Uuid, user_id: Uuid, url: &str) {
        let mut value = serde_json::json!({
            "user_id": user_id,
            "audio_url": url,
            "is_speaking": true,
        });
        value["published_at"] = server_timestamp();
        store
            .set(&paths::audio_slot(session_id, user_id), value)
            .await
            .expect("write slot");
    }

    async fn write_aged_slot(
        store: &MemoryStore,
        session_id: Uuid,
        user_id: Uuid,
        url: &str,
        age_ms: i64,
    ) {
        let published_at = Utc::now() - TimeDelta::milliseconds(age_ms);
        let value = serde_json::json!({
            "user_id": user_id,
            "audio_url": url,
            "published_at": published_at.to_rfc3339(),
            "is_speaking": true,
        });
        store
            .set(&paths::audio_slot(session_id, user_id), value)
            .await
            .expect("write slot");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn plays_new_live_chunk_once() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let session_id = Uuid::new_v4();
        let speaker = Uuid::new_v4();

        let listener = RelayListener::spawn(
            store.clone(),
            sink.clone(),
            Arc::new(Telemetry::default()),
            config(),
            session_id,
            Uuid::new_v4(),
        )
        .await
        .expect("spawn");

        write_live_slot(&store, session_id, speaker, "https://m/a").await;
        settle().await;

        let started = sink.started_urls().await;
        assert_eq!(started, vec!["https://m/a".to_string()]);
        assert_eq!(listener.speakers().await, vec![speaker]);
    }

    #[tokio::test]
    async fn duplicate_url_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let telemetry = Arc::new(Telemetry::default());
        let session_id = Uuid::new_v4();
        let speaker = Uuid::new_v4();

        let _listener = RelayListener::spawn(
            store.clone(),
            sink.clone(),
            telemetry.clone(),
            config(),
            session_id,
            Uuid::new_v4(),
        )
        .await
        .expect("spawn");

        write_live_slot(&store, session_id, speaker, "https://m/a").await;
        settle().await;
        // Same URL rewritten: the slot notification fires, the chunk does
        // not replay.
        write_live_slot(&store, session_id, speaker, "https://m/a").await;
        settle().await;

        assert_eq!(sink.started_urls().await.len(), 1);
        assert!(telemetry.duplicate_chunks_ignored() >= 1);
    }

    #[tokio::test]
    async fn stale_chunk_is_never_played() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let telemetry = Arc::new(Telemetry::default());
        let session_id = Uuid::new_v4();
        let speaker = Uuid::new_v4();

        let _listener = RelayListener::spawn(
            store.clone(),
            sink.clone(),
            telemetry.clone(),
            config(),
            session_id,
            Uuid::new_v4(),
        )
        .await
        .expect("spawn");

        write_aged_slot(&store, session_id, speaker, "https://m/old", 10_000).await;
        settle().await;

        assert!(sink.started_urls().await.is_empty());
        assert!(telemetry.stale_chunks_dropped() >= 1);
    }

    #[tokio::test]
    async fn newer_chunk_replaces_playback_without_overlap() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let session_id = Uuid::new_v4();
        let speaker = Uuid::new_v4();

        let _listener = RelayListener::spawn(
            store.clone(),
            sink.clone(),
            Arc::new(Telemetry::default()),
            config(),
            session_id,
            Uuid::new_v4(),
        )
        .await
        .expect("spawn");

        write_live_slot(&store, session_id, speaker, "https://m/a").await;
        settle().await;
        write_live_slot(&store, session_id, speaker, "https://m/b").await;
        settle().await;

        let events = sink.events().await;
        assert_eq!(
            events,
            vec![
                SinkEvent::Stopped(speaker),
                SinkEvent::Started(speaker, "https://m/a".into()),
                SinkEvent::Stopped(speaker),
                SinkEvent::Started(speaker, "https://m/b".into()),
            ]
        );
    }

    #[tokio::test]
    async fn own_slot_is_never_played_back() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let session_id = Uuid::new_v4();
        let me = Uuid::new_v4();

        let _listener = RelayListener::spawn(
            store.clone(),
            sink.clone(),
            Arc::new(Telemetry::default()),
            config(),
            session_id,
            me,
        )
        .await
        .expect("spawn");

        write_live_slot(&store, session_id, me, "https://m/self").await;
        settle().await;

        assert!(sink.events().await.is_empty());
    }

    #[tokio::test]
    async fn playback_failure_clears_tracking_so_replay_works() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let telemetry = Arc::new(Telemetry::default());
        let session_id = Uuid::new_v4();
        let speaker = Uuid::new_v4();

        let _listener = RelayListener::spawn(
            store.clone(),
            sink.clone(),
            telemetry.clone(),
            config(),
            session_id,
            Uuid::new_v4(),
        )
        .await
        .expect("spawn");

        sink.fail_next_play.store(true, Ordering::Relaxed);
        write_live_slot(&store, session_id, speaker, "https://m/a").await;
        settle().await;
        assert!(sink.started_urls().await.is_empty());

        // The same URL arrives again; with the tracking entry cleared it is
        // not mistaken for a duplicate.
        write_live_slot(&store, session_id, speaker, "https://m/a").await;
        settle().await;

        assert_eq!(sink.started_urls().await, vec!["https://m/a".to_string()]);
    }

    #[tokio::test]
    async fn dropping_the_listener_stops_the_pump() {
        let store = Arc::new(MemoryStore::new());
        let session_id = Uuid::new_v4();

        let listener = RelayListener::spawn(
            store.clone(),
            Arc::new(RecordingSink::default()),
            Arc::new(Telemetry::default()),
            config(),
            session_id,
            Uuid::new_v4(),
        )
        .await
        .expect("spawn");

        let task = listener.task;
        let guard = listener._guard;
        drop(guard);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(task.is_finished());
    }
}
