use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const SLOW_STORE_CALL_THRESHOLD_MS: u128 = 200;

#[derive(Debug, Default)]
pub struct Telemetry {
    chunk_upload_failures: AtomicU64,
    stale_chunks_dropped: AtomicU64,
    duplicate_chunks_ignored: AtomicU64,
    playback_failures: AtomicU64,
    identity_fallbacks: AtomicU64,
    tx_retries: AtomicU64,
    slow_store_calls: AtomicU64,
}

impl Telemetry {
    pub fn inc_chunk_upload_failure(&self) {
        self.chunk_upload_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale_chunk_dropped(&self) {
        self.stale_chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicate_chunk_ignored(&self) {
        self.duplicate_chunks_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_playback_failure(&self) {
        self.playback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_identity_fallback(&self) {
        self.identity_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tx_retry(&self) {
        self.tx_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn identity_fallbacks(&self) -> u64 {
        self.identity_fallbacks.load(Ordering::Relaxed)
    }

    pub fn stale_chunks_dropped(&self) -> u64 {
        self.stale_chunks_dropped.load(Ordering::Relaxed)
    }

    pub fn duplicate_chunks_ignored(&self) -> u64 {
        self.duplicate_chunks_ignored.load(Ordering::Relaxed)
    }

    pub fn chunk_upload_failures(&self) -> u64 {
        self.chunk_upload_failures.load(Ordering::Relaxed)
    }

    pub fn observe_store_call(&self, call_name: &str, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis();
        if elapsed_ms < SLOW_STORE_CALL_THRESHOLD_MS {
            return;
        }

        let total_slow = self.slow_store_calls.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            call = call_name,
            elapsed_ms,
            threshold_ms = SLOW_STORE_CALL_THRESHOLD_MS,
            total_slow,
            "Observed slow store call"
        );
    }
}
