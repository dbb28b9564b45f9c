//! In-process core of the live community-session layer: session lifecycle,
//! chat stream ordering and rendering, role/character binding, and the
//! chunked audio relay. Consumed directly by UI code; exposes no network
//! surface of its own.

pub mod cache;
pub mod chat;
pub mod config;
pub mod errors;
pub mod identity;
pub mod models;
pub mod paths;
pub mod relay;
pub mod roleplay;
pub mod sessions;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod uploads;

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::chat::ChatStreamManager;
use crate::config::AppConfig;
use crate::errors::AppError;
use crate::identity::IdentityResolver;
use crate::relay::{AudioCapture, AudioSink, RelayListener, RelayPublisher};
use crate::roleplay::RoleBinder;
use crate::sessions::SessionRegistry;
use crate::storage::{create_storage_backend, StorageBackend};
use crate::store::DocumentStore;
use crate::telemetry::Telemetry;
use crate::uploads::UploadService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub storage: Arc<dyn StorageBackend>,
    pub uploads: UploadService,
    pub telemetry: Arc<Telemetry>,
    pub identity: Arc<IdentityResolver>,
    pub sessions: Arc<SessionRegistry>,
    pub chat: Arc<ChatStreamManager>,
    pub roleplay: Arc<RoleBinder>,
}

impl AppState {
    pub async fn new(
        config: AppConfig,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, AppError> {
        let storage = create_storage_backend(&config.storage).await?;
        Ok(Self::with_storage(config, store, storage))
    }

    pub fn with_storage(
        config: AppConfig,
        store: Arc<dyn DocumentStore>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let config = Arc::new(config);
        let telemetry = Arc::new(Telemetry::default());
        let uploads = UploadService::new(
            storage.clone(),
            config.storage.base_url.clone(),
            config.storage.max_upload_bytes,
        );
        let identity = Arc::new(IdentityResolver::new(
            store.clone(),
            telemetry.clone(),
            Duration::from_secs(config.cache.identity_ttl_seconds),
        ));
        let sessions = Arc::new(SessionRegistry::new(
            store.clone(),
            identity.clone(),
            telemetry.clone(),
        ));
        let chat = Arc::new(ChatStreamManager::new(
            store.clone(),
            identity.clone(),
            telemetry.clone(),
        ));
        let roleplay = Arc::new(RoleBinder::new(store.clone(), telemetry.clone()));

        Self {
            config,
            store,
            storage,
            uploads,
            telemetry,
            identity,
            sessions,
            chat,
            roleplay,
        }
    }

    /// Starts publishing this user's microphone into the session. The
    /// returned handle owns the recording loop; dropping it stops the loop.
    pub fn publish_audio(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        capture: Arc<dyn AudioCapture>,
    ) -> RelayPublisher {
        RelayPublisher::spawn(
            self.store.clone(),
            self.uploads.clone(),
            capture,
            self.telemetry.clone(),
            self.config.relay.clone(),
            session_id,
            user_id,
        )
    }

    /// Starts playing the other participants' chunks. Dropping the returned
    /// handle unsubscribes and stops playback dispatch.
    pub async fn listen_audio(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        sink: Arc<dyn AudioSink>,
    ) -> Result<RelayListener, AppError> {
        RelayListener::spawn(
            self.store.clone(),
            sink,
            self.telemetry.clone(),
            self.config.relay.clone(),
            session_id,
            user_id,
        )
        .await
    }
}
