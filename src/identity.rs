use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::models::UserProfile;
use crate::paths;
use crate::store::DocumentStore;
use crate::telemetry::Telemetry;

/// Resolves user ids to display profiles, with an expiring cache in front of
/// the store. Lookup failures never propagate; callers fall back to whatever
/// denormalized name they carry.
pub struct IdentityResolver {
    store: Arc<dyn DocumentStore>,
    telemetry: Arc<Telemetry>,
    cache: TtlCache<Uuid, UserProfile>,
    ttl: Duration,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn DocumentStore>, telemetry: Arc<Telemetry>, ttl: Duration) -> Self {
        Self {
            store,
            telemetry,
            cache: TtlCache::new(),
            ttl,
        }
    }

    pub async fn resolve(&self, user_id: Uuid) -> Option<UserProfile> {
        if let Some(profile) = self.cache.get(&user_id).await {
            return Some(profile);
        }

        let started = Instant::now();
        let result = self.store.get(&paths::user(user_id)).await;
        self.telemetry
            .observe_store_call("identity.resolve", started.elapsed());

        let doc = match result {
            Ok(Some(doc)) => doc,
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = ?error, "Identity lookup failed");
                return None;
            }
        };

        match doc.decode::<UserProfile>() {
            Ok(profile) => {
                self.cache.set(user_id, profile.clone(), self.ttl).await;
                Some(profile)
            }
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = ?error, "Malformed user profile document");
                None
            }
        }
    }

    /// Never fails: a missing or broken profile degrades to the denormalized
    /// name carried on the message or participant record.
    pub async fn resolve_or_fallback(&self, user_id: Uuid, fallback_name: &str) -> UserProfile {
        match self.resolve(user_id).await {
            Some(profile) => profile,
            None => {
                self.telemetry.inc_identity_fallback();
                UserProfile {
                    display_name: fallback_name.to_string(),
                    avatar_url: None,
                }
            }
        }
    }

    pub async fn invalidate(&self, user_id: Uuid) {
        self.cache.invalidate(&user_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn resolver(store: Arc<dyn DocumentStore>) -> IdentityResolver {
        IdentityResolver::new(store, Arc::new(Telemetry::default()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn resolves_profile_from_store() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        store
            .set(
                &paths::user(user_id),
                json!({"display_name": "ada", "avatar_url": "https://a/ada.png"}),
            )
            .await
            .expect("seed");

        let resolver = resolver(store);
        let profile = resolver.resolve(user_id).await.expect("profile");
        assert_eq!(profile.display_name, "ada");
    }

    #[tokio::test]
    async fn missing_profile_uses_fallback_and_counts_it() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let telemetry = Arc::new(Telemetry::default());
        let resolver = IdentityResolver::new(store, telemetry.clone(), Duration::from_secs(60));

        let profile = resolver
            .resolve_or_fallback(Uuid::new_v4(), "stored-name")
            .await;
        assert_eq!(profile.display_name, "stored-name");
        assert_eq!(telemetry.identity_fallbacks(), 1);
    }

    #[tokio::test]
    async fn second_resolve_hits_cache() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        store
            .set(&paths::user(user_id), json!({"display_name": "grace"}))
            .await
            .expect("seed");

        let resolver = resolver(store.clone());
        resolver.resolve(user_id).await.expect("first");

        // Remove the backing document; the cached profile still resolves.
        store.delete(&paths::user(user_id)).await.expect("delete");
        let profile = resolver.resolve(user_id).await.expect("cached");
        assert_eq!(profile.display_name, "grace");
    }
}
