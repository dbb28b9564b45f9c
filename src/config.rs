use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Length of one local recording window. Wire-compatible value: 1000.
    #[serde(default = "default_chunk_window_ms")]
    pub chunk_window_ms: u64,
    /// Chunks older than this at notification time are never played.
    /// Wire-compatible value: 3000.
    #[serde(default = "default_stale_chunk_threshold_ms")]
    pub stale_chunk_threshold_ms: i64,
    /// Optional cleaner contract for the sticky speaking flag: when set,
    /// `speaking_now` reports false for slots older than this. The stored
    /// flag itself is never rewritten.
    #[serde(default)]
    pub silence_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_identity_ttl_seconds")]
    pub identity_ttl_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default = "default_storage_local_root")]
    pub local_root: String,
    #[serde(default = "default_storage_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_chunk_window_ms() -> u64 {
    crate::relay::CHUNK_WINDOW_MS
}

fn default_stale_chunk_threshold_ms() -> i64 {
    crate::relay::STALE_CHUNK_THRESHOLD_MS
}

fn default_identity_ttl_seconds() -> u64 {
    300
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_storage_local_root() -> String {
    "data/media".to_string()
}

fn default_storage_base_url() -> String {
    "https://media.parlor.app".to_string()
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_window_ms: default_chunk_window_ms(),
            stale_chunk_threshold_ms: default_stale_chunk_threshold_ms(),
            silence_timeout_ms: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            identity_ttl_seconds: default_identity_ttl_seconds(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            local_root: default_storage_local_root(),
            base_url: default_storage_base_url(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Self {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".into());

        if Path::new(&config_path).exists() {
            let contents =
                std::fs::read_to_string(&config_path).expect("Failed to read config file");
            toml::from_str(&contents).expect("Failed to parse config file")
        } else {
            // Fall back to environment variables
            AppConfig {
                relay: RelayConfig {
                    chunk_window_ms: env_parsed("RELAY_CHUNK_WINDOW_MS", default_chunk_window_ms()),
                    stale_chunk_threshold_ms: env_parsed(
                        "RELAY_STALE_CHUNK_THRESHOLD_MS",
                        default_stale_chunk_threshold_ms(),
                    ),
                    silence_timeout_ms: std::env::var("RELAY_SILENCE_TIMEOUT_MS")
                        .ok()
                        .map(|value| {
                            value
                                .parse()
                                .expect("RELAY_SILENCE_TIMEOUT_MS must be a number")
                        }),
                },
                cache: CacheConfig {
                    identity_ttl_seconds: env_parsed(
                        "CACHE_IDENTITY_TTL_SECONDS",
                        default_identity_ttl_seconds(),
                    ),
                },
                storage: StorageConfig {
                    backend: std::env::var("STORAGE_BACKEND")
                        .unwrap_or_else(|_| default_storage_backend()),
                    local_root: std::env::var("STORAGE_LOCAL_ROOT")
                        .unwrap_or_else(|_| default_storage_local_root()),
                    base_url: std::env::var("STORAGE_BASE_URL")
                        .unwrap_or_else(|_| default_storage_base_url()),
                    max_upload_bytes: env_parsed(
                        "MEDIA_MAX_UPLOAD_BYTES",
                        default_max_upload_bytes(),
                    ),
                },
            }
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, fallback: T) -> T
where
    T::Err: std::fmt::Debug,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .unwrap_or_else(|_| panic!("{name} must be a number")),
        Err(_) => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_wire_constants() {
        let config = AppConfig::default();
        assert_eq!(config.relay.chunk_window_ms, 1000);
        assert_eq!(config.relay.stale_chunk_threshold_ms, 3000);
        assert!(config.relay.silence_timeout_ms.is_none());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config: AppConfig = toml::from_str(
            r#"
            [relay]
            silence_timeout_ms = 5000

            [storage]
            backend = "local"
            "#,
        )
        .expect("parse");

        assert_eq!(config.relay.chunk_window_ms, 1000);
        assert_eq!(config.relay.silence_timeout_ms, Some(5000));
        assert_eq!(config.storage.backend, "local");
        assert_eq!(config.storage.max_upload_bytes, 10 * 1024 * 1024);
    }
}
