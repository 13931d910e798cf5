//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::DEFAULT_LOCAL_ID_PREFIX;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Prefix marking locally minted, unconfirmed ids
    #[serde(default = "default_local_id_prefix")]
    pub local_id_prefix: String,

    /// Namespace for cache envelopes in the key/value store
    #[serde(default = "default_cache_key_prefix")]
    pub cache_key_prefix: String,

    /// Namespace for pending queues in the key/value store
    #[serde(default = "default_queue_key_prefix")]
    pub queue_key_prefix: String,

    /// Drain every registered collection when reachability is regained
    #[serde(default = "default_true")]
    pub drain_on_reconnect: bool,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub uploads: UploadConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_id_prefix: default_local_id_prefix(),
            cache_key_prefix: default_cache_key_prefix(),
            queue_key_prefix: default_queue_key_prefix(),
            drain_on_reconnect: true,
            retry: RetryPolicy::default(),
            uploads: UploadConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parse a TOML document. Missing keys fall back to their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_id_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "local_id_prefix must not be empty".to_string(),
            ));
        }
        if self.cache_key_prefix == self.queue_key_prefix {
            return Err(ConfigError::Invalid(format!(
                "cache_key_prefix and queue_key_prefix must differ (both \"{}\")",
                self.cache_key_prefix
            )));
        }
        let upload_prefix = &self.uploads.key_prefix;
        if upload_prefix == &self.cache_key_prefix || upload_prefix == &self.queue_key_prefix {
            return Err(ConfigError::Invalid(format!(
                "uploads.key_prefix \"{upload_prefix}\" collides with another namespace"
            )));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_key(&self, collection: &str) -> String {
        format!("{}:{collection}", self.cache_key_prefix)
    }

    pub fn queue_key(&self, collection: &str) -> String {
        format!("{}:{collection}", self.queue_key_prefix)
    }

    pub fn dead_letter_key(&self, collection: &str) -> String {
        format!("{}:dead:{collection}", self.queue_key_prefix)
    }

    /// Namespace for one owner's held uploads.
    pub fn upload_key(&self, owner_id: &str) -> String {
        format!("{}:{owner_id}", self.uploads.key_prefix)
    }
}

/// What to do with actions the remote keeps rejecting.
///
/// The default never gives up: actions stay queued until they succeed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// After this many failed attempts with a permanent error, move the
    /// action to the dead-letter log.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    pub fn dead_letter_after(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts),
        }
    }
}

/// Limits applied to image uploads before any bytes leave the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_upload_bytes")]
    pub max_bytes: usize,

    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,

    /// Namespace for uploads held while offline.
    #[serde(default = "default_upload_key_prefix")]
    pub key_prefix: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_upload_bytes(),
            allowed_content_types: default_allowed_content_types(),
            key_prefix: default_upload_key_prefix(),
        }
    }
}

fn default_true() -> bool { true }
fn default_local_id_prefix() -> String { DEFAULT_LOCAL_ID_PREFIX.to_string() }
fn default_cache_key_prefix() -> String { "cache".to_string() }
fn default_queue_key_prefix() -> String { "pending".to_string() }
fn default_max_upload_bytes() -> usize { 10 * 1024 * 1024 }
fn default_upload_key_prefix() -> String { "uploads".to_string() }

fn default_allowed_content_types() -> Vec<String> {
    ["image/jpeg", "image/png", "image/webp", "image/gif"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
