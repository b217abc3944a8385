use crate::policy::{RetryPolicy, SyncFailurePolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
    pub max_msg_retry_count: u32,
    pub retry_request_delay_ms: u64,
    pub placeholder_resend_on_first_retry: bool,
    pub placeholder_grace_ms: u64,
    pub placeholder_timeout_ms: u64,
    pub retry_cache_ttl_ms: u64,
    pub device_cache_ttl_ms: u64,
    pub failed_session_ttl_ms: u64,
    pub recent_sent_ttl_ms: u64,
    pub recent_sent_max: usize,
    pub sent_message_cache_size: usize,
    pub notification_dedup_ms: u64,
    pub session_batch_size: usize,
    pub session_fetch_deadline_ms: u64,
    pub query_timeout_ms: u64,
    pub session_fetch_retry: RetryPolicy,
    pub send_retry: RetryPolicy,
    pub sync_failure: SyncFailurePolicy,
    pub verify_snapshots: bool,
    pub verify_patches: bool,
    pub emit_own_events: bool,
    pub send_active_receipts: bool,
    pub event_buffer: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_msg_retry_count: 5,
            retry_request_delay_ms: 250,
            placeholder_resend_on_first_retry: true,
            placeholder_grace_ms: 5_000,
            placeholder_timeout_ms: 15_000,
            retry_cache_ttl_ms: 60 * 60 * 1000,
            device_cache_ttl_ms: 5 * 60 * 1000,
            failed_session_ttl_ms: 5 * 60 * 1000,
            recent_sent_ttl_ms: 60 * 60 * 1000,
            recent_sent_max: 1_000,
            sent_message_cache_size: 256,
            notification_dedup_ms: 30_000,
            session_batch_size: 50,
            session_fetch_deadline_ms: 120_000,
            query_timeout_ms: 60_000,
            session_fetch_retry: RetryPolicy::session_fetch(),
            send_retry: RetryPolicy::final_send(),
            sync_failure: SyncFailurePolicy::default(),
            verify_snapshots: true,
            verify_patches: true,
            emit_own_events: true,
            send_active_receipts: false,
            event_buffer: 256,
        }
    }
}

impl CoreConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io {0}")]
    Io(String),
    #[error("parse {0}")]
    Parse(String),
}

pub fn load_config(path: &Path) -> Result<CoreConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<CoreConfig, ConfigError> {
    toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))
}
