pub mod app_state;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod events;
pub mod fanout;
pub mod groups;
pub mod identity;
pub mod ids;
pub mod inbound;
pub mod keystore;
pub mod lt_hash;
pub mod pipeline;
pub mod placeholder;
pub mod policy;
pub mod relay;
pub mod retry_ack;
pub mod sender_keys;
pub mod sessions;
pub mod store;
pub mod time;

use app_state::{AppStateSettings, AppStateSync, LocalPatch};
use config::CoreConfig;
use connection::Connection;
use courier_types::{
    AccountId, DeviceAddress, Jid, MessageContent, MessageId, MessageKey, Stanza,
    DEFAULT_COLLECTIONS,
};
use crypto::CryptoRepository;
use directory::{DeviceDirectory, DirectoryQuery};
use error::CoreError;
use events::{EventBus, EventReceiver};
use groups::{GroupDirectory, GroupMetadataCache, GroupRoster};
use identity::{AuthState, Credentials};
use inbound::InboundHandler;
use keystore::{KeyAccess, KeyStore};
use pipeline::EventPipeline;
use placeholder::PlaceholderRequests;
use relay::{Relay, RelayOptions, RelaySettings};
use retry_ack::{RetryManager, RetrySettings};
use sessions::{SessionFetchSettings, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use store::MessageStore;
use tokio::sync::Mutex;

/// External collaborators the engine is built on.
pub struct CoreDeps {
    pub connection: Arc<dyn Connection>,
    pub crypto: Arc<dyn CryptoRepository>,
    pub directory: Arc<dyn DirectoryQuery>,
    pub roster: Arc<dyn GroupRoster>,
    pub group_cache: Option<Arc<dyn GroupMetadataCache>>,
    pub key_backend: Arc<dyn KeyAccess>,
    pub messages: Arc<dyn MessageStore>,
}

#[derive(Clone)]
pub struct Core {
    config: CoreConfig,
    auth: AuthState,
    keys: KeyStore,
    events: EventBus,
    directory: DeviceDirectory,
    sessions: SessionManager,
    relay: Relay,
    retry: RetryManager,
    app_state: AppStateSync,
    pipeline: EventPipeline,
}

impl Core {
    pub fn new(config: CoreConfig, deps: CoreDeps) -> Self {
        let auth = AuthState::new();
        let keys = KeyStore::new(deps.key_backend);
        let events = EventBus::new(config.event_buffer);
        let ordering = Arc::new(Mutex::new(()));
        let directory = DeviceDirectory::new(
            deps.directory,
            Duration::from_millis(config.device_cache_ttl_ms),
        );
        let sessions = SessionManager::new(
            keys.clone(),
            deps.crypto.clone(),
            deps.connection.clone(),
            SessionFetchSettings {
                batch_size: config.session_batch_size,
                deadline: Duration::from_millis(config.session_fetch_deadline_ms),
                failed_ttl: Duration::from_millis(config.failed_session_ttl_ms),
                retry: config.session_fetch_retry.clone(),
            },
        );
        let groups = GroupDirectory::new(deps.roster, deps.group_cache);
        let relay = Relay::new(
            auth.clone(),
            keys.clone(),
            deps.connection.clone(),
            deps.crypto.clone(),
            directory.clone(),
            sessions.clone(),
            groups,
            RelaySettings::from_config(&config),
        );
        let placeholders = PlaceholderRequests::new(
            relay.clone(),
            Duration::from_millis(config.placeholder_grace_ms),
            Duration::from_millis(config.placeholder_timeout_ms),
        );
        let retry = RetryManager::new(
            auth.clone(),
            keys.clone(),
            deps.connection.clone(),
            deps.crypto.clone(),
            relay.clone(),
            sessions.clone(),
            placeholders,
            deps.messages,
            events.clone(),
            RetrySettings::from_config(&config),
        );
        let app_state = AppStateSync::new(
            auth.clone(),
            keys.clone(),
            deps.connection.clone(),
            events.clone(),
            ordering.clone(),
            AppStateSettings::from_config(&config),
        );
        let handler = InboundHandler::new(
            auth.clone(),
            keys.clone(),
            deps.connection.clone(),
            deps.crypto,
            directory.clone(),
            retry.clone(),
            app_state.clone(),
            Duration::from_millis(config.notification_dedup_ms),
            config.send_active_receipts,
        );
        let pipeline = EventPipeline::new(handler, deps.connection, events.clone(), ordering);
        Self {
            config,
            auth,
            keys,
            events,
            directory,
            sessions,
            relay,
            retry,
            app_state,
            pipeline,
        }
    }

    pub async fn set_credentials(&self, creds: Credentials) {
        self.auth.set(creds).await;
    }

    pub async fn credentials(&self) -> Result<Credentials, CoreError> {
        self.auth.get().await
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub async fn relay(
        &self,
        destination: &Jid,
        content: &MessageContent,
        options: &RelayOptions,
    ) -> Result<MessageId, CoreError> {
        self.relay.relay(destination, content, options).await
    }

    pub async fn send_peer_message(
        &self,
        content: &MessageContent,
        options: RelayOptions,
    ) -> Result<MessageId, CoreError> {
        self.relay.send_peer_message(content, options).await
    }

    pub async fn assert_sessions(
        &self,
        addresses: &[DeviceAddress],
        force: bool,
    ) -> Result<bool, CoreError> {
        self.sessions.assert_sessions(addresses, force).await
    }

    pub async fn get_devices(
        &self,
        accounts: &[AccountId],
        use_cache: bool,
        ignore_zero_devices: bool,
    ) -> Result<Vec<DeviceAddress>, CoreError> {
        let creds = self.auth.get().await?;
        self.directory
            .get_devices(accounts, use_cache, ignore_zero_devices, &creds.own_addresses())
            .await
    }

    pub async fn resync(&self, names: &[String], is_initial_sync: bool) -> Result<(), CoreError> {
        self.app_state.resync(names, is_initial_sync).await
    }

    /// Syncs every well-known collection as part of the first login.
    pub async fn initial_sync(&self) -> Result<(), CoreError> {
        let names: Vec<String> = DEFAULT_COLLECTIONS.iter().map(|n| n.to_string()).collect();
        self.app_state.resync(&names, true).await
    }

    pub async fn apply_local_patch(&self, patch: LocalPatch) -> Result<u64, CoreError> {
        self.app_state.apply_local_patch(patch).await
    }

    pub async fn process_node(&self, node: Stanza) {
        self.pipeline.process_node(node).await
    }

    pub async fn resume_offline(&self) -> bool {
        self.pipeline.resume().await
    }

    pub async fn fetch_message_history(
        &self,
        count: u32,
        oldest: &MessageKey,
        oldest_timestamp_ms: u64,
    ) -> Result<MessageId, CoreError> {
        self.retry
            .fetch_message_history(count, oldest, oldest_timestamp_ms)
            .await
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn retry(&self) -> &RetryManager {
        &self.retry
    }

    pub fn app_state(&self) -> &AppStateSync {
        &self.app_state
    }

    pub fn pipeline(&self) -> &EventPipeline {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests;
