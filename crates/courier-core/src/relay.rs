use crate::backoff::{is_retryable, retry_with_backoff};
use crate::cache::TtlCache;
use crate::config::CoreConfig;
use crate::connection::Connection;
use crate::crypto::CryptoRepository;
use crate::directory::DeviceDirectory;
use crate::error::CoreError;
use crate::fanout::{Destination, FanoutEnv, FanoutRequest};
use crate::groups::GroupDirectory;
use crate::identity::{AuthState, Credentials};
use crate::ids::generate_message_id;
use crate::keystore::KeyStore;
use crate::policy::RetryPolicy;
use crate::sessions::SessionManager;
use courier_types::{DeviceAddress, Jid, MessageContent, MessageId, Stanza};
use log::{debug, info, warn};
use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct RelayOptions {
    pub message_id: Option<MessageId>,
    /// Single device to send to, used when answering a retry request.
    pub participant: Option<Jid>,
    pub additional_attributes: BTreeMap<String, String>,
    pub additional_nodes: Vec<Stanza>,
    pub use_user_devices_cache: bool,
    /// Recipients of a `status@broadcast` post.
    pub status_recipients: Vec<Jid>,
    /// Distinguishes re-sends of the same id from accidental duplicates.
    pub retry_attempt: u32,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            message_id: None,
            participant: None,
            additional_attributes: BTreeMap::new(),
            additional_nodes: Vec::new(),
            use_user_devices_cache: true,
            status_recipients: Vec::new(),
            retry_attempt: 0,
        }
    }
}

impl RelayOptions {
    pub fn is_peer(&self) -> bool {
        self.additional_attributes
            .get("category")
            .is_some_and(|c| c == "peer")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SendKey {
    message_id: MessageId,
    destination: String,
    participant: Option<String>,
    attempt: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SentMessage {
    pub destination: Jid,
    pub content: MessageContent,
}

#[derive(Clone, Debug)]
pub struct RelaySettings {
    pub recent_ttl: Duration,
    pub recent_max: usize,
    pub sent_cache_size: usize,
    pub send_retry: RetryPolicy,
}

impl RelaySettings {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            recent_ttl: Duration::from_millis(config.recent_sent_ttl_ms),
            recent_max: config.recent_sent_max,
            sent_cache_size: config.sent_message_cache_size,
            send_retry: config.send_retry.clone(),
        }
    }
}

/// Turns one logical message into a per-device encrypted stanza and puts it
/// on the wire.
#[derive(Clone)]
pub struct Relay {
    auth: AuthState,
    keys: KeyStore,
    conn: Arc<dyn Connection>,
    crypto: Arc<dyn CryptoRepository>,
    directory: DeviceDirectory,
    sessions: SessionManager,
    groups: GroupDirectory,
    recent: Arc<Mutex<TtlCache<SendKey, ()>>>,
    sent: Arc<Mutex<LruCache<MessageId, SentMessage>>>,
    settings: RelaySettings,
}

impl Relay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: AuthState,
        keys: KeyStore,
        conn: Arc<dyn Connection>,
        crypto: Arc<dyn CryptoRepository>,
        directory: DeviceDirectory,
        sessions: SessionManager,
        groups: GroupDirectory,
        settings: RelaySettings,
    ) -> Self {
        Self {
            auth,
            keys,
            conn,
            crypto,
            directory,
            sessions,
            groups,
            recent: Arc::new(Mutex::new(TtlCache::new(
                settings.recent_ttl,
                settings.recent_max,
            ))),
            sent: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(settings.sent_cache_size).unwrap_or(NonZeroUsize::MIN),
            ))),
            settings,
        }
    }

    pub async fn relay(
        &self,
        destination: &Jid,
        content: &MessageContent,
        options: &RelayOptions,
    ) -> Result<MessageId, CoreError> {
        let creds = self.auth.get().await?;
        let destination = Destination::classify(destination)?;
        let strategy = destination.strategy();
        let message_id = strategy
            .message_id_for(content)
            .or_else(|| options.message_id.clone())
            .unwrap_or_else(generate_message_id);

        let participant = match &options.participant {
            Some(jid) => Some(jid.device_address().ok_or_else(|| {
                CoreError::Validation(format!("participant {} is not a device", jid))
            })?),
            None => None,
        };

        let send_key = SendKey {
            message_id: message_id.clone(),
            destination: destination.jid().to_string(),
            participant: options.participant.as_ref().map(|p| p.to_string()),
            attempt: options.retry_attempt,
        };
        {
            let mut recent = self.recent.lock().await;
            if recent.contains(&send_key) {
                debug!(
                    "{} to {} already sent, skipping",
                    message_id,
                    destination.jid()
                );
                return Ok(message_id);
            }
            recent.insert(send_key.clone(), ());
        }

        let result = self
            .relay_once(&creds, &destination, content, options, participant.as_ref(), &message_id)
            .await;
        match result {
            Ok(()) => {
                self.sent.lock().await.put(
                    message_id.clone(),
                    SentMessage {
                        destination: destination.jid().clone(),
                        content: content.clone(),
                    },
                );
                Ok(message_id)
            }
            Err(err) => {
                self.recent.lock().await.remove(&send_key);
                warn!("relay of {} to {} failed: {}", message_id, destination.jid(), err);
                Err(err)
            }
        }
    }

    async fn relay_once(
        &self,
        creds: &Credentials,
        destination: &Destination,
        content: &MessageContent,
        options: &RelayOptions,
        participant: Option<&DeviceAddress>,
        message_id: &MessageId,
    ) -> Result<(), CoreError> {
        let tx = self.keys.begin().await;
        let env = FanoutEnv {
            keys: &tx,
            creds,
            directory: &self.directory,
            sessions: &self.sessions,
            crypto: self.crypto.as_ref(),
            groups: &self.groups,
        };
        let request = FanoutRequest {
            destination,
            content,
            options,
            participant,
        };
        let plan = destination.strategy().build(&env, &request).await?;

        let mut stanza = Stanza::new("message")
            .attr("id", message_id.as_str())
            .attr("type", content.stanza_type());
        for (k, v) in &plan.attrs {
            stanza.set_attr(k.clone(), v.clone());
        }
        let dest_jid = destination.jid().to_string();
        match (participant, &options.participant) {
            (Some(_), Some(participant_jid)) => {
                if destination.is_group_like() {
                    stanza.set_attr("to", dest_jid.clone());
                    stanza.set_attr("participant", participant_jid.to_string());
                } else if creds.is_me(participant_jid) {
                    stanza.set_attr("to", participant_jid.to_string());
                    stanza.set_attr("recipient", dest_jid.clone());
                } else {
                    stanza.set_attr("to", participant_jid.to_string());
                }
            }
            _ => stanza.set_attr("to", dest_jid.clone()),
        }
        for (k, v) in &options.additional_attributes {
            stanza.set_attr(k.clone(), v.clone());
        }
        for child in plan.children {
            stanza.push_child(child);
        }
        for node in &options.additional_nodes {
            stanza.push_child(node.clone());
        }
        if plan.has_pre_key {
            stanza.push_child(
                Stanza::new("device-identity").bytes(creds.device_identity.clone()),
            );
        }

        let conn = self.conn.clone();
        retry_with_backoff(&self.settings.send_retry, "message send", is_retryable, |_| {
            conn.send_node(stanza.clone())
        })
        .await?;
        tx.commit().await?;
        info!(
            "sent {} to {} ({} devices)",
            message_id,
            dest_jid,
            plan.devices.len()
        );
        Ok(())
    }

    /// Control message to our own primary device.
    pub async fn send_peer_message(
        &self,
        content: &MessageContent,
        mut options: RelayOptions,
    ) -> Result<MessageId, CoreError> {
        let creds = self.auth.get().await?;
        options
            .additional_attributes
            .insert("category".to_string(), "peer".to_string());
        options
            .additional_attributes
            .insert("push_priority".to_string(), "high_force".to_string());
        self.relay(&creds.me.to_non_device(), content, &options).await
    }

    /// Plaintext of a message this client sent recently.
    pub async fn recent_message(&self, id: &MessageId) -> Option<SentMessage> {
        self.sent.lock().await.get(id).cloned()
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }
}
