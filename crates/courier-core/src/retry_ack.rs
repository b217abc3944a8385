use crate::cache::TtlCache;
use crate::config::CoreConfig;
use crate::connection::Connection;
use crate::crypto::{encode_big_endian, CryptoRepository, KEY_BUNDLE_TYPE};
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBatch, EventBus, MessageStatus};
use crate::identity::AuthState;
use crate::keystore::KeyStore;
use crate::placeholder::PlaceholderRequests;
use crate::relay::{Relay, RelayOptions};
use crate::sender_keys::SenderKeyMemory;
use crate::sessions::SessionManager;
use crate::store::MessageStore;
use courier_types::{Jid, MessageContent, MessageId, MessageKey, PeerDataRequest, Stanza};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Clone, Debug)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub request_delay: Duration,
    pub placeholder_on_first_retry: bool,
    pub cache_ttl: Duration,
}

impl RetrySettings {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            max_retries: config.max_msg_retry_count,
            request_delay: Duration::from_millis(config.retry_request_delay_ms),
            placeholder_on_first_retry: config.placeholder_resend_on_first_retry,
            cache_ttl: Duration::from_millis(config.retry_cache_ttl_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryRequestOutcome {
    Sent { count: u32, with_keys: bool },
    /// The pair reached the retry cap; no receipt was sent.
    Abandoned,
    ConnectionClosed,
}

pub fn retry_key(id: &MessageId, participant: &Jid) -> String {
    format!("{}:{}", id, participant)
}

/// Recovery side of delivery: asks peers to re-send what we could not
/// decrypt, and re-sends what peers could not decrypt.
#[derive(Clone)]
pub struct RetryManager {
    auth: AuthState,
    keys: KeyStore,
    conn: Arc<dyn Connection>,
    crypto: Arc<dyn CryptoRepository>,
    relay: Relay,
    sessions: SessionManager,
    placeholders: PlaceholderRequests,
    messages: Arc<dyn MessageStore>,
    events: EventBus,
    counters: Arc<Mutex<TtlCache<String, u32>>>,
    abandoned: Arc<Mutex<TtlCache<String, ()>>>,
    retry_lock: Arc<Mutex<()>>,
    settings: RetrySettings,
}

impl RetryManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: AuthState,
        keys: KeyStore,
        conn: Arc<dyn Connection>,
        crypto: Arc<dyn CryptoRepository>,
        relay: Relay,
        sessions: SessionManager,
        placeholders: PlaceholderRequests,
        messages: Arc<dyn MessageStore>,
        events: EventBus,
        settings: RetrySettings,
    ) -> Self {
        Self {
            auth,
            keys,
            conn,
            crypto,
            relay,
            sessions,
            placeholders,
            messages,
            events,
            counters: Arc::new(Mutex::new(TtlCache::new(settings.cache_ttl, 10_000))),
            abandoned: Arc::new(Mutex::new(TtlCache::new(settings.cache_ttl, 10_000))),
            retry_lock: Arc::new(Mutex::new(())),
            settings,
        }
    }

    /// Asks the sender of `node` to re-send it. Serialized with every other
    /// retry request and followed by the configured pause.
    pub async fn send_retry_request(
        &self,
        node: &Stanza,
        force: bool,
    ) -> Result<RetryRequestOutcome, CoreError> {
        let id = MessageId::new(attr(node, "id")?);
        let from: Jid = attr(node, "from")?.parse()?;
        let participant = match node.get_attr("participant") {
            Some(p) => Some(p.parse::<Jid>()?),
            None => None,
        };
        let sender = participant.clone().unwrap_or_else(|| from.clone());
        let key = retry_key(&id, &sender);

        let _serial = self.retry_lock.lock().await;
        if !self.conn.is_open() {
            debug!("connection closed, no retry receipt for {}", id);
            return Ok(RetryRequestOutcome::ConnectionClosed);
        }
        if self.abandoned.lock().await.contains(&key) {
            debug!("retries for {} already abandoned", key);
            return Ok(RetryRequestOutcome::Abandoned);
        }
        let count = {
            let mut counters = self.counters.lock().await;
            let current = counters.get(&key).unwrap_or(0);
            if current >= self.settings.max_retries {
                counters.remove(&key);
                self.abandoned.lock().await.insert(key.clone(), ());
                warn!("giving up on {} after {} retries", key, current);
                return Ok(RetryRequestOutcome::Abandoned);
            }
            counters.insert(key.clone(), current + 1);
            current + 1
        };
        let creds = self.auth.get().await?;

        if count == 1 && self.settings.placeholder_on_first_retry {
            let placeholders = self.placeholders.clone();
            let msg_key = MessageKey {
                remote: from.clone(),
                id: id.clone(),
                from_me: false,
                participant: participant.clone(),
            };
            tokio::spawn(async move {
                if let Err(err) = placeholders.request(msg_key).await {
                    warn!("placeholder resend request failed: {}", err);
                }
            });
        }

        let mut retry = Stanza::new("retry")
            .attr("count", count.to_string())
            .attr("id", id.as_str())
            .attr("v", "1");
        if let Some(t) = node.get_attr("t") {
            retry.set_attr("t", t);
        }
        let mut receipt = Stanza::new("receipt")
            .attr("id", id.as_str())
            .attr("type", "retry")
            .attr("to", from.to_string());
        for name in ["recipient", "participant"] {
            if let Some(value) = node.get_attr(name) {
                receipt.set_attr(name, value);
            }
        }
        receipt.push_child(retry);
        receipt.push_child(
            Stanza::new("registration").bytes(encode_big_endian(creds.registration_id, 4)),
        );

        let with_keys = count > 1 || force;
        let mut pending = None;
        if with_keys {
            let tx = self.keys.begin().await;
            let bundle = self.crypto.next_key_bundle(&tx).await?;
            let mut children = vec![Stanza::new("type").bytes(vec![KEY_BUNDLE_TYPE])];
            children.extend(bundle.key_nodes());
            children.push(Stanza::new("device-identity").bytes(creds.device_identity.clone()));
            receipt.push_child(Stanza::new("keys").children(children));
            pending = Some((tx, bundle));
        }

        self.conn.send_node(receipt).await?;
        info!("sent retry receipt {} for {} (keys: {})", count, key, with_keys);

        if let Some((tx, bundle)) = pending {
            tx.commit().await?;
            if let Some(pre_key) = bundle.pre_key {
                let updated = self
                    .auth
                    .update(|c| c.next_pre_key_id = c.next_pre_key_id.max(pre_key.id + 1))
                    .await?;
                self.events.publish(CoreEvent::CredentialsUpdated(updated));
            }
        }
        sleep(self.settings.request_delay).await;
        Ok(RetryRequestOutcome::Sent { count, with_keys })
    }

    pub async fn retry_count(&self, id: &MessageId, participant: &Jid) -> u32 {
        self.counters
            .lock()
            .await
            .get(&retry_key(id, participant))
            .unwrap_or(0)
    }

    pub async fn will_send_message_again(&self, id: &MessageId, participant: &Jid) -> bool {
        let key = retry_key(id, participant);
        if self.abandoned.lock().await.contains(&key) {
            return false;
        }
        self.counters.lock().await.get(&key).unwrap_or(0) < self.settings.max_retries
    }

    async fn bump(&self, id: &MessageId, participant: &Jid) -> u32 {
        let key = retry_key(id, participant);
        let mut counters = self.counters.lock().await;
        let next = counters.get(&key).unwrap_or(0) + 1;
        counters.insert(key, next);
        next
    }

    async fn lookup(&self, key: &MessageKey) -> Result<Option<MessageContent>, CoreError> {
        if let Some(sent) = self.relay.recent_message(&key.id).await {
            return Ok(Some(sent.content));
        }
        self.messages.get_message(key).await
    }

    /// Re-sends `ids` after a retry receipt from `key.participant` (or the
    /// chat itself for direct chats). A primary-device requester gets a
    /// fresh fanout to all devices; a companion gets only its own copy.
    pub async fn resend(&self, key: &MessageKey, ids: &[MessageId]) -> Result<usize, CoreError> {
        let participant = key.participant.clone().unwrap_or_else(|| key.remote.clone());
        let addr = participant.device_address().ok_or_else(|| {
            CoreError::Validation(format!("retry from non-device {}", participant))
        })?;
        let send_to_all = participant.device == 0;

        self.sessions.assert_sessions(&[addr], true).await?;
        if key.remote.is_group() {
            let tx = self.keys.begin().await;
            SenderKeyMemory::clear(&tx, &key.remote).await?;
            tx.commit().await?;
        }

        let mut resent = 0;
        for id in ids {
            let msg_key = MessageKey {
                id: id.clone(),
                ..key.clone()
            };
            let Some(content) = self.lookup(&msg_key).await? else {
                warn!("{} requested again but not found", id);
                continue;
            };
            let attempt = self.bump(id, &participant).await;
            let mut options = RelayOptions {
                message_id: Some(id.clone()),
                retry_attempt: attempt,
                ..RelayOptions::default()
            };
            if send_to_all {
                options.use_user_devices_cache = false;
            } else {
                options.participant = Some(participant.clone());
            }
            self.relay.relay(&key.remote, &content, &options).await?;
            info!("re-sent {} to {} (attempt {})", id, participant, attempt);
            resent += 1;
        }
        Ok(resent)
    }

    /// A server ack that reports a participant-hash mismatch or an error.
    pub async fn handle_bad_ack(
        &self,
        node: &Stanza,
        batch: &mut EventBatch,
    ) -> Result<(), CoreError> {
        let id = MessageId::new(attr(node, "id")?);
        let from: Jid = attr(node, "from")?.parse()?;
        let participant = match node.get_attr("participant") {
            Some(p) => Some(p.parse::<Jid>()?),
            None => None,
        };
        let key = MessageKey {
            remote: from.clone(),
            id: id.clone(),
            from_me: true,
            participant,
        };

        if node.get_attr("class") == Some("message") && node.get_attr("phash").is_some() {
            self.resend_after_phash(&key).await;
        }
        if let Some(error) = node.get_attr("error") {
            warn!("server rejected {}: error {}", id, error);
            batch.push(CoreEvent::MessageStatusUpdated {
                key,
                status: MessageStatus::Error,
                stub_params: vec![error.to_string()],
            });
        }
        Ok(())
    }

    async fn resend_after_phash(&self, key: &MessageKey) {
        let cache_key = retry_key(&key.id, &key.remote);
        let attempt = {
            let mut counters = self.counters.lock().await;
            let current = counters.get(&cache_key).unwrap_or(0);
            if current >= self.settings.max_retries {
                counters.remove(&cache_key);
                self.abandoned.lock().await.insert(cache_key.clone(), ());
                warn!("participant hash mismatch for {}, retries exhausted", cache_key);
                return;
            }
            counters.insert(cache_key.clone(), current + 1);
            current + 1
        };
        let content = match self.lookup(key).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                warn!("participant hash mismatch for {}, message unavailable", key.id);
                return;
            }
            Err(err) => {
                warn!("lookup of {} failed: {}", key.id, err);
                return;
            }
        };
        let options = RelayOptions {
            message_id: Some(key.id.clone()),
            use_user_devices_cache: false,
            retry_attempt: attempt,
            ..RelayOptions::default()
        };
        match self.relay.relay(&key.remote, &content, &options).await {
            Ok(_) => info!("re-sent {} after participant hash mismatch", key.id),
            Err(err) => warn!("re-send of {} failed: {}", key.id, err),
        }
    }

    /// Asks our primary device for `count` messages older than `oldest`.
    pub async fn fetch_message_history(
        &self,
        count: u32,
        oldest: &MessageKey,
        oldest_timestamp_ms: u64,
    ) -> Result<MessageId, CoreError> {
        let request = MessageContent::PeerData(PeerDataRequest::HistorySyncOnDemand {
            chat: oldest.remote.clone(),
            oldest_msg_id: oldest.id.clone(),
            oldest_from_me: oldest.from_me,
            oldest_timestamp_ms,
            count,
        });
        self.relay
            .send_peer_message(&request, RelayOptions::default())
            .await
    }

    pub fn placeholders(&self) -> &PlaceholderRequests {
        &self.placeholders
    }
}

pub(crate) fn attr<'a>(node: &'a Stanza, name: &str) -> Result<&'a str, CoreError> {
    node.get_attr(name)
        .ok_or_else(|| CoreError::Structural(format!("{} without {}", node.tag, name)))
}
