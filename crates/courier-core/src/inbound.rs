use crate::app_state::AppStateSync;
use crate::cache::TtlCache;
use crate::connection::Connection;
use crate::crypto::{CiphertextKind, CryptoRepository};
use crate::directory::DeviceDirectory;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBatch, MessageStatus};
use crate::identity::AuthState;
use crate::keystore::KeyStore;
use crate::placeholder::PlaceholderRequests;
use crate::retry_ack::{attr, RetryManager};
use courier_types::{DeviceAddress, Jid, MessageContent, MessageId, MessageKey, Stanza};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Builds the plain ack the server expects for every stanza it delivers,
/// echoing its `type` when it has one.
pub fn build_ack(node: &Stanza, me: Option<&Jid>) -> Stanza {
    let mut ack = Stanza::new("ack")
        .attr("id", node.get_attr("id").unwrap_or_default())
        .attr("to", node.get_attr("from").unwrap_or_default())
        .attr("class", node.tag.clone());
    for name in ["participant", "recipient", "type"] {
        if let Some(value) = node.get_attr(name) {
            ack.set_attr(name, value);
        }
    }
    let unavailable = node.tag == "message" && node.child("unavailable").is_some();
    if unavailable {
        if let Some(me) = me {
            ack.set_attr("from", me.to_string());
        }
    }
    ack
}

#[derive(Clone)]
pub struct InboundHandler {
    auth: AuthState,
    keys: KeyStore,
    conn: Arc<dyn Connection>,
    crypto: Arc<dyn CryptoRepository>,
    directory: DeviceDirectory,
    retry: RetryManager,
    placeholders: PlaceholderRequests,
    app_state: AppStateSync,
    notifications: Arc<Mutex<TtlCache<String, ()>>>,
    send_active_receipts: bool,
}

impl InboundHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: AuthState,
        keys: KeyStore,
        conn: Arc<dyn Connection>,
        crypto: Arc<dyn CryptoRepository>,
        directory: DeviceDirectory,
        retry: RetryManager,
        app_state: AppStateSync,
        notification_window: Duration,
        send_active_receipts: bool,
    ) -> Self {
        let placeholders = retry.placeholders().clone();
        Self {
            auth,
            keys,
            conn,
            crypto,
            directory,
            retry,
            placeholders,
            app_state,
            notifications: Arc::new(Mutex::new(TtlCache::new(notification_window, 10_000))),
            send_active_receipts,
        }
    }

    /// Dispatches one stanza. Every message, receipt, notification and call
    /// is acked, whether or not its handler succeeded.
    pub async fn handle(&self, node: &Stanza, offline: bool, batch: &mut EventBatch) {
        let result = match node.tag.as_str() {
            "message" => self.handle_message(node, offline, batch).await,
            "receipt" => self.handle_receipt(node, batch).await,
            "notification" => self.handle_notification(node).await,
            "call" => self.handle_call(node, offline, batch).await,
            "ack" => {
                if let Err(err) = self.retry.handle_bad_ack(node, batch).await {
                    warn!("bad ack handling failed: {}", err);
                }
                return;
            }
            other => {
                debug!("ignoring {} stanza", other);
                return;
            }
        };
        if let Err(err) = result {
            error!(
                "handling {} {} failed: {}",
                node.tag,
                node.get_attr("id").unwrap_or_default(),
                err
            );
        }
        let me = self.auth.get().await.ok().map(|c| c.me);
        let ack = build_ack(node, me.as_ref());
        if let Err(err) = self.conn.send_node(ack).await {
            warn!("ack for {} failed: {}", node.get_attr("id").unwrap_or_default(), err);
        }
    }

    async fn handle_message(
        &self,
        node: &Stanza,
        offline: bool,
        batch: &mut EventBatch,
    ) -> Result<(), CoreError> {
        let creds = self.auth.get().await?;
        let id = MessageId::new(attr(node, "id")?);
        let from: Jid = attr(node, "from")?.parse()?;
        let participant = parse_opt(node, "participant")?;
        let author = participant.clone().unwrap_or_else(|| from.clone());
        let from_me = creds.is_me(&author);
        let group_like = from.is_group() || from.is_broadcast();
        let remote = if group_like {
            from.clone()
        } else if from_me {
            parse_opt(node, "recipient")?.unwrap_or_else(|| from.to_non_device())
        } else {
            from.to_non_device()
        };
        let mut key = MessageKey {
            remote,
            id: id.clone(),
            from_me,
            participant: if group_like { participant.clone() } else { None },
        };

        let encs: Vec<&Stanza> = node.children_named("enc").collect();
        if encs.is_empty() {
            if node.child("unavailable").is_some() {
                debug!("{} unavailable, requesting placeholder resend", id);
                let placeholders = self.placeholders.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    if let Err(err) = placeholders.request(key).await {
                        warn!("placeholder resend request failed: {}", err);
                    }
                });
            } else {
                debug!("{} carries no content", id);
            }
            return Ok(());
        }
        self.placeholders.resolve(&id).await;

        let author_addr = author
            .device_address()
            .ok_or_else(|| CoreError::Structural(format!("author {} is not a device", author)))?;
        let group = if group_like { Some(&from) } else { None };
        match self.decrypt_all(&encs, &author_addr, group).await {
            Ok(contents) => {
                for content in contents {
                    let content = match content {
                        MessageContent::DeviceSent {
                            destination,
                            message,
                        } if from_me => {
                            key.remote = destination;
                            *message
                        }
                        other => other,
                    };
                    batch.push(CoreEvent::MessageUpserted {
                        key: key.clone(),
                        content: Some(content),
                        stub: None,
                        offline,
                    });
                }
                self.send_delivery_receipt(node, &from, &author, from_me)
                    .await
            }
            Err(err) => {
                warn!("could not decrypt {} from {}: {}", id, author, err);
                batch.push(CoreEvent::MessageUpserted {
                    key,
                    content: None,
                    stub: Some("ciphertext".to_string()),
                    offline,
                });
                if self.conn.is_open() {
                    self.retry.send_retry_request(node, false).await?;
                } else {
                    debug!("connection closed, no retry request for {}", id);
                }
                Ok(())
            }
        }
    }

    /// Decrypts every `enc` child inside one transaction. Sender-key
    /// distributions are applied and not returned.
    async fn decrypt_all(
        &self,
        encs: &[&Stanza],
        author: &DeviceAddress,
        group: Option<&Jid>,
    ) -> Result<Vec<MessageContent>, CoreError> {
        let tx = self.keys.begin().await;
        let mut out = Vec::new();
        for enc in encs {
            let kind = enc.get_attr("type").unwrap_or_default();
            let bytes = enc
                .content_bytes()
                .ok_or_else(|| CoreError::Structural("enc without ciphertext".to_string()))?;
            let plaintext = match CiphertextKind::parse(kind) {
                Some(CiphertextKind::SkMsg) => {
                    let group = group.ok_or_else(|| {
                        CoreError::Structural("sender-key message outside a group".to_string())
                    })?;
                    self.crypto
                        .decrypt_group_message(&tx, group, author, bytes)
                        .await?
                }
                Some(kind) => self.crypto.decrypt_message(&tx, author, kind, bytes).await?,
                None => return Err(CoreError::Crypto(format!("unsupported ciphertext {}", kind))),
            };
            let content = MessageContent::decode(&plaintext)?;
            if let MessageContent::SenderKeyDistribution {
                group,
                distribution,
            } = &content
            {
                self.crypto
                    .process_sender_key_distribution(&tx, group, author, distribution)
                    .await?;
                continue;
            }
            out.push(content);
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn send_delivery_receipt(
        &self,
        node: &Stanza,
        from: &Jid,
        author: &Jid,
        from_me: bool,
    ) -> Result<(), CoreError> {
        let mut receipt = Stanza::new("receipt")
            .attr("id", node.get_attr("id").unwrap_or_default())
            .attr("to", from.to_string());
        let mut participant = node.get_attr("participant").map(str::to_string);
        let receipt_type = if node.get_attr("category") == Some("peer") {
            Some("peer_msg")
        } else if from_me {
            if from.is_account() {
                participant = Some(author.to_string());
            }
            Some("sender")
        } else if !self.send_active_receipts {
            Some("inactive")
        } else {
            None
        };
        if let Some(kind) = receipt_type {
            receipt.set_attr("type", kind);
        }
        if let Some(participant) = participant {
            receipt.set_attr("participant", participant);
        }
        self.conn.send_node(receipt).await
    }

    async fn handle_receipt(&self, node: &Stanza, batch: &mut EventBatch) -> Result<(), CoreError> {
        let creds = self.auth.get().await?;
        let id = MessageId::new(attr(node, "id")?);
        let from: Jid = attr(node, "from")?.parse()?;
        let participant = parse_opt(node, "participant")?;
        let receipt_type = node.get_attr("type");
        let recipient = parse_opt(node, "recipient")?;
        let from_me = recipient.is_none()
            || (matches!(receipt_type, Some("retry") | Some("sender")) && creds.is_me(&from));
        let group_like = from.is_group() || from.is_broadcast();
        let remote = if group_like {
            from.clone()
        } else if let Some(recipient) = &recipient {
            recipient.clone()
        } else {
            from.to_non_device()
        };
        let mut key = MessageKey {
            remote,
            id: id.clone(),
            from_me,
            participant: participant.clone(),
        };
        let mut ids = vec![id.clone()];
        if let Some(list) = node.child("list") {
            ids.extend(
                list.children_named("item")
                    .filter_map(|item| item.get_attr("id"))
                    .map(MessageId::new),
            );
        }

        if let Some(status) = MessageStatus::from_receipt_type(receipt_type) {
            let timestamp_ms = node
                .get_attr("t")
                .and_then(|t| t.parse::<u64>().ok())
                .map(|t| t * 1000)
                .unwrap_or_else(crate::time::now_ms);
            for id in &ids {
                let key = MessageKey {
                    id: id.clone(),
                    ..key.clone()
                };
                if group_like {
                    batch.push(CoreEvent::ReceiptUpdated {
                        key,
                        recipient: participant.clone().unwrap_or_else(|| from.clone()),
                        receipt_type: receipt_type.unwrap_or("delivery").to_string(),
                        timestamp_ms,
                    });
                } else if from_me {
                    batch.push(CoreEvent::MessageStatusUpdated {
                        key,
                        status,
                        stub_params: Vec::new(),
                    });
                }
            }
        }

        if receipt_type == Some("retry") {
            let sender = participant.unwrap_or_else(|| from.clone());
            key.participant = Some(sender.clone());
            if !self.retry.will_send_message_again(&id, &sender).await {
                info!("retry cap reached for {} from {}, not re-sending", id, sender);
            } else if !from_me {
                info!("retry receipt for {} we did not send", id);
            } else if let Err(err) = self.retry.resend(&key, &ids).await {
                warn!("re-send of {} to {} failed: {}", id, sender, err);
            }
        }
        Ok(())
    }

    async fn handle_notification(&self, node: &Stanza) -> Result<(), CoreError> {
        let from = attr(node, "from")?;
        let id = attr(node, "id")?;
        {
            let mut seen = self.notifications.lock().await;
            let dedup = format!("{}:{}", from, id);
            if seen.contains(&dedup) {
                debug!("duplicate notification {}", dedup);
                return Ok(());
            }
            seen.insert(dedup, ());
        }
        match node.get_attr("type") {
            Some("server_sync") => {
                let names: Vec<String> = node
                    .children_named("collection")
                    .filter_map(|c| c.get_attr("name"))
                    .map(str::to_string)
                    .collect();
                if names.is_empty() {
                    return Ok(());
                }
                info!("server asked to sync {:?}", names);
                let sync = self.app_state.clone();
                tokio::spawn(async move {
                    if let Err(err) = sync.resync(&names, false).await {
                        warn!("resync of {:?} failed: {}", names, err);
                    }
                });
            }
            Some("devices") => {
                let jid: Jid = from.parse()?;
                if let Some(account) = jid.account() {
                    debug!("device list of {} changed", account);
                    self.directory.invalidate(&account).await;
                }
            }
            other => debug!("unhandled notification type {:?}", other),
        }
        Ok(())
    }

    async fn handle_call(
        &self,
        node: &Stanza,
        offline: bool,
        batch: &mut EventBatch,
    ) -> Result<(), CoreError> {
        let from: Jid = attr(node, "from")?.parse()?;
        let Some(info) = node.all_children().first() else {
            return Ok(());
        };
        let call_id = info
            .get_attr("call-id")
            .or_else(|| node.get_attr("id"))
            .unwrap_or_default()
            .to_string();
        batch.push(CoreEvent::Call {
            from,
            call_id,
            status: info.tag.clone(),
            offline,
        });
        Ok(())
    }
}

fn parse_opt(node: &Stanza, name: &str) -> Result<Option<Jid>, CoreError> {
    match node.get_attr(name) {
        Some(value) => Ok(Some(value.parse()?)),
        None => Ok(None),
    }
}
