use crate::error::CoreError;
use crate::relay::{Relay, RelayOptions};
use courier_types::{MessageContent, MessageId, MessageKey, PeerDataRequest};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

#[derive(Clone, Debug)]
struct PendingPlaceholder {
    issued_at: Instant,
    sent: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaceholderOutcome {
    /// A request for this message is already pending.
    AlreadyPending,
    /// The content arrived during the grace period; nothing was sent.
    Resolved,
    /// The resend request went out under this peer message id.
    Sent(MessageId),
}

/// Asks our primary device to resend messages the server could only deliver
/// as "unavailable" placeholders.
#[derive(Clone)]
pub struct PlaceholderRequests {
    pending: Arc<Mutex<HashMap<MessageId, PendingPlaceholder>>>,
    relay: Relay,
    grace: Duration,
    timeout: Duration,
}

impl PlaceholderRequests {
    pub fn new(relay: Relay, grace: Duration, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            relay,
            grace,
            timeout,
        }
    }

    pub async fn request(&self, key: MessageKey) -> Result<PlaceholderOutcome, CoreError> {
        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&key.id) {
                debug!("placeholder resend for {} already pending", key.id);
                return Ok(PlaceholderOutcome::AlreadyPending);
            }
            pending.insert(
                key.id.clone(),
                PendingPlaceholder {
                    issued_at: Instant::now(),
                    sent: false,
                },
            );
        }

        sleep(self.grace).await;
        {
            let mut pending = self.pending.lock().await;
            match pending.get_mut(&key.id) {
                Some(entry) => entry.sent = true,
                None => {
                    debug!("{} arrived during grace period", key.id);
                    return Ok(PlaceholderOutcome::Resolved);
                }
            }
        }

        let id = key.id.clone();
        let request = MessageContent::PeerData(PeerDataRequest::PlaceholderResend { keys: vec![key] });
        let sent = match self
            .relay
            .send_peer_message(&request, RelayOptions::default())
            .await
        {
            Ok(sent) => sent,
            Err(err) => {
                self.pending.lock().await.remove(&id);
                return Err(err);
            }
        };
        info!("requested placeholder resend of {} as {}", id, sent);

        let pending = self.pending.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(entry) = pending.lock().await.remove(&id) {
                warn!(
                    "placeholder resend of {} unanswered after {:?}",
                    id,
                    entry.issued_at.elapsed()
                );
            }
        });
        Ok(PlaceholderOutcome::Sent(sent))
    }

    /// Content for `id` arrived. Returns whether a request was pending.
    pub async fn resolve(&self, id: &MessageId) -> bool {
        match self.pending.lock().await.remove(id) {
            Some(entry) => {
                if entry.sent {
                    debug!("placeholder resend of {} answered", id);
                }
                true
            }
            None => false,
        }
    }

    pub async fn is_pending(&self, id: &MessageId) -> bool {
        self.pending.lock().await.contains_key(id)
    }
}
