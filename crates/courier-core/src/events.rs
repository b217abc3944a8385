use crate::identity::Credentials;
use courier_types::{Jid, MessageContent, MessageKey, SyncdMutation};
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    Error,
    Pending,
    ServerAck,
    DeliveryAck,
    Read,
    Played,
}

impl MessageStatus {
    /// Status implied by a receipt `type` attribute.
    pub fn from_receipt_type(receipt_type: Option<&str>) -> Option<Self> {
        match receipt_type {
            None | Some("") => Some(MessageStatus::DeliveryAck),
            Some("read") | Some("read-self") => Some(MessageStatus::Read),
            Some("played") | Some("played-self") => Some(MessageStatus::Played),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CoreEvent {
    MessageUpserted {
        key: MessageKey,
        content: Option<MessageContent>,
        /// Set when the message could not be decrypted.
        stub: Option<String>,
        offline: bool,
    },
    MessageStatusUpdated {
        key: MessageKey,
        status: MessageStatus,
        stub_params: Vec<String>,
    },
    ReceiptUpdated {
        key: MessageKey,
        recipient: Jid,
        receipt_type: String,
        timestamp_ms: u64,
    },
    CredentialsUpdated(Credentials),
    AppStateMutations {
        collection: String,
        mutations: Vec<SyncdMutation>,
        is_initial_sync: bool,
    },
    Call {
        from: Jid,
        call_id: String,
        status: String,
        offline: bool,
    },
}

pub type EventReceiver = broadcast::Receiver<CoreEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn batch(&self) -> EventBatch {
        EventBatch {
            bus: self.clone(),
            events: Vec::new(),
            open: true,
        }
    }
}

/// Collects events and publishes them together. Publishing happens on
/// `commit` or when the batch is dropped; only `discard` drops them.
pub struct EventBatch {
    bus: EventBus,
    events: Vec<CoreEvent>,
    open: bool,
}

impl EventBatch {
    pub fn push(&mut self, event: CoreEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn commit(mut self) {
        self.flush();
    }

    pub fn discard(mut self) {
        self.events.clear();
        self.open = false;
    }

    fn flush(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        for event in self.events.drain(..) {
            self.bus.publish(event);
        }
    }
}

impl Drop for EventBatch {
    fn drop(&mut self) {
        self.flush();
    }
}
