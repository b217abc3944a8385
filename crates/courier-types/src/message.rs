use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::codec::{from_json_slice, to_json_vec};
use crate::error::Result;
use crate::jid::Jid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub remote: Jid,
    pub id: MessageId,
    pub from_me: bool,
    #[serde(default)]
    pub participant: Option<Jid>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum PeerDataRequest {
    PlaceholderResend {
        keys: Vec<MessageKey>,
    },
    HistorySyncOnDemand {
        chat: Jid,
        oldest_msg_id: MessageId,
        oldest_from_me: bool,
        oldest_timestamp_ms: u64,
        count: u32,
    },
}

/// Decoded application payload. Building rich content is a caller concern;
/// the engine only inspects the variants that change how a send is routed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Payload {
        #[serde(with = "crate::codec::b64")]
        body: Vec<u8>,
        #[serde(default)]
        media_type: Option<String>,
    },
    Edit {
        key: MessageKey,
        content: Box<MessageContent>,
    },
    Revoke {
        key: MessageKey,
    },
    SenderKeyDistribution {
        group: Jid,
        #[serde(with = "crate::codec::b64")]
        distribution: Vec<u8>,
    },
    DeviceSent {
        destination: Jid,
        message: Box<MessageContent>,
    },
    PeerData(PeerDataRequest),
    Empty,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        MessageContent::Payload {
            body: body.into().into_bytes(),
            media_type: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_json_slice(bytes)
    }

    pub fn media_type(&self) -> Option<&str> {
        match self {
            MessageContent::Payload { media_type, .. } => media_type.as_deref(),
            MessageContent::Edit { content, .. } => content.media_type(),
            MessageContent::DeviceSent { message, .. } => message.media_type(),
            _ => None,
        }
    }

    /// `text` or `media`, the value of the outgoing `type` attribute.
    pub fn stanza_type(&self) -> &'static str {
        if self.media_type().is_some() {
            "media"
        } else {
            "text"
        }
    }
}
