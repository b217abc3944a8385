mod codec;
mod error;
mod jid;
mod message;
mod stanza;
mod syncd;

pub use crate::codec::{from_json_slice, to_json_vec};
pub use crate::error::{Result, TypesError};
pub use crate::jid::{AccountId, DeviceAddress, Domain, Jid, Namespace, STATUS_BROADCAST};
pub use crate::message::{MessageContent, MessageId, MessageKey, PeerDataRequest};
pub use crate::stanza::{Content, Stanza, StanzaError};
pub use crate::syncd::{
    SyncdMutation, SyncdOperation, SyncdPatch, SyncdRecord, SyncdSnapshot, DEFAULT_COLLECTIONS,
};
