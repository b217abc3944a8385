use serde::{Deserialize, Serialize};

use crate::codec::{from_json_slice, to_json_vec};
use crate::error::{Result, TypesError};
use crate::jid::Jid;

/// Collections requested on an initial sync.
pub const DEFAULT_COLLECTIONS: [&str; 5] = [
    "critical",
    "critical_low",
    "regular",
    "regular_high",
    "regular_low",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncdOperation {
    Set,
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncdRecord {
    pub index: Vec<String>,
    #[serde(with = "crate::codec::b64")]
    pub value: Vec<u8>,
    #[serde(default)]
    pub actor: Option<Jid>,
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl SyncdRecord {
    /// Stable key of the record's index, used to address it inside a collection.
    pub fn index_key(&self) -> String {
        serde_json::to_string(&self.index).unwrap_or_else(|_| self.index.join("\u{1f}"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncdMutation {
    pub operation: SyncdOperation,
    pub record: SyncdRecord,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncdPatch {
    pub version: u64,
    pub mutations: Vec<SyncdMutation>,
    /// Rolling hash the collection must have once this patch is applied.
    #[serde(default, with = "crate::codec::b64::option")]
    pub hash: Option<Vec<u8>>,
    #[serde(default)]
    pub device: Option<Jid>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncdSnapshot {
    pub version: u64,
    pub records: Vec<SyncdRecord>,
    #[serde(with = "crate::codec::b64")]
    pub hash: Vec<u8>,
}

impl SyncdPatch {
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let patch: SyncdPatch = from_json_slice(bytes)?;
        if patch.version == 0 {
            return Err(TypesError::InvalidField("version"));
        }
        Ok(patch)
    }
}

impl SyncdSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_json_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let snapshot: SyncdSnapshot = from_json_slice(bytes)?;
        if snapshot.version == 0 {
            return Err(TypesError::InvalidField("version"));
        }
        Ok(snapshot)
    }
}
