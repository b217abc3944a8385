use crate::error::CoreError;
use crate::keystore::KeyAccess;
use async_trait::async_trait;
use courier_types::{DeviceAddress, Jid, Stanza};

/// Value of the `type` child of a key bundle.
pub const KEY_BUNDLE_TYPE: u8 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CiphertextKind {
    Msg,
    PkMsg,
    SkMsg,
}

impl CiphertextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiphertextKind::Msg => "msg",
            CiphertextKind::PkMsg => "pkmsg",
            CiphertextKind::SkMsg => "skmsg",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "msg" => Some(CiphertextKind::Msg),
            "pkmsg" => Some(CiphertextKind::PkMsg),
            "skmsg" => Some(CiphertextKind::SkMsg),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ciphertext {
    pub kind: CiphertextKind,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupCiphertext {
    pub ciphertext: Vec<u8>,
    /// Sender-key distribution message for devices that lack the key.
    pub distribution: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKey {
    pub id: u32,
    pub public: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedPreKey {
    pub id: u32,
    pub public: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyBundle {
    pub registration_id: u32,
    pub identity: Vec<u8>,
    pub signed_pre_key: SignedPreKey,
    pub pre_key: Option<PreKey>,
}

/// Session cryptography. Every call receives the key access of the caller's
/// transaction so session mutations commit or roll back with it.
#[async_trait]
pub trait CryptoRepository: Send + Sync {
    async fn encrypt_message(
        &self,
        keys: &dyn KeyAccess,
        address: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<Ciphertext, CoreError>;

    async fn encrypt_group_message(
        &self,
        keys: &dyn KeyAccess,
        group: &Jid,
        me: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<GroupCiphertext, CoreError>;

    async fn decrypt_message(
        &self,
        keys: &dyn KeyAccess,
        address: &DeviceAddress,
        kind: CiphertextKind,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CoreError>;

    async fn decrypt_group_message(
        &self,
        keys: &dyn KeyAccess,
        group: &Jid,
        author: &DeviceAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CoreError>;

    async fn process_sender_key_distribution(
        &self,
        keys: &dyn KeyAccess,
        group: &Jid,
        author: &DeviceAddress,
        distribution: &[u8],
    ) -> Result<(), CoreError>;

    async fn inject_session(
        &self,
        keys: &dyn KeyAccess,
        address: &DeviceAddress,
        bundle: &KeyBundle,
    ) -> Result<(), CoreError>;

    /// Our own bundle for a peer to rebuild its session. Consumes one
    /// one-time pre-key.
    async fn next_key_bundle(&self, keys: &dyn KeyAccess) -> Result<KeyBundle, CoreError>;

    /// Session-store id of an endpoint.
    fn address_for(&self, address: &DeviceAddress) -> String {
        address.session_id()
    }
}

pub fn encode_big_endian(value: u32, len: usize) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    bytes[4 - len.min(4)..].to_vec()
}

pub fn decode_big_endian(bytes: &[u8]) -> Result<u32, CoreError> {
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(CoreError::Structural(format!(
            "integer field of {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

fn bytes_child(node: &Stanza, tag: &str) -> Result<Vec<u8>, CoreError> {
    node.child(tag)
        .and_then(|c| c.content_bytes())
        .map(|b| b.to_vec())
        .ok_or_else(|| CoreError::Structural(format!("missing {}", tag)))
}

impl KeyBundle {
    /// `identity`, optional `key` and `skey` children, as carried by key
    /// query results and retry receipts.
    pub fn key_nodes(&self) -> Vec<Stanza> {
        let mut nodes = vec![Stanza::new("identity").bytes(self.identity.clone())];
        if let Some(pre_key) = &self.pre_key {
            nodes.push(Stanza::new("key").children(vec![
                Stanza::new("id").bytes(encode_big_endian(pre_key.id, 3)),
                Stanza::new("value").bytes(pre_key.public.clone()),
            ]));
        }
        nodes.push(Stanza::new("skey").children(vec![
            Stanza::new("id").bytes(encode_big_endian(self.signed_pre_key.id, 3)),
            Stanza::new("value").bytes(self.signed_pre_key.public.clone()),
            Stanza::new("signature").bytes(self.signed_pre_key.signature.clone()),
        ]));
        nodes
    }

    /// Parses one `user` node of a key query result.
    pub fn from_user_node(node: &Stanza) -> Result<Self, CoreError> {
        let registration_id = decode_big_endian(&bytes_child(node, "registration")?)?;
        let identity = bytes_child(node, "identity")?;
        let skey = node
            .child("skey")
            .ok_or_else(|| CoreError::Structural("missing skey".to_string()))?;
        let signed_pre_key = SignedPreKey {
            id: decode_big_endian(&bytes_child(skey, "id")?)?,
            public: bytes_child(skey, "value")?,
            signature: bytes_child(skey, "signature")?,
        };
        let pre_key = match node.child("key") {
            Some(key) => Some(PreKey {
                id: decode_big_endian(&bytes_child(key, "id")?)?,
                public: bytes_child(key, "value")?,
            }),
            None => None,
        };
        Ok(Self {
            registration_id,
            identity,
            signed_pre_key,
            pre_key,
        })
    }

    pub fn to_user_node(&self, jid: &Jid) -> Stanza {
        let mut children = vec![
            Stanza::new("registration").bytes(encode_big_endian(self.registration_id, 4)),
            Stanza::new("type").bytes(vec![KEY_BUNDLE_TYPE]),
        ];
        children.extend(self.key_nodes());
        Stanza::new("user").attr("jid", jid.to_string()).children(children)
    }
}
