pub mod directory_tests;
pub mod placeholder_tests;
pub mod relay_tests;

use crate::config::CoreConfig;
use crate::connection::{MockConnection, QueryHandler};
use crate::crypto::{
    Ciphertext, CiphertextKind, CryptoRepository, GroupCiphertext, KeyBundle, PreKey, SignedPreKey,
};
use crate::directory::InMemoryDirectory;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventReceiver};
use crate::groups::InMemoryRoster;
use crate::identity::Credentials;
use crate::keystore::{InMemoryKeyStore, KeyAccess, KeyKind};
use crate::policy::RetryPolicy;
use crate::store::InMemoryMessageStore;
use crate::{Core, CoreDeps};
use async_trait::async_trait;
use courier_types::{DeviceAddress, Jid, MessageContent, Stanza};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn jid(value: &str) -> Jid {
    value.parse().expect("jid")
}

pub fn addr(value: &str) -> DeviceAddress {
    value.parse().expect("device address")
}

pub fn credentials() -> Credentials {
    Credentials {
        me: jid("100:2@user"),
        lid: Some(jid("900:2@lid")),
        registration_id: 7,
        device_identity: b"device-identity".to_vec(),
        app_state_key_id: Some("key-1".to_string()),
        next_pre_key_id: 1,
    }
}

fn fast_policy(retries: u32) -> RetryPolicy {
    RetryPolicy {
        retries,
        base_delay_ms: 1,
        max_delay_ms: 4,
        jitter: false,
        attempt_timeout_ms: 0,
    }
}

pub fn test_config() -> CoreConfig {
    CoreConfig {
        max_msg_retry_count: 2,
        retry_request_delay_ms: 0,
        placeholder_resend_on_first_retry: false,
        placeholder_grace_ms: 200,
        placeholder_timeout_ms: 1_000,
        session_fetch_retry: fast_policy(2),
        send_retry: fast_policy(2),
        ..CoreConfig::default()
    }
}

/// Session-keyed stand-in for the ratchet: a ciphertext is the session id,
/// a `|` and the plaintext, so every device gets distinct bytes.
#[derive(Clone, Default)]
pub struct FakeCrypto {
    fail_decrypt: Arc<AtomicBool>,
    next_pre_key: Arc<AtomicU32>,
    distributions: Arc<Mutex<Vec<(Jid, DeviceAddress)>>>,
}

impl FakeCrypto {
    pub fn new() -> Self {
        Self {
            next_pre_key: Arc::new(AtomicU32::new(31)),
            ..Self::default()
        }
    }

    pub fn fail_decrypt(&self, fail: bool) {
        self.fail_decrypt.store(fail, Ordering::SeqCst);
    }

    pub async fn distributions(&self) -> Vec<(Jid, DeviceAddress)> {
        self.distributions.lock().await.clone()
    }
}

pub fn seal(address: &DeviceAddress, plaintext: &[u8]) -> Vec<u8> {
    let mut out = format!("{}|", address.session_id()).into_bytes();
    out.extend_from_slice(plaintext);
    out
}

pub fn open(ciphertext: &[u8]) -> Vec<u8> {
    match ciphertext.iter().position(|b| *b == b'|') {
        Some(pos) => ciphertext[pos + 1..].to_vec(),
        None => ciphertext.to_vec(),
    }
}

pub fn bundle(seed: u32) -> KeyBundle {
    KeyBundle {
        registration_id: 1000 + seed,
        identity: vec![5; 33],
        signed_pre_key: SignedPreKey {
            id: 1,
            public: vec![6; 33],
            signature: vec![7; 64],
        },
        pre_key: Some(PreKey {
            id: seed,
            public: vec![8; 33],
        }),
    }
}

#[async_trait]
impl CryptoRepository for FakeCrypto {
    async fn encrypt_message(
        &self,
        keys: &dyn KeyAccess,
        address: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<Ciphertext, CoreError> {
        let id = self.address_for(address);
        let kind = match keys.get_one(KeyKind::Session, &id).await? {
            Some(state) if state == b"fresh" => CiphertextKind::PkMsg,
            Some(_) => CiphertextKind::Msg,
            None => return Err(CoreError::Crypto(format!("no session for {}", address))),
        };
        keys.set_one(KeyKind::Session, &id, Some(b"open".to_vec()))
            .await?;
        Ok(Ciphertext {
            kind,
            bytes: seal(address, plaintext),
        })
    }

    async fn encrypt_group_message(
        &self,
        _keys: &dyn KeyAccess,
        group: &Jid,
        _me: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<GroupCiphertext, CoreError> {
        Ok(GroupCiphertext {
            ciphertext: [b"sk|".as_slice(), plaintext].concat(),
            distribution: format!("dist:{}", group).into_bytes(),
        })
    }

    async fn decrypt_message(
        &self,
        _keys: &dyn KeyAccess,
        address: &DeviceAddress,
        _kind: CiphertextKind,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CoreError> {
        if self.fail_decrypt.load(Ordering::SeqCst) {
            return Err(CoreError::Crypto(format!("bad mac from {}", address)));
        }
        Ok(open(ciphertext))
    }

    async fn decrypt_group_message(
        &self,
        _keys: &dyn KeyAccess,
        group: &Jid,
        _author: &DeviceAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CoreError> {
        if self.fail_decrypt.load(Ordering::SeqCst) {
            return Err(CoreError::Crypto(format!("no sender key for {}", group)));
        }
        Ok(open(ciphertext))
    }

    async fn process_sender_key_distribution(
        &self,
        _keys: &dyn KeyAccess,
        group: &Jid,
        author: &DeviceAddress,
        _distribution: &[u8],
    ) -> Result<(), CoreError> {
        self.distributions
            .lock()
            .await
            .push((group.clone(), author.clone()));
        Ok(())
    }

    async fn inject_session(
        &self,
        keys: &dyn KeyAccess,
        address: &DeviceAddress,
        _bundle: &KeyBundle,
    ) -> Result<(), CoreError> {
        keys.set_one(
            KeyKind::Session,
            &self.address_for(address),
            Some(b"fresh".to_vec()),
        )
        .await
    }

    async fn next_key_bundle(&self, keys: &dyn KeyAccess) -> Result<KeyBundle, CoreError> {
        let id = self.next_pre_key.fetch_add(1, Ordering::SeqCst);
        keys.set_one(KeyKind::PreKey, &id.to_string(), None).await?;
        Ok(bundle(id))
    }
}

pub fn is_key_query(request: &Stanza) -> bool {
    request.get_attr("xmlns") == Some("encrypt")
}

pub fn is_sync_query(request: &Stanza) -> bool {
    request.get_attr("xmlns") == Some(crate::app_state::SYNC_NAMESPACE)
}

/// A bundle for every `user` of a key query.
pub fn key_response(request: &Stanza) -> Stanza {
    let users = request
        .child("key")
        .map(|key| {
            key.children_named("user")
                .enumerate()
                .filter_map(|(i, user)| {
                    let jid: Jid = user.get_attr("jid")?.parse().ok()?;
                    Some(bundle(i as u32 + 1).to_user_node(&jid))
                })
                .collect()
        })
        .unwrap_or_default();
    Stanza::new("iq")
        .attr("type", "result")
        .children(vec![Stanza::new("list").children(users)])
}

pub type Script = Arc<StdMutex<VecDeque<Result<Stanza, CoreError>>>>;

/// Answers key queries with fresh bundles and app-state queries from
/// `script`, falling back to an empty result once it runs dry.
pub fn handler(script: Script) -> QueryHandler {
    Arc::new(move |request: &Stanza| {
        if is_key_query(request) {
            return Ok(key_response(request));
        }
        if is_sync_query(request) {
            let next = script.lock().expect("script").pop_front();
            if let Some(next) = next {
                return next;
            }
        }
        Ok(Stanza::new("iq").attr("type", "result"))
    })
}

pub struct Harness {
    pub core: Core,
    pub conn: MockConnection,
    pub crypto: FakeCrypto,
    pub directory: InMemoryDirectory,
    pub roster: InMemoryRoster,
    pub keys: InMemoryKeyStore,
    pub messages: InMemoryMessageStore,
    pub script: Script,
}

impl Harness {
    pub async fn new(config: CoreConfig) -> Self {
        let harness = Self::unauthenticated(config).await;
        harness.core.set_credentials(credentials()).await;
        harness
    }

    pub async fn unauthenticated(config: CoreConfig) -> Self {
        init_logging();
        let conn = MockConnection::new();
        let script: Script = Arc::new(StdMutex::new(VecDeque::new()));
        conn.set_handler(handler(script.clone())).await;
        let crypto = FakeCrypto::new();
        let directory = InMemoryDirectory::new();
        let roster = InMemoryRoster::new();
        let keys = InMemoryKeyStore::new();
        let messages = InMemoryMessageStore::new();
        let core = Core::new(
            config,
            CoreDeps {
                connection: Arc::new(conn.clone()),
                crypto: Arc::new(crypto.clone()),
                directory: Arc::new(directory.clone()),
                roster: Arc::new(roster.clone()),
                group_cache: None,
                key_backend: Arc::new(keys.clone()),
                messages: Arc::new(messages.clone()),
            },
        );
        Self {
            core,
            conn,
            crypto,
            directory,
            roster,
            keys,
            messages,
            script,
        }
    }

    pub fn push_sync_response(&self, response: Result<Stanza, CoreError>) {
        self.script.lock().expect("script").push_back(response);
    }

    pub async fn key_queries(&self) -> Vec<Stanza> {
        self.conn
            .queries()
            .await
            .into_iter()
            .filter(is_key_query)
            .collect()
    }

    pub async fn sync_queries(&self) -> Vec<Stanza> {
        self.conn
            .queries()
            .await
            .into_iter()
            .filter(is_sync_query)
            .collect()
    }

    /// Outgoing `message` stanzas.
    pub async fn messages_sent(&self) -> Vec<Stanza> {
        self.conn.sent_with_tag("message").await
    }
}

pub fn drain_events(rx: &mut EventReceiver) -> Vec<CoreEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Polls `check` until it holds, giving spawned tasks time to run.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// An inbound `message` carrying one pairwise ciphertext of `content`.
pub fn inbound_message(id: &str, from: &str, content: &MessageContent) -> Stanza {
    let sender = addr(from);
    let plaintext = content.encode().expect("encode");
    Stanza::new("message")
        .attr("id", id)
        .attr("from", from)
        .attr("type", "text")
        .attr("t", "1700000000")
        .children(vec![Stanza::new("enc")
            .attr("v", "2")
            .attr("type", "msg")
            .bytes(seal(&sender, &plaintext))])
}

/// Pairwise `to` nodes of the `participants` child of a sent message.
pub fn participant_nodes(message: &Stanza) -> Vec<Stanza> {
    message
        .child("participants")
        .map(|p| p.children_named("to").cloned().collect())
        .unwrap_or_default()
}

/// Decrypts the `enc` of one `to` node.
pub fn to_content(to: &Stanza) -> MessageContent {
    let enc = to.child("enc").expect("enc");
    MessageContent::decode(&open(enc.content_bytes().expect("bytes"))).expect("content")
}
