use crate::crypto::{CiphertextKind, CryptoRepository};
use crate::directory::DeviceDirectory;
use crate::error::CoreError;
use crate::groups::{AddressingMode, GroupDirectory};
use crate::identity::Credentials;
use crate::keystore::KeyAccess;
use crate::relay::RelayOptions;
use crate::sender_keys::SenderKeyMemory;
use crate::sessions::SessionManager;
use async_trait::async_trait;
use courier_types::{AccountId, DeviceAddress, Jid, MessageContent, MessageId, Stanza};
use log::debug;
use std::collections::{BTreeMap, HashSet};

/// Destination class of an outgoing message; each class has its own
/// encryption strategy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Direct(Jid),
    Group(Jid),
    Broadcast(Jid),
    Channel(Jid),
}

static DIRECT: DirectFanout = DirectFanout;
static GROUP: GroupFanout = GroupFanout;
static CHANNEL: ChannelFanout = ChannelFanout;

impl Destination {
    pub fn classify(jid: &Jid) -> Result<Self, CoreError> {
        let jid = jid.clone();
        if jid.is_account() {
            Ok(Destination::Direct(jid))
        } else if jid.is_group() {
            Ok(Destination::Group(jid))
        } else if jid.is_broadcast() {
            Ok(Destination::Broadcast(jid))
        } else if jid.is_channel() {
            Ok(Destination::Channel(jid))
        } else {
            Err(CoreError::Validation(format!("cannot send to {}", jid)))
        }
    }

    pub fn jid(&self) -> &Jid {
        match self {
            Destination::Direct(jid)
            | Destination::Group(jid)
            | Destination::Broadcast(jid)
            | Destination::Channel(jid) => jid,
        }
    }

    pub fn is_group_like(&self) -> bool {
        matches!(self, Destination::Group(_) | Destination::Broadcast(_))
    }

    pub fn strategy(&self) -> &'static dyn FanoutStrategy {
        match self {
            Destination::Direct(_) => &DIRECT,
            Destination::Group(_) | Destination::Broadcast(_) => &GROUP,
            Destination::Channel(_) => &CHANNEL,
        }
    }
}

/// Collaborators a strategy needs, borrowed for one send. `keys` is the
/// send's transaction.
pub struct FanoutEnv<'a> {
    pub keys: &'a dyn KeyAccess,
    pub creds: &'a Credentials,
    pub directory: &'a DeviceDirectory,
    pub sessions: &'a SessionManager,
    pub crypto: &'a dyn CryptoRepository,
    pub groups: &'a GroupDirectory,
}

pub struct FanoutRequest<'a> {
    pub destination: &'a Destination,
    pub content: &'a MessageContent,
    pub options: &'a RelayOptions,
    /// Restricts the fanout to a single device.
    pub participant: Option<&'a DeviceAddress>,
}

#[derive(Clone, Debug, Default)]
pub struct FanoutPlan {
    pub attrs: BTreeMap<String, String>,
    pub children: Vec<Stanza>,
    pub has_pre_key: bool,
    /// Every device that received a per-device ciphertext.
    pub devices: Vec<DeviceAddress>,
}

#[async_trait]
pub trait FanoutStrategy: Send + Sync {
    /// Id the stanza must carry regardless of the caller's choice.
    fn message_id_for(&self, _content: &MessageContent) -> Option<MessageId> {
        None
    }

    async fn build(
        &self,
        env: &FanoutEnv<'_>,
        request: &FanoutRequest<'_>,
    ) -> Result<FanoutPlan, CoreError>;
}

fn enc_node(kind: CiphertextKind, bytes: Vec<u8>, media_type: Option<&str>) -> Stanza {
    let mut node = Stanza::new("enc")
        .attr("v", "2")
        .attr("type", kind.as_str())
        .bytes(bytes);
    if let Some(media_type) = media_type {
        node.set_attr("mediatype", media_type);
    }
    node
}

struct Encrypted {
    to_nodes: Vec<Stanza>,
    has_pre_key: bool,
}

async fn encrypt_for_devices(
    env: &FanoutEnv<'_>,
    targets: &[(DeviceAddress, &[u8])],
    media_type: Option<&str>,
) -> Result<Encrypted, CoreError> {
    let mut out = Encrypted {
        to_nodes: Vec::with_capacity(targets.len()),
        has_pre_key: false,
    };
    for (addr, bytes) in targets {
        let ciphertext = env.crypto.encrypt_message(env.keys, addr, bytes).await?;
        out.has_pre_key |= ciphertext.kind == CiphertextKind::PkMsg;
        out.to_nodes.push(
            Stanza::new("to")
                .attr("jid", addr.to_jid().to_string())
                .children(vec![enc_node(ciphertext.kind, ciphertext.bytes, media_type)]),
        );
    }
    Ok(out)
}

fn dedupe(devices: Vec<DeviceAddress>) -> Vec<DeviceAddress> {
    let mut seen = HashSet::new();
    devices.into_iter().filter(|d| seen.insert(d.clone())).collect()
}

fn account_of(jid: &Jid) -> Result<AccountId, CoreError> {
    jid.account()
        .ok_or_else(|| CoreError::Validation(format!("{} is not an account", jid)))
}

pub struct DirectFanout;

#[async_trait]
impl FanoutStrategy for DirectFanout {
    async fn build(
        &self,
        env: &FanoutEnv<'_>,
        request: &FanoutRequest<'_>,
    ) -> Result<FanoutPlan, CoreError> {
        let recipient = request.destination.jid();
        let peer = request.options.is_peer();
        let own = env.creds.own_addresses();
        let media_type = request.content.media_type();

        let devices = match request.participant {
            Some(participant) => vec![participant.clone()],
            None => {
                let recipient_account = account_of(recipient)?;
                let mut devices = vec![recipient_account.device(0)];
                if !peer {
                    let me_account = account_of(&env.creds.me_for(recipient))?;
                    if me_account != recipient_account {
                        devices.push(me_account.device(0));
                    }
                    let companions = env
                        .directory
                        .get_devices(
                            &[recipient_account, me_account],
                            request.options.use_user_devices_cache,
                            true,
                            &own,
                        )
                        .await?;
                    devices.extend(companions);
                }
                devices.retain(|d| !own.contains(d));
                dedupe(devices)
            }
        };
        if devices.is_empty() {
            return Err(CoreError::Validation(format!("no devices for {}", recipient)));
        }

        env.sessions
            .assert_sessions_in(env.keys, &devices, false)
            .await?;

        let encoded = request.content.encode()?;
        let own_copy = if peer || env.creds.is_me(recipient) {
            encoded.clone()
        } else {
            MessageContent::DeviceSent {
                destination: recipient.to_non_device(),
                message: Box::new(request.content.clone()),
            }
            .encode()?
        };
        let targets: Vec<(DeviceAddress, &[u8])> = devices
            .iter()
            .map(|d| {
                let bytes = if env.creds.is_me(&d.to_jid()) {
                    own_copy.as_slice()
                } else {
                    encoded.as_slice()
                };
                (d.clone(), bytes)
            })
            .collect();
        let encrypted = encrypt_for_devices(env, &targets, media_type).await?;
        debug!(
            "encrypted {} for {} devices",
            recipient,
            encrypted.to_nodes.len()
        );

        let mut plan = FanoutPlan {
            has_pre_key: encrypted.has_pre_key,
            devices,
            ..FanoutPlan::default()
        };
        if peer && encrypted.to_nodes.len() == 1 {
            let enc = encrypted
                .to_nodes
                .into_iter()
                .flat_map(|to| to.all_children().to_vec())
                .collect::<Vec<_>>();
            plan.children.extend(enc);
        } else {
            plan.children
                .push(Stanza::new("participants").children(encrypted.to_nodes));
        }
        if request.participant.is_some() {
            plan.attrs
                .insert("device_fanout".to_string(), "false".to_string());
        }
        Ok(plan)
    }
}

/// Groups and broadcast lists: one sender-key ciphertext for everybody, plus
/// a key distribution for devices that do not hold the key yet.
pub struct GroupFanout;

#[async_trait]
impl FanoutStrategy for GroupFanout {
    async fn build(
        &self,
        env: &FanoutEnv<'_>,
        request: &FanoutRequest<'_>,
    ) -> Result<FanoutPlan, CoreError> {
        let group = request.destination.jid();
        let own = env.creds.own_addresses();
        let media_type = request.content.media_type();

        let (accounts, mode) = match request.destination {
            Destination::Group(_) => {
                let metadata = env.groups.metadata(group).await?;
                let accounts = metadata
                    .participants
                    .iter()
                    .filter_map(|p| p.account())
                    .collect::<Vec<_>>();
                (accounts, Some(metadata.addressing_mode))
            }
            _ => {
                let accounts = request
                    .options
                    .status_recipients
                    .iter()
                    .filter_map(|p| p.account())
                    .collect::<Vec<_>>();
                (accounts, None)
            }
        };

        let devices = match request.participant {
            Some(participant) => vec![participant.clone()],
            None => {
                env.directory
                    .get_devices(
                        &accounts,
                        request.options.use_user_devices_cache,
                        false,
                        &own,
                    )
                    .await?
            }
        };

        let me = match (mode, &env.creds.lid) {
            (Some(AddressingMode::Lid), Some(lid)) => lid
                .device_address()
                .ok_or_else(|| CoreError::Validation(format!("own address {}", lid)))?,
            _ => env.creds.me_address()?,
        };
        let encoded = request.content.encode()?;
        let group_ct = env
            .crypto
            .encrypt_group_message(env.keys, group, &me, &encoded)
            .await?;

        let mut memory = SenderKeyMemory::load(env.keys, group).await?;
        let targets: Vec<DeviceAddress> = if request.participant.is_some() {
            devices.clone()
        } else {
            devices
                .iter()
                .filter(|d| !memory.holds(d))
                .cloned()
                .collect()
        };

        let mut plan = FanoutPlan::default();
        if !targets.is_empty() {
            debug!(
                "distributing sender key of {} to {} devices",
                group,
                targets.len()
            );
            let distribution = MessageContent::SenderKeyDistribution {
                group: group.clone(),
                distribution: group_ct.distribution.clone(),
            }
            .encode()?;
            env.sessions
                .assert_sessions_in(env.keys, &targets, false)
                .await?;
            let pairs: Vec<(DeviceAddress, &[u8])> = targets
                .iter()
                .map(|t| (t.clone(), distribution.as_slice()))
                .collect();
            let encrypted = encrypt_for_devices(env, &pairs, None).await?;
            plan.has_pre_key = encrypted.has_pre_key;
            plan.children
                .push(Stanza::new("participants").children(encrypted.to_nodes));
            for target in &targets {
                memory.mark(target);
            }
            memory.store(env.keys, group).await?;
        }
        plan.children.push(enc_node(
            CiphertextKind::SkMsg,
            group_ct.ciphertext,
            media_type,
        ));
        if let Some(mode) = mode {
            plan.attrs
                .insert("addressing_mode".to_string(), mode.as_str().to_string());
        }
        plan.devices = targets;
        Ok(plan)
    }
}

/// Channels carry a single plaintext payload with no per-device sessions.
pub struct ChannelFanout;

#[async_trait]
impl FanoutStrategy for ChannelFanout {
    fn message_id_for(&self, content: &MessageContent) -> Option<MessageId> {
        match content {
            MessageContent::Edit { key, .. } | MessageContent::Revoke { key } => {
                Some(key.id.clone())
            }
            _ => None,
        }
    }

    async fn build(
        &self,
        _env: &FanoutEnv<'_>,
        request: &FanoutRequest<'_>,
    ) -> Result<FanoutPlan, CoreError> {
        let payload = match request.content {
            MessageContent::Edit { content, .. } => content.as_ref().clone(),
            MessageContent::Revoke { .. } => MessageContent::Empty,
            other => other.clone(),
        };
        let mut node = Stanza::new("plaintext").bytes(payload.encode()?);
        if let Some(media_type) = payload.media_type() {
            node.set_attr("mediatype", media_type);
        }
        Ok(FanoutPlan {
            children: vec![node],
            ..FanoutPlan::default()
        })
    }
}
