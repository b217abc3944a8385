use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::error::{Result, TypesError};

pub const STATUS_BROADCAST: &str = "status@broadcast";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    User,
    Lid,
    Group,
    Broadcast,
    Channel,
    Server,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::User => "user",
            Domain::Lid => "lid",
            Domain::Group => "group",
            Domain::Broadcast => "broadcast",
            Domain::Channel => "channel",
            Domain::Server => "server",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Domain::User),
            "lid" => Some(Domain::Lid),
            "group" => Some(Domain::Group),
            "broadcast" => Some(Domain::Broadcast),
            "channel" => Some(Domain::Channel),
            "server" => Some(Domain::Server),
            _ => None,
        }
    }
}

/// Protocol address: `user[_agent][:device]@domain`. Device 0 is the
/// account's primary device and is omitted from the rendered form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    pub user: String,
    pub agent: Option<u8>,
    pub device: u16,
    pub domain: Domain,
}

impl Jid {
    pub fn new(user: impl Into<String>, domain: Domain) -> Self {
        Self {
            user: user.into(),
            agent: None,
            device: 0,
            domain,
        }
    }

    pub fn server() -> Self {
        Self::new("", Domain::Server)
    }

    pub fn status_broadcast() -> Self {
        Self::new("status", Domain::Broadcast)
    }

    pub fn with_device(mut self, device: u16) -> Self {
        self.device = device;
        self
    }

    pub fn is_account(&self) -> bool {
        matches!(self.domain, Domain::User | Domain::Lid)
    }

    pub fn is_lid(&self) -> bool {
        self.domain == Domain::Lid
    }

    pub fn is_group(&self) -> bool {
        self.domain == Domain::Group
    }

    pub fn is_channel(&self) -> bool {
        self.domain == Domain::Channel
    }

    pub fn is_broadcast(&self) -> bool {
        self.domain == Domain::Broadcast
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.domain == Domain::Broadcast && self.user == "status"
    }

    /// Drops agent and device, keeping the account-level address.
    pub fn to_non_device(&self) -> Jid {
        Jid::new(self.user.clone(), self.domain)
    }

    pub fn same_user(&self, other: &Jid) -> bool {
        self.user == other.user
    }

    pub fn account(&self) -> Option<AccountId> {
        let namespace = match self.domain {
            Domain::User => Namespace::Primary,
            Domain::Lid => Namespace::Alternate,
            _ => return None,
        };
        Some(AccountId {
            user: self.user.clone(),
            namespace,
        })
    }

    pub fn device_address(&self) -> Option<DeviceAddress> {
        self.account().map(|account| DeviceAddress {
            account,
            device: self.device,
        })
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user)?;
        if let Some(agent) = self.agent {
            if agent != 0 {
                write!(f, "_{}", agent)?;
            }
        }
        if self.device != 0 {
            write!(f, ":{}", self.device)?;
        }
        write!(f, "@{}", self.domain.as_str())
    }
}

impl FromStr for Jid {
    type Err = TypesError;

    fn from_str(value: &str) -> Result<Self> {
        let Some((combined, domain)) = value.split_once('@') else {
            return Err(TypesError::InvalidAddress(value.to_string()));
        };
        let domain =
            Domain::parse(domain).ok_or_else(|| TypesError::InvalidAddress(value.to_string()))?;
        let (user_agent, device) = match combined.split_once(':') {
            Some((user_agent, device)) => {
                let device = device
                    .parse::<u16>()
                    .map_err(|_| TypesError::InvalidAddress(value.to_string()))?;
                (user_agent, device)
            }
            None => (combined, 0),
        };
        let (user, agent) = match user_agent.split_once('_') {
            Some((user, agent)) => {
                let agent = agent
                    .parse::<u8>()
                    .map_err(|_| TypesError::InvalidAddress(value.to_string()))?;
                (user, Some(agent))
            }
            None => (user_agent, None),
        };
        Ok(Jid {
            user: user.to_string(),
            agent,
            device,
            domain,
        })
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The two identifier namespaces an account can be addressed through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Primary,
    Alternate,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId {
    pub user: String,
    pub namespace: Namespace,
}

impl AccountId {
    pub fn primary(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            namespace: Namespace::Primary,
        }
    }

    pub fn alternate(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            namespace: Namespace::Alternate,
        }
    }

    pub fn to_jid(&self) -> Jid {
        let domain = match self.namespace {
            Namespace::Primary => Domain::User,
            Namespace::Alternate => Domain::Lid,
        };
        Jid::new(self.user.clone(), domain)
    }

    pub fn device(&self, device: u16) -> DeviceAddress {
        DeviceAddress {
            account: self.clone(),
            device,
        }
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_jid())
    }
}

/// One encryption endpoint: an account plus a device index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    pub account: AccountId,
    pub device: u16,
}

impl DeviceAddress {
    pub fn to_jid(&self) -> Jid {
        self.account.to_jid().with_device(self.device)
    }

    /// Key under which the session for this endpoint is stored.
    pub fn session_id(&self) -> String {
        match self.account.namespace {
            Namespace::Primary => format!("{}.{}", self.account.user, self.device),
            Namespace::Alternate => format!("{}_1.{}", self.account.user, self.device),
        }
    }
}

impl Display for DeviceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_jid())
    }
}

impl FromStr for DeviceAddress {
    type Err = TypesError;

    fn from_str(value: &str) -> Result<Self> {
        let jid: Jid = value.parse()?;
        jid.device_address()
            .ok_or_else(|| TypesError::InvalidAddress(value.to_string()))
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
