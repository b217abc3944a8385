use crate::error::CoreError;
use courier_types::{DeviceAddress, Jid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Our own device address in the primary namespace.
    pub me: Jid,
    #[serde(default)]
    pub lid: Option<Jid>,
    pub registration_id: u32,
    #[serde(default)]
    pub device_identity: Vec<u8>,
    #[serde(default)]
    pub app_state_key_id: Option<String>,
    #[serde(default)]
    pub next_pre_key_id: u32,
}

impl Credentials {
    pub fn me_address(&self) -> Result<DeviceAddress, CoreError> {
        self.me
            .device_address()
            .ok_or_else(|| CoreError::Validation(format!("own address {}", self.me)))
    }

    /// Both namespaces of our own device, excluded from every fanout.
    pub fn own_addresses(&self) -> Vec<DeviceAddress> {
        let mut out = Vec::new();
        if let Some(addr) = self.me.device_address() {
            out.push(addr);
        }
        if let Some(addr) = self.lid.as_ref().and_then(|lid| lid.device_address()) {
            out.push(addr);
        }
        out
    }

    pub fn is_me(&self, jid: &Jid) -> bool {
        self.me.same_user(jid) || self.lid.as_ref().is_some_and(|lid| lid.same_user(jid))
    }

    /// Own account in the same namespace as `other`.
    pub fn me_for(&self, other: &Jid) -> Jid {
        match (&self.lid, other.is_lid()) {
            (Some(lid), true) => lid.clone(),
            _ => self.me.clone(),
        }
    }
}

#[derive(Clone, Default)]
pub struct AuthState {
    inner: Arc<RwLock<Option<Credentials>>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Result<Credentials, CoreError> {
        self.inner
            .read()
            .await
            .clone()
            .ok_or(CoreError::NotAuthenticated)
    }

    pub async fn set(&self, creds: Credentials) {
        *self.inner.write().await = Some(creds);
    }

    pub async fn update<F>(&self, f: F) -> Result<Credentials, CoreError>
    where
        F: FnOnce(&mut Credentials),
    {
        let mut guard = self.inner.write().await;
        let creds = guard.as_mut().ok_or(CoreError::NotAuthenticated)?;
        f(creds);
        Ok(creds.clone())
    }
}
