use crate::error::CoreError;
use crate::keystore::{KeyAccess, KeyKind};
use courier_types::{DeviceAddress, Jid};
use std::collections::BTreeMap;

/// Devices known to hold our sender key for one group, keyed by device jid.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SenderKeyMemory {
    devices: BTreeMap<String, bool>,
}

impl SenderKeyMemory {
    pub async fn load(keys: &dyn KeyAccess, group: &Jid) -> Result<Self, CoreError> {
        let Some(bytes) = keys.get_one(KeyKind::SenderKeyMemory, &group.to_string()).await? else {
            return Ok(Self::default());
        };
        let devices = serde_json::from_slice(&bytes)
            .map_err(|err| CoreError::Storage(format!("sender key memory: {}", err)))?;
        Ok(Self { devices })
    }

    pub async fn store(&self, keys: &dyn KeyAccess, group: &Jid) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(&self.devices)
            .map_err(|err| CoreError::Storage(format!("sender key memory: {}", err)))?;
        keys.set_one(KeyKind::SenderKeyMemory, &group.to_string(), Some(bytes))
            .await
    }

    /// Forgets every device so the next send redistributes the key.
    pub async fn clear(keys: &dyn KeyAccess, group: &Jid) -> Result<(), CoreError> {
        keys.set_one(KeyKind::SenderKeyMemory, &group.to_string(), None)
            .await
    }

    pub fn holds(&self, addr: &DeviceAddress) -> bool {
        self.devices
            .get(&addr.to_string())
            .copied()
            .unwrap_or(false)
    }

    pub fn mark(&mut self, addr: &DeviceAddress) {
        self.devices.insert(addr.to_string(), true);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
