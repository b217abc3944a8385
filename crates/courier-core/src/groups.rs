use crate::error::CoreError;
use async_trait::async_trait;
use courier_types::Jid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    #[default]
    Pn,
    Lid,
}

impl AddressingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressingMode::Pn => "pn",
            AddressingMode::Lid => "lid",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: Jid,
    #[serde(default)]
    pub subject: String,
    pub participants: Vec<Jid>,
    #[serde(default)]
    pub addressing_mode: AddressingMode,
}

#[async_trait]
pub trait GroupRoster: Send + Sync {
    async fn fetch(&self, group: &Jid) -> Result<GroupMetadata, CoreError>;
}

/// Optional cache the embedding application keeps for group metadata.
#[async_trait]
pub trait GroupMetadataCache: Send + Sync {
    async fn get(&self, group: &Jid) -> Option<GroupMetadata>;
}

#[derive(Clone, Default)]
pub struct InMemoryRoster {
    groups: Arc<Mutex<HashMap<Jid, GroupMetadata>>>,
    fetches: Arc<Mutex<usize>>,
}

impl InMemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, metadata: GroupMetadata) {
        self.groups.lock().await.insert(metadata.id.clone(), metadata);
    }

    pub async fn fetch_count(&self) -> usize {
        *self.fetches.lock().await
    }
}

#[async_trait]
impl GroupRoster for InMemoryRoster {
    async fn fetch(&self, group: &Jid) -> Result<GroupMetadata, CoreError> {
        *self.fetches.lock().await += 1;
        self.groups
            .lock()
            .await
            .get(group)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("group {}", group)))
    }
}

#[derive(Clone)]
pub struct GroupDirectory {
    roster: Arc<dyn GroupRoster>,
    cache: Option<Arc<dyn GroupMetadataCache>>,
}

impl GroupDirectory {
    pub fn new(roster: Arc<dyn GroupRoster>, cache: Option<Arc<dyn GroupMetadataCache>>) -> Self {
        Self { roster, cache }
    }

    /// Cached metadata when the application has it, otherwise a roster fetch.
    pub async fn metadata(&self, group: &Jid) -> Result<GroupMetadata, CoreError> {
        if let Some(cache) = &self.cache {
            if let Some(metadata) = cache.get(group).await {
                return Ok(metadata);
            }
        }
        self.roster.fetch(group).await
    }
}
