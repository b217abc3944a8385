use crate::error::CoreError;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyKind {
    Session,
    PreKey,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateVersion,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Session => "session",
            KeyKind::PreKey => "pre-key",
            KeyKind::SenderKey => "sender-key",
            KeyKind::SenderKeyMemory => "sender-key-memory",
            KeyKind::AppStateSyncKey => "app-state-sync-key",
            KeyKind::AppStateVersion => "app-state-sync-version",
        }
    }
}

/// Typed key/value access to the persistent signal store. `None` in a write
/// deletes the entry.
#[async_trait]
pub trait KeyAccess: Send + Sync {
    async fn get(&self, kind: KeyKind, ids: &[String])
        -> Result<HashMap<String, Vec<u8>>, CoreError>;
    async fn set(
        &self,
        kind: KeyKind,
        entries: Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<(), CoreError>;

    async fn get_one(&self, kind: KeyKind, id: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let mut found = self.get(kind, &[id.to_string()]).await?;
        Ok(found.remove(id))
    }

    async fn set_one(&self, kind: KeyKind, id: &str, value: Option<Vec<u8>>) -> Result<(), CoreError> {
        self.set(kind, vec![(id.to_string(), value)]).await
    }
}

#[derive(Clone, Default)]
pub struct InMemoryKeyStore {
    entries: Arc<Mutex<HashMap<(KeyKind, String), Vec<u8>>>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, kind: KeyKind) -> usize {
        let guard = self.entries.lock().await;
        guard.keys().filter(|(k, _)| *k == kind).count()
    }
}

#[async_trait]
impl KeyAccess for InMemoryKeyStore {
    async fn get(
        &self,
        kind: KeyKind,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, CoreError> {
        let guard = self.entries.lock().await;
        let mut out = HashMap::new();
        for id in ids {
            if let Some(value) = guard.get(&(kind, id.clone())) {
                out.insert(id.clone(), value.clone());
            }
        }
        Ok(out)
    }

    async fn set(
        &self,
        kind: KeyKind,
        entries: Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<(), CoreError> {
        let mut guard = self.entries.lock().await;
        for (id, value) in entries {
            match value {
                Some(value) => {
                    guard.insert((kind, id), value);
                }
                None => {
                    guard.remove(&(kind, id));
                }
            }
        }
        Ok(())
    }
}

/// Shared handle to the backing store plus the lock that serializes
/// transactions. Reads outside a transaction go straight to the backend.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn KeyAccess>,
    tx_lock: Arc<Mutex<()>>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn KeyAccess>) -> Self {
        Self {
            backend,
            tx_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Waits for any running transaction, then opens a new one. Writes are
    /// staged until `commit`; dropping the transaction discards them.
    pub async fn begin(&self) -> Transaction {
        let guard = self.tx_lock.clone().lock_owned().await;
        Transaction {
            backend: self.backend.clone(),
            staged: Mutex::new(HashMap::new()),
            _guard: guard,
        }
    }
}

#[async_trait]
impl KeyAccess for KeyStore {
    async fn get(
        &self,
        kind: KeyKind,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, CoreError> {
        self.backend.get(kind, ids).await
    }

    async fn set(
        &self,
        kind: KeyKind,
        entries: Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<(), CoreError> {
        self.backend.set(kind, entries).await
    }
}

pub struct Transaction {
    backend: Arc<dyn KeyAccess>,
    staged: Mutex<HashMap<KeyKind, HashMap<String, Option<Vec<u8>>>>>,
    _guard: OwnedMutexGuard<()>,
}

impl Transaction {
    pub async fn commit(self) -> Result<(), CoreError> {
        let staged = std::mem::take(&mut *self.staged.lock().await);
        let mut writes = 0usize;
        for (kind, entries) in staged {
            writes += entries.len();
            self.backend.set(kind, entries.into_iter().collect()).await?;
        }
        if writes > 0 {
            debug!("committed {} key writes", writes);
        }
        Ok(())
    }
}

#[async_trait]
impl KeyAccess for Transaction {
    async fn get(
        &self,
        kind: KeyKind,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, CoreError> {
        let mut out = HashMap::new();
        let mut misses = Vec::new();
        {
            let staged = self.staged.lock().await;
            let by_kind = staged.get(&kind);
            for id in ids {
                match by_kind.and_then(|entries| entries.get(id)) {
                    Some(Some(value)) => {
                        out.insert(id.clone(), value.clone());
                    }
                    Some(None) => {}
                    None => misses.push(id.clone()),
                }
            }
        }
        if !misses.is_empty() {
            out.extend(self.backend.get(kind, &misses).await?);
        }
        Ok(out)
    }

    async fn set(
        &self,
        kind: KeyKind,
        entries: Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<(), CoreError> {
        let mut staged = self.staged.lock().await;
        let by_kind = staged.entry(kind).or_default();
        for (id, value) in entries {
            by_kind.insert(id, value);
        }
        Ok(())
    }
}
