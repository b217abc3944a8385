use crate::cache::{SingleFlight, TtlCache};
use crate::error::CoreError;
use async_trait::async_trait;
use courier_types::{AccountId, DeviceAddress};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const MAX_ACCOUNTS: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: u16,
    /// Present once the device has been signed into the account's key index.
    pub key_index: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub account: AccountId,
    pub devices: Vec<DeviceRecord>,
    /// The same account in the other namespace, when the server reports it.
    pub alternate: Option<AccountId>,
}

/// Batched device lookup over a set of accounts.
#[async_trait]
pub trait DirectoryQuery: Send + Sync {
    async fn query_devices(&self, accounts: &[AccountId])
        -> Result<Vec<DirectoryEntry>, CoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    entries: Arc<Mutex<HashMap<AccountId, DirectoryEntry>>>,
    queries: Arc<Mutex<Vec<Vec<AccountId>>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, account: AccountId, devices: &[u16]) {
        let records = devices
            .iter()
            .map(|id| DeviceRecord {
                id: *id,
                key_index: if *id == 0 { None } else { Some(u32::from(*id)) },
            })
            .collect();
        self.entries.lock().await.insert(
            account.clone(),
            DirectoryEntry {
                account,
                devices: records,
                alternate: None,
            },
        );
    }

    pub async fn put(&self, entry: DirectoryEntry) {
        self.entries.lock().await.insert(entry.account.clone(), entry);
    }

    /// Every batch this directory has been asked for, in order.
    pub async fn queries(&self) -> Vec<Vec<AccountId>> {
        self.queries.lock().await.clone()
    }
}

#[async_trait]
impl DirectoryQuery for InMemoryDirectory {
    async fn query_devices(
        &self,
        accounts: &[AccountId],
    ) -> Result<Vec<DirectoryEntry>, CoreError> {
        self.queries.lock().await.push(accounts.to_vec());
        let guard = self.entries.lock().await;
        Ok(accounts
            .iter()
            .filter_map(|account| guard.get(account).cloned())
            .collect())
    }
}

/// Device lists per account, cached with a TTL and fetched through a
/// single-flight map so concurrent callers share one query per account.
#[derive(Clone)]
pub struct DeviceDirectory {
    query: Arc<dyn DirectoryQuery>,
    cache: Arc<Mutex<TtlCache<AccountId, Vec<DeviceRecord>>>>,
    inflight: SingleFlight<AccountId, Vec<DeviceRecord>>,
    /// Alternate-namespace account to its primary one, learnt from results.
    alternates: Arc<Mutex<TtlCache<AccountId, AccountId>>>,
}

impl DeviceDirectory {
    pub fn new(query: Arc<dyn DirectoryQuery>, ttl: Duration) -> Self {
        Self {
            query,
            cache: Arc::new(Mutex::new(TtlCache::new(ttl, MAX_ACCOUNTS))),
            inflight: SingleFlight::new(),
            alternates: Arc::new(Mutex::new(TtlCache::new(ttl, MAX_ACCOUNTS))),
        }
    }

    /// Resolves accounts to device addresses. `own` lists our own device in
    /// every namespace; it is never returned.
    pub async fn get_devices(
        &self,
        accounts: &[AccountId],
        use_cache: bool,
        ignore_zero_devices: bool,
        own: &[DeviceAddress],
    ) -> Result<Vec<DeviceAddress>, CoreError> {
        let mut seen = HashSet::new();
        let unique: Vec<AccountId> = accounts
            .iter()
            .filter(|a| seen.insert((*a).clone()))
            .cloned()
            .collect();

        let mut resolved: HashMap<AccountId, Vec<DeviceRecord>> = HashMap::new();
        let mut misses = Vec::new();
        if use_cache {
            let mut cache = self.cache.lock().await;
            for account in &unique {
                match cache.get(account) {
                    Some(devices) => {
                        resolved.insert(account.clone(), devices);
                    }
                    None => misses.push(account.clone()),
                }
            }
        } else {
            misses = unique.clone();
        }

        if !misses.is_empty() {
            let claims = self.inflight.claim(misses);
            if !claims.leading.is_empty() {
                let batch: Vec<AccountId> = claims.leading.iter().map(|g| g.key().clone()).collect();
                debug!("querying devices for {} accounts", batch.len());
                match self.query.query_devices(&batch).await {
                    Ok(entries) => {
                        let fetched = self.store_entries(entries).await;
                        for guard in claims.leading {
                            let devices = fetched.get(guard.key()).cloned().unwrap_or_default();
                            resolved.insert(guard.key().clone(), devices.clone());
                            guard.complete(Ok(devices));
                        }
                    }
                    Err(err) => {
                        warn!("device query failed: {}", err);
                        for guard in claims.leading {
                            guard.complete(Err(err.clone()));
                        }
                        return Err(err);
                    }
                }
            }
            for (account, waiter) in claims.waiting {
                let devices = waiter.wait().await?;
                resolved.insert(account, devices);
            }
        }

        let mut out = Vec::new();
        for account in &unique {
            let Some(devices) = resolved.get(account) else {
                continue;
            };
            out.extend(extract_devices(account, devices, ignore_zero_devices, own));
        }
        Ok(out)
    }

    async fn store_entries(
        &self,
        entries: Vec<DirectoryEntry>,
    ) -> HashMap<AccountId, Vec<DeviceRecord>> {
        let mut fetched = HashMap::new();
        let mut cache = self.cache.lock().await;
        let mut alternates = self.alternates.lock().await;
        for entry in entries {
            cache.insert(entry.account.clone(), entry.devices.clone());
            if let Some(alternate) = entry.alternate {
                let (primary, alt) = match entry.account.namespace {
                    courier_types::Namespace::Primary => (entry.account.clone(), alternate),
                    courier_types::Namespace::Alternate => (alternate, entry.account.clone()),
                };
                alternates.insert(alt, primary);
            }
            fetched.insert(entry.account, entry.devices);
        }
        fetched
    }

    pub async fn invalidate(&self, account: &AccountId) {
        self.cache.lock().await.remove(account);
    }

    /// Primary-namespace account for an alternate one, if known.
    pub async fn map_alternate(&self, alternate: &AccountId) -> Option<AccountId> {
        self.alternates.lock().await.get(alternate)
    }

    pub async fn primary_for(&self, account: &AccountId) -> AccountId {
        match self.map_alternate(account).await {
            Some(primary) => primary,
            None => account.clone(),
        }
    }
}

/// Device 0 is skipped when asked, our own device never appears, and
/// companion devices need a key index.
pub fn extract_devices(
    account: &AccountId,
    devices: &[DeviceRecord],
    ignore_zero_devices: bool,
    own: &[DeviceAddress],
) -> Vec<DeviceAddress> {
    devices
        .iter()
        .filter(|d| !(ignore_zero_devices && d.id == 0))
        .filter(|d| d.id == 0 || d.key_index.is_some())
        .map(|d| account.device(d.id))
        .filter(|addr| !own.contains(addr))
        .collect()
}
