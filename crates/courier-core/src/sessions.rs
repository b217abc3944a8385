use crate::backoff::{is_retryable, retry_with_backoff};
use crate::cache::TtlCache;
use crate::connection::Connection;
use crate::crypto::{CryptoRepository, KeyBundle};
use crate::error::CoreError;
use crate::keystore::{KeyAccess, KeyKind, KeyStore};
use crate::policy::RetryPolicy;
use courier_types::{DeviceAddress, Jid, Stanza};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

#[derive(Clone, Debug)]
pub struct SessionFetchSettings {
    pub batch_size: usize,
    pub deadline: Duration,
    pub failed_ttl: Duration,
    pub retry: RetryPolicy,
}

/// Makes sure an encryption session exists for every device we are about
/// to encrypt for, fetching key bundles for the missing ones.
#[derive(Clone)]
pub struct SessionManager {
    keys: KeyStore,
    crypto: Arc<dyn CryptoRepository>,
    conn: Arc<dyn Connection>,
    failed: Arc<Mutex<TtlCache<DeviceAddress, ()>>>,
    settings: SessionFetchSettings,
}

type BatchResult = (Vec<DeviceAddress>, Result<Vec<(DeviceAddress, KeyBundle)>, CoreError>);

impl SessionManager {
    pub fn new(
        keys: KeyStore,
        crypto: Arc<dyn CryptoRepository>,
        conn: Arc<dyn Connection>,
        settings: SessionFetchSettings,
    ) -> Self {
        Self {
            keys,
            crypto,
            conn,
            failed: Arc::new(Mutex::new(TtlCache::new(settings.failed_ttl, 10_000))),
            settings,
        }
    }

    /// Opens its own transaction. Returns whether any session was created.
    /// Sessions from batches that succeeded are committed even when another
    /// batch failed.
    pub async fn assert_sessions(
        &self,
        addresses: &[DeviceAddress],
        force: bool,
    ) -> Result<bool, CoreError> {
        let tx = self.keys.begin().await;
        let result = self.assert_sessions_in(&tx, addresses, force).await;
        tx.commit().await?;
        result
    }

    /// Same as `assert_sessions` inside a transaction the caller owns.
    pub async fn assert_sessions_in(
        &self,
        keys: &dyn KeyAccess,
        addresses: &[DeviceAddress],
        force: bool,
    ) -> Result<bool, CoreError> {
        let mut seen = HashSet::new();
        let unique: Vec<DeviceAddress> = addresses
            .iter()
            .filter(|a| seen.insert((*a).clone()))
            .cloned()
            .collect();

        let mut missing = if force {
            unique
        } else {
            let ids: Vec<String> = unique.iter().map(|a| self.crypto.address_for(a)).collect();
            let existing = keys.get(KeyKind::Session, &ids).await?;
            unique
                .into_iter()
                .filter(|a| !existing.contains_key(&self.crypto.address_for(a)))
                .collect()
        };

        {
            let mut failed = self.failed.lock().await;
            missing.retain(|addr| {
                let cooling = failed.contains(addr);
                if cooling {
                    debug!("skipping session fetch for {}, failed recently", addr);
                }
                !cooling
            });
        }
        if missing.is_empty() {
            return Ok(false);
        }

        let results = self.fetch_bundles(missing).await?;
        let mut first_error = None;
        let mut injected = 0usize;
        for (batch, result) in results {
            match result {
                Ok(bundles) => {
                    for (addr, bundle) in bundles {
                        self.crypto.inject_session(keys, &addr, &bundle).await?;
                        injected += 1;
                    }
                }
                Err(err) => {
                    warn!("session fetch for {} devices failed: {}", batch.len(), err);
                    let mut failed = self.failed.lock().await;
                    for addr in batch {
                        failed.insert(addr, ());
                    }
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        info!("created {} sessions", injected);
        Ok(injected > 0)
    }

    pub async fn clear_failed(&self, addr: &DeviceAddress) {
        self.failed.lock().await.remove(addr);
    }

    pub async fn is_cooling_down(&self, addr: &DeviceAddress) -> bool {
        self.failed.lock().await.contains(addr)
    }

    async fn fetch_bundles(&self, missing: Vec<DeviceAddress>) -> Result<Vec<BatchResult>, CoreError> {
        let mut tasks = JoinSet::new();
        for batch in missing.chunks(self.settings.batch_size.max(1)) {
            let batch = batch.to_vec();
            let conn = self.conn.clone();
            let policy = self.settings.retry.clone();
            tasks.spawn(async move {
                let result = retry_with_backoff(&policy, "key bundle fetch", is_retryable, |_| {
                    fetch_key_bundles(conn.as_ref(), &batch, policy.attempt_timeout())
                })
                .await;
                (batch, result)
            });
        }

        let collect = async {
            let mut results = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(err) => {
                        warn!("key bundle fetch task ended: {}", err);
                        return Err(CoreError::Cancelled);
                    }
                }
            }
            Ok(results)
        };
        match tokio::time::timeout(self.settings.deadline, collect).await {
            Ok(results) => results,
            Err(_) => {
                warn!("session fetch deadline of {:?} exceeded", self.settings.deadline);
                Err(CoreError::DeadlineExceeded)
            }
        }
    }
}

pub fn key_query(addresses: &[DeviceAddress]) -> Stanza {
    let users = addresses
        .iter()
        .map(|a| Stanza::new("user").attr("jid", a.to_jid().to_string()))
        .collect();
    Stanza::new("iq")
        .attr("xmlns", "encrypt")
        .attr("type", "get")
        .attr("to", Jid::server().to_string())
        .children(vec![Stanza::new("key").children(users)])
}

async fn fetch_key_bundles(
    conn: &dyn Connection,
    batch: &[DeviceAddress],
    timeout: Option<Duration>,
) -> Result<Vec<(DeviceAddress, KeyBundle)>, CoreError> {
    let response = conn
        .query_ok(key_query(batch), timeout.unwrap_or(Duration::from_secs(60)))
        .await?;
    let list = response
        .child("list")
        .ok_or_else(|| CoreError::Structural("key response without list".to_string()))?;
    let mut out = Vec::new();
    for user in list.children_named("user") {
        let Some(addr) = user
            .get_attr("jid")
            .and_then(|j| j.parse::<Jid>().ok())
            .and_then(|j| j.device_address())
        else {
            warn!("key response user without usable jid");
            continue;
        };
        if let Some(err) = user.error() {
            warn!("no key bundle for {}: {} {}", addr, err.code, err.text);
            continue;
        }
        out.push((addr, KeyBundle::from_user_node(user)?));
    }
    Ok(out)
}
