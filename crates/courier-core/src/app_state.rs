use crate::cache::TtlCache;
use crate::config::CoreConfig;
use crate::connection::Connection;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::identity::AuthState;
use crate::keystore::{KeyAccess, KeyKind, KeyStore};
use crate::lt_hash::{LtHash, LT_HASH_LEN};
use crate::policy::SyncFailurePolicy;
use courier_types::{
    Jid, Stanza, SyncdMutation, SyncdOperation, SyncdPatch, SyncdRecord, SyncdSnapshot,
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const SYNC_NAMESPACE: &str = "w:sync:app:state";

/// Local checkpoint of one collection.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionState {
    pub version: u64,
    pub hash: Vec<u8>,
    /// Value digest of every live record, keyed by its index.
    pub index_macs: BTreeMap<String, Vec<u8>>,
}

impl Default for CollectionState {
    fn default() -> Self {
        Self {
            version: 0,
            hash: vec![0u8; LT_HASH_LEN],
            index_macs: BTreeMap::new(),
        }
    }
}

pub fn value_mac(record: &SyncdRecord) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(record.index_key().as_bytes());
    hasher.update(&[0]);
    hasher.update(&record.value);
    hasher.finalize().as_bytes().to_vec()
}

impl CollectionState {
    pub fn apply(&mut self, mutation: &SyncdMutation) -> Result<(), CoreError> {
        let mut hash = LtHash::from_bytes(&self.hash)?;
        let index = mutation.record.index_key();
        let previous = self.index_macs.remove(&index);
        if let Some(previous) = &previous {
            hash.subtract(previous);
        }
        match mutation.operation {
            SyncdOperation::Set => {
                let mac = value_mac(&mutation.record);
                hash.add(&mac);
                self.index_macs.insert(index, mac);
            }
            SyncdOperation::Remove => {
                if previous.is_none() {
                    debug!("remove of unknown index {}", index);
                }
            }
        }
        self.hash = hash.as_bytes().to_vec();
        Ok(())
    }
}

/// Mutations this client wants to publish to one collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalPatch {
    pub collection: String,
    pub mutations: Vec<SyncdMutation>,
}

#[derive(Clone, Debug)]
pub struct AppStateSettings {
    pub failure: SyncFailurePolicy,
    pub verify_snapshots: bool,
    pub verify_patches: bool,
    pub emit_own_events: bool,
    pub query_timeout: Duration,
}

impl AppStateSettings {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            failure: config.sync_failure.clone(),
            verify_snapshots: config.verify_snapshots,
            verify_patches: config.verify_patches,
            emit_own_events: config.emit_own_events,
            query_timeout: config.query_timeout(),
        }
    }
}

#[derive(Debug)]
struct CollectionPayload {
    snapshot: Option<SyncdSnapshot>,
    patches: Vec<SyncdPatch>,
    has_more: bool,
}

/// Keeps the local replica of server-held app state converged through
/// hash-verified snapshots and patches.
#[derive(Clone)]
pub struct AppStateSync {
    auth: AuthState,
    keys: KeyStore,
    conn: Arc<dyn Connection>,
    events: EventBus,
    ordering: Arc<Mutex<()>>,
    cooldown: Arc<Mutex<TtlCache<String, ()>>>,
    settings: AppStateSettings,
}

impl AppStateSync {
    pub fn new(
        auth: AuthState,
        keys: KeyStore,
        conn: Arc<dyn Connection>,
        events: EventBus,
        ordering: Arc<Mutex<()>>,
        settings: AppStateSettings,
    ) -> Self {
        Self {
            auth,
            keys,
            conn,
            events,
            ordering,
            cooldown: Arc::new(Mutex::new(TtlCache::new(settings.failure.cooldown(), 1_000))),
            settings,
        }
    }

    pub async fn resync(&self, names: &[String], is_initial_sync: bool) -> Result<(), CoreError> {
        let _ordering = self.ordering.lock().await;
        self.resync_locked(names, is_initial_sync).await
    }

    async fn resync_locked(&self, names: &[String], is_initial_sync: bool) -> Result<(), CoreError> {
        self.auth.get().await?;
        let mut pending = BTreeSet::new();
        {
            let mut cooldown = self.cooldown.lock().await;
            for name in names {
                if cooldown.contains(name) {
                    info!("{} is cooling down after not-found, skipping", name);
                    continue;
                }
                pending.insert(name.clone());
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let tx = self.keys.begin().await;
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut floors: HashMap<String, u64> = HashMap::new();
        let mut surfaced: BTreeMap<String, Vec<SyncdMutation>> = BTreeMap::new();

        while !pending.is_empty() {
            let mut states = HashMap::new();
            let mut request = Vec::new();
            for name in &pending {
                let state = load_state(&tx, name).await?;
                floors.entry(name.clone()).or_insert(state.version);
                request.push((name.clone(), state.version));
                states.insert(name.clone(), state);
            }
            debug!("requesting app state for {:?}", request);
            let response = self
                .conn
                .query_ok(sync_query(&request), self.settings.query_timeout)
                .await?;

            for (name, payload) in parse_sync_response(&response)? {
                let Some(state) = states.remove(&name) else {
                    debug!("ignoring unrequested collection {}", name);
                    continue;
                };
                let floor = floors.get(&name).copied().unwrap_or(0);
                let outcome = payload.and_then(|payload| {
                    let has_more = payload.has_more;
                    self.apply_payload(&name, state, payload, floor)
                        .map(|(state, mutations)| (state, mutations, has_more))
                });
                match outcome {
                    Ok((state, mutations, has_more)) => {
                        floors.insert(name.clone(), floor.max(state.version));
                        save_state(&tx, &name, &state).await?;
                        surfaced.entry(name.clone()).or_default().extend(mutations);
                        if !has_more {
                            debug!("{} synced to v{}", name, state.version);
                            pending.remove(&name);
                        }
                    }
                    Err(err) => {
                        let count = attempts.entry(name.clone()).or_insert(0);
                        *count += 1;
                        let irrecoverable = self.settings.failure.is_irrecoverable(*count, &err);
                        warn!("failed to sync {} (attempt {}): {}", name, count, err);
                        clear_state(&tx, &name).await?;
                        if err.is_not_found() {
                            self.cooldown.lock().await.insert(name.clone(), ());
                        }
                        if irrecoverable {
                            error!("abandoning {} for this sync: {}", name, err);
                            pending.remove(&name);
                        }
                    }
                }
            }
            for name in states.keys() {
                warn!("server did not answer for {}", name);
                pending.remove(name);
            }
        }

        tx.commit().await?;
        for (collection, mutations) in surfaced {
            if mutations.is_empty() {
                continue;
            }
            info!("{} mutations from {}", mutations.len(), collection);
            self.events.publish(CoreEvent::AppStateMutations {
                collection,
                mutations,
                is_initial_sync,
            });
        }
        Ok(())
    }

    /// Applies a snapshot, then the patches in version order. Mutations at
    /// or below `floor` were surfaced before and are not returned again.
    fn apply_payload(
        &self,
        name: &str,
        state: CollectionState,
        payload: CollectionPayload,
        floor: u64,
    ) -> Result<(CollectionState, Vec<SyncdMutation>), CoreError> {
        let mut state = state;
        let mut surfaced = Vec::new();
        if let Some(snapshot) = payload.snapshot.filter(|snapshot| {
            let stale = snapshot.version < state.version;
            if stale {
                warn!(
                    "ignoring {} snapshot v{} older than local v{}",
                    name, snapshot.version, state.version
                );
            }
            !stale
        }) {
            let mut fresh = CollectionState::default();
            let mutations: Vec<SyncdMutation> = snapshot
                .records
                .into_iter()
                .map(|record| SyncdMutation {
                    operation: SyncdOperation::Set,
                    record,
                })
                .collect();
            for mutation in &mutations {
                fresh.apply(mutation)?;
            }
            if self.settings.verify_snapshots && fresh.hash != snapshot.hash {
                return Err(CoreError::Crypto(format!(
                    "snapshot hash mismatch for {} v{}: {}",
                    name,
                    snapshot.version,
                    hex::encode(&fresh.hash[..8])
                )));
            }
            fresh.version = snapshot.version;
            if snapshot.version > floor {
                surfaced.extend(mutations);
            }
            state = fresh;
        }

        let mut patches = payload.patches;
        patches.sort_by_key(|p| p.version);
        for patch in patches {
            if patch.version <= state.version {
                debug!("{} v{} already applied", name, patch.version);
                continue;
            }
            for mutation in &patch.mutations {
                state.apply(mutation)?;
            }
            if self.settings.verify_patches {
                if let Some(expected) = &patch.hash {
                    if *expected != state.hash {
                        return Err(CoreError::Crypto(format!(
                            "patch hash mismatch for {} v{}",
                            name, patch.version
                        )));
                    }
                }
            }
            state.version = patch.version;
            if patch.version > floor {
                surfaced.extend(patch.mutations);
            }
        }
        Ok((state, surfaced))
    }

    /// Publishes local mutations: brings the collection up to date, encodes
    /// the patch at the next version and uploads it. Returns that version.
    pub async fn apply_local_patch(&self, patch: LocalPatch) -> Result<u64, CoreError> {
        let creds = self.auth.get().await?;
        if creds.app_state_key_id.is_none() {
            return Err(CoreError::Validation("app state key not present".to_string()));
        }
        let _ordering = self.ordering.lock().await;
        let name = patch.collection.clone();
        self.resync_locked(&[name.clone()], false).await?;

        let tx = self.keys.begin().await;
        let mut state = load_state(&tx, &name).await?;
        for mutation in &patch.mutations {
            state.apply(mutation)?;
        }
        state.version += 1;
        let document = SyncdPatch {
            version: state.version,
            mutations: patch.mutations.clone(),
            hash: Some(state.hash.clone()),
            device: Some(creds.me.clone()),
        };
        let request = app_state_iq(vec![collection_node(&name, state.version - 1, false)
            .children(vec![Stanza::new("patch").bytes(document.encode()?)])]);
        self.conn
            .query_ok(request, self.settings.query_timeout)
            .await?;
        save_state(&tx, &name, &state).await?;
        tx.commit().await?;
        info!("uploaded {} v{}", name, state.version);

        if self.settings.emit_own_events {
            self.events.publish(CoreEvent::AppStateMutations {
                collection: name,
                mutations: patch.mutations,
                is_initial_sync: false,
            });
        }
        Ok(state.version)
    }

    /// Stored checkpoint of a collection, outside any transaction.
    pub async fn collection_state(&self, name: &str) -> Result<CollectionState, CoreError> {
        load_state(&self.keys, name).await
    }

    pub async fn is_cooling_down(&self, name: &str) -> bool {
        self.cooldown.lock().await.contains(&name.to_string())
    }
}

async fn load_state(keys: &dyn KeyAccess, name: &str) -> Result<CollectionState, CoreError> {
    match keys.get_one(KeyKind::AppStateVersion, name).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map_err(|err| CoreError::Storage(format!("app state {}: {}", name, err))),
        None => Ok(CollectionState::default()),
    }
}

async fn save_state(
    keys: &dyn KeyAccess,
    name: &str,
    state: &CollectionState,
) -> Result<(), CoreError> {
    let bytes = serde_json::to_vec(state)
        .map_err(|err| CoreError::Storage(format!("app state {}: {}", name, err)))?;
    keys.set_one(KeyKind::AppStateVersion, name, Some(bytes)).await
}

async fn clear_state(keys: &dyn KeyAccess, name: &str) -> Result<(), CoreError> {
    keys.set_one(KeyKind::AppStateVersion, name, None).await
}

fn collection_node(name: &str, version: u64, return_snapshot: bool) -> Stanza {
    Stanza::new("collection")
        .attr("name", name)
        .attr("version", version.to_string())
        .attr("return_snapshot", return_snapshot.to_string())
}

fn app_state_iq(collections: Vec<Stanza>) -> Stanza {
    Stanza::new("iq")
        .attr("to", Jid::server().to_string())
        .attr("xmlns", SYNC_NAMESPACE)
        .attr("type", "set")
        .children(vec![Stanza::new("sync").children(collections)])
}

/// A full snapshot is requested for collections we hold no version of.
pub fn sync_query(collections: &[(String, u64)]) -> Stanza {
    app_state_iq(
        collections
            .iter()
            .map(|(name, version)| collection_node(name, *version, *version == 0))
            .collect(),
    )
}

fn parse_sync_response(
    response: &Stanza,
) -> Result<Vec<(String, Result<CollectionPayload, CoreError>)>, CoreError> {
    let sync = response
        .child("sync")
        .ok_or_else(|| CoreError::Structural("sync response without sync".to_string()))?;
    let mut out = Vec::new();
    for collection in sync.children_named("collection") {
        let Some(name) = collection.get_attr("name") else {
            warn!("collection without name in sync response");
            continue;
        };
        out.push((name.to_string(), parse_collection(name, collection)));
    }
    Ok(out)
}

fn parse_collection(name: &str, node: &Stanza) -> Result<CollectionPayload, CoreError> {
    if let Some(err) = node.error() {
        if err.code == 404 {
            return Err(CoreError::NotFound(format!("collection {}", name)));
        }
        return Err(crate::error::TransportError::Status(err.code, err.text).into());
    }
    let snapshot = match node.child("snapshot").and_then(|s| s.content_bytes()) {
        Some(bytes) => Some(SyncdSnapshot::decode(bytes)?),
        None => None,
    };
    let mut patches = Vec::new();
    if let Some(list) = node.child("patches") {
        for patch in list.children_named("patch") {
            let bytes = patch
                .content_bytes()
                .ok_or_else(|| CoreError::Structural(format!("empty patch in {}", name)))?;
            patches.push(SyncdPatch::decode(bytes)?);
        }
    }
    Ok(CollectionPayload {
        snapshot,
        patches,
        has_more: node.get_attr("has_more_patches") == Some("true"),
    })
}
