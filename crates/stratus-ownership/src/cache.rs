use crate::types::{EphemeralOwnerData, OwnedBundle, OwnerInfo, OwnershipError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::Shared;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use stratus_coordination::{paths, MetadataStore, SessionId, StoreError};
use tracing::{debug, info, warn};

type AcquireResult = Result<OwnerInfo, OwnershipError>;
type AcquireFuture = Shared<Pin<Box<dyn Future<Output = AcquireResult> + Send>>>;

/// Acquisition/release state machine for service units.
///
/// The coordination store's atomic ephemeral create is the mutex: the first
/// broker to create `/namespace/<bundle>` owns the bundle until it releases
/// the node or its session expires. Three maps share path keys but stay
/// disjoint in semantics:
///
/// - `local`: bundles this broker owns (active or disabled); a hit here
///   short-circuits every read.
/// - `pending`: in-flight acquisitions as shared futures, inserted
///   synchronously so concurrent callers for one bundle issue one create.
/// - `remote`: read-only cache of other brokers' ownership nodes,
///   invalidated whenever this broker touches the path.
pub struct OwnershipCache {
    store: Arc<dyn MetadataStore>,
    session: SessionId,
    self_data: EphemeralOwnerData,
    local: Arc<DashMap<String, Arc<OwnedBundle>>>,
    pending: Arc<DashMap<String, AcquireFuture>>,
    remote: Arc<DashMap<String, EphemeralOwnerData>>,
}

impl OwnershipCache {
    /// Create a cache advertising `self_data` (with `disabled = false`) as
    /// this broker's ownership payload.
    pub fn new(store: Arc<dyn MetadataStore>, session: SessionId, self_data: EphemeralOwnerData) -> Self {
        Self {
            store,
            session,
            self_data,
            local: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            remote: Arc::new(DashMap::new()),
        }
    }

    /// Try to become the owner of `bundle`.
    ///
    /// Success means either this broker won the create (`owned_by_self`) or
    /// another broker already holds the node and its payload is returned.
    /// A store failure fails every caller sharing the attempt and clears the
    /// pending entry so the next call retries.
    pub async fn try_acquire(&self, bundle: &str) -> AcquireResult {
        let path = paths::bundle_owner_path(bundle);

        if let Some(owned) = self.local.get(&path) {
            return Ok(self.local_info(owned.is_active()));
        }

        let fut = match self.pending.entry(path.clone()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let fut = self.acquire_future(bundle, path.clone());
                vacant.insert(fut.clone());
                fut
            }
        };

        fut.await
    }

    /// Current owner of `bundle`: the local entry when present (a bundle
    /// mid-acquisition resolves through the shared in-flight future), the
    /// remote ephemeral node otherwise, `None` when unowned.
    pub async fn get_owner(&self, bundle: &str) -> Result<Option<OwnerInfo>, OwnershipError> {
        let path = paths::bundle_owner_path(bundle);

        if let Some(owned) = self.local.get(&path) {
            return Ok(Some(self.local_info(owned.is_active())));
        }

        let inflight = self.pending.get(&path).map(|f| f.value().clone());
        if let Some(fut) = inflight {
            return fut.await.map(Some);
        }

        if let Some(cached) = self.remote.get(&path) {
            return Ok(Some(OwnerInfo {
                data: cached.clone(),
                owned_by_self: false,
            }));
        }

        match self.store.get_data(&path).await? {
            Some(bytes) => {
                let data: EphemeralOwnerData = serde_json::from_slice(&bytes)
                    .map_err(|e| OwnershipError::Serde(e.to_string()))?;
                self.remote.insert(path, data.clone());
                Ok(Some(OwnerInfo {
                    data,
                    owned_by_self: false,
                }))
            }
            None => Ok(None),
        }
    }

    /// Release `bundle`. The local cache stops reporting ownership before
    /// this returns; the store delete runs in the background and is
    /// idempotent (the ephemeral expires with the session anyway).
    pub fn remove_ownership(&self, bundle: &str) {
        let path = paths::bundle_owner_path(bundle);
        let was_owned = self.local.remove(&path).is_some();
        self.remote.remove(&path);

        if was_owned {
            debug!(bundle, "released bundle ownership");
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                match store.delete(&path).await {
                    Ok(()) | Err(StoreError::NoNode(_)) => {}
                    Err(e) => warn!(path = %path, error = %e, "ownership node delete failed"),
                }
            });
        }
    }

    /// Stop accepting traffic for `bundle` while keeping the store lock:
    /// flips the local entry inactive and republishes the ephemeral payload
    /// with `disabled = true` so other brokers refetch.
    pub async fn disable_ownership(&self, bundle: &str) -> Result<(), OwnershipError> {
        let path = paths::bundle_owner_path(bundle);

        if let Some(owned) = self.local.get(&path) {
            owned.deactivate();
        }

        let mut data = self.self_data.clone();
        data.disabled = true;
        let payload =
            serde_json::to_vec(&data).map_err(|e| OwnershipError::Serde(e.to_string()))?;
        self.store
            .set_ephemeral_data(&path, payload, self.session)
            .await?;
        self.remote.remove(&path);
        info!(bundle, "bundle ownership disabled");
        Ok(())
    }

    /// Whether `bundle` is currently owned by this broker.
    pub fn is_owned(&self, bundle: &str) -> bool {
        self.local.contains_key(&paths::bundle_owner_path(bundle))
    }

    /// Snapshot of the bundles this broker owns.
    pub fn owned_bundles(&self) -> Vec<Arc<OwnedBundle>> {
        self.local.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Session loss: every ephemeral this broker created has auto-expired,
    /// so all local state is dropped. Pending acquisitions fail on their own.
    pub fn on_session_expired(&self) {
        let owned = self.local.len();
        self.local.clear();
        self.remote.clear();
        if owned > 0 {
            warn!(owned, "store session expired, dropped local ownership state");
        }
    }

    fn local_info(&self, active: bool) -> OwnerInfo {
        let mut data = self.self_data.clone();
        data.disabled = !active;
        OwnerInfo {
            data,
            owned_by_self: true,
        }
    }

    fn acquire_future(&self, bundle: &str, path: String) -> AcquireFuture {
        let store = Arc::clone(&self.store);
        let session = self.session;
        let data = self.self_data.clone();
        let local = Arc::clone(&self.local);
        let pending = Arc::clone(&self.pending);
        let remote = Arc::clone(&self.remote);
        let bundle = bundle.to_string();

        let fut: Pin<Box<dyn Future<Output = AcquireResult> + Send>> = Box::pin(async move {
            let result =
                do_acquire(&*store, session, data, &local, &remote, &bundle, &path).await;
            // The local map is already updated; only now may the next caller
            // start a fresh attempt.
            pending.remove(&path);
            result
        });
        fut.shared()
    }
}

async fn do_acquire(
    store: &dyn MetadataStore,
    session: SessionId,
    data: EphemeralOwnerData,
    local: &DashMap<String, Arc<OwnedBundle>>,
    remote: &DashMap<String, EphemeralOwnerData>,
    bundle: &str,
    path: &str,
) -> AcquireResult {
    // A prior attempt may have completed between the caller's local-map
    // miss and this future starting; the node would be our own.
    if let Some(owned) = local.get(path) {
        let mut data = data;
        data.disabled = !owned.is_active();
        return Ok(OwnerInfo {
            data,
            owned_by_self: true,
        });
    }

    let payload = serde_json::to_vec(&data).map_err(|e| OwnershipError::Serde(e.to_string()))?;

    match store.create_ephemeral(path, payload, session).await {
        Ok(()) => {
            local.insert(path.to_string(), Arc::new(OwnedBundle::new(bundle)));
            remote.remove(path);
            info!(bundle, "acquired bundle ownership");
            Ok(OwnerInfo {
                data,
                owned_by_self: true,
            })
        }
        Err(StoreError::NodeExists(_)) => match store.get_data(path).await {
            Ok(Some(bytes)) => {
                let owner: EphemeralOwnerData = serde_json::from_slice(&bytes)
                    .map_err(|e| OwnershipError::Serde(e.to_string()))?;
                remote.insert(path.to_string(), owner.clone());
                Ok(OwnerInfo {
                    data: owner,
                    owned_by_self: false,
                })
            }
            // The node vanished between the failed create and the read:
            // surface the create failure, the next call starts clean.
            Ok(None) => Err(OwnershipError::AlreadyOwned(bundle.to_string())),
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    }
}
