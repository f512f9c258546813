//! Pool controller and rotation engine
//!
//! One coarse readers-writer lock guards the in-process cache and serializes
//! write sections; row-level correctness comes from the single-statement
//! updates in the repository. Vendor HTTP and the post-rotation quiet period
//! run outside the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::{PoolSettings, StoreConfig};
use crate::database::Database;
use crate::error::{Result, SwivelError};
use crate::forwarder::{forwarder_addr, ForwarderManager};
use crate::models::{
    materialize_template, parse_proxy_line, ProxyEntry, ProxyErrorInfo, ProxyKind, ProxyLease,
    ProxySpec,
};
use crate::repository::ProxyRepository;
use crate::vendor::{CurrentProxy, NewProxy, VendorClient, VendorClients};

const RESET_TIMEOUT: Duration = Duration::from_secs(10);

struct PoolState {
    /// Mirror of the durable rows; agrees with the store after every public op
    cache: HashMap<i64, ProxyEntry>,
    max_used: i64,
    change_wait: Duration,
    block_assets: bool,
}

/// Seeded credential for a vendor-keyed entry at load time
struct Seeded {
    credential: String,
    last_changed: i64,
}

/// The proxy pool handle
///
/// Owns the catalog, the vendor clients, and the forwarder instances. All
/// public operations are safe under concurrent callers.
pub struct ProxyPool {
    db: Database,
    repo: ProxyRepository,
    vendors: VendorClients,
    forwarders: ForwarderManager,
    reset_client: reqwest::Client,
    state: RwLock<PoolState>,
}

impl ProxyPool {
    /// Open (or create) the catalog at the configured path
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let db = Database::new(config).await?;
        Self::with_database(db).await
    }

    /// Build a pool over an already-opened catalog
    pub async fn with_database(db: Database) -> Result<Self> {
        db.run_migrations().await?;

        let repo = ProxyRepository::new(db.pool().clone());
        Ok(Self {
            db,
            repo,
            vendors: VendorClients::new(),
            forwarders: ForwarderManager::new(),
            reset_client: reqwest::Client::builder()
                .timeout(RESET_TIMEOUT)
                .build()
                .map_err(SwivelError::Http)?,
            state: RwLock::new(PoolState {
                cache: HashMap::new(),
                max_used: PoolSettings::default().max_used,
                change_wait: Duration::ZERO,
                block_assets: false,
            }),
        })
    }

    /// Swap in a custom vendor registry (test seam)
    pub fn with_vendors(mut self, vendors: VendorClients) -> Self {
        self.vendors = vendors;
        self
    }

    /// Apply pool configuration
    ///
    /// Parse errors stop the load at the failing line; entries already
    /// applied stay. Vendor entries the vendor cannot seed yet (soft null or
    /// a hard API error) are skipped and retried on a later configure.
    /// Returns the ids of the loaded entries.
    #[instrument(skip(self, settings), fields(entries = settings.proxy_strings.len()))]
    pub async fn configure(&self, settings: PoolSettings) -> Result<Vec<i64>> {
        let mut state = self.state.write().await;
        let now = Utc::now().timestamp();

        let assets_flipped = state.block_assets != settings.block_assets;
        state.change_wait = settings.change_proxy_wait_time;
        state.max_used = settings.max_used;

        if settings.clear_all_proxy {
            self.repo.truncate().await?;
            state.cache.clear();
        } else {
            self.repo.reset_all(now).await?;
            for entry in state.cache.values_mut() {
                entry.used = 0;
                entry.running = false;
                entry.last_error.clear();
                entry.updated_at = now;
            }
        }

        let mut ids = Vec::with_capacity(settings.proxy_strings.len());
        for line in &settings.proxy_strings {
            let spec = parse_proxy_line(line)?;

            let Some(seeded) = self.seed_entry(&spec, now).await else {
                continue;
            };

            let id = self
                .repo
                .upsert(&spec, &seeded.credential, seeded.last_changed, now)
                .await?;
            if let Some(entry) = self.repo.get_by_id(id).await? {
                state.cache.insert(id, entry);
            }
            ids.push(id);
        }

        if assets_flipped || settings.clear_all_proxy {
            self.forwarders.stop_all().await;
        }
        if settings.block_assets {
            for id in &ids {
                let credential = state
                    .cache
                    .get(id)
                    .map(|e| e.credential.clone())
                    .unwrap_or_default();
                if let Err(e) = self.forwarders.start(*id, &credential).await {
                    warn!(id = id, error = %e, "Failed to start forwarder");
                }
            }
        }
        state.block_assets = settings.block_assets;

        info!(loaded = ids.len(), "Pool configured");
        Ok(ids)
    }

    /// Resolve the initial credential for an entry
    ///
    /// Non-vendor kinds carry their own credential. Vendor kinds ask for the
    /// currently issued one, falling back to a rotation on a stale signal;
    /// the vendor's remaining cooldown back-dates `last_changed` so the next
    /// rotation lines up with what the vendor actually permits.
    async fn seed_entry(&self, spec: &ProxySpec, now: i64) -> Option<Seeded> {
        let Some(client) = self.vendors.for_kind(spec.kind) else {
            return Some(Seeded {
                credential: spec.credential.clone(),
                last_changed: now,
            });
        };

        let region = region_of(spec.kind, &spec.change_url);
        match client.fetch_current(&spec.api_key, region).await {
            Ok(CurrentProxy::Active(vendor)) => {
                let owed = (spec.min_time - vendor.cooldown_remaining).max(0);
                Some(Seeded {
                    credential: vendor.credential,
                    last_changed: now - owed,
                })
            }
            Ok(CurrentProxy::Stale) => match client.fetch_new(&spec.api_key, region).await {
                Ok(NewProxy::Issued(credential)) => Some(Seeded {
                    credential,
                    last_changed: now,
                }),
                Ok(NewProxy::SoftNull) => {
                    debug!(kind = %spec.kind, "Vendor has no credential yet, skipping entry");
                    None
                }
                Err(e) => {
                    warn!(kind = %spec.kind, error = %e, "Vendor seed failed, skipping entry");
                    None
                }
            },
            Ok(CurrentProxy::SoftNull) => {
                debug!(kind = %spec.kind, "Vendor rate-limited, skipping entry");
                None
            }
            Err(e) => {
                warn!(kind = %spec.kind, error = %e, "Vendor seed failed, skipping entry");
                None
            }
        }
    }

    /// Take one proxy for short-lived use
    ///
    /// Selects an eligible entry, marks it running, and rotates it first when
    /// policy permits. The returned credential is the loopback forwarder
    /// address when asset blocking is on.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<ProxyLease> {
        loop {
            let now = Utc::now().timestamp();

            let candidate = {
                let state = self.state.read().await;
                self.repo.select_candidate(state.max_used, now).await?
            };
            let Some(entry) = candidate else {
                return Err(SwivelError::NoAvailableProxy);
            };
            let kind = entry.kind_enum().ok_or_else(|| {
                SwivelError::InvalidConfig(format!("unknown kind in catalog: {}", entry.kind))
            })?;

            // Shared entries carry no lease state; sticky templates get a
            // fresh token per hand-out.
            if !entry.unique {
                let credential = if kind == ProxyKind::Sticky {
                    materialize_template(&entry.credential)
                } else {
                    entry.credential.clone()
                };
                return Ok(self.lease(entry.id, credential).await);
            }

            // Take the running flag; two callers can race here and the
            // conditional update lets exactly one through.
            {
                let mut state = self.state.write().await;
                if !self.repo.try_mark_running(entry.id, now).await? {
                    continue;
                }
                if let Some(cached) = state.cache.get_mut(&entry.id) {
                    cached.running = true;
                    cached.updated_at = now;
                }
            }

            return self.rotate_and_lease(entry, kind, now).await;
        }
    }

    /// Per-kind rotation dispatch for an entry already marked running
    async fn rotate_and_lease(
        &self,
        entry: ProxyEntry,
        kind: ProxyKind,
        now: i64,
    ) -> Result<ProxyLease> {
        let can_rotate = entry.can_rotate(now);

        match kind {
            ProxyKind::Static => {
                self.count_use(entry.id, now).await?;
                Ok(self.lease(entry.id, entry.credential).await)
            }
            ProxyKind::Sticky => {
                if can_rotate {
                    self.commit_rotation(entry.id, None, now).await?;
                } else {
                    self.count_use(entry.id, now).await?;
                }
                Ok(self
                    .lease(entry.id, materialize_template(&entry.credential))
                    .await)
            }
            ProxyKind::Tmproxy | ProxyKind::Kiotproxy | ProxyKind::Ipv4xoay => {
                if !can_rotate {
                    self.count_use(entry.id, now).await?;
                    return Ok(self.lease(entry.id, entry.credential).await);
                }
                let Some(client) = self.vendors.for_kind(kind).cloned() else {
                    return Err(SwivelError::Vendor(format!("no client for kind {}", kind)));
                };
                self.rotate_vendor(client, entry, kind, now).await
            }
            ProxyKind::Mobilehop => self.rotate_mobilehop(entry, now).await,
        }
    }

    /// Rotate a vendor-keyed entry; the vendor call runs without the lock
    async fn rotate_vendor(
        &self,
        client: Arc<dyn VendorClient>,
        entry: ProxyEntry,
        kind: ProxyKind,
        now: i64,
    ) -> Result<ProxyLease> {
        let region = region_of(kind, &entry.change_url).map(str::to_string);

        match client.fetch_new(&entry.api_key, region.as_deref()).await {
            Ok(NewProxy::Issued(credential)) => {
                self.commit_rotation(entry.id, Some(&credential), now).await?;
                self.forwarders.update_credential(entry.id, &credential);
                self.quiet_period().await;
                Ok(self.lease(entry.id, credential).await)
            }
            Ok(NewProxy::SoftNull) => {
                // Vendor says wait. With a live credential this acquire just
                // reuses it; without one the entry goes back for later.
                if entry.credential.is_empty() {
                    self.release_entry(entry.id, now).await;
                    Err(SwivelError::NoAvailableProxy)
                } else {
                    self.count_use(entry.id, now).await?;
                    Ok(self.lease(entry.id, entry.credential).await)
                }
            }
            Err(e) => {
                // Quarantined: the entry keeps its running flag and stays out
                // of selection until clear_error.
                let message = format!("fetch_new failed: {}", e);
                self.quarantine(entry.id, &message, now).await?;
                Err(SwivelError::RotationFailed(message))
            }
        }
    }

    /// Mobilehop resets on every acquire; a failed reset releases the entry
    /// instead of quarantining it
    async fn rotate_mobilehop(&self, entry: ProxyEntry, now: i64) -> Result<ProxyLease> {
        match self.call_change_url(&entry.change_url).await {
            Ok(()) => {
                self.commit_rotation(entry.id, None, now).await?;
                self.quiet_period().await;
                Ok(self.lease(entry.id, entry.credential).await)
            }
            Err(e) => {
                self.release_entry(entry.id, now).await;
                Err(SwivelError::RotationFailed(format!(
                    "change_url failed: {}",
                    e
                )))
            }
        }
    }

    /// Hand back an entry; best-effort, never fails the caller
    #[instrument(skip(self))]
    pub async fn release(&self, id: i64) {
        let now = Utc::now().timestamp();
        self.release_entry(id, now).await;
    }

    /// Quarantined entries with their recorded failures
    pub async fn list_errors(&self) -> Result<Vec<ProxyErrorInfo>> {
        let _state = self.state.read().await;
        self.repo.list_errors().await
    }

    /// Lift an entry's quarantine
    pub async fn clear_error(&self, id: i64) -> Result<()> {
        let mut state = self.state.write().await;
        let now = Utc::now().timestamp();
        if !self.repo.clear_error(id, now).await? {
            return Err(SwivelError::ProxyNotFound { id });
        }
        if let Some(cached) = state.cache.get_mut(&id) {
            cached.last_error.clear();
            cached.updated_at = now;
        }
        info!(id = id, "Cleared proxy error");
        Ok(())
    }

    /// Every catalog entry
    pub async fn list_all(&self) -> Result<Vec<ProxyEntry>> {
        let _state = self.state.read().await;
        self.repo.get_all().await
    }

    /// One catalog entry by id
    pub async fn get_by_id(&self, id: i64) -> Result<Option<ProxyEntry>> {
        let _state = self.state.read().await;
        self.repo.get_by_id(id).await
    }

    /// Stop all forwarders and close the catalog
    pub async fn shutdown(&self) {
        self.forwarders.stop_all().await;
        self.db.close().await;
    }

    async fn release_entry(&self, id: i64, now: i64) {
        let mut state = self.state.write().await;
        if let Err(e) = self.repo.mark_released(id, now).await {
            warn!(id = id, error = %e, "Release failed");
            return;
        }
        if let Some(cached) = state.cache.get_mut(&id) {
            cached.running = false;
            cached.updated_at = now;
        }
    }

    async fn count_use(&self, id: i64, now: i64) -> Result<()> {
        let mut state = self.state.write().await;
        self.repo.increment_used(id, now).await?;
        if let Some(cached) = state.cache.get_mut(&id) {
            cached.used += 1;
            cached.updated_at = now;
        }
        Ok(())
    }

    async fn commit_rotation(&self, id: i64, credential: Option<&str>, now: i64) -> Result<()> {
        let mut state = self.state.write().await;
        self.repo.record_rotation(id, credential, now).await?;
        if let Some(cached) = state.cache.get_mut(&id) {
            if let Some(credential) = credential {
                cached.credential = credential.to_string();
            }
            cached.used = 1;
            cached.last_changed = now;
            cached.last_error.clear();
            cached.updated_at = now;
        }
        Ok(())
    }

    async fn quarantine(&self, id: i64, message: &str, now: i64) -> Result<()> {
        let mut state = self.state.write().await;
        self.repo.record_error(id, message, now).await?;
        if let Some(cached) = state.cache.get_mut(&id) {
            cached.last_error = message.to_string();
            cached.updated_at = now;
        }
        warn!(id = id, error = message, "Proxy quarantined");
        Ok(())
    }

    /// Remap to the loopback forwarder when asset blocking is on
    async fn lease(&self, id: i64, credential: String) -> ProxyLease {
        let block_assets = self.state.read().await.block_assets;
        if block_assets {
            ProxyLease {
                id,
                credential: forwarder_addr(id),
            }
        } else {
            ProxyLease { id, credential }
        }
    }

    /// Post-rotation sleep so callers do not race the new exit IP
    async fn quiet_period(&self) {
        let wait = self.state.read().await.change_wait;
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Quiet period after rotation");
            tokio::time::sleep(wait).await;
        }
    }

    async fn call_change_url(&self, change_url: &str) -> Result<()> {
        if change_url.is_empty() {
            return Err(SwivelError::InvalidConfig("change_url is empty".into()));
        }

        let resp = self.reset_client.get(change_url).send().await?;
        if !resp.status().is_success() {
            return Err(SwivelError::Vendor(format!(
                "change_url returned status {}",
                resp.status()
            )));
        }

        Ok(())
    }
}

/// KiotProxy stashes its region in the change_url column
fn region_of(kind: ProxyKind, change_url: &str) -> Option<&str> {
    (kind == ProxyKind::Kiotproxy && !change_url.is_empty()).then_some(change_url)
}
