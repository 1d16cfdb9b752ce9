use crate::admin::BrokerAdminApi;
use crate::algorithms::{
    strategy_for, LoadBalancerStrategy, PlacementStrategy, SelectionThresholds,
};
use crate::config::LoadManagerConfig;
use crate::isolation::{IsolationPolicySpec, NamespaceIsolationPolicies};
use crate::metrics::{self, BrokerMetrics};
use crate::placement;
use crate::quota::{factor_dirty, quota_dirty, LoadFactors, QuotaEstimator};
use crate::ranking::{build_rankings, ResourceUnitRanking, SortedRankings};
use crate::report::{needs_update, BrokerInfo, LoadReport, SystemResourceProvider};
use crate::shedding::LoadShedder;
use crate::splitting::BundleSplitter;
use crate::types::constants::{LOAD_REPORT_UPDATE_MIN_INTERVAL, MIN_CPU_FACTOR, MIN_MEM_FACTOR};
use crate::types::{LoadManagerError, NamespaceBundleStats, ResourceQuota, ServiceUnitId};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stratus_coordination::{get_json, paths, set_json, MetadataStore, SessionId, StoreError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Externally driven leadership flag. The election protocol lives outside
/// the controller; replicas only consume the boolean.
#[derive(Clone, Default)]
pub struct LeaderGate(Arc<AtomicBool>);

impl LeaderGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set_leader(&self, leader: bool) {
        self.0.store(leader, Ordering::Release);
    }
}

#[derive(Serialize, Deserialize)]
struct StrategySetting {
    #[serde(rename = "loadBalancerStrategy")]
    load_balancer_strategy: LoadBalancerStrategy,
}

#[derive(Serialize, Deserialize)]
struct CpuFactorSetting {
    #[serde(rename = "loadFactorCPU")]
    load_factor_cpu: f64,
}

#[derive(Serialize, Deserialize)]
struct MemFactorSetting {
    #[serde(rename = "loadFactorMemory")]
    load_factor_memory: f64,
}

/// Everything the rank-updater and placement mutate, behind one lock:
/// rankings always observe the quota snapshot produced in the same pass,
/// and a placement scan sees a consistent view of every candidate.
struct LoadState {
    current_reports: HashMap<String, LoadReport>,
    rankings: HashMap<String, ResourceUnitRanking>,
    estimator: QuotaEstimator,
    rotation_cursor: u64,
}

/// The per-broker controller replica.
///
/// Every replica writes its own load report; the leader additionally ranks
/// the fleet, places service units, sheds load and adapts quotas. All
/// placement reads go through an atomically swapped rankings snapshot, so
/// lookup traffic never contends with the rank updater.
pub struct LoadManager {
    info: BrokerInfo,
    config: RwLock<LoadManagerConfig>,
    store: Arc<dyn MetadataStore>,
    session: SessionId,
    admin: Arc<dyn BrokerAdminApi>,
    provider: Arc<dyn SystemResourceProvider>,
    leader: LeaderGate,

    strategy: ArcSwap<Box<dyn PlacementStrategy>>,
    isolation: ArcSwap<NamespaceIsolationPolicies>,
    state: Mutex<LoadState>,
    sorted_rankings: ArcSwap<SortedRankings>,
    shedder: LoadShedder,

    local_bundle_stats: RwLock<HashMap<String, NamespaceBundleStats>>,
    last_written_report: Mutex<Option<LoadReport>>,
    force_report_update: AtomicBool,
    shutdown: AtomicBool,

    rank_tx: mpsc::UnboundedSender<()>,
    rank_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl LoadManager {
    pub fn new(
        info: BrokerInfo,
        config: LoadManagerConfig,
        store: Arc<dyn MetadataStore>,
        session: SessionId,
        admin: Arc<dyn BrokerAdminApi>,
        provider: Arc<dyn SystemResourceProvider>,
        leader: LeaderGate,
    ) -> Arc<Self> {
        let (rank_tx, rank_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            info,
            strategy: ArcSwap::from_pointee(strategy_for(config.strategy)),
            isolation: ArcSwap::from_pointee(NamespaceIsolationPolicies::empty()),
            state: Mutex::new(LoadState {
                current_reports: HashMap::new(),
                rankings: HashMap::new(),
                estimator: QuotaEstimator::new(),
                rotation_cursor: 0,
            }),
            sorted_rankings: ArcSwap::from_pointee(BTreeMap::new()),
            shedder: LoadShedder::new(config.shedding_grace()),
            config: RwLock::new(config),
            store,
            session,
            admin,
            provider,
            leader,
            local_bundle_stats: RwLock::new(HashMap::new()),
            last_written_report: Mutex::new(None),
            force_report_update: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            rank_tx,
            rank_rx: Mutex::new(Some(rank_rx)),
        })
    }

    /// Register this broker's presence and spawn the scheduled tasks.
    /// Failure to create the presence ephemeral is fatal.
    pub async fn start(self: &Arc<Self>) -> Result<(), LoadManagerError> {
        self.load_settings().await?;

        let report = self.generate_report();
        let payload = serde_json::to_vec(&report).map_err(StoreError::from)?;
        self.store
            .create_ephemeral(
                &paths::broker_report_path(&self.info.broker_name),
                payload,
                self.session,
            )
            .await?;
        *self.last_written_report.lock() = Some(report);
        info!(broker = %self.info.broker_name, "broker presence registered");

        let broker_events = self.store.watch(paths::LOADBALANCE_BROKERS_ROOT);
        let settings_events = self.store.watch("/loadbalance/settings");
        let rank_rx = self
            .rank_rx
            .lock()
            .take()
            .ok_or_else(|| LoadManagerError::Config("start() may only be called once".into()))?;

        tokio::spawn(Arc::clone(self).broker_event_pump(broker_events));
        tokio::spawn(Arc::clone(self).settings_event_pump(settings_events));
        tokio::spawn(Arc::clone(self).rank_update_loop(rank_rx));
        tokio::spawn(Arc::clone(self).report_writer_loop());
        tokio::spawn(Arc::clone(self).shedding_loop());
        tokio::spawn(Arc::clone(self).splitting_loop());
        tokio::spawn(Arc::clone(self).quota_writer_loop());

        self.trigger_rank_update();
        Ok(())
    }

    /// Stop the scheduled tasks. Pending store futures are simply dropped.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.rank_tx.send(());
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// The embedding broker pushes its per-bundle traffic counters here.
    pub fn update_local_bundle_stats(&self, stats: HashMap<String, NamespaceBundleStats>) {
        *self.local_bundle_stats.write() = stats;
    }

    /// Flag the next report-writer tick to write unconditionally.
    pub fn force_report_update(&self) {
        self.force_report_update.store(true, Ordering::Relaxed);
    }

    pub fn leader_gate(&self) -> LeaderGate {
        self.leader.clone()
    }

    /// Current effective configuration (defaults overlaid with persisted
    /// settings).
    pub fn config_snapshot(&self) -> LoadManagerConfig {
        self.config.read().clone()
    }

    /// Latest published rankings snapshot (rank → brokers).
    pub fn sorted_rankings(&self) -> Arc<SortedRankings> {
        self.sorted_rankings.load_full()
    }

    /// Per-broker metric dictionaries for the observability surface.
    pub fn metrics(&self) -> Vec<BrokerMetrics> {
        let strategy = self.strategy.load();
        let state = self.state.lock();
        metrics::collect(&state.rankings, |r| strategy.rank(r))
    }

    /// Choose an owner for `bundle`, honoring isolation policy, and record
    /// the pre-allocation. `None` means no broker is available right now;
    /// callers treat that as retriable.
    pub fn assign(&self, bundle: &ServiceUnitId) -> Option<String> {
        let thresholds = {
            let config = self.config.read();
            SelectionThresholds {
                underload_pct: config.underload_threshold_pct,
                overload_pct: config.overload_threshold_pct,
            }
        };
        let strategy = self.strategy.load();
        let isolation = self.isolation.load();

        let mut state = self.state.lock();
        let LoadState {
            rankings,
            rotation_cursor,
            estimator,
            ..
        } = &mut *state;

        let candidates =
            placement::eligible_candidates(bundle.namespace(), rankings.keys(), &isolation);
        let quota = estimator.quota_for(bundle.as_str());

        placement::assign(
            bundle,
            rankings,
            rotation_cursor,
            &candidates,
            (**strategy).as_ref(),
            &thresholds,
            &quota,
        )
    }

    /// Switch the active strategy at runtime; ranks are rebuilt on the next
    /// pass.
    pub fn set_strategy(&self, kind: LoadBalancerStrategy) {
        self.config.write().strategy = kind;
        self.strategy.store(Arc::new(strategy_for(kind)));
        self.trigger_rank_update();
    }

    pub fn trigger_rank_update(&self) {
        let _ = self.rank_tx.send(());
    }

    fn generate_report(&self) -> LoadReport {
        let (overload, underload) = {
            let config = self.config.read();
            (
                config.overload_threshold_pct,
                config.underload_threshold_pct,
            )
        };
        LoadReport::generate(
            self.info.clone(),
            self.provider.usage(),
            self.local_bundle_stats.read().clone(),
            overload,
            underload,
        )
    }

    /// Pull persisted settings, falling back to the configured defaults
    /// when a node is absent.
    pub async fn load_settings(&self) -> Result<(), LoadManagerError> {
        let store = &*self.store;

        if let Some(setting) = get_json::<StrategySetting>(store, paths::SETTINGS_STRATEGY).await? {
            if setting.load_balancer_strategy != self.config.read().strategy {
                self.config.write().strategy = setting.load_balancer_strategy;
                self.strategy
                    .store(Arc::new(strategy_for(setting.load_balancer_strategy)));
            }
        }

        if let Some(v) = get_json::<f64>(store, paths::SETTINGS_OVERLOAD_THRESHOLD).await? {
            self.config.write().overload_threshold_pct = v;
        }
        if let Some(v) = get_json::<f64>(store, paths::SETTINGS_UNDERLOAD_THRESHOLD).await? {
            self.config.write().underload_threshold_pct = v;
        }
        if let Some(v) = get_json::<f64>(store, paths::SETTINGS_COMFORT_LOAD_THRESHOLD).await? {
            self.config.write().comfort_load_threshold_pct = v;
        }
        if let Some(v) = get_json::<bool>(store, paths::SETTINGS_AUTO_BUNDLE_SPLIT_ENABLED).await? {
            self.config.write().auto_bundle_split_enabled = v;
        }

        let cpu = get_json::<CpuFactorSetting>(store, paths::SETTINGS_LOAD_FACTOR_CPU)
            .await?
            .map(|s| s.load_factor_cpu);
        let mem = get_json::<MemFactorSetting>(store, paths::SETTINGS_LOAD_FACTOR_MEM)
            .await?
            .map(|s| s.load_factor_memory);
        let avg_quota = get_json::<ResourceQuota>(store, paths::SETTINGS_DEFAULT_QUOTA).await?;
        {
            let mut state = self.state.lock();
            let current = state.estimator.factors();
            state.estimator.restore(
                LoadFactors {
                    cpu: cpu.unwrap_or(current.cpu),
                    mem: mem.unwrap_or(current.mem),
                },
                avg_quota,
            );
        }

        match get_json::<HashMap<String, IsolationPolicySpec>>(store, paths::SETTINGS_ISOLATION)
            .await?
        {
            Some(specs) => match NamespaceIsolationPolicies::compile(&specs) {
                Ok(policies) => self.isolation.store(Arc::new(policies)),
                Err(e) => warn!(error = %e, "isolation policy update rejected, keeping previous"),
            },
            None => self
                .isolation
                .store(Arc::new(NamespaceIsolationPolicies::empty())),
        }

        Ok(())
    }

    /// One rank-updater pass: reload every broker's report, feed the quota
    /// estimator, rebuild the rankings, publish the snapshot.
    pub async fn run_ranking_pass(&self) -> Result<(), LoadManagerError> {
        let brokers = self
            .store
            .get_children(paths::LOADBALANCE_BROKERS_ROOT)
            .await?;

        let mut reports = HashMap::with_capacity(brokers.len());
        for broker in brokers {
            let path = paths::broker_report_path(&broker);
            match self.store.get_data(&path).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<LoadReport>(&bytes) {
                    Ok(report) => {
                        reports.insert(broker, report);
                    }
                    Err(e) => {
                        warn!(broker = %broker, error = %e, "skipping undeserializable load report")
                    }
                },
                // Broker vanished between listing and read; the next pass
                // re-includes it if it came back
                Ok(None) => debug!(broker = %broker, "report node gone, broker dropped this pass"),
                Err(e) => warn!(broker = %broker, error = %e, "report read failed, broker skipped"),
            }
        }

        let strategy = self.strategy.load();
        {
            let mut state = self.state.lock();
            let LoadState {
                current_reports,
                rankings,
                estimator,
                ..
            } = &mut *state;

            *current_reports = reports;
            estimator.update(current_reports);

            let (new_rankings, sorted) =
                build_rankings(current_reports, rankings, estimator, |r| strategy.rank(r));
            *rankings = new_rankings;
            self.sorted_rankings.store(Arc::new(sorted));
        }

        debug!("ranking pass complete");
        Ok(())
    }

    /// Write this broker's report when it moved enough to matter.
    pub async fn maybe_write_report(&self) -> Result<bool, LoadManagerError> {
        let (threshold_pct, max_interval) = {
            let config = self.config.read();
            (config.report_threshold_pct, config.max_report_interval())
        };

        let report = self.generate_report();
        let force = self.force_report_update.swap(false, Ordering::Relaxed);
        let capacity = {
            let state = self.state.lock();
            state
                .rankings
                .get(&self.info.broker_name)
                .map(|r| r.estimated_max_capacity())
                .unwrap_or(100)
        };

        let should_write = force
            || needs_update(
                self.last_written_report.lock().as_ref(),
                &report,
                capacity,
                threshold_pct,
                max_interval,
            );
        if !should_write {
            return Ok(false);
        }

        let payload = serde_json::to_vec(&report).map_err(StoreError::from)?;
        let path = paths::broker_report_path(&self.info.broker_name);
        match self
            .store
            .set_ephemeral_data(&path, payload, self.session)
            .await
        {
            Ok(()) => {
                *self.last_written_report.lock() = Some(report);
                self.trigger_rank_update();
                Ok(true)
            }
            Err(e) => {
                // Keep the trigger armed so the next tick retries
                self.force_report_update.store(true, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// One shedding pass: pick a victim bundle per overloaded broker and
    /// ask its owner to release it. Honors the store kill switch (dry run).
    pub async fn shed_load_once(&self) {
        let (overload, comfort) = {
            let config = self.config.read();
            (
                config.overload_threshold_pct,
                config.comfort_load_threshold_pct,
            )
        };
        let reports = self.state.lock().current_reports.clone();

        let decisions = self
            .shedder
            .find_bundles_to_unload(&reports, overload, comfort);
        if decisions.is_empty() {
            return;
        }

        let dry_run = match self.store.exists(paths::FLAG_UNLOAD_DISABLED).await {
            Ok(flag) => flag,
            Err(e) => {
                warn!(error = %e, "kill-switch read failed, running shed pass dry");
                true
            }
        };

        for decision in decisions {
            if dry_run {
                info!(
                    bundle = %decision.bundle,
                    broker = %decision.broker,
                    bottleneck = %decision.bottleneck,
                    "unloading disabled, would have shed"
                );
                continue;
            }

            let id: ServiceUnitId = match decision.bundle.parse() {
                Ok(id) => id,
                Err(e) => {
                    warn!(bundle = %decision.bundle, error = %e, "unshedable bundle id");
                    continue;
                }
            };

            match self
                .admin
                .unload_bundle(&decision.broker_web_addr, id.namespace(), id.range())
                .await
            {
                Ok(()) => {
                    // Only a successful unload starts the grace period; a
                    // failed one is retried next cycle
                    self.shedder.record_unloaded(&decision.bundle);
                    info!(
                        bundle = %decision.bundle,
                        broker = %decision.broker,
                        bottleneck = %decision.bottleneck,
                        pct = decision.bottleneck_pct,
                        "bundle unloaded from overloaded broker"
                    );
                }
                Err(e) => {
                    warn!(bundle = %decision.bundle, broker = %decision.broker, error = %e, "unload failed")
                }
            }
        }

        self.shedder.purge_expired();
    }

    /// One splitting pass over the local broker's bundles.
    pub async fn split_bundles_once(&self) {
        let (auto_split, limits) = {
            let config = self.config.read();
            (config.auto_bundle_split_enabled, config.split_limits())
        };
        if !auto_split {
            return;
        }

        let local = self.generate_report();
        let counts = {
            let state = self.state.lock();
            BundleSplitter::namespace_bundle_counts(&state.current_reports)
        };

        let splits = BundleSplitter::new(limits).find_bundles_to_split(&local, &counts);
        if splits.is_empty() {
            return;
        }

        for id in &splits {
            match self
                .admin
                .split_bundle(&self.info.web_addr, id.namespace(), id.range())
                .await
            {
                Ok(()) => info!(bundle = %id, "bundle split requested"),
                Err(e) => warn!(bundle = %id, error = %e, "bundle split failed"),
            }
        }

        self.force_report_update();
    }

    /// Leader-side quota write-back: persist factors and quotas, but only
    /// fields that moved past their minimum band (compare-and-write).
    pub async fn write_quotas_once(&self) -> Result<(), LoadManagerError> {
        let legacy = self.config.read().legacy_bandwidth_compare;
        let (factors, avg_quota, bundle_quotas) = {
            let state = self.state.lock();
            (
                state.estimator.factors(),
                state.estimator.avg_quota().clone(),
                state.estimator.bundle_quotas().clone(),
            )
        };
        let store = &*self.store;

        let old_cpu = get_json::<CpuFactorSetting>(store, paths::SETTINGS_LOAD_FACTOR_CPU)
            .await?
            .map(|s| s.load_factor_cpu);
        if old_cpu.map_or(true, |old| factor_dirty(old, factors.cpu, MIN_CPU_FACTOR)) {
            set_json(
                store,
                paths::SETTINGS_LOAD_FACTOR_CPU,
                &CpuFactorSetting {
                    load_factor_cpu: factors.cpu,
                },
            )
            .await?;
        }

        let old_mem = get_json::<MemFactorSetting>(store, paths::SETTINGS_LOAD_FACTOR_MEM)
            .await?
            .map(|s| s.load_factor_memory);
        if old_mem.map_or(true, |old| factor_dirty(old, factors.mem, MIN_MEM_FACTOR)) {
            set_json(
                store,
                paths::SETTINGS_LOAD_FACTOR_MEM,
                &MemFactorSetting {
                    load_factor_memory: factors.mem,
                },
            )
            .await?;
        }

        let old_avg = get_json::<ResourceQuota>(store, paths::SETTINGS_DEFAULT_QUOTA).await?;
        if old_avg.map_or(true, |old| quota_dirty(&old, &avg_quota, legacy)) {
            set_json(store, paths::SETTINGS_DEFAULT_QUOTA, &avg_quota).await?;
        }

        for (bundle, quota) in &bundle_quotas {
            let path = paths::bundle_quota_path(bundle);
            let old = get_json::<ResourceQuota>(store, &path).await?;
            if old.map_or(true, |old| quota_dirty(&old, quota, legacy)) {
                set_json(store, &path, quota).await?;
            }
        }

        Ok(())
    }

    async fn broker_event_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<stratus_coordination::StoreEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if self.is_shutdown() {
                break;
            }
            debug!(path = %event.path, kind = ?event.kind, "broker change observed");
            self.trigger_rank_update();
        }
    }

    async fn settings_event_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<stratus_coordination::StoreEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if self.is_shutdown() {
                break;
            }
            debug!(path = %event.path, "settings change observed");
            if let Err(e) = self.load_settings().await {
                warn!(error = %e, "settings reload failed");
            }
            self.trigger_rank_update();
        }
    }

    async fn rank_update_loop(self: Arc<Self>, mut triggers: mpsc::UnboundedReceiver<()>) {
        while let Some(()) = triggers.recv().await {
            if self.is_shutdown() {
                break;
            }
            // Coalesce bursts of change events into one pass
            while triggers.try_recv().is_ok() {}
            if let Err(e) = self.run_ranking_pass().await {
                warn!(error = %e, "ranking pass failed, waiting for next trigger");
            }
        }
    }

    async fn report_writer_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(LOAD_REPORT_UPDATE_MIN_INTERVAL);
        // The first interval tick completes immediately; the initial report
        // was already written by start()
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.is_shutdown() {
                break;
            }
            if let Err(e) = self.maybe_write_report().await {
                warn!(error = %e, "load report write failed");
            }
        }
    }

    async fn shedding_loop(self: Arc<Self>) {
        let minutes = self.config.read().shedding_interval_minutes;
        let mut ticker = tokio::time::interval(Duration::from_secs(minutes * 60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.is_shutdown() {
                break;
            }
            if self.leader.is_leader() {
                self.shed_load_once().await;
            }
        }
    }

    async fn splitting_loop(self: Arc<Self>) {
        let minutes = self.config.read().splitting_interval_minutes;
        let mut ticker = tokio::time::interval(Duration::from_secs(minutes * 60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.is_shutdown() {
                break;
            }
            if self.leader.is_leader() {
                self.split_bundles_once().await;
            }
        }
    }

    async fn quota_writer_loop(self: Arc<Self>) {
        let minutes = self.config.read().quota_write_interval_minutes;
        let mut ticker = tokio::time::interval(Duration::from_secs(minutes * 60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.is_shutdown() {
                break;
            }
            if self.leader.is_leader() {
                if let Err(e) = self.write_quotas_once().await {
                    warn!(error = %e, "quota write-back failed");
                }
            }
        }
    }
}
