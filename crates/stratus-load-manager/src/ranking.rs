use crate::quota::{LoadFactors, QuotaEstimator};
use crate::report::LoadReport;
use crate::types::constants::MAX_BROKER_CAPACITY;
use crate::types::{ResourceQuota, SystemResourceUsage};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Per-resource percentages implied by an aggregated quota, against one
/// broker's limits.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuotaPercentages {
    pub cpu: f64,
    pub memory: f64,
    pub bandwidth_in: f64,
    pub bandwidth_out: f64,
}

impl QuotaPercentages {
    pub fn max(&self) -> f64 {
        self.cpu
            .max(self.memory)
            .max(self.bandwidth_in)
            .max(self.bandwidth_out)
    }
}

/// Quota bandwidth is bytes/s, system bandwidth gauges are Mbit/s.
fn bytes_to_mbps(bytes_per_sec: f64) -> f64 {
    bytes_per_sec * 8.0 / 1_048_576.0
}

/// Convert an aggregated quota into per-resource percentages of `usage`'s
/// limits. CPU goes through the cluster CPU factor (expected CPU percent
/// per msg/s); the memory quota is already MB.
pub fn quota_percentages(
    quota: &ResourceQuota,
    usage: &SystemResourceUsage,
    factors: LoadFactors,
) -> QuotaPercentages {
    let pct_of = |expected: f64, limit: f64| {
        if limit <= 0.0 {
            0.0
        } else {
            100.0 * expected / limit
        }
    };
    QuotaPercentages {
        cpu: pct_of(factors.cpu * quota.total_msg_rate(), usage.cpu.limit),
        memory: pct_of(quota.memory, usage.memory.limit),
        bandwidth_in: pct_of(bytes_to_mbps(quota.bandwidth_in), usage.bandwidth_in.limit),
        bandwidth_out: pct_of(bytes_to_mbps(quota.bandwidth_out), usage.bandwidth_out.limit),
    }
}

/// How many default-size bundles fit in this broker's full limits, the
/// tightest resource deciding.
pub fn calculate_max_capacity(
    usage: &SystemResourceUsage,
    default_quota: &ResourceQuota,
    factors: LoadFactors,
) -> i64 {
    let per_bundle = quota_percentages(default_quota, usage, factors);
    let mut capacity = MAX_BROKER_CAPACITY;
    for pct in [
        per_bundle.cpu,
        per_bundle.memory,
        per_bundle.bandwidth_in,
        per_bundle.bandwidth_out,
    ] {
        if pct > 0.0 {
            capacity = capacity.min((100.0 / pct) as i64);
        }
    }
    capacity
}

/// Derived per-broker score: actual usage plus the quota of everything the
/// broker carries or was just handed.
///
/// `estimated_load_percentage` takes, per resource, the worse of the actual
/// gauge and the quota-implied percentage, so a fresh pre-allocation cannot
/// hide behind a stale report.
#[derive(Debug, Clone)]
pub struct ResourceUnitRanking {
    pub broker: String,
    pub system_usage: SystemResourceUsage,
    pub loaded_bundles: BTreeSet<String>,
    pub allocated_quota: ResourceQuota,
    pub pre_allocated_bundles: BTreeSet<String>,
    pub pre_allocated_quota: ResourceQuota,
    factors: LoadFactors,
    estimated_load_pct: f64,
    max_capacity: i64,
}

impl ResourceUnitRanking {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: String,
        system_usage: SystemResourceUsage,
        loaded_bundles: BTreeSet<String>,
        allocated_quota: ResourceQuota,
        pre_allocated_bundles: BTreeSet<String>,
        pre_allocated_quota: ResourceQuota,
        factors: LoadFactors,
        default_quota: &ResourceQuota,
    ) -> Self {
        let max_capacity = calculate_max_capacity(&system_usage, default_quota, factors);
        let mut ranking = Self {
            broker,
            system_usage,
            loaded_bundles,
            allocated_quota,
            pre_allocated_bundles,
            pre_allocated_quota,
            factors,
            estimated_load_pct: 0.0,
            max_capacity,
        };
        ranking.re_estimate();
        ranking
    }

    fn combined_quota(&self) -> ResourceQuota {
        let mut total = self.allocated_quota.clone();
        total.add(&self.pre_allocated_quota);
        total
    }

    fn re_estimate(&mut self) {
        let quota_pcts = quota_percentages(&self.combined_quota(), &self.system_usage, self.factors);
        let actual = self.system_usage.max_percent_usage();
        self.estimated_load_pct = actual.max(quota_pcts.max());
    }

    pub fn estimated_load_percentage(&self) -> f64 {
        self.estimated_load_pct
    }

    /// Total bundle capacity of the broker, in default-quota units.
    pub fn estimated_max_capacity(&self) -> i64 {
        self.max_capacity
    }

    /// Percentages implied by the allocated + pre-allocated quota, for the
    /// metrics surface.
    pub fn allocated_quota_percentages(&self) -> QuotaPercentages {
        quota_percentages(&self.combined_quota(), &self.system_usage, self.factors)
    }

    pub fn is_idle(&self) -> bool {
        self.loaded_bundles.is_empty() && self.pre_allocated_bundles.is_empty()
    }

    pub fn is_pre_allocated(&self, bundle: &str) -> bool {
        self.pre_allocated_bundles.contains(bundle)
    }

    /// Record a fresh assignment so later placements in the same interval
    /// see the load before the next report lands.
    pub fn add_pre_allocated(&mut self, bundle: &str, quota: &ResourceQuota) {
        if self.pre_allocated_bundles.insert(bundle.to_string()) {
            self.pre_allocated_quota.add(quota);
            self.re_estimate();
        }
    }

    /// Forget a loaded bundle that is about to be placed elsewhere.
    pub fn remove_loaded(&mut self, bundle: &str, quota: &ResourceQuota) {
        if self.loaded_bundles.remove(bundle) {
            self.allocated_quota.subtract(quota);
            self.re_estimate();
        }
    }

    /// Lexicographic (load percentage, -max capacity).
    pub fn compare(&self, other: &Self) -> Ordering {
        self.estimated_load_pct
            .total_cmp(&other.estimated_load_pct)
            .then(other.max_capacity.cmp(&self.max_capacity))
    }
}

/// Ranks keyed ascending; each rank holds the brokers that share it.
pub type SortedRankings = BTreeMap<i64, BTreeSet<String>>;

/// One ranking pass over the current reports.
///
/// Pre-allocations survive from the previous pass minus whatever the owner
/// now reports as loaded, so `pre_allocated ∩ loaded = ∅` holds afterwards.
pub fn build_rankings(
    reports: &HashMap<String, LoadReport>,
    previous: &HashMap<String, ResourceUnitRanking>,
    estimator: &QuotaEstimator,
    rank_of: impl Fn(&ResourceUnitRanking) -> i64,
) -> (HashMap<String, ResourceUnitRanking>, SortedRankings) {
    let factors = estimator.factors();
    let default_quota = estimator.avg_quota().clone();

    let mut rankings = HashMap::with_capacity(reports.len());
    let mut sorted: SortedRankings = BTreeMap::new();

    for (broker, report) in reports {
        let loaded: BTreeSet<String> = report.bundle_stats.keys().cloned().collect();

        let pre_allocated: BTreeSet<String> = previous
            .get(broker)
            .map(|prev| {
                prev.pre_allocated_bundles
                    .iter()
                    .filter(|b| !loaded.contains(*b))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut allocated_quota = ResourceQuota::zero();
        for bundle in &loaded {
            allocated_quota.add(&estimator.quota_for(bundle));
        }
        let mut pre_allocated_quota = ResourceQuota::zero();
        for bundle in &pre_allocated {
            pre_allocated_quota.add(&estimator.quota_for(bundle));
        }

        let ranking = ResourceUnitRanking::new(
            broker.clone(),
            report.system_usage.clone(),
            loaded,
            allocated_quota,
            pre_allocated,
            pre_allocated_quota,
            factors,
            &default_quota,
        );

        let rank = rank_of(&ranking);
        sorted.entry(rank).or_default().insert(broker.clone());
        rankings.insert(broker.clone(), ranking);
    }

    (rankings, sorted)
}
