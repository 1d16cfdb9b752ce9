use crate::report::LoadReport;
use crate::types::constants::*;
use crate::types::ResourceQuota;
use std::collections::HashMap;
use tracing::debug;

/// Cluster-wide conversion factors between traffic and machine resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadFactors {
    /// Expected CPU percent per msg/s.
    pub cpu: f64,
    /// Expected MB per memory group.
    pub mem: f64,
}

impl Default for LoadFactors {
    fn default() -> Self {
        Self {
            cpu: 0.025,
            mem: 25.0,
        }
    }
}

/// Exponentially-weighted update with asymmetric windows: a rising sample
/// is absorbed over 30 minutes, a falling one over a full day. Spikes damp,
/// genuine growth lands fast.
fn smooth(old: f64, sample: f64, minutes_past: f64) -> f64 {
    let window = if sample >= old {
        RAMP_UP_WINDOW_MINUTES
    } else {
        RAMP_DOWN_WINDOW_MINUTES
    };
    let weight = (minutes_past / window).clamp(0.0, 1.0);
    (1.0 - weight) * old + weight * sample
}

/// Smoothed estimate of cluster load factors, the default bundle quota and
/// every bundle's individual quota, fed by each ranking pass.
pub struct QuotaEstimator {
    factors: LoadFactors,
    avg_quota: ResourceQuota,
    quota_by_bundle: HashMap<String, ResourceQuota>,
    last_update_millis: Option<i64>,
}

impl QuotaEstimator {
    pub fn new() -> Self {
        Self {
            factors: LoadFactors::default(),
            avg_quota: ResourceQuota::default(),
            quota_by_bundle: HashMap::new(),
            last_update_millis: None,
        }
    }

    pub fn factors(&self) -> LoadFactors {
        self.factors
    }

    pub fn avg_quota(&self) -> &ResourceQuota {
        &self.avg_quota
    }

    /// Quota for a bundle, falling back to the cluster average.
    pub fn quota_for(&self, bundle: &str) -> ResourceQuota {
        self.quota_by_bundle
            .get(bundle)
            .cloned()
            .unwrap_or_else(|| self.avg_quota.clone())
    }

    pub fn bundle_quotas(&self) -> &HashMap<String, ResourceQuota> {
        &self.quota_by_bundle
    }

    /// Restore persisted state at startup.
    pub fn restore(&mut self, factors: LoadFactors, avg_quota: Option<ResourceQuota>) {
        self.factors.cpu = factors.cpu.clamp(MIN_CPU_FACTOR, MAX_CPU_FACTOR);
        self.factors.mem = factors.mem.clamp(MIN_MEM_FACTOR, MAX_MEM_FACTOR);
        if let Some(quota) = avg_quota {
            self.avg_quota = quota;
        }
    }

    /// Pin or replace one bundle's quota (administrator override when
    /// `dynamic = false`).
    pub fn set_bundle_quota(&mut self, bundle: &str, quota: ResourceQuota) {
        self.quota_by_bundle.insert(bundle.to_string(), quota);
    }

    /// One estimation tick over the current set of load reports.
    pub fn update(&mut self, reports: &HashMap<String, LoadReport>) {
        let latest_ts = match reports.values().map(|r| r.timestamp).max() {
            Some(ts) => ts,
            None => return,
        };

        let minutes_past = match self.last_update_millis {
            None => 0.0,
            Some(prev) => (latest_ts - prev).max(0) as f64 / 60_000.0,
        };

        let mut total_msg_rate_in = 0.0;
        let mut total_msg_rate_out = 0.0;
        let mut total_bandwidth_in = 0.0;
        let mut total_bandwidth_out = 0.0;
        let mut total_mem_groups = 0.0;
        let mut total_bundles = 0usize;
        let mut total_cpu_usage = 0.0;
        let mut total_memory_usage = 0.0;

        for report in reports.values() {
            total_cpu_usage += report.system_usage.cpu.usage;
            total_memory_usage += report.system_usage.memory.usage;
            for stats in report.bundle_stats.values() {
                total_msg_rate_in += stats.msg_rate_in;
                total_msg_rate_out += stats.msg_rate_out;
                total_bandwidth_in += stats.msg_throughput_in;
                total_bandwidth_out += stats.msg_throughput_out;
                total_mem_groups += stats.memory_groups();
                total_bundles += 1;
            }
        }

        let total_msg_rate = total_msg_rate_in + total_msg_rate_out;

        // Factors only move when the cluster carries enough traffic for the
        // ratios to mean anything.
        if total_msg_rate > 1000.0 && total_mem_groups > 30.0 {
            let cpu_sample =
                (total_cpu_usage / total_msg_rate).clamp(MIN_CPU_FACTOR, MAX_CPU_FACTOR);
            self.factors.cpu = smooth(self.factors.cpu, cpu_sample, minutes_past);

            let mem_sample =
                (total_memory_usage / total_mem_groups).clamp(MIN_MEM_FACTOR, MAX_MEM_FACTOR);
            self.factors.mem = smooth(self.factors.mem, mem_sample, minutes_past);

            debug!(
                cpu_factor = self.factors.cpu,
                mem_factor = self.factors.mem,
                "updated cluster load factors"
            );
        }

        if total_bundles > 30 && self.avg_quota.dynamic {
            let bundles = total_bundles as f64;
            let avg = &mut self.avg_quota;
            avg.msg_rate_in = smooth(
                avg.msg_rate_in,
                (total_msg_rate_in / bundles).clamp(MIN_MSG_RATE, MAX_MSG_RATE),
                minutes_past,
            );
            avg.msg_rate_out = smooth(
                avg.msg_rate_out,
                (total_msg_rate_out / bundles).clamp(MIN_MSG_RATE, MAX_MSG_RATE),
                minutes_past,
            );
            avg.bandwidth_in = smooth(
                avg.bandwidth_in,
                (total_bandwidth_in / bundles).clamp(MIN_BANDWIDTH, MAX_BANDWIDTH),
                minutes_past,
            );
            avg.bandwidth_out = smooth(
                avg.bandwidth_out,
                (total_bandwidth_out / bundles).clamp(MIN_BANDWIDTH, MAX_BANDWIDTH),
                minutes_past,
            );
            avg.memory = smooth(
                avg.memory,
                (total_mem_groups / bundles * self.factors.mem).clamp(MIN_MEMORY, MAX_MEMORY),
                minutes_past,
            );
        }

        for report in reports.values() {
            for (bundle, stats) in &report.bundle_stats {
                let entry = self
                    .quota_by_bundle
                    .entry(bundle.clone())
                    .or_insert_with(|| self.avg_quota.clone());
                if !entry.dynamic {
                    continue;
                }
                entry.msg_rate_in = smooth(
                    entry.msg_rate_in,
                    stats.msg_rate_in.clamp(MIN_MSG_RATE, MAX_MSG_RATE),
                    minutes_past,
                );
                entry.msg_rate_out = smooth(
                    entry.msg_rate_out,
                    stats.msg_rate_out.clamp(MIN_MSG_RATE, MAX_MSG_RATE),
                    minutes_past,
                );
                entry.bandwidth_in = smooth(
                    entry.bandwidth_in,
                    stats.msg_throughput_in.clamp(MIN_BANDWIDTH, MAX_BANDWIDTH),
                    minutes_past,
                );
                entry.bandwidth_out = smooth(
                    entry.bandwidth_out,
                    stats.msg_throughput_out.clamp(MIN_BANDWIDTH, MAX_BANDWIDTH),
                    minutes_past,
                );
                entry.memory = smooth(
                    entry.memory,
                    (stats.memory_groups() * self.factors.mem).clamp(MIN_MEMORY, MAX_MEMORY),
                    minutes_past,
                );
            }
        }

        self.last_update_millis = Some(latest_ts);
    }
}

impl Default for QuotaEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a smoothed factor moved enough to be worth a store write.
pub fn factor_dirty(old: f64, new: f64, min_delta: f64) -> bool {
    (new - old).abs() > min_delta
}

/// Whether a smoothed quota moved enough to be worth a store write: any
/// field shifted by more than its MIN constant.
///
/// `legacy_bandwidth_compare` reproduces a historical defect where the
/// inbound-bandwidth delta was taken against the OLD quota's outbound field;
/// the default compares like with like.
pub fn quota_dirty(old: &ResourceQuota, new: &ResourceQuota, legacy_bandwidth_compare: bool) -> bool {
    let old_bandwidth_in = if legacy_bandwidth_compare {
        old.bandwidth_out
    } else {
        old.bandwidth_in
    };
    (new.msg_rate_in - old.msg_rate_in).abs() > MIN_MSG_RATE
        || (new.msg_rate_out - old.msg_rate_out).abs() > MIN_MSG_RATE
        || (new.bandwidth_in - old_bandwidth_in).abs() > MIN_BANDWIDTH
        || (new.bandwidth_out - old.bandwidth_out).abs() > MIN_BANDWIDTH
        || (new.memory - old.memory).abs() > MIN_MEMORY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{BrokerInfo, LoadReport};
    use crate::types::{NamespaceBundleStats, ResourceUsage, SystemResourceUsage};

    fn broker(name: &str) -> BrokerInfo {
        BrokerInfo {
            broker_name: format!("{name}:8080"),
            web_addr: format!("http://{name}:8080"),
            web_addr_tls: None,
            broker_addr: format!("stratus://{name}:6650"),
            broker_addr_tls: None,
        }
    }

    /// One broker, one hot bundle: `msg_rate` msgs/s in, `cpu_pct` CPU,
    /// enough entities for ~100 memory groups.
    fn cluster_report(ts: i64, msg_rate: f64, cpu_pct: f64) -> HashMap<String, LoadReport> {
        let stats = NamespaceBundleStats {
            topics: 49_500,
            msg_rate_in: msg_rate,
            ..Default::default()
        };
        let report = LoadReport {
            broker: broker("b1"),
            timestamp: ts,
            system_usage: SystemResourceUsage {
                cpu: ResourceUsage::new(cpu_pct, 100.0),
                memory: ResourceUsage::new(2500.0, 8192.0),
                ..Default::default()
            },
            bundle_stats: [("acme/east/ns/0x00000000_0xffffffff".to_string(), stats)]
                .into_iter()
                .collect(),
            overloaded: false,
            underloaded: false,
        };
        [("b1:8080".to_string(), report)].into_iter().collect()
    }

    const FIVE_MINUTES_MS: i64 = 5 * 60 * 1000;

    #[test]
    fn test_first_tick_has_zero_weight() {
        let mut estimator = QuotaEstimator::new();
        let before = estimator.factors();
        estimator.update(&cluster_report(1_000_000, 3000.0, 90.0));
        // timePast is 0 on the first call, nothing moves yet
        assert_eq!(estimator.factors(), before);
    }

    #[test]
    fn test_cpu_factor_ramps_up_then_decays_slowly() {
        let mut estimator = QuotaEstimator::new();
        let initial = estimator.factors().cpu;
        let mut ts = 1_000_000;

        // High phase: sample 90/3000 = 0.03, above the 0.025 default
        for _ in 0..10 {
            estimator.update(&cluster_report(ts, 3000.0, 90.0));
            ts += FIVE_MINUTES_MS;
        }
        let peak = estimator.factors().cpu;
        assert!(peak > initial);
        assert!(peak < 0.03);

        // Low phase: sample 24/1200 = 0.02, below current, day-long window
        for _ in 0..10 {
            estimator.update(&cluster_report(ts, 1200.0, 24.0));
            ts += FIVE_MINUTES_MS;
        }
        let decayed = estimator.factors().cpu;
        assert!(decayed < peak);
        // 50 minutes against a 1440-minute window barely moves it
        assert!(peak - decayed < 0.001);

        assert!((MIN_CPU_FACTOR..=MAX_CPU_FACTOR).contains(&decayed));
    }

    #[test]
    fn test_factor_gate_blocks_quiet_clusters() {
        let mut estimator = QuotaEstimator::new();
        let before = estimator.factors();
        let mut ts = 1_000_000;
        for _ in 0..5 {
            // 300 msg/s is below the 1000 msg/s activity gate
            estimator.update(&cluster_report(ts, 300.0, 90.0));
            ts += FIVE_MINUTES_MS;
        }
        assert_eq!(estimator.factors(), before);
    }

    #[test]
    fn test_factor_clamped_against_extreme_samples() {
        let mut estimator = QuotaEstimator::new();
        let mut ts = 1_000_000;
        // Sample would be 100/1001 ≈ 0.0999 without clamping; push hours of it
        for _ in 0..100 {
            estimator.update(&cluster_report(ts, 1001.0, 10_000.0));
            ts += 60 * 60 * 1000;
        }
        let factors = estimator.factors();
        assert!(factors.cpu <= MAX_CPU_FACTOR);
        assert!(factors.mem >= MIN_MEM_FACTOR && factors.mem <= MAX_MEM_FACTOR);
    }

    #[test]
    fn test_smoothing_monotonic_under_rising_samples() {
        let mut estimator = QuotaEstimator::new();
        let mut ts = 1_000_000;
        let mut prev = estimator.factors().cpu;
        for _ in 0..20 {
            estimator.update(&cluster_report(ts, 2000.0, 80.0));
            let cur = estimator.factors().cpu;
            assert!(cur >= prev);
            prev = cur;
            ts += FIVE_MINUTES_MS;
        }
    }

    #[test]
    fn test_bundle_quota_follows_observed_traffic() {
        let mut estimator = QuotaEstimator::new();
        let mut ts = 1_000_000;
        for _ in 0..20 {
            estimator.update(&cluster_report(ts, 3000.0, 90.0));
            ts += 30 * 60 * 1000;
        }
        let quota = estimator.quota_for("acme/east/ns/0x00000000_0xffffffff");
        // Observed rate is far above the default, clamped to MAX
        assert!(quota.msg_rate_in > ResourceQuota::default().msg_rate_in);
        assert!(quota.msg_rate_in <= MAX_MSG_RATE);
        // Unknown bundles fall back to the cluster average
        assert_eq!(
            estimator.quota_for("acme/east/other/0x00000000_0xffffffff"),
            estimator.avg_quota().clone()
        );
    }

    #[test]
    fn test_static_quota_frozen() {
        let mut estimator = QuotaEstimator::new();
        let bundle = "acme/east/ns/0x00000000_0xffffffff";
        let pinned = ResourceQuota {
            dynamic: false,
            ..ResourceQuota::default()
        };
        estimator.set_bundle_quota(bundle, pinned.clone());

        let mut ts = 1_000_000;
        for _ in 0..10 {
            estimator.update(&cluster_report(ts, 3000.0, 90.0));
            ts += 30 * 60 * 1000;
        }
        assert_eq!(estimator.quota_for(bundle), pinned);
    }

    #[test]
    fn test_quota_dirty_thresholds() {
        let old = ResourceQuota::default();
        let mut new = old.clone();
        assert!(!quota_dirty(&old, &new, false));

        new.msg_rate_in += MIN_MSG_RATE + 1.0;
        assert!(quota_dirty(&old, &new, false));
    }

    #[test]
    fn test_quota_dirty_legacy_cross_field_compare() {
        // bandwidth_in == old bandwidth_out: clean under the legacy compare,
        // dirty under the corrected one
        let old = ResourceQuota {
            bandwidth_in: 100_000.0,
            bandwidth_out: 300_000.0,
            ..ResourceQuota::default()
        };
        let new = ResourceQuota {
            bandwidth_in: 300_000.0,
            bandwidth_out: 300_000.0,
            ..ResourceQuota::default()
        };
        assert!(!quota_dirty(&old, &new, true));
        assert!(quota_dirty(&old, &new, false));
    }
}
