use crate::report::LoadReport;
use crate::types::{NamespaceBundleStats, ResourceType};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One bundle chosen for eviction from an overloaded broker.
#[derive(Debug, Clone, PartialEq)]
pub struct UnloadDecision {
    pub broker: String,
    pub broker_web_addr: String,
    pub bundle: String,
    pub bottleneck: ResourceType,
    pub bottleneck_pct: f64,
}

/// Picks at most one bundle per overloaded broker whose removal relieves
/// the bottleneck resource, and refuses to touch a bundle twice within the
/// grace period.
pub struct LoadShedder {
    recently_unloaded: DashMap<String, Instant>,
    grace_period: Duration,
}

impl LoadShedder {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            recently_unloaded: DashMap::new(),
            grace_period,
        }
    }

    /// A bundle's share of one resource kind.
    fn contribution(kind: ResourceType, stats: &NamespaceBundleStats) -> f64 {
        match kind {
            ResourceType::Cpu | ResourceType::DirectMemory => {
                stats.msg_rate_in + stats.msg_rate_out
            }
            ResourceType::BandwidthIn => stats.msg_throughput_in,
            ResourceType::BandwidthOut => stats.msg_throughput_out,
            ResourceType::Memory => (stats.topics + stats.sessions()) as f64,
        }
    }

    /// Somewhere to put the load: another broker below the comfort
    /// threshold on every resource.
    fn rebalancing_target_exists(
        reports: &HashMap<String, LoadReport>,
        overloaded_broker: &str,
        comfort_pct: f64,
    ) -> bool {
        reports.iter().any(|(name, report)| {
            name != overloaded_broker
                && ResourceType::ALL
                    .iter()
                    .all(|kind| report.system_usage.get(*kind).percent_usage() < comfort_pct)
        })
    }

    /// Scan the current reports and pick victims. Pure against the grace
    /// map: entries are only recorded via [`record_unloaded`] after the
    /// unload RPC actually succeeded.
    ///
    /// [`record_unloaded`]: LoadShedder::record_unloaded
    pub fn find_bundles_to_unload(
        &self,
        reports: &HashMap<String, LoadReport>,
        overload_pct: f64,
        comfort_pct: f64,
    ) -> Vec<UnloadDecision> {
        let mut decisions = Vec::new();

        let mut brokers: Vec<&String> = reports.keys().collect();
        brokers.sort();

        for broker in brokers {
            let report = &reports[broker];
            let (bottleneck, pct) = report.system_usage.bottleneck();
            if pct <= overload_pct {
                continue;
            }

            if report.bundle_stats.len() <= 1 {
                warn!(
                    broker = %broker,
                    bottleneck = %bottleneck,
                    pct,
                    "broker overloaded but owns a single bundle, nothing to shed"
                );
                continue;
            }

            if !Self::rebalancing_target_exists(reports, broker, comfort_pct) {
                debug!(broker = %broker, "no broker below comfort threshold, skipping shed");
                continue;
            }

            let mut bundles: Vec<(&String, f64)> = report
                .bundle_stats
                .iter()
                .map(|(bundle, stats)| (bundle, Self::contribution(bottleneck, stats)))
                .collect();
            bundles.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(b.0)));

            for (bundle, _) in bundles {
                if self.in_grace_period(bundle) {
                    continue;
                }
                decisions.push(UnloadDecision {
                    broker: broker.clone(),
                    broker_web_addr: report.broker.web_addr.clone(),
                    bundle: bundle.clone(),
                    bottleneck,
                    bottleneck_pct: pct,
                });
                break;
            }
        }

        decisions
    }

    /// Start the grace period for a bundle whose unload went through.
    pub fn record_unloaded(&self, bundle: &str) {
        self.recently_unloaded
            .insert(bundle.to_string(), Instant::now());
    }

    fn in_grace_period(&self, bundle: &str) -> bool {
        if let Some(entry) = self.recently_unloaded.get(bundle) {
            if entry.elapsed() < self.grace_period {
                return true;
            }
        }
        // Clean up the expired entry
        self.recently_unloaded.remove(bundle);
        false
    }

    /// Drop every expired grace entry.
    pub fn purge_expired(&self) {
        let grace = self.grace_period;
        self.recently_unloaded
            .retain(|_, stamp| stamp.elapsed() < grace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::BrokerInfo;
    use crate::types::{ResourceUsage, SystemResourceUsage};

    fn broker_info(name: &str) -> BrokerInfo {
        BrokerInfo {
            broker_name: name.to_string(),
            web_addr: format!("http://{name}"),
            web_addr_tls: None,
            broker_addr: format!("stratus://{name}"),
            broker_addr_tls: None,
        }
    }

    fn report(name: &str, bw_out_pct: f64, bundles: Vec<(&str, f64)>) -> LoadReport {
        LoadReport {
            broker: broker_info(name),
            timestamp: 1_000_000,
            system_usage: SystemResourceUsage {
                cpu: ResourceUsage::new(10.0, 100.0),
                memory: ResourceUsage::new(100.0, 8192.0),
                direct_memory: ResourceUsage::new(0.0, 4096.0),
                bandwidth_in: ResourceUsage::new(10.0, 1000.0),
                bandwidth_out: ResourceUsage::new(bw_out_pct * 10.0, 1000.0),
            },
            bundle_stats: bundles
                .into_iter()
                .map(|(bundle, throughput_out)| {
                    (
                        bundle.to_string(),
                        NamespaceBundleStats {
                            topics: 2,
                            msg_throughput_out: throughput_out,
                            ..Default::default()
                        },
                    )
                })
                .collect(),
            overloaded: false,
            underloaded: false,
        }
    }

    fn cluster() -> HashMap<String, LoadReport> {
        [
            (
                "a:8080".to_string(),
                report("a:8080", 20.0, vec![("acme/east/ns/0x00000000_0x40000000", 100.0)]),
            ),
            (
                "b:8080".to_string(),
                report(
                    "b:8080",
                    90.0, // past an 85% overload threshold
                    vec![
                        ("acme/east/ns/0x40000000_0x80000000", 8000.0),
                        ("acme/east/ns/0x80000000_0xc0000000", 1000.0),
                        ("acme/east/ns/0xc0000000_0xffffffff", 1000.0),
                    ],
                ),
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_picks_top_contributor_of_bottleneck() {
        let shedder = LoadShedder::new(Duration::from_secs(1800));
        let decisions = shedder.find_bundles_to_unload(&cluster(), 85.0, 65.0);

        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].broker, "b:8080");
        assert_eq!(decisions[0].bundle, "acme/east/ns/0x40000000_0x80000000");
        assert_eq!(decisions[0].bottleneck, ResourceType::BandwidthOut);
    }

    #[test]
    fn test_grace_period_suppresses_repeat() {
        let shedder = LoadShedder::new(Duration::from_secs(1800));
        let reports = cluster();

        let first = shedder.find_bundles_to_unload(&reports, 85.0, 65.0);
        shedder.record_unloaded(&first[0].bundle);

        // Next-highest contributor is picked instead; with ties the id
        // breaks them deterministically
        let second = shedder.find_bundles_to_unload(&reports, 85.0, 65.0);
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].bundle, first[0].bundle);

        shedder.record_unloaded(&second[0].bundle);
        let third = shedder.find_bundles_to_unload(&reports, 85.0, 65.0);
        shedder.record_unloaded(&third[0].bundle);

        // Every bundle of the broker is now in its grace period
        assert!(shedder.find_bundles_to_unload(&reports, 85.0, 65.0).is_empty());
    }

    #[test]
    fn test_grace_period_expires() {
        let shedder = LoadShedder::new(Duration::from_millis(0));
        let reports = cluster();

        let first = shedder.find_bundles_to_unload(&reports, 85.0, 65.0);
        shedder.record_unloaded(&first[0].bundle);

        // Zero grace period: the same bundle is immediately eligible again
        let second = shedder.find_bundles_to_unload(&reports, 85.0, 65.0);
        assert_eq!(second[0].bundle, first[0].bundle);
    }

    #[test]
    fn test_single_bundle_broker_skipped() {
        let reports: HashMap<String, LoadReport> = [
            (
                "a:8080".to_string(),
                report("a:8080", 95.0, vec![("acme/east/ns/0x00000000_0x40000000", 9000.0)]),
            ),
            (
                "b:8080".to_string(),
                report("b:8080", 10.0, vec![("acme/east/ns/0x40000000_0x80000000", 10.0)]),
            ),
        ]
        .into_iter()
        .collect();

        let shedder = LoadShedder::new(Duration::from_secs(1800));
        assert!(shedder.find_bundles_to_unload(&reports, 85.0, 65.0).is_empty());
    }

    #[test]
    fn test_no_comfortable_target_no_shed() {
        // Every broker runs hot: shedding would just move the problem
        let reports: HashMap<String, LoadReport> = [
            (
                "a:8080".to_string(),
                report(
                    "a:8080",
                    90.0,
                    vec![
                        ("acme/east/ns/0x00000000_0x40000000", 8000.0),
                        ("acme/east/ns/0x40000000_0x80000000", 1000.0),
                    ],
                ),
            ),
            (
                "b:8080".to_string(),
                report(
                    "b:8080",
                    88.0,
                    vec![
                        ("acme/east/ns/0x80000000_0xc0000000", 8000.0),
                        ("acme/east/ns/0xc0000000_0xffffffff", 1000.0),
                    ],
                ),
            ),
        ]
        .into_iter()
        .collect();

        let shedder = LoadShedder::new(Duration::from_secs(1800));
        assert!(shedder.find_bundles_to_unload(&reports, 85.0, 65.0).is_empty());
    }
}
