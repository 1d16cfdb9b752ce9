use crate::types::{NamespaceBundleStats, ResourceType, SystemResourceUsage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Addresses a broker advertises in its load report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerInfo {
    /// `<host>:<port>`, also the broker's node name under
    /// `/loadbalance/brokers`.
    pub broker_name: String,
    pub web_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_addr_tls: Option<String>,
    pub broker_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_addr_tls: Option<String>,
}

impl BrokerInfo {
    pub fn host(&self) -> &str {
        self.broker_name
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.broker_name)
    }
}

/// A broker's periodic self-report, replicated through the coordination
/// store. Timestamps are epoch milliseconds and monotonic per broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    #[serde(flatten)]
    pub broker: BrokerInfo,
    pub timestamp: i64,
    pub system_usage: SystemResourceUsage,
    #[serde(default)]
    pub bundle_stats: HashMap<String, NamespaceBundleStats>,
    pub overloaded: bool,
    pub underloaded: bool,
}

impl LoadReport {
    /// Build a report from the current gauges and per-bundle counters.
    pub fn generate(
        broker: BrokerInfo,
        system_usage: SystemResourceUsage,
        bundle_stats: HashMap<String, NamespaceBundleStats>,
        overload_threshold_pct: f64,
        underload_threshold_pct: f64,
    ) -> Self {
        let max_pct = system_usage.max_percent_usage();
        Self {
            broker,
            timestamp: chrono::Utc::now().timestamp_millis(),
            system_usage,
            bundle_stats,
            overloaded: max_pct > overload_threshold_pct,
            underloaded: max_pct < underload_threshold_pct,
        }
    }

    pub fn bundle_count(&self) -> usize {
        self.bundle_stats.len()
    }

    /// Sum of a per-bundle metric across the whole report.
    pub fn total_msg_rate(&self) -> f64 {
        self.bundle_stats
            .values()
            .map(|s| s.msg_rate_in + s.msg_rate_out)
            .sum()
    }
}

/// Source of the local host's resource gauges. The OS probe itself lives
/// outside this crate; embedding code pushes snapshots through this seam.
pub trait SystemResourceProvider: Send + Sync {
    fn usage(&self) -> SystemResourceUsage;
}

/// Fixed provider fed by the embedder (and by tests).
#[derive(Default)]
pub struct StaticResourceProvider {
    usage: parking_lot::RwLock<SystemResourceUsage>,
}

impl StaticResourceProvider {
    pub fn new(usage: SystemResourceUsage) -> Self {
        Self {
            usage: parking_lot::RwLock::new(usage),
        }
    }

    pub fn set(&self, usage: SystemResourceUsage) {
        *self.usage.write() = usage;
    }
}

impl SystemResourceProvider for StaticResourceProvider {
    fn usage(&self) -> SystemResourceUsage {
        self.usage.read().clone()
    }
}

/// Whether `current` diverges enough from the last written report to be
/// worth another store write.
///
/// Triggers: nothing written yet, the max-interval deadline passed, the
/// bundle count moved by more than `threshold_pct` of the broker's estimated
/// capacity, or any resource gauge moved by more than `threshold_pct` of its
/// limit. The force flag and the 5 s minimum spacing live with the caller.
pub fn needs_update(
    last: Option<&LoadReport>,
    current: &LoadReport,
    estimated_capacity: i64,
    threshold_pct: f64,
    max_interval: Duration,
) -> bool {
    let last = match last {
        Some(last) => last,
        None => return true,
    };

    let elapsed_ms = current.timestamp.saturating_sub(last.timestamp);
    if elapsed_ms >= max_interval.as_millis() as i64 {
        return true;
    }

    let capacity = estimated_capacity.max(1) as f64;
    let bundle_delta = current.bundle_count().abs_diff(last.bundle_count()) as f64;
    if 100.0 * bundle_delta / capacity > threshold_pct {
        return true;
    }

    for kind in ResourceType::ALL {
        let old = last.system_usage.get(kind);
        let new = current.system_usage.get(kind);
        if new.limit <= 0.0 {
            continue;
        }
        let change_pct = 100.0 * (new.usage - old.usage).abs() / new.limit;
        if change_pct > threshold_pct {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceUsage;

    fn broker() -> BrokerInfo {
        BrokerInfo {
            broker_name: "b1.example.com:8080".to_string(),
            web_addr: "http://b1.example.com:8080".to_string(),
            web_addr_tls: None,
            broker_addr: "stratus://b1.example.com:6650".to_string(),
            broker_addr_tls: None,
        }
    }

    fn usage(cpu: f64) -> SystemResourceUsage {
        SystemResourceUsage {
            cpu: ResourceUsage::new(cpu, 100.0),
            memory: ResourceUsage::new(1000.0, 8192.0),
            direct_memory: ResourceUsage::new(100.0, 4096.0),
            bandwidth_in: ResourceUsage::new(50.0, 1000.0),
            bandwidth_out: ResourceUsage::new(50.0, 1000.0),
        }
    }

    fn report(cpu: f64, bundles: usize) -> LoadReport {
        let stats = (0..bundles)
            .map(|i| {
                (
                    format!("acme/east/ns/0x{:08x}_0xffffffff", i),
                    NamespaceBundleStats::default(),
                )
            })
            .collect();
        LoadReport::generate(broker(), usage(cpu), stats, 85.0, 50.0)
    }

    #[test]
    fn test_overload_underload_flags() {
        assert!(report(90.0, 1).overloaded);
        assert!(!report(90.0, 1).underloaded);
        assert!(report(20.0, 1).underloaded);
        assert!(!report(60.0, 1).overloaded);
        assert!(!report(60.0, 1).underloaded);
    }

    #[test]
    fn test_first_report_always_written() {
        let current = report(10.0, 1);
        assert!(needs_update(None, &current, 100, 10.0, Duration::from_secs(900)));
    }

    #[test]
    fn test_small_change_suppressed() {
        let last = report(50.0, 10);
        let current = report(52.0, 10);
        assert!(!needs_update(
            Some(&last),
            &current,
            100,
            10.0,
            Duration::from_secs(900)
        ));
    }

    #[test]
    fn test_resource_jump_triggers() {
        let last = report(50.0, 10);
        let current = report(75.0, 10);
        assert!(needs_update(
            Some(&last),
            &current,
            100,
            10.0,
            Duration::from_secs(900)
        ));
    }

    #[test]
    fn test_bundle_count_change_triggers() {
        let last = report(50.0, 10);
        let current = report(50.0, 40);
        // 30 new bundles against a capacity of 100 is a 30% shift
        assert!(needs_update(
            Some(&last),
            &current,
            100,
            10.0,
            Duration::from_secs(900)
        ));
    }

    #[test]
    fn test_max_interval_triggers() {
        let mut last = report(50.0, 10);
        last.timestamp -= 16 * 60 * 1000;
        let current = report(50.0, 10);
        assert!(needs_update(
            Some(&last),
            &current,
            100,
            10.0,
            Duration::from_secs(900)
        ));
    }

    #[test]
    fn test_report_wire_format_field_names() {
        let report = report(42.0, 1);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("brokerName").is_some());
        assert!(json.get("webAddr").is_some());
        assert!(json.get("systemUsage").is_some());
        assert!(json.get("bundleStats").is_some());
        assert!(json["systemUsage"].get("directMemory").is_some());
        assert!(json["systemUsage"].get("bandwidthIn").is_some());

        let back: LoadReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
