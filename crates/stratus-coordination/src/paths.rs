//! Store path layout shared by every controller replica.

/// Container whose children are the ephemeral per-broker load reports,
/// named `<host>:<port>`.
pub const LOADBALANCE_BROKERS_ROOT: &str = "/loadbalance/brokers";

/// Selected placement strategy, JSON `{"loadBalancerStrategy": ...}`.
pub const SETTINGS_STRATEGY: &str = "/loadbalance/settings/strategy";

/// Smoothed cluster CPU factor, JSON `{"loadFactorCPU": <double>}`.
pub const SETTINGS_LOAD_FACTOR_CPU: &str = "/loadbalance/settings/load_factor_cpu";

/// Smoothed cluster memory factor, JSON `{"loadFactorMemory": <double>}`.
pub const SETTINGS_LOAD_FACTOR_MEM: &str = "/loadbalance/settings/load_factor_mem";

/// Smoothed default per-bundle quota.
pub const SETTINGS_DEFAULT_QUOTA: &str = "/loadbalance/settings/default_quota";

/// Root under which per-bundle quotas are written, one child per bundle.
pub const RESOURCE_QUOTA_ROOT: &str = "/loadbalance/resource-quota/namespace";

pub const SETTINGS_OVERLOAD_THRESHOLD: &str = "/loadbalance/settings/overload_threshold";
pub const SETTINGS_UNDERLOAD_THRESHOLD: &str = "/loadbalance/settings/underload_threshold";
pub const SETTINGS_COMFORT_LOAD_THRESHOLD: &str = "/loadbalance/settings/comfort_load_threshold";
pub const SETTINGS_AUTO_BUNDLE_SPLIT_ENABLED: &str =
    "/loadbalance/settings/auto_bundle_split_enabled";

/// Per-namespace isolation policies.
pub const SETTINGS_ISOLATION: &str = "/loadbalance/settings/isolation";

/// Root under which bundle ownership ephemerals live.
pub const NAMESPACE_OWNERS_ROOT: &str = "/namespace";

/// Presence of this node (any data) switches the load shedder to dry-run.
pub const FLAG_UNLOAD_DISABLED: &str = "/admin/flags/load-shedding-unload-disabled";

/// Path of a broker's own load-report ephemeral.
pub fn broker_report_path(broker: &str) -> String {
    format!("{}/{}", LOADBALANCE_BROKERS_ROOT, broker)
}

/// Path of the ownership ephemeral for a bundle id like
/// `property/cluster/namespace/0x00000000_0x80000000`.
pub fn bundle_owner_path(bundle: &str) -> String {
    format!("{}/{}", NAMESPACE_OWNERS_ROOT, bundle)
}

/// Path of the persisted quota for a bundle id.
pub fn bundle_quota_path(bundle: &str) -> String {
    format!("{}/{}", RESOURCE_QUOTA_ROOT, bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_report_path() {
        assert_eq!(
            broker_report_path("broker-1.example.com:8080"),
            "/loadbalance/brokers/broker-1.example.com:8080"
        );
    }

    #[test]
    fn test_bundle_owner_path() {
        assert_eq!(
            bundle_owner_path("prop/cluster/ns/0x00000000_0x80000000"),
            "/namespace/prop/cluster/ns/0x00000000_0x80000000"
        );
    }
}
