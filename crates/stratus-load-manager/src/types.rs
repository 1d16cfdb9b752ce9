use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use stratus_coordination::StoreError;
use thiserror::Error;

/// Bounds and timing constants of the controller.
pub mod constants {
    use std::time::Duration;

    pub const MIN_MSG_RATE: f64 = 5.0;
    pub const MAX_MSG_RATE: f64 = 5000.0;

    /// Bandwidth quota bounds, bytes/s.
    pub const MIN_BANDWIDTH: f64 = 10_000.0;
    pub const MAX_BANDWIDTH: f64 = 1_000_000.0;

    /// Memory quota bounds, MB.
    pub const MIN_MEMORY: f64 = 2.0;
    pub const MAX_MEMORY: f64 = 200.0;

    /// Expected CPU percent per msg/s.
    pub const MIN_CPU_FACTOR: f64 = 0.01;
    pub const MAX_CPU_FACTOR: f64 = 0.10;

    /// Expected MB per memory group.
    pub const MIN_MEM_FACTOR: f64 = 10.0;
    pub const MAX_MEM_FACTOR: f64 = 50.0;

    /// One memory group per this many topics + producers + consumers.
    pub const MEM_GROUP_ENTITY_COUNT: f64 = 500.0;

    /// Smoothing window when a sample rises above the current value.
    pub const RAMP_UP_WINDOW_MINUTES: f64 = 30.0;
    /// Smoothing window when a sample falls below the current value.
    pub const RAMP_DOWN_WINDOW_MINUTES: f64 = 1440.0;

    /// Minimum spacing between two load-report writes.
    pub const LOAD_REPORT_UPDATE_MIN_INTERVAL: Duration = Duration::from_secs(5);

    pub const ROTATION_CURSOR_MODULO: u64 = 1_000_000;

    /// Upper bound on the estimated bundle capacity of a single broker.
    pub const MAX_BROKER_CAPACITY: i64 = 1_000_000;
}

/// The five resource kinds every broker reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceType {
    Cpu,
    Memory,
    DirectMemory,
    BandwidthIn,
    BandwidthOut,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Cpu,
        ResourceType::Memory,
        ResourceType::DirectMemory,
        ResourceType::BandwidthIn,
        ResourceType::BandwidthOut,
    ];
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Cpu => write!(f, "cpu"),
            ResourceType::Memory => write!(f, "memory"),
            ResourceType::DirectMemory => write!(f, "directMemory"),
            ResourceType::BandwidthIn => write!(f, "bandwidthIn"),
            ResourceType::BandwidthOut => write!(f, "bandwidthOut"),
        }
    }
}

/// Usage of one resource. CPU is on a 0–100 scale, memory in MB,
/// bandwidth in Mbit/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub usage: f64,
    pub limit: f64,
}

impl ResourceUsage {
    pub fn new(usage: f64, limit: f64) -> Self {
        Self { usage, limit }
    }

    /// Percentage of the limit in use; an unknown limit (≤ 0) reads as 0.
    pub fn percent_usage(&self) -> f64 {
        if self.limit <= 0.0 {
            0.0
        } else {
            100.0 * self.usage / self.limit
        }
    }
}

/// Snapshot of a broker's five resource gauges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemResourceUsage {
    pub cpu: ResourceUsage,
    pub memory: ResourceUsage,
    pub direct_memory: ResourceUsage,
    pub bandwidth_in: ResourceUsage,
    pub bandwidth_out: ResourceUsage,
}

impl SystemResourceUsage {
    pub fn get(&self, kind: ResourceType) -> &ResourceUsage {
        match kind {
            ResourceType::Cpu => &self.cpu,
            ResourceType::Memory => &self.memory,
            ResourceType::DirectMemory => &self.direct_memory,
            ResourceType::BandwidthIn => &self.bandwidth_in,
            ResourceType::BandwidthOut => &self.bandwidth_out,
        }
    }

    /// The most loaded resource and its percentage.
    pub fn bottleneck(&self) -> (ResourceType, f64) {
        let mut worst = (ResourceType::Cpu, self.cpu.percent_usage());
        for kind in ResourceType::ALL {
            let pct = self.get(kind).percent_usage();
            if pct > worst.1 {
                worst = (kind, pct);
            }
        }
        worst
    }

    pub fn max_percent_usage(&self) -> f64 {
        self.bottleneck().1
    }
}

/// Traffic statistics of one namespace bundle, as counted by its owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceBundleStats {
    pub topics: u64,
    pub producer_count: u64,
    pub consumer_count: u64,
    pub msg_rate_in: f64,
    pub msg_rate_out: f64,
    pub msg_throughput_in: f64,
    pub msg_throughput_out: f64,
}

impl NamespaceBundleStats {
    pub fn sessions(&self) -> u64 {
        self.producer_count + self.consumer_count
    }

    /// `1 + (topics + producers + consumers) / 500`
    pub fn memory_groups(&self) -> f64 {
        1.0 + (self.topics + self.producer_count + self.consumer_count) as f64
            / constants::MEM_GROUP_ENTITY_COUNT
    }
}

/// Resource quota of a bundle (or the cluster default). Rates in msg/s,
/// bandwidth in bytes/s, memory in MB. A non-dynamic quota is pinned by an
/// administrator and exempt from smoothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuota {
    pub msg_rate_in: f64,
    pub msg_rate_out: f64,
    pub bandwidth_in: f64,
    pub bandwidth_out: f64,
    pub memory: f64,
    pub dynamic: bool,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            msg_rate_in: 40.0,
            msg_rate_out: 120.0,
            bandwidth_in: 100_000.0,
            bandwidth_out: 300_000.0,
            memory: 80.0,
            dynamic: true,
        }
    }
}

impl ResourceQuota {
    pub fn zero() -> Self {
        Self {
            msg_rate_in: 0.0,
            msg_rate_out: 0.0,
            bandwidth_in: 0.0,
            bandwidth_out: 0.0,
            memory: 0.0,
            dynamic: true,
        }
    }

    /// Field-wise sum; `dynamic` follows the receiver.
    pub fn add(&mut self, other: &ResourceQuota) {
        self.msg_rate_in += other.msg_rate_in;
        self.msg_rate_out += other.msg_rate_out;
        self.bandwidth_in += other.bandwidth_in;
        self.bandwidth_out += other.bandwidth_out;
        self.memory += other.memory;
    }

    /// Field-wise difference, floored at zero.
    pub fn subtract(&mut self, other: &ResourceQuota) {
        self.msg_rate_in = (self.msg_rate_in - other.msg_rate_in).max(0.0);
        self.msg_rate_out = (self.msg_rate_out - other.msg_rate_out).max(0.0);
        self.bandwidth_in = (self.bandwidth_in - other.bandwidth_in).max(0.0);
        self.bandwidth_out = (self.bandwidth_out - other.bandwidth_out).max(0.0);
        self.memory = (self.memory - other.memory).max(0.0);
    }

    /// Clamp every field into its [MIN, MAX] band.
    pub fn clamp_fields(&mut self) {
        use constants::*;
        self.msg_rate_in = self.msg_rate_in.clamp(MIN_MSG_RATE, MAX_MSG_RATE);
        self.msg_rate_out = self.msg_rate_out.clamp(MIN_MSG_RATE, MAX_MSG_RATE);
        self.bandwidth_in = self.bandwidth_in.clamp(MIN_BANDWIDTH, MAX_BANDWIDTH);
        self.bandwidth_out = self.bandwidth_out.clamp(MIN_BANDWIDTH, MAX_BANDWIDTH);
        self.memory = self.memory.clamp(MIN_MEMORY, MAX_MEMORY);
    }

    pub fn total_msg_rate(&self) -> f64 {
        self.msg_rate_in + self.msg_rate_out
    }
}

/// Identifier of a service unit:
/// `property/cluster/namespace/0xHHHHHHHH_0xHHHHHHHH`.
///
/// The range token is validated for shape and otherwise treated as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceUnitId(String);

impl ServiceUnitId {
    /// Full bundle id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace name: everything before the last `/`.
    pub fn namespace(&self) -> &str {
        self.0.rsplit_once('/').map(|(ns, _)| ns).unwrap_or(&self.0)
    }

    /// The opaque hash-range token after the last `/`.
    pub fn range(&self) -> &str {
        self.0.rsplit_once('/').map(|(_, r)| r).unwrap_or("")
    }
}

impl fmt::Display for ServiceUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceUnitId {
    type Err = LoadManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() < 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(LoadManagerError::InvalidServiceUnitId(s.to_string()));
        }
        let range = parts[parts.len() - 1];
        if !is_valid_range_token(range) {
            return Err(LoadManagerError::InvalidServiceUnitId(s.to_string()));
        }
        Ok(ServiceUnitId(s.to_string()))
    }
}

fn is_valid_range_token(token: &str) -> bool {
    match token.split_once('_') {
        Some((lo, hi)) => is_hex_bound(lo) && is_hex_bound(hi),
        None => false,
    }
}

fn is_hex_bound(part: &str) -> bool {
    part.strip_prefix("0x")
        .map(|digits| digits.len() == 8 && digits.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// Error types for the load manager
#[derive(Debug, Error)]
pub enum LoadManagerError {
    #[error("Invalid service unit id: '{0}'")]
    InvalidServiceUnitId(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Admin call failed: {0}")]
    Admin(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
