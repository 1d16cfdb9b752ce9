use crate::report::LoadReport;
use crate::types::ServiceUnitId;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Per-bundle size limits; crossing any of them marks the bundle for a
/// split.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitLimits {
    pub max_topics: u64,
    pub max_sessions: u64,
    pub max_msg_rate: f64,
    /// Bytes/s of combined throughput.
    pub max_bandwidth: f64,
    /// Hard cap on bundles per namespace.
    pub max_bundle_count: usize,
}

/// Detects oversized bundles in the local broker's report.
pub struct BundleSplitter {
    limits: SplitLimits,
}

impl BundleSplitter {
    pub fn new(limits: SplitLimits) -> Self {
        Self { limits }
    }

    /// Count bundles per namespace across the whole cluster's reports.
    pub fn namespace_bundle_counts(
        reports: &HashMap<String, LoadReport>,
    ) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for report in reports.values() {
            for bundle in report.bundle_stats.keys() {
                if let Ok(id) = bundle.parse::<ServiceUnitId>() {
                    *counts.entry(id.namespace().to_string()).or_default() += 1;
                }
            }
        }
        counts
    }

    /// Bundles of `local` that should split. A namespace never exceeds
    /// `max_bundle_count`, including splits issued within this same pass:
    /// every selection counts against the cap immediately, whether or not
    /// the split RPC later succeeds.
    pub fn find_bundles_to_split(
        &self,
        local: &LoadReport,
        namespace_counts: &HashMap<String, usize>,
    ) -> Vec<ServiceUnitId> {
        let mut counts = namespace_counts.clone();
        let mut to_split = Vec::new();

        let mut bundles: Vec<&String> = local.bundle_stats.keys().collect();
        bundles.sort();

        for bundle in bundles {
            let stats = &local.bundle_stats[bundle];

            let oversized = stats.topics > self.limits.max_topics
                || stats.sessions() > self.limits.max_sessions
                || stats.msg_rate_in + stats.msg_rate_out > self.limits.max_msg_rate
                || stats.msg_throughput_in + stats.msg_throughput_out
                    > self.limits.max_bandwidth;
            if !oversized {
                continue;
            }

            // A single-topic bundle has nothing to split along
            if stats.topics <= 1 {
                continue;
            }

            let id = match bundle.parse::<ServiceUnitId>() {
                Ok(id) => id,
                Err(e) => {
                    warn!(bundle = %bundle, error = %e, "unsplittable bundle id");
                    continue;
                }
            };

            let count = counts.entry(id.namespace().to_string()).or_default();
            if *count >= self.limits.max_bundle_count {
                debug!(
                    namespace = id.namespace(),
                    count = *count,
                    "namespace at bundle cap, split suppressed"
                );
                continue;
            }
            // A split replaces one bundle with two
            *count += 1;

            to_split.push(id);
        }

        to_split
    }
}
