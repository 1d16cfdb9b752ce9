pub mod least_loaded;
pub mod weighted_random;

use crate::ranking::ResourceUnitRanking;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Selected placement strategy, as persisted under
/// `/loadbalance/settings/strategy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadBalancerStrategy {
    #[serde(rename = "leastLoadedServer")]
    LeastLoadedServer,
    #[serde(rename = "weightedRandomSelection")]
    WeightedRandomSelection,
}

impl Default for LoadBalancerStrategy {
    fn default() -> Self {
        Self::LeastLoadedServer
    }
}

/// Load levels steering the least-loaded decision table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionThresholds {
    pub underload_pct: f64,
    pub overload_pct: f64,
}

/// Common trait both placement strategies implement: a rank for the
/// published sorted-rankings snapshot, and a pick among filtered candidates.
pub trait PlacementStrategy: Send + Sync {
    /// Name of this strategy for logging
    fn name(&self) -> &'static str;

    /// Rank of one broker; keys the `SortedRankings` mapping.
    fn rank(&self, ranking: &ResourceUnitRanking) -> i64;

    /// Choose a broker from `candidates` (sorted broker names resolving
    /// into `rankings`). `rotation_cursor` drives deterministic tie-breaks.
    fn pick(
        &self,
        rankings: &HashMap<String, ResourceUnitRanking>,
        candidates: &[String],
        rotation_cursor: u64,
        thresholds: &SelectionThresholds,
    ) -> Option<String>;
}

/// Instantiate the strategy selected by configuration.
pub fn strategy_for(kind: LoadBalancerStrategy) -> Box<dyn PlacementStrategy> {
    match kind {
        LoadBalancerStrategy::LeastLoadedServer => {
            Box::new(least_loaded::LeastLoadedServer::new())
        }
        LoadBalancerStrategy::WeightedRandomSelection => {
            Box::new(weighted_random::WeightedRandomSelection::new())
        }
    }
}
