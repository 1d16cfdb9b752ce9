use super::{PlacementStrategy, SelectionThresholds};
use crate::ranking::ResourceUnitRanking;
use rand::Rng;
use std::collections::HashMap;

/// Weighted random selection: a broker's probability of being picked is
/// proportional to its rank, `capacity · idleRatio²`, so mostly-idle large
/// brokers absorb most new bundles without starving the rest.
pub struct WeightedRandomSelection;

impl WeightedRandomSelection {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WeightedRandomSelection {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementStrategy for WeightedRandomSelection {
    fn name(&self) -> &'static str {
        "weightedRandomSelection"
    }

    fn rank(&self, ranking: &ResourceUnitRanking) -> i64 {
        let idle_ratio =
            (100.0 - ranking.estimated_load_percentage()).max(0.0) / 100.0;
        (ranking.estimated_max_capacity() as f64 * idle_ratio * idle_ratio) as i64
    }

    fn pick(
        &self,
        rankings: &HashMap<String, ResourceUnitRanking>,
        candidates: &[String],
        _rotation_cursor: u64,
        _thresholds: &SelectionThresholds,
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let weights: Vec<i64> = candidates
            .iter()
            .map(|name| {
                rankings
                    .get(name)
                    .map(|r| self.rank(r).max(0))
                    .unwrap_or(0)
            })
            .collect();
        let total: i64 = weights.iter().sum();

        let mut rng = rand::thread_rng();
        if total <= 0 {
            // Whole pool saturated: fall back to a uniform pick
            let idx = rng.gen_range(0..candidates.len());
            return Some(candidates[idx].clone());
        }

        let mut remaining = rng.gen_range(0..total);
        for (name, weight) in candidates.iter().zip(&weights) {
            if remaining < *weight {
                return Some(name.clone());
            }
            remaining -= weight;
        }
        // Unreachable with total > 0; keep the last candidate as a guard
        Some(candidates[candidates.len() - 1].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::LoadFactors;
    use crate::types::{ResourceQuota, ResourceUsage, SystemResourceUsage};
    use std::collections::BTreeSet;

    fn thresholds() -> SelectionThresholds {
        SelectionThresholds {
            underload_pct: 50.0,
            overload_pct: 85.0,
        }
    }

    fn ranking(name: &str, cpu: f64) -> (String, ResourceUnitRanking) {
        let usage = SystemResourceUsage {
            cpu: ResourceUsage::new(cpu, 100.0),
            memory: ResourceUsage::new(0.0, 8192.0),
            direct_memory: ResourceUsage::new(0.0, 4096.0),
            bandwidth_in: ResourceUsage::new(0.0, 1000.0),
            bandwidth_out: ResourceUsage::new(0.0, 1000.0),
        };
        (
            name.to_string(),
            ResourceUnitRanking::new(
                name.to_string(),
                usage,
                BTreeSet::new(),
                ResourceQuota::zero(),
                BTreeSet::new(),
                ResourceQuota::zero(),
                LoadFactors::default(),
                &ResourceQuota::default(),
            ),
        )
    }

    #[test]
    fn test_rank_decreases_with_load() {
        let wrrs = WeightedRandomSelection::new();
        let (_, idle) = ranking("a:8080", 0.0);
        let (_, half) = ranking("b:8080", 50.0);
        let (_, full) = ranking("c:8080", 100.0);

        let idle_rank = wrrs.rank(&idle);
        let half_rank = wrrs.rank(&half);
        assert!(idle_rank > half_rank);
        assert!(half_rank > 0);
        assert_eq!(wrrs.rank(&full), 0);

        // rank(a) > rank(b) implies free capacity(a) >= free capacity(b)
        assert_eq!(idle_rank, idle.estimated_max_capacity());
        assert_eq!(
            half_rank,
            (half.estimated_max_capacity() as f64 * 0.25) as i64
        );
    }

    #[test]
    fn test_pick_always_lands_on_a_candidate() {
        let rankings: HashMap<_, _> = [
            ranking("a:8080", 0.0),
            ranking("b:8080", 50.0),
            ranking("c:8080", 99.0),
        ]
        .into_iter()
        .collect();
        let candidates: Vec<String> = ["a:8080", "b:8080", "c:8080"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let wrrs = WeightedRandomSelection::new();
        for _ in 0..200 {
            let pick = wrrs.pick(&rankings, &candidates, 0, &thresholds()).unwrap();
            assert!(candidates.contains(&pick));
        }
    }

    #[test]
    fn test_idle_broker_dominates_selection() {
        // One idle broker against one at 99%: the busy broker's rank
        // floors to zero, so the idle one takes effectively every pick
        let rankings: HashMap<_, _> =
            [ranking("a:8080", 0.0), ranking("b:8080", 99.0)].into_iter().collect();
        let candidates: Vec<String> =
            ["a:8080", "b:8080"].iter().map(|s| s.to_string()).collect();

        let wrrs = WeightedRandomSelection::new();
        let hits = (0..100)
            .filter(|_| {
                wrrs.pick(&rankings, &candidates, 0, &thresholds()).unwrap() == "a:8080"
            })
            .count();
        assert!(hits > 90);
    }

    #[test]
    fn test_saturated_pool_still_picks() {
        let rankings: HashMap<_, _> =
            [ranking("a:8080", 100.0), ranking("b:8080", 120.0)].into_iter().collect();
        let candidates: Vec<String> =
            ["a:8080", "b:8080"].iter().map(|s| s.to_string()).collect();

        let pick = WeightedRandomSelection::new()
            .pick(&rankings, &candidates, 0, &thresholds())
            .unwrap();
        assert!(candidates.contains(&pick));
    }
}
