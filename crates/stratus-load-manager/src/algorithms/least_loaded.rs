use super::{PlacementStrategy, SelectionThresholds};
use crate::ranking::ResourceUnitRanking;
use std::collections::HashMap;
use tracing::debug;

/// Deterministic least-loaded selection.
///
/// One scan tracks four possible picks:
/// - the lowest-loaded non-idle candidate,
/// - the first idle candidate,
/// - the candidate with the largest absolute headroom,
/// - the candidate at the rotation cursor.
///
/// Warm brokers fill before idle ones wake; once everything is warm the
/// least-loaded wins; past the overload threshold absolute headroom decides;
/// and with the whole pool saturated the cursor spreads assignments.
pub struct LeastLoadedServer;

impl LeastLoadedServer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastLoadedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementStrategy for LeastLoadedServer {
    fn name(&self) -> &'static str {
        "leastLoadedServer"
    }

    fn rank(&self, ranking: &ResourceUnitRanking) -> i64 {
        ranking.estimated_load_percentage() as i64
    }

    fn pick(
        &self,
        rankings: &HashMap<String, ResourceUnitRanking>,
        candidates: &[String],
        rotation_cursor: u64,
        thresholds: &SelectionThresholds,
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let mut selected: Option<(&String, f64)> = None;
        let mut idle: Option<&String> = None;
        let mut max_available: Option<(&String, f64)> = None;

        for name in candidates {
            let ranking = match rankings.get(name) {
                Some(r) => r,
                None => continue,
            };
            let load = ranking.estimated_load_percentage();

            if ranking.is_idle() {
                if idle.is_none() {
                    idle = Some(name);
                }
            } else if selected.map_or(true, |(_, best)| load < best) {
                selected = Some((name, load));
            }

            let available =
                ranking.estimated_max_capacity() as f64 * (1.0 - load / 100.0);
            if max_available.map_or(true, |(_, best)| available > best) {
                max_available = Some((name, available));
            }
        }

        let random = &candidates[(rotation_cursor % candidates.len() as u64) as usize];

        let min_load = selected.map(|(_, load)| load);
        let choice = match min_load {
            // Only idle candidates (or none at all)
            None => idle,
            Some(min) if min > thresholds.underload_pct && idle.is_some() => idle,
            Some(min) if min >= 100.0 => Some(random),
            Some(min) if min > thresholds.overload_pct => max_available.map(|(name, _)| name),
            Some(_) => selected.map(|(name, _)| name),
        };

        debug!(
            strategy = self.name(),
            min_load = min_load.unwrap_or(-1.0),
            choice = choice.map(String::as_str).unwrap_or("-"),
            "least-loaded pick"
        );
        choice.cloned()
    }
}
