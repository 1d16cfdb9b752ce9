use crate::ranking::ResourceUnitRanking;
use std::collections::HashMap;

pub const LOAD_RANK: &str = "brk_lb_load_rank";
pub const QUOTA_PCT_CPU: &str = "brk_lb_quota_pct_cpu";
pub const QUOTA_PCT_MEMORY: &str = "brk_lb_quota_pct_memory";
pub const QUOTA_PCT_BANDWIDTH_IN: &str = "brk_lb_quota_pct_bandwidth_in";
pub const QUOTA_PCT_BANDWIDTH_OUT: &str = "brk_lb_quota_pct_bandwidth_out";

/// Gauges for one broker, keyed by metric name.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMetrics {
    pub broker: String,
    pub gauges: HashMap<&'static str, f64>,
}

/// Snapshot the ranking state as per-broker metric dictionaries.
pub fn collect(
    rankings: &HashMap<String, ResourceUnitRanking>,
    rank_of: impl Fn(&ResourceUnitRanking) -> i64,
) -> Vec<BrokerMetrics> {
    let mut out: Vec<BrokerMetrics> = rankings
        .iter()
        .map(|(broker, ranking)| {
            let quota_pcts = ranking.allocated_quota_percentages();
            let gauges = HashMap::from([
                (LOAD_RANK, rank_of(ranking) as f64),
                (QUOTA_PCT_CPU, quota_pcts.cpu),
                (QUOTA_PCT_MEMORY, quota_pcts.memory),
                (QUOTA_PCT_BANDWIDTH_IN, quota_pcts.bandwidth_in),
                (QUOTA_PCT_BANDWIDTH_OUT, quota_pcts.bandwidth_out),
            ]);
            BrokerMetrics {
                broker: broker.clone(),
                gauges,
            }
        })
        .collect();
    out.sort_by(|a, b| a.broker.cmp(&b.broker));
    out
}
