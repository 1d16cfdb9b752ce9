use crate::algorithms::{PlacementStrategy, SelectionThresholds};
use crate::isolation::NamespaceIsolationPolicies;
use crate::ranking::ResourceUnitRanking;
use crate::types::constants::ROTATION_CURSOR_MODULO;
use crate::types::{ResourceQuota, ServiceUnitId};
use std::collections::HashMap;
use tracing::debug;

/// Brokers eligible to own a bundle of `namespace`, sorted by name.
///
/// With a policy: primaries, widened by secondaries when too few primaries
/// are up. Without one: every broker not claimed as primary elsewhere.
pub fn eligible_candidates<'a>(
    namespace: &str,
    brokers: impl Iterator<Item = &'a String>,
    isolation: &NamespaceIsolationPolicies,
) -> Vec<String> {
    let mut candidates: Vec<String> = if isolation.has_policy(namespace) {
        let all: Vec<&String> = brokers.collect();
        let primaries: Vec<String> = all
            .iter()
            .filter(|b| isolation.is_primary(namespace, b))
            .map(|b| (*b).clone())
            .collect();

        if isolation.should_failover_to_secondaries(namespace, primaries.len()) {
            let mut widened = primaries;
            widened.extend(
                all.iter()
                    .filter(|b| isolation.is_secondary(namespace, b))
                    .map(|b| (*b).clone()),
            );
            widened
        } else {
            primaries
        }
    } else {
        brokers
            .filter(|b| !isolation.is_primary_anywhere(b))
            .cloned()
            .collect()
    };

    candidates.sort();
    candidates.dedup();
    candidates
}

/// Choose an owner for `bundle` among `candidates` and record the
/// pre-allocation.
///
/// The whole scan runs under the caller's rankings lock so the four tracked
/// picks observe one consistent snapshot. A bundle already pre-allocated to
/// a candidate sticks to it; a bundle a candidate still reports as loaded is
/// dropped from that candidate first, since it is about to be re-placed.
pub fn assign(
    bundle: &ServiceUnitId,
    rankings: &mut HashMap<String, ResourceUnitRanking>,
    rotation_cursor: &mut u64,
    candidates: &[String],
    strategy: &dyn PlacementStrategy,
    thresholds: &SelectionThresholds,
    quota: &ResourceQuota,
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    for name in candidates {
        if let Some(ranking) = rankings.get(name) {
            if ranking.is_pre_allocated(bundle.as_str()) {
                debug!(bundle = %bundle, broker = %name, "sticky pre-allocated placement");
                return Some(name.clone());
            }
        }
    }

    for name in candidates {
        if let Some(ranking) = rankings.get_mut(name) {
            ranking.remove_loaded(bundle.as_str(), quota);
        }
    }

    let chosen = strategy.pick(rankings, candidates, *rotation_cursor, thresholds)?;
    *rotation_cursor = (*rotation_cursor + 1) % ROTATION_CURSOR_MODULO;

    if let Some(ranking) = rankings.get_mut(&chosen) {
        ranking.add_pre_allocated(bundle.as_str(), quota);
    }
    debug!(bundle = %bundle, broker = %chosen, strategy = strategy.name(), "placed bundle");
    Some(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::IsolationPolicySpec;
    use std::collections::HashMap;

    fn isolation() -> NamespaceIsolationPolicies {
        let specs: HashMap<String, IsolationPolicySpec> = [(
            "payments-isolation".to_string(),
            IsolationPolicySpec {
                namespaces: vec!["acme/east/payments".to_string()],
                primary: vec!["payment-.*".to_string()],
                secondary: vec!["shared-.*".to_string()],
                min_primary_brokers: 2,
            },
        )]
        .into_iter()
        .collect();
        NamespaceIsolationPolicies::compile(&specs).unwrap()
    }

    fn brokers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_primary_set_when_enough_primaries() {
        let all = brokers(&["payment-1:8080", "payment-2:8080", "shared-1:8080"]);
        let candidates = eligible_candidates("acme/east/payments", all.iter(), &isolation());
        assert_eq!(candidates, brokers(&["payment-1:8080", "payment-2:8080"]));
    }

    #[test]
    fn test_failover_widens_to_secondaries() {
        let all = brokers(&["payment-1:8080", "shared-1:8080", "shared-2:8080"]);
        let candidates = eligible_candidates("acme/east/payments", all.iter(), &isolation());
        assert_eq!(
            candidates,
            brokers(&["payment-1:8080", "shared-1:8080", "shared-2:8080"])
        );
    }

    #[test]
    fn test_unpolicied_namespace_avoids_primaries() {
        let all = brokers(&["payment-1:8080", "shared-1:8080", "shared-2:8080"]);
        let candidates = eligible_candidates("acme/east/orders", all.iter(), &isolation());
        assert_eq!(candidates, brokers(&["shared-1:8080", "shared-2:8080"]));
    }

    #[test]
    fn test_no_policies_all_brokers_shared() {
        let all = brokers(&["a:8080", "b:8080"]);
        let candidates = eligible_candidates(
            "acme/east/orders",
            all.iter(),
            &NamespaceIsolationPolicies::empty(),
        );
        assert_eq!(candidates, all);
    }
}
