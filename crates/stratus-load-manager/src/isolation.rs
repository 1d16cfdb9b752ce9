use crate::types::LoadManagerError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One named isolation policy, as persisted under
/// `/loadbalance/settings/isolation`. All matching is by regex: namespaces
/// select which policy applies, primary/secondary select brokers by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolationPolicySpec {
    pub namespaces: Vec<String>,
    pub primary: Vec<String>,
    #[serde(default)]
    pub secondary: Vec<String>,
    /// Fail over to secondaries when fewer than this many primaries are up.
    #[serde(default)]
    pub min_primary_brokers: usize,
}

#[derive(Debug)]
struct CompiledPolicy {
    namespaces: Vec<Regex>,
    primary: Vec<Regex>,
    secondary: Vec<Regex>,
    min_primary_brokers: usize,
}

impl CompiledPolicy {
    fn matches_namespace(&self, namespace: &str) -> bool {
        self.namespaces.iter().any(|re| re.is_match(namespace))
    }
}

/// Per-namespace rules partitioning brokers into primary owners and shared
/// fallbacks.
#[derive(Debug, Default)]
pub struct NamespaceIsolationPolicies {
    policies: Vec<(String, CompiledPolicy)>,
}

impl NamespaceIsolationPolicies {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile a policy set; a malformed regex rejects the whole update so
    /// a half-applied policy never filters candidates.
    pub fn compile(specs: &HashMap<String, IsolationPolicySpec>) -> Result<Self, LoadManagerError> {
        let compile_all = |patterns: &[String]| -> Result<Vec<Regex>, LoadManagerError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        LoadManagerError::Config(format!("invalid isolation regex '{p}': {e}"))
                    })
                })
                .collect()
        };

        let mut policies = Vec::with_capacity(specs.len());
        for (name, spec) in specs {
            policies.push((
                name.clone(),
                CompiledPolicy {
                    namespaces: compile_all(&spec.namespaces)?,
                    primary: compile_all(&spec.primary)?,
                    secondary: compile_all(&spec.secondary)?,
                    min_primary_brokers: spec.min_primary_brokers,
                },
            ));
        }
        policies.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self { policies })
    }

    fn policy_for(&self, namespace: &str) -> Option<&CompiledPolicy> {
        self.policies
            .iter()
            .map(|(_, p)| p)
            .find(|p| p.matches_namespace(namespace))
    }

    pub fn has_policy(&self, namespace: &str) -> bool {
        self.policy_for(namespace).is_some()
    }

    /// Whether `broker` is a primary for `namespace`'s policy.
    pub fn is_primary(&self, namespace: &str, broker: &str) -> bool {
        self.policy_for(namespace)
            .map(|p| p.primary.iter().any(|re| re.is_match(broker)))
            .unwrap_or(false)
    }

    pub fn is_secondary(&self, namespace: &str, broker: &str) -> bool {
        self.policy_for(namespace)
            .map(|p| p.secondary.iter().any(|re| re.is_match(broker)))
            .unwrap_or(false)
    }

    /// Whether `broker` is claimed as primary by any policy; such brokers
    /// are kept out of the shared pool.
    pub fn is_primary_anywhere(&self, broker: &str) -> bool {
        self.policies
            .iter()
            .any(|(_, p)| p.primary.iter().any(|re| re.is_match(broker)))
    }

    /// With `primary_count` primaries available, may `namespace` spill onto
    /// secondaries?
    pub fn should_failover_to_secondaries(&self, namespace: &str, primary_count: usize) -> bool {
        self.policy_for(namespace)
            .map(|p| primary_count < p.min_primary_brokers)
            .unwrap_or(false)
    }
}
