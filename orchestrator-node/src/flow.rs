//! Flow controller
//!
//! Owns the flow-rule table and the per-type round-robin cursor used for
//! load balancing. During rolling updates the new instance's rule is always
//! added before the old instance's rule is removed, so a type serving chains
//! never loses its last active rule.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::driver::InstanceDriver;
use crate::error::{OrchestratorError, Result};
use crate::types::{FlowRule, FlowRuleStatus, Instance, InstanceState, VnfType};

/// Back-index from instances and types to the chains referencing them.
/// Cross-references are ids, never owning handles.
#[derive(Default)]
pub struct ChainIndex {
    by_instance: DashMap<Uuid, HashSet<String>>,
    by_type: DashMap<VnfType, HashSet<String>>,
}

impl ChainIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn link(&self, chain_id: &str, vnf: VnfType, instance_id: Uuid) {
        self.by_instance
            .entry(instance_id)
            .or_default()
            .insert(chain_id.to_string());
        self.by_type
            .entry(vnf)
            .or_default()
            .insert(chain_id.to_string());
    }

    pub fn unlink(&self, chain_id: &str, vnf: VnfType, instance_id: Uuid) {
        if let Some(mut chains) = self.by_instance.get_mut(&instance_id) {
            chains.remove(chain_id);
        }
        if let Some(mut chains) = self.by_type.get_mut(&vnf) {
            chains.remove(chain_id);
        }
    }

    /// Chains currently referencing an instance
    pub fn chains_for_instance(&self, instance_id: Uuid) -> usize {
        self.by_instance
            .get(&instance_id)
            .map(|chains| chains.len())
            .unwrap_or(0)
    }

    /// Whether any active chain references the type
    pub fn type_has_chains(&self, vnf: VnfType) -> bool {
        self.by_type
            .get(&vnf)
            .map(|chains| !chains.is_empty())
            .unwrap_or(false)
    }
}

/// Flow-rule table plus round-robin load balancer
pub struct FlowController {
    driver: Arc<InstanceDriver>,
    chain_index: Arc<ChainIndex>,
    rules: DashMap<Uuid, FlowRule>,
    cursors: DashMap<VnfType, AtomicUsize>,
}

impl FlowController {
    pub fn new(driver: Arc<InstanceDriver>, chain_index: Arc<ChainIndex>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            chain_index,
            rules: DashMap::new(),
            cursors: DashMap::new(),
        })
    }

    /// Install a flow rule directing `vnf` traffic to `instance_id`.
    ///
    /// At most one active rule may reference a given instance at a given
    /// priority; a second install is a conflict.
    pub fn add_rule(
        &self,
        vnf: VnfType,
        instance_id: Uuid,
        priority: u32,
        chain_id: Option<String>,
    ) -> Result<FlowRule> {
        let instance = self
            .driver
            .get(instance_id)
            .ok_or(OrchestratorError::AlreadyDestroyed(instance_id))?;
        if instance.state == InstanceState::Removed {
            return Err(OrchestratorError::AlreadyDestroyed(instance_id));
        }
        if instance.vnf_type != vnf {
            return Err(OrchestratorError::InvalidAction(format!(
                "instance {instance_id} is {}, rule requests {vnf}",
                instance.vnf_type
            )));
        }
        let conflicting = self.rules.iter().any(|entry| {
            let rule = entry.value();
            rule.status == FlowRuleStatus::Active
                && rule.instance_id == instance_id
                && rule.priority == priority
        });
        if conflicting {
            return Err(OrchestratorError::FlowConflict(format!(
                "active rule already references instance {instance_id} at priority {priority}"
            )));
        }

        let rule = FlowRule {
            flow_id: Uuid::new_v4(),
            vnf_type: vnf,
            instance_id,
            priority,
            status: FlowRuleStatus::Active,
            chain_id,
            created_at: Utc::now(),
        };
        self.rules.insert(rule.flow_id, rule.clone());
        debug!(flow_id = %rule.flow_id, vnf_type = %vnf, instance = %instance_id, "Flow rule added");
        Ok(rule)
    }

    /// Remove a flow rule. Refused when it is the last active rule of a type
    /// that active chains still reference.
    pub fn remove_rule(&self, flow_id: Uuid) -> Result<FlowRule> {
        let vnf = {
            let rule = self
                .rules
                .get(&flow_id)
                .filter(|r| r.status == FlowRuleStatus::Active)
                .ok_or_else(|| {
                    OrchestratorError::InvalidAction(format!("no active flow rule {flow_id}"))
                })?;
            rule.vnf_type
        };
        let is_last = self.active_rule_count(vnf) == 1;
        if is_last && self.chain_index.type_has_chains(vnf) {
            return Err(OrchestratorError::InvalidAction(format!(
                "refusing to remove the last {vnf} rule while chains reference it"
            )));
        }
        let mut rule = self
            .rules
            .get_mut(&flow_id)
            .ok_or_else(|| OrchestratorError::InvalidAction(format!("no flow rule {flow_id}")))?;
        rule.status = FlowRuleStatus::Removed;
        info!(flow_id = %flow_id, vnf_type = %vnf, "Flow rule removed");
        Ok(rule.clone())
    }

    /// Active rules, optionally filtered by type
    pub fn list_rules(&self, vnf: Option<VnfType>) -> Vec<FlowRule> {
        let mut rules: Vec<FlowRule> = self
            .rules
            .iter()
            .filter(|entry| {
                let rule = entry.value();
                rule.status == FlowRuleStatus::Active
                    && vnf.map(|v| rule.vnf_type == v).unwrap_or(true)
            })
            .map(|entry| entry.value().clone())
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.flow_id.cmp(&b.flow_id)));
        rules
    }

    pub fn get_rule(&self, flow_id: Uuid) -> Option<FlowRule> {
        self.rules.get(&flow_id).map(|r| r.clone())
    }

    pub fn active_rule_count(&self, vnf: VnfType) -> usize {
        self.rules
            .iter()
            .filter(|entry| {
                entry.value().vnf_type == vnf && entry.value().status == FlowRuleStatus::Active
            })
            .count()
    }

    /// Active rules pointing at one instance
    pub fn rules_for_instance(&self, instance_id: Uuid) -> Vec<FlowRule> {
        self.rules
            .iter()
            .filter(|entry| {
                entry.value().instance_id == instance_id
                    && entry.value().status == FlowRuleStatus::Active
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Next active instance for `vnf` under round-robin, skipping instances
    /// that are starting or draining
    pub fn next_instance(&self, vnf: VnfType) -> Option<Instance> {
        let candidates: Vec<Instance> = self
            .driver
            .list(vnf)
            .into_iter()
            .filter(|i| i.state == InstanceState::Active)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let cursor = self
            .cursors
            .entry(vnf)
            .or_insert_with(|| AtomicUsize::new(0));
        let index = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }

    pub fn chain_index(&self) -> Arc<ChainIndex> {
        Arc::clone(&self.chain_index)
    }
}
