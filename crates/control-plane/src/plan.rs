//! Plan compiler: expands a node's profile assignment against the
//! cluster network document into a deterministic [`NodePlan`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use common::api::{ClusterNetworkSpec, NodePlan, UnitAction};

use crate::profiles::{ProfileCatalog, ProfileTemplate};

/// Path the rendered network document is placed under in the plan.
pub const NETWORK_CONFIG_PATH: &str = "cluster/network.json";

/// Merge profile templates in assignment order.
///
/// Unknown profile names are skipped (with a warning) so one stale
/// assignment cannot block the rest of the node's plan. Duplicate
/// artifacts collapse by (kind, name) with the later profile's version
/// winning; duplicate unit actions collapse by (unit, action); config
/// entries are last-wins by path.
pub fn merge_profiles(names: &[String], catalog: &dyn ProfileCatalog) -> ProfileTemplate {
    let mut merged = ProfileTemplate::default();

    for name in names {
        let Some(template) = catalog.resolve(name) else {
            warn!(profile = %name, "skipping unknown profile");
            continue;
        };

        for artifact in template.artifacts {
            if let Some(existing) = merged
                .artifacts
                .iter_mut()
                .find(|a| a.kind == artifact.kind && a.name == artifact.name)
            {
                *existing = artifact;
            } else {
                merged.artifacts.push(artifact);
            }
        }

        for action in template.unit_actions {
            let dup = merged
                .unit_actions
                .iter()
                .any(|a| a.unit_name == action.unit_name && a.action == action.action);
            if !dup {
                merged.unit_actions.push(action);
            }
        }

        merged.config.extend(template.config);
    }

    merged
}

/// Compile the plan for one node.
///
/// Pure function of its inputs: the same (node, profiles, network spec,
/// generation) always yields an identical plan, including `plan_id`.
pub fn compile_plan(
    node_id: Uuid,
    profiles: &[String],
    network: &ClusterNetworkSpec,
    generation: i64,
    catalog: &dyn ProfileCatalog,
) -> anyhow::Result<NodePlan> {
    let merged = merge_profiles(profiles, catalog);

    let mut rendered_config = merged.config;
    rendered_config.insert(NETWORK_CONFIG_PATH.to_string(), render_network(network)?);

    let mut plan = NodePlan {
        plan_id: String::new(),
        node_id,
        generation,
        profiles: profiles.to_vec(),
        artifacts: merged.artifacts,
        unit_actions: merged.unit_actions,
        rendered_config,
    };
    plan.plan_id = plan_hash(&plan);
    Ok(plan)
}

fn render_network(network: &ClusterNetworkSpec) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(network)?)
}

/// Content hash of a plan, stable across field ordering.
///
/// Collections are folded in sorted order so two plans with the same
/// content always hash alike regardless of how they were assembled.
pub fn plan_hash(plan: &NodePlan) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plan.node_id.as_bytes());
    hasher.update(plan.generation.to_be_bytes());

    for profile in &plan.profiles {
        hasher.update(b"p\x00");
        hasher.update(profile.as_bytes());
    }

    let mut artifacts: Vec<String> = plan
        .artifacts
        .iter()
        .map(|a| {
            format!(
                "{}/{}/{}@{}",
                a.kind.as_str(),
                a.publisher,
                a.name,
                a.version
            )
        })
        .collect();
    artifacts.sort();
    for line in artifacts {
        hasher.update(b"a\x00");
        hasher.update(line.as_bytes());
    }

    let mut actions: Vec<String> = plan
        .unit_actions
        .iter()
        .map(|u| format!("{}:{}", u.unit_name, u.action.as_str()))
        .collect();
    actions.sort();
    for line in actions {
        hasher.update(b"u\x00");
        hasher.update(line.as_bytes());
    }

    // BTreeMap iterates in key order already.
    for (path, body) in &plan.rendered_config {
        hasher.update(b"c\x00");
        hasher.update(path.as_bytes());
        hasher.update(b"=");
        hasher.update(body.as_bytes());
    }

    hex::encode(hasher.finalize())
}

/// Hash of an ordered profile assignment, used as a cache key component.
pub fn profiles_hash(profiles: &[String]) -> String {
    let mut hasher = Sha256::new();
    for profile in profiles {
        hasher.update(profile.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

type CacheKey = (Uuid, String, i64);

/// Cache of compiled plans keyed by (node, profiles hash, network
/// generation). Compilation is pure, so entries never go stale for a
/// fixed key; a generation bump or profile change simply misses.
#[derive(Default)]
pub struct PlanCache {
    entries: Mutex<HashMap<CacheKey, NodePlan>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: Uuid, profiles: &[String], generation: i64) -> Option<NodePlan> {
        let key = (node_id, profiles_hash(profiles), generation);
        self.entries.lock().expect("plan cache poisoned").get(&key).cloned()
    }

    pub fn insert(&self, plan: &NodePlan) {
        let key = (plan.node_id, profiles_hash(&plan.profiles), plan.generation);
        self.entries
            .lock()
            .expect("plan cache poisoned")
            .insert(key, plan.clone());
    }

    /// Drop every cached plan for one node (profile reassignment).
    pub fn invalidate_node(&self, node_id: Uuid) {
        self.entries
            .lock()
            .expect("plan cache poisoned")
            .retain(|(id, _, _), _| *id != node_id);
    }

    /// Drop everything (network generation bump).
    pub fn clear(&self) {
        self.entries.lock().expect("plan cache poisoned").clear();
    }
}

/// Build the plan that stops every unit a node's current plan manages.
/// Used when draining a node ahead of removal.
pub fn stop_plan(plan: &NodePlan) -> NodePlan {
    use common::api::UnitActionKind;

    let mut seen = std::collections::BTreeSet::new();
    let unit_actions: Vec<UnitAction> = plan
        .unit_actions
        .iter()
        .filter(|a| seen.insert(a.unit_name.clone()))
        .map(|a| UnitAction {
            unit_name: a.unit_name.clone(),
            action: UnitActionKind::Stop,
        })
        .collect();

    let mut stop = NodePlan {
        plan_id: String::new(),
        node_id: plan.node_id,
        generation: plan.generation,
        profiles: Vec::new(),
        artifacts: Vec::new(),
        unit_actions,
        rendered_config: BTreeMap::new(),
    };
    stop.plan_id = plan_hash(&stop);
    stop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::StaticProfileCatalog;
    use common::api::{ArtifactKind, ArtifactRef, UnitActionKind};

    fn network() -> ClusterNetworkSpec {
        ClusterNetworkSpec {
            cluster_domain: "cluster.example.org".to_string(),
            ..ClusterNetworkSpec::default()
        }
    }

    #[test]
    fn compile_is_deterministic() {
        let catalog = StaticProfileCatalog::builtin();
        let node = Uuid::new_v4();
        let profiles = vec!["core".to_string(), "dns".to_string()];

        let a = compile_plan(node, &profiles, &network(), 3, catalog.as_ref()).unwrap();
        let b = compile_plan(node, &profiles, &network(), 3, catalog.as_ref()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.plan_id, b.plan_id);
    }

    #[test]
    fn generation_bump_changes_plan_id() {
        let catalog = StaticProfileCatalog::builtin();
        let node = Uuid::new_v4();
        let profiles = vec!["core".to_string()];

        let a = compile_plan(node, &profiles, &network(), 1, catalog.as_ref()).unwrap();
        let b = compile_plan(node, &profiles, &network(), 2, catalog.as_ref()).unwrap();
        assert_ne!(a.plan_id, b.plan_id);
    }

    #[test]
    fn unknown_profiles_are_skipped() {
        let catalog = StaticProfileCatalog::builtin();
        let merged = merge_profiles(
            &["nope".to_string(), "dns".to_string()],
            catalog.as_ref(),
        );
        assert!(merged
            .unit_actions
            .iter()
            .any(|a| a.unit_name == "dns.service"));
    }

    #[test]
    fn later_profile_version_wins_on_artifact_collision() {
        use std::collections::BTreeMap;

        let mut profiles = BTreeMap::new();
        profiles.insert(
            "old".to_string(),
            ProfileTemplate {
                artifacts: vec![ArtifactRef {
                    kind: ArtifactKind::Service,
                    name: "dns".to_string(),
                    publisher: "clusterd".to_string(),
                    version: "1.0.0".to_string(),
                    discovery_id: String::new(),
                }],
                ..ProfileTemplate::default()
            },
        );
        profiles.insert(
            "new".to_string(),
            ProfileTemplate {
                artifacts: vec![ArtifactRef {
                    kind: ArtifactKind::Service,
                    name: "dns".to_string(),
                    publisher: "clusterd".to_string(),
                    version: "2.0.0".to_string(),
                    discovery_id: String::new(),
                }],
                ..ProfileTemplate::default()
            },
        );
        let catalog = StaticProfileCatalog::new(profiles);

        let merged = merge_profiles(&["old".to_string(), "new".to_string()], &catalog);
        assert_eq!(merged.artifacts.len(), 1);
        assert_eq!(merged.artifacts[0].version, "2.0.0");
    }

    #[test]
    fn stop_plan_stops_each_unit_once() {
        let catalog = StaticProfileCatalog::builtin();
        let node = Uuid::new_v4();
        let plan =
            compile_plan(node, &["core".to_string()], &network(), 1, catalog.as_ref()).unwrap();

        let stop = stop_plan(&plan);
        assert!(stop.artifacts.is_empty());
        assert!(stop
            .unit_actions
            .iter()
            .all(|a| a.action == UnitActionKind::Stop));
        let mut names: Vec<_> = stop.unit_actions.iter().map(|a| &a.unit_name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), stop.unit_actions.len());
    }

    #[test]
    fn cache_hits_on_same_key_and_invalidates_per_node() {
        let catalog = StaticProfileCatalog::builtin();
        let cache = PlanCache::new();
        let node = Uuid::new_v4();
        let profiles = vec!["core".to_string()];

        let plan = compile_plan(node, &profiles, &network(), 1, catalog.as_ref()).unwrap();
        cache.insert(&plan);
        assert!(cache.get(node, &profiles, 1).is_some());
        assert!(cache.get(node, &profiles, 2).is_none());

        cache.invalidate_node(node);
        assert!(cache.get(node, &profiles, 1).is_none());
    }
}
