//! Profile catalog: named bundles of artifacts, unit actions, and
//! configuration that the plan compiler expands per node.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::api::{ArtifactKind, ArtifactRef, UnitAction, UnitActionKind};

/// What one profile contributes to a node's plan.
#[derive(Debug, Clone, Default)]
pub struct ProfileTemplate {
    pub artifacts: Vec<ArtifactRef>,
    pub unit_actions: Vec<UnitAction>,
    pub config: BTreeMap<String, String>,
}

/// Source of profile definitions.
///
/// The compiler resolves each assigned profile name through this trait;
/// unknown names are skipped with a warning rather than failing the
/// whole plan.
pub trait ProfileCatalog: Send + Sync {
    fn resolve(&self, name: &str) -> Option<ProfileTemplate>;
}

/// In-memory catalog backed by a fixed map. The built-in set covers the
/// roles shipped with the distribution; deployments can swap in their
/// own catalog through [`ProfileCatalog`].
pub struct StaticProfileCatalog {
    profiles: BTreeMap<String, ProfileTemplate>,
}

impl StaticProfileCatalog {
    pub fn new(profiles: BTreeMap<String, ProfileTemplate>) -> Self {
        Self { profiles }
    }

    /// Catalog with the built-in profiles.
    pub fn builtin() -> Arc<Self> {
        let mut profiles = BTreeMap::new();

        profiles.insert(
            "core".to_string(),
            ProfileTemplate {
                artifacts: vec![
                    artifact(ArtifactKind::Subsystem, "clusterd-agent", "clusterd", "1.0.0"),
                    artifact(ArtifactKind::Service, "discovery", "clusterd", "1.0.0"),
                ],
                unit_actions: vec![
                    unit("clusterd-agent.service", UnitActionKind::Enable),
                    unit("clusterd-agent.service", UnitActionKind::Start),
                    unit("discovery.service", UnitActionKind::Start),
                ],
                config: BTreeMap::new(),
            },
        );

        profiles.insert(
            "dns".to_string(),
            ProfileTemplate {
                artifacts: vec![artifact(ArtifactKind::Service, "dns", "clusterd", "1.0.0")],
                unit_actions: vec![
                    unit("dns.service", UnitActionKind::Enable),
                    unit("dns.service", UnitActionKind::Start),
                ],
                config: BTreeMap::new(),
            },
        );

        profiles.insert(
            "gateway".to_string(),
            ProfileTemplate {
                artifacts: vec![artifact(
                    ArtifactKind::Service,
                    "gateway",
                    "clusterd",
                    "1.0.0",
                )],
                unit_actions: vec![
                    unit("gateway.service", UnitActionKind::Enable),
                    unit("gateway.service", UnitActionKind::Start),
                ],
                config: BTreeMap::new(),
            },
        );

        profiles.insert(
            "storage".to_string(),
            ProfileTemplate {
                artifacts: vec![
                    artifact(ArtifactKind::Service, "file-store", "clusterd", "1.0.0"),
                    artifact(ArtifactKind::Service, "doc-store", "clusterd", "1.0.0"),
                ],
                unit_actions: vec![
                    unit("file-store.service", UnitActionKind::Start),
                    unit("doc-store.service", UnitActionKind::Start),
                ],
                config: BTreeMap::new(),
            },
        );

        Arc::new(Self::new(profiles))
    }
}

impl ProfileCatalog for StaticProfileCatalog {
    fn resolve(&self, name: &str) -> Option<ProfileTemplate> {
        self.profiles.get(name).cloned()
    }
}

fn artifact(kind: ArtifactKind, name: &str, publisher: &str, version: &str) -> ArtifactRef {
    ArtifactRef {
        kind,
        name: name.to_string(),
        publisher: publisher.to_string(),
        version: version.to_string(),
        discovery_id: String::new(),
    }
}

fn unit(unit_name: &str, action: UnitActionKind) -> UnitAction {
    UnitAction {
        unit_name: unit_name.to_string(),
        action,
    }
}
