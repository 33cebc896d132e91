//! Shared API DTOs used across the control-plane, node agents, and CLI.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable facts a node reports about itself at join time.
///
/// Captured once per join request and re-validated (not re-trusted
/// blindly) on every status report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Short hostname of the machine.
    pub hostname: String,
    /// DNS domain the node believes it belongs to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    /// IP addresses the node is reachable on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    /// Operating system identifier (for example `linux`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    /// CPU architecture (for example `amd64`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    /// Version of the agent binary running on the node.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_version: String,
}

/// Registry status of an admitted node (wire format uses lowercase values).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// No status report received yet, or reports have gone stale.
    Unknown,
    /// All plan-managed units are nominal.
    Healthy,
    /// At least one unit failed or the node reported an error.
    Unhealthy,
    /// Node is being drained ahead of removal.
    Draining,
    /// Node was removed; the record is kept for history, the id is
    /// never reused.
    Removed,
}

impl NodeStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Healthy => "healthy",
            NodeStatus::Unhealthy => "unhealthy",
            NodeStatus::Draining => "draining",
            NodeStatus::Removed => "removed",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(NodeStatus::Unknown),
            "healthy" => Ok(NodeStatus::Healthy),
            "unhealthy" => Ok(NodeStatus::Unhealthy),
            "draining" => Ok(NodeStatus::Draining),
            "removed" => Ok(NodeStatus::Removed),
            other => Err(ParseEnumError::new("node status", other)),
        }
    }
}

/// Error returned when parsing a canonical enum string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

impl std::fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unrecognized {} {:?}", self.what, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

/// Admission state of a join request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JoinRequestStatus {
    /// Waiting for an operator decision.
    Pending,
    /// Approved; a node record was created.
    Approved,
    /// Rejected; terminal, reason stored in the record's message.
    Rejected,
}

impl JoinRequestStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinRequestStatus::Pending => "pending",
            JoinRequestStatus::Approved => "approved",
            JoinRequestStatus::Rejected => "rejected",
        }
    }

    /// Whether an operator already resolved the request.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, JoinRequestStatus::Pending)
    }
}

impl FromStr for JoinRequestStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JoinRequestStatus::Pending),
            "approved" => Ok(JoinRequestStatus::Approved),
            "rejected" => Ok(JoinRequestStatus::Rejected),
            other => Err(ParseEnumError::new("join request status", other)),
        }
    }
}

/// A pending or resolved admission decision, as returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequestView {
    /// Unique request id, generated at request time.
    pub request_id: Uuid,
    /// Identity reported by the prospective node.
    pub identity: NodeIdentity,
    /// Current admission state.
    pub status: JoinRequestStatus,
    /// Human-readable message (rejection reason, approval note).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Profiles requested by the node or assigned at approval.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    /// Free-form labels supplied with the request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Node id assigned on approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<Uuid>,
    /// When the request was submitted.
    pub requested_at: DateTime<Utc>,
}

/// An admitted node, as returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    /// Stable, registry-assigned node id.
    pub node_id: Uuid,
    /// Identity captured at join, refreshed by status reports.
    pub identity: NodeIdentity,
    /// Current registry status.
    pub status: NodeStatus,
    /// Ordered profile names assigned to the node.
    pub profiles: Vec<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Endpoint the control plane uses to reach the node's agent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_endpoint: String,
    /// Last time a status report was accepted for the node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Most recent error reported by or observed for the node.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

/// Kind of an artifact referenced by a plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// A long-running service managed as a unit.
    Service,
    /// An application bundle.
    Application,
    /// A subsystem binary (for example the agent itself).
    Subsystem,
}

impl ArtifactKind {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Service => "service",
            ArtifactKind::Application => "application",
            ArtifactKind::Subsystem => "subsystem",
        }
    }
}

/// Reference to an artifact in the external package repository.
///
/// The control plane only carries references; bytes are resolved by the
/// repository service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Artifact name.
    pub name: String,
    /// Publisher id in the repository.
    pub publisher: String,
    /// Version to ensure installed.
    pub version: String,
    /// Discovery id used to locate the repository entry.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub discovery_id: String,
}

/// Action to take on a systemd-style unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum UnitActionKind {
    /// Start the unit.
    Start,
    /// Stop the unit.
    Stop,
    /// Restart the unit.
    Restart,
    /// Enable the unit at boot.
    Enable,
    /// Disable the unit at boot.
    Disable,
}

impl UnitActionKind {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitActionKind::Start => "start",
            UnitActionKind::Stop => "stop",
            UnitActionKind::Restart => "restart",
            UnitActionKind::Enable => "enable",
            UnitActionKind::Disable => "disable",
        }
    }
}

/// A unit action entry in a node plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitAction {
    /// Unit name (for example `clusterd-dns.service`).
    pub unit_name: String,
    /// Action to apply.
    pub action: UnitActionKind,
}

/// The compiled desired-state document for one node.
///
/// Deterministic for a fixed `(profiles, network generation)` input:
/// `plan_id` is the content hash, not a random id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodePlan {
    /// Content hash identifying this plan revision.
    pub plan_id: String,
    /// Node the plan was compiled for.
    pub node_id: Uuid,
    /// Cluster network generation the plan was compiled against.
    pub generation: i64,
    /// Profiles snapshot the plan was compiled from.
    pub profiles: Vec<String>,
    /// Artifacts that must be present on the node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    /// Unit actions to converge on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unit_actions: Vec<UnitAction>,
    /// Profile-resolved configuration documents, keyed by path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rendered_config: BTreeMap<String, String>,
}

impl NodePlan {
    /// Whether the plan asks the node to do anything at all.
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.unit_actions.is_empty() && self.rendered_config.is_empty()
    }
}

/// Phase of a tracked operation. Transitions are forward-only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum OperationPhase {
    /// Accepted, not yet dispatched.
    Queued,
    /// In progress on the node.
    Running,
    /// Finished successfully. Terminal.
    Succeeded,
    /// Finished with an error. Terminal.
    Failed,
}

impl OperationPhase {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationPhase::Queued => "queued",
            OperationPhase::Running => "running",
            OperationPhase::Succeeded => "succeeded",
            OperationPhase::Failed => "failed",
        }
    }

    /// Whether the phase is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationPhase::Succeeded | OperationPhase::Failed)
    }
}

impl FromStr for OperationPhase {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(OperationPhase::Queued),
            "running" => Ok(OperationPhase::Running),
            "succeeded" => Ok(OperationPhase::Succeeded),
            "failed" => Ok(OperationPhase::Failed),
            other => Err(ParseEnumError::new("operation phase", other)),
        }
    }
}

/// What a tracked operation is doing to its node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Applying a compiled node plan.
    ApplyPlan,
    /// Upgrading the agent binary.
    Upgrade,
    /// Removing the node from the cluster.
    RemoveNode,
}

impl OperationKind {
    /// Returns the canonical kebab-case representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ApplyPlan => "apply-plan",
            OperationKind::Upgrade => "upgrade",
            OperationKind::RemoveNode => "remove-node",
        }
    }
}

impl FromStr for OperationKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apply-plan" => Ok(OperationKind::ApplyPlan),
            "upgrade" => Ok(OperationKind::Upgrade),
            "remove-node" => Ok(OperationKind::RemoveNode),
            other => Err(ParseEnumError::new("operation kind", other)),
        }
    }
}

/// One phase transition of an operation, delivered to watchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationEvent {
    /// Operation the event belongs to.
    pub operation_id: Uuid,
    /// Node the operation targets.
    pub node_id: Uuid,
    /// Phase after the transition.
    pub phase: OperationPhase,
    /// Human-readable progress message.
    pub message: String,
    /// Progress percentage, non-decreasing within an operation.
    pub percent: u8,
    /// True exactly once, on the terminal event.
    pub done: bool,
    /// Error detail; present only when `phase` is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the transition was recorded.
    pub timestamp: DateTime<Utc>,
}

/// State of one unit as reported by a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    /// Unit is running.
    Active,
    /// Unit is starting up.
    Activating,
    /// Unit is stopped.
    Inactive,
    /// Unit failed.
    Failed,
    /// State could not be determined.
    Unknown,
}

impl UnitState {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Active => "active",
            UnitState::Activating => "activating",
            UnitState::Inactive => "inactive",
            UnitState::Failed => "failed",
            UnitState::Unknown => "unknown",
        }
    }
}

impl FromStr for UnitState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(UnitState::Active),
            "activating" => Ok(UnitState::Activating),
            "inactive" => Ok(UnitState::Inactive),
            "failed" => Ok(UnitState::Failed),
            "unknown" => Ok(UnitState::Unknown),
            other => Err(ParseEnumError::new("unit state", other)),
        }
    }
}

/// Per-unit status line in a node status report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeUnitStatus {
    /// Unit name.
    pub name: String,
    /// Observed state.
    pub state: UnitState,
    /// Free-form detail (journal excerpt, exit code, ...).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

/// Periodic status snapshot submitted by a node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusReport {
    /// Reporting node.
    pub node_id: Uuid,
    /// Current identity; folded into the registry record.
    pub identity: NodeIdentity,
    /// Unit states observed on the node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<NodeUnitStatus>,
    /// Most recent error on the node, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    /// When the snapshot was taken on the node.
    pub reported_at: DateTime<Utc>,
    /// Endpoint the agent is listening on for plan dispatch.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_endpoint: String,
}

/// Network protocol the cluster fronts its services with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    /// Plain HTTP.
    Http,
    /// HTTPS.
    Https,
}

impl NetworkProtocol {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkProtocol::Http => "http",
            NetworkProtocol::Https => "https",
        }
    }
}

impl FromStr for NetworkProtocol {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(NetworkProtocol::Http),
            "https" => Ok(NetworkProtocol::Https),
            other => Err(ParseEnumError::new("network protocol", other)),
        }
    }
}

/// Cluster-wide network configuration. Single document per cluster,
/// versioned by a generation counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterNetworkSpec {
    /// Primary cluster domain.
    pub cluster_domain: String,
    /// Protocol served on the primary domain.
    pub protocol: NetworkProtocol,
    /// HTTP port (defaults to 80).
    pub port_http: u16,
    /// HTTPS port (defaults to 443).
    pub port_https: u16,
    /// Additional domains the cluster answers for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_domains: Vec<String>,
    /// Whether ACME certificate issuance is enabled.
    #[serde(default)]
    pub acme_enabled: bool,
    /// Administrative contact, required when ACME is enabled.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub admin_email: String,
}

impl Default for ClusterNetworkSpec {
    fn default() -> Self {
        Self {
            cluster_domain: String::new(),
            protocol: NetworkProtocol::Http,
            port_http: 80,
            port_https: 443,
            alternate_domains: Vec::new(),
            acme_enabled: false,
            admin_email: String::new(),
        }
    }
}

/// Derived convergence view for one node.
///
/// Never stored as independent truth; always recomputed from the
/// registry record, the latest operation, and the current desired state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Node the view describes.
    pub node_id: Uuid,
    /// Network generation the cluster wants applied.
    pub desired_generation: i64,
    /// Network generation the node last applied.
    pub applied_generation: i64,
    /// Hash of the plan the cluster wants applied.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub desired_plan_hash: String,
    /// Hash of the plan the node last applied.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub applied_plan_hash: String,
    /// True iff desired and applied hashes match for both network and
    /// services.
    pub converged: bool,
    /// Plan revision currently being applied or last applied.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_plan_id: String,
    /// Phase of the node's most recent operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<OperationPhase>,
    /// Most recent error.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

/// Health bucket a node falls into when rolling up cluster health.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthBucket {
    /// Reporting and nominal.
    Healthy,
    /// Reporting a failure.
    Unhealthy,
    /// Not seen within the staleness threshold.
    Unknown,
}

impl HealthBucket {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthBucket::Healthy => "healthy",
            HealthBucket::Unhealthy => "unhealthy",
            HealthBucket::Unknown => "unknown",
        }
    }
}

/// Overall cluster condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// Every node is healthy.
    Healthy,
    /// Some nodes are healthy, others are not.
    Degraded,
    /// No healthy nodes (or no nodes at all).
    Unhealthy,
}

impl ClusterStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Healthy => "healthy",
            ClusterStatus::Degraded => "degraded",
            ClusterStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Per-node line in the cluster health rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealthStatus {
    /// Node the line describes.
    pub node_id: Uuid,
    /// Hostname for display.
    pub hostname: String,
    /// Which bucket the node rolled up into.
    pub bucket: HealthBucket,
    /// Last accepted status report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Most recent error, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    /// Convergence detail for the node.
    pub health: NodeHealth,
}

/// Per-service rollout summary across the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSummary {
    /// Service artifact name.
    pub service_name: String,
    /// Version the cluster wants rolled out.
    pub desired_version: String,
    /// Nodes already converged on the desired version.
    pub nodes_at_desired: u32,
    /// Nodes the service is planned onto.
    pub nodes_total: u32,
    /// Nodes with an apply operation currently in flight.
    pub upgrading: u32,
}

/// Cluster-wide health rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    /// Overall condition.
    pub status: ClusterStatus,
    /// Nodes counted (removed nodes excluded).
    pub total_nodes: u32,
    /// Nodes in the healthy bucket.
    pub healthy_nodes: u32,
    /// Nodes in the unhealthy bucket.
    pub unhealthy_nodes: u32,
    /// Nodes in the unknown (stale) bucket.
    pub unknown_nodes: u32,
    /// Per-node detail.
    pub nodes: Vec<NodeHealthStatus>,
    /// Per-service rollout summaries, populated only when requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceSummary>,
}
