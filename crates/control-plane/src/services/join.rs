//! Join admission: token issue, join requests, operator approval.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tracing::info;
use uuid::Uuid;

use common::api::{JoinRequestStatus, JoinRequestView, NodeIdentity};

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{self as db, join, nodes};
use crate::tokens::{generate_token, hash_token};
use crate::validation;

#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct CreateJoinTokenRequest {
    /// Absolute expiry. Must be in the future; mutually exclusive with
    /// `ttl_secs`.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Lifetime in seconds; server default applies when absent.
    pub ttl_secs: Option<u64>,
    /// Uses permitted; server default (single use) applies when absent.
    pub max_uses: Option<u32>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct CreateJoinTokenResponse {
    /// The raw token. Shown exactly once; only its hash is stored.
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub max_uses: u32,
}

pub async fn create_join_token(
    state: &AppState,
    req: CreateJoinTokenRequest,
) -> ApiResult<CreateJoinTokenResponse> {
    let max_uses = req.max_uses.unwrap_or(state.tokens.join_token_max_uses);
    if max_uses == 0 {
        return Err(AppError::invalid_argument("max_uses must be > 0"));
    }

    let now = Utc::now();
    let expires_at = match (req.expires_at, req.ttl_secs) {
        (Some(_), Some(_)) => {
            return Err(AppError::invalid_argument(
                "expires_at and ttl_secs are mutually exclusive",
            ));
        }
        (Some(expires_at), None) => {
            if expires_at <= now {
                return Err(AppError::invalid_argument("expires_at must be in the future"));
            }
            expires_at
        }
        (None, ttl) => {
            let ttl_secs = ttl.unwrap_or(state.tokens.join_token_ttl_secs);
            if ttl_secs == 0 {
                return Err(AppError::invalid_argument("ttl_secs must be > 0"));
            }
            now + Duration::seconds(ttl_secs.min(i64::MAX as u64) as i64)
        }
    };
    let token = generate_token();
    let token_hash = hash_token(&token, &state.tokens.pepper);

    join::insert_token(&state.db, &token_hash, expires_at, i64::from(max_uses), now).await?;
    counter!("control_plane_join_tokens_issued_total").increment(1);
    info!(expires_at = %expires_at, max_uses, "join token issued");

    Ok(CreateJoinTokenResponse {
        token,
        expires_at,
        max_uses,
    })
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct RequestJoinRequest {
    pub token: String,
    pub identity: NodeIdentity,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

pub async fn request_join(state: &AppState, req: RequestJoinRequest) -> ApiResult<JoinRequestView> {
    validation::validate_identity(&req.identity, &state.limits)?;
    validation::validate_profiles(&req.profiles, &state.limits)?;

    let now = Utc::now();
    let token_hash = hash_token(&req.token, &state.tokens.pepper);
    // One error for unknown, expired, and exhausted alike: a caller
    // probing tokens learns nothing from the response.
    if !join::consume_token(&state.db, &token_hash, now).await? {
        counter!("control_plane_join_rejected_total", "reason" => "bad_token").increment(1);
        return Err(AppError::unauthenticated("invalid join token"));
    }

    let record = join::insert_request(
        &state.db,
        db::NewJoinRequest {
            id: Uuid::new_v4(),
            token_hash,
            identity: req.identity,
            metadata: req.metadata,
            profiles: req.profiles,
            requested_at: now,
        },
    )
    .await?;
    counter!("control_plane_join_requests_total").increment(1);
    info!(request_id = %record.id, hostname = %record.identity.hostname, "join requested");

    join_request_view(record)
}

pub async fn get_join_request(state: &AppState, request_id: Uuid) -> ApiResult<JoinRequestView> {
    let record = join::get_request(&state.db, request_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("join request {request_id} not found")))?;
    join_request_view(record)
}

pub async fn list_join_requests(
    state: &AppState,
    status: Option<JoinRequestStatus>,
) -> ApiResult<Vec<JoinRequestView>> {
    let records = join::list_requests(&state.db, status.map(|s| s.as_str())).await?;
    records.into_iter().map(join_request_view).collect()
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct ApproveJoinRequest {
    pub request_id: Uuid,
    /// Explicit id for the new node; allocated when absent.
    #[serde(default)]
    pub node_id: Option<Uuid>,
    /// Profiles for the new node. Falls back to the profiles asked for
    /// in the request, then to the cluster default set.
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub message: String,
}

pub async fn approve_join(state: &AppState, req: ApproveJoinRequest) -> ApiResult<JoinRequestView> {
    validation::validate_profiles(&req.profiles, &state.limits)?;
    validation::validate_field_len("message", &req.message, &state.limits)?;

    let record = join::get_request(&state.db, req.request_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("join request {} not found", req.request_id)))?;
    let status = parse_request_status(&record.status)?;
    if status.is_resolved() {
        return Err(AppError::failed_precondition(format!(
            "join request {} is already {}",
            req.request_id,
            status.as_str()
        )));
    }

    let node_id = match req.node_id {
        Some(node_id) => {
            if nodes::get_node(&state.db, node_id).await?.is_some() {
                return Err(AppError::already_exists(format!(
                    "node {node_id} already exists"
                )));
            }
            node_id
        }
        None => Uuid::new_v4(),
    };

    let profiles = if !req.profiles.is_empty() {
        req.profiles
    } else if !record.profiles.0.is_empty() {
        record.profiles.0.clone()
    } else {
        state.cluster.default_profiles.clone()
    };

    let node = nodes::NewNode {
        id: node_id,
        identity: record.identity.0.clone(),
        profiles,
        metadata: record.metadata.0.clone(),
    };

    let updated = join::approve_request(&state.db, req.request_id, node, &req.message, Utc::now())
        .await?
        .ok_or_else(|| {
            AppError::failed_precondition(format!(
                "join request {} was resolved concurrently",
                req.request_id
            ))
        })?;

    counter!("control_plane_joins_approved_total").increment(1);
    info!(request_id = %req.request_id, node_id = %node_id, "join approved");
    state.kick_reconcile();

    join_request_view(updated)
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct RejectJoinRequest {
    pub request_id: Uuid,
    #[serde(default)]
    pub reason: String,
}

pub async fn reject_join(state: &AppState, req: RejectJoinRequest) -> ApiResult<JoinRequestView> {
    validation::validate_field_len("reason", &req.reason, &state.limits)?;

    let record = join::get_request(&state.db, req.request_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("join request {} not found", req.request_id)))?;
    let status = parse_request_status(&record.status)?;
    if status.is_resolved() {
        return Err(AppError::failed_precondition(format!(
            "join request {} is already {}",
            req.request_id,
            status.as_str()
        )));
    }

    let updated = join::reject_request(&state.db, req.request_id, &req.reason, Utc::now())
        .await?
        .ok_or_else(|| {
            AppError::failed_precondition(format!(
                "join request {} was resolved concurrently",
                req.request_id
            ))
        })?;

    counter!("control_plane_joins_rejected_total").increment(1);
    info!(request_id = %req.request_id, "join rejected");

    join_request_view(updated)
}

fn parse_request_status(raw: &str) -> ApiResult<JoinRequestStatus> {
    JoinRequestStatus::from_str(raw)
        .map_err(|err| AppError::internal(format!("corrupt join request record: {err}")))
}

pub(crate) fn join_request_view(record: db::JoinRequestRecord) -> ApiResult<JoinRequestView> {
    let status = parse_request_status(&record.status)?;
    Ok(JoinRequestView {
        request_id: record.id,
        identity: record.identity.0,
        status,
        message: record.message,
        profiles: record.profiles.0,
        metadata: record.metadata.0,
        node_id: record.node_id,
        requested_at: record.requested_at,
    })
}
