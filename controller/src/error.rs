use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error kinds surfaced by the controller API.
///
/// Each variant maps to a stable machine-readable code so callers never
/// have to parse messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("node name is already registered")]
    NameTaken,
    #[error("public key is already registered")]
    KeyTaken,
    #[error("role must be \"hub\" or \"spoke\"")]
    InvalidRole,
    #[error("public key must be a base64-encoded 32-byte Curve25519 key")]
    InvalidKey,
    #[error("hub registration requires an endpoint")]
    EndpointRequired,
    #[error("address is already allocated")]
    AddressInUse,
    #[error("no free addresses left in the overlay subnet")]
    PoolExhausted,
    #[error("node not found")]
    NodeNotFound,
    #[error("node is disabled")]
    NodeDisabled,
    #[error("this replica is not the leader")]
    NotLeader { leader: Option<String> },
    #[error("no leader is currently available")]
    NoLeaderAvailable,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NameTaken => "NAME_TAKEN",
            ApiError::KeyTaken => "KEY_TAKEN",
            ApiError::InvalidRole => "INVALID_ROLE",
            ApiError::InvalidKey => "INVALID_KEY",
            ApiError::EndpointRequired => "ENDPOINT_REQUIRED",
            ApiError::AddressInUse => "ADDRESS_IN_USE",
            ApiError::PoolExhausted => "POOL_EXHAUSTED",
            ApiError::NodeNotFound => "NODE_NOT_FOUND",
            ApiError::NodeDisabled => "NODE_DISABLED",
            ApiError::NotLeader { .. } => "NOT_LEADER",
            ApiError::NoLeaderAvailable => "NO_LEADER_AVAILABLE",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::NameTaken | ApiError::KeyTaken | ApiError::AddressInUse => {
                StatusCode::CONFLICT
            }
            ApiError::InvalidRole | ApiError::InvalidKey | ApiError::EndpointRequired => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NodeNotFound => StatusCode::NOT_FOUND,
            ApiError::NodeDisabled => StatusCode::GONE,
            ApiError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            ApiError::NoLeaderAvailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "code": self.code(),
            "error": self.to_string(),
        });

        if let ApiError::NotLeader {
            leader: Some(leader),
        } = &self
        {
            body["leader"] = json!(leader);
        }

        (self.status(), Json(body)).into_response()
    }
}
