use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::error::ApiError;
use crate::ha::{Cluster, LeaderAnnouncement, VoteRequest};
use crate::persist;
use crate::registry::{
    ListFilter, NodePatch, NodeRole, NodeStatus, RegisterRequest, Registry,
};
use crate::synth;

/// Shared controller state across API handlers.
pub struct AppState {
    pub registry: Mutex<Registry>,
    pub cluster: Arc<Cluster>,
    pub state_file: Option<PathBuf>,
    pub token: Option<String>,
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    let nodes = Router::new()
        .route("/nodes", post(register_node).get(list_nodes))
        .route(
            "/nodes/:id",
            get(get_node).put(update_node).delete(delete_node),
        )
        .route("/nodes/:id/config", get(node_config))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .merge(nodes)
        .route("/health", get(health))
        .route("/ha/health", get(ha_health))
        .route("/ha/election", post(ha_election))
        .route("/ha/leader", post(ha_leader))
        .with_state(state)
}

/// Rejects requests without the configured bearer token. Cluster-internal
/// and liveness-probe routes stay open; this wraps `/nodes*` only.
async fn require_bearer(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.token else {
        return next.run(req).await;
    };

    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|presented| presented == expected)
        .unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "code": "UNAUTHORIZED",
                "error": "missing or invalid bearer token",
            })),
        )
            .into_response()
    }
}

fn persist_after_mutation(state: &AppState, registry: &Registry) {
    if let Some(path) = &state.state_file {
        if let Err(err) = persist::save(registry, path) {
            warn!("failed to persist registry state: {err:#}");
        }
    }
}

// -----------------------------------------------------------------------------
// Node API
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub name: String,
    pub role: String,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub keepalive: Option<u16>,
    pub mtu: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBody {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub keepalive: Option<u16>,
    pub status: Option<NodeStatus>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub role: Option<NodeRole>,
    pub status: Option<NodeStatus>,
}

/// POST /nodes
async fn register_node(
    State(state): State<SharedState>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, ApiError> {
    let role: NodeRole = body.role.parse()?;

    // Leadership is checked while holding the registry lock so a
    // replica stepping down cannot admit a racing write.
    let mut registry = state.registry.lock().unwrap();
    state.cluster.ensure_leader()?;

    let node = registry.register(RegisterRequest {
        name: body.name,
        role,
        public_key: body.public_key,
        endpoint: body.endpoint,
        port: body.port,
        keepalive: body.keepalive,
        mtu: body.mtu,
    })?;

    persist_after_mutation(&state, &registry);
    Ok((StatusCode::CREATED, Json(node)))
}

/// GET /nodes
async fn list_nodes(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let registry = state.registry.lock().unwrap();
    Json(registry.list(ListFilter {
        role: query.role,
        status: query.status,
    }))
}

/// GET /nodes/{id}
async fn get_node(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = state.registry.lock().unwrap();
    Ok(Json(registry.get(&id)?))
}

/// PUT /nodes/{id} — status patches double as the agent's liveness
/// report (`{"status": "active"}`).
async fn update_node(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mut registry = state.registry.lock().unwrap();
    state.cluster.ensure_leader()?;

    let node = registry.update(
        &id,
        NodePatch {
            name: body.name,
            endpoint: body.endpoint,
            port: body.port,
            keepalive: body.keepalive,
            status: body.status,
        },
    )?;

    persist_after_mutation(&state, &registry);
    Ok(Json(node))
}

/// DELETE /nodes/{id}
async fn delete_node(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut registry = state.registry.lock().unwrap();
    state.cluster.ensure_leader()?;

    registry.delete(&id)?;
    persist_after_mutation(&state, &registry);
    Ok(StatusCode::NO_CONTENT)
}

/// GET /nodes/{id}/config
async fn node_config(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = state.registry.lock().unwrap();
    Ok(Json(synth::synthesize(&registry, &id)?))
}

/// GET /health
async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let role = if state.cluster.is_leader() {
        "leader"
    } else {
        "follower"
    };
    let nodes = state.registry.lock().unwrap().len();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "registry": { "status": "up", "nodes": nodes },
            "cluster": { "status": "up", "role": role },
        },
    }))
}

// -----------------------------------------------------------------------------
// Cluster-internal API
// -----------------------------------------------------------------------------

/// GET /ha/health
async fn ha_health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.cluster.health_probe())
}

/// POST /ha/election
async fn ha_election(
    State(state): State<SharedState>,
    Json(req): Json<VoteRequest>,
) -> impl IntoResponse {
    Json(state.cluster.handle_vote(&req))
}

/// POST /ha/leader
async fn ha_leader(
    State(state): State<SharedState>,
    Json(ann): Json<LeaderAnnouncement>,
) -> impl IntoResponse {
    state.cluster.handle_announcement(&ann);
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ha::ClusterConfig;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tower::ServiceExt;

    fn app(peers: &[&str], token: Option<&str>) -> (Router, SharedState) {
        let cluster = Arc::new(Cluster::new(ClusterConfig {
            node_id: "r1".into(),
            cluster_id: "test".into(),
            peers: peers.iter().map(|p| p.to_string()).collect(),
            heartbeat_interval: std::time::Duration::from_secs(5),
            election_timeout: std::time::Duration::from_secs(15),
        }));
        let state = Arc::new(AppState {
            registry: Mutex::new(Registry::new("10.100.0.0/16".parse().unwrap())),
            cluster,
            state_file: None,
            token: token.map(String::from),
        });
        (router(state.clone()), state)
    }

    fn register_json(name: &str, role: &str, tag: u8) -> String {
        json!({
            "name": name,
            "role": role,
            "publicKey": STANDARD.encode([tag; 32]),
            "endpoint": "h.example.com",
            "port": 51820,
        })
        .to_string()
    }

    fn post_nodes(body: String) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri("/nodes")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn leader_accepts_registration() {
        let (app, state) = app(&[], None);

        let resp = app
            .oneshot(post_nodes(register_json("H", "hub", 1)))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(state.registry.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn follower_rejects_writes_without_touching_registry() {
        let (app, state) = app(&["http://r2:8008", "http://r3:8008"], None);
        assert!(!state.cluster.is_leader());

        let resp = app
            .oneshot(post_nodes(register_json("H", "hub", 1)))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.registry.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn invalid_role_is_reported() {
        let (app, _) = app(&[], None);
        let resp = app
            .oneshot(post_nodes(register_json("H", "router", 1)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn bearer_token_guards_node_routes() {
        let (app, _) = app(&[], Some("s3cret"));

        let unauthorized = app
            .clone()
            .oneshot(post_nodes(register_json("H", "hub", 1)))
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let mut req = post_nodes(register_json("H", "hub", 1));
        req.headers_mut().insert(
            header::AUTHORIZATION,
            "Bearer s3cret".parse().unwrap(),
        );
        let authorized = app.clone().oneshot(req).await.unwrap();
        assert_eq!(authorized.status(), StatusCode::CREATED);

        // Health stays open for probes.
        let health = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn config_endpoint_serves_synthesized_peers() {
        let (app, state) = app(&[], None);

        app.clone()
            .oneshot(post_nodes(register_json("H", "hub", 1)))
            .await
            .unwrap();

        let spoke = json!({
            "name": "A",
            "role": "spoke",
            "publicKey": STANDARD.encode([2u8; 32]),
        })
        .to_string();
        app.clone().oneshot(post_nodes(spoke)).await.unwrap();

        let spoke_id = state
            .registry
            .lock()
            .unwrap()
            .list(ListFilter {
                role: Some(NodeRole::Spoke),
                status: None,
            })
            .pop()
            .unwrap()
            .id;

        let resp = app
            .oneshot(
                HttpRequest::builder()
                    .uri(format!("/nodes/{}/config", spoke_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        let cfg: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(cfg["peers"][0]["allowedIPs"][0], "0.0.0.0/0");
        assert_eq!(cfg["interface"]["address"][0], "10.100.0.2/16");
    }
}
