//! HTTP routes, one per control adapter command.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use traffic_core::profile::{ProfileDescriptor, ProfileUpdate};
use traffic_core::rfc2544::SweepConfig;
use traffic_core::{ControlAdapter, CoreError};

pub fn router(adapter: ControlAdapter) -> Router {
    let caps = adapter.capabilities();

    let mut app = Router::new()
        .route("/", get(index))
        .route("/api/capabilities", get(capabilities))
        .route("/api/interfaces", get(list_interfaces))
        .route("/api/traffic-profiles", get(list_profiles))
        .route("/api/traffic-profiles", post(create_profile))
        .route("/api/traffic-profiles/:name", put(update_profile))
        .route("/api/traffic-profiles/:name", delete(delete_profile))
        .route("/api/traffic-profiles/:name/enable", post(enable_profile))
        .route("/api/traffic-profiles/:name/disable", post(disable_profile))
        .route("/api/traffic/start", post(start_all))
        .route("/api/traffic/stop", post(stop_all))
        .route("/api/traffic/stats", get(get_stats))
        .route("/api/traffic/stats/reset", post(reset_stats));

    if caps.neighbor_discovery {
        app = app.route("/api/neighbors/discover", post(discover_neighbors));
    }
    if caps.rfc2544 {
        app = app
            .route("/api/rfc2544/start", post(rfc2544_start))
            .route("/api/rfc2544/results/:profile", get(rfc2544_results));
    }

    app.layer(CorsLayer::permissive()).with_state(adapter)
}

/// Core errors mapped onto HTTP status codes.
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) | CoreError::Unencodable(_) | CoreError::Oversize { .. } => {
                StatusCode::BAD_REQUEST
            }
            CoreError::UnknownPort(_) | CoreError::UnknownProfile(_) => StatusCode::NOT_FOUND,
            CoreError::DuplicateProfile(_)
            | CoreError::ImmutableWhileRunning(_)
            | CoreError::PortUnavailable(_)
            | CoreError::Overflow(_)
            | CoreError::SweepInProgress(_) => StatusCode::CONFLICT,
            CoreError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn index() -> &'static str {
    r#"Traffic Generator Control Plane

Endpoints:
  GET    /api/capabilities                     - subsystem presence
  GET    /api/interfaces                       - port catalogue
  GET    /api/traffic-profiles                 - profile catalogue
  POST   /api/traffic-profiles                 - create profile
  PUT    /api/traffic-profiles/<name>          - update profile
  DELETE /api/traffic-profiles/<name>          - delete profile
  POST   /api/traffic-profiles/<name>/enable   - start one profile
  POST   /api/traffic-profiles/<name>/disable  - stop one profile
  POST   /api/traffic/start                    - start all enabled profiles
  POST   /api/traffic/stop                     - stop all running profiles
  GET    /api/traffic/stats                    - counter snapshot
  POST   /api/traffic/stats/reset              - zero counters
  POST   /api/neighbors/discover               - refresh neighbor caches
  POST   /api/rfc2544/start                    - start a benchmark sweep
  GET    /api/rfc2544/results/<profile>        - sweep status/results
"#
}

async fn capabilities(State(adapter): State<ControlAdapter>) -> impl IntoResponse {
    Json(adapter.capabilities())
}

async fn list_interfaces(State(adapter): State<ControlAdapter>) -> ApiResult<impl IntoResponse> {
    let ports = adapter.list_ports().await?;
    Ok(Json(json!({ "ports": ports })))
}

async fn list_profiles(State(adapter): State<ControlAdapter>) -> ApiResult<impl IntoResponse> {
    let profiles = adapter.list_profiles().await?;
    Ok(Json(json!({ "profiles": profiles })))
}

async fn create_profile(
    State(adapter): State<ControlAdapter>,
    Json(desc): Json<ProfileDescriptor>,
) -> ApiResult<impl IntoResponse> {
    let outcome = adapter.create_profile(desc).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Keys a partial update may carry; anything else is ignored on input.
const UPDATE_KEYS: [&str; 15] = [
    "src_port",
    "dst_port",
    "dst_ip",
    "dst_l4_port",
    "src_l4_port",
    "protocol",
    "mpls_label",
    "vni",
    "vlan_outer",
    "vlan_inner",
    "bandwidth_mbps",
    "frame_size",
    "imix",
    "dscp",
    "impairments",
];

async fn update_profile(
    State(adapter): State<ControlAdapter>,
    Path(name): Path<String>,
    Json(mut body): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    if let Some(map) = body.as_object_mut() {
        map.retain(|key, _| UPDATE_KEYS.contains(&key.as_str()));
    }
    let update: ProfileUpdate = serde_json::from_value(body)
        .map_err(|e| ApiError(CoreError::Validation(e.to_string())))?;
    let warnings = adapter.update_profile(&name, update).await?;
    let view = adapter.get_profile(&name).await?;
    Ok(Json(json!({ "profile": view, "warnings": warnings })))
}

async fn delete_profile(
    State(adapter): State<ControlAdapter>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    adapter.delete_profile(&name).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn enable_profile(
    State(adapter): State<ControlAdapter>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    adapter.enable_profile(&name).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn disable_profile(
    State(adapter): State<ControlAdapter>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    adapter.disable_profile(&name).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn start_all(State(adapter): State<ControlAdapter>) -> ApiResult<impl IntoResponse> {
    let started = adapter.start_all().await?;
    Ok(Json(json!({ "started": started })))
}

async fn stop_all(State(adapter): State<ControlAdapter>) -> ApiResult<impl IntoResponse> {
    let stopped = adapter.stop_all().await?;
    Ok(Json(json!({ "stopped": stopped })))
}

async fn get_stats(State(adapter): State<ControlAdapter>) -> ApiResult<impl IntoResponse> {
    let snapshot = adapter.get_stats().await?;
    Ok(Json(snapshot))
}

async fn reset_stats(State(adapter): State<ControlAdapter>) -> ApiResult<impl IntoResponse> {
    adapter.reset_stats().await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Default, Deserialize)]
struct DiscoverRequest {
    #[serde(default)]
    interfaces: Option<Vec<String>>,
}

async fn discover_neighbors(
    State(adapter): State<ControlAdapter>,
    body: Option<Json<DiscoverRequest>>,
) -> ApiResult<impl IntoResponse> {
    let interfaces = body.and_then(|Json(req)| req.interfaces);
    let ports = adapter.discover_neighbors(interfaces).await?;
    Ok(Json(json!({ "ports": ports })))
}

#[derive(Debug, Deserialize)]
struct SweepRequest {
    profile: String,
    #[serde(flatten)]
    config: SweepConfig,
}

#[derive(Debug, Serialize)]
struct SweepStarted {
    run_id: String,
}

async fn rfc2544_start(
    State(adapter): State<ControlAdapter>,
    Json(req): Json<SweepRequest>,
) -> ApiResult<impl IntoResponse> {
    let run_id = adapter.rfc2544_start(&req.profile, req.config).await?;
    Ok((StatusCode::ACCEPTED, Json(SweepStarted { run_id })))
}

async fn rfc2544_results(
    State(adapter): State<ControlAdapter>,
    Path(profile): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let report = adapter.rfc2544_status(&profile).await?;
    Ok(Json(report))
}
