//! Serving gateway.
//!
//! Front door for plugin assets: `GET /{plugin_id}/{path}`. A request for a
//! cached instance is proxied straight to its static server; a miss runs
//! the cold-start pipeline (extract, resolve dependencies, start the server,
//! register) and then proxies. The root HTML document is rewritten on the
//! way out to carry the capability bridge.
//!
//! Every response, asset or error, is marked `Cache-Control: no-store` so
//! nothing sticks around after an instance is evicted, and
//! `X-Frame-Options: SAMEORIGIN` so plugin documents only render inside the
//! dashboard's own frames.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::bridge::inject_bridge;
use crate::error::HostError;
use crate::extractor::Extractor;
use crate::registry::{EvictionReason, InstanceRegistry, RunningInstance};
use crate::resolver::Resolver;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<InstanceRegistry>,
    pub extractor: Arc<Extractor>,
    pub resolver: Arc<Resolver>,
    pub supervisor: Arc<Supervisor>,
    pub http: reqwest::Client,
}

/// Build the gateway router. CORS is restricted to the configured dashboard
/// origins; methods are read-only.
pub fn build_router(state: GatewayState) -> Router {
    let origins: Vec<HeaderValue> = state
        .registry
        .config()
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::HEAD])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/instances", get(list_instances))
        .route("/{plugin_id}", get(serve_root))
        .route("/{plugin_id}/{*path}", get(serve_asset))
        .layer(cors)
        .layer(axum::middleware::map_response(finalize))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn list_instances(State(state): State<GatewayState>) -> impl IntoResponse {
    axum::Json(state.registry.snapshot())
}

async fn serve_root(
    State(state): State<GatewayState>,
    Path(plugin_id): Path<String>,
) -> Response {
    serve(&state, &plugin_id, "").await
}

async fn serve_asset(
    State(state): State<GatewayState>,
    Path((plugin_id, path)): Path<(String, String)>,
) -> Response {
    serve(&state, &plugin_id, &path).await
}

// ---------------------------------------------------------------------------
// Request pipeline
// ---------------------------------------------------------------------------

/// Reject traversal before anything touches the proxy: `..` segments,
/// absolute paths, and backslashes never reach an instance.
fn validate_asset_path(path: &str) -> Result<(), HostError> {
    if path.starts_with('/') {
        return Err(HostError::InvalidRequest("absolute asset path".to_string()));
    }
    if path.contains('\\') {
        return Err(HostError::InvalidRequest(
            "backslash in asset path".to_string(),
        ));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(HostError::InvalidRequest(
            "path traversal attempt".to_string(),
        ));
    }
    Ok(())
}

async fn serve(state: &GatewayState, plugin_id: &str, path: &str) -> Response {
    match serve_inner(state, plugin_id, path).await {
        Ok(resp) => resp,
        Err(e) => {
            if e.status().is_server_error() {
                tracing::error!(plugin = plugin_id, path, "request failed: {e}");
            } else {
                tracing::debug!(plugin = plugin_id, path, "request rejected: {e}");
            }
            e.into_response()
        }
    }
}

async fn serve_inner(
    state: &GatewayState,
    plugin_id: &str,
    path: &str,
) -> Result<Response, HostError> {
    let plugin_id: Uuid = plugin_id
        .parse()
        .map_err(|_| HostError::InvalidRequest("plugin id must be a UUID".to_string()))?;
    validate_asset_path(path)?;

    if let Some(instance) = state.registry.get(plugin_id) {
        instance.touch();
        match proxy(state, &instance, path, plugin_id).await {
            Ok(resp) => return Ok(resp),
            Err(HostError::ProxyFailure(reason)) => {
                // The cached instance is unreachable (likely a dead server
                // whose monitor has not reaped it yet). Evict and fall
                // through to one cold start.
                tracing::warn!(
                    plugin = %plugin_id,
                    port = instance.port,
                    "cached instance unreachable, restarting: {reason}"
                );
                state.registry.evict(&instance, EvictionReason::Crashed);
            }
            Err(e) => return Err(e),
        }
    }

    let instance = cold_start(state, plugin_id).await?;
    instance.touch();
    proxy(state, &instance, path, plugin_id).await
}

/// Extract, resolve, start, register. Concurrent cold starts for the same
/// plugin dedupe at the extractor; if another request won the race to
/// register, its instance is reused and ours is stopped.
async fn cold_start(
    state: &GatewayState,
    plugin_id: Uuid,
) -> Result<Arc<RunningInstance>, HostError> {
    let working_dir = state.extractor.extract(plugin_id).await?;

    for warning in state.resolver.resolve(&working_dir).await {
        tracing::warn!(plugin = %plugin_id, "dependency resolution: {warning}");
    }

    if let Some(existing) = state.registry.get(plugin_id) {
        return Ok(existing);
    }

    let instance = state.supervisor.start(plugin_id, working_dir).await?;
    if let Some(existing) = state.registry.get(plugin_id) {
        // Lost the registration race; keep the established instance.
        instance.signal_shutdown();
        state.registry.release_port(instance.port);
        return Ok(existing);
    }
    state.registry.put(Arc::clone(&instance));
    tracing::info!(plugin = %plugin_id, port = instance.port, "instance online");
    Ok(instance)
}

/// Forward the request to the instance's static server and rebuild the
/// response. Connection-level failures surface as `ProxyFailure` so the
/// caller can decide whether to retry via cold start.
async fn proxy(
    state: &GatewayState,
    instance: &RunningInstance,
    path: &str,
    plugin_id: Uuid,
) -> Result<Response, HostError> {
    let url = format!("http://127.0.0.1:{}/{path}", instance.port);
    let upstream = state
        .http
        .get(&url)
        .send()
        .await
        .map_err(|e| HostError::ProxyFailure(format!("requesting {url}: {e}")))?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let upstream_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = upstream
        .bytes()
        .await
        .map_err(|e| HostError::ProxyFailure(format!("reading body from {url}: {e}")))?;

    let content_type = content_type_for(path, upstream_type.as_deref());

    // Only the root document gets the bridge; assets stream through as-is.
    if status.is_success() && is_root_document(path) && content_type.starts_with("text/html") {
        let html = String::from_utf8_lossy(&body);
        let rewritten = inject_bridge(&html, plugin_id);
        return Ok(asset_response(status, &content_type, rewritten.into_bytes()));
    }

    Ok(asset_response(status, &content_type, body.to_vec()))
}

/// The entry document is the bare plugin URL or an explicit index.html at
/// the top level. Nested documents are served verbatim.
fn is_root_document(path: &str) -> bool {
    path.is_empty() || path == "index.html"
}

/// Content type by extension, trusting the upstream header only as a
/// fallback. The effective path for the bare plugin URL is `index.html`.
fn content_type_for(path: &str, upstream: Option<&str>) -> String {
    let effective = if path.is_empty() || path.ends_with('/') {
        "index.html"
    } else {
        path
    };
    let guess = mime_guess::from_path(effective);
    match guess.first() {
        Some(mime) => mime.to_string(),
        None => upstream
            .unwrap_or("application/octet-stream")
            .to_string(),
    }
}

fn asset_response(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, content_type.to_string())],
        body,
    )
        .into_response()
}

/// Stamp the headers every gateway response carries. Applied as a
/// router-level layer so diagnostics and error routes get them too.
async fn finalize(mut resp: Response) -> Response {
    let headers = resp.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("SAMEORIGIN"),
    );
    resp
}
