//! HTTP router assembly.

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Mode;
use crate::handlers::{close, health, routed, unified};
use crate::middleware::api_key_auth;
use crate::session::SESSION_HEADER;
use crate::transport::framing::MAX_FRAME_BYTES;
use crate::AppState;

/// CORS for browser-based MCP clients. Authorization and the MCP headers
/// must be listed explicitly; they are not covered by a wildcard.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(SESSION_HEADER),
            HeaderName::from_static("mcp-protocol-version"),
        ])
        .expose_headers([HeaderName::from_static(SESSION_HEADER)])
        .max_age(Duration::from_secs(3600))
}

/// Builds the router for the configured mode.
///
/// * routed: `POST /mcp/{backend_id}`
/// * unified: `POST /mcp`
///
/// Both get `POST /close` behind the same API key check; `GET /health` is
/// always open.
pub fn build_router(state: AppState) -> Router {
    let surface = match state.gateway.config().mode {
        Mode::Routed => Router::new().route("/mcp/{backend_id}", post(routed::handle)),
        Mode::Unified => Router::new().route("/mcp", post(unified::handle)),
    };

    let protected = surface
        .route("/close", post(close::handle))
        .route_layer(middleware::from_fn_with_state(state.clone(), api_key_auth));

    Router::new()
        .route("/health", get(health::handle))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer())
                .layer(DefaultBodyLimit::max(MAX_FRAME_BYTES)),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendSpec, GatewayConfig, HttpSpec};
    use crate::Gateway;
    use axum::{body::Body, http::Request, http::StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(mode: Mode) -> Router {
        let mut config = GatewayConfig::with_backends([BackendSpec::http(
            "docs",
            HttpSpec::new("http://127.0.0.1:9/mcp"),
        )]);
        config.mode = mode;
        build_router(AppState::new(Arc::new(Gateway::new(config))))
    }

    #[tokio::test]
    async fn preflight_allows_mcp_headers() {
        let response = app(Mode::Unified)
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/mcp")
                    .header("origin", "http://localhost:5173")
                    .header("access-control-request-method", "POST")
                    .header(
                        "access-control-request-headers",
                        "authorization,mcp-session-id",
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "*");
        let allowed = headers["access-control-allow-headers"].to_str().unwrap();
        assert!(allowed.contains("authorization"));
        assert!(allowed.contains("mcp-session-id"));
    }

    #[tokio::test]
    async fn close_only_accepts_post() {
        let response = app(Mode::Routed)
            .oneshot(Request::get("/close").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
