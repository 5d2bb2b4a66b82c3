//! HTTP server exposing `/probe`, `/metrics` and `/health`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{MatchedPath, Query, Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::collector::{AccountCollector, Collector, CollectorError, build_client};
use crate::config::ProbeConfig;
use crate::family::{TEXT_CONTENT_TYPE, encode_text};
use crate::telemetry::{OPENMETRICS_CONTENT_TYPE, ProbeOutcome, SharedMetrics};

/// Errors returned by the `/probe` endpoint.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Missing parameter: 'target'")]
    MissingTarget,

    #[error("forbidden host: {0:?}")]
    ForbiddenHost(String),

    #[error(transparent)]
    Collect(#[from] CollectorError),
}

impl ProbeError {
    fn outcome(&self) -> ProbeOutcome {
        match self {
            ProbeError::MissingTarget => ProbeOutcome::MissingTarget,
            ProbeError::ForbiddenHost(_) => ProbeOutcome::ForbiddenHost,
            ProbeError::Collect(_) => ProbeOutcome::Failure,
        }
    }
}

impl IntoResponse for ProbeError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProbeError::MissingTarget => {
                warn!(error_type = "missing_target", "Responding with 400");
                StatusCode::BAD_REQUEST
            }
            ProbeError::ForbiddenHost(host) => {
                debug!(host = %host, "Rejected target host");
                warn!(error_type = "forbidden_host", "Responding with 403");
                StatusCode::FORBIDDEN
            }
            ProbeError::Collect(e) => {
                // The error text can carry the target URL.
                debug!(error = %e, "Collection failed");
                error!(error_type = "collection", kind = e.kind(), "Responding with 500");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, format!("{self}\n")).into_response()
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    client: reqwest::Client,
    probe: Arc<ProbeConfig>,
    metrics: SharedMetrics,
}

impl AppState {
    /// Create the state, building the upstream HTTP client.
    pub fn new(probe: ProbeConfig, metrics: SharedMetrics) -> Result<Self, CollectorError> {
        let client = build_client(probe.timeout())?;
        Ok(Self {
            client,
            probe: Arc::new(probe),
            metrics,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProbeParams {
    target: Option<String>,
}

/// Create the HTTP router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/probe", get(probe_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            track_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Check that `target` is an absolute URL on the allowed host.
///
/// The host is compared case-sensitively as written in `target`, before URL
/// normalization. Scheme, userinfo and port are not part of the comparison.
/// A target without a host is rejected like any other host.
pub fn authorize_target(target: &str, allowed_host: &str) -> Result<Url, ProbeError> {
    let url = Url::parse(target).map_err(|_| ProbeError::ForbiddenHost(String::new()))?;
    let host = written_host(target).unwrap_or_default();
    debug!(host, "Probe target host");

    if host != allowed_host {
        return Err(ProbeError::ForbiddenHost(host.to_string()));
    }

    // The fetch goes to the parsed host; it must be the one that was checked.
    let parsed = url.host_str().unwrap_or_default();
    if !parsed.eq_ignore_ascii_case(host) {
        return Err(ProbeError::ForbiddenHost(parsed.to_string()));
    }
    Ok(url)
}

/// Host of `target` exactly as written, without userinfo or port.
fn written_host(target: &str) -> Option<&str> {
    let (_, rest) = target.split_once("://")?;
    let authority = rest.split(['/', '\\', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

    if host_port.starts_with('[') {
        return host_port.find(']').map(|end| &host_port[..=end]);
    }
    host_port.split(':').next()
}

/// Handler for the /probe endpoint.
async fn probe_handler(
    State(state): State<AppState>,
    Query(params): Query<ProbeParams>,
) -> Result<Response, ProbeError> {
    let result = probe(&state, params).await;

    state.metrics.record_probe(match &result {
        Ok(_) => ProbeOutcome::Success,
        Err(e) => e.outcome(),
    });

    let body = result?;
    Ok((StatusCode::OK, [(CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response())
}

async fn probe(state: &AppState, params: ProbeParams) -> Result<String, ProbeError> {
    let target = params
        .target
        .filter(|t| !t.is_empty())
        .ok_or(ProbeError::MissingTarget)?;

    let url = authorize_target(&target, &state.probe.allowed_host)?;

    let collector = AccountCollector::new(state.client.clone(), url, state.probe.require_accounts);
    let families = collector.collect().await?;

    Ok(encode_text(&families))
}

/// Handler for the /metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode exporter metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Count requests and their latency per matched route.
async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;

    state
        .metrics
        .observe_request(&method, &path, response.status().as_u16(), start.elapsed());
    response
}

/// HTTP server bound to its listen address.
pub struct HttpServer {
    state: AppState,
    listener: TcpListener,
}

impl HttpServer {
    /// Bind the listen address. Fails right away if the address is unusable.
    pub async fn bind(state: AppState, listen_addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", listen_addr, e))?;
        Ok(Self { state, listener })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        let allowed_host = self.state.probe.allowed_host.clone();
        let router = create_router(self.state);

        info!(
            addr = %addr,
            allowed_host = %allowed_host,
            "HTTP server listening"
        );

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ExporterMetrics;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_state() -> AppState {
        let probe = ProbeConfig {
            allowed_host: "rsync.example.net".to_string(),
            ..Default::default()
        };
        AppState::new(probe, Arc::new(ExporterMetrics::new())).unwrap()
    }

    fn make_router() -> Router {
        create_router(make_state())
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_authorize_target() {
        let url = authorize_target("https://rsync.example.net/blah.xml", "rsync.example.net")
            .unwrap();
        assert_eq!(url.path(), "/blah.xml");

        // Scheme, userinfo and port do not matter.
        assert!(authorize_target("http://rsync.example.net:8080/x", "rsync.example.net").is_ok());
        assert!(
            authorize_target("https://user:pw@rsync.example.net/x", "rsync.example.net").is_ok()
        );
        assert!(authorize_target("http://[::1]:9770/x", "[::1]").is_ok());
    }

    #[test]
    fn test_authorize_target_is_case_sensitive() {
        assert!(matches!(
            authorize_target("https://RSYNC.EXAMPLE.NET/blah.xml", "rsync.example.net"),
            Err(ProbeError::ForbiddenHost(_))
        ));

        // An allowed host written with capitals matches the same spelling.
        assert!(authorize_target("https://RSYNC.example.net/blah.xml", "RSYNC.example.net").is_ok());
        assert!(authorize_target("https://rsync.example.net/blah.xml", "RSYNC.example.net").is_err());
    }

    #[test]
    fn test_written_host() {
        assert_eq!(written_host("https://www.rsync.net/am/rss.xml"), Some("www.rsync.net"));
        assert_eq!(written_host("https://a:b@Host.example:443?x"), Some("Host.example"));
        assert_eq!(written_host("http://[::1]:80/"), Some("[::1]"));
        assert_eq!(written_host("no-scheme/path"), None);
    }

    #[test]
    fn test_authorize_target_rejects_other_hosts() {
        for target in [
            "https://www.example.org/blah.xml",
            "https://rsync.example.net.attacker.example/x",
            "https://rsync.example.net@attacker.example/x",
            "rsync.example.net/blah.xml",
            "file:///etc/passwd",
            "https://attacker.example\\@rsync.example.net/x",
            "https://rsync%2Eexample.net/x",
        ] {
            let err = authorize_target(target, "rsync.example.net").unwrap_err();
            assert!(
                matches!(err, ProbeError::ForbiddenHost(_)),
                "{target} should be forbidden"
            );
        }
    }

    #[tokio::test]
    async fn test_probe_missing_target() {
        let response = make_router()
            .oneshot(Request::get("/probe").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("Missing"));
    }

    #[tokio::test]
    async fn test_probe_empty_target() {
        let response = make_router()
            .oneshot(Request::get("/probe?target=").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_probe_forbidden_host() {
        let response = make_router()
            .oneshot(
                Request::get("/probe?target=https%3A%2F%2Fwww.example.org%2Fblah.xml")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_text(response).await.contains("forbidden host"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = make_router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("openmetrics-text"));
        assert!(body_text(response).await.contains("rsyncnet_exporter_info"));
    }

    #[tokio::test]
    async fn test_metrics_count_probes() {
        let router = make_router();

        router
            .clone()
            .oneshot(Request::get("/probe").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_text(response).await;

        assert!(body.contains("rsyncnet_exporter_probes_total{outcome=\"missing_target\"} 1"));
        assert!(body.contains(
            "rsyncnet_exporter_http_requests_total{method=\"GET\",path=\"/probe\",status=\"400\"} 1"
        ));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = make_router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let response = make_router()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let server = HttpServer::bind(make_state(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_fails_on_address_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let result = HttpServer::bind(make_state(), addr).await;

        let err = result.err().expect("binding a used port should fail");
        assert!(err.to_string().contains("Failed to bind"));
    }
}
