//! Status HTTP endpoints.
//!
//! Used by load balancers and orchestration systems to decide whether the
//! tunnel should receive traffic.

use std::io;
use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use super::metrics::MetricsSnapshot;
use super::StatusReporter;

/// Status router state.
#[derive(Clone)]
struct StatusState {
    reporter: StatusReporter,
    metrics_prefix: String,
}

/// Create status routes.
pub fn routes(reporter: StatusReporter, metrics_prefix: impl Into<String>) -> Router {
    Router::new()
        .route("/_status", get(status))
        .route("/_metrics", get(metrics))
        .route("/livez", get(livez))
        .with_state(StatusState {
            reporter,
            metrics_prefix: metrics_prefix.into(),
        })
}

/// Serve the status routes until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    reporter: StatusReporter,
    metrics_prefix: String,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "Status server listening");

    axum::serve(listener, routes(reporter, metrics_prefix))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    info!(%addr, "Status server stopped");
    Ok(())
}

/// Readiness: 200 while the listener accepts, 503 otherwise.
async fn status(State(state): State<StatusState>) -> impl IntoResponse {
    let snapshot = state.reporter.snapshot();
    let code = if snapshot.accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(snapshot))
}

async fn metrics(State(state): State<StatusState>) -> impl IntoResponse {
    Json(MetricsSnapshot::collect(&state.reporter, &state.metrics_prefix))
}

/// Liveness: the process is up.
async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{Lifecycle, ProcessStatus};
    use crate::testutil::TestPki;
    use crate::tunnel::TunnelStats;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn reporter(pki: &TestPki) -> StatusReporter {
        StatusReporter::new(
            "server",
            Arc::new(TunnelStats::default()),
            Arc::new(ProcessStatus::default()),
            Arc::new(pki.provider("server")),
        )
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_livez_returns_ok() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_unavailable_until_listening() {
        let pki = TestPki::new();
        let reporter = reporter(&pki);

        let (code, body) = get_json(routes(reporter.clone(), "ferry"), "/_status").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "starting");

        reporter.process().set(Lifecycle::Listening);
        let (code, body) = get_json(routes(reporter.clone(), "ferry"), "/_status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["accepting"], true);
        assert_eq!(body["mode"], "server");
    }

    #[tokio::test]
    async fn test_status_unavailable_while_stopping() {
        let pki = TestPki::new();
        let reporter = reporter(&pki);
        reporter.process().set(Lifecycle::Stopping);

        let (code, body) = get_json(routes(reporter, "ferry"), "/_status").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["accepting"], false);
    }

    #[tokio::test]
    async fn test_metrics_returns_array() {
        let pki = TestPki::new();
        let (code, body) = get_json(routes(reporter(&pki), "tun"), "/_metrics").await;

        assert_eq!(code, StatusCode::OK);
        let records = body.as_array().unwrap();
        assert!(records.iter().any(|r| r["name"] == "tun.conn.open"));
    }
}
