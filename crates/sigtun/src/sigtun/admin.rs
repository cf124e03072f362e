use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, put},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::sigtun::signal::SignalServer;

#[derive(Clone)]
pub struct AdminState {
    pub signal: Arc<SignalServer>,
    pub active_connections: Arc<AtomicUsize>,
    pub prometheus: PrometheusHandle,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .route("/users/{uid}", put(put_user).delete(delete_user))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_connections: usize,
    pending_answers: usize,
    users: usize,
}

async fn stats(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = StatsResponse {
        active_connections: st.active_connections.load(Ordering::Relaxed),
        pending_answers: st.signal.pending_answers().await,
        users: st.signal.credentials().len().await,
    };
    (StatusCode::OK, Json(snap))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prometheus.render(),
    )
}

async fn put_user(
    State(st): State<Arc<AdminState>>,
    Path(uid): Path<String>,
    body: Bytes,
) -> StatusCode {
    let Ok(uid) = uid.parse::<u64>() else {
        return StatusCode::BAD_REQUEST;
    };
    if body.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    st.signal.add_password(uid, body.to_vec()).await;
    tracing::info!(uid, "admin: user set");
    StatusCode::NO_CONTENT
}

async fn delete_user(State(st): State<Arc<AdminState>>, Path(uid): Path<String>) -> StatusCode {
    let Ok(uid) = uid.parse::<u64>() else {
        return StatusCode::BAD_REQUEST;
    };
    if st.signal.remove_password(uid).await {
        tracing::info!(uid, "admin: user removed");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};

    use crate::sigtun::signal::{Credentials, SignalServerOptions};

    async fn spawn_admin() -> (String, Arc<SignalServer>, Arc<AtomicUsize>) {
        let (base, signal, active, _recorder) = spawn_admin_with_recorder().await;
        (base, signal, active)
    }

    async fn spawn_admin_with_recorder()
    -> (String, Arc<SignalServer>, Arc<AtomicUsize>, PrometheusRecorder) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let signal = Arc::new(SignalServer::new(
            Arc::new(Credentials::default()),
            SignalServerOptions::default(),
        ));
        let active = Arc::new(AtomicUsize::new(3));
        let app = router(AdminState {
            signal: signal.clone(),
            active_connections: active.clone(),
            prometheus: recorder.handle(),
        });

        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", ln.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(ln, app).await });
        (base, signal, active, recorder)
    }

    #[tokio::test]
    async fn metrics_render_prometheus_text() {
        let (base, _signal, _active, recorder) = spawn_admin_with_recorder().await;
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("sigtun_connections_total").increment(4);
        });

        let resp = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.text().await.unwrap();
        assert!(body.contains("sigtun_connections_total 4"), "{body}");
    }

    #[tokio::test]
    async fn stats_reflect_live_state() {
        let (base, _signal, _active) = spawn_admin().await;

        let health: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["ok"], true);

        let stats: serde_json::Value = reqwest::get(format!("{base}/stats"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["active_connections"], 3);
        assert_eq!(stats["pending_answers"], 0);
        assert_eq!(stats["users"], 0);
    }

    #[tokio::test]
    async fn users_can_be_added_and_removed() {
        let (base, signal, _active) = spawn_admin().await;
        let http = reqwest::Client::new();

        let resp = http
            .put(format!("{base}/users/7"))
            .body("s3cr3t")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(signal.credentials().len().await, 1);

        let resp = http.put(format!("{base}/users/nope")).body("x").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = http.put(format!("{base}/users/8")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = http.delete(format!("{base}/users/7")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = http.delete(format!("{base}/users/7")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(signal.credentials().len().await, 0);
    }
}
