use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use grog_ingest::WriteEvent;
use grog_store::LogStore;
use grog_telemetry::{MetricsRecorder, MetricsSnapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::assets;
use crate::config::{KeepaliveConfig, ServerConfig};
use crate::connection;
use crate::coordinator::BroadcastCoordinator;
use crate::engine::Engine;
use crate::registry::SessionRegistry;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub keepalive: KeepaliveConfig,
    pub max_inbound_message: usize,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(assets::index))
        .route("/main.js", get(assets::main_js))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving viewers. Completion events from
/// `events` drive broadcast cycles until `shutdown` fires.
pub async fn start(
    config: ServerConfig,
    store: LogStore,
    metrics: Arc<MetricsRecorder>,
    events: mpsc::Receiver<WriteEvent>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, io::Error> {
    config
        .window
        .validate()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let engine = Arc::new(Engine::new(
        store,
        SessionRegistry::new(config.max_send_queue),
        config.window.clone(),
        metrics,
    ));

    let coordinator =
        BroadcastCoordinator::new(Arc::clone(&engine)).start(events, shutdown.clone());

    let state = AppState {
        engine: Arc::clone(&engine),
        keepalive: config.keepalive.clone(),
        max_inbound_message: config.max_inbound_message,
        shutdown: shutdown.clone(),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(SocketAddr::new(config.host, config.port)).await?;
    let addr = listener.local_addr()?;

    tracing::info!(
        %addr,
        lookback = config.window.lookback,
        batch_size = config.window.batch_size,
        "grog server started"
    );

    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        addr,
        engine,
        server,
        coordinator,
    })
}

/// Handle returned by `start()`. Owns the listener and coordinator tasks.
pub struct ServerHandle {
    pub addr: SocketAddr,
    engine: Arc<Engine>,
    server: JoinHandle<()>,
    coordinator: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Background tasks, coordinator first, for a shutdown drain.
    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        vec![self.coordinator, self.server]
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_inbound_message)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    connection::handle_ws_connection(socket, state.engine, state.keepalive, state.shutdown).await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let engine = &state.engine;
    Json(serde_json::json!({
        "status": "healthy",
        "head": engine.store().head().get(),
        "sessions": engine.registry().count(),
        "metrics": metrics_json(&engine.metrics().snapshot()),
    }))
}

/// Flatten a snapshot to `{"name" | "name{k=v,..}": value}`.
fn metrics_json(snapshot: &MetricsSnapshot) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = snapshot
        .samples
        .iter()
        .map(|sample| {
            let key = if sample.labels.is_empty() {
                sample.name.clone()
            } else {
                let labels: Vec<String> = sample
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                format!("{}{{{}}}", sample.name, labels.join(","))
            };
            (key, serde_json::json!(sample.value))
        })
        .collect();
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grog_core::RecordKind;
    use grog_store::Database;
    use grog_telemetry::names;

    use crate::config::WindowConfig;

    fn store() -> LogStore {
        LogStore::open(Database::in_memory().unwrap()).unwrap()
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let store = store();
        store.append(b"one", RecordKind::Plain).unwrap();
        let (_tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        let handle = start(
            local_config(),
            store,
            Arc::new(MetricsRecorder::new()),
            rx,
            shutdown.clone(),
        )
        .await
        .unwrap();
        assert!(handle.port() > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["head"], 1);
        assert_eq!(body["sessions"], 0);

        shutdown.cancel();
        for task in handle.into_tasks() {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn serves_viewer_assets() {
        let (_tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = start(
            local_config(),
            store(),
            Arc::new(MetricsRecorder::new()),
            rx,
            shutdown.clone(),
        )
        .await
        .unwrap();

        let base = format!("http://127.0.0.1:{}", handle.port());
        let page = reqwest::get(&base).await.unwrap();
        assert_eq!(page.status(), 200);
        assert!(page
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        assert!(page.text().await.unwrap().contains("main.js"));

        let script = reqwest::get(format!("{base}/main.js")).await.unwrap();
        assert_eq!(script.status(), 200);
        let script = script.text().await.unwrap();
        assert!(script.contains("WebSocket"));
        // Scrolling and clicking both reposition the cursor.
        assert!(script.contains("addEventListener('scroll'"));
        assert!(script.contains("addEventListener('click'"));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn rejects_invalid_window() {
        let (_tx, rx) = mpsc::channel(8);
        let config = ServerConfig {
            window: WindowConfig {
                lookback: 10,
                batch_size: 10,
            },
            ..local_config()
        };
        let err = start(
            config,
            store(),
            Arc::new(MetricsRecorder::new()),
            rx,
            CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn metrics_json_flattens_labels() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::RECORDS_APPENDED, &[("source", "primary")], 3);
        recorder.gauge_set(names::SESSIONS_ACTIVE, &[], 2);

        let json = metrics_json(&recorder.snapshot());
        assert_eq!(json["records_appended{source=primary}"], 3.0);
        assert_eq!(json["sessions_active"], 2.0);
    }
}
