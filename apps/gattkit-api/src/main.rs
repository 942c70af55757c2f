use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::Stream;
use gattkit_driver::DriverKind;
use gattkit_kernel::{GattKernel, KernelArgs, KernelBuilder};
use gattkit_protocol::{Envelope, TraceEvent};
use gattkit_session::SessionAlert;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gattkit-api")]
#[command(about = "gattkit control-plane API")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:8788")]
    listen: SocketAddr,
    #[arg(long, env = "GATTKIT_DRIVER", default_value = "sim")]
    driver: DriverKind,
    #[arg(long = "log-level", env = "GATTKIT_LOG", default_value = "warn")]
    log_level: String,
    #[command(flatten)]
    kernel: KernelArgs,
}

#[derive(Clone)]
struct AppState {
    kernel: GattKernel,
}

#[derive(Debug, Deserialize)]
struct TraceStreamQuery {
    /// Recent events to replay before going live.
    replay: Option<usize>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .json()
        .init();

    let driver = gattkit_driver::open(cli.driver).await?;
    let kernel = KernelBuilder::new(driver)
        .config(cli.kernel.to_config()?)
        .build()
        .await?;
    let state = AppState {
        kernel: kernel.clone(),
    };

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, driver = ?cli.driver, "gattkit-api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    kernel.shutdown().await;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tools", get(list_tools))
        .route("/tools/{name}", post(call_tool))
        .route("/alerts", get(stream_alerts))
        .route("/trace", get(stream_trace))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "gattkit-api"
    }))
}

async fn list_tools(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "tools": state.kernel.tools() }))
}

/// Tool failures are still `200 OK`; only an unreadable body is a `400`.
async fn call_tool(
    Path(name): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<Envelope>> {
    let args = parse_args(&body)?;
    Ok(Json(state.kernel.call(&name, args).await))
}

fn parse_args(body: &[u8]) -> ApiResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|error| ApiError::bad_request(format!("request body is not JSON: {error}")))
}

async fn stream_alerts(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut alerts = state.kernel.subscribe_alerts();
    let stream = stream! {
        loop {
            match alerts.recv().await {
                Ok(alert) => {
                    yield Ok(alert_event(&alert));
                }
                Err(RecvError::Lagged(skipped)) => {
                    yield Ok(Event::default().event("stream.lagged").data(json!({ "skipped": skipped }).to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(keep_alive())
}

async fn stream_trace(
    Query(query): Query<TraceStreamQuery>,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let replay = query.replay.unwrap_or(50).min(1000);
    let mut subscription = state.kernel.subscribe_trace();
    let replay_events = state.kernel.trace_tail(replay).await;
    let mut next_seq = replay_events.last().map_or(0, |event| event.seq + 1);

    let stream = stream! {
        for event in replay_events {
            yield Ok(trace_event(&event));
        }
        loop {
            match subscription.recv().await {
                Ok(event) => {
                    if event.seq < next_seq {
                        continue;
                    }
                    next_seq = event.seq + 1;
                    yield Ok(trace_event(&event));
                }
                Err(RecvError::Lagged(skipped)) => {
                    yield Ok(Event::default().event("stream.lagged").data(json!({ "skipped": skipped }).to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(keep_alive())
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}

fn alert_name(alert: &SessionAlert) -> &'static str {
    match alert {
        SessionAlert::LinkLost { .. } => "link_lost",
        SessionAlert::NotificationsAvailable { .. } => "notifications_available",
    }
}

fn alert_event(alert: &SessionAlert) -> Event {
    let payload = serde_json::to_string(alert)
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    Event::default().event(alert_name(alert)).data(payload)
}

fn trace_event(event: &TraceEvent) -> Event {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    Event::default()
        .id(event.seq.to_string())
        .event(event.kind.name())
        .data(payload)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn state() -> AppState {
        let driver = gattkit_driver::open(DriverKind::Simulated).await.unwrap();
        AppState {
            kernel: KernelBuilder::new(driver).build().await.unwrap(),
        }
    }

    #[test]
    fn empty_bodies_mean_no_args() {
        assert_eq!(parse_args(b"").unwrap(), Value::Null);
        assert_eq!(parse_args(b" \n").unwrap(), Value::Null);
        assert_eq!(parse_args(br#"{"n": 5}"#).unwrap(), json!({"n": 5}));
        let error = parse_args(b"{oops").unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tool_calls_return_envelopes() {
        let state = state().await;
        let Json(listed) = call_tool(
            Path("ble.scans.list".to_owned()),
            State(state.clone()),
            Bytes::new(),
        )
        .await
        .unwrap();
        assert!(listed.ok);
        assert_eq!(listed.get("count"), Some(&json!(0)));

        let Json(unknown) = call_tool(
            Path("ble.nothing".to_owned()),
            State(state.clone()),
            Bytes::from_static(b"{}"),
        )
        .await
        .unwrap();
        assert!(!unknown.ok);
    }

    #[tokio::test]
    async fn tools_endpoint_lists_the_catalog() {
        let state = state().await;
        let Json(body) = list_tools(State(state.clone())).await;
        assert_eq!(
            body["tools"].as_array().map(Vec::len),
            Some(state.kernel.tools().len())
        );
    }
}
