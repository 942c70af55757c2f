//! gattkitd: one JSON request per stdin line, one JSON response per stdout line.
//!
//! Requests look like `{"id": 1, "tool": "ble.read", "args": {...}}` and are
//! answered with `{"id": 1, "result": <envelope>}`. Calls run concurrently, so
//! responses may come back out of order. Session alerts are written as
//! `{"alert": ...}` lines. Logs go to stderr.

use std::io;

use anyhow::Result;
use clap::Parser;
use gattkit_driver::DriverKind;
use gattkit_kernel::{GattKernel, KernelArgs, KernelBuilder};
use gattkit_protocol::{Envelope, SessionError};
use gattkit_session::SessionAlert;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Answered by the daemon itself: every core tool plus registered extension operations.
const TOOLS_LIST: &str = "tools.list";

#[derive(Debug, Parser)]
#[command(name = "gattkitd")]
#[command(about = "BLE session tools over JSON lines on stdio")]
struct Cli {
    /// Device driver: `sim` or `btleplug`.
    #[arg(long, env = "GATTKIT_DRIVER", default_value = "sim")]
    driver: DriverKind,
    /// tracing filter directive, e.g. `info` or `gattkit_session=debug`.
    #[arg(long = "log-level", env = "GATTKIT_LOG", default_value = "warn")]
    log_level: String,
    #[command(flatten)]
    kernel: KernelArgs,
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    args: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .compact()
        .init();

    let driver = gattkit_driver::open(cli.driver).await?;
    let kernel = KernelBuilder::new(driver)
        .config(cli.kernel.to_config()?)
        .build()
        .await?;
    info!(driver = ?cli.driver, "gattkitd ready");

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(out_rx));
    let alerts = tokio::spawn(forward_alerts(kernel.subscribe_alerts(), out_tx.clone()));

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let interrupted = loop {
        tokio::select! {
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    let kernel = kernel.clone();
                    let out = out_tx.clone();
                    in_flight.spawn(async move {
                        if let Some(response) = respond(&kernel, &line).await
                            && out.send(response.to_string()).is_err()
                        {
                            debug!("stdout writer is gone");
                        }
                    });
                }
                Ok(None) => break false,
                Err(error) => {
                    warn!(%error, "failed reading stdin");
                    break false;
                }
            },
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            _ = &mut ctrl_c => break true,
        }
    };

    if interrupted {
        info!("interrupted, shutting down");
        in_flight.abort_all();
    }
    while in_flight.join_next().await.is_some() {}
    kernel.shutdown().await;
    alerts.abort();
    drop(out_tx);
    writer.await??;
    Ok(())
}

/// The response line for one request line, or `None` for a blank line.
async fn respond(kernel: &GattKernel, line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (id, envelope) = match serde_json::from_str::<Request>(line) {
        Ok(request) if request.tool == TOOLS_LIST => (
            request.id,
            Envelope::ok(json!({ "tools": kernel.tools() })),
        ),
        Ok(request) => {
            let envelope = kernel.call(&request.tool, request.args).await;
            (request.id, envelope)
        }
        Err(error) => {
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|value| value.get("id").cloned())
                .unwrap_or(Value::Null);
            let error = SessionError::InvalidArgument(format!("malformed request: {error}"));
            (id, Envelope::err(&error))
        }
    };
    Some(json!({ "id": id, "result": envelope }))
}

async fn forward_alerts(mut alerts: broadcast::Receiver<SessionAlert>, out: mpsc::UnboundedSender<String>) {
    loop {
        match alerts.recv().await {
            Ok(alert) => {
                if out.send(json!({ "alert": alert }).to_string()).is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "alert stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn write_lines(mut lines: mpsc::UnboundedReceiver<String>) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.recv().await {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn kernel() -> GattKernel {
        let driver = gattkit_driver::open(DriverKind::Simulated).await.unwrap();
        KernelBuilder::new(driver).build().await.unwrap()
    }

    #[tokio::test]
    async fn blank_lines_get_no_response() {
        let kernel = kernel().await;
        assert!(respond(&kernel, "   ").await.is_none());
    }

    #[tokio::test]
    async fn responses_echo_the_request_id() {
        let kernel = kernel().await;
        let response = respond(&kernel, r#"{"id": "a-1", "tool": "ble.connections.list"}"#)
            .await
            .unwrap();
        assert_eq!(response["id"], "a-1");
        assert_eq!(response["result"]["ok"], true);
        assert_eq!(response["result"]["count"], 0);
    }

    #[tokio::test]
    async fn tools_list_is_answered_locally() {
        let kernel = kernel().await;
        let response = respond(&kernel, r#"{"id": 7, "tool": "tools.list"}"#).await.unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), kernel.tools().len());
        assert!(tools.iter().any(|tool| tool["name"] == "ble.scan_start"));
    }

    #[tokio::test]
    async fn malformed_requests_keep_their_id() {
        let kernel = kernel().await;
        let response = respond(&kernel, r#"{"id": 3, "args": {}}"#).await.unwrap();
        assert_eq!(response["id"], 3);
        assert_eq!(response["result"]["ok"], false);
        assert_eq!(response["result"]["error"]["code"], "invalid_argument");

        let garbage = respond(&kernel, "not json").await.unwrap();
        assert_eq!(garbage["id"], Value::Null);
    }

    #[test]
    fn cli_reads_driver_and_log_level() {
        let cli = Cli::try_parse_from(["gattkitd", "--driver", "sim", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.driver, DriverKind::Simulated);
        assert_eq!(cli.log_level, "debug");
    }
}
