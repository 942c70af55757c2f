//! # gattkit-kernel
//!
//! [`KernelBuilder`] assembles a [`GattKernel`] from a device driver and a
//! [`KernelConfig`]. The kernel is the single entry point the daemons use:
//! one `call` per tool invocation, alert and trace subscriptions, and an
//! orderly shutdown. [`KernelArgs`] carries the command-line settings.

pub mod args;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use gattkit_events::{DEFAULT_TAIL_CAPACITY, TraceJournal};
use gattkit_policy::StaticPolicyEngine;
use gattkit_protocol::{DeviceDriver, Envelope, PolicySet, SessionResult, TraceEvent, TraceEventKind};
use gattkit_session::{RegistryConfig, SessionAlert, SessionRegistry};
use gattkit_tools::{ExtensionDescriptor, ExtensionHandler, SpecIndex, ToolDefinition, ToolDispatcher};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use args::KernelArgs;

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub registry: RegistryConfig,
    pub allow_writes: bool,
    /// When set, characteristic writes are limited to these UUIDs.
    pub write_allowlist: Option<Vec<Uuid>>,
    pub trace_file: Option<PathBuf>,
    pub trace_tail_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            allow_writes: false,
            write_allowlist: None,
            trace_file: None,
            trace_tail_capacity: DEFAULT_TAIL_CAPACITY,
        }
    }
}

impl KernelConfig {
    pub fn policy(&self) -> PolicySet {
        PolicySet::from_write_settings(self.allow_writes, self.write_allowlist.as_deref())
    }
}

#[derive(Clone)]
pub struct KernelBuilder {
    driver: Arc<dyn DeviceDriver>,
    config: KernelConfig,
}

impl KernelBuilder {
    pub fn new(driver: Arc<dyn DeviceDriver>) -> Self {
        Self {
            driver,
            config: KernelConfig::default(),
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry_config(mut self, registry: RegistryConfig) -> Self {
        self.config.registry = registry;
        self
    }

    pub fn allow_writes(mut self, allow_writes: bool) -> Self {
        self.config.allow_writes = allow_writes;
        self
    }

    pub fn write_allowlist(mut self, allowlist: Vec<Uuid>) -> Self {
        self.config.write_allowlist = Some(allowlist);
        self
    }

    pub fn trace_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.trace_file = Some(path.into());
        self
    }

    /// Must run inside a tokio runtime: it spawns the alert forwarder.
    pub async fn build(self) -> Result<GattKernel> {
        let journal = match &self.config.trace_file {
            Some(path) => TraceJournal::with_file(path, self.config.trace_tail_capacity).await?,
            None => TraceJournal::in_memory(self.config.trace_tail_capacity),
        };
        let policy = Arc::new(StaticPolicyEngine::from_policy_set(&self.config.policy()));
        let sessions = SessionRegistry::new(self.driver, self.config.registry.clone());
        let forwarder = tokio::spawn(forward_link_losses(sessions.subscribe_alerts(), journal.clone()));
        let dispatcher = ToolDispatcher::new(sessions, policy, journal, Arc::new(SpecIndex::new()));

        info!(
            allow_writes = self.config.allow_writes,
            allowlist = self.config.write_allowlist.as_ref().map(Vec::len),
            trace_file = ?self.config.trace_file,
            "kernel ready"
        );
        Ok(GattKernel {
            dispatcher,
            forwarder: Arc::new(Mutex::new(Some(forwarder))),
        })
    }
}

async fn forward_link_losses(mut alerts: broadcast::Receiver<SessionAlert>, journal: TraceJournal) {
    loop {
        match alerts.recv().await {
            Ok(SessionAlert::LinkLost {
                connection_id,
                address,
                ..
            }) => {
                journal
                    .append_and_publish(TraceEventKind::LinkLost {
                        connection_id,
                        address,
                    })
                    .await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "alert forwarder lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    debug!("alert forwarder stopped");
}

#[derive(Clone)]
pub struct GattKernel {
    dispatcher: ToolDispatcher,
    forwarder: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl GattKernel {
    #[instrument(skip(self, args))]
    pub async fn call(&self, tool: &str, args: Value) -> Envelope {
        self.dispatcher.dispatch(tool, args).await
    }

    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.dispatcher.tools()
    }

    pub fn register_extension(
        &self,
        descriptor: ExtensionDescriptor,
        handler: Arc<dyn ExtensionHandler>,
    ) -> SessionResult<()> {
        self.dispatcher.register_extension(descriptor, handler)
    }

    pub fn sessions(&self) -> &SessionRegistry {
        self.dispatcher.sessions()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<SessionAlert> {
        self.dispatcher.sessions().subscribe_alerts()
    }

    pub fn subscribe_trace(&self) -> broadcast::Receiver<TraceEvent> {
        self.dispatcher.journal().subscribe()
    }

    /// The most recent `n` trace events, oldest first.
    pub async fn trace_tail(&self, n: usize) -> Vec<TraceEvent> {
        self.dispatcher.journal().tail(n).await
    }

    /// Stop every scan, close every link and stop the alert forwarder.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.dispatcher.sessions().shutdown().await;
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        info!("kernel shut down");
    }
}
