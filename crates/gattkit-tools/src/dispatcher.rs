//! Turns `(tool, args)` calls into session operations and envelopes.

use std::sync::Arc;

use gattkit_events::TraceJournal;
use gattkit_policy::{PolicyEngine, authorize};
use gattkit_protocol::{
    CallId, Capability, ConnectionId, DescriptorRef, Envelope, Notification, ScanFilter, ScanId,
    SessionError, SessionResult, SpecStore, TraceEventKind, decode_value, encode_value,
};
use gattkit_session::{Batch, ConnectRequest, ScanRequest, SessionRegistry};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, warn};

use crate::args;
use crate::catalog::{ToolDefinition, ToolRegistry};
use crate::extensions::{ExtensionDescriptor, ExtensionHandler, ExtensionRegistry};
use crate::specs::{SpecIndex, SpecRegistration};

const DISCOVER_CAPABILITY: &str = "ble:discover";

#[derive(Clone)]
pub struct ToolDispatcher {
    sessions: SessionRegistry,
    tools: Arc<ToolRegistry>,
    policy: Arc<dyn PolicyEngine>,
    journal: TraceJournal,
    specs: Arc<SpecIndex>,
    extensions: Arc<ExtensionRegistry>,
}

impl ToolDispatcher {
    pub fn new(
        sessions: SessionRegistry,
        policy: Arc<dyn PolicyEngine>,
        journal: TraceJournal,
        specs: Arc<SpecIndex>,
    ) -> Self {
        Self {
            sessions,
            tools: Arc::new(ToolRegistry::with_core_tools()),
            policy,
            journal,
            specs,
            extensions: Arc::new(ExtensionRegistry::new()),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn journal(&self) -> &TraceJournal {
        &self.journal
    }

    pub fn specs(&self) -> Arc<SpecIndex> {
        self.specs.clone()
    }

    /// Core tool definitions followed by every extension operation.
    pub fn tools(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self.tools.definitions().cloned().collect();
        definitions.extend(self.extensions.definitions());
        definitions
    }

    pub fn register_extension(
        &self,
        descriptor: ExtensionDescriptor,
        handler: Arc<dyn ExtensionHandler>,
    ) -> SessionResult<()> {
        self.extensions.register(descriptor, handler, &self.tools)
    }

    /// Run one call. Never fails: every error is folded into the envelope.
    pub async fn dispatch(&self, tool: &str, args: Value) -> Envelope {
        let call_id = CallId::generate();
        let span = info_span!("tool.dispatch", call_id = %call_id, tool = %tool);
        async move {
            self.journal
                .append_and_publish(TraceEventKind::CallStarted {
                    call_id: call_id.clone(),
                    tool: tool.to_owned(),
                })
                .await;
            let started = Instant::now();
            let envelope = Envelope::from_result(self.run(tool, args).await);
            let duration_ms = started.elapsed().as_millis() as u64;
            let error_code = envelope.error_code();
            match error_code {
                Some(code) => warn!(code = code.as_str(), duration_ms, "tool call failed"),
                None => debug!(duration_ms, "tool call finished"),
            }
            self.journal
                .append_and_publish(TraceEventKind::CallFinished {
                    call_id,
                    tool: tool.to_owned(),
                    ok: envelope.ok,
                    error_code,
                    duration_ms,
                })
                .await;
            envelope
        }
        .instrument(span)
        .await
    }

    async fn gate(&self, capability: Capability) -> SessionResult<()> {
        authorize(self.policy.as_ref(), std::slice::from_ref(&capability)).await
    }

    async fn run(&self, tool: &str, args: Value) -> SessionResult<Value> {
        let args = match args {
            Value::Null => json!({}),
            Value::Object(_) => args,
            other => {
                return Err(SessionError::InvalidArgument(format!(
                    "args must be a JSON object, got {other}"
                )));
            }
        };
        let sessions = &self.sessions;

        match tool {
            "ble.scan_start" => {
                let timeout = args::seconds(&args, "timeout_s", 10.0, 0.1, 60.0)?;
                let filter = ScanFilter {
                    name_filter: args::optional_str(&args, "name_filter")?.map(str::to_owned),
                    service_uuid: args::optional_uuid(&args, "service_uuid")?,
                };
                let scan_id = sessions.create_scan(ScanRequest { timeout, filter }).await?;
                Ok(json!({"scan_id": scan_id, "timeout_s": timeout.as_secs_f64()}))
            }
            "ble.scan_get_results" => to_json(sessions.get_scan(&scan_id(&args)?)?),
            "ble.scan_stop" => to_json(sessions.stop_scan(&scan_id(&args)?).await?),
            "ble.connect" => {
                let address = args::required_str(&args, "address")?.trim().to_owned();
                let timeout = args::seconds(&args, "timeout_s", 10.0, 1.0, 60.0)?;
                to_json(
                    sessions
                        .create_connection(ConnectRequest { address, timeout })
                        .await?,
                )
            }
            "ble.disconnect" => to_json(sessions.disconnect(&args::connection_id(&args)?).await?),
            "ble.connection_status" => to_json(sessions.get_connection(&args::connection_id(&args)?)?),
            "ble.discover" => {
                let connection_id = args::connection_id(&args)?;
                self.gate(Capability::new(DISCOVER_CAPABILITY)).await?;
                let catalog = sessions.discover(&connection_id).await?;
                to_json(catalog.as_ref())
            }
            "ble.mtu" => to_json(sessions.mtu(&args::connection_id(&args)?).await?),
            "ble.read" => {
                let connection_id = args::connection_id(&args)?;
                let characteristic = args::uuid(&args, "char_uuid")?;
                self.gate(Capability::read(&characteristic)).await?;
                let value = sessions.read(&connection_id, characteristic).await?;
                let mut result = encode_value(&value);
                result["char_uuid"] = json!(characteristic);
                Ok(result)
            }
            "ble.write" => {
                let connection_id = args::connection_id(&args)?;
                let characteristic = args::uuid(&args, "char_uuid")?;
                let value = decode_value(
                    args::optional_str(&args, "value_b64")?,
                    args::optional_str(&args, "value_hex")?,
                )?;
                let with_response = args::boolean(&args, "with_response", true)?;
                self.gate(Capability::write(&characteristic)).await?;
                sessions
                    .write(&connection_id, characteristic, &value, with_response)
                    .await?;
                Ok(json!({
                    "char_uuid": characteristic,
                    "written": value.len(),
                    "with_response": with_response,
                }))
            }
            "ble.read_descriptor" => {
                let connection_id = args::connection_id(&args)?;
                let descriptor = descriptor_ref(&args)?;
                self.gate(Capability::read_descriptor(&descriptor.descriptor)).await?;
                let value = sessions.read_descriptor(&connection_id, descriptor).await?;
                let mut result = encode_value(&value);
                result["char_uuid"] = json!(descriptor.characteristic);
                result["descriptor_uuid"] = json!(descriptor.descriptor);
                Ok(result)
            }
            "ble.write_descriptor" => {
                let connection_id = args::connection_id(&args)?;
                let descriptor = descriptor_ref(&args)?;
                let value = decode_value(
                    args::optional_str(&args, "value_b64")?,
                    args::optional_str(&args, "value_hex")?,
                )?;
                self.gate(Capability::write_descriptor(&descriptor.descriptor)).await?;
                sessions
                    .write_descriptor(&connection_id, descriptor, &value)
                    .await?;
                Ok(json!({
                    "char_uuid": descriptor.characteristic,
                    "descriptor_uuid": descriptor.descriptor,
                    "written": value.len(),
                }))
            }
            "ble.subscribe" => {
                let connection_id = args::connection_id(&args)?;
                let characteristic = args::uuid(&args, "char_uuid")?;
                self.gate(Capability::subscribe(&characteristic)).await?;
                to_json(sessions.create_subscription(&connection_id, characteristic).await?)
            }
            "ble.unsubscribe" => {
                let connection_id = args::connection_id(&args)?;
                let subscription_id = args::subscription_id(&args)?;
                let removed = sessions
                    .remove_subscription(&connection_id, &subscription_id)
                    .await?;
                Ok(json!({"subscription_id": subscription_id, "removed": removed}))
            }
            "ble.wait_notification" => {
                let connection_id = args::connection_id(&args)?;
                let subscription_id = args::subscription_id(&args)?;
                let timeout = args::seconds(&args, "timeout_s", 10.0, 0.1, 60.0)?;
                let waited = sessions
                    .wait_notification(&connection_id, &subscription_id, timeout)
                    .await?;
                Ok(json!({
                    "notification": waited.notification.as_ref().map(notification_json),
                    "dropped": waited.dropped,
                }))
            }
            "ble.poll_notifications" => {
                let connection_id = args::connection_id(&args)?;
                let subscription_id = args::subscription_id(&args)?;
                let max_items = args::count(&args, "max_items", 50, 1, 1000)?;
                let batch = sessions.poll_notifications(&connection_id, &subscription_id, max_items)?;
                Ok(batch_json(&batch))
            }
            "ble.drain_notifications" => {
                let connection_id = args::connection_id(&args)?;
                let subscription_id = args::subscription_id(&args)?;
                let timeout = args::seconds(&args, "timeout_s", 2.0, 0.1, 60.0)?;
                let idle = args::seconds(&args, "idle_timeout_s", 0.25, 0.01, 10.0)?;
                let max_items = args::count(&args, "max_items", 200, 1, 5000)?;
                let batch = sessions
                    .drain_notifications(&connection_id, &subscription_id, timeout, idle, max_items)
                    .await?;
                Ok(batch_json(&batch))
            }
            "ble.connections.list" => {
                let connections = sessions.list_connections();
                Ok(json!({"count": connections.len(), "connections": connections}))
            }
            "ble.subscriptions.list" => {
                let filter = args::optional_str(&args, "connection_id")?
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(ConnectionId::from);
                let subscriptions = sessions.list_subscriptions(filter.as_ref())?;
                Ok(json!({"count": subscriptions.len(), "subscriptions": subscriptions}))
            }
            "ble.scans.list" => {
                let scans = sessions.list_scans();
                Ok(json!({"count": scans.len(), "scans": scans}))
            }
            "ble.spec.register" => {
                let registration = SpecRegistration {
                    name: args::required_str(&args, "name")?.to_owned(),
                    path: args::optional_str(&args, "path")?.map(str::to_owned),
                    device_name: args::optional_str(&args, "device_name")?.map(str::to_owned),
                    service_uuids: args::uuid_list(&args, "service_uuids")?,
                };
                to_json(self.specs.register(registration)?)
            }
            "ble.spec.list" => {
                let specs = self.specs.list();
                Ok(json!({"count": specs.len(), "specs": specs}))
            }
            "ble.spec.attach" => {
                let connection_id = args::connection_id(&args)?;
                let spec_id = args::spec_id(&args)?;
                let spec = self.specs.resolve(&spec_id).await?;
                sessions.attach_spec(&connection_id, spec.clone())?;
                Ok(json!({"connection_id": connection_id, "spec": spec}))
            }
            "ble.spec.get" => {
                let connection_id = args::connection_id(&args)?;
                let spec = sessions.attached_spec(&connection_id)?;
                Ok(json!({"connection_id": connection_id, "spec": spec}))
            }
            "ble.plugin.list" => {
                let plugins = self.extensions.descriptors();
                Ok(json!({"count": plugins.len(), "plugins": plugins}))
            }
            "ble.trace.status" => to_json(self.journal.status().await),
            "ble.trace.tail" => {
                let n = args::count(&args, "n", 50, 1, 1000)?;
                Ok(json!({"events": self.journal.tail(n).await}))
            }
            other if self.extensions.handles(other) => {
                self.extensions
                    .invoke(other, args, sessions.clone())
                    .await
            }
            other => Err(SessionError::UnknownTool(other.to_owned())),
        }
    }
}

fn scan_id(args: &Value) -> SessionResult<ScanId> {
    args::required_str(args, "scan_id").map(|s| ScanId::from(s.trim()))
}

fn descriptor_ref(args: &Value) -> SessionResult<DescriptorRef> {
    Ok(DescriptorRef {
        characteristic: args::uuid(args, "char_uuid")?,
        descriptor: args::uuid(args, "descriptor_uuid")?,
    })
}

fn to_json(payload: impl Serialize) -> SessionResult<Value> {
    serde_json::to_value(payload)
        .map_err(|err| SessionError::Internal(format!("failed to encode result: {err}")))
}

/// Wire form of one notification: the encoded payload plus epoch seconds.
pub fn notification_json(notification: &Notification) -> Value {
    let mut value = encode_value(&notification.payload);
    value["ts"] = json!(notification.ts.timestamp_micros() as f64 / 1_000_000.0);
    value
}

fn batch_json(batch: &Batch) -> Value {
    let notifications: Vec<Value> = batch.entries.iter().map(notification_json).collect();
    json!({
        "count": notifications.len(),
        "notifications": notifications,
        "dropped": batch.dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use gattkit_driver::SimulatedDriver;
    use gattkit_policy::StaticPolicyEngine;
    use gattkit_protocol::{ErrorCode, PolicySet, TraceEvent, uuid_from_short};
    use gattkit_session::RegistryConfig;

    use crate::extensions::ExtensionOperation;

    const THERMOMETER: &str = "C0:FF:EE:00:00:01";
    const DIMMER: &str = "C0:FF:EE:00:00:02";

    fn dispatcher(driver: &SimulatedDriver, policy: PolicySet) -> ToolDispatcher {
        let sessions = SessionRegistry::new(Arc::new(driver.clone()), RegistryConfig::default());
        ToolDispatcher::new(
            sessions,
            Arc::new(StaticPolicyEngine::from_policy_set(&policy)),
            TraceJournal::in_memory(100),
            Arc::new(SpecIndex::new()),
        )
    }

    async fn connect(dispatcher: &ToolDispatcher, address: &str) -> String {
        let envelope = dispatcher
            .dispatch("ble.connect", json!({"address": address}))
            .await;
        assert!(envelope.ok, "{envelope:?}");
        envelope.get("connection_id").unwrap().as_str().unwrap().to_owned()
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tools_fail_inside_the_envelope() {
        let driver = SimulatedDriver::new();
        let dispatcher = dispatcher(&driver, PolicySet::default());

        let envelope = dispatcher.dispatch("ble.teleport", Value::Null).await;
        assert!(!envelope.ok);
        assert_eq!(envelope.error_code(), Some(ErrorCode::UnknownTool));

        let events: Vec<TraceEvent> = dispatcher.journal().tail(10).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind.name(), "call_started");
        match &events[1].kind {
            TraceEventKind::CallFinished { tool, ok, error_code, .. } => {
                assert_eq!(tool, "ble.teleport");
                assert!(!ok);
                assert_eq!(*error_code, Some(ErrorCode::UnknownTool));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_arguments_are_invalid() {
        let driver = SimulatedDriver::with_demo_peripherals();
        let dispatcher = dispatcher(&driver, PolicySet::from_write_settings(true, None));

        let cases = [
            ("ble.read", json!([1, 2])),
            ("ble.read", json!({"char_uuid": "2a19"})),
            ("ble.connect", json!({"address": "   "})),
            ("ble.scan_get_results", json!({})),
        ];
        for (tool, args) in cases {
            let envelope = dispatcher.dispatch(tool, args.clone()).await;
            assert_eq!(envelope.error_code(), Some(ErrorCode::InvalidArgument), "{tool} {args}");
        }

        let connection_id = connect(&dispatcher, DIMMER).await;
        let bad_uuid = dispatcher
            .dispatch("ble.read", json!({"connection_id": connection_id, "char_uuid": "xyz"}))
            .await;
        assert_eq!(bad_uuid.error_code(), Some(ErrorCode::InvalidArgument));
        let bad_hex = dispatcher
            .dispatch(
                "ble.write",
                json!({"connection_id": connection_id, "char_uuid": "fff1", "value_hex": "zz"}),
            )
            .await;
        assert_eq!(bad_hex.error_code(), Some(ErrorCode::InvalidArgument));
        let missing_value = dispatcher
            .dispatch("ble.write", json!({"connection_id": connection_id, "char_uuid": "fff1"}))
            .await;
        assert_eq!(missing_value.error_code(), Some(ErrorCode::InvalidArgument));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_follow_the_policy() {
        let driver = SimulatedDriver::with_demo_peripherals();
        let locked = dispatcher(&driver, PolicySet::default());
        let connection_id = connect(&locked, DIMMER).await;
        let write = json!({"connection_id": connection_id, "char_uuid": "fff1", "value_hex": "40"});

        let denied = locked.dispatch("ble.write", write.clone()).await;
        assert_eq!(denied.error_code(), Some(ErrorCode::PolicyDenied));
        assert!(driver.written(DIMMER, uuid_from_short(0xfff1)).is_empty());

        let open = dispatcher(&driver, PolicySet::from_write_settings(true, None));
        let connection_id = connect(&open, DIMMER).await;
        let write = json!({"connection_id": connection_id, "char_uuid": "fff1", "value_hex": "40"});
        let allowed = open.dispatch("ble.write", write).await;
        assert!(allowed.ok, "{allowed:?}");
        assert_eq!(allowed.get("written"), Some(&json!(1)));
        assert_eq!(driver.written(DIMMER, uuid_from_short(0xfff1)), vec![vec![0x40]]);

        let read = open
            .dispatch("ble.read", json!({"connection_id": connection_id, "char_uuid": "FFF1"}))
            .await;
        assert_eq!(read.get("value_hex"), Some(&json!("40")));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_connect_subscribe_and_drain() {
        let driver = SimulatedDriver::with_demo_peripherals();
        let dispatcher = dispatcher(&driver, PolicySet::default());

        let started = dispatcher
            .dispatch("ble.scan_start", json!({"timeout_s": 5, "name_filter": "thermo"}))
            .await;
        assert!(started.ok, "{started:?}");
        let scan_id = started.get("scan_id").unwrap().clone();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let results = dispatcher
            .dispatch("ble.scan_get_results", json!({"scan_id": scan_id}))
            .await;
        assert_eq!(results.get("active"), Some(&json!(true)));
        let devices = results.get("devices").unwrap().as_array().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["address"], THERMOMETER);

        let connection_id = connect(&dispatcher, THERMOMETER).await;
        let battery = dispatcher
            .dispatch("ble.read", json!({"connection_id": connection_id, "char_uuid": "2a19"}))
            .await;
        assert_eq!(battery.get("value_hex"), Some(&json!("57")));
        assert_eq!(battery.get("value_len"), Some(&json!(1)));

        let subscribed = dispatcher
            .dispatch("ble.subscribe", json!({"connection_id": connection_id, "char_uuid": "2a19"}))
            .await;
        assert!(subscribed.ok, "{subscribed:?}");
        let subscription_id = subscribed.get("subscription_id").unwrap().clone();

        for level in [80u8, 79, 78] {
            driver.notify(THERMOMETER, uuid_from_short(0x2a19), &[level]);
        }
        let drained = dispatcher
            .dispatch(
                "ble.drain_notifications",
                json!({"connection_id": connection_id, "subscription_id": subscription_id}),
            )
            .await;
        assert!(drained.ok, "{drained:?}");
        let hex: Vec<&str> = drained
            .get("notifications")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["value_hex"].as_str().unwrap())
            .collect();
        assert_eq!(hex, vec!["50", "4f", "4e"]);
        assert_eq!(drained.get("dropped"), Some(&json!(0)));

        let listed = dispatcher.dispatch("ble.subscriptions.list", Value::Null).await;
        assert_eq!(listed.get("count"), Some(&json!(1)));

        let stopped = dispatcher
            .dispatch("ble.scan_stop", json!({"scan_id": scan_id}))
            .await;
        assert_eq!(stopped.get("active"), Some(&json!(false)));

        let status = dispatcher.dispatch("ble.trace.status", Value::Null).await;
        assert!(status.get("events_recorded").unwrap().as_u64().unwrap() >= 14);
    }

    #[tokio::test(start_paused = true)]
    async fn specs_attach_to_connections() {
        let driver = SimulatedDriver::with_demo_peripherals();
        let dispatcher = dispatcher(&driver, PolicySet::default());
        let registered = dispatcher
            .dispatch(
                "ble.spec.register",
                json!({"name": "Dimmer protocol", "service_uuids": ["fff0"]}),
            )
            .await;
        assert!(registered.ok, "{registered:?}");
        let spec_id = registered.get("spec_id").unwrap().clone();

        let connection_id = connect(&dispatcher, DIMMER).await;
        let before = dispatcher
            .dispatch("ble.spec.get", json!({"connection_id": connection_id}))
            .await;
        assert_eq!(before.get("spec"), Some(&Value::Null));

        let missing = dispatcher
            .dispatch("ble.spec.attach", json!({"connection_id": connection_id, "spec_id": "nope"}))
            .await;
        assert_eq!(missing.error_code(), Some(ErrorCode::NotFound));

        let attached = dispatcher
            .dispatch("ble.spec.attach", json!({"connection_id": connection_id, "spec_id": spec_id}))
            .await;
        assert!(attached.ok, "{attached:?}");
        let after = dispatcher
            .dispatch("ble.spec.get", json!({"connection_id": connection_id}))
            .await;
        assert_eq!(after.get("spec").unwrap()["name"], "Dimmer protocol");
    }

    struct Brightness;

    #[async_trait]
    impl ExtensionHandler for Brightness {
        async fn call(&self, operation: &str, args: Value, sessions: SessionRegistry) -> SessionResult<Value> {
            match operation {
                "dimmer.level" => {
                    let connection_id = args::connection_id(&args)?;
                    let value = sessions.read(&connection_id, uuid_from_short(0xfff1)).await?;
                    Ok(json!({"level": value.first().copied().unwrap_or_default()}))
                }
                _ => panic!("unhandled operation {operation}"),
            }
        }
    }

    fn brightness_descriptor() -> ExtensionDescriptor {
        let operation = |name: &str| ExtensionOperation {
            name: name.to_owned(),
            description: String::new(),
            input_schema: json!({"type": "object", "properties": {}, "required": []}),
        };
        ExtensionDescriptor {
            name: "dimmer".to_owned(),
            operations: vec![operation("dimmer.level"), operation("dimmer.crash")],
            matching: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn extensions_extend_the_tool_surface() {
        let driver = SimulatedDriver::with_demo_peripherals();
        let dispatcher = dispatcher(&driver, PolicySet::default());
        dispatcher
            .register_extension(brightness_descriptor(), Arc::new(Brightness))
            .unwrap();
        assert_eq!(dispatcher.tools().len(), 29);
        assert!(dispatcher
            .register_extension(brightness_descriptor(), Arc::new(Brightness))
            .is_err());

        let connection_id = connect(&dispatcher, DIMMER).await;
        let level = dispatcher
            .dispatch("dimmer.level", json!({"connection_id": connection_id}))
            .await;
        assert_eq!(level.get("level"), Some(&json!(0)));

        let crashed = dispatcher.dispatch("dimmer.crash", json!({})).await;
        assert_eq!(crashed.error_code(), Some(ErrorCode::Internal));

        let plugins = dispatcher.dispatch("ble.plugin.list", Value::Null).await;
        assert_eq!(plugins.get("count"), Some(&json!(1)));
        let still_alive = dispatcher
            .dispatch("ble.connection_status", json!({"connection_id": connection_id}))
            .await;
        assert_eq!(still_alive.get("connected"), Some(&json!(true)));
    }
}
