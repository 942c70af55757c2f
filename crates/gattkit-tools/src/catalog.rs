//! Tool definitions and their JSON input schemas.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: IndexMap<String, ToolDefinition>,
}

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn string(description: &str) -> Value {
    json!({"type": "string", "description": description})
}

fn number(description: &str, default: f64) -> Value {
    json!({"type": ["number", "string"], "description": description, "default": default})
}

fn integer(description: &str, default: u64) -> Value {
    json!({"type": ["integer", "string"], "description": description, "default": default})
}

fn with_ids(mut extra: Map<String, Value>, ids: &[&str]) -> Value {
    for id in ids {
        let description = match *id {
            "connection_id" => "The connection_id from ble.connect.",
            "subscription_id" => "The subscription_id from ble.subscribe.",
            "scan_id" => "The scan_id from ble.scan_start.",
            "spec_id" => "The spec_id from ble.spec.register.",
            _ => "",
        };
        extra.insert((*id).to_owned(), string(description));
    }
    Value::Object(extra)
}

fn props(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl ToolRegistry {
    pub fn register(&mut self, definition: ToolDefinition) {
        self.tools.insert(definition.name.clone(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn add(&mut self, name: &str, description: &str, input_schema: Value) {
        self.register(ToolDefinition {
            name: name.to_owned(),
            description: description.to_owned(),
            input_schema,
        });
    }

    pub fn with_core_tools() -> Self {
        let mut registry = Self::default();
        let value_props = || {
            props(json!({
                "value_b64": string("Base64-encoded value to write."),
                "value_hex": string("Hex-encoded value to write."),
            }))
        };

        registry.add(
            "ble.scan_start",
            "Start a background scan and return a scan_id immediately. The scan stops on its own after timeout_s.",
            schema(
                json!({
                    "timeout_s": number("Max scan duration in seconds (0.1 to 60).", 10.0),
                    "name_filter": string("Only keep devices whose name contains this text, case-insensitive."),
                    "service_uuid": string("Only keep devices advertising this service UUID."),
                }),
                &[],
            ),
        );
        registry.add(
            "ble.scan_get_results",
            "Return the devices a scan has seen so far, strongest signal first, and whether it is still active.",
            schema(with_ids(Map::new(), &["scan_id"]), &["scan_id"]),
        );
        registry.add(
            "ble.scan_stop",
            "Stop a scan and return its final device list. Safe to call on a finished scan.",
            schema(with_ids(Map::new(), &["scan_id"]), &["scan_id"]),
        );
        registry.add(
            "ble.connect",
            "Connect to a device by address. Returns a connection_id plus the device name and services any scan saw.",
            schema(
                json!({
                    "address": string("MAC address or platform identifier of the device."),
                    "timeout_s": number("Connection timeout in seconds (1 to 60).", 10.0),
                }),
                &["address"],
            ),
        );
        registry.add(
            "ble.disconnect",
            "Disconnect a device and return its final status. The connection id is released.",
            schema(with_ids(Map::new(), &["connection_id"]), &["connection_id"]),
        );
        registry.add(
            "ble.connection_status",
            "Whether a connection is alive, with the disconnect time and cause once it is not.",
            schema(with_ids(Map::new(), &["connection_id"]), &["connection_id"]),
        );
        registry.add(
            "ble.discover",
            "List services, characteristics and descriptors. Cached per connection.",
            schema(with_ids(Map::new(), &["connection_id"]), &["connection_id"]),
        );
        registry.add(
            "ble.mtu",
            "The negotiated MTU and the largest write payload it allows (mtu - 3).",
            schema(with_ids(Map::new(), &["connection_id"]), &["connection_id"]),
        );
        registry.add(
            "ble.read",
            "Read a characteristic value.",
            schema(
                with_ids(
                    props(json!({"char_uuid": string("Characteristic UUID, 16-bit or 128-bit.")})),
                    &["connection_id"],
                ),
                &["connection_id", "char_uuid"],
            ),
        );
        let mut write_props = value_props();
        write_props.insert("char_uuid".to_owned(), string("Characteristic UUID."));
        write_props.insert(
            "with_response".to_owned(),
            json!({"type": ["boolean", "string"], "description": "Use write-with-response.", "default": true}),
        );
        registry.add(
            "ble.write",
            "Write a characteristic value given as value_b64 or value_hex. Requires writes to be enabled.",
            schema(with_ids(write_props, &["connection_id"]), &["connection_id", "char_uuid"]),
        );
        let descriptor_props = || {
            props(json!({
                "char_uuid": string("UUID of the characteristic owning the descriptor."),
                "descriptor_uuid": string("Descriptor UUID, e.g. 2902 for the CCCD."),
            }))
        };
        registry.add(
            "ble.read_descriptor",
            "Read a descriptor of a characteristic.",
            schema(
                with_ids(descriptor_props(), &["connection_id"]),
                &["connection_id", "char_uuid", "descriptor_uuid"],
            ),
        );
        let mut write_descriptor_props = descriptor_props();
        write_descriptor_props.extend(value_props());
        registry.add(
            "ble.write_descriptor",
            "Write a descriptor of a characteristic. Requires writes to be enabled.",
            schema(
                with_ids(write_descriptor_props, &["connection_id"]),
                &["connection_id", "char_uuid", "descriptor_uuid"],
            ),
        );
        registry.add(
            "ble.subscribe",
            "Subscribe to notifications on a characteristic. Entries are buffered until consumed.",
            schema(
                with_ids(props(json!({"char_uuid": string("Characteristic UUID.")})), &["connection_id"]),
                &["connection_id", "char_uuid"],
            ),
        );
        registry.add(
            "ble.unsubscribe",
            "Remove a subscription. Removing one that is already gone is not an error.",
            schema(
                with_ids(Map::new(), &["connection_id", "subscription_id"]),
                &["connection_id", "subscription_id"],
            ),
        );
        registry.add(
            "ble.wait_notification",
            "Wait for the next single notification, or return null at the timeout.",
            schema(
                with_ids(
                    props(json!({"timeout_s": number("Max seconds to wait (0.1 to 60).", 10.0)})),
                    &["connection_id", "subscription_id"],
                ),
                &["connection_id", "subscription_id"],
            ),
        );
        registry.add(
            "ble.poll_notifications",
            "Return up to max_items buffered notifications without waiting, plus the cumulative dropped count.",
            schema(
                with_ids(
                    props(json!({"max_items": integer("Max notifications to return (1 to 1000).", 50)})),
                    &["connection_id", "subscription_id"],
                ),
                &["connection_id", "subscription_id"],
            ),
        );
        registry.add(
            "ble.drain_notifications",
            "Wait up to timeout_s for a first notification, then keep collecting until idle_timeout_s passes quietly or max_items is reached.",
            schema(
                with_ids(
                    props(json!({
                        "timeout_s": number("Total max wait in seconds (0.1 to 60).", 2.0),
                        "idle_timeout_s": number("Max quiet gap between notifications (0.01 to 10).", 0.25),
                        "max_items": integer("Max notifications to collect (1 to 5000).", 200),
                    })),
                    &["connection_id", "subscription_id"],
                ),
                &["connection_id", "subscription_id"],
            ),
        );
        registry.add(
            "ble.connections.list",
            "List every tracked connection with status, timestamps and subscription count.",
            schema(json!({}), &[]),
        );
        registry.add(
            "ble.subscriptions.list",
            "List subscriptions with queue depth and dropped count, optionally for one connection.",
            schema(with_ids(Map::new(), &["connection_id"]), &[]),
        );
        registry.add(
            "ble.scans.list",
            "List every tracked scan with its filters, timing and device count.",
            schema(json!({}), &[]),
        );
        registry.add(
            "ble.spec.register",
            "Register a protocol spec reference with optional matching hints.",
            schema(
                json!({
                    "name": string("Human-readable spec name."),
                    "path": string("Where the spec document lives."),
                    "device_name": string("Advertised name of devices this spec describes."),
                    "service_uuids": {"type": "array", "items": {"type": "string"}, "description": "Services that identify matching devices."},
                }),
                &["name"],
            ),
        );
        registry.add(
            "ble.spec.list",
            "List registered specs with their matching hints.",
            schema(json!({}), &[]),
        );
        registry.add(
            "ble.spec.attach",
            "Attach a registered spec to a connection for its lifetime.",
            schema(
                with_ids(Map::new(), &["connection_id", "spec_id"]),
                &["connection_id", "spec_id"],
            ),
        );
        registry.add(
            "ble.spec.get",
            "The spec attached to a connection, or null.",
            schema(with_ids(Map::new(), &["connection_id"]), &["connection_id"]),
        );
        registry.add(
            "ble.plugin.list",
            "List registered extensions and the operations they add.",
            schema(json!({}), &[]),
        );
        registry.add(
            "ble.trace.status",
            "Trace journal status: whether it persists, where, and how many events it holds.",
            schema(json!({}), &[]),
        );
        registry.add(
            "ble.trace.tail",
            "The most recent trace events, oldest first.",
            schema(json!({"n": integer("Number of events (1 to 1000).", 50)}), &[]),
        );

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_tools_have_object_schemas() {
        let registry = ToolRegistry::with_core_tools();
        assert_eq!(registry.len(), 27);
        for definition in registry.definitions() {
            assert_eq!(definition.input_schema["type"], "object", "{}", definition.name);
            assert!(definition.input_schema["required"].is_array());
        }
    }

    #[test]
    fn required_fields_are_declared_properties() {
        let registry = ToolRegistry::with_core_tools();
        for definition in registry.definitions() {
            let properties = &definition.input_schema["properties"];
            for required in definition.input_schema["required"].as_array().unwrap() {
                let key = required.as_str().unwrap();
                assert!(properties.get(key).is_some(), "{} lacks {key}", definition.name);
            }
        }
        let write = registry.get("ble.write").unwrap();
        assert!(write.input_schema["properties"]["value_hex"].is_object());
    }
}
