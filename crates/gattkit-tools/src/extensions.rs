//! Extensions: named bundles of extra operations served by a handler.
//!
//! Operation names share one namespace with the core tools. Handlers run on
//! their own task so a panic is reported as an `internal` failure instead of
//! taking the dispatcher down.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gattkit_protocol::{SessionError, SessionKind, SessionResult};
use gattkit_session::SessionRegistry;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::catalog::{ToolDefinition, ToolRegistry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionOperation {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}, "required": []})
}

/// Hints for which devices an extension is meant for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionMatching {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub service_uuids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    pub name: String,
    pub operations: Vec<ExtensionOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching: Option<ExtensionMatching>,
}

#[async_trait]
pub trait ExtensionHandler: Send + Sync {
    async fn call(
        &self,
        operation: &str,
        args: Value,
        sessions: SessionRegistry,
    ) -> SessionResult<Value>;
}

struct Registered {
    descriptor: ExtensionDescriptor,
    handler: Arc<dyn ExtensionHandler>,
}

#[derive(Default)]
struct ExtensionTable {
    extensions: IndexMap<String, Registered>,
    operations: HashMap<String, String>,
}

#[derive(Default)]
pub struct ExtensionRegistry {
    table: RwLock<ExtensionTable>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension once. Names may not collide with `core` tools or other extensions.
    pub fn register(
        &self,
        descriptor: ExtensionDescriptor,
        handler: Arc<dyn ExtensionHandler>,
        core: &ToolRegistry,
    ) -> SessionResult<()> {
        let name = descriptor.name.trim();
        if name.is_empty() {
            return Err(SessionError::InvalidArgument(
                "extension name is required".to_owned(),
            ));
        }
        let mut table = self.table.write();
        if table.extensions.contains_key(name) {
            return Err(SessionError::InvalidArgument(format!(
                "extension {name} is already registered"
            )));
        }
        let mut seen = Vec::with_capacity(descriptor.operations.len());
        for operation in &descriptor.operations {
            let op = operation.name.as_str();
            if op.trim().is_empty() {
                return Err(SessionError::InvalidArgument(format!(
                    "extension {name} declares an operation without a name"
                )));
            }
            if core.contains(op) || table.operations.contains_key(op) || seen.contains(&op) {
                return Err(SessionError::InvalidArgument(format!(
                    "operation {op} of extension {name} collides with an existing tool"
                )));
            }
            seen.push(op);
        }
        for op in seen {
            table.operations.insert(op.to_owned(), name.to_owned());
        }
        info!(extension = %name, operations = descriptor.operations.len(), "extension registered");
        table.extensions.insert(
            name.to_owned(),
            Registered {
                descriptor: descriptor.clone(),
                handler,
            },
        );
        Ok(())
    }

    pub fn handles(&self, operation: &str) -> bool {
        self.table.read().operations.contains_key(operation)
    }

    pub fn descriptors(&self) -> Vec<ExtensionDescriptor> {
        self.table
            .read()
            .extensions
            .values()
            .map(|r| r.descriptor.clone())
            .collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.table
            .read()
            .extensions
            .values()
            .flat_map(|r| r.descriptor.operations.iter())
            .map(|op| ToolDefinition {
                name: op.name.clone(),
                description: op.description.clone(),
                input_schema: op.input_schema.clone(),
            })
            .collect()
    }

    /// Run `operation` on its extension's handler in an isolated task.
    pub async fn invoke(
        &self,
        operation: &str,
        args: Value,
        sessions: SessionRegistry,
    ) -> SessionResult<Value> {
        let (extension, handler) = {
            let table = self.table.read();
            let extension = table
                .operations
                .get(operation)
                .cloned()
                .ok_or_else(|| SessionError::UnknownTool(operation.to_owned()))?;
            let handler = table
                .extensions
                .get(&extension)
                .map(|r| r.handler.clone())
                .ok_or_else(|| SessionError::not_found(SessionKind::Extension, &extension))?;
            (extension, handler)
        };
        let op = operation.to_owned();
        let task = tokio::spawn(async move { handler.call(&op, args, sessions).await });
        match task.await {
            Ok(result) => result,
            Err(join_error) => {
                error!(extension = %extension, operation, error = %join_error, "extension handler failed");
                Err(SessionError::Internal(format!(
                    "extension {extension} failed while handling {operation}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattkit_driver::SimulatedDriver;
    use gattkit_protocol::ErrorCode;
    use gattkit_session::RegistryConfig;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ExtensionHandler for Echo {
        async fn call(&self, operation: &str, args: Value, _sessions: SessionRegistry) -> SessionResult<Value> {
            if operation == "demo.explode" {
                panic!("boom");
            }
            Ok(json!({"operation": operation, "args": args}))
        }
    }

    fn descriptor(name: &str, ops: &[&str]) -> ExtensionDescriptor {
        ExtensionDescriptor {
            name: name.to_owned(),
            operations: ops
                .iter()
                .map(|op| ExtensionOperation {
                    name: (*op).to_owned(),
                    description: String::new(),
                    input_schema: empty_object_schema(),
                })
                .collect(),
            matching: None,
        }
    }

    fn sessions() -> SessionRegistry {
        SessionRegistry::new(Arc::new(SimulatedDriver::new()), RegistryConfig::default())
    }

    #[tokio::test]
    async fn operations_are_routed_and_panics_contained() {
        let registry = ExtensionRegistry::new();
        let core = ToolRegistry::with_core_tools();
        registry
            .register(descriptor("demo", &["demo.echo", "demo.explode"]), Arc::new(Echo), &core)
            .unwrap();
        assert!(registry.handles("demo.echo"));
        assert_eq!(registry.definitions().len(), 2);

        let value = registry
            .invoke("demo.echo", json!({"x": 1}), sessions())
            .await
            .unwrap();
        assert_eq!(value["args"]["x"], 1);

        let err = registry
            .invoke("demo.explode", json!({}), sessions())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(registry.invoke("demo.echo", json!({}), sessions()).await.is_ok());
    }

    #[test]
    fn collisions_are_rejected() {
        let registry = ExtensionRegistry::new();
        let core = ToolRegistry::with_core_tools();

        let err = registry
            .register(descriptor("bad", &["ble.read"]), Arc::new(Echo), &core)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        registry
            .register(descriptor("a", &["a.op"]), Arc::new(Echo), &core)
            .unwrap();
        assert!(registry.register(descriptor("a", &["a.other"]), Arc::new(Echo), &core).is_err());
        assert!(registry.register(descriptor("b", &["a.op"]), Arc::new(Echo), &core).is_err());
        assert!(registry.register(descriptor("c", &["c.x", "c.x"]), Arc::new(Echo), &core).is_err());
        assert_eq!(registry.descriptors().len(), 1);
        assert!(!registry.handles("c.x"));
    }
}
