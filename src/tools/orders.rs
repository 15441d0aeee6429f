//! Order management tools.
//!
//! `get_order` and `update_order` over an in-memory order store. Missing
//! orders are business errors, not faults.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{RegistryError, ToolError, ToolHandler, ToolRegistry, ToolSpec};

pub const ORDERS_READ_SCOPE: &str = "orders:read";
pub const ORDERS_WRITE_SCOPE: &str = "orders:write";

/// In-memory order records keyed by order id.
#[derive(Debug, Default)]
pub struct OrderStore {
    orders: Mutex<HashMap<String, Value>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding the sample order `123`.
    pub fn with_sample_orders() -> Self {
        let store = Self::new();
        store.insert(
            "123",
            json!({
                "order_id": "123",
                "status": "processing",
                "items": [
                    { "name": "Item A", "quantity": 2 },
                    { "name": "Item B", "quantity": 1 }
                ],
                "total": 5000
            }),
        );
        store
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.orders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, order_id: impl Into<String>, record: Value) {
        self.lock().insert(order_id.into(), record);
    }

    pub fn get(&self, order_id: &str) -> Option<Value> {
        self.lock().get(order_id).cloned()
    }

    /// Merge `fields` into the record; `None` when the order does not exist.
    pub fn update(&self, order_id: &str, fields: &Map<String, Value>) -> Option<Value> {
        let mut orders = self.lock();
        let record = orders.get_mut(order_id)?;
        if let Value::Object(existing) = record {
            for (key, value) in fields {
                if key != "order_id" {
                    existing.insert(key.clone(), value.clone());
                }
            }
        }
        Some(record.clone())
    }
}

fn not_found(order_id: &str) -> ToolError {
    ToolError::Business(format!("order not found: {order_id}"))
}

#[derive(Deserialize)]
struct GetOrderArgs {
    order_id: String,
}

#[derive(Deserialize)]
struct UpdateOrderArgs {
    order_id: String,
    fields: Map<String, Value>,
}

fn parse<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::Fault(format!("argument decoding failed: {e}")))
}

pub struct GetOrderTool {
    store: Arc<OrderStore>,
}

impl GetOrderTool {
    pub fn new(store: Arc<OrderStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for GetOrderTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "get_order",
            "Fetch an order record by id",
            json!({
                "type": "object",
                "properties": {
                    "order_id": { "type": "string", "minLength": 1, "description": "Order id" }
                },
                "required": ["order_id"],
                "additionalProperties": false
            }),
        )
        .with_output_schema(json!({
            "type": "object",
            "required": ["order_id", "status"]
        }))
        .with_required_scopes([ORDERS_READ_SCOPE, ORDERS_WRITE_SCOPE])
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: GetOrderArgs = parse(arguments)?;
        self.store.get(&args.order_id).ok_or_else(|| not_found(&args.order_id))
    }
}

pub struct UpdateOrderTool {
    store: Arc<OrderStore>,
}

impl UpdateOrderTool {
    pub fn new(store: Arc<OrderStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for UpdateOrderTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "update_order",
            "Update fields of an existing order",
            json!({
                "type": "object",
                "properties": {
                    "order_id": { "type": "string", "minLength": 1, "description": "Order id" },
                    "fields": { "type": "object", "description": "Fields to merge into the order" }
                },
                "required": ["order_id", "fields"],
                "additionalProperties": false
            }),
        )
        .with_output_schema(json!({
            "type": "object",
            "required": ["order_id"]
        }))
        .with_required_scopes([ORDERS_WRITE_SCOPE])
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: UpdateOrderArgs = parse(arguments)?;
        self.store
            .update(&args.order_id, &args.fields)
            .ok_or_else(|| not_found(&args.order_id))
    }
}

/// Register `get_order` and `update_order` backed by `store`.
pub fn register_order_tools(
    registry: &mut ToolRegistry,
    store: Arc<OrderStore>,
) -> Result<(), RegistryError> {
    registry.register(Arc::new(GetOrderTool::new(Arc::clone(&store))))?;
    registry.register(Arc::new(UpdateOrderTool::new(store)))?;
    Ok(())
}
