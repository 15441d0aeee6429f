//! Tool registry
//!
//! Maps tool names to handlers and compiles their JSON Schemas once at
//! registration time.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use super::{TARGET_DELIMITER, ToolHandler, ToolSpec};

/// Maximum number of schema violations reported per validation.
const MAX_REPORTED_VIOLATIONS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("Invalid tool name '{0}'")]
    InvalidName(String),

    #[error("Invalid schema for tool '{tool}': {reason}")]
    InvalidSchema { tool: String, reason: String },
}

pub(crate) struct RegisteredTool {
    pub(crate) spec: ToolSpec,
    pub(crate) handler: Arc<dyn ToolHandler>,
    input: jsonschema::Validator,
    output: Option<jsonschema::Validator>,
}

impl RegisteredTool {
    pub(crate) fn validate_input(&self, arguments: &Value) -> Result<(), String> {
        check(&self.input, arguments)
    }

    pub(crate) fn validate_output(&self, payload: &Value) -> Result<(), String> {
        match &self.output {
            Some(validator) => check(validator, payload),
            None => Ok(()),
        }
    }
}

fn check(validator: &jsonschema::Validator, instance: &Value) -> Result<(), String> {
    if validator.is_valid(instance) {
        return Ok(());
    }
    let msgs: Vec<String> = validator
        .iter_errors(instance)
        .take(MAX_REPORTED_VIOLATIONS)
        .map(|err| format!("{} at {}", err, err.instance_path))
        .collect();
    Err(msgs.join("; "))
}

fn compile(tool: &str, schema: &Value) -> Result<jsonschema::Validator, RegistryError> {
    jsonschema::validator_for(schema).map_err(|e| RegistryError::InvalidSchema {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

/// Explicit mapping from tool name to handler.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<RegisteredTool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the name from its spec.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> Result<(), RegistryError> {
        let spec = handler.spec();
        let name = spec.name.clone();
        if name.is_empty() || name.contains(TARGET_DELIMITER) {
            return Err(RegistryError::InvalidName(name));
        }
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }

        let input = compile(&name, &spec.input_schema)?;
        let output = spec
            .output_schema
            .as_ref()
            .map(|schema| compile(&name, schema))
            .transpose()?;

        tracing::debug!(tool = %name, "registered tool");
        self.tools.insert(
            name,
            Arc::new(RegisteredTool {
                spec,
                handler,
                input,
                output,
            }),
        );
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Descriptors of every registered tool, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
