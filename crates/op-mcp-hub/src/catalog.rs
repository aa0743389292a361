//! Tool catalog
//!
//! The merged, namespaced registry of tools discovered across all backends.
//! Every descriptor is keyed by its qualified name `{connectionId}_{rawName}`.
//! Mutations happen inside one synchronous write section, so readers never
//! see a connection's tools half replaced.

use crate::error::{HubError, Result};
use crate::manager::ConnectionObserver;
use crate::protocol::ToolDefinition;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Separator between connection id and raw tool name
pub const QUALIFIER_SEPARATOR: char = '_';

/// Build the qualified name of a tool
pub fn qualify(connection_id: &str, raw_name: &str) -> String {
    format!("{}{}{}", connection_id, QUALIFIER_SEPARATOR, raw_name)
}

/// Split a qualified name into `(connection_id, raw_name)`.
///
/// Connection ids never contain the separator, so the first `_` is the split
/// point. Returns `None` when `name` cannot be a qualified name.
pub fn parse_qualified(name: &str) -> Option<(&str, &str)> {
    let (connection_id, raw_name) = name.split_once(QUALIFIER_SEPARATOR)?;
    let id_ok = !connection_id.is_empty()
        && connection_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if id_ok && !raw_name.is_empty() {
        Some((connection_id, raw_name))
    } else {
        None
    }
}

/// A namespaced tool
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub qualified_name: String,
    pub raw_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    pub owner_connection_id: String,
}

impl ToolDescriptor {
    fn from_definition(connection_id: &str, tool: &ToolDefinition) -> Self {
        Self {
            qualified_name: qualify(connection_id, &tool.name),
            raw_name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
            owner_connection_id: connection_id.to_string(),
        }
    }

    /// MCP tool definition advertised under the qualified name
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.qualified_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// Optional narrowing for [`ToolCatalog::list`]
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    pub connection_ids: Option<Vec<String>>,
    pub raw_name_pattern: Option<glob::Pattern>,
}

impl ToolFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.connection_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Glob over raw names, e.g. `read_*`
    pub fn raw_name_pattern(mut self, pattern: &str) -> Result<Self> {
        let compiled = glob::Pattern::new(pattern).map_err(|e| {
            HubError::config(format!("Invalid tool name pattern '{}': {}", pattern, e))
        })?;
        self.raw_name_pattern = Some(compiled);
        Ok(self)
    }

    pub fn matches(&self, tool: &ToolDescriptor) -> bool {
        if let Some(ids) = &self.connection_ids {
            if !ids.iter().any(|id| id == &tool.owner_connection_id) {
                return false;
            }
        }
        match &self.raw_name_pattern {
            Some(pattern) => pattern.matches(&tool.raw_name),
            None => true,
        }
    }
}

/// Per-descriptor outcome of adding a batch of tools
#[derive(Debug, Default)]
pub struct AddReport {
    pub added: Vec<String>,
    pub errors: Vec<HubError>,
}

impl AddReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of checking arguments against a tool's input schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

#[derive(Default)]
struct CatalogInner {
    tools: HashMap<String, ToolDescriptor>,
    // Qualified names in discovery order
    order: Vec<String>,
}

impl CatalogInner {
    fn insert_batch(&mut self, connection_id: &str, tools: &[ToolDefinition]) -> AddReport {
        let mut report = AddReport::default();
        for tool in tools {
            if tool.name.is_empty() {
                report.errors.push(HubError::protocol(format!(
                    "Connection '{}' reported a tool without a name",
                    connection_id
                )));
                continue;
            }

            let descriptor = ToolDescriptor::from_definition(connection_id, tool);
            if self.tools.contains_key(&descriptor.qualified_name) {
                report.errors.push(HubError::DuplicateTool {
                    connection_id: connection_id.to_string(),
                    raw_name: tool.name.clone(),
                });
                continue;
            }

            report.added.push(descriptor.qualified_name.clone());
            self.order.push(descriptor.qualified_name.clone());
            self.tools.insert(descriptor.qualified_name.clone(), descriptor);
        }
        report
    }

    fn prune(&mut self, connection_id: &str) -> usize {
        let before = self.tools.len();
        self.tools
            .retain(|_, tool| tool.owner_connection_id != connection_id);
        let tools = &self.tools;
        self.order.retain(|name| tools.contains_key(name));
        before - self.tools.len()
    }
}

/// Registry of every discovered tool
#[derive(Default)]
pub struct ToolCatalog {
    inner: RwLock<CatalogInner>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the tools a connection reported. Each descriptor succeeds or fails
    /// on its own; a raw name the connection already owns is a
    /// [`HubError::DuplicateTool`] and the existing entry is kept.
    pub fn add_from_connection(&self, connection_id: &str, tools: &[ToolDefinition]) -> AddReport {
        let report = self.inner.write().insert_batch(connection_id, tools);
        log_report(connection_id, &report);
        report
    }

    /// Fresh discovery: drop whatever `connection_id` owned and add `tools`
    /// in one step.
    pub fn replace_connection(&self, connection_id: &str, tools: &[ToolDefinition]) -> AddReport {
        let report = {
            let mut inner = self.inner.write();
            inner.prune(connection_id);
            inner.insert_batch(connection_id, tools)
        };
        log_report(connection_id, &report);
        report
    }

    /// Prune every descriptor owned by `connection_id`
    pub fn remove_by_connection(&self, connection_id: &str) -> usize {
        let removed = self.inner.write().prune(connection_id);
        if removed > 0 {
            debug!(connection_id = %connection_id, removed, "Pruned tools");
        }
        removed
    }

    pub fn get(&self, qualified_name: &str) -> Result<ToolDescriptor> {
        self.inner
            .read()
            .tools
            .get(qualified_name)
            .cloned()
            .ok_or_else(|| HubError::ToolNotFound(qualified_name.to_string()))
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.inner.read().tools.contains_key(qualified_name)
    }

    /// Tools in discovery order, optionally filtered
    pub fn list(&self, filter: Option<&ToolFilter>) -> Vec<ToolDescriptor> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|name| inner.tools.get(name))
            .filter(|tool| filter.map_or(true, |f| f.matches(tool)))
            .cloned()
            .collect()
    }

    /// Every descriptor whose raw name is `raw_name`, across connections
    pub fn find_by_raw_name(&self, raw_name: &str) -> Vec<ToolDescriptor> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|name| inner.tools.get(name))
            .filter(|tool| tool.raw_name == raw_name)
            .cloned()
            .collect()
    }

    /// Check `args` against the tool's input schema without running anything
    pub fn validate_args(&self, qualified_name: &str, args: &Value) -> Result<ValidationResult> {
        let tool = self.get(qualified_name)?;
        Ok(ValidationResult::from_errors(check_arguments(
            &tool.input_schema,
            args,
        )))
    }

    pub fn len(&self) -> usize {
        self.inner.read().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.tools.clear();
        inner.order.clear();
    }
}

impl ConnectionObserver for ToolCatalog {
    fn tools_discovered(&self, connection_id: &str, tools: &[ToolDefinition]) -> Vec<HubError> {
        self.replace_connection(connection_id, tools).errors
    }

    fn connection_lost(&self, connection_id: &str) {
        self.remove_by_connection(connection_id);
    }
}

fn log_report(connection_id: &str, report: &AddReport) {
    for error in &report.errors {
        warn!(connection_id = %connection_id, error = %error, "Rejected tool descriptor");
    }
    debug!(
        connection_id = %connection_id,
        added = report.added.len(),
        rejected = report.errors.len(),
        "Catalog updated"
    );
}

/// Required fields and basic JSON types. Anything the schema doesn't
/// constrain is accepted.
fn check_arguments(schema: &Value, args: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let empty = serde_json::Map::new();
    let object = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            errors.push(format!("arguments must be an object, got {}", json_type(other)));
            return errors;
        }
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(field) {
                errors.push(format!("missing required field '{}'", field));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in object {
            let Some(property) = properties.get(name) else {
                continue;
            };
            if let Some(expected) = property.get("type") {
                if !type_matches(expected, value) {
                    errors.push(format!(
                        "field '{}' should be {}, got {}",
                        name,
                        describe_type(expected),
                        json_type(value)
                    ));
                    continue;
                }
            }
            if let Some(choices) = property.get("enum").and_then(Value::as_array) {
                if !choices.contains(value) {
                    errors.push(format!("field '{}' is not one of the allowed values", name));
                }
            }
        }
    }

    errors
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => single_type_matches(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| single_type_matches(name, value)),
        _ => true,
    }
}

fn single_type_matches(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().map_or(false, |f| f.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
