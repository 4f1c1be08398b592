//! Tool registry: registration, scope-filtered resolution, validated dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

use crate::tools::{
    truncate_output, SideEffect, Tool, ToolDescriptor, ToolResult, ToolScope,
    MAX_TOOL_OUTPUT_BYTES,
};

/// Default tool execution timeout (2 minutes).
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Registry for the tools available to a deployment.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            default_timeout: timeout,
        }
    }

    /// Register a tool. Re-registering a name replaces the previous entry.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().await;
        if tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool = %name, "replaced existing tool registration");
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        tools.get(name).cloned()
    }

    /// Declared side-effect class for a tool, if registered.
    pub async fn side_effect(&self, name: &str) -> Option<SideEffect> {
        self.get(name).await.map(|t| t.side_effect())
    }

    /// Descriptors for every tool visible in `scope`, sorted by name so the
    /// provider sees a stable list.
    pub async fn resolve_tools(&self, scope: &ToolScope) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().await;
        let mut descriptors: Vec<ToolDescriptor> = tools
            .values()
            .filter(|t| scope.allows(t.name()))
            .map(|t| t.as_ref().descriptor())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Execute a tool by name.
    ///
    /// Never returns `Err`: unknown tools, schema violations, handler errors,
    /// and timeouts all come back as error envelopes so the agent loop can
    /// feed them to the reasoning step instead of dying.
    pub async fn execute(&self, name: &str, params: Value) -> ToolResult {
        let Some(tool) = self.get(name).await else {
            return ToolResult::error_with_code("unknown_tool", format!("unknown tool: {name}"));
        };

        if let Err(reason) = validate_params(&tool.parameters_schema(), &params) {
            tracing::debug!(tool = name, %reason, "params failed schema validation");
            return ToolResult::error_with_code("validation", format!("invalid params: {reason}"));
        }

        let start = Instant::now();
        let result = match tokio::time::timeout(self.default_timeout, tool.execute(params)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    tool = name,
                    timeout_secs = self.default_timeout.as_secs(),
                    "tool execution timed out"
                );
                ToolResult::error_with_code(
                    "timeout",
                    format!(
                        "tool '{}' timed out after {} seconds",
                        name,
                        self.default_timeout.as_secs()
                    ),
                )
            }
        };

        tracing::debug!(
            tool = name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            is_error = result.is_error,
            "tool finished"
        );

        ToolResult {
            output: truncate_output(&result.output, MAX_TOOL_OUTPUT_BYTES),
            is_error: result.is_error,
        }
    }
}

/// Check `params` against a declared JSON schema: every `required` key must
/// be present and every present property must match its declared primitive
/// type. Nested objects are not descended into; a tool wanting deep
/// validation does it in its handler via `parse_params`.
pub fn validate_params(schema: &Value, params: &Value) -> Result<(), String> {
    let Some(object) = params.as_object() else {
        return Err("params must be an object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(format!("missing field `{key}`"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in object {
            let Some(declared) = properties.get(key) else {
                continue;
            };
            let Some(expected) = declared.get("type").and_then(Value::as_str) else {
                continue;
            };
            let matches = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(format!("field `{key}` must be of type {expected}"));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoTool {
        effect: SideEffect,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the message back"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"}
                },
                "required": ["message"]
            })
        }
        fn side_effect(&self) -> SideEffect {
            self.effect
        }
        async fn execute(&self, params: Value) -> ToolResult {
            ToolResult::success(params["message"].as_str().unwrap_or_default())
        }
    }

    struct SleepyTool;

    #[async_trait]
    impl Tool for SleepyTool {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "Never finishes in time"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn side_effect(&self) -> SideEffect {
            SideEffect::ReadOnly
        }
        async fn execute(&self, _params: Value) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ToolResult::success("too late")
        }
    }

    #[tokio::test]
    async fn execute_unknown_tool_is_nonfatal() {
        let registry = ToolRegistry::new();
        let result = registry.execute("missing", json!({})).await;
        assert!(result.is_error);
        assert_eq!(result.error_code().as_deref(), Some("unknown_tool"));
    }

    #[tokio::test]
    async fn execute_validates_required_fields() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(EchoTool {
                effect: SideEffect::ReadOnly,
            }))
            .await;

        let result = registry.execute("echo", json!({})).await;
        assert_eq!(result.error_code().as_deref(), Some("validation"));

        let result = registry.execute("echo", json!({"message": 5})).await;
        assert_eq!(result.error_code().as_deref(), Some("validation"));

        let result = registry.execute("echo", json!({"message": "hi"})).await;
        assert!(!result.is_error);
        assert_eq!(result.output, "hi");
    }

    #[tokio::test]
    async fn resolve_tools_honors_scope_and_sorts() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(EchoTool {
                effect: SideEffect::ReadOnly,
            }))
            .await;

        struct WipeTool;
        #[async_trait]
        impl Tool for WipeTool {
            fn name(&self) -> &str {
                "wipe"
            }
            fn description(&self) -> &str {
                "Destroy things"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object", "properties": {}})
            }
            fn side_effect(&self) -> SideEffect {
                SideEffect::Destructive
            }
            async fn execute(&self, _params: Value) -> ToolResult {
                ToolResult::success("gone")
            }
        }
        registry.register(Arc::new(WipeTool)).await;

        let all = registry.resolve_tools(&ToolScope::all()).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "echo");
        assert_eq!(all[1].name, "wipe");
        assert_eq!(all[1].side_effect, SideEffect::Destructive);

        let scoped = registry
            .resolve_tools(&ToolScope::all().without("wipe"))
            .await;
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].name, "echo");
    }

    #[tokio::test(start_paused = true)]
    async fn execute_times_out() {
        let registry = ToolRegistry::with_timeout(Duration::from_secs(5));
        registry.register(Arc::new(SleepyTool)).await;

        let handle = tokio::spawn(async move { registry.execute("sleepy", json!({})).await });
        tokio::time::advance(Duration::from_secs(6)).await;
        let result = handle.await.unwrap();
        assert_eq!(result.error_code().as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn side_effect_is_authoritative_from_registration() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(EchoTool {
                effect: SideEffect::Destructive,
            }))
            .await;
        assert_eq!(
            registry.side_effect("echo").await,
            Some(SideEffect::Destructive)
        );
    }

    #[test]
    fn validate_rejects_non_object_params() {
        let schema = json!({"type": "object", "properties": {}});
        assert!(validate_params(&schema, &json!("nope")).is_err());
        assert!(validate_params(&schema, &json!({})).is_ok());
    }
}
