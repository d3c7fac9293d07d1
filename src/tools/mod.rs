use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{AgentError, SchemaError, ToolError};
use crate::llm::ToolDefinition;

type ToolHandler =
    dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync;

#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    json_schema: Value,
    handler: Arc<ToolHandler>,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("json_schema", &self.json_schema)
            .finish()
    }
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            json_schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": true,
            }),
            handler: Arc::new(|_args| -> BoxFuture<'static, Result<Value, ToolError>> {
                Box::pin(async {
                    Err(ToolError::Execution(
                        "tool handler not configured".to_string(),
                    ))
                })
            }),
        }
    }

    /// Builds a tool whose arguments deserialize into `A`; the parameter
    /// schema is derived from `A`.
    pub fn typed<A, R, H, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: H,
    ) -> Self
    where
        A: DeserializeOwned + JsonSchema + Send + 'static,
        R: Serialize + Send + 'static,
        H: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ToolError>> + Send + 'static,
    {
        let name = name.into();
        let mut json_schema = serde_json::to_value(schemars::schema_for!(A))
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
        if let Some(schema) = json_schema.as_object_mut() {
            schema.remove("$schema");
            schema.remove("title");
        }

        let tool_name = name.clone();
        let handler = Arc::new(handler);
        Self {
            name,
            description: description.into(),
            json_schema,
            handler: Arc::new(move |args| -> BoxFuture<'static, Result<Value, ToolError>> {
                let handler = handler.clone();
                let tool_name = tool_name.clone();
                Box::pin(async move {
                    let args = serde_json::from_value::<A>(Value::Object(args)).map_err(|err| {
                        ToolError::InvalidArguments {
                            tool: tool_name,
                            message: err.to_string(),
                        }
                    })?;
                    let output = (handler.as_ref())(args).await?;
                    serde_json::to_value(output).map_err(|err| {
                        ToolError::Execution(format!("tool output is not serializable: {err}"))
                    })
                })
            }),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        validate_schema(&schema)?;
        self.json_schema = schema;
        Ok(self)
    }

    pub fn with_handler<F, Fut, R>(mut self, handler: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ToolError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.handler = Arc::new(move |args| -> BoxFuture<'static, Result<Value, ToolError>> {
            let output = handler(args);
            Box::pin(async move {
                let output = output.await?;
                serde_json::to_value(output).map_err(|err| {
                    ToolError::Execution(format!("tool output is not serializable: {err}"))
                })
            })
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn json_schema(&self) -> &Value {
        &self.json_schema
    }

    pub fn parameter_names(&self) -> Vec<&str> {
        self.json_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|properties| properties.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.json_schema.clone(),
        }
    }

    /// Runs the tool on the provider's raw argument text and renders the
    /// result as the text the model will see.
    pub async fn call(&self, arguments: &str) -> Result<String, ToolError> {
        let args = parse_arguments(self.name(), arguments)?;
        validate_arguments(self.name(), &self.json_schema, &args)?;

        // The handler may panic before it returns its future.
        let output = AssertUnwindSafe(async { (self.handler)(args).await })
            .catch_unwind()
            .await
            .map_err(|panic| ToolError::Panicked {
                tool: self.name.clone(),
                message: panic_message(panic.as_ref()),
            })??;

        Ok(render_output(output))
    }
}

#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Tool>) -> Result<Self, AgentError> {
        let mut by_name = HashMap::new();
        for (index, tool) in tools.iter().enumerate() {
            if by_name.insert(tool.name().to_string(), index).is_some() {
                return Err(AgentError::Configuration(format!(
                    "duplicate tool registered: {}",
                    tool.name()
                )));
            }
        }

        Ok(Self { tools, by_name })
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.by_name.get(name).map(|index| &self.tools[*index])
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tool> {
        self.tools.iter()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(Tool::definition).collect()
    }
}

fn parse_arguments(tool_name: &str, arguments: &str) -> Result<Map<String, Value>, ToolError> {
    if arguments.trim().is_empty() {
        return Ok(Map::new());
    }

    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(args)) => Ok(args),
        Ok(_) => Err(ToolError::InvalidArguments {
            tool: tool_name.to_string(),
            message: "arguments must be a JSON object".to_string(),
        }),
        Err(err) => Err(ToolError::InvalidArguments {
            tool: tool_name.to_string(),
            message: format!("arguments are not valid JSON: {err}"),
        }),
    }
}

fn render_output(output: Value) -> String {
    match output {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn validate_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    let root_type = schema_obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(SchemaError::RootTypeMustBeObject)?;

    if root_type != "object" {
        return Err(SchemaError::RootTypeMustBeObject);
    }

    if let Some(required) = schema_obj.get("required") {
        let required_arr = required.as_array().ok_or(SchemaError::InvalidRequired)?;
        if required_arr.iter().any(|item| !item.is_string()) {
            return Err(SchemaError::InvalidRequired);
        }
    }

    Ok(())
}

fn validate_arguments(
    tool_name: &str,
    schema: &Value,
    args: &Map<String, Value>,
) -> Result<(), ToolError> {
    let invalid = |message: String| ToolError::InvalidArguments {
        tool: tool_name.to_string(),
        message,
    };

    let Some(schema_obj) = schema.as_object() else {
        return Err(invalid("tool schema must be a JSON object".to_string()));
    };

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for field_name in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(field_name) {
                return Err(invalid(format!("missing required field: {field_name}")));
            }
        }
    }

    let empty = Map::new();
    let properties = schema_obj
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    if schema_obj
        .get("additionalProperties")
        .and_then(Value::as_bool)
        == Some(false)
    {
        if let Some(key) = args.keys().find(|key| !properties.contains_key(*key)) {
            return Err(invalid(format!("unknown field: {key}")));
        }
    }

    for (key, value) in args {
        let Some(type_name) = properties
            .get(key)
            .and_then(|field| field.get("type"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        if !value_matches_type(value, type_name) {
            return Err(invalid(format!("field '{key}' must be of type {type_name}")));
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.as_f64().is_some(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    fn upper_tool() -> Tool {
        Tool::new("to_uppercase", "Converts input text to uppercase.")
            .with_schema(json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
                "additionalProperties": false
            }))
            .expect("schema valid")
            .with_handler(|args| async move {
                let text = args
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ToolError::Execution("text missing".to_string()))?;
                Ok::<_, ToolError>(text.to_uppercase())
            })
    }

    #[test]
    fn schema_validation_rejects_non_object_root() {
        let result = Tool::new("bad", "bad").with_schema(json!({"type": "string"}));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn string_output_is_returned_verbatim() {
        let output = upper_tool()
            .call("{\"text\": \"make it so\"}")
            .await
            .expect("tool runs");

        assert_eq!(output, "MAKE IT SO");
    }

    #[tokio::test]
    async fn argument_validation_reports_missing_required() {
        let err = upper_tool().call("{}").await.expect_err("should fail");
        assert!(err.to_string().contains("missing required field"));
    }

    #[tokio::test]
    async fn malformed_arguments_are_a_tool_error() {
        let err = upper_tool()
            .call("{\"text\": ")
            .await
            .expect_err("should fail");
        assert!(matches!(err, ToolError::InvalidArguments { .. }));

        let err = upper_tool().call("[1, 2]").await.expect_err("not an object");
        assert!(err.to_string().contains("must be a JSON object"));
    }

    #[tokio::test]
    async fn panicking_handler_is_caught() {
        let tool = Tool::new("explode", "always panics").with_handler(|_args| async move {
            if true {
                panic!("warp core breach");
            }
            Ok::<_, ToolError>(0)
        });

        let err = tool.call("{}").await.expect_err("panic is caught");
        assert!(matches!(err, ToolError::Panicked { .. }));
        assert!(err.to_string().contains("warp core breach"));
    }

    #[tokio::test]
    async fn handler_panicking_before_its_future_is_caught() {
        let tool = Tool::new("explode_early", "panics while reading arguments").with_handler(
            |args: Map<String, Value>| {
                let n = args
                    .get("n")
                    .and_then(Value::as_i64)
                    .expect("n required");
                async move { Ok::<_, ToolError>(n) }
            },
        );

        let err = tool.call("{}").await.expect_err("panic is caught");
        assert!(matches!(err, ToolError::Panicked { .. }));
        assert!(err.to_string().contains("n required"));

        assert_eq!(tool.call("{\"n\": 7}").await.expect("tool runs"), "7");
    }

    #[derive(Deserialize, JsonSchema)]
    struct UserLookup {
        user_id: i64,
    }

    #[tokio::test]
    async fn typed_tool_derives_schema_and_renders_json_output() {
        let tool = Tool::typed("get_user", "Get a user by id", |args: UserLookup| async move {
            Ok::<_, ToolError>(json!({"id": args.user_id, "name": "Alice"}))
        });

        assert_eq!(tool.parameter_names(), vec!["user_id"]);
        assert_eq!(tool.json_schema()["properties"]["user_id"]["type"], "integer");

        let output = tool.call("{\"user_id\": 123}").await.expect("tool runs");
        assert_eq!(output, "{\"id\":123,\"name\":\"Alice\"}");

        let err = tool
            .call("{\"user_id\": \"abc\"}")
            .await
            .expect_err("wrong type");
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let err = ToolRegistry::new(vec![upper_tool(), upper_tool()]).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate tool registered: to_uppercase"));
    }

    #[test]
    fn registry_lookup_and_definitions() {
        let registry = ToolRegistry::new(vec![upper_tool()]).expect("registry builds");

        assert_eq!(registry.len(), 1);
        assert!(registry.get("to_uppercase").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.definitions()[0].name, "to_uppercase");
    }
}
