use std::fmt;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::AgentError;
use crate::llm::Message;

type PayloadValidator = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

/// Shape the final answer must take.
///
/// A typed format is derived from a Rust type and checks the payload by
/// deserializing it into that type. A schema format only forwards the raw
/// JSON schema to the provider and returns the payload untouched.
#[derive(Clone)]
pub struct ResponseFormat {
    name: String,
    schema: Value,
    validator: Option<Arc<PayloadValidator>>,
}

impl fmt::Debug for ResponseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFormat")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("typed", &self.is_typed())
            .finish()
    }
}

impl ResponseFormat {
    pub fn of<T>() -> Self
    where
        T: JsonSchema + DeserializeOwned + 'static,
    {
        let schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null);
        Self {
            name: T::schema_name().to_string(),
            schema,
            validator: Some(Arc::new(|payload: &Value| {
                T::deserialize(payload)
                    .map(|_| ())
                    .map_err(|err| err.to_string())
            })),
        }
    }

    pub fn schema(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            validator: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn json_schema(&self) -> &Value {
        &self.schema
    }

    pub fn is_typed(&self) -> bool {
        self.validator.is_some()
    }

    pub(crate) fn validate(&self, payload: &Value) -> Result<(), AgentError> {
        match &self.validator {
            Some(validator) => validator(payload).map_err(|message| {
                AgentError::ResponseFormat(format!(
                    "payload does not match {}: {message}",
                    self.name
                ))
            }),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Text(String),
    Structured(Value),
}

impl Response {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Response::Text(text) => Some(text),
            Response::Structured(_) => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Response::Text(text) => Some(text),
            Response::Structured(_) => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Response::Text(text) => Value::String(text),
            Response::Structured(value) => value,
        }
    }

    pub fn parse<T: DeserializeOwned>(self) -> Result<T, AgentError> {
        serde_json::from_value(self.into_value())
            .map_err(|err| AgentError::ResponseFormat(err.to_string()))
    }
}

pub(crate) fn extract_response(
    terminal: &Message,
    format: Option<&ResponseFormat>,
) -> Result<Response, AgentError> {
    let Some(format) = format else {
        return Ok(Response::Text(
            terminal.content().unwrap_or_default().to_string(),
        ));
    };

    let payload = structured_payload(terminal)?;
    format.validate(&payload)?;
    Ok(Response::Structured(payload))
}

fn structured_payload(terminal: &Message) -> Result<Value, AgentError> {
    if let Some(parsed) = terminal.parsed() {
        return Ok(parsed.clone());
    }

    let content = terminal.content().unwrap_or_default();
    if content.trim().is_empty() {
        return Err(AgentError::ResponseFormat(
            "final message carries no structured payload".to_string(),
        ));
    }

    serde_json::from_str(content).map_err(|err| {
        AgentError::ResponseFormat(format!("final message is not valid JSON: {err}"))
    })
}
