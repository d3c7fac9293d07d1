use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
}

/// Failures raised while running a tool. These never reach the caller of
/// `Agent::complete`; the loop reports them back to the model instead.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("{0}")]
    Execution(String),
    #[error("tool {tool} panicked: {message}")]
    Panicked { tool: String, message: String },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("prompt was given as variables but no prompt template is configured")]
    MissingTemplate,
    #[error("prompt template references {0:?} but no value was supplied")]
    MissingVariable(String),
    #[error("prompt template has an unmatched brace at byte {0}")]
    UnmatchedBrace(usize),
    #[error("prompt variable {name:?} cannot be represented as JSON: {message}")]
    InvalidVariable { name: String, message: String },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("model requested unknown tool: {tool}")]
    ToolResolution { tool: String },
    #[error("stream protocol violation: {0}")]
    StreamProtocol(String),
    #[error("response format error: {0}")]
    ResponseFormat(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("max rounds reached ({max_rounds})")]
    MaxRoundsReached { max_rounds: u32 },
}
