mod stream;

use std::fmt;
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{AgentError, TemplateError};
use crate::llm::{
    ChatModel, Message, MessageChunk, ModelCompletion, ModelRequest, OpenAiModel,
    OpenAiModelConfig, ToolCallRequest, ToolDefinition,
};
use crate::prompt::{Prompt, PromptTemplate};
use crate::response::{Response, ResponseFormat, extract_response};
use crate::tools::{Tool, ToolRegistry};

use self::stream::{FinishedTurn, TurnAccumulator};

pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful assistant.";
const TOOL_INSTRUCTIONS: &str =
    "Use the provided tools whenever they help you answer the request.";
const JSON_AFTER_TOOLS_INSTRUCTIONS: &str = "When you are finished with tool calls, respond only with JSON that matches the requested format.";
const JSON_INSTRUCTIONS: &str = "Respond only with JSON that matches the requested format.";

/// Item of a streamed conversation.
///
/// `Chunk` carries a raw provider fragment as it arrives. `Message` carries
/// each message appended to the context; folding those onto the input
/// context gives the same transcript as the non-streaming call.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    Chunk(MessageChunk),
    Message(Message),
}

#[derive(Default)]
pub struct AgentBuilder {
    model: Option<String>,
    instructions: Option<String>,
    tools: Vec<Tool>,
    response_format: Option<ResponseFormat>,
    prompt_template: Option<PromptTemplate>,
    params: Map<String, Value>,
    provider: Option<Arc<dyn ChatModel>>,
    max_rounds: Option<u32>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn with_response_format(mut self, response_format: ResponseFormat) -> Self {
        self.response_format = Some(response_format);
        self
    }

    pub fn with_prompt_template(mut self, template: impl Into<PromptTemplate>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_provider<M>(mut self, provider: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(model) = self.model.filter(|model| !model.trim().is_empty()) else {
            return Err(AgentError::Configuration(
                "model must be specified".to_string(),
            ));
        };

        let tools = ToolRegistry::new(self.tools)?;
        let provider = match self.provider {
            Some(provider) => provider,
            None => Arc::new(
                OpenAiModel::new(OpenAiModelConfig::from_env())
                    .map_err(|err| AgentError::Configuration(err.to_string()))?,
            ),
        };

        let instructions = derive_instructions(
            self.instructions.as_deref(),
            !tools.is_empty(),
            self.response_format.is_some(),
        );

        Ok(Agent {
            model,
            instructions,
            tool_definitions: tools.definitions(),
            tools,
            response_format: self.response_format,
            prompt_template: self.prompt_template,
            params: self.params,
            provider,
            max_rounds: self.max_rounds,
        })
    }
}

#[derive(Clone)]
pub struct Agent {
    model: String,
    instructions: String,
    tools: ToolRegistry,
    tool_definitions: Vec<ToolDefinition>,
    response_format: Option<ResponseFormat>,
    prompt_template: Option<PromptTemplate>,
    params: Map<String, Value>,
    provider: Arc<dyn ChatModel>,
    max_rounds: Option<u32>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.model)
            .field("instructions", &self.instructions)
            .field("tools", &self.tools)
            .field("response_format", &self.response_format)
            .field("prompt_template", &self.prompt_template)
            .field("params", &self.params)
            .field("max_rounds", &self.max_rounds)
            .finish()
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn response_format(&self) -> Option<&ResponseFormat> {
        self.response_format.as_ref()
    }

    pub fn prompt_template(&self) -> Option<&PromptTemplate> {
        self.prompt_template.as_ref()
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Fresh context holding only the system message.
    pub fn new_context(&self) -> Vec<Message> {
        vec![Message::system(self.instructions.clone())]
    }

    /// Runs a self-contained exchange and extracts the final answer.
    pub async fn complete(&self, prompt: impl Into<Prompt>) -> Result<Response, AgentError> {
        let context = self
            .complete_with_context(&self.new_context(), Some(prompt.into()))
            .await?;
        self.final_response(&context)
    }

    pub async fn complete_as<T>(&self, prompt: impl Into<Prompt>) -> Result<T, AgentError>
    where
        T: DeserializeOwned,
    {
        self.complete(prompt).await?.parse()
    }

    /// Streams the text of a self-contained exchange, including any text
    /// a round emits before its tool calls. Tool execution itself yields
    /// nothing.
    pub fn complete_stream<'a, P>(
        &'a self,
        prompt: P,
    ) -> impl Stream<Item = Result<String, AgentError>> + use<'a, P>
    where
        P: Into<Prompt>,
    {
        self.complete_with_context_stream(&self.new_context(), Some(prompt.into()))
            .try_filter_map(|event| async move {
                Ok::<_, AgentError>(match event {
                    ConversationEvent::Chunk(MessageChunk {
                        content: Some(text),
                        ..
                    }) => Some(text),
                    ConversationEvent::Chunk(_) | ConversationEvent::Message(_) => None,
                })
            })
    }

    /// Continues `context` and returns it extended with the user message
    /// (if any), every assistant and tool message, and the final answer.
    pub async fn complete_with_context(
        &self,
        context: &[Message],
        prompt: Option<Prompt>,
    ) -> Result<Vec<Message>, AgentError> {
        let mut context = context.to_vec();
        if let Some(user) = self.render_prompt(prompt)? {
            context.push(user);
        }

        let mut rounds = 0;
        loop {
            self.check_round_budget(rounds)?;
            rounds += 1;

            let completion = {
                let request = self.request(&context);
                tracing::debug!(
                    model = %self.model,
                    round = rounds,
                    messages = context.len(),
                    "requesting completion"
                );
                self.provider.invoke(&request).await?
            };
            log_usage(&completion);

            let message = completion.into_message();
            let tool_calls = message.tool_calls().to_vec();
            context.push(message);

            if tool_calls.is_empty() {
                return Ok(context);
            }

            context.extend(self.resolve_tool_calls(&tool_calls).await?);
        }
    }

    pub fn complete_with_context_stream<'a>(
        &'a self,
        context: &[Message],
        prompt: Option<Prompt>,
    ) -> impl Stream<Item = Result<ConversationEvent, AgentError>> + use<'a> {
        let mut context = context.to_vec();

        try_stream! {
            if let Some(user) = self.render_prompt(prompt)? {
                context.push(user.clone());
                yield ConversationEvent::Message(user);
            }

            let mut rounds = 0;
            loop {
                self.check_round_budget(rounds)?;
                rounds += 1;

                let mut chunks = {
                    let request = self.request(&context);
                    tracing::debug!(
                        model = %self.model,
                        round = rounds,
                        messages = context.len(),
                        "requesting streamed completion"
                    );
                    self.provider.invoke_stream(&request).await?
                };

                let mut turn = TurnAccumulator::new();
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk?;
                    turn.apply(&chunk)?;
                    yield ConversationEvent::Chunk(chunk);
                }

                let message = self.assistant_message(turn.finish()?);
                let tool_calls = message.tool_calls().to_vec();
                context.push(message.clone());
                yield ConversationEvent::Message(message);

                if tool_calls.is_empty() {
                    break;
                }

                for result in self.resolve_tool_calls(&tool_calls).await? {
                    context.push(result.clone());
                    yield ConversationEvent::Message(result);
                }
            }
        }
    }

    fn render_prompt(&self, prompt: Option<Prompt>) -> Result<Option<Message>, AgentError> {
        match prompt {
            None => Ok(None),
            Some(Prompt::Text(text)) if text.is_empty() => Ok(None),
            Some(Prompt::Text(text)) => Ok(Some(Message::user(text))),
            Some(Prompt::Vars(vars)) => {
                let template = self
                    .prompt_template
                    .as_ref()
                    .ok_or(TemplateError::MissingTemplate)?;
                Ok(Some(Message::user(template.render(&vars)?)))
            }
        }
    }

    fn request<'a>(&'a self, context: &'a [Message]) -> ModelRequest<'a> {
        ModelRequest {
            model: &self.model,
            messages: context,
            tools: &self.tool_definitions,
            response_format: self.response_format.as_ref(),
            params: &self.params,
        }
    }

    fn check_round_budget(&self, completed_rounds: u32) -> Result<(), AgentError> {
        match self.max_rounds {
            Some(max_rounds) if completed_rounds >= max_rounds => {
                Err(AgentError::MaxRoundsReached { max_rounds })
            }
            _ => Ok(()),
        }
    }

    fn assistant_message(&self, turn: FinishedTurn) -> Message {
        let parsed = match (&self.response_format, &turn.content) {
            (Some(_), Some(content)) if turn.tool_calls.is_empty() => {
                serde_json::from_str(content).ok()
            }
            _ => None,
        };

        Message::Assistant {
            content: turn.content,
            tool_calls: turn.tool_calls,
            parsed,
        }
    }

    /// Runs every requested tool in order. Unknown tool names abort the
    /// call; failures inside a tool become its result text.
    async fn resolve_tool_calls(
        &self,
        tool_calls: &[ToolCallRequest],
    ) -> Result<Vec<Message>, AgentError> {
        let resolved = tool_calls
            .iter()
            .map(|call| match self.tools.get(&call.name) {
                Some(tool) => Ok((call, tool)),
                None => {
                    tracing::error!(tool = %call.name, tool_call_id = %call.id, "model requested an undeclared tool");
                    Err(AgentError::ToolResolution {
                        tool: call.name.clone(),
                    })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = Vec::with_capacity(resolved.len());
        for (call, tool) in resolved {
            let content = match tool.call(&call.arguments).await {
                Ok(output) => {
                    tracing::debug!(tool = %call.name, tool_call_id = %call.id, "tool call succeeded");
                    output
                }
                Err(err) => {
                    tracing::warn!(
                        tool = %call.name,
                        tool_call_id = %call.id,
                        error = %err,
                        "tool call failed"
                    );
                    format!("Error executing tool: {err}")
                }
            };
            results.push(Message::tool(call.id.clone(), content));
        }

        Ok(results)
    }

    fn final_response(&self, context: &[Message]) -> Result<Response, AgentError> {
        let terminal = context.last().ok_or_else(|| {
            AgentError::ResponseFormat("conversation ended without a final message".to_string())
        })?;
        extract_response(terminal, self.response_format.as_ref())
    }
}

/// Folds a conversation stream onto the context it started from.
pub async fn collect_context<S>(context: &[Message], events: S) -> Result<Vec<Message>, AgentError>
where
    S: Stream<Item = Result<ConversationEvent, AgentError>>,
{
    futures_util::pin_mut!(events);

    let mut context = context.to_vec();
    while let Some(event) = events.next().await {
        if let ConversationEvent::Message(message) = event? {
            context.push(message);
        }
    }
    Ok(context)
}

fn derive_instructions(base: Option<&str>, has_tools: bool, has_response_format: bool) -> String {
    let mut parts = vec![base.unwrap_or(DEFAULT_INSTRUCTIONS)];
    if has_tools {
        parts.push(TOOL_INSTRUCTIONS);
    }
    if has_response_format {
        parts.push(if has_tools {
            JSON_AFTER_TOOLS_INSTRUCTIONS
        } else {
            JSON_INSTRUCTIONS
        });
    }
    parts.join(" ")
}

fn log_usage(completion: &ModelCompletion) {
    if let Some(usage) = &completion.usage {
        tracing::debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "completion usage"
        );
    }
}
