use std::mem;

use crate::error::AgentError;
use crate::llm::{MessageChunk, ToolCallDelta, ToolCallRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TurnState {
    AccumulatingContent,
    AccumulatingToolCalls,
    Terminal,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct FinishedTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Folds the fragments of one streamed assistant turn.
///
/// Text may precede tool calls but never follow them. Tool-call fragments
/// are keyed by position: the next free index opens a call, a known index
/// extends its argument text.
#[derive(Debug)]
pub(crate) struct TurnAccumulator {
    state: TurnState,
    content: String,
    saw_content: bool,
    calls: Vec<PartialToolCall>,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self {
            state: TurnState::AccumulatingContent,
            content: String::new(),
            saw_content: false,
            calls: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn apply(&mut self, chunk: &MessageChunk) -> Result<(), AgentError> {
        if self.state == TurnState::Terminal {
            return Err(AgentError::StreamProtocol(
                "fragment received after the turn was finalized".to_string(),
            ));
        }

        // Empty strings carry no text; some providers attach them to
        // tool-call fragments.
        if let Some(content) = chunk.content.as_deref().filter(|text| !text.is_empty()) {
            if self.state == TurnState::AccumulatingToolCalls {
                return Err(AgentError::StreamProtocol(
                    "content arrived after tool calls started".to_string(),
                ));
            }
            self.content.push_str(content);
            self.saw_content = true;
        }

        for delta in &chunk.tool_calls {
            self.apply_delta(delta)?;
            self.state = TurnState::AccumulatingToolCalls;
        }

        Ok(())
    }

    fn apply_delta(&mut self, delta: &ToolCallDelta) -> Result<(), AgentError> {
        if delta.index == self.calls.len() {
            self.calls.push(PartialToolCall {
                id: delta.id.clone(),
                name: delta.name.clone(),
                arguments: delta.arguments.clone(),
            });
            return Ok(());
        }

        let Some(call) = self.calls.get_mut(delta.index) else {
            return Err(AgentError::StreamProtocol(format!(
                "tool call fragment index {} skips past {} known calls",
                delta.index,
                self.calls.len()
            )));
        };

        if call.id.is_none() {
            call.id = delta.id.clone();
        }
        if call.name.is_none() {
            call.name = delta.name.clone();
        }
        call.arguments.push_str(&delta.arguments);
        Ok(())
    }

    pub fn finish(&mut self) -> Result<FinishedTurn, AgentError> {
        self.state = TurnState::Terminal;

        let content = if self.saw_content {
            Some(mem::take(&mut self.content))
        } else {
            None
        };

        let tool_calls = mem::take(&mut self.calls)
            .into_iter()
            .enumerate()
            .map(|(index, call)| match (call.id, call.name) {
                (Some(id), Some(name)) => Ok(ToolCallRequest {
                    id,
                    name,
                    arguments: call.arguments,
                }),
                _ => Err(AgentError::StreamProtocol(format!(
                    "tool call at index {index} ended without an id and name"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(FinishedTurn {
            content,
            tool_calls,
        })
    }
}
