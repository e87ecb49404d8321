//! Model calls through a supervised child process.
//!
//! The worker never talks to the model provider directly. Each call spawns
//! the configured wrapper binary in its own process group and speaks
//! newline-delimited JSON with it over stdio:
//!
//! ```text
//! parent -> child   {"type":"start","options":{...}}
//! child  -> parent  {"type":"ready"}
//!                   {"type":"message","data":<provider message>}
//!                   {"type":"complete"}
//!                   {"type":"error","error":"..."}
//! ```

pub mod controller;
pub mod process_group;

pub use controller::{ActiveQueryInfo, QueryAbortHandle, QueryController, QueryHandle};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: String,
    /// Model session to continue, if any
    pub resume: Option<String>,
    pub session_db_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Starting,
    Ready,
    Running,
    Complete,
    Error,
    Killed,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryState::Complete | QueryState::Error | QueryState::Killed)
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to spawn query process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("query process not ready after {0:?}")]
    ReadyTimeout(std::time::Duration),
    #[error("query exceeded {0:?}")]
    Timeout(std::time::Duration),
    #[error("query was aborted")]
    Killed,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("query process io: {0}")]
    Io(#[from] std::io::Error),
}

/// Parent to child.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ControlMessage<'a> {
    Start { options: &'a QueryRequest },
}

/// Child to parent.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ChildMessage {
    Ready,
    Message { data: serde_json::Value },
    Complete,
    Error { error: String },
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// Messages relayed from the provider SDK running inside the child.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderMessage {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    Result {
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
    },
    #[serde(other)]
    Other,
}

impl ProviderMessage {
    /// Model session id announced by `system/init`.
    pub fn init_session_id(&self) -> Option<&str> {
        match self {
            ProviderMessage::System {
                subtype: Some(subtype),
                session_id: Some(id),
            } if subtype == "init" => Some(id.as_str()),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<String> {
        match self {
            ProviderMessage::Assistant { message } => {
                let text: Vec<&str> = message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        ContentBlock::Other => None,
                    })
                    .collect();
                if text.is_empty() {
                    None
                } else {
                    Some(text.join("\n"))
                }
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Everything a finished query produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub text: String,
    pub model_session_id: Option<String>,
    pub usage: QueryUsage,
}

impl QueryOutput {
    /// Fold one provider message in. A `result` flagged `is_error` fails the
    /// whole query.
    pub fn absorb(&mut self, message: &ProviderMessage) -> Result<(), QueryError> {
        if let Some(id) = message.init_session_id() {
            self.model_session_id = Some(id.to_string());
        }
        if let Some(text) = message.text() {
            if !self.text.is_empty() {
                self.text.push('\n');
            }
            self.text.push_str(&text);
        }
        if let ProviderMessage::Result {
            usage,
            total_cost_usd,
            is_error,
            result,
        } = message
        {
            if *is_error {
                let reason = result
                    .as_deref()
                    .filter(|r| !r.is_empty())
                    .unwrap_or("provider reported an error result");
                return Err(QueryError::Provider(reason.to_string()));
            }
            if let Some(usage) = usage {
                self.usage.input_tokens += usage.input_tokens;
                self.usage.output_tokens += usage.output_tokens;
            }
            self.usage.cost_usd += total_cost_usd.unwrap_or(0.0);
        }
        Ok(())
    }
}
