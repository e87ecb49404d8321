//! Acquire: claimed queue item to normalized raw event.

use serde::Serialize;

use super::PipelineError;
use super::execution::Stage;
use crate::memory_db::{QueueItem, QueuePayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Write,
    Search,
    Bash,
    Web,
    Task,
    Other,
}

impl ToolCategory {
    pub fn of(tool_name: &str) -> Self {
        match tool_name {
            "Read" | "NotebookRead" => ToolCategory::Read,
            "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => ToolCategory::Write,
            "Grep" | "Glob" | "LS" => ToolCategory::Search,
            "Bash" | "BashOutput" | "KillShell" => ToolCategory::Bash,
            "WebFetch" | "WebSearch" => ToolCategory::Web,
            "Task" | "Agent" | "TodoWrite" => ToolCategory::Task,
            _ => ToolCategory::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub tool_name: String,
    pub tool_input: String,
    pub tool_output: String,
    pub cwd: Option<String>,
    pub created_at_epoch: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Observation(RawObservation),
    Summarize { last_assistant_message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquireMetadata {
    pub input_token_estimate: usize,
    pub output_token_estimate: usize,
    pub tool_category: Option<ToolCategory>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acquired {
    pub event: RawEvent,
    pub prompt_number: i64,
    pub created_at_epoch: i64,
    pub metadata: AcquireMetadata,
}

/// Rough token count, four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub fn acquire(item: &QueueItem) -> Result<Acquired, PipelineError> {
    let (event, metadata) = match &item.payload {
        QueuePayload::Observation {
            tool_name,
            tool_input,
            tool_response,
            cwd,
        } => {
            let tool_name = tool_name.trim();
            if tool_name.is_empty() {
                return Err(PipelineError::Contract {
                    stage: Stage::Acquire,
                    message: format!("observation item {} has no tool name", item.id),
                });
            }
            let metadata = AcquireMetadata {
                input_token_estimate: estimate_tokens(tool_input),
                output_token_estimate: estimate_tokens(tool_response),
                tool_category: Some(ToolCategory::of(tool_name)),
            };
            let event = RawEvent::Observation(RawObservation {
                tool_name: tool_name.to_string(),
                tool_input: tool_input.clone(),
                tool_output: tool_response.clone(),
                cwd: cwd.clone().filter(|c| !c.is_empty()),
                created_at_epoch: item.created_at_epoch,
            });
            (event, metadata)
        }
        QueuePayload::Summarize {
            last_assistant_message,
        } => (
            RawEvent::Summarize {
                last_assistant_message: last_assistant_message.clone(),
            },
            AcquireMetadata {
                input_token_estimate: estimate_tokens(last_assistant_message),
                output_token_estimate: 0,
                tool_category: None,
            },
        ),
    };

    Ok(Acquired {
        event,
        prompt_number: item.prompt_number,
        created_at_epoch: item.created_at_epoch,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::QueueItemStatus;

    fn item(payload: QueuePayload) -> QueueItem {
        QueueItem {
            id: 7,
            session_db_id: 1,
            content_session_id: "ext-1".into(),
            payload,
            prompt_number: 2,
            status: QueueItemStatus::Processing,
            retry_count: 0,
            created_at_epoch: 1_700_000_000_000,
            started_processing_at_epoch: None,
        }
    }

    #[test]
    fn test_observation_acquired_with_estimates() {
        let acquired = acquire(&item(QueuePayload::Observation {
            tool_name: "Edit".into(),
            tool_input: "12345678".into(),
            tool_response: "123".into(),
            cwd: Some(String::new()),
        }))
        .unwrap();

        assert_eq!(acquired.metadata.input_token_estimate, 2);
        assert_eq!(acquired.metadata.output_token_estimate, 1);
        assert_eq!(acquired.metadata.tool_category, Some(ToolCategory::Write));
        match acquired.event {
            RawEvent::Observation(obs) => assert_eq!(obs.cwd, None),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_tool_name_is_contract_violation() {
        let err = acquire(&item(QueuePayload::Observation {
            tool_name: "  ".into(),
            tool_input: "{}".into(),
            tool_response: "{}".into(),
            cwd: None,
        }))
        .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_tool_categories() {
        assert_eq!(ToolCategory::of("Grep"), ToolCategory::Search);
        assert_eq!(ToolCategory::of("Bash"), ToolCategory::Bash);
        assert_eq!(ToolCategory::of("Custom"), ToolCategory::Other);
    }
}
