//! Row types for the worker database
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a tracked session. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "completed" => SessionStatus::Completed,
            _ => SessionStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub content_session_id: String,
    pub memory_session_id: Option<String>,
    pub project: String,
    pub user_prompt: String,
    pub prompt_counter: i64,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub started_at_epoch: i64,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_at_epoch: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemKind {
    Observation,
    Summarize,
}

impl QueueItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemKind::Observation => "observation",
            QueueItemKind::Summarize => "summarize",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "observation" => Ok(QueueItemKind::Observation),
            "summarize" => Ok(QueueItemKind::Summarize),
            other => Err(anyhow::anyhow!("Unknown queue item kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Failed,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "pending" => Ok(QueueItemStatus::Pending),
            "processing" => Ok(QueueItemStatus::Processing),
            "failed" => Ok(QueueItemStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown queue item status: {}", other)),
        }
    }
}

/// Normalized work carried by a queue item. Host-specific field names are
/// mapped before anything reaches this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePayload {
    Observation {
        tool_name: String,
        tool_input: String,
        tool_response: String,
        cwd: Option<String>,
    },
    Summarize {
        last_assistant_message: String,
    },
}

impl QueuePayload {
    pub fn kind(&self) -> QueueItemKind {
        match self {
            QueuePayload::Observation { .. } => QueueItemKind::Observation,
            QueuePayload::Summarize { .. } => QueueItemKind::Summarize,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub session_db_id: i64,
    pub content_session_id: String,
    pub payload: QueuePayload,
    pub prompt_number: i64,
    pub status: QueueItemStatus,
    pub retry_count: i32,
    pub created_at_epoch: i64,
    pub started_processing_at_epoch: Option<i64>,
}

/// Observation categories accepted from model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationType {
    Bugfix,
    Feature,
    Refactor,
    Change,
    Discovery,
    Decision,
}

impl ObservationType {
    pub const ALL: [ObservationType; 6] = [
        ObservationType::Bugfix,
        ObservationType::Feature,
        ObservationType::Refactor,
        ObservationType::Change,
        ObservationType::Discovery,
        ObservationType::Decision,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationType::Bugfix => "bugfix",
            ObservationType::Feature => "feature",
            ObservationType::Refactor => "refactor",
            ObservationType::Change => "change",
            ObservationType::Discovery => "discovery",
            ObservationType::Decision => "decision",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedObservation {
    #[serde(rename = "type")]
    pub obs_type: ObservationType,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedSummary {
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
}

impl ParsedSummary {
    /// Field name / value pairs for every populated field, in display order.
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("request", &self.request),
            ("investigated", &self.investigated),
            ("learned", &self.learned),
            ("completed", &self.completed),
            ("next_steps", &self.next_steps),
            ("notes", &self.notes),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|v| (name, v)))
        .collect()
    }
}

/// Session-level context attached to everything written for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputContext {
    pub session_db_id: i64,
    pub memory_session_id: Option<String>,
    pub project: String,
    pub prompt_number: i64,
    pub discovery_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObservation {
    pub id: i64,
    pub session_db_id: i64,
    pub memory_session_id: Option<String>,
    pub project: String,
    pub prompt_number: i64,
    pub discovery_tokens: i64,
    pub created_at_epoch: i64,
    #[serde(flatten)]
    pub body: ParsedObservation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSummary {
    pub id: i64,
    pub session_db_id: i64,
    pub memory_session_id: Option<String>,
    pub project: String,
    pub prompt_number: i64,
    pub discovery_tokens: i64,
    pub created_at_epoch: i64,
    #[serde(flatten)]
    pub body: ParsedSummary,
}

/// Model output saved between Process and Parse so the tail of the pipeline
/// can be replayed without another model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResponse {
    pub id: i64,
    pub queue_item_id: i64,
    pub session_db_id: i64,
    pub kind: QueueItemKind,
    pub prompt_number: i64,
    pub response_text: String,
    pub discovery_tokens: i64,
    pub created_at_epoch: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub pending_items: i64,
    pub processing_items: i64,
    pub failed_items: i64,
    pub total_observations: i64,
    pub total_summaries: i64,
    pub database_size_bytes: i64,
}
