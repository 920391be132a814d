//! Capabilities consumed by built-in executors.
//!
//! Concrete model, search, storage and database providers live outside the
//! engine; they plug in by implementing these traits.

use crate::{NodeError, Value, ValueMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by an external adapter.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct AdapterError {
    pub message: String,
    pub retryable: bool,
}

impl AdapterError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<AdapterError> for NodeError {
    fn from(e: AdapterError) -> Self {
        NodeError::Adapter {
            message: e.message,
            retryable: e.retryable,
        }
    }
}

/// Token counters reported by model providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    /// Secret resolved from the run's credential store.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
}

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, AdapterError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: usize,
    pub freshness: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub score: f64,
}

#[async_trait]
pub trait SearchAdapter: Send + Sync {
    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchHit>, AdapterError>;
}

/// Record forwarded to the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub node_id: Option<String>,
    pub details: ValueMap,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            execution_id: String::new(),
            workflow_id: String::new(),
            user_id: String::new(),
            workspace_id: String::new(),
            node_id: None,
            details: ValueMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), AdapterError>;
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSummary {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Workspace-scoped database access for the `db_*` executors.
#[async_trait]
pub trait DbProvider: Send + Sync {
    async fn query(
        &self,
        workspace_id: &str,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<ValueMap>, AdapterError>;

    async fn execute(
        &self,
        workspace_id: &str,
        sql: &str,
        args: &[Value],
    ) -> Result<ExecSummary, AdapterError>;
}

#[async_trait]
pub trait DbAuthorizer: Send + Sync {
    async fn ensure_access(&self, workspace_id: &str, user_id: &str) -> Result<(), AdapterError>;
}
