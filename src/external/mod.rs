//! External collaborators of the orchestration core
//!
//! The record index, holding-pen index, ticketing system, legacy upload
//! endpoint and record validator are consumed through these traits.
//! In-memory implementations live in [`memory`].

pub mod memory;
pub mod validation;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::matching::criteria::Criterion;
use crate::types::WorkflowObject;

pub use memory::{InMemoryRecordIndex, RecordingTicketing, RecordingUploader, TicketEvent};
pub use validation::{RecordValidator, RequiredFieldsValidator};

#[derive(Debug, Error)]
pub enum ExternalError {
    /// The service could not be reached or answered with a retryable failure.
    #[error("{service} unavailable: {message}")]
    Unavailable { service: String, message: String },

    /// The service understood the request and refused it.
    #[error("{service} rejected request: {message}")]
    Rejected { service: String, message: String },

    #[error("{service}: {message}")]
    NotFound { service: String, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ExternalError {
    pub fn unavailable(service: &str, message: impl Into<String>) -> Self {
        ExternalError::Unavailable {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn rejected(service: &str, message: impl Into<String>) -> Self {
        ExternalError::Rejected {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExternalError::Unavailable { .. } | ExternalError::Database(_))
    }
}

/// A catalog record as the index returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub control_number: i64,
    pub data: JsonValue,
}

#[async_trait]
pub trait RecordIndex: Send + Sync {
    /// Control numbers of records matching any criterion, ascending.
    async fn exact_match(&self, criteria: &[Criterion]) -> Result<Vec<i64>, ExternalError>;

    /// Candidate records loosely resembling `query`. Scoring happens in the matcher.
    async fn fuzzy_match(
        &self,
        query: &JsonValue,
        limit: usize,
    ) -> Result<Vec<IndexedRecord>, ExternalError>;

    async fn get(&self, control_number: i64) -> Result<Option<JsonValue>, ExternalError>;

    /// Insert or replace a record. A record carrying `control_number` replaces it.
    async fn store(&self, data: &JsonValue) -> Result<i64, ExternalError>;

    /// Make previous writes visible to searches.
    async fn refresh(&self) -> Result<(), ExternalError>;
}

#[async_trait]
pub trait WorkflowIndex: Send + Sync {
    /// Workflow objects whose record matches any criterion.
    async fn search(
        &self,
        criteria: &[Criterion],
        include_completed: bool,
    ) -> Result<Vec<WorkflowObject>, ExternalError>;

    async fn search_not_completed(
        &self,
        criteria: &[Criterion],
    ) -> Result<Vec<WorkflowObject>, ExternalError> {
        self.search(criteria, false).await
    }

    async fn refresh(&self) -> Result<(), ExternalError>;
}

#[async_trait]
pub trait Ticketing: Send + Sync {
    async fn create_ticket(
        &self,
        queue: &str,
        template: &str,
        context: &JsonValue,
    ) -> Result<String, ExternalError>;

    async fn reply_ticket(
        &self,
        ticket_id: &str,
        template: &str,
        context: &JsonValue,
    ) -> Result<(), ExternalError>;

    async fn close_ticket(&self, ticket_id: &str) -> Result<(), ExternalError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadAck {
    pub accepted: bool,
    pub message: String,
}

#[async_trait]
pub trait LegacyUploader: Send + Sync {
    async fn upload(
        &self,
        payload: &JsonValue,
        mode: &str,
        callback_url: Option<&str>,
    ) -> Result<UploadAck, ExternalError>;
}
