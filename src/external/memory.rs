//! In-memory collaborators for tests and local runs

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{ExternalError, IndexedRecord, LegacyUploader, RecordIndex, Ticketing, UploadAck, WorkflowIndex};
use crate::matching::criteria::{matches_any, Criterion};
use crate::matching::fuzzy;
use crate::store::{InMemoryWorkflowStore, WorkflowStore};
use crate::types::{ObjectListFilter, WorkflowObject};

/* ===================== Record index ===================== */

#[derive(Debug, Default)]
struct RecordTables {
    visible: BTreeMap<i64, JsonValue>,
    pending: BTreeMap<i64, JsonValue>,
    next_control_number: i64,
}

/// Catalog records keyed by control number.
///
/// With `lagging`, stored records only become searchable after `refresh`.
#[derive(Debug, Default)]
pub struct InMemoryRecordIndex {
    tables: RwLock<RecordTables>,
    lagging: bool,
    latency_ms: AtomicU64,
}

impl InMemoryRecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lagging() -> Self {
        Self {
            lagging: true,
            ..Self::default()
        }
    }

    /// Seed a record directly. Returns its control number.
    pub async fn insert(&self, data: JsonValue) -> i64 {
        let mut tables = self.tables.write().await;
        let cn = assign_control_number(&mut tables, &data);
        let mut data = data;
        data["control_number"] = json!(cn);
        tables.visible.insert(cn, data);
        cn
    }

    pub async fn len(&self) -> usize {
        let tables = self.tables.read().await;
        tables.visible.len() + tables.pending.len()
    }

    /// Delay every exact-match query by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }
}

fn assign_control_number(tables: &mut RecordTables, data: &JsonValue) -> i64 {
    match data.get("control_number").and_then(JsonValue::as_i64) {
        Some(cn) => {
            tables.next_control_number = tables.next_control_number.max(cn);
            cn
        }
        None => {
            tables.next_control_number += 1;
            tables.next_control_number
        }
    }
}

#[async_trait]
impl RecordIndex for InMemoryRecordIndex {
    async fn exact_match(&self, criteria: &[Criterion]) -> Result<Vec<i64>, ExternalError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.tables.read().await;
        Ok(tables
            .visible
            .iter()
            .filter(|(_, data)| matches_any(criteria, data))
            .map(|(cn, _)| *cn)
            .collect())
    }

    async fn fuzzy_match(
        &self,
        query: &JsonValue,
        limit: usize,
    ) -> Result<Vec<IndexedRecord>, ExternalError> {
        let wanted = fuzzy::title_tokens(query);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.tables.read().await;
        Ok(tables
            .visible
            .iter()
            .filter(|(_, data)| !fuzzy::title_tokens(data).is_disjoint(&wanted))
            .take(limit)
            .map(|(cn, data)| IndexedRecord {
                control_number: *cn,
                data: data.clone(),
            })
            .collect())
    }

    async fn get(&self, control_number: i64) -> Result<Option<JsonValue>, ExternalError> {
        let tables = self.tables.read().await;
        Ok(tables
            .visible
            .get(&control_number)
            .or_else(|| tables.pending.get(&control_number))
            .cloned())
    }

    async fn store(&self, data: &JsonValue) -> Result<i64, ExternalError> {
        if !data.is_object() {
            return Err(ExternalError::rejected("record index", "record must be an object"));
        }
        let mut tables = self.tables.write().await;
        let cn = assign_control_number(&mut tables, data);
        let mut data = data.clone();
        data["control_number"] = json!(cn);
        if self.lagging {
            tables.pending.insert(cn, data);
        } else {
            tables.visible.insert(cn, data);
        }
        Ok(cn)
    }

    async fn refresh(&self) -> Result<(), ExternalError> {
        let mut tables = self.tables.write().await;
        let pending = std::mem::take(&mut tables.pending);
        tables.visible.extend(pending);
        Ok(())
    }
}

/* ===================== Workflow index ===================== */

#[async_trait]
impl WorkflowIndex for InMemoryWorkflowStore {
    async fn search(
        &self,
        criteria: &[Criterion],
        include_completed: bool,
    ) -> Result<Vec<WorkflowObject>, ExternalError> {
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        let filter = ObjectListFilter {
            not_completed: !include_completed,
            ..Default::default()
        };
        let objects = self
            .list(&filter)
            .await
            .map_err(|e| ExternalError::unavailable("workflow index", e.to_string()))?;
        Ok(objects
            .into_iter()
            .filter(|obj| matches_any(criteria, &obj.data))
            .collect())
    }

    async fn refresh(&self) -> Result<(), ExternalError> {
        Ok(())
    }
}

/* ===================== Ticketing ===================== */

#[derive(Debug, Clone, PartialEq)]
pub enum TicketEvent {
    Created {
        ticket_id: String,
        queue: String,
        template: String,
    },
    Replied {
        ticket_id: String,
        template: String,
    },
    Closed {
        ticket_id: String,
    },
}

/// Records every ticket operation. `fail_next` injects transient failures.
#[derive(Debug, Default)]
pub struct RecordingTicketing {
    events: Mutex<Vec<TicketEvent>>,
    next_id: AtomicU64,
    failures: AtomicU32,
}

impl RecordingTicketing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: u32) {
        self.failures.store(times, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<TicketEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn created_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, TicketEvent::Created { .. }))
            .count()
    }

    fn check_failure(&self) -> Result<(), ExternalError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ExternalError::unavailable("ticketing", "injected failure"));
        }
        Ok(())
    }

    fn push(&self, event: TicketEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl Ticketing for RecordingTicketing {
    async fn create_ticket(
        &self,
        queue: &str,
        template: &str,
        _context: &JsonValue,
    ) -> Result<String, ExternalError> {
        self.check_failure()?;
        let ticket_id = format!("ticket-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.push(TicketEvent::Created {
            ticket_id: ticket_id.clone(),
            queue: queue.to_string(),
            template: template.to_string(),
        });
        Ok(ticket_id)
    }

    async fn reply_ticket(
        &self,
        ticket_id: &str,
        template: &str,
        _context: &JsonValue,
    ) -> Result<(), ExternalError> {
        self.check_failure()?;
        self.push(TicketEvent::Replied {
            ticket_id: ticket_id.to_string(),
            template: template.to_string(),
        });
        Ok(())
    }

    async fn close_ticket(&self, ticket_id: &str) -> Result<(), ExternalError> {
        self.check_failure()?;
        self.push(TicketEvent::Closed {
            ticket_id: ticket_id.to_string(),
        });
        Ok(())
    }
}

/* ===================== Legacy upload ===================== */

#[derive(Debug, Default)]
pub struct RecordingUploader {
    uploads: Mutex<Vec<(JsonValue, String)>>,
    refuse: AtomicBool,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_uploads(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> Vec<(JsonValue, String)> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LegacyUploader for RecordingUploader {
    async fn upload(
        &self,
        payload: &JsonValue,
        mode: &str,
        callback_url: Option<&str>,
    ) -> Result<UploadAck, ExternalError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ExternalError::rejected("legacy upload", "upload refused"));
        }
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.push((payload.clone(), mode.to_string()));
        }
        let message = match callback_url {
            Some(url) => format!("queued, acknowledgement will be sent to {}", url),
            None => "uploaded".to_string(),
        };
        Ok(UploadAck {
            accepted: true,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lagging_index_needs_refresh() {
        let index = InMemoryRecordIndex::lagging();
        let cn = index
            .store(&json!({"arxiv_eprints": [{"value": "1234.5678"}]}))
            .await
            .unwrap();
        let criteria = vec![Criterion::new("arxiv_eprints.value", json!("1234.5678"))];

        assert!(index.exact_match(&criteria).await.unwrap().is_empty());
        index.refresh().await.unwrap();
        assert_eq!(index.exact_match(&criteria).await.unwrap(), vec![cn]);
    }

    #[tokio::test]
    async fn test_store_replaces_existing_record() {
        let index = InMemoryRecordIndex::new();
        let cn = index.insert(json!({"titles": [{"title": "Old"}]})).await;
        let stored = index
            .store(&json!({"control_number": cn, "titles": [{"title": "New"}]}))
            .await
            .unwrap();
        assert_eq!(stored, cn);
        assert_eq!(index.len().await, 1);
        let data = index.get(cn).await.unwrap().unwrap();
        assert_eq!(data["titles"][0]["title"], "New");
    }

    #[tokio::test]
    async fn test_ticketing_injected_failures() {
        let ticketing = RecordingTicketing::new();
        ticketing.fail_next(1);
        assert!(ticketing.create_ticket("q", "t", &json!({})).await.is_err());
        let id = ticketing.create_ticket("q", "t", &json!({})).await.unwrap();
        assert_eq!(id, "ticket-1");
        assert_eq!(ticketing.created_count(), 1);
    }
}
