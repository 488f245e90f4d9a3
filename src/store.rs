//! Durable storage of workflow objects
//!
//! The engine persists progress after every executed task through
//! [`WorkflowStore`]. [`crate::db::objects::PgWorkflowStore`] is the production
//! implementation; [`InMemoryWorkflowStore`] backs tests and `--in-memory` runs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{ObjectListFilter, ObjectStatus, WorkflowObject};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow object not found: {0}")]
    NotFound(Uuid),

    #[error("workflow object already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn create(&self, obj: &WorkflowObject) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowObject>, StoreError>;

    /// Persist the full object, cursor included. Bumps `modified_at`.
    async fn save(&self, obj: &mut WorkflowObject) -> Result<(), StoreError>;

    async fn list(&self, filter: &ObjectListFilter) -> Result<Vec<WorkflowObject>, StoreError>;

    /// Objects whose `holdingpen_matches` contain `id`.
    async fn find_blocked_by(&self, id: Uuid) -> Result<Vec<WorkflowObject>, StoreError>;

    /// Overwrite only `extra_data.holdingpen_matches`, leaving the rest of the
    /// stored object untouched. Returns the object as stored afterwards.
    async fn set_holdingpen_matches(
        &self,
        id: Uuid,
        matches: &[Uuid],
    ) -> Result<Option<WorkflowObject>, StoreError>;

    /// Atomically move the object to RUNNING if its status is one of `expected`.
    ///
    /// Returns false when another caller got there first.
    async fn claim(&self, id: Uuid, expected: &[ObjectStatus]) -> Result<bool, StoreError>;
}

/* ===================== In-memory store ===================== */

#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    objects: RwLock<HashMap<Uuid, WorkflowObject>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create(&self, obj: &WorkflowObject) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(&obj.id) {
            return Err(StoreError::AlreadyExists(obj.id));
        }
        objects.insert(obj.id, obj.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowObject>, StoreError> {
        Ok(self.objects.read().await.get(&id).cloned())
    }

    async fn save(&self, obj: &mut WorkflowObject) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        if !objects.contains_key(&obj.id) {
            return Err(StoreError::NotFound(obj.id));
        }
        obj.modified_at = Utc::now();
        objects.insert(obj.id, obj.clone());
        Ok(())
    }

    async fn list(&self, filter: &ObjectListFilter) -> Result<Vec<WorkflowObject>, StoreError> {
        let objects = self.objects.read().await;
        let mut found: Vec<WorkflowObject> = objects
            .values()
            .filter(|obj| filter.matches(obj))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            found.truncate(limit.max(0) as usize);
        }
        Ok(found)
    }

    async fn find_blocked_by(&self, id: Uuid) -> Result<Vec<WorkflowObject>, StoreError> {
        let objects = self.objects.read().await;
        let mut found: Vec<WorkflowObject> = objects
            .values()
            .filter(|obj| obj.extra_data.holdingpen_matches.contains(&id))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn set_holdingpen_matches(
        &self,
        id: Uuid,
        matches: &[Uuid],
    ) -> Result<Option<WorkflowObject>, StoreError> {
        let mut objects = self.objects.write().await;
        Ok(objects.get_mut(&id).map(|obj| {
            obj.extra_data.holdingpen_matches = matches.to_vec();
            obj.modified_at = Utc::now();
            obj.clone()
        }))
    }

    async fn claim(&self, id: Uuid, expected: &[ObjectStatus]) -> Result<bool, StoreError> {
        let mut objects = self.objects.write().await;
        match objects.get_mut(&id) {
            Some(obj) if expected.contains(&obj.status) => {
                obj.status = ObjectStatus::Running;
                obj.modified_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CreateObjectParams;
    use serde_json::json;

    fn object(name: &str) -> WorkflowObject {
        WorkflowObject::new(CreateObjectParams {
            workflow_name: name.to_string(),
            data: json!({"titles": [{"title": "A"}]}),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_create_get_save() {
        let store = InMemoryWorkflowStore::new();
        let mut obj = object("article");
        store.create(&obj).await.unwrap();
        assert!(matches!(store.create(&obj).await, Err(StoreError::AlreadyExists(_))));

        obj.status = ObjectStatus::Halted;
        obj.callback_pos = vec![0, 3];
        store.save(&mut obj).await.unwrap();

        let loaded = store.get(obj.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ObjectStatus::Halted);
        assert_eq!(loaded.callback_pos, vec![0, 3]);
    }

    #[tokio::test]
    async fn test_save_unknown_object_fails() {
        let store = InMemoryWorkflowStore::new();
        let mut obj = object("article");
        assert!(matches!(store.save(&mut obj).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = InMemoryWorkflowStore::new();
        let mut done = object("article");
        done.status = ObjectStatus::Completed;
        let pending = object("article");
        let other = object("author");
        for obj in [&done, &pending, &other] {
            store.create(obj).await.unwrap();
        }

        let filter = ObjectListFilter {
            workflow_name: Some("article".to_string()),
            not_completed: true,
            ..Default::default()
        };
        let found = store.list(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, pending.id);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryWorkflowStore::new();
        let mut obj = object("article");
        obj.status = ObjectStatus::Halted;
        store.create(&obj).await.unwrap();

        let expected = [ObjectStatus::Halted, ObjectStatus::Waiting];
        assert!(store.claim(obj.id, &expected).await.unwrap());
        assert!(!store.claim(obj.id, &expected).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_holdingpen_matches_keeps_other_fields() {
        let store = InMemoryWorkflowStore::new();
        let blocker = object("article");
        let mut blocked = object("article");
        blocked.extra_data.holdingpen_matches = vec![blocker.id];
        store.create(&blocked).await.unwrap();

        let mut halted = blocked.clone();
        halted.status = ObjectStatus::Halted;
        halted.callback_pos = vec![0, 4];
        store.save(&mut halted).await.unwrap();

        let updated = store
            .set_holdingpen_matches(blocked.id, &[])
            .await
            .unwrap()
            .unwrap();
        assert!(updated.extra_data.holdingpen_matches.is_empty());
        assert_eq!(updated.status, ObjectStatus::Halted);
        assert_eq!(updated.callback_pos, vec![0, 4]);
        assert!(store
            .set_holdingpen_matches(Uuid::new_v4(), &[])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_blocked_by() {
        let store = InMemoryWorkflowStore::new();
        let blocker = object("article");
        let mut blocked = object("article");
        blocked.extra_data.holdingpen_matches = vec![blocker.id];
        store.create(&blocker).await.unwrap();
        store.create(&blocked).await.unwrap();

        let found = store.find_blocked_by(blocker.id).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, blocked.id);
        assert!(store.find_blocked_by(blocked.id).await.unwrap().is_empty());
    }
}
