//! Postgres-backed workflow object store and holding-pen index

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::external::{ExternalError, WorkflowIndex};
use crate::matching::criteria::Criterion;
use crate::store::{StoreError, WorkflowStore};
use crate::types::{ObjectListFilter, ObjectStatus, WorkflowObject};

const COLUMNS: &str = "id, workflow_name, status, data, extra_data, callback_pos, \
                       id_workflow, id_parent, id_user, created_at, modified_at";

#[derive(Debug, Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn object_from_row(row: &PgRow) -> Result<WorkflowObject, StoreError> {
    let extra_data: JsonValue = row.get("extra_data");
    let callback_pos: Vec<i32> = row.get("callback_pos");

    Ok(WorkflowObject {
        id: row.get("id"),
        workflow_name: row.get("workflow_name"),
        data: row.get("data"),
        extra_data: serde_json::from_value(extra_data)?,
        status: row.get("status"),
        callback_pos: callback_pos.into_iter().map(|p| p.max(0) as usize).collect(),
        id_workflow: row.get("id_workflow"),
        id_parent: row.get("id_parent"),
        id_user: row.get("id_user"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    })
}

fn cursor_to_sql(callback_pos: &[usize]) -> Vec<i32> {
    callback_pos.iter().map(|p| *p as i32).collect()
}

/// Paths and JSON-encoded values, bound as parallel text arrays.
pub(crate) fn criteria_arrays(criteria: &[Criterion]) -> (Vec<String>, Vec<String>) {
    criteria
        .iter()
        .map(|c| (c.json_path(), c.value.to_string()))
        .unzip()
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn create(&self, obj: &WorkflowObject) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_objects (
                id, workflow_name, status, data, extra_data, callback_pos,
                id_workflow, id_parent, id_user, created_at, modified_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(obj.id)
        .bind(&obj.workflow_name)
        .bind(obj.status)
        .bind(&obj.data)
        .bind(serde_json::to_value(&obj.extra_data)?)
        .bind(cursor_to_sql(&obj.callback_pos))
        .bind(obj.id_workflow)
        .bind(obj.id_parent)
        .bind(obj.id_user)
        .bind(obj.created_at)
        .bind(obj.modified_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(obj.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowObject>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM workflow_objects WHERE id = $1", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(object_from_row).transpose()
    }

    async fn save(&self, obj: &mut WorkflowObject) -> Result<(), StoreError> {
        let modified_at = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE workflow_objects
            SET status = $2,
                data = $3,
                extra_data = $4,
                callback_pos = $5,
                id_parent = $6,
                id_user = $7,
                modified_at = $8
            WHERE id = $1
            "#,
        )
        .bind(obj.id)
        .bind(obj.status)
        .bind(&obj.data)
        .bind(serde_json::to_value(&obj.extra_data)?)
        .bind(cursor_to_sql(&obj.callback_pos))
        .bind(obj.id_parent)
        .bind(obj.id_user)
        .bind(modified_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(obj.id));
        }
        obj.modified_at = modified_at;
        Ok(())
    }

    async fn list(&self, filter: &ObjectListFilter) -> Result<Vec<WorkflowObject>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM workflow_objects
            WHERE ($1::text IS NULL OR workflow_name = $1)
              AND ($2::text IS NULL OR status = $2)
              AND (NOT $3 OR status <> 'completed')
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#,
            COLUMNS
        ))
        .bind(filter.workflow_name.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.not_completed)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(object_from_row).collect()
    }

    async fn find_blocked_by(&self, id: Uuid) -> Result<Vec<WorkflowObject>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM workflow_objects
            WHERE extra_data -> 'holdingpen_matches' @> jsonb_build_array($1::text)
            ORDER BY created_at ASC, id ASC
            "#,
            COLUMNS
        ))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(object_from_row).collect()
    }

    async fn set_holdingpen_matches(
        &self,
        id: Uuid,
        matches: &[Uuid],
    ) -> Result<Option<WorkflowObject>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE workflow_objects
            SET extra_data = jsonb_set(extra_data, '{{holdingpen_matches}}', $2),
                modified_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id)
        .bind(serde_json::to_value(matches)?)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(object_from_row).transpose()
    }

    async fn claim(&self, id: Uuid, expected: &[ObjectStatus]) -> Result<bool, StoreError> {
        let expected: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
        let claimed = sqlx::query(
            r#"
            UPDATE workflow_objects
            SET status = 'running',
                modified_at = NOW()
            WHERE id = $1
              AND status = ANY($2)
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(&expected)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }
}

#[async_trait]
impl WorkflowIndex for PgWorkflowStore {
    async fn search(
        &self,
        criteria: &[Criterion],
        include_completed: bool,
    ) -> Result<Vec<WorkflowObject>, ExternalError> {
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        let (paths, values) = criteria_arrays(criteria);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM workflow_objects
            WHERE ($3 OR status <> 'completed')
              AND EXISTS (
                  SELECT 1
                  FROM unnest($1::text[], $2::text[]) AS c(path, value)
                  WHERE jsonb_path_exists(
                      data,
                      c.path::jsonpath,
                      jsonb_build_object('v', c.value::jsonb)
                  )
              )
            ORDER BY created_at ASC, id ASC
            "#,
            COLUMNS
        ))
        .bind(&paths)
        .bind(&values)
        .bind(include_completed)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(object_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ExternalError::unavailable("workflow index", e.to_string()))
    }

    /// Reads go straight to the table, so there is nothing to catch up on.
    async fn refresh(&self) -> Result<(), ExternalError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support;
    use crate::types::{CreateObjectParams, HaltAction, HaltInfo, Mark};
    use maplit::btreemap;
    use serde_json::json;

    fn object(data: JsonValue) -> WorkflowObject {
        WorkflowObject::new(CreateObjectParams {
            workflow_name: "article".to_string(),
            data,
            ..Default::default()
        })
    }

    #[test]
    fn test_criteria_are_bound_as_parallel_arrays() {
        let criteria = vec![
            Criterion::new("arxiv_eprints.value", json!("1234.5678")),
            Criterion::new("dois.value", json!("10.1000/xyz")),
        ];
        let (paths, values) = criteria_arrays(&criteria);
        assert_eq!(
            paths,
            vec![
                r#"$."arxiv_eprints"."value" ? (@ == $v)"#.to_string(),
                r#"$."dois"."value" ? (@ == $v)"#.to_string(),
            ]
        );
        assert_eq!(values, vec![r#""1234.5678""#, r#""10.1000/xyz""#]);
    }

    #[tokio::test]
    #[ignore] // Requires database to be running
    async fn test_object_round_trips_through_postgres() {
        let store = PgWorkflowStore::new(test_support::pool().await);
        let mut obj = object(json!({"titles": [{"title": "Round trip"}]}));
        obj.extra_data.marks = btreemap! { Mark::Approved => json!(true) };
        obj.extra_data.halt = Some(HaltInfo {
            action: HaltAction::HepApproval,
            message: "approve".to_string(),
        });
        obj.status = ObjectStatus::Halted;
        obj.callback_pos = vec![0, 10, 1, 2];

        store.create(&obj).await.unwrap();
        assert!(matches!(
            store.create(&obj).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let loaded = store.get(obj.id).await.unwrap().unwrap();
        assert_eq!(loaded.callback_pos, vec![0, 10, 1, 2]);
        assert_eq!(loaded.status, ObjectStatus::Halted);
        assert_eq!(loaded.extra_data, obj.extra_data);
        assert_eq!(loaded.data, obj.data);
    }

    #[tokio::test]
    #[ignore] // Requires database to be running
    async fn test_claim_only_succeeds_once() {
        let store = PgWorkflowStore::new(test_support::pool().await);
        let mut obj = object(json!({}));
        obj.status = ObjectStatus::Waiting;
        store.create(&obj).await.unwrap();

        assert!(store.claim(obj.id, &[ObjectStatus::Waiting]).await.unwrap());
        assert!(!store.claim(obj.id, &[ObjectStatus::Waiting]).await.unwrap());

        let loaded = store.get(obj.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ObjectStatus::Running);
    }

    #[tokio::test]
    #[ignore] // Requires database to be running
    async fn test_search_and_blockers() {
        let store = PgWorkflowStore::new(test_support::pool().await);
        let eprint = Uuid::new_v4().to_string();

        let blocker = object(json!({"arxiv_eprints": [{"value": eprint}]}));
        store.create(&blocker).await.unwrap();

        let mut blocked = object(json!({"arxiv_eprints": [{"value": eprint}]}));
        blocked.extra_data.holdingpen_matches = vec![blocker.id];
        store.create(&blocked).await.unwrap();

        let found = store
            .search_not_completed(&[Criterion::new("arxiv_eprints.value", json!(eprint))])
            .await
            .unwrap();
        let ids: Vec<Uuid> = found.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![blocker.id, blocked.id]);

        let waiting = store.find_blocked_by(blocker.id).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, blocked.id);

        let released = store
            .set_holdingpen_matches(blocked.id, &[])
            .await
            .unwrap()
            .unwrap();
        assert!(released.extra_data.holdingpen_matches.is_empty());
        assert!(store.find_blocked_by(blocker.id).await.unwrap().is_empty());
    }
}
