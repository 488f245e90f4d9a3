//! Postgres-backed catalog record index

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::debug;

use super::objects::criteria_arrays;
use crate::external::{ExternalError, IndexedRecord, RecordIndex};
use crate::matching::criteria::Criterion;
use crate::matching::fuzzy;

#[derive(Debug, Clone)]
pub struct PgRecordIndex {
    pool: PgPool,
}

impl PgRecordIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Title tokens joined as an OR text-search query. Tokens are plain alphanumerics.
fn title_query(query: &JsonValue) -> Option<String> {
    let tokens: Vec<String> = fuzzy::title_tokens(query).into_iter().collect();
    if tokens.is_empty() {
        return None;
    }
    Some(tokens.join(" | "))
}

#[async_trait]
impl RecordIndex for PgRecordIndex {
    async fn exact_match(&self, criteria: &[Criterion]) -> Result<Vec<i64>, ExternalError> {
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        let (paths, values) = criteria_arrays(criteria);

        let rows = sqlx::query(
            r#"
            SELECT control_number
            FROM records
            WHERE EXISTS (
                SELECT 1
                FROM unnest($1::text[], $2::text[]) AS c(path, value)
                WHERE jsonb_path_exists(
                    data,
                    c.path::jsonpath,
                    jsonb_build_object('v', c.value::jsonb)
                )
            )
            ORDER BY control_number ASC
            "#,
        )
        .bind(&paths)
        .bind(&values)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("control_number")).collect())
    }

    async fn fuzzy_match(
        &self,
        query: &JsonValue,
        limit: usize,
    ) -> Result<Vec<IndexedRecord>, ExternalError> {
        let Some(tsquery) = title_query(query) else {
            return Ok(Vec::new());
        };
        debug!(query = %tsquery, limit, "record_fuzzy_query");

        let rows = sqlx::query(
            r#"
            SELECT control_number, data
            FROM records
            WHERE to_tsvector('simple', coalesce(data #>> '{titles,0,title}', ''))
                  @@ to_tsquery('simple', $1)
            ORDER BY control_number ASC
            LIMIT $2
            "#,
        )
        .bind(&tsquery)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| IndexedRecord {
                control_number: row.get("control_number"),
                data: row.get("data"),
            })
            .collect())
    }

    async fn get(&self, control_number: i64) -> Result<Option<JsonValue>, ExternalError> {
        let row = sqlx::query("SELECT data FROM records WHERE control_number = $1")
            .bind(control_number)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get("data")))
    }

    async fn store(&self, data: &JsonValue) -> Result<i64, ExternalError> {
        if !data.is_object() {
            return Err(ExternalError::rejected("record index", "record must be an object"));
        }
        let mut tx = self.pool.begin().await?;

        let control_number: i64 = match data.get("control_number").and_then(JsonValue::as_i64) {
            Some(cn) => {
                sqlx::query(
                    r#"
                    INSERT INTO records (control_number, data)
                    VALUES ($1, $2)
                    ON CONFLICT (control_number)
                    DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
                    "#,
                )
                .bind(cn)
                .bind(data)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    SELECT setval(
                        pg_get_serial_sequence('records', 'control_number'),
                        GREATEST((SELECT MAX(control_number) FROM records), 1)
                    )
                    "#,
                )
                .execute(&mut *tx)
                .await?;
                cn
            }
            None => {
                let row = sqlx::query(
                    "INSERT INTO records (data) VALUES ($1) RETURNING control_number",
                )
                .bind(data)
                .fetch_one(&mut *tx)
                .await?;
                let cn: i64 = row.get("control_number");

                let mut stored = data.clone();
                stored["control_number"] = json!(cn);
                sqlx::query("UPDATE records SET data = $2 WHERE control_number = $1")
                    .bind(cn)
                    .bind(&stored)
                    .execute(&mut *tx)
                    .await?;
                cn
            }
        };

        tx.commit().await?;
        Ok(control_number)
    }

    /// Writes are visible as soon as their transaction commits.
    async fn refresh(&self) -> Result<(), ExternalError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support;

    #[test]
    fn test_title_query_joins_tokens() {
        let query = title_query(&json!({"titles": [{"title": "Lattice QCD"}]})).unwrap();
        let mut tokens: Vec<&str> = query.split(" | ").collect();
        tokens.sort();
        assert_eq!(tokens, vec!["lattice", "qcd"]);

        assert!(title_query(&json!({"titles": []})).is_none());
    }

    #[tokio::test]
    #[ignore] // Requires database to be running
    async fn test_store_assigns_then_replaces() {
        let index = PgRecordIndex::new(test_support::pool().await);
        let eprint = uuid::Uuid::new_v4().to_string();

        let cn = index
            .store(&json!({"titles": [{"title": "Lattice QCD"}], "arxiv_eprints": [{"value": eprint}]}))
            .await
            .unwrap();
        let stored = index.get(cn).await.unwrap().unwrap();
        assert_eq!(stored["control_number"], json!(cn));

        let again = index
            .store(&json!({"control_number": cn, "titles": [{"title": "Lattice QCD revisited"}]}))
            .await
            .unwrap();
        assert_eq!(again, cn);

        let found = index
            .exact_match(&[Criterion::new("control_number", json!(cn))])
            .await
            .unwrap();
        assert_eq!(found, vec![cn]);
    }
}
