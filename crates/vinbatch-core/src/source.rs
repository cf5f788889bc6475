//! Reading the pending VIN list from the store.

use serde_json::Value;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::store::RecordStore;
use crate::types::Vin;

/// Run `query` and collect the first column of every row as a VIN.
///
/// NULL, empty and non-text values are skipped with a warning.
pub async fn load_vins(store: &dyn RecordStore, query: &str) -> Result<Vec<Vin>, StoreError> {
    let rows = store.select(query).await?;
    let mut vins = Vec::with_capacity(rows.len());
    let mut skipped = 0usize;
    for value in rows.first_column() {
        match value {
            Value::String(s) if !s.is_empty() => vins.push(Vin::new(s.clone())),
            other => {
                skipped += 1;
                warn!(value = %other, "skipping unusable vin value");
            }
        }
    }
    info!(vins = vins.len(), skipped, "loaded pending vin codes");
    Ok(vins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::store::RecordBatch;
    use crate::types::{OnConflict, Rows};

    struct FixedRows(Rows);

    #[async_trait]
    impl RecordStore for FixedRows {
        async fn select(&self, _query: &str) -> Result<Rows, StoreError> {
            Ok(self.0.clone())
        }

        async fn upsert(
            &self,
            _batch: &RecordBatch,
            _table: &str,
            _primary_keys: &[&str],
            _on_conflict: OnConflict,
        ) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn execute(&self, _statement: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn first_column_becomes_vins() {
        let store = FixedRows(Rows {
            columns: vec!["vin".into(), "price".into()],
            rows: vec![
                vec![json!("1HGCM82633A004352"), json!(12_500)],
                vec![Value::Null, json!(1)],
                vec![json!(""), json!(2)],
                vec![json!(42), json!(3)],
                vec![json!("5YJ3E1EA7KF317000"), json!(39_000)],
            ],
        });
        let vins = load_vins(&store, "SELECT vin, price FROM carvana_cars").await.unwrap();
        assert_eq!(
            vins,
            vec![Vin::from("1HGCM82633A004352"), Vin::from("5YJ3E1EA7KF317000")]
        );
    }
}
