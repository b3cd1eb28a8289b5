//! In-memory record store for testing.
//!
//! Stores all rows in a `BTreeMap` behind a `RwLock`. Not persistent — all
//! data is lost when the process exits. Use this for unit tests and
//! integration tests where you need a real store without touching disk.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{FieldRow, ListQuery, RecordMeta, RecordRow, RecordStore, StoreError};

/// An in-memory record store backed by a `BTreeMap`.
///
/// Thread-safe and async-compatible. Records are sorted by key, which makes
/// listing deterministic without an explicit sort.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<String, (RecordRow, Vec<FieldRow>)>>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, record: &RecordRow, fields: &[FieldRow]) -> Result<bool, StoreError> {
        let mut data = self.data.write().await;
        let replaced = data
            .insert(record.key.clone(), (record.clone(), fields.to_vec()))
            .is_some();
        Ok(replaced)
    }

    async fn fetch(&self, key: &str) -> Result<Option<(RecordRow, Vec<FieldRow>)>, StoreError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn fetch_field(&self, key: &str, field: &str) -> Result<Option<FieldRow>, StoreError> {
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .and_then(|(_, fields)| fields.iter().find(|f| f.name == field).cloned()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some())
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<RecordMeta>, StoreError> {
        let data = self.data.read().await;
        Ok(data
            .values()
            .map(|(record, fields)| RecordMeta::from_row(record, fields.len()))
            .filter(|meta| meta.matches(query))
            .collect())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let data = self.data.read().await;
        Ok(data.keys().cloned().collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let data = self.data.read().await;
        Ok(data.contains_key(key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(key: &str, tags: &[&str]) -> RecordRow {
        let now = Utc::now();
        RecordRow {
            key: key.to_owned(),
            tags: tags.iter().map(|t| (*t).to_owned()).collect(),
            bindings: Vec::new(),
            notes: String::new(),
            url: String::new(),
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn field(name: &str) -> FieldRow {
        FieldRow {
            name: name.to_owned(),
            position: 0,
            sensitive: true,
            input_type: "text".to_owned(),
            hint: None,
            value_enc: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn fetch_nonexistent_returns_none() {
        let store = MemoryStore::new();
        assert!(store.fetch("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_and_fetch_roundtrip() {
        let store = MemoryStore::new();
        let replaced = store
            .upsert(&record("api", &[]), &[field("value")])
            .await
            .unwrap();
        assert!(!replaced);

        let (row, fields) = store.fetch("api").await.unwrap().unwrap();
        assert_eq!(row.key, "api");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].value_enc, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_fields() {
        let store = MemoryStore::new();
        store
            .upsert(&record("api", &[]), &[field("a"), field("b")])
            .await
            .unwrap();
        let replaced = store
            .upsert(&record("api", &[]), &[field("c")])
            .await
            .unwrap();
        assert!(replaced);

        let (_, fields) = store.fetch("api").await.unwrap().unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "c");
    }

    #[tokio::test]
    async fn fetch_field_finds_by_name() {
        let store = MemoryStore::new();
        store
            .upsert(&record("db", &[]), &[field("host"), field("password")])
            .await
            .unwrap();
        let f = store.fetch_field("db", "password").await.unwrap().unwrap();
        assert_eq!(f.name, "password");
        assert!(store.fetch_field("db", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemoryStore::new();
        store.upsert(&record("api", &[]), &[field("value")]).await.unwrap();
        assert!(store.delete("api").await.unwrap());
        assert!(!store.delete("api").await.unwrap());
        assert!(!store.exists("api").await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_tag() {
        let store = MemoryStore::new();
        store.upsert(&record("a", &["prod"]), &[field("value")]).await.unwrap();
        store.upsert(&record("b", &["dev"]), &[field("value")]).await.unwrap();

        let query = ListQuery {
            tag: Some("prod".to_owned()),
            expires_before: None,
        };
        let metas = store.list(&query).await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].key, "a");
    }

    #[tokio::test]
    async fn list_filters_by_expiry() {
        let store = MemoryStore::new();
        let mut expiring = record("soon", &[]);
        expiring.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.upsert(&expiring, &[field("value")]).await.unwrap();
        store.upsert(&record("never", &[]), &[field("value")]).await.unwrap();

        let query = ListQuery {
            tag: None,
            expires_before: Some(Utc::now() + chrono::Duration::days(1)),
        };
        let metas = store.list(&query).await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].key, "soon");
    }

    #[tokio::test]
    async fn list_returns_metadata_not_values() {
        let store = MemoryStore::new();
        let mut row = record("api", &[]);
        row.notes = "some notes".to_owned();
        store.upsert(&row, &[field("value")]).await.unwrap();

        let metas = store.list(&ListQuery::default()).await.unwrap();
        assert_eq!(metas[0].field_count, 1);
        assert!(metas[0].has_notes);
        assert!(!metas[0].has_url);
    }

    #[tokio::test]
    async fn keys_sorted() {
        let store = MemoryStore::new();
        store.upsert(&record("b", &[]), &[field("value")]).await.unwrap();
        store.upsert(&record("a", &[]), &[field("value")]).await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.upsert(&record("api", &[]), &[field("value")]).await.unwrap();
        assert!(clone.exists("api").await.unwrap());
    }
}
