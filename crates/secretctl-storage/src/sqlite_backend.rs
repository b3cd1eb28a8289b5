//! Embedded relational store backed by `SQLite`.
//!
//! One row per record in `records`, one row per (record, field) in
//! `fields`. Field values land here as opaque ciphertext blobs; tags and
//! env bindings are stored as JSON text columns. A record and its fields
//! are always written in a single transaction.

use std::path::{Path, PathBuf};

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::{FieldRow, ListQuery, RecordMeta, RecordRow, RecordStore, StoreError};

/// Record store backed by an embedded `SQLite` database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    ///
    /// A single connection is used: writers are serialized above this layer
    /// and readers share the connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if the file cannot be opened or the
    /// schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Open {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let store = Self { pool, path };
        store.init_schema().await?;
        Ok(store)
    }

    /// Close the connection pool. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// The database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r"CREATE TABLE IF NOT EXISTS records (
                key         TEXT PRIMARY KEY,
                tags        TEXT NOT NULL,
                bindings    TEXT NOT NULL,
                notes       TEXT NOT NULL DEFAULT '',
                url         TEXT NOT NULL DEFAULT '',
                expires_at  TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )",
            r"CREATE TABLE IF NOT EXISTS fields (
                record_key  TEXT NOT NULL REFERENCES records(key) ON DELETE CASCADE,
                name        TEXT NOT NULL,
                position    INTEGER NOT NULL,
                sensitive   INTEGER NOT NULL,
                input_type  TEXT NOT NULL,
                hint        TEXT,
                value_enc   BLOB NOT NULL,
                PRIMARY KEY (record_key, name)
            )",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Open {
                    path: self.path.display().to_string(),
                    reason: format!("schema creation failed: {e}"),
                })?;
        }
        debug!(path = %self.path.display(), "record store opened");
        Ok(())
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RecordRow, StoreError> {
    let key: String = row.try_get("key").map_err(|e| StoreError::List {
        reason: e.to_string(),
    })?;
    let corrupt = |reason: String| StoreError::CorruptRow {
        key: key.clone(),
        reason,
    };

    let tags_json: String = row.try_get("tags").map_err(|e| corrupt(e.to_string()))?;
    let tags: Vec<String> =
        serde_json::from_str(&tags_json).map_err(|e| corrupt(format!("tags column: {e}")))?;

    let bindings_json: String = row
        .try_get("bindings")
        .map_err(|e| corrupt(e.to_string()))?;
    let bindings: Vec<(String, String)> = serde_json::from_str(&bindings_json)
        .map_err(|e| corrupt(format!("bindings column: {e}")))?;

    Ok(RecordRow {
        tags,
        bindings,
        notes: row.try_get("notes").map_err(|e| corrupt(e.to_string()))?,
        url: row.try_get("url").map_err(|e| corrupt(e.to_string()))?,
        expires_at: row
            .try_get("expires_at")
            .map_err(|e| corrupt(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| corrupt(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| corrupt(e.to_string()))?,
        key,
    })
}

fn field_from_row(key: &str, row: &sqlx::sqlite::SqliteRow) -> Result<FieldRow, StoreError> {
    let corrupt = |reason: String| StoreError::CorruptRow {
        key: key.to_owned(),
        reason,
    };
    let position: i64 = row.try_get("position").map_err(|e| corrupt(e.to_string()))?;
    Ok(FieldRow {
        name: row.try_get("name").map_err(|e| corrupt(e.to_string()))?,
        position: u32::try_from(position)
            .map_err(|_| corrupt(format!("negative field position {position}")))?,
        sensitive: row
            .try_get("sensitive")
            .map_err(|e| corrupt(e.to_string()))?,
        input_type: row
            .try_get("input_type")
            .map_err(|e| corrupt(e.to_string()))?,
        hint: row.try_get("hint").map_err(|e| corrupt(e.to_string()))?,
        value_enc: row
            .try_get("value_enc")
            .map_err(|e| corrupt(e.to_string()))?,
    })
}

#[async_trait::async_trait]
impl RecordStore for SqliteStore {
    async fn upsert(&self, record: &RecordRow, fields: &[FieldRow]) -> Result<bool, StoreError> {
        let tags_json = serde_json::to_string(&record.tags).map_err(|e| StoreError::Write {
            key: record.key.clone(),
            reason: format!("tags serialization: {e}"),
        })?;
        let bindings_json =
            serde_json::to_string(&record.bindings).map_err(|e| StoreError::Write {
                key: record.key.clone(),
                reason: format!("bindings serialization: {e}"),
            })?;

        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Transaction {
            reason: e.to_string(),
        })?;

        let existing = sqlx::query("SELECT 1 FROM records WHERE key = ?")
            .bind(&record.key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Read {
                key: record.key.clone(),
                reason: e.to_string(),
            })?;
        let replaced = existing.is_some();

        sqlx::query(
            "INSERT OR REPLACE INTO records \
             (key, tags, bindings, notes, url, expires_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.key)
        .bind(&tags_json)
        .bind(&bindings_json)
        .bind(&record.notes)
        .bind(&record.url)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Write {
            key: record.key.clone(),
            reason: e.to_string(),
        })?;

        // INSERT OR REPLACE on records cascades into fields; the explicit
        // delete keeps the invariant even with foreign keys disabled.
        sqlx::query("DELETE FROM fields WHERE record_key = ?")
            .bind(&record.key)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Write {
                key: record.key.clone(),
                reason: e.to_string(),
            })?;

        for field in fields {
            sqlx::query(
                "INSERT INTO fields \
                 (record_key, name, position, sensitive, input_type, hint, value_enc) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.key)
            .bind(&field.name)
            .bind(i64::from(field.position))
            .bind(field.sensitive)
            .bind(&field.input_type)
            .bind(&field.hint)
            .bind(&field.value_enc)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Write {
                key: record.key.clone(),
                reason: format!("field '{}': {e}", field.name),
            })?;
        }

        tx.commit().await.map_err(|e| StoreError::Transaction {
            reason: e.to_string(),
        })?;
        Ok(replaced)
    }

    async fn fetch(&self, key: &str) -> Result<Option<(RecordRow, Vec<FieldRow>)>, StoreError> {
        let row = sqlx::query("SELECT * FROM records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = record_from_row(&row)?;

        let field_rows =
            sqlx::query("SELECT * FROM fields WHERE record_key = ? ORDER BY position")
                .bind(key)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Read {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?;

        let fields = field_rows
            .iter()
            .map(|r| field_from_row(key, r))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some((record, fields)))
    }

    async fn fetch_field(&self, key: &str, field: &str) -> Result<Option<FieldRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM fields WHERE record_key = ? AND name = ?")
            .bind(key)
            .bind(field)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        row.map(|r| field_from_row(key, &r)).transpose()
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Transaction {
            reason: e.to_string(),
        })?;

        sqlx::query("DELETE FROM fields WHERE record_key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        let result = sqlx::query("DELETE FROM records WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        tx.commit().await.map_err(|e| StoreError::Transaction {
            reason: e.to_string(),
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<RecordMeta>, StoreError> {
        let rows = sqlx::query(
            "SELECT r.*, COUNT(f.name) AS field_count \
             FROM records r LEFT JOIN fields f ON f.record_key = r.key \
             GROUP BY r.key ORDER BY r.key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::List {
            reason: e.to_string(),
        })?;

        let mut metas = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = record_from_row(row)?;
            let count: i64 = row.try_get("field_count").map_err(|e| StoreError::List {
                reason: e.to_string(),
            })?;
            let meta = RecordMeta::from_row(&record, usize::try_from(count).unwrap_or(0));
            if meta.matches(query) {
                metas.push(meta);
            }
        }
        Ok(metas)
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT key FROM records ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::List {
                reason: e.to_string(),
            })?;
        rows.iter()
            .map(|r| {
                r.try_get("key").map_err(|e| StoreError::List {
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::open(dir.path().join("store.db")).await.unwrap()
    }

    fn record(key: &str) -> RecordRow {
        let now = Utc::now();
        RecordRow {
            key: key.to_owned(),
            tags: vec!["prod".to_owned()],
            bindings: vec![("PGHOST".to_owned(), "host".to_owned())],
            notes: String::new(),
            url: String::new(),
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn field(name: &str, position: u32) -> FieldRow {
        FieldRow {
            name: name.to_owned(),
            position,
            sensitive: name != "host",
            input_type: "text".to_owned(),
            hint: Some("hint".to_owned()),
            value_enc: vec![0xAA, 0xBB],
        }
    }

    #[tokio::test]
    async fn roundtrip_record_with_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .upsert(&record("db/prod"), &[field("host", 0), field("password", 1)])
            .await
            .unwrap();

        let (row, fields) = store.fetch("db/prod").await.unwrap().unwrap();
        assert_eq!(row.key, "db/prod");
        assert_eq!(row.tags, vec!["prod"]);
        assert_eq!(row.bindings, vec![("PGHOST".to_owned(), "host".to_owned())]);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "host");
        assert_eq!(fields[1].name, "password");
        assert!(fields[1].sensitive);
    }

    #[tokio::test]
    async fn upsert_replaces_fields_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .upsert(&record("api"), &[field("a", 0), field("b", 1)])
            .await
            .unwrap();
        let replaced = store.upsert(&record("api"), &[field("c", 0)]).await.unwrap();
        assert!(replaced);

        let (_, fields) = store.fetch("api").await.unwrap().unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "c");
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir).await;
            store.upsert(&record("api"), &[field("value", 0)]).await.unwrap();
            store.close().await;
        }
        let store = open_store(&dir).await;
        assert!(store.exists("api").await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_record_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.upsert(&record("api"), &[field("value", 0)]).await.unwrap();
        assert!(store.delete("api").await.unwrap());
        assert!(!store.delete("api").await.unwrap());
        assert!(store.fetch_field("api", "value").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_counts_fields_without_reading_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .upsert(&record("db/prod"), &[field("host", 0), field("password", 1)])
            .await
            .unwrap();

        let metas = store.list(&ListQuery::default()).await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].field_count, 2);
    }

    #[tokio::test]
    async fn keys_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.upsert(&record("b"), &[field("value", 0)]).await.unwrap();
        store.upsert(&record("a"), &[field("value", 0)]).await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["a", "b"]);
    }
}
