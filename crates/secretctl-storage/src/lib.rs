//! Storage layer for `secretctl`.
//!
//! This crate defines the [`RecordStore`] trait — persistence for secret
//! records and their fields, with one row per (record, field). It knows
//! nothing about passwords, keys, or encryption: field values cross this
//! boundary only as opaque ciphertext produced by the crypto layer above.
//!
//! Two implementations are provided:
//!
//! - [`SqliteStore`] — production default, an embedded relational store
//!   (feature `sqlite-backend`)
//! - [`MemoryStore`] — in-memory, for testing only

mod error;
mod memory;
#[cfg(feature = "sqlite-backend")]
mod sqlite_backend;

pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "sqlite-backend")]
pub use sqlite_backend::SqliteStore;

use chrono::{DateTime, Utc};

/// Persisted metadata of one record. Everything here is stored in clear —
/// the key name is public by design so listing and lookup never decrypt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    /// Caller-chosen logical name, unique within the vault.
    pub key: String,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Ordered env-name → field-name bindings.
    pub bindings: Vec<(String, String)>,
    /// Free-form notes.
    pub notes: String,
    /// Associated URL.
    pub url: String,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One field of a record. The value is ciphertext — the crypto layer owns
/// the `nonce || ciphertext || tag` framing inside `value_enc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRow {
    pub name: String,
    /// Insertion order within the record.
    pub position: u32,
    /// Whether the plaintext may leave the core unmasked to machine callers.
    pub sensitive: bool,
    /// Presentation hint: `text` or `textarea`.
    pub input_type: String,
    /// Optional display hint.
    pub hint: Option<String>,
    /// Encrypted value.
    pub value_enc: Vec<u8>,
}

/// Listing result — metadata only, never field values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub key: String,
    pub tags: Vec<String>,
    pub field_count: usize,
    pub has_notes: bool,
    pub has_url: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filter for [`RecordStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Only records carrying this tag.
    pub tag: Option<String>,
    /// Only records whose expiry is set and at or before this instant.
    pub expires_before: Option<DateTime<Utc>>,
}

/// Persistence for secret records.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
/// A record is written atomically with all its fields: [`upsert`] replaces
/// any existing fields in one transaction.
///
/// [`upsert`]: RecordStore::upsert
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Insert or fully replace a record and its fields atomically.
    ///
    /// Returns `true` if an existing record was replaced.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] or [`StoreError::Transaction`] if the
    /// underlying store fails.
    async fn upsert(&self, record: &RecordRow, fields: &[FieldRow]) -> Result<bool, StoreError>;

    /// Fetch a record and all its fields, in position order.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Read`] if the underlying store fails.
    async fn fetch(&self, key: &str) -> Result<Option<(RecordRow, Vec<FieldRow>)>, StoreError>;

    /// Fetch a single field of a record.
    ///
    /// Returns `Ok(None)` if the record or the field does not exist — use
    /// [`exists`](RecordStore::exists) to distinguish the two.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Read`] if the underlying store fails.
    async fn fetch_field(&self, key: &str, field: &str) -> Result<Option<FieldRow>, StoreError>;

    /// Delete a record and all its fields.
    ///
    /// Returns `true` if a record was deleted, `false` if the key was absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Delete`] if the underlying store fails.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// List record metadata matching the query, sorted by key.
    ///
    /// This is a metadata operation — no field values are read.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::List`] if the underlying store fails.
    async fn list(&self, query: &ListQuery) -> Result<Vec<RecordMeta>, StoreError>;

    /// All record keys, sorted. Used for pattern resolution.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::List`] if the underlying store fails.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Check whether a record exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Read`] if the underlying store fails.
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.fetch(key).await?.is_some())
    }
}

impl RecordMeta {
    /// Derive listing metadata from a full row and its field count.
    #[must_use]
    pub fn from_row(record: &RecordRow, field_count: usize) -> Self {
        Self {
            key: record.key.clone(),
            tags: record.tags.clone(),
            field_count,
            has_notes: !record.notes.is_empty(),
            has_url: !record.url.is_empty(),
            expires_at: record.expires_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    /// Whether this record matches the query filters.
    #[must_use]
    pub fn matches(&self, query: &ListQuery) -> bool {
        if let Some(tag) = &query.tag {
            if !self.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(cutoff) = query.expires_before {
            match self.expires_at {
                Some(at) if at <= cutoff => {}
                _ => return false,
            }
        }
        true
    }
}
