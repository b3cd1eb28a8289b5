//! Storage error types.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger. Variants never contain field values — those are
//! ciphertext at this layer, but keeping them out of errors costs nothing.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Failed to open the store at the given path.
    #[error("failed to open store at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// Failed to read a record or field.
    #[error("failed to read record '{key}': {reason}")]
    Read { key: String, reason: String },

    /// Failed to write a record.
    #[error("failed to write record '{key}': {reason}")]
    Write { key: String, reason: String },

    /// Failed to delete a record.
    #[error("failed to delete record '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// Failed to list records.
    #[error("failed to list records: {reason}")]
    List { reason: String },

    /// Failed to begin or commit a transaction.
    #[error("transaction failed: {reason}")]
    Transaction { reason: String },

    /// A persisted row violates the schema (bad JSON column, bad timestamp).
    #[error("corrupt row for record '{key}': {reason}")]
    CorruptRow { key: String, reason: String },
}
