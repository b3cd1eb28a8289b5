//! Core library for `secretctl`.
//!
//! The security engine of a local-first secrets vault: Argon2id/HKDF key
//! hierarchy, AES-256-GCM record encryption over an embedded store, an
//! HMAC-chained tamper-evident audit log, and a policy-gated executor that
//! injects secrets into child processes behind a streaming redaction
//! filter. This crate depends on `secretctl-storage` for persistence and
//! knows nothing about CLI parsing, GUI, or RPC framing.

pub mod audit;
pub mod crypto;
pub mod error;
pub mod exec;
pub mod hardening;
pub mod policy;
pub mod record;
pub mod sanitize;
pub mod vault;

pub use audit::{
    Actor, ActorSource, AuditEvent, AuditFilter, AuditOp, AuditResult, ExportFormat, VerifyReport,
};
pub use error::{AuditError, CryptoError, ExecError, PolicyError, VaultError};
pub use exec::RunOutput;
pub use record::{Field, InputType, ListFilter, RecordMeta, SecretRecord};
pub use vault::{CallerTrust, OpContext, RunRequest, Vault};
