//! Error types for `secretctl-core`.
//!
//! Each subsystem has its own error enum; every variant carries enough
//! context to diagnose the problem without a debugger. All of them converge
//! into [`VaultError`], the caller-facing taxonomy whose variants map 1:1
//! to the stable error codes consumed by the CLI/RPC mappers.
//!
//! No error message ever embeds a secret value. Key names are logically
//! public and may appear; field values, passwords, and derived keys never do.

use secretctl_storage::StoreError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// Authenticated decryption failed. Deliberately carries no detail:
    /// wrong key, tampered ciphertext, and truncation are indistinguishable
    /// to avoid oracle leaks.
    #[error("decryption failed: authentication error")]
    AuthFailure,

    /// Argon2 or HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },
}

/// Errors from the audit chain.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The chain HMAC key has not been set (vault is locked).
    #[error("audit chain key is not set")]
    KeyUnset,

    /// Less than the required free disk space is available for the log.
    #[error("insufficient disk space for audit log: {available} bytes available")]
    DiskFull { available: u64 },

    /// Reading or writing a log file failed.
    #[error("audit I/O failed on '{path}': {reason}")]
    Io { path: String, reason: String },

    /// Serialization of an audit event failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors from the executor policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The policy file exists but cannot be trusted or read — a symlink,
    /// loose permissions, wrong owner, or an I/O failure.
    #[error("policy file unavailable: {reason}")]
    Unavailable { reason: String },

    /// The policy file parsed but violates the schema.
    #[error("invalid policy file: {reason}")]
    Invalid { reason: String },
}

/// Errors from the executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Spawning the child process failed.
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// The child exceeded its timeout and was killed.
    #[error("command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The executor is shutting down and accepts no new children.
    #[error("executor is not accepting new commands")]
    Busy,

    /// Reading child output failed.
    #[error("child I/O failed: {reason}")]
    Io { reason: String },

    /// Building the output sanitizer failed.
    #[error("sanitizer construction failed: {reason}")]
    Sanitizer { reason: String },
}

/// Caller-facing errors. Variant names are the stable error codes surfaced
/// through the CLI and RPC mappers and written into audit events.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The vault is locked — unlock first.
    #[error("vault is locked")]
    VaultLocked,

    /// The vault is already unlocked in this process.
    #[error("vault is already unlocked")]
    VaultAlreadyUnlocked,

    /// Wrong master password, or ciphertext that fails authentication.
    #[error("authentication failed")]
    AuthFailure,

    /// Too many consecutive unlock failures — retry after the cooldown.
    #[error("unlock is in cooldown for another {remaining_secs}s")]
    UnlockCooldown { remaining_secs: u64 },

    /// The record (or field within it) does not exist.
    #[error("not found: {key}{}", .field.as_deref().map(|f| format!(" (field '{f}')")).unwrap_or_default())]
    NotFound { key: String, field: Option<String> },

    /// A vault already exists at the given directory.
    #[error("already exists: {key}")]
    AlreadyExists { key: String },

    /// The record failed validation.
    #[error("validation error: {detail}")]
    ValidationError { detail: String },

    /// The command was denied by policy.
    #[error("command denied by policy: {command}")]
    PolicyDenied { command: String },

    /// The policy file cannot be read or trusted; the call is not permitted.
    #[error("policy unavailable")]
    PolicyUnavailable,

    /// A sensitive field may not be returned in plaintext to this caller.
    #[error("sensitive field access denied: {field}")]
    SensitiveFieldAccessDenied { field: String },

    /// The executor is not accepting new commands.
    #[error("executor busy")]
    ExecutorBusy,

    /// The child process exceeded its timeout.
    #[error("timeout")]
    Timeout,

    /// An I/O or storage failure.
    #[error("I/O error: {reason}")]
    IOError { reason: String },

    /// An integrity failure: a record that fails authentication, a chain
    /// break, or filesystem permissions too loose for secret material.
    #[error("corrupted vault: {detail}")]
    CorruptedVault { detail: String },

    /// The on-disk vault format version is not supported by this build.
    #[error("vault format version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
}

impl VaultError {
    /// The stable error code written into audit events and consumed by the
    /// CLI/RPC mappers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::VaultLocked => "VaultLocked",
            Self::VaultAlreadyUnlocked => "VaultAlreadyUnlocked",
            Self::AuthFailure => "AuthFailure",
            Self::UnlockCooldown { .. } => "UnlockCooldown",
            Self::NotFound { .. } => "NotFound",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::ValidationError { .. } => "ValidationError",
            Self::PolicyDenied { .. } => "PolicyDenied",
            Self::PolicyUnavailable => "PolicyUnavailable",
            Self::SensitiveFieldAccessDenied { .. } => "SensitiveFieldAccessDenied",
            Self::ExecutorBusy => "ExecutorBusy",
            Self::Timeout => "Timeout",
            Self::IOError { .. } => "IOError",
            Self::CorruptedVault { .. } => "CorruptedVault",
            Self::VersionMismatch { .. } => "VersionMismatch",
        }
    }
}

impl From<StoreError> for VaultError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CorruptRow { key, reason } => Self::CorruptedVault {
                detail: format!("record '{key}': {reason}"),
            },
            other => Self::IOError {
                reason: other.to_string(),
            },
        }
    }
}

impl From<AuditError> for VaultError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::KeyUnset => Self::VaultLocked,
            other => Self::IOError {
                reason: other.to_string(),
            },
        }
    }
}

impl From<PolicyError> for VaultError {
    fn from(_: PolicyError) -> Self {
        // Detail stays in the audit log; the caller only learns the policy
        // could not be consulted.
        Self::PolicyUnavailable
    }
}

impl From<ExecError> for VaultError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Timeout { .. } => Self::Timeout,
            ExecError::Busy => Self::ExecutorBusy,
            other => Self::IOError {
                reason: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(VaultError::VaultLocked.code(), "VaultLocked");
        assert_eq!(
            VaultError::UnlockCooldown { remaining_secs: 30 }.code(),
            "UnlockCooldown"
        );
        assert_eq!(
            VaultError::NotFound {
                key: "api".to_owned(),
                field: None
            }
            .code(),
            "NotFound"
        );
    }

    #[test]
    fn not_found_display_includes_field() {
        let err = VaultError::NotFound {
            key: "db/prod".to_owned(),
            field: Some("password".to_owned()),
        };
        let msg = err.to_string();
        assert!(msg.contains("db/prod"));
        assert!(msg.contains("password"));
    }

    #[test]
    fn auth_failure_carries_no_detail() {
        let msg = CryptoError::AuthFailure.to_string();
        assert!(!msg.contains("key"));
        assert!(!msg.contains("nonce"));
    }

    #[test]
    fn policy_error_maps_to_unavailable() {
        let err: VaultError = PolicyError::Unavailable {
            reason: "mode 0644".to_owned(),
        }
        .into();
        assert_eq!(err.code(), "PolicyUnavailable");
        // The caller-visible message must not leak the file diagnostic.
        assert!(!err.to_string().contains("0644"));
    }

    #[test]
    fn exec_errors_map_to_distinct_codes() {
        let timeout: VaultError = ExecError::Timeout { timeout_secs: 5 }.into();
        let busy: VaultError = ExecError::Busy.into();
        assert_eq!(timeout.code(), "Timeout");
        assert_eq!(busy.code(), "ExecutorBusy");
    }
}
