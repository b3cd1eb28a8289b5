//! Tamper-evident audit chain.
//!
//! Every vault operation appends one event to a monthly JSONL file under
//! `<vault>/audit/`. Events are HMAC-chained: each event's `hmac` covers
//! the canonical serialization of all its significant fields including the
//! previous event's `hmac`, so modifying, deleting, inserting, or
//! reordering any line is detectable offline. The chain head
//! `{sequence, prev_hmac}` is persisted to `audit.meta` (temp + rename) so
//! a new process continues the chain where the last one stopped.
//!
//! Pruning deletes whole events older than a horizon and does **not**
//! re-link the chain: the gap stays visible, and [`AuditLog::verify`]
//! distinguishes a pruned prefix (earliest surviving sequence > 1) from
//! mid-chain tampering.
//!
//! # Thread safety
//!
//! One `tokio::sync::Mutex` serializes the chain head and all writes. The
//! critical section is one line append plus one small rename.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto::{self, SecretKey};
use crate::error::AuditError;
use crate::hardening;

/// Audit event schema version.
pub const AUDIT_SCHEMA_VERSION: u32 = 1;

/// The `prev_hmac` of the first event in a chain.
pub const GENESIS: &str = "genesis";

/// Minimum free disk space required before appending (where the query is
/// supported; an unsupported platform proceeds without checking).
const MIN_FREE_DISK_BYTES: u64 = 1024 * 1024;

/// Characters of the hashed key name kept in CSV exports.
const CSV_KEY_HASH_LEN: usize = 16;

/// Enumerated operation tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOp {
    #[serde(rename = "vault.init")]
    VaultInit,
    #[serde(rename = "vault.unlock")]
    VaultUnlock,
    #[serde(rename = "vault.lock")]
    VaultLock,
    #[serde(rename = "secret.set")]
    SecretSet,
    #[serde(rename = "secret.get")]
    SecretGet,
    #[serde(rename = "secret.list")]
    SecretList,
    #[serde(rename = "secret.delete")]
    SecretDelete,
    #[serde(rename = "secret.exists")]
    SecretExists,
    #[serde(rename = "secret.run")]
    SecretRun,
    #[serde(rename = "secret.run_denied")]
    SecretRunDenied,
    #[serde(rename = "policy.error")]
    PolicyError,
    #[serde(rename = "audit.prune")]
    AuditPrune,
}

impl AuditOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VaultInit => "vault.init",
            Self::VaultUnlock => "vault.unlock",
            Self::VaultLock => "vault.lock",
            Self::SecretSet => "secret.set",
            Self::SecretGet => "secret.get",
            Self::SecretList => "secret.list",
            Self::SecretDelete => "secret.delete",
            Self::SecretExists => "secret.exists",
            Self::SecretRun => "secret.run",
            Self::SecretRunDenied => "secret.run_denied",
            Self::PolicyError => "policy.error",
            Self::AuditPrune => "audit.prune",
        }
    }
}

/// Which surface issued the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorSource {
    Cli,
    Mcp,
    Ui,
    Api,
}

impl ActorSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Mcp => "mcp",
            Self::Ui => "ui",
            Self::Api => "api",
        }
    }
}

/// Who performed the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub source: ActorSource,
    pub session_id: String,
}

/// Outcome of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Error,
    Denied,
}

impl AuditResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Denied => "denied",
        }
    }
}

/// One persisted audit event: a chain link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub version: u32,
    /// Time-sortable 128-bit id.
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOp,
    /// HMAC of the key name under the key-name subkey; the plaintext key
    /// never enters the log.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_hash: Option<String>,
    pub actor: Actor,
    pub result: AuditResult,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub context: BTreeMap<String, String>,
    pub sequence: u64,
    pub prev_hmac: String,
    pub hmac: String,
}

/// The chain-independent part of an event, supplied by the caller.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub operation: AuditOp,
    pub key_hash: Option<String>,
    pub actor: Actor,
    pub result: AuditResult,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub context: BTreeMap<String, String>,
}

impl EventDraft {
    #[must_use]
    pub fn new(operation: AuditOp, actor: Actor, result: AuditResult) -> Self {
        Self {
            operation,
            key_hash: None,
            actor,
            result,
            error_code: None,
            error_message: None,
            context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_key_hash(mut self, key_hash: String) -> Self {
        self.key_hash = Some(key_hash);
        self
    }

    #[must_use]
    pub fn with_error(mut self, code: &str, message: impl Into<String>) -> Self {
        self.error_code = Some(code.to_owned());
        self.error_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_owned(), value.into());
        self
    }
}

/// Filter for [`AuditLog::search`].
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub operation: Option<AuditOp>,
    pub result: Option<AuditResult>,
    pub source: Option<ActorSource>,
    pub key_hash: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(op) = self.operation {
            if event.operation != op {
                return false;
            }
        }
        if let Some(result) = self.result {
            if event.result != result {
                return false;
            }
        }
        if let Some(source) = self.source {
            if event.actor.source != source {
                return false;
            }
        }
        if let Some(key_hash) = &self.key_hash {
            if event.key_hash.as_ref() != Some(key_hash) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Export serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

/// Result of a chain verification walk.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    /// No tampering detected. A pruned prefix does not invalidate.
    pub valid: bool,
    /// Total events checked.
    pub total_events: u64,
    /// The earliest surviving sequence is greater than 1 — a pruned prefix.
    pub pruned_gap: bool,
    /// Human-readable diagnostics, one per detected break.
    pub issues: Vec<String>,
}

/// Persisted chain head.
#[derive(Debug, Serialize, Deserialize)]
struct ChainMeta {
    sequence: u64,
    prev_hmac: String,
}

struct ChainHead {
    key: SecretKey,
    sequence: u64,
    prev_hmac: String,
}

/// The append-only, HMAC-chained audit log.
pub struct AuditLog {
    dir: PathBuf,
    meta_path: PathBuf,
    head: Mutex<Option<ChainHead>>,
}

impl AuditLog {
    /// Create a handle for the log under `dir`, with the head sidecar at
    /// `meta_path`. No I/O happens until [`set_key`](Self::set_key).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, meta_path: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            meta_path: meta_path.into(),
            head: Mutex::new(None),
        }
    }

    /// Arm the chain with the audit subkey, loading the persisted head so
    /// this process continues where the previous one stopped.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] or [`AuditError::Serialization`] if the
    /// head sidecar exists but cannot be read.
    pub async fn set_key(&self, key: SecretKey) -> Result<(), AuditError> {
        let meta = match tokio::fs::read(&self.meta_path).await {
            Ok(bytes) => {
                serde_json::from_slice::<ChainMeta>(&bytes).map_err(|e| {
                    AuditError::Serialization {
                        reason: format!("audit.meta: {e}"),
                    }
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ChainMeta {
                sequence: 0,
                prev_hmac: GENESIS.to_owned(),
            },
            Err(e) => {
                return Err(AuditError::Io {
                    path: self.meta_path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let mut guard = self.head.lock().await;
        *guard = Some(ChainHead {
            key,
            sequence: meta.sequence,
            prev_hmac: meta.prev_hmac,
        });
        Ok(())
    }

    /// Drop the chain key (vault locked). The key is zeroized on drop.
    pub async fn clear_key(&self) {
        let mut guard = self.head.lock().await;
        *guard = None;
    }

    /// Append one event to the chain. This is the hot path.
    ///
    /// # Errors
    ///
    /// - [`AuditError::KeyUnset`] if the vault is locked.
    /// - [`AuditError::DiskFull`] if less than 1 MiB is free.
    /// - [`AuditError::Io`] / [`AuditError::Serialization`] on write
    ///   failures.
    pub async fn append(&self, draft: EventDraft) -> Result<AuditEvent, AuditError> {
        self.append_at(draft, Utc::now()).await
    }

    async fn append_at(
        &self,
        draft: EventDraft,
        timestamp: DateTime<Utc>,
    ) -> Result<AuditEvent, AuditError> {
        let mut guard = self.head.lock().await;
        let head = guard.as_mut().ok_or(AuditError::KeyUnset)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AuditError::Io {
                path: self.dir.display().to_string(),
                reason: e.to_string(),
            })?;

        match fs2::available_space(&self.dir) {
            Ok(available) if available < MIN_FREE_DISK_BYTES => {
                return Err(AuditError::DiskFull { available });
            }
            Ok(_) => {}
            // The query is unsupported here — proceed without checking.
            Err(e) => debug!(error = %e, "free-space query unavailable"),
        }

        let sequence = head.sequence + 1;
        let mut event = AuditEvent {
            version: AUDIT_SCHEMA_VERSION,
            id: Uuid::now_v7(),
            timestamp,
            operation: draft.operation,
            key_hash: draft.key_hash,
            actor: draft.actor,
            result: draft.result,
            error_code: draft.error_code,
            error_message: draft.error_message,
            context: draft.context,
            sequence,
            prev_hmac: head.prev_hmac.clone(),
            hmac: String::new(),
        };
        event.hmac = crypto::hmac_sha256_hex(&head.key, &canonical_bytes(&event));

        let mut line = serde_json::to_vec(&event).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let path = self.dir.join(month_file_name(timestamp));
        let existed = path.exists();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AuditError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        file.write_all(&line).await.map_err(|e| AuditError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        file.flush().await.map_err(|e| AuditError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if !existed {
            if let Err(reason) = hardening::set_private_file(&path) {
                warn!(%reason, "could not restrict new audit file");
            }
        }

        self.persist_meta(sequence, &event.hmac).await?;

        head.sequence = sequence;
        head.prev_hmac = event.hmac.clone();
        Ok(event)
    }

    async fn persist_meta(&self, sequence: u64, hmac: &str) -> Result<(), AuditError> {
        let meta = ChainMeta {
            sequence,
            prev_hmac: hmac.to_owned(),
        };
        let bytes = serde_json::to_vec(&meta).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        let tmp = self.meta_path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| AuditError::Io {
                path: tmp.display().to_string(),
                reason: e.to_string(),
            })?;
        if let Err(reason) = hardening::set_private_file(&tmp) {
            warn!(%reason, "could not restrict audit.meta");
        }
        tokio::fs::rename(&tmp, &self.meta_path)
            .await
            .map_err(|e| AuditError::Io {
                path: self.meta_path.display().to_string(),
                reason: e.to_string(),
            })
    }

    /// Events at or after `since`, in chain order, capped at `limit`.
    ///
    /// Malformed lines are skipped with a warning — [`verify`](Self::verify)
    /// is the tamper-detection path.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the log directory cannot be read.
    pub async fn list(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        let filter = AuditFilter {
            since,
            limit: Some(limit),
            ..AuditFilter::default()
        };
        self.search(&filter).await
    }

    /// Events matching the filter, in chain order.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the log directory cannot be read.
    pub async fn search(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let mut events = Vec::new();
        for (file, lines) in self.read_files().await? {
            for line in lines {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEvent>(&line) {
                    Ok(event) => {
                        if filter.matches(&event) {
                            events.push(event);
                        }
                    }
                    Err(e) => warn!(file = %file, error = %e, "skipping malformed audit line"),
                }
                if filter.limit.is_some_and(|limit| events.len() >= limit) {
                    return Ok(events);
                }
            }
        }
        Ok(events)
    }

    /// Walk the whole chain and check every invariant: sequence continuity,
    /// `prev_hmac` linkage, and each event's recomputed HMAC. Verification
    /// continues past breaks so one pass reports them all.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::KeyUnset`] if the vault is locked, or
    /// [`AuditError::Io`] if the log directory cannot be read.
    pub async fn verify(&self) -> Result<VerifyReport, AuditError> {
        let key = {
            let guard = self.head.lock().await;
            guard.as_ref().ok_or(AuditError::KeyUnset)?.key.clone()
        };
        self.verify_with_key(&key).await
    }

    /// [`verify`](Self::verify) under an explicitly supplied key — the
    /// offline path, usable without unlocking state.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the log directory cannot be read.
    pub async fn verify_with_key(&self, key: &SecretKey) -> Result<VerifyReport, AuditError> {
        let mut report = VerifyReport {
            valid: true,
            ..VerifyReport::default()
        };
        let mut expected_seq: Option<u64> = None;
        let mut prev_hmac: Option<String> = None;

        for (file, mut lines) in self.read_files().await? {
            // Trailing empty lines are tolerated; blank lines elsewhere are
            // not valid JSONL.
            while lines.last().is_some_and(String::is_empty) {
                lines.pop();
            }

            for (idx, line) in lines.iter().enumerate() {
                let lineno = idx + 1;
                if line.is_empty() {
                    report
                        .issues
                        .push(format!("{file}:{lineno}: unexpected blank line"));
                    continue;
                }
                let event: AuditEvent = match serde_json::from_str(line) {
                    Ok(event) => event,
                    Err(e) => {
                        report.issues.push(format!(
                            "{file}:{lineno}: malformed line (truncated write or tampering): {e}"
                        ));
                        continue;
                    }
                };
                report.total_events += 1;

                match expected_seq {
                    None => {
                        if event.sequence > 1 {
                            report.pruned_gap = true;
                        } else if event.prev_hmac != GENESIS {
                            report.issues.push(format!(
                                "{file}:{lineno}: sequence 1 prev_hmac is not '{GENESIS}'"
                            ));
                        }
                    }
                    Some(expected) => {
                        if event.sequence != expected {
                            report.issues.push(format!(
                                "{file}:{lineno}: sequence gap: expected {expected}, found {}",
                                event.sequence
                            ));
                        }
                        if let Some(prev) = &prev_hmac {
                            if event.prev_hmac != *prev {
                                report.issues.push(format!(
                                    "{file}:{lineno}: prev_hmac mismatch at sequence {}",
                                    event.sequence
                                ));
                            }
                        }
                    }
                }

                let computed = crypto::hmac_sha256_hex(key, &canonical_bytes(&event));
                let hmac_ok: bool = computed
                    .as_bytes()
                    .ct_eq(event.hmac.as_bytes())
                    .into();
                if !hmac_ok {
                    report.issues.push(format!(
                        "{file}:{lineno}: HMAC mismatch at sequence {} (event modified or wrong key)",
                        event.sequence
                    ));
                }

                expected_seq = Some(event.sequence + 1);
                prev_hmac = Some(event.hmac);
            }
        }

        report.valid = report.issues.is_empty();
        Ok(report)
    }

    /// Serialize events in `[since, until]` as pretty JSON or CSV.
    ///
    /// CSV carries four columns (timestamp, operation, result, truncated
    /// hashed key); fields are quoted against separator and formula
    /// injection.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] or [`AuditError::Serialization`].
    pub async fn export(
        &self,
        format: ExportFormat,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<u8>, AuditError> {
        let filter = AuditFilter {
            since,
            until,
            ..AuditFilter::default()
        };
        let events = self.search(&filter).await?;

        match format {
            ExportFormat::Json => {
                serde_json::to_vec_pretty(&events).map_err(|e| AuditError::Serialization {
                    reason: e.to_string(),
                })
            }
            ExportFormat::Csv => {
                let mut out = String::from("timestamp,operation,result,key_hash\n");
                for event in &events {
                    let key_hash = event
                        .key_hash
                        .as_deref()
                        .map(|h| h.chars().take(CSV_KEY_HASH_LEN).collect::<String>())
                        .unwrap_or_default();
                    let row = [
                        event
                            .timestamp
                            .to_rfc3339_opts(SecondsFormat::Nanos, true),
                        event.operation.as_str().to_owned(),
                        event.result.as_str().to_owned(),
                        key_hash,
                    ];
                    let quoted: Vec<String> = row.iter().map(|f| csv_quote(f)).collect();
                    out.push_str(&quoted.join(","));
                    out.push('\n');
                }
                Ok(out.into_bytes())
            }
        }
    }

    /// Delete whole events older than `older_than`, returning how many were
    /// (or would be) removed. A file entirely in the past is deleted; a
    /// file straddling the cutoff is rewritten atomically with only the
    /// survivors. The chain is **not** re-linked across the gap.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] on filesystem failures or
    /// [`AuditError::Serialization`] if a line cannot be decoded (pruning
    /// refuses to guess on a damaged log).
    pub async fn prune(&self, older_than: DateTime<Utc>, dry_run: bool) -> Result<u64, AuditError> {
        // Hold the head mutex so appends cannot interleave with rewrites.
        let _guard = self.head.lock().await;

        let mut removed_total: u64 = 0;
        for (file, lines) in self.read_files().await? {
            let path = self.dir.join(&file);
            let mut removed_here: u64 = 0;
            let mut survivors = Vec::new();
            for line in &lines {
                if line.is_empty() {
                    continue;
                }
                let event: AuditEvent =
                    serde_json::from_str(line).map_err(|e| AuditError::Serialization {
                        reason: format!("{file}: cannot prune malformed line: {e}"),
                    })?;
                if event.timestamp < older_than {
                    removed_here += 1;
                } else {
                    survivors.push(line.clone());
                }
            }

            if removed_here == 0 {
                continue;
            }
            removed_total += removed_here;
            if dry_run {
                continue;
            }

            if survivors.is_empty() {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| AuditError::Io {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                debug!(file = %file, removed = removed_here, "pruned whole audit file");
            } else {
                let mut content = survivors.join("\n");
                content.push('\n');
                let tmp = path.with_extension("tmp");
                tokio::fs::write(&tmp, content.as_bytes())
                    .await
                    .map_err(|e| AuditError::Io {
                        path: tmp.display().to_string(),
                        reason: e.to_string(),
                    })?;
                if let Err(reason) = hardening::set_private_file(&tmp) {
                    warn!(%reason, "could not restrict rewritten audit file");
                }
                tokio::fs::rename(&tmp, &path)
                    .await
                    .map_err(|e| AuditError::Io {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                debug!(file = %file, removed = removed_here, "pruned audit file head");
            }
        }
        Ok(removed_total)
    }

    /// Monthly files in lexicographic (= chronological) order, each split
    /// into lines.
    async fn read_files(&self) -> Result<Vec<(String, Vec<String>)>, AuditError> {
        let mut names = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AuditError::Io {
                    path: self.dir.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };
        while let Some(entry) = dir.next_entry().await.map_err(|e| AuditError::Io {
            path: self.dir.display().to_string(),
            reason: e.to_string(),
        })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".jsonl") {
                names.push(name);
            }
        }
        names.sort();

        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let path = self.dir.join(&name);
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| AuditError::Io {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            let lines: Vec<String> = content.split('\n').map(str::to_owned).collect();
            files.push((name, lines));
        }
        Ok(files)
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// Log file name for the month containing `timestamp`.
fn month_file_name(timestamp: DateTime<Utc>) -> String {
    format!("{}.jsonl", timestamp.format("%Y-%m"))
}

/// The canonical byte serialization covered by an event's HMAC: every
/// significant field, in fixed order, newline-separated; the context map
/// is sorted by key. The `hmac` field itself is excluded.
fn canonical_bytes(event: &AuditEvent) -> Vec<u8> {
    let context: String = event
        .context
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    let fields = [
        event.version.to_string(),
        event.id.to_string(),
        event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        event.operation.as_str().to_owned(),
        event.key_hash.clone().unwrap_or_default(),
        event.actor.source.as_str().to_owned(),
        event.actor.session_id.clone(),
        event.result.as_str().to_owned(),
        event.error_code.clone().unwrap_or_default(),
        event.error_message.clone().unwrap_or_default(),
        context,
        event.sequence.to_string(),
        event.prev_hmac.clone(),
    ];
    fields.join("\n").into_bytes()
}

/// Quote a CSV field if it contains a separator/quote/newline or begins
/// with a spreadsheet formula trigger (`=`, `+`, `-`, `@`).
fn csv_quote(field: &str) -> String {
    let needs_quoting = field.contains([',', '"', '\n', '\r'])
        || field.starts_with(['=', '+', '-', '@']);
    if needs_quoting {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}
