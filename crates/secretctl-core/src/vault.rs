//! The vault: lifecycle, CRUD, and the policy-gated `run` entry points.
//!
//! Everything a caller can do goes through [`Vault`]. The password unlocks
//! the master key, the master key splits into subkeys (record encryption,
//! audit chain, key-name hashing), and every operation — successful or not
//! — emits one audit event.
//!
//! # Caller trust
//!
//! The CLI, GUI, and RPC surfaces share this API but differ in privilege.
//! Rather than duplicating entry points, every operation takes an
//! [`OpContext`] carrying a [`CallerTrust`]: the interactive path (the
//! human holds the password) reads sensitive fields in plaintext and binds
//! a permissive executor policy; the machine path gets masked values, the
//! sensitive-field barrier, and the on-disk policy file (absent = deny).
//!
//! # Locking
//!
//! `store.lock` carries an OS advisory exclusive lock held from unlock to
//! lock, so a second process blocks until the first releases the vault.
//! Within a process, mutators serialize on one mutex; a mutation whose
//! audit event cannot be written is rolled back so no state change exists
//! without a chain entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use secretctl_storage::{FieldRow, ListQuery, RecordMeta, RecordRow, RecordStore, SqliteStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::audit::{
    Actor, ActorSource, AuditEvent, AuditFilter, AuditLog, AuditOp, AuditResult, EventDraft,
    ExportFormat, VerifyReport,
};
use crate::crypto::{self, SALT_LEN, SecretKey};
use crate::error::{CryptoError, VaultError};
use crate::exec::{self, DEFAULT_TIMEOUT, EnvVar, Executor, MAX_TIMEOUT, RunOutput};
use crate::hardening;
use crate::policy::{self, Decision, ExecPolicy, POLICY_FILE_NAME};
use crate::record::{Field, InputType, ListFilter, SecretRecord};
use crate::sanitize::Sanitizer;

const SALT_FILE: &str = "salt";
const META_FILE: &str = "meta";
const DB_FILE: &str = "store.db";
const LOCK_FILE: &str = "store.lock";
const AUDIT_DIR: &str = "audit";
const AUDIT_META_FILE: &str = "audit.meta";
const LOCKOUT_FILE: &str = "lockout";

/// On-disk vault format version recorded in `meta`.
pub const FORMAT_VERSION: u32 = 1;

/// Known plaintext encrypted into `meta` at init; a successful decryption
/// on unlock proves the derived key before any record is touched.
const CANARY_MARKER: &[u8] = b"secretctl-canary-v1";

/// Privilege level of the calling surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerTrust {
    /// CLI/GUI — the human at the keyboard holds the master password.
    Interactive,
    /// RPC/MCP — an AI agent or other machine caller; sensitive values
    /// never leave the core in plaintext on this path.
    Machine,
}

/// Per-call context: trust level plus audit attribution.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub trust: CallerTrust,
    pub source: ActorSource,
    pub session_id: String,
}

impl OpContext {
    #[must_use]
    pub fn new(trust: CallerTrust, source: ActorSource, session_id: impl Into<String>) -> Self {
        Self {
            trust,
            source,
            session_id: session_id.into(),
        }
    }

    /// The interactive CLI context.
    #[must_use]
    pub fn interactive(session_id: impl Into<String>) -> Self {
        Self::new(CallerTrust::Interactive, ActorSource::Cli, session_id)
    }

    /// The machine (MCP/RPC) context.
    #[must_use]
    pub fn machine(session_id: impl Into<String>) -> Self {
        Self::new(CallerTrust::Machine, ActorSource::Mcp, session_id)
    }

    fn actor(&self) -> Actor {
        Actor {
            source: self.source,
            session_id: self.session_id.clone(),
        }
    }
}

/// A `run` request: which secrets, which command, how long.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Exact keys or glob patterns to resolve.
    pub keys: Vec<String>,
    pub command: String,
    pub args: Vec<String>,
    /// Defaults to five minutes; capped at one hour.
    pub timeout: Option<Duration>,
    /// Prepended literally to derived env names.
    pub env_prefix: Option<String>,
    /// Named alias set from the policy file rewriting resolved keys.
    pub env_alias: Option<String>,
}

impl RunRequest {
    #[must_use]
    pub fn new(keys: Vec<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            keys,
            command: command.into(),
            args,
            timeout: None,
            env_prefix: None,
            env_alias: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Argon2Meta {
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultMeta {
    version: u32,
    argon2: Argon2Meta,
    created_at: DateTime<Utc>,
    /// Base64 of the encrypted canary marker.
    canary: String,
}

/// Persisted unlock-failure state. Wall-clock based so a restart does not
/// bypass the cooldown.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LockoutState {
    failures: u32,
    locked_until: Option<DateTime<Utc>>,
}

/// Cooldown ladder: 5 failures → 30 s, 10 → 5 min, 20 → 30 min.
fn cooldown_for(failures: u32) -> Option<chrono::Duration> {
    match failures {
        f if f >= 20 => Some(chrono::Duration::minutes(30)),
        f if f >= 10 => Some(chrono::Duration::minutes(5)),
        f if f >= 5 => Some(chrono::Duration::seconds(30)),
        _ => None,
    }
}

struct Unlocked {
    record_key: SecretKey,
    key_name_key: SecretKey,
    store: Arc<SqliteStore>,
    /// Holds the advisory exclusive lock until `lock()`.
    lock_file: std::fs::File,
}

/// The vault core shared by the CLI, GUI, and RPC surfaces.
pub struct Vault {
    dir: PathBuf,
    audit: AuditLog,
    executor: Executor,
    state: RwLock<Option<Unlocked>>,
    /// Serializes mutators and lifecycle transitions.
    write_lock: Mutex<()>,
}

impl Vault {
    /// A handle on the vault directory, in the locked state. No I/O.
    #[must_use]
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let audit = AuditLog::new(dir.join(AUDIT_DIR), dir.join(AUDIT_META_FILE));
        Self {
            dir,
            audit,
            executor: Executor::new(),
            state: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// The vault directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the vault is currently unlocked in this process.
    pub async fn is_unlocked(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Create a new vault: salt, canary, empty store, audit genesis event.
    /// The returned vault is locked.
    ///
    /// # Errors
    ///
    /// - [`VaultError::AlreadyExists`] if a vault already lives at `dir`.
    /// - [`VaultError::IOError`] on filesystem failures.
    pub async fn init(
        dir: impl Into<PathBuf>,
        password: &str,
        ctx: &OpContext,
    ) -> Result<Self, VaultError> {
        let dir: PathBuf = dir.into();
        if dir.join(META_FILE).exists() {
            return Err(VaultError::AlreadyExists {
                key: dir.display().to_string(),
            });
        }

        tokio::fs::create_dir_all(&dir).await?;
        fs_err(hardening::set_private_dir(&dir))?;

        let salt = crypto::generate_salt();
        tokio::fs::write(dir.join(SALT_FILE), salt).await?;
        fs_err(hardening::set_private_file(&dir.join(SALT_FILE)))?;

        let master = derive_master_blocking(password, salt).await?;

        let canary = crypto::encrypt(&master, CANARY_MARKER).map_err(crypto_internal)?;
        let meta = VaultMeta {
            version: FORMAT_VERSION,
            argon2: Argon2Meta {
                memory_kib: crypto::ARGON2_MEMORY_KIB,
                iterations: crypto::ARGON2_ITERATIONS,
                parallelism: crypto::ARGON2_PARALLELISM,
            },
            created_at: Utc::now(),
            canary: BASE64.encode(&canary),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta).map_err(|e| VaultError::IOError {
            reason: e.to_string(),
        })?;
        tokio::fs::write(dir.join(META_FILE), meta_bytes).await?;
        fs_err(hardening::set_private_file(&dir.join(META_FILE)))?;

        // Empty schema, so the first unlock starts from a valid store.
        let store = SqliteStore::open(dir.join(DB_FILE)).await.map_err(VaultError::from)?;
        store.close().await;
        fs_err(hardening::set_private_file(&dir.join(DB_FILE)))?;

        std::fs::File::create(dir.join(LOCK_FILE))?;
        fs_err(hardening::set_private_file(&dir.join(LOCK_FILE)))?;

        tokio::fs::create_dir_all(dir.join(AUDIT_DIR)).await?;
        fs_err(hardening::set_private_dir(&dir.join(AUDIT_DIR)))?;

        let vault = Self::open(dir);
        vault.write_lockout(&LockoutState::default()).await?;

        // The chain starts with the init event itself.
        let audit_key = crypto::derive_sub(&master, crypto::INFO_AUDIT).map_err(crypto_internal)?;
        vault.audit.set_key(audit_key).await?;
        vault
            .audit
            .append(EventDraft::new(AuditOp::VaultInit, ctx.actor(), AuditResult::Success))
            .await?;
        vault.audit.clear_key().await;

        info!(dir = %vault.dir.display(), "vault initialized");
        Ok(vault)
    }

    /// Unlock the vault: derive the master key, prove it against the
    /// canary, grab the exclusive file lock, open the store, arm the audit
    /// chain.
    ///
    /// A failed attempt increments the persisted failure counter; repeated
    /// failures trigger a wall-clock cooldown enforced regardless of
    /// password correctness.
    ///
    /// # Errors
    ///
    /// - [`VaultError::VaultAlreadyUnlocked`] if already unlocked here.
    /// - [`VaultError::UnlockCooldown`] while a cooldown is active.
    /// - [`VaultError::AuthFailure`] for a wrong password.
    /// - [`VaultError::VersionMismatch`] for an unsupported format.
    /// - [`VaultError::CorruptedVault`] for loose permissions or damaged
    ///   metadata.
    pub async fn unlock(&self, password: &str, ctx: &OpContext) -> Result<(), VaultError> {
        let _lifecycle = self.write_lock.lock().await;
        if self.state.read().await.is_some() {
            return Err(VaultError::VaultAlreadyUnlocked);
        }

        if let Err(reason) = hardening::disable_core_dumps() {
            warn!(%reason, "could not disable core dumps");
        }
        if let Err(reason) = hardening::lock_memory() {
            debug!(%reason, "could not mlock process memory");
        }

        let mut lockout = self.read_lockout().await;
        let now = Utc::now();
        if let Some(until) = lockout.locked_until {
            if until > now {
                let remaining = (until - now).num_seconds().max(1);
                return Err(VaultError::UnlockCooldown {
                    remaining_secs: remaining.unsigned_abs(),
                });
            }
        }

        let meta = self.read_meta().await?;
        self.check_permissions()?;

        let salt = self.read_salt().await?;
        let master = derive_master_blocking(password, salt).await?;

        let canary = BASE64
            .decode(&meta.canary)
            .map_err(|e| VaultError::CorruptedVault {
                detail: format!("canary is not valid base64: {e}"),
            })?;
        match crypto::decrypt(&master, &canary) {
            Ok(plain) if plain.as_slice() == CANARY_MARKER => {}
            Ok(_) => {
                return Err(VaultError::CorruptedVault {
                    detail: "canary marker mismatch".to_owned(),
                });
            }
            Err(_) => {
                lockout.failures += 1;
                if let Some(cooldown) = cooldown_for(lockout.failures) {
                    lockout.locked_until = Some(now + cooldown);
                }
                self.write_lockout(&lockout).await?;
                warn!(failures = lockout.failures, "unlock failed");
                return Err(VaultError::AuthFailure);
            }
        }

        self.write_lockout(&LockoutState::default()).await?;

        let record_key = crypto::derive_sub(&master, crypto::INFO_RECORD).map_err(crypto_internal)?;
        let audit_key = crypto::derive_sub(&master, crypto::INFO_AUDIT).map_err(crypto_internal)?;
        let key_name_key =
            crypto::derive_sub(&master, crypto::INFO_KEY_NAME).map_err(crypto_internal)?;

        // Blocks until any other process releases the vault.
        let lock_file = acquire_store_lock(self.dir.join(LOCK_FILE)).await?;

        let store = Arc::new(SqliteStore::open(self.dir.join(DB_FILE)).await.map_err(VaultError::from)?);

        self.audit.set_key(audit_key).await?;
        self.emit(EventDraft::new(AuditOp::VaultUnlock, ctx.actor(), AuditResult::Success))
            .await;

        let mut state = self.state.write().await;
        *state = Some(Unlocked {
            record_key,
            key_name_key,
            store,
            lock_file,
        });
        info!(dir = %self.dir.display(), "vault unlocked");
        Ok(())
    }

    /// Lock the vault: log the transition, close the store, release the
    /// file lock, zeroize every key.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::VaultLocked`] if the vault is not unlocked.
    pub async fn lock(&self, ctx: &OpContext) -> Result<(), VaultError> {
        let _lifecycle = self.write_lock.lock().await;
        let unlocked = {
            let mut state = self.state.write().await;
            state.take().ok_or(VaultError::VaultLocked)?
        };

        // Log while the chain key is still armed.
        self.emit(EventDraft::new(AuditOp::VaultLock, ctx.actor(), AuditResult::Success))
            .await;
        self.audit.clear_key().await;

        unlocked.store.close().await;
        if let Err(e) = FileExt::unlock(&unlocked.lock_file) {
            warn!(error = %e, "could not release store lock");
        }
        drop(unlocked); // keys zeroized here

        info!(dir = %self.dir.display(), "vault locked");
        Ok(())
    }

    /// Insert or replace a record. Existing fields are replaced atomically;
    /// `created_at` survives replacement and `updated_at` advances.
    ///
    /// # Errors
    ///
    /// - [`VaultError::VaultLocked`] / [`VaultError::ValidationError`].
    /// - [`VaultError::IOError`] if the store or the audit write fails —
    ///   an unauditable mutation is rolled back.
    pub async fn set(&self, ctx: &OpContext, mut record: SecretRecord) -> Result<(), VaultError> {
        let _mutator = self.write_lock.lock().await;
        let guard = self.state.read().await;
        let unlocked = guard.as_ref().ok_or(VaultError::VaultLocked)?;
        let key_hash = self.key_hash(unlocked, &record.key);

        let result = self.set_inner(unlocked, &mut record).await;
        match &result {
            Ok(replaced) => {
                let draft = EventDraft::new(AuditOp::SecretSet, ctx.actor(), AuditResult::Success)
                    .with_key_hash(key_hash)
                    .with_context("replaced", replaced.is_some().to_string());
                if let Err(audit_err) = self.audit.append(draft).await {
                    self.rollback_set(unlocked, &record, replaced.as_ref()).await;
                    return Err(audit_err.into());
                }
            }
            Err(e) => self.emit_error(ctx, AuditOp::SecretSet, Some(key_hash), e).await,
        }
        result.map(|_| ())
    }

    /// Apply the mutation; returns the pre-image for rollback (`Some` when
    /// an existing record was replaced).
    async fn set_inner(
        &self,
        unlocked: &Unlocked,
        record: &mut SecretRecord,
    ) -> Result<Option<(RecordRow, Vec<FieldRow>)>, VaultError> {
        record
            .validate()
            .map_err(|detail| VaultError::ValidationError { detail })?;

        let existing = unlocked.store.fetch(&record.key).await?;
        let now = Utc::now();
        record.created_at = existing.as_ref().map_or(now, |(row, _)| row.created_at);
        record.updated_at = now.max(record.created_at);

        let (row, field_rows) = encode_record(&unlocked.record_key, record)?;
        unlocked.store.upsert(&row, &field_rows).await?;
        Ok(existing)
    }

    async fn rollback_set(
        &self,
        unlocked: &Unlocked,
        record: &SecretRecord,
        pre_image: Option<&(RecordRow, Vec<FieldRow>)>,
    ) {
        let outcome = match pre_image {
            Some((row, fields)) => unlocked.store.upsert(row, fields).await.map(|_| ()),
            None => unlocked.store.delete(&record.key).await.map(|_| ()),
        };
        if let Err(e) = outcome {
            warn!(key = %record.key, error = %e, "rollback after failed audit write also failed");
        } else {
            warn!(key = %record.key, "mutation rolled back: audit event could not be written");
        }
    }

    /// Fetch a full record. On the machine path, sensitive values come
    /// back masked; the interactive path gets plaintext.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if the key does not exist.
    /// - [`VaultError::CorruptedVault`] if a field fails authentication —
    ///   other records remain accessible.
    pub async fn get(&self, ctx: &OpContext, key: &str) -> Result<SecretRecord, VaultError> {
        let guard = self.state.read().await;
        let unlocked = guard.as_ref().ok_or(VaultError::VaultLocked)?;
        let key_hash = self.key_hash(unlocked, key);

        let result = self.get_inner(unlocked, ctx, key).await;
        self.emit_outcome(ctx, AuditOp::SecretGet, Some(key_hash), &result).await;
        result
    }

    async fn get_inner(
        &self,
        unlocked: &Unlocked,
        ctx: &OpContext,
        key: &str,
    ) -> Result<SecretRecord, VaultError> {
        let (row, field_rows) = unlocked.store.fetch(key).await?.ok_or_else(|| {
            VaultError::NotFound {
                key: key.to_owned(),
                field: None,
            }
        })?;
        let mut record = decode_record(&unlocked.record_key, row, field_rows)?;

        if ctx.trust == CallerTrust::Machine {
            for (_, field) in &mut record.fields {
                if field.sensitive {
                    let masked = field.masked();
                    field.value = Zeroizing::new(masked.into_bytes());
                }
            }
        }
        Ok(record)
    }

    /// Fetch and decrypt a single field.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] for a missing key or field.
    /// - [`VaultError::SensitiveFieldAccessDenied`] when a machine caller
    ///   asks for a sensitive field in plaintext.
    pub async fn get_field(
        &self,
        ctx: &OpContext,
        key: &str,
        field: &str,
    ) -> Result<Field, VaultError> {
        let guard = self.state.read().await;
        let unlocked = guard.as_ref().ok_or(VaultError::VaultLocked)?;
        let key_hash = self.key_hash(unlocked, key);

        let result = self.get_field_inner(unlocked, ctx, key, field).await;
        match &result {
            Err(VaultError::SensitiveFieldAccessDenied { .. }) => {
                self.emit(
                    EventDraft::new(AuditOp::SecretGet, ctx.actor(), AuditResult::Denied)
                        .with_key_hash(key_hash)
                        .with_context("field", field),
                )
                .await;
            }
            _ => {
                self.emit_outcome(ctx, AuditOp::SecretGet, Some(key_hash), &result)
                    .await;
            }
        }
        result
    }

    async fn get_field_inner(
        &self,
        unlocked: &Unlocked,
        ctx: &OpContext,
        key: &str,
        field: &str,
    ) -> Result<Field, VaultError> {
        let Some(field_row) = unlocked.store.fetch_field(key, field).await? else {
            let field = unlocked
                .store
                .exists(key)
                .await?
                .then(|| field.to_owned());
            return Err(VaultError::NotFound {
                key: key.to_owned(),
                field,
            });
        };

        if field_row.sensitive && ctx.trust == CallerTrust::Machine {
            return Err(VaultError::SensitiveFieldAccessDenied {
                field: field.to_owned(),
            });
        }
        decode_field(&unlocked.record_key, key, &field_row)
    }

    /// List record metadata. No field is ever decrypted on this path.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::VaultLocked`] or [`VaultError::IOError`].
    pub async fn list(
        &self,
        ctx: &OpContext,
        filter: &ListFilter,
    ) -> Result<Vec<RecordMeta>, VaultError> {
        let guard = self.state.read().await;
        let unlocked = guard.as_ref().ok_or(VaultError::VaultLocked)?;

        let query = ListQuery {
            tag: filter.tag.clone(),
            expires_before: filter.expiring_within.map(|within| Utc::now() + within),
        };
        let result = unlocked.store.list(&query).await.map_err(VaultError::from);
        match &result {
            Ok(metas) => {
                self.emit(
                    EventDraft::new(AuditOp::SecretList, ctx.actor(), AuditResult::Success)
                        .with_context("count", metas.len().to_string()),
                )
                .await;
            }
            Err(e) => self.emit_error(ctx, AuditOp::SecretList, None, e).await,
        }
        result
    }

    /// Delete a record and all its fields.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if the key does not exist.
    /// - [`VaultError::IOError`] if the store or audit write fails — an
    ///   unauditable deletion is rolled back.
    pub async fn delete(&self, ctx: &OpContext, key: &str) -> Result<(), VaultError> {
        let _mutator = self.write_lock.lock().await;
        let guard = self.state.read().await;
        let unlocked = guard.as_ref().ok_or(VaultError::VaultLocked)?;
        let key_hash = self.key_hash(unlocked, key);

        let pre_image = match unlocked.store.fetch(key).await.map_err(VaultError::from) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                let err = VaultError::NotFound {
                    key: key.to_owned(),
                    field: None,
                };
                self.emit_error(ctx, AuditOp::SecretDelete, Some(key_hash), &err).await;
                return Err(err);
            }
            Err(e) => {
                self.emit_error(ctx, AuditOp::SecretDelete, Some(key_hash), &e).await;
                return Err(e);
            }
        };

        if let Err(e) = unlocked.store.delete(key).await.map_err(VaultError::from) {
            self.emit_error(ctx, AuditOp::SecretDelete, Some(key_hash), &e).await;
            return Err(e);
        }

        let draft = EventDraft::new(AuditOp::SecretDelete, ctx.actor(), AuditResult::Success)
            .with_key_hash(key_hash);
        if let Err(audit_err) = self.audit.append(draft).await {
            let (row, fields) = &pre_image;
            if let Err(e) = unlocked.store.upsert(row, fields).await {
                warn!(key, error = %e, "rollback after failed audit write also failed");
            } else {
                warn!(key, "deletion rolled back: audit event could not be written");
            }
            return Err(audit_err.into());
        }
        Ok(())
    }

    /// Whether a record exists.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::VaultLocked`] or [`VaultError::IOError`].
    pub async fn exists(&self, ctx: &OpContext, key: &str) -> Result<bool, VaultError> {
        let guard = self.state.read().await;
        let unlocked = guard.as_ref().ok_or(VaultError::VaultLocked)?;
        let key_hash = self.key_hash(unlocked, key);

        let result = unlocked.store.exists(key).await.map_err(VaultError::from);
        self.emit_outcome(ctx, AuditOp::SecretExists, Some(key_hash), &result).await;
        result
    }

    /// Resolve secrets, consult the policy, and run a command with the
    /// secrets injected as environment variables. Output comes back through
    /// the sanitizer.
    ///
    /// # Errors
    ///
    /// - [`VaultError::PolicyDenied`] / [`VaultError::PolicyUnavailable`].
    /// - [`VaultError::NotFound`] if no key resolves.
    /// - [`VaultError::Timeout`] / [`VaultError::ExecutorBusy`] from the
    ///   executor.
    pub async fn run(&self, ctx: &OpContext, request: &RunRequest) -> Result<RunOutput, VaultError> {
        // Everything needed after this block is owned, so the state guard
        // is released before the child runs.
        let (env, mut secrets, key_hash) = {
            let guard = self.state.read().await;
            let unlocked = guard.as_ref().ok_or(VaultError::VaultLocked)?;

            let policy = match self.load_policy(ctx) {
                Ok(policy) => policy,
                Err(policy_err) => {
                    self.emit(
                        EventDraft::new(AuditOp::PolicyError, ctx.actor(), AuditResult::Error)
                            .with_error("PolicyUnavailable", policy_err.to_string()),
                    )
                    .await;
                    return Err(policy_err.into());
                }
            };

            if let Decision::Deny { rule } =
                policy::decide(policy.as_ref(), &request.command, &request.args)
            {
                self.emit(
                    EventDraft::new(AuditOp::SecretRunDenied, ctx.actor(), AuditResult::Denied)
                        .with_context("command", request.command.clone())
                        .with_context("rule", rule),
                )
                .await;
                return Err(VaultError::PolicyDenied {
                    command: request.command.clone(),
                });
            }

            match self.prepare_run(unlocked, request, policy.as_ref()).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.emit_error(ctx, AuditOp::SecretRun, None, &e).await;
                    return Err(e);
                }
            }
        };

        let timeout = request.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let sanitizer = match Sanitizer::new(&secrets) {
            Ok(sanitizer) => sanitizer,
            Err(e) => {
                for (_, value) in &mut secrets {
                    value.zeroize();
                }
                let err = VaultError::from(e);
                self.emit_error(ctx, AuditOp::SecretRun, key_hash, &err).await;
                return Err(err);
            }
        };

        let result = self
            .executor
            .execute(&request.command, &request.args, &env, timeout, &sanitizer)
            .await
            .map_err(VaultError::from);

        // The parent's copies of the injected values are done.
        for (_, value) in &mut secrets {
            value.zeroize();
        }
        drop(env);

        match &result {
            Ok(output) => {
                let mut draft =
                    EventDraft::new(AuditOp::SecretRun, ctx.actor(), AuditResult::Success)
                        .with_context("command", request.command.clone())
                        .with_context("exit_code", output.exit_code.to_string())
                        .with_context("sanitized", output.sanitized.to_string());
                if let Some(hash) = key_hash {
                    draft = draft.with_key_hash(hash);
                }
                self.emit(draft).await;
            }
            Err(e) => self.emit_error(ctx, AuditOp::SecretRun, key_hash, e).await,
        }
        result
    }

    /// [`run`](Self::run) for a single record, honoring its explicit env
    /// bindings (or the legacy single-value layout).
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn run_with_bindings(
        &self,
        ctx: &OpContext,
        key: &str,
        command: impl Into<String>,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<RunOutput, VaultError> {
        let mut request = RunRequest::new(vec![key.to_owned()], command, args);
        request.timeout = timeout;
        self.run(ctx, &request).await
    }

    /// Resolve keys, decrypt values, and assemble the child environment
    /// and sanitizer patterns.
    async fn prepare_run(
        &self,
        unlocked: &Unlocked,
        request: &RunRequest,
        policy: Option<&ExecPolicy>,
    ) -> Result<(Vec<EnvVar>, Vec<(String, Vec<u8>)>, Option<String>), VaultError> {
        if request.timeout.is_some_and(|t| t > MAX_TIMEOUT) {
            return Err(VaultError::ValidationError {
                detail: format!("timeout exceeds the {}s maximum", MAX_TIMEOUT.as_secs()),
            });
        }

        let known = unlocked.store.keys().await?;
        let resolved = exec::resolve_keys(&request.keys, &known).map_err(|e| match e {
            exec::ResolveError::NotFound { key } => VaultError::NotFound { key, field: None },
            exec::ResolveError::NoMatches => VaultError::NotFound {
                key: request.keys.join(","),
                field: None,
            },
        })?;

        let resolved = match &request.env_alias {
            None => resolved,
            Some(alias) => {
                let policy = policy.filter(|p| p.has_alias(alias)).ok_or_else(|| {
                    VaultError::ValidationError {
                        detail: format!("unknown env alias '{alias}'"),
                    }
                })?;
                let mut rewritten = Vec::with_capacity(resolved.len());
                for key in resolved {
                    let target = policy
                        .resolve_alias(alias, &key)
                        .map_or(key, str::to_owned);
                    if !known.contains(&target) {
                        return Err(VaultError::NotFound {
                            key: target,
                            field: None,
                        });
                    }
                    if !rewritten.contains(&target) {
                        rewritten.push(target);
                    }
                }
                rewritten
            }
        };

        let mut env: Vec<EnvVar> = Vec::new();
        let mut secrets: Vec<(String, Vec<u8>)> = Vec::new();
        for key in &resolved {
            let (row, field_rows) = unlocked.store.fetch(key).await?.ok_or_else(|| {
                VaultError::NotFound {
                    key: key.clone(),
                    field: None,
                }
            })?;
            let record = decode_record(&unlocked.record_key, row, field_rows)?;

            for (_, field) in &record.fields {
                if field.sensitive {
                    secrets.push((record.key.clone(), field.value.to_vec()));
                }
            }
            env.extend(build_record_env(&record, request.env_prefix.as_deref())?);
        }

        let key_hash = match resolved.as_slice() {
            [single] => Some(self.key_hash(unlocked, single)),
            _ => None,
        };
        Ok((env, secrets, key_hash))
    }

    // ── Audit surface ────────────────────────────────────────────────

    /// Events at or after `since`, capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::VaultLocked`] or [`VaultError::IOError`].
    pub async fn audit_list(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, VaultError> {
        Ok(self.audit.list(since, limit).await?)
    }

    /// Events matching `filter`; a plaintext `key` is hashed under the
    /// key-name subkey before matching.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::VaultLocked`] or [`VaultError::IOError`].
    pub async fn audit_search(
        &self,
        mut filter: AuditFilter,
        key: Option<&str>,
    ) -> Result<Vec<AuditEvent>, VaultError> {
        if let Some(key) = key {
            let guard = self.state.read().await;
            let unlocked = guard.as_ref().ok_or(VaultError::VaultLocked)?;
            filter.key_hash = Some(self.key_hash(unlocked, key));
        }
        Ok(self.audit.search(&filter).await?)
    }

    /// Walk the full chain and report every break.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::VaultLocked`] or [`VaultError::IOError`].
    pub async fn verify_audit(&self) -> Result<VerifyReport, VaultError> {
        Ok(self.audit.verify().await?)
    }

    /// Export events in `[since, until]` as JSON or CSV.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::VaultLocked`] or [`VaultError::IOError`].
    pub async fn export_audit(
        &self,
        format: ExportFormat,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<u8>, VaultError> {
        Ok(self.audit.export(format, since, until).await?)
    }

    /// Delete events older than the horizon. The pruned range leaves a
    /// visible chain gap by design.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::VaultLocked`] or [`VaultError::IOError`].
    pub async fn prune_audit(
        &self,
        ctx: &OpContext,
        older_than: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<u64, VaultError> {
        let removed = self.audit.prune(older_than, dry_run).await?;
        if !dry_run {
            self.emit(
                EventDraft::new(AuditOp::AuditPrune, ctx.actor(), AuditResult::Success)
                    .with_context("removed", removed.to_string())
                    .with_context("older_than", older_than.to_rfc3339()),
            )
            .await;
        }
        Ok(removed)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn key_hash(&self, unlocked: &Unlocked, key: &str) -> String {
        crypto::hmac_sha256_hex(&unlocked.key_name_key, key.as_bytes())
    }

    fn load_policy(&self, ctx: &OpContext) -> Result<Option<ExecPolicy>, crate::error::PolicyError> {
        match ctx.trust {
            CallerTrust::Interactive => Ok(Some(ExecPolicy::permissive())),
            // Re-read on every call so edits apply without a restart.
            CallerTrust::Machine => policy::load(&self.dir.join(POLICY_FILE_NAME)),
        }
    }

    /// Append an event; failures go to the warning channel. The operation
    /// this event describes has already completed (or safely failed), so a
    /// log failure must not turn a read into an error.
    async fn emit(&self, draft: EventDraft) {
        if let Err(e) = self.audit.append(draft).await {
            warn!(error = %e, "audit write failed");
        }
    }

    async fn emit_outcome<T>(
        &self,
        ctx: &OpContext,
        op: AuditOp,
        key_hash: Option<String>,
        result: &Result<T, VaultError>,
    ) {
        match result {
            Ok(_) => {
                let mut draft = EventDraft::new(op, ctx.actor(), AuditResult::Success);
                if let Some(hash) = key_hash {
                    draft = draft.with_key_hash(hash);
                }
                self.emit(draft).await;
            }
            Err(e) => self.emit_error(ctx, op, key_hash, e).await,
        }
    }

    async fn emit_error(
        &self,
        ctx: &OpContext,
        op: AuditOp,
        key_hash: Option<String>,
        err: &VaultError,
    ) {
        let mut draft = EventDraft::new(op, ctx.actor(), AuditResult::Error)
            .with_error(err.code(), err.to_string());
        if let Some(hash) = key_hash {
            draft = draft.with_key_hash(hash);
        }
        self.emit(draft).await;
    }

    async fn read_meta(&self) -> Result<VaultMeta, VaultError> {
        let bytes = tokio::fs::read(self.dir.join(META_FILE)).await.map_err(|e| {
            VaultError::CorruptedVault {
                detail: format!("cannot read meta: {e}"),
            }
        })?;
        let meta: VaultMeta =
            serde_json::from_slice(&bytes).map_err(|e| VaultError::CorruptedVault {
                detail: format!("meta is not valid JSON: {e}"),
            })?;
        if meta.version != FORMAT_VERSION {
            return Err(VaultError::VersionMismatch {
                found: meta.version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(meta)
    }

    async fn read_salt(&self) -> Result<[u8; SALT_LEN], VaultError> {
        let bytes = tokio::fs::read(self.dir.join(SALT_FILE)).await.map_err(|e| {
            VaultError::CorruptedVault {
                detail: format!("cannot read salt: {e}"),
            }
        })?;
        <[u8; SALT_LEN]>::try_from(bytes.as_slice()).map_err(|_| VaultError::CorruptedVault {
            detail: format!("salt must be {SALT_LEN} bytes, found {}", bytes.len()),
        })
    }

    async fn read_lockout(&self) -> LockoutState {
        match tokio::fs::read(self.dir.join(LOCKOUT_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "lockout state unreadable, resetting");
                LockoutState::default()
            }),
            Err(_) => LockoutState::default(),
        }
    }

    async fn write_lockout(&self, state: &LockoutState) -> Result<(), VaultError> {
        let bytes = serde_json::to_vec(state).map_err(|e| VaultError::IOError {
            reason: e.to_string(),
        })?;
        let path = self.dir.join(LOCKOUT_FILE);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        fs_err(hardening::set_private_file(&tmp))?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Loose permissions on key-bearing files are an integrity failure.
    fn check_permissions(&self) -> Result<(), VaultError> {
        let corrupted = |detail: String| VaultError::CorruptedVault { detail };
        hardening::check_private_dir(&self.dir).map_err(corrupted)?;
        hardening::check_private_file(&self.dir.join(SALT_FILE)).map_err(corrupted)?;
        hardening::check_private_file(&self.dir.join(META_FILE)).map_err(corrupted)?;
        let db = self.dir.join(DB_FILE);
        if db.exists() {
            hardening::check_private_file(&db).map_err(corrupted)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// Hardening helpers report plain strings; filesystem setup maps them to
/// `IOError`.
fn fs_err(result: Result<(), String>) -> Result<(), VaultError> {
    result.map_err(|reason| VaultError::IOError { reason })
}

fn crypto_internal(err: CryptoError) -> VaultError {
    match err {
        CryptoError::AuthFailure => VaultError::AuthFailure,
        other => VaultError::IOError {
            reason: other.to_string(),
        },
    }
}

/// Argon2 is deliberately expensive; keep it off the async workers.
async fn derive_master_blocking(
    password: &str,
    salt: [u8; SALT_LEN],
) -> Result<SecretKey, VaultError> {
    let password = Zeroizing::new(password.as_bytes().to_vec());
    tokio::task::spawn_blocking(move || crypto::derive_master(&password, &salt))
        .await
        .map_err(|e| VaultError::IOError {
            reason: format!("key derivation task failed: {e}"),
        })?
        .map_err(crypto_internal)
}

/// Take the advisory exclusive lock, blocking until any other process
/// releases it.
async fn acquire_store_lock(path: PathBuf) -> Result<std::fs::File, VaultError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(file)
    })
    .await
    .map_err(|e| VaultError::IOError {
        reason: format!("lock task failed: {e}"),
    })?
    .map_err(VaultError::from)
}

/// Encrypt a record's fields into storage rows.
fn encode_record(
    record_key: &SecretKey,
    record: &SecretRecord,
) -> Result<(RecordRow, Vec<FieldRow>), VaultError> {
    let mut field_rows = Vec::with_capacity(record.fields.len());
    for (position, (name, field)) in record.fields.iter().enumerate() {
        let value_enc = crypto::encrypt(record_key, &field.value).map_err(crypto_internal)?;
        field_rows.push(FieldRow {
            name: name.clone(),
            position: u32::try_from(position).map_err(|_| VaultError::ValidationError {
                detail: "too many fields".to_owned(),
            })?,
            sensitive: field.sensitive,
            input_type: field.input_type.as_str().to_owned(),
            hint: field.hint.clone(),
            value_enc,
        });
    }
    let row = RecordRow {
        key: record.key.clone(),
        tags: record.tags.clone(),
        bindings: record.bindings.clone(),
        notes: record.notes.clone(),
        url: record.url.clone(),
        expires_at: record.expires_at,
        created_at: record.created_at,
        updated_at: record.updated_at,
    };
    Ok((row, field_rows))
}

/// Decrypt storage rows back into a record. An authentication failure on
/// any field surfaces as `CorruptedVault` naming the key — without
/// poisoning the rest of the store.
fn decode_record(
    record_key: &SecretKey,
    row: RecordRow,
    field_rows: Vec<FieldRow>,
) -> Result<SecretRecord, VaultError> {
    let mut fields = Vec::with_capacity(field_rows.len());
    for field_row in &field_rows {
        let field = decode_field(record_key, &row.key, field_row)?;
        fields.push((field_row.name.clone(), field));
    }
    Ok(SecretRecord {
        key: row.key,
        fields,
        bindings: row.bindings,
        tags: row.tags,
        notes: row.notes,
        url: row.url,
        expires_at: row.expires_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn decode_field(
    record_key: &SecretKey,
    key: &str,
    field_row: &FieldRow,
) -> Result<Field, VaultError> {
    let value = crypto::decrypt(record_key, &field_row.value_enc).map_err(|_| {
        VaultError::CorruptedVault {
            detail: format!("record '{key}' field '{}' failed authentication", field_row.name),
        }
    })?;
    Ok(Field {
        value,
        sensitive: field_row.sensitive,
        input_type: InputType::parse(&field_row.input_type),
        hint: field_row.hint.clone(),
    })
}

/// One record's contribution to the child environment.
///
/// Legacy single-value records use the derived name; explicit bindings use
/// their own names (no prefix — they are already caller-chosen); otherwise
/// every field gets `DERIVED_KEY_FIELDNAME`.
fn build_record_env(
    record: &SecretRecord,
    prefix: Option<&str>,
) -> Result<Vec<EnvVar>, VaultError> {
    let mut vars = Vec::new();
    if record.is_single_value() {
        let (name, field) = &record.fields[0];
        vars.push((
            exec::derive_env_name(&record.key, prefix),
            utf8_env_value(&record.key, name, field)?,
        ));
    } else if record.bindings.is_empty() {
        for (name, field) in &record.fields {
            let env_name = format!(
                "{}_{}",
                exec::derive_env_name(&record.key, prefix),
                name.to_ascii_uppercase()
            );
            vars.push((env_name, utf8_env_value(&record.key, name, field)?));
        }
    } else {
        for (env_name, field_name) in &record.bindings {
            let field = record.field(field_name).ok_or_else(|| {
                VaultError::CorruptedVault {
                    detail: format!(
                        "record '{}' binding '{env_name}' targets missing field",
                        record.key
                    ),
                }
            })?;
            vars.push((env_name.clone(), utf8_env_value(&record.key, field_name, field)?));
        }
    }
    Ok(vars)
}

fn utf8_env_value(
    key: &str,
    field_name: &str,
    field: &Field,
) -> Result<Zeroizing<String>, VaultError> {
    String::from_utf8(field.value.to_vec())
        .map(Zeroizing::new)
        .map_err(|_| VaultError::ValidationError {
            detail: format!(
                "field '{field_name}' of '{key}' is not valid UTF-8 and cannot be injected as an env var"
            ),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_ladder() {
        assert_eq!(cooldown_for(0), None);
        assert_eq!(cooldown_for(4), None);
        assert_eq!(cooldown_for(5), Some(chrono::Duration::seconds(30)));
        assert_eq!(cooldown_for(9), Some(chrono::Duration::seconds(30)));
        assert_eq!(cooldown_for(10), Some(chrono::Duration::minutes(5)));
        assert_eq!(cooldown_for(19), Some(chrono::Duration::minutes(5)));
        assert_eq!(cooldown_for(20), Some(chrono::Duration::minutes(30)));
        assert_eq!(cooldown_for(99), Some(chrono::Duration::minutes(30)));
    }

    #[test]
    fn record_env_single_value() {
        let record = SecretRecord::single_value("db/api-key", "sk-12345");
        let vars = build_record_env(&record, None).unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].0, "DB_API_KEY");
        assert_eq!(vars[0].1.as_str(), "sk-12345");
    }

    #[test]
    fn record_env_single_value_with_prefix() {
        let record = SecretRecord::single_value("token", "sk-12345");
        let vars = build_record_env(&record, Some("app_")).unwrap();
        assert_eq!(vars[0].0, "app_TOKEN");
    }

    #[test]
    fn record_env_bindings_take_precedence() {
        let mut record = SecretRecord::new(
            "db/prod",
            vec![
                ("host".to_owned(), Field::plain("db.internal")),
                ("password".to_owned(), Field::sensitive("hunter2")),
            ],
        );
        record.bindings = vec![
            ("PGHOST".to_owned(), "host".to_owned()),
            ("PGPASSWORD".to_owned(), "password".to_owned()),
        ];
        let vars = build_record_env(&record, Some("ignored_")).unwrap();
        let names: Vec<&str> = vars.iter().map(|(n, _)| n.as_str()).collect();
        // Binding names are caller-chosen; the prefix does not apply.
        assert_eq!(names, vec!["PGHOST", "PGPASSWORD"]);
    }

    #[test]
    fn record_env_per_field_fallback() {
        let record = SecretRecord::new(
            "db/prod",
            vec![
                ("host".to_owned(), Field::plain("db.internal")),
                ("password".to_owned(), Field::sensitive("hunter2")),
            ],
        );
        let vars = build_record_env(&record, None).unwrap();
        let names: Vec<&str> = vars.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["DB_PROD_HOST", "DB_PROD_PASSWORD"]);
    }

    #[test]
    fn non_utf8_value_cannot_be_injected() {
        let record = SecretRecord::new(
            "blob",
            vec![("value".to_owned(), Field::sensitive(vec![0xFF, 0xFE, 0x00, 0x01]))],
        );
        let err = build_record_env(&record, None).unwrap_err();
        assert!(matches!(err, VaultError::ValidationError { .. }));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let key = SecretKey::generate();
        let mut record = SecretRecord::new(
            "db/prod",
            vec![
                ("host".to_owned(), Field::plain("db.internal")),
                ("password".to_owned(), Field::sensitive("hunter2")),
            ],
        );
        record.tags = vec!["prod".to_owned()];
        record.notes = "primary database".to_owned();

        let (row, field_rows) = encode_record(&key, &record).unwrap();
        // Ciphertext only in storage rows.
        assert!(!field_rows.iter().any(|f| f.value_enc == b"hunter2"));

        let decoded = decode_record(&key, row, field_rows).unwrap();
        assert_eq!(decoded.key, "db/prod");
        assert_eq!(decoded.field("host").unwrap().value.as_slice(), b"db.internal");
        assert_eq!(decoded.field("password").unwrap().value.as_slice(), b"hunter2");
        assert!(decoded.field("password").unwrap().sensitive);
        assert_eq!(decoded.notes, "primary database");
    }

    #[test]
    fn decode_with_wrong_key_names_the_record() {
        let key = SecretKey::generate();
        let record = SecretRecord::single_value("api", "sk-12345");
        let (row, field_rows) = encode_record(&key, &record).unwrap();

        let err = decode_record(&SecretKey::generate(), row, field_rows).unwrap_err();
        match err {
            VaultError::CorruptedVault { detail } => assert!(detail.contains("api")),
            other => panic!("expected CorruptedVault, got {other:?}"),
        }
    }
}
