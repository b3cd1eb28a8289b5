//! Child-process execution with secret-injected environments.
//!
//! The executor owns the last hop of the secret path: resolved record
//! values become environment variables of a child process, and everything
//! the child prints comes back through the [`Sanitizer`]. Secrets exist as
//! plaintext only in the child's address space and in the zeroize-on-drop
//! buffers assembled here.
//!
//! - At most [`MAX_CONCURRENT_CHILDREN`] children run at once; further
//!   calls queue on the semaphore.
//! - The child's stdin is `/dev/null`; stdout/stderr are piped through the
//!   sanitizer chunk by chunk.
//! - The parent environment is passed through minus any variable the
//!   executor is about to set (so the parent's value cannot shadow or leak)
//!   and minus `SECRETCTL_PASSWORD`.
//! - On timeout the child gets SIGTERM, a 250 ms grace period, then
//!   SIGKILL.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::ExecError;
use crate::sanitize::Sanitizer;

/// Concurrency cap across the whole process.
pub const MAX_CONCURRENT_CHILDREN: usize = 5;

/// Timeout applied when the caller does not supply one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Upper bound on caller-supplied timeouts.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(250);

/// Never forwarded to children, even from the parent environment.
pub const PASSWORD_ENV_VAR: &str = "SECRETCTL_PASSWORD";

/// Read-buffer size for child output.
const READ_CHUNK: usize = 8192;

/// An environment variable staged for injection. The value is zeroized
/// when the set is dropped after the child exits.
pub type EnvVar = (String, Zeroizing<String>);

/// Captured result of a child run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// The child's exit code (-1 when killed by a signal).
    pub exit_code: i32,
    /// Sanitized stdout bytes, in full.
    pub stdout: Vec<u8>,
    /// Sanitized stderr bytes, in full.
    pub stderr: Vec<u8>,
    /// Whether any redaction occurred on either stream.
    pub sanitized: bool,
}

/// Bounded child-process runner.
#[derive(Clone)]
pub struct Executor {
    slots: Arc<Semaphore>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Semaphore::new(MAX_CONCURRENT_CHILDREN)),
        }
    }

    /// Run `command` with `injected` merged over the scrubbed parent
    /// environment, streaming output through `sanitizer`.
    ///
    /// Blocks (queues) while all execution slots are taken.
    ///
    /// # Errors
    ///
    /// - [`ExecError::Busy`] if the executor is shutting down.
    /// - [`ExecError::Spawn`] if the child cannot be started.
    /// - [`ExecError::Timeout`] if the child outlived `timeout` and was
    ///   killed.
    /// - [`ExecError::Io`] if reading child output fails.
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        injected: &[EnvVar],
        timeout: Duration,
        sanitizer: &Sanitizer,
    ) -> Result<RunOutput, ExecError> {
        let _permit = self.slots.acquire().await.map_err(|_| ExecError::Busy)?;
        let timeout = timeout.min(MAX_TIMEOUT);

        let env = build_child_env(injected, std::env::vars_os());
        let mut child = Command::new(command)
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn {
                command: command.to_owned(),
                reason: e.to_string(),
            })?;

        debug!(command, pid = child.id(), "child spawned");

        let stdout_pipe = child.stdout.take().ok_or_else(|| ExecError::Io {
            reason: "child stdout was not piped".to_owned(),
        })?;
        let stderr_pipe = child.stderr.take().ok_or_else(|| ExecError::Io {
            reason: "child stderr was not piped".to_owned(),
        })?;

        let wait = async {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status.map(Some).map_err(|e| ExecError::Io {
                    reason: format!("wait failed: {e}"),
                }),
                Err(_) => {
                    terminate(&mut child).await;
                    Ok(None)
                }
            }
        };

        let (stdout, stderr, status) = tokio::join!(
            drain(stdout_pipe, sanitizer),
            drain(stderr_pipe, sanitizer),
            wait
        );
        let (stdout, out_matched) = stdout?;
        let (stderr, err_matched) = stderr?;

        match status? {
            Some(status) => Ok(RunOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
                sanitized: out_matched || err_matched,
            }),
            None => Err(ExecError::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("free_slots", &self.slots.available_permits())
            .finish()
    }
}

/// SIGTERM, grace period, SIGKILL.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        if let Ok(pid) = i32::try_from(pid) {
            // SAFETY: `kill` with a valid pid and SIGTERM has no memory
            // safety implications; delivery failure is handled by the
            // SIGKILL below.
            #[allow(unsafe_code)]
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

/// Read a child stream to the end through the sanitizer.
async fn drain<R>(mut reader: R, sanitizer: &Sanitizer) -> Result<(Vec<u8>, bool), ExecError>
where
    R: AsyncReadExt + Unpin,
{
    let mut out = Vec::new();
    let mut state = sanitizer.state();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| ExecError::Io {
            reason: format!("reading child output: {e}"),
        })?;
        if n == 0 {
            break;
        }
        sanitizer.push(&mut state, &buf[..n], &mut out);
    }
    let matched = sanitizer.finish(state, &mut out);
    Ok((out, matched))
}

/// The child environment: the parent's variables minus anything being
/// injected (the parent's value must not shadow or leak) and minus
/// [`PASSWORD_ENV_VAR`], plus the injected variables.
fn build_child_env(
    injected: &[EnvVar],
    parent: impl Iterator<Item = (OsString, OsString)>,
) -> Vec<(OsString, OsString)> {
    let mut env: Vec<(OsString, OsString)> = parent
        .filter(|(name, _)| {
            name != PASSWORD_ENV_VAR
                && !injected.iter().any(|(injected_name, _)| name == injected_name.as_str())
        })
        .collect();
    for (name, value) in injected {
        env.push((OsString::from(name), OsString::from(value.as_str())));
    }
    env
}

/// Whether a `run` key argument is a glob pattern rather than an exact key.
#[must_use]
pub fn is_pattern(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Key-resolution failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// An exact (non-pattern) key does not exist.
    NotFound { key: String },
    /// Nothing matched any of the supplied keys or patterns.
    NoMatches,
}

/// Resolve key arguments against the vault's key set.
///
/// Each entry is either an exact key (which must exist) or a glob — `*`
/// matches within one path segment, `?` one character, `[...]` a character
/// class. Matches are de-duplicated preserving first-seen order.
///
/// # Errors
///
/// - [`ResolveError::NotFound`] for an exact key that is absent.
/// - [`ResolveError::NoMatches`] if the final set is empty.
pub fn resolve_keys(patterns: &[String], known: &[String]) -> Result<Vec<String>, ResolveError> {
    let mut resolved: Vec<String> = Vec::new();
    for pattern in patterns {
        if is_pattern(pattern) {
            for key in known {
                if glob_match::glob_match(pattern, key) && !resolved.contains(key) {
                    resolved.push(key.clone());
                }
            }
        } else {
            if !known.contains(pattern) {
                return Err(ResolveError::NotFound {
                    key: pattern.clone(),
                });
            }
            if !resolved.contains(pattern) {
                resolved.push(pattern.clone());
            }
        }
    }
    if resolved.is_empty() {
        return Err(ResolveError::NoMatches);
    }
    Ok(resolved)
}

/// Derive an environment variable name from a record key: `/` and `-`
/// become `_`, letters are uppercased, and the optional prefix is
/// prepended literally (never re-uppercased, never collapsed).
#[must_use]
pub fn derive_env_name(key: &str, prefix: Option<&str>) -> String {
    let derived: String = key
        .chars()
        .map(|c| match c {
            '/' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    match prefix {
        Some(prefix) => format!("{prefix}{derived}"),
        None => derived,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn no_secrets() -> Sanitizer {
        Sanitizer::new(&[]).unwrap()
    }

    fn env(pairs: &[(&str, &str)]) -> Vec<EnvVar> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), Zeroizing::new((*v).to_owned())))
            .collect()
    }

    #[test]
    fn derive_env_name_rules() {
        assert_eq!(derive_env_name("db/prod", None), "DB_PROD");
        assert_eq!(derive_env_name("api-key", None), "API_KEY");
        assert_eq!(derive_env_name("simple", None), "SIMPLE");
        assert_eq!(derive_env_name("db/prod", Some("app_")), "app_DB_PROD");
        // The prefix is literal: no re-uppercasing, no collapse.
        assert_eq!(derive_env_name("db", Some("DB")), "DBDB");
    }

    #[test]
    fn is_pattern_detects_globs() {
        assert!(is_pattern("db/*"));
        assert!(is_pattern("db/p?od"));
        assert!(is_pattern("db/[ab]"));
        assert!(!is_pattern("db/prod"));
    }

    #[test]
    fn resolve_exact_keys() {
        let known = vec!["api".to_owned(), "db/prod".to_owned()];
        let resolved = resolve_keys(&["db/prod".to_owned()], &known).unwrap();
        assert_eq!(resolved, vec!["db/prod"]);
    }

    #[test]
    fn resolve_missing_exact_key_fails() {
        let known = vec!["api".to_owned()];
        let err = resolve_keys(&["nope".to_owned()], &known).unwrap_err();
        assert_eq!(err, ResolveError::NotFound { key: "nope".to_owned() });
    }

    #[test]
    fn resolve_glob_within_segment() {
        let known = vec![
            "db/prod".to_owned(),
            "db/staging".to_owned(),
            "db/prod/replica".to_owned(),
            "api".to_owned(),
        ];
        let resolved = resolve_keys(&["db/*".to_owned()], &known).unwrap();
        // `*` does not cross the path separator.
        assert_eq!(resolved, vec!["db/prod", "db/staging"]);
    }

    #[test]
    fn resolve_dedupes_preserving_order() {
        let known = vec!["db/prod".to_owned(), "db/staging".to_owned()];
        let resolved = resolve_keys(
            &["db/prod".to_owned(), "db/*".to_owned()],
            &known,
        )
        .unwrap();
        assert_eq!(resolved, vec!["db/prod", "db/staging"]);
    }

    #[test]
    fn resolve_empty_result_is_an_error() {
        let known = vec!["api".to_owned()];
        let err = resolve_keys(&["db/*".to_owned()], &known).unwrap_err();
        assert_eq!(err, ResolveError::NoMatches);
    }

    #[test]
    fn child_env_strips_password_and_shadowed_vars() {
        let parent = vec![
            (OsString::from("PATH"), OsString::from("/usr/bin")),
            (OsString::from(PASSWORD_ENV_VAR), OsString::from("hunter2")),
            (OsString::from("TOKEN"), OsString::from("stale-parent-value")),
        ];
        let injected = env(&[("TOKEN", "fresh")]);
        let child_env = build_child_env(&injected, parent.into_iter());

        assert!(child_env.iter().any(|(k, v)| k == "PATH" && v == "/usr/bin"));
        assert!(!child_env.iter().any(|(k, _)| k == PASSWORD_ENV_VAR));
        let tokens: Vec<_> = child_env.iter().filter(|(k, _)| k == "TOKEN").collect();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].1, "fresh");
    }

    #[cfg(unix)]
    mod spawn {
        use super::*;

        #[tokio::test]
        async fn captures_stdout_and_exit_code() {
            let executor = Executor::new();
            let output = executor
                .execute(
                    "sh",
                    &["-c".to_owned(), "echo hello; exit 3".to_owned()],
                    &[],
                    Duration::from_secs(10),
                    &no_secrets(),
                )
                .await
                .unwrap();
            assert_eq!(output.exit_code, 3);
            assert_eq!(output.stdout, b"hello\n");
            assert!(!output.sanitized);
        }

        #[tokio::test]
        async fn injected_env_reaches_child() {
            let executor = Executor::new();
            let injected = env(&[("INJECTED_TOKEN", "visible-token")]);
            let output = executor
                .execute(
                    "sh",
                    &["-c".to_owned(), "printf %s \"$INJECTED_TOKEN\"".to_owned()],
                    &injected,
                    Duration::from_secs(10),
                    &no_secrets(),
                )
                .await
                .unwrap();
            assert_eq!(output.stdout, b"visible-token");
        }

        #[tokio::test]
        async fn output_is_sanitized() {
            let executor = Executor::new();
            let injected = env(&[("DB_PASSWORD", "p4ssw0rd!")]);
            let sanitizer =
                Sanitizer::new(&[("db/prod".to_owned(), b"p4ssw0rd!".to_vec())]).unwrap();
            let output = executor
                .execute(
                    "sh",
                    &["-c".to_owned(), "echo \"pw=$DB_PASSWORD\" >&2".to_owned()],
                    &injected,
                    Duration::from_secs(10),
                    &sanitizer,
                )
                .await
                .unwrap();
            assert_eq!(output.stderr, b"pw=[REDACTED:db/prod]\n");
            assert!(output.sanitized);
        }

        #[tokio::test]
        async fn stdin_is_null() {
            let executor = Executor::new();
            let output = executor
                .execute(
                    "sh",
                    &["-c".to_owned(), "cat; echo done".to_owned()],
                    &[],
                    Duration::from_secs(10),
                    &no_secrets(),
                )
                .await
                .unwrap();
            // `cat` sees EOF immediately.
            assert_eq!(output.stdout, b"done\n");
        }

        #[tokio::test]
        async fn timeout_kills_the_child() {
            let executor = Executor::new();
            let started = std::time::Instant::now();
            let result = executor
                .execute(
                    "sh",
                    &["-c".to_owned(), "sleep 30".to_owned()],
                    &[],
                    Duration::from_millis(200),
                    &no_secrets(),
                )
                .await;
            assert!(matches!(result, Err(ExecError::Timeout { .. })));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn spawn_failure_is_reported() {
            let executor = Executor::new();
            let result = executor
                .execute(
                    "/nonexistent/binary",
                    &[],
                    &[],
                    Duration::from_secs(1),
                    &no_secrets(),
                )
                .await;
            assert!(matches!(result, Err(ExecError::Spawn { .. })));
        }

        #[tokio::test]
        async fn sixth_concurrent_child_queues() {
            let executor = Executor::new();
            let started = std::time::Instant::now();
            let mut handles = Vec::new();
            for _ in 0..6 {
                let executor = executor.clone();
                handles.push(tokio::spawn(async move {
                    executor
                        .execute(
                            "sh",
                            &["-c".to_owned(), "sleep 0.3".to_owned()],
                            &[],
                            Duration::from_secs(10),
                            &Sanitizer::new(&[]).unwrap(),
                        )
                        .await
                }));
            }
            for handle in handles {
                handle.await.unwrap().unwrap();
            }
            // Five run at once; the sixth waits for a slot.
            assert!(started.elapsed() >= Duration::from_millis(550));
        }
    }
}
