//! Command policy for the secret-injection executor.
//!
//! Machine callers (MCP/RPC) are governed by a YAML policy file at
//! `<vault>/mcp-policy.yaml`; its absence means deny-all for them. The
//! interactive CLI/GUI path binds [`ExecPolicy::permissive`] instead — the
//! human at the keyboard holds the master password.
//!
//! The file is re-read on every executor call so edits take effect without
//! a restart, and it must pass the trust checks (regular file, `0600`,
//! owned by the caller) on every read. A file that fails the checks does
//! not silently permit anything.
//!
//! Decision order, short-circuiting on first match:
//!
//! 1. Hard-coded deny list — environment dumpers are denied regardless of
//!    configuration.
//! 2. User `denied_commands` (basename match).
//! 3. User `allowed_commands` (basename match).
//! 4. `default_action`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PolicyError;
use crate::hardening;

/// Policy file name under the vault directory.
pub const POLICY_FILE_NAME: &str = "mcp-policy.yaml";

/// The only supported policy schema version.
pub const POLICY_VERSION: u32 = 1;

/// Commands denied regardless of configuration: anything whose sole
/// purpose is printing the environment.
const HARD_DENIED_COMMANDS: &[&str] = &["env", "printenv", "set", "export"];

/// Glob matched against every argument; `/proc/<pid>/environ` reads are an
/// environment dump by another name.
const PROC_ENVIRON_GLOB: &str = "/proc/*/environ";

/// Fallback action when no list matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    #[default]
    Deny,
}

/// One env-alias rewrite rule: keys matching `pattern` resolve to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRule {
    pub pattern: String,
    pub target: String,
}

/// The executor policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPolicy {
    /// Schema version; must be exactly 1.
    pub version: u32,
    #[serde(default)]
    pub default_action: PolicyAction,
    #[serde(default)]
    pub denied_commands: Vec<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Named per-environment key rewrites.
    #[serde(default)]
    pub env_aliases: BTreeMap<String, Vec<AliasRule>>,
}

/// The outcome of a policy decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Denied, with the matching rule. The rule detail goes into the audit
    /// log only — callers see just the command.
    Deny { rule: String },
}

impl ExecPolicy {
    /// The policy bound to the interactive path: allow by default, no
    /// lists. The hard-coded deny list still applies.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            version: POLICY_VERSION,
            default_action: PolicyAction::Allow,
            denied_commands: Vec::new(),
            allowed_commands: Vec::new(),
            env_aliases: BTreeMap::new(),
        }
    }

    /// Rewrite a resolved key through the named alias set.
    ///
    /// The first rule whose pattern glob-matches the key wins. Returns
    /// `None` when no rule matches (the key is used as-is).
    #[must_use]
    pub fn resolve_alias(&self, alias: &str, key: &str) -> Option<&str> {
        self.env_aliases.get(alias).and_then(|rules| {
            rules
                .iter()
                .find(|rule| glob_match::glob_match(&rule.pattern, key))
                .map(|rule| rule.target.as_str())
        })
    }

    /// Whether a named alias set exists in this policy.
    #[must_use]
    pub fn has_alias(&self, alias: &str) -> bool {
        self.env_aliases.contains_key(alias)
    }
}

/// Load the policy file, enforcing the trust checks.
///
/// Returns `Ok(None)` if the file is absent — the caller decides what
/// absence means (deny-all for machine callers).
///
/// # Errors
///
/// - [`PolicyError::Unavailable`] if the file exists but is a symlink, has
///   loose permissions, is owned by another user, or cannot be read.
/// - [`PolicyError::Invalid`] if it does not parse or has the wrong version.
pub fn load(path: &Path) -> Result<Option<ExecPolicy>, PolicyError> {
    if !path.exists() && std::fs::symlink_metadata(path).is_err() {
        return Ok(None);
    }

    hardening::check_private_file(path).map_err(|reason| PolicyError::Unavailable { reason })?;

    let raw = std::fs::read_to_string(path).map_err(|e| PolicyError::Unavailable {
        reason: format!("cannot read '{}': {e}", path.display()),
    })?;

    let policy: ExecPolicy = serde_yaml::from_str(&raw).map_err(|e| PolicyError::Invalid {
        reason: e.to_string(),
    })?;

    if policy.version != POLICY_VERSION {
        return Err(PolicyError::Invalid {
            reason: format!(
                "unsupported policy version {} (expected {POLICY_VERSION})",
                policy.version
            ),
        });
    }

    debug!(
        path = %path.display(),
        denied = policy.denied_commands.len(),
        allowed = policy.allowed_commands.len(),
        "policy loaded"
    );
    Ok(Some(policy))
}

/// Evaluate the decision order for a command.
///
/// `policy` is `None` when no policy file exists — deny-all for machine
/// callers. The hard-coded deny list runs first in every case.
#[must_use]
pub fn decide(policy: Option<&ExecPolicy>, command: &str, args: &[String]) -> Decision {
    let base = basename(command);

    if HARD_DENIED_COMMANDS.contains(&base) {
        return Decision::Deny {
            rule: format!("hard-denied command '{base}'"),
        };
    }
    if let Some(arg) = args
        .iter()
        .find(|arg| glob_match::glob_match(PROC_ENVIRON_GLOB, arg))
    {
        return Decision::Deny {
            rule: format!("hard-denied argument '{arg}'"),
        };
    }

    let Some(policy) = policy else {
        return Decision::Deny {
            rule: "no policy file".to_owned(),
        };
    };

    if policy.denied_commands.iter().any(|c| c == base) {
        return Decision::Deny {
            rule: format!("denied_commands entry '{base}'"),
        };
    }
    if policy.allowed_commands.iter().any(|c| c == base) {
        return Decision::Allow;
    }
    match policy.default_action {
        PolicyAction::Allow => Decision::Allow,
        PolicyAction::Deny => Decision::Deny {
            rule: "default_action deny".to_owned(),
        },
    }
}

/// The basename of a command path; matching ignores directories.
fn basename(command: &str) -> &str {
    command.rsplit(['/', '\\']).next().unwrap_or(command)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn allow_all() -> ExecPolicy {
        ExecPolicy {
            version: 1,
            default_action: PolicyAction::Allow,
            denied_commands: Vec::new(),
            allowed_commands: Vec::new(),
            env_aliases: BTreeMap::new(),
        }
    }

    #[test]
    fn no_policy_denies_everything() {
        let decision = decide(None, "echo", &[]);
        assert!(matches!(decision, Decision::Deny { .. }));
    }

    #[test]
    fn hard_deny_beats_allowed_commands() {
        let mut policy = allow_all();
        policy.allowed_commands = vec!["env".to_owned()];
        let decision = decide(Some(&policy), "env", &[]);
        assert!(matches!(decision, Decision::Deny { rule } if rule.contains("hard-denied")));
    }

    #[test]
    fn hard_deny_matches_basename() {
        let policy = allow_all();
        let decision = decide(Some(&policy), "/usr/bin/printenv", &[]);
        assert!(matches!(decision, Decision::Deny { .. }));
    }

    #[test]
    fn proc_environ_argument_denied() {
        let policy = allow_all();
        let args = vec!["/proc/1234/environ".to_owned()];
        let decision = decide(Some(&policy), "cat", &args);
        assert!(matches!(decision, Decision::Deny { rule } if rule.contains("environ")));
    }

    #[test]
    fn denied_list_beats_allowed_list() {
        let mut policy = allow_all();
        policy.denied_commands = vec!["curl".to_owned()];
        policy.allowed_commands = vec!["curl".to_owned()];
        let decision = decide(Some(&policy), "curl", &[]);
        assert!(matches!(decision, Decision::Deny { rule } if rule.contains("denied_commands")));
    }

    #[test]
    fn allowed_list_beats_default_deny() {
        let mut policy = allow_all();
        policy.default_action = PolicyAction::Deny;
        policy.allowed_commands = vec!["psql".to_owned()];
        assert_eq!(decide(Some(&policy), "psql", &[]), Decision::Allow);
        assert!(matches!(
            decide(Some(&policy), "mysql", &[]),
            Decision::Deny { rule } if rule.contains("default_action")
        ));
    }

    #[test]
    fn permissive_policy_allows_but_not_hard_denied() {
        let policy = ExecPolicy::permissive();
        assert_eq!(decide(Some(&policy), "echo", &[]), Decision::Allow);
        assert!(matches!(
            decide(Some(&policy), "env", &[]),
            Decision::Deny { .. }
        ));
    }

    #[test]
    fn parse_full_document() {
        let yaml = r"
version: 1
default_action: deny
denied_commands: [curl, wget]
allowed_commands: [psql, sh]
env_aliases:
  staging:
    - {pattern: 'db/prod', target: 'db/staging'}
    - {pattern: 'db/*', target: 'db/staging-generic'}
";
        let policy: ExecPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.version, 1);
        assert_eq!(policy.default_action, PolicyAction::Deny);
        assert_eq!(policy.denied_commands, vec!["curl", "wget"]);
        assert_eq!(policy.resolve_alias("staging", "db/prod"), Some("db/staging"));
        // First matching rule wins.
        assert_eq!(
            policy.resolve_alias("staging", "db/replica"),
            Some("db/staging-generic")
        );
        assert_eq!(policy.resolve_alias("staging", "api"), None);
        assert!(!policy.has_alias("production"));
    }

    #[test]
    fn defaults_when_fields_omitted() {
        let policy: ExecPolicy = serde_yaml::from_str("version: 1").unwrap();
        assert_eq!(policy.default_action, PolicyAction::Deny);
        assert!(policy.denied_commands.is_empty());
        assert!(policy.allowed_commands.is_empty());
    }

    #[cfg(unix)]
    mod file_checks {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn write_policy(dir: &tempfile::TempDir, mode: u32) -> std::path::PathBuf {
            let path = dir.path().join(POLICY_FILE_NAME);
            std::fs::write(&path, "version: 1\ndefault_action: allow\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
            path
        }

        #[test]
        fn absent_file_is_none() {
            let dir = tempfile::tempdir().unwrap();
            let loaded = load(&dir.path().join(POLICY_FILE_NAME)).unwrap();
            assert!(loaded.is_none());
        }

        #[test]
        fn private_file_loads() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_policy(&dir, 0o600);
            let policy = load(&path).unwrap().unwrap();
            assert_eq!(policy.default_action, PolicyAction::Allow);
        }

        #[test]
        fn world_readable_file_is_unavailable() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_policy(&dir, 0o644);
            assert!(matches!(
                load(&path),
                Err(PolicyError::Unavailable { .. })
            ));
        }

        #[test]
        fn symlink_is_unavailable() {
            let dir = tempfile::tempdir().unwrap();
            let real = write_policy(&dir, 0o600);
            let link = dir.path().join("link.yaml");
            std::os::unix::fs::symlink(&real, &link).unwrap();
            assert!(matches!(load(&link), Err(PolicyError::Unavailable { .. })));
        }

        #[test]
        fn wrong_version_is_invalid() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join(POLICY_FILE_NAME);
            std::fs::write(&path, "version: 2\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
            assert!(matches!(load(&path), Err(PolicyError::Invalid { .. })));
        }
    }
}
