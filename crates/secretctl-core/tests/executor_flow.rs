//! End-to-end executor scenarios: policy gating, env injection through
//! bindings and globs, and output redaction.

#![allow(clippy::unwrap_used)]
#![cfg(unix)]

use std::time::Duration;

use secretctl_core::record::Field;
use secretctl_core::{OpContext, RunRequest, SecretRecord, Vault, VaultError};

fn cli() -> OpContext {
    OpContext::interactive("exec-cli-session")
}

fn mcp() -> OpContext {
    OpContext::machine("exec-mcp-session")
}

async fn vault_with_db_record(dir: &tempfile::TempDir) -> Vault {
    let vault = Vault::init(dir.path().join("vault"), "pw", &cli())
        .await
        .unwrap();
    vault.unlock("pw", &cli()).await.unwrap();

    let mut record = SecretRecord::new(
        "db/prod",
        vec![
            ("host".to_owned(), Field::plain("dbhost01")),
            ("password".to_owned(), Field::sensitive("p4ssw0rd-xyz")),
        ],
    );
    record.bindings = vec![
        ("PGHOST".to_owned(), "host".to_owned()),
        ("PGPASSWORD".to_owned(), "password".to_owned()),
    ];
    vault.set(&cli(), record).await.unwrap();
    vault
}

fn write_policy(vault_dir: &std::path::Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = vault_dir.join("mcp-policy.yaml");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
}

#[tokio::test]
async fn machine_callers_are_denied_without_a_policy_file() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;

    let request = RunRequest::new(
        vec!["db/prod".to_owned()],
        "echo",
        vec!["hello".to_owned()],
    );
    let err = vault.run(&mcp(), &request).await.unwrap_err();
    assert!(matches!(err, VaultError::PolicyDenied { ref command } if command == "echo"));
}

#[tokio::test]
async fn hard_deny_wins_even_when_explicitly_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;
    write_policy(
        vault.dir(),
        "version: 1\ndefault_action: allow\nallowed_commands: [env]\n",
    );

    let request = RunRequest::new(vec!["db/prod".to_owned()], "env", vec![]);
    let err = vault.run(&mcp(), &request).await.unwrap_err();
    assert!(matches!(err, VaultError::PolicyDenied { .. }));

    // The interactive path is permissive, but the hard list still applies.
    let err = vault
        .run_with_bindings(
            &cli(),
            "db/prod",
            "printenv",
            vec!["PGHOST".to_owned(), "PGPASSWORD".to_owned()],
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::PolicyDenied { ref command } if command == "printenv"));
}

#[tokio::test]
async fn bindings_inject_and_output_is_redacted() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;

    let output = vault
        .run_with_bindings(
            &cli(),
            "db/prod",
            "sh",
            vec!["-c".to_owned(), "echo \"$PGHOST-$PGPASSWORD\"".to_owned()],
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout, b"dbhost01-[REDACTED:db/prod]\n");
    assert!(output.sanitized);
}

#[tokio::test]
async fn non_sensitive_values_are_not_redacted() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;

    let output = vault
        .run_with_bindings(
            &cli(),
            "db/prod",
            "sh",
            vec!["-c".to_owned(), "echo \"$PGHOST\"".to_owned()],
            None,
        )
        .await
        .unwrap();
    assert_eq!(output.stdout, b"dbhost01\n");
    assert!(!output.sanitized);
}

#[tokio::test]
async fn machine_run_allowed_by_policy_file() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;
    write_policy(
        vault.dir(),
        "version: 1\ndefault_action: deny\nallowed_commands: [sh]\n",
    );

    let output = vault
        .run_with_bindings(
            &mcp(),
            "db/prod",
            "sh",
            vec!["-c".to_owned(), "echo \"$PGPASSWORD\"".to_owned()],
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    // Secrets flow into the child but never back out in plaintext.
    assert_eq!(output.stdout, b"[REDACTED:db/prod]\n");
    assert!(output.sanitized);
}

#[tokio::test]
async fn world_readable_policy_is_unavailable_not_permissive() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;
    write_policy(vault.dir(), "version: 1\ndefault_action: allow\n");
    std::fs::set_permissions(
        vault.dir().join("mcp-policy.yaml"),
        std::fs::Permissions::from_mode(0o644),
    )
    .unwrap();

    let request = RunRequest::new(vec!["db/prod".to_owned()], "echo", vec![]);
    let err = vault.run(&mcp(), &request).await.unwrap_err();
    assert!(matches!(err, VaultError::PolicyUnavailable));
}

#[tokio::test]
async fn glob_resolution_with_env_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;
    vault
        .set(&cli(), SecretRecord::single_value("svc/token", "tok-abcdef"))
        .await
        .unwrap();
    vault
        .set(&cli(), SecretRecord::single_value("svc/webhook", "hook-123456"))
        .await
        .unwrap();

    let mut request = RunRequest::new(
        vec!["svc/*".to_owned()],
        "sh",
        vec![
            "-c".to_owned(),
            "echo \"$APP_SVC_TOKEN|$APP_SVC_WEBHOOK\"".to_owned(),
        ],
    );
    request.env_prefix = Some("APP_".to_owned());

    let output = vault.run(&cli(), &request).await.unwrap();
    assert_eq!(
        output.stdout,
        b"[REDACTED:svc/token]|[REDACTED:svc/webhook]\n"
    );
    assert!(output.sanitized);
}

#[tokio::test]
async fn unknown_key_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;

    let request = RunRequest::new(vec!["absent".to_owned()], "echo", vec![]);
    let err = vault.run(&cli(), &request).await.unwrap_err();
    assert!(matches!(err, VaultError::NotFound { ref key, .. } if key == "absent"));

    let request = RunRequest::new(vec!["nomatch/*".to_owned()], "echo", vec![]);
    let err = vault.run(&cli(), &request).await.unwrap_err();
    assert!(matches!(err, VaultError::NotFound { .. }));
}

#[tokio::test]
async fn env_alias_rewrites_resolved_keys() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;
    vault
        .set(
            &cli(),
            SecretRecord::single_value("db/staging-token", "staging-value"),
        )
        .await
        .unwrap();
    vault
        .set(
            &cli(),
            SecretRecord::single_value("db/prod-token", "production-value"),
        )
        .await
        .unwrap();
    write_policy(
        vault.dir(),
        concat!(
            "version: 1\n",
            "default_action: deny\n",
            "allowed_commands: [sh]\n",
            "env_aliases:\n",
            "  staging:\n",
            "    - {pattern: 'db/prod-token', target: 'db/staging-token'}\n",
        ),
    );

    let mut request = RunRequest::new(
        vec!["db/prod-token".to_owned()],
        "sh",
        vec!["-c".to_owned(), "echo \"$DB_STAGING_TOKEN\"".to_owned()],
    );
    request.env_alias = Some("staging".to_owned());

    let output = vault.run(&mcp(), &request).await.unwrap();
    assert_eq!(output.stdout, b"[REDACTED:db/staging-token]\n");
}

#[tokio::test]
async fn run_times_out_and_reports_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;

    let mut request = RunRequest::new(
        vec!["db/prod".to_owned()],
        "sh",
        vec!["-c".to_owned(), "sleep 30".to_owned()],
    );
    request.timeout = Some(Duration::from_millis(200));

    let started = std::time::Instant::now();
    let err = vault.run(&cli(), &request).await.unwrap_err();
    assert!(matches!(err, VaultError::Timeout));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn oversized_timeout_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;

    let mut request = RunRequest::new(vec!["db/prod".to_owned()], "echo", vec![]);
    request.timeout = Some(Duration::from_secs(2 * 60 * 60));
    let err = vault.run(&cli(), &request).await.unwrap_err();
    assert!(matches!(err, VaultError::ValidationError { .. }));
}

#[tokio::test]
async fn denied_runs_land_in_the_audit_log() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault_with_db_record(&dir).await;

    let request = RunRequest::new(vec!["db/prod".to_owned()], "env", vec![]);
    let _ = vault.run(&cli(), &request).await.unwrap_err();

    let denied = vault
        .audit_search(
            secretctl_core::AuditFilter {
                result: Some(secretctl_core::AuditResult::Denied),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(denied.len(), 1);
    assert_eq!(
        denied[0].operation,
        secretctl_core::AuditOp::SecretRunDenied
    );
    // The matching rule stays in the log, not in the caller-visible error.
    assert!(denied[0].context.get("rule").unwrap().contains("hard-denied"));
}
