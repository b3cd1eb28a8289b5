//! Platform hardening for the unlocked-vault window.
//!
//! Zeroization and the `0600` file perimeter close two exits for key
//! material; this module closes the remaining OS-level ones while the
//! vault is unlocked:
//!
//! - [`disable_core_dumps`] — a crash must not serialize the key
//!   hierarchy into a core file.
//! - [`lock_memory`] — a swapped-out page must not outlive the zeroize
//!   that wiped its in-RAM copy.
//! - The `check_private_*` / `set_private_*` helpers — the vault
//!   directory stays `0700`, its files `0600`, owned by the invoking
//!   user; the policy file must additionally be a regular file, not a
//!   planted symlink.
//!
//! The syscall wrappers are no-ops on non-Unix platforms; the permission
//! checks degrade to existence checks there.

use std::path::Path;

/// Disable core dumps by setting `RLIMIT_CORE` to 0.
///
/// Between unlock and lock the process holds the master key, three
/// subkeys, and whatever field values are in flight; a crash dump taken
/// in that window would write all of them to disk in plaintext, outside
/// the vault's `0600` perimeter. Called at the top of `unlock`, before
/// Argon2 ever runs.
///
/// # Errors
///
/// Returns an error string if the `setrlimit` syscall fails.
#[cfg(unix)]
pub fn disable_core_dumps() -> Result<(), String> {
    // SAFETY: no pointers escape and no process memory is touched — the
    // kernel copies the zeroed `rlimit` struct out of our stack frame and
    // from then on refuses to produce a core file for this process.
    #[allow(unsafe_code)]
    let result = unsafe {
        let rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        libc::setrlimit(libc::RLIMIT_CORE, &rlim)
    };

    if result == 0 {
        Ok(())
    } else {
        Err(format!(
            "could not block core dumps (setrlimit: {})",
            std::io::Error::last_os_error()
        ))
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn disable_core_dumps() -> Result<(), String> {
    Ok(())
}

/// Pin the process's pages in RAM with `mlockall`.
///
/// Zeroize-on-drop only helps if the buffers stay in RAM: a page swapped
/// out while holding a subkey or a decrypted field survives on the swap
/// device after the wipe. `MCL_FUTURE` is included so pages allocated
/// later — Argon2's 64 MiB arena, decrypted values, child env strings —
/// are covered too. Unprivileged users usually lack `CAP_IPC_LOCK`, so
/// the caller treats failure as a degraded mode, not an error.
///
/// # Errors
///
/// Returns an error string if the `mlockall` syscall fails.
#[cfg(unix)]
pub fn lock_memory() -> Result<(), String> {
    // SAFETY: takes only flag constants, reads and writes nothing in our
    // address space; it changes how the kernel manages our pages, never
    // their contents.
    #[allow(unsafe_code)]
    let result = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };

    if result == 0 {
        Ok(())
    } else {
        Err(format!(
            "could not pin memory, key material may swap (mlockall: {})",
            std::io::Error::last_os_error()
        ))
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn lock_memory() -> Result<(), String> {
    Ok(())
}

/// The effective user id of this process.
#[cfg(unix)]
#[must_use]
pub fn effective_uid() -> u32 {
    // SAFETY: `geteuid` takes no arguments and cannot fail.
    #[allow(unsafe_code)]
    unsafe {
        libc::geteuid()
    }
}

/// Check that `path` is a directory with mode `0700` owned by this user.
///
/// # Errors
///
/// Returns a description of the violated requirement.
#[cfg(unix)]
pub fn check_private_dir(path: &Path) -> Result<(), String> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let meta = std::fs::metadata(path)
        .map_err(|e| format!("cannot stat '{}': {e}", path.display()))?;
    if !meta.is_dir() {
        return Err(format!("'{}' is not a directory", path.display()));
    }
    if meta.uid() != effective_uid() {
        return Err(format!(
            "'{}' is owned by uid {}, not the invoking user",
            path.display(),
            meta.uid()
        ));
    }
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(format!(
            "'{}' has mode {mode:o}; group/other access must be removed (0700)",
            path.display()
        ));
    }
    Ok(())
}

/// Check that `path` is a regular file with mode `0600` owned by this user.
///
/// Uses `symlink_metadata` so a symlink planted at the path is rejected
/// rather than followed.
///
/// # Errors
///
/// Returns a description of the violated requirement.
#[cfg(unix)]
pub fn check_private_file(path: &Path) -> Result<(), String> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let meta = std::fs::symlink_metadata(path)
        .map_err(|e| format!("cannot stat '{}': {e}", path.display()))?;
    if !meta.is_file() {
        return Err(format!("'{}' is not a regular file", path.display()));
    }
    if meta.uid() != effective_uid() {
        return Err(format!(
            "'{}' is owned by uid {}, not the invoking user",
            path.display(),
            meta.uid()
        ));
    }
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(format!(
            "'{}' has mode {mode:o}; group/other access must be removed (0600)",
            path.display()
        ));
    }
    Ok(())
}

/// Restrict a directory to `0700`.
///
/// # Errors
///
/// Returns a description of the failure.
#[cfg(unix)]
pub fn set_private_dir(path: &Path) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| format!("cannot chmod '{}': {e}", path.display()))
}

/// Restrict a file to `0600`.
///
/// # Errors
///
/// Returns a description of the failure.
#[cfg(unix)]
pub fn set_private_file(path: &Path) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| format!("cannot chmod '{}': {e}", path.display()))
}

/// Existence check only on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_private_dir(path: &Path) -> Result<(), String> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(format!("'{}' is not a directory", path.display()))
    }
}

/// Existence check only on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_private_file(path: &Path) -> Result<(), String> {
    if path.is_file() {
        Ok(())
    } else {
        Err(format!("'{}' is not a regular file", path.display()))
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn set_private_dir(_path: &Path) -> Result<(), String> {
    Ok(())
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn set_private_file(_path: &Path) -> Result<(), String> {
    Ok(())
}
