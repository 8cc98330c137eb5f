// =============================================================================
// Secrets loader — required files with permission enforcement
// =============================================================================
//
// Each secret lives in its own file named after its key. A missing file, an
// empty file, or world-readable/writable permissions are fatal: the engine
// refuses to start rather than run with insecure credentials.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::info;

pub const REQUIRED_SECRETS: [&str; 4] = [
    "LOCAL_STATE_SECRET",
    "OPERATOR_KEY",
    "AI_API_KEY",
    "EXCHANGE_API_KEY",
];

#[derive(Debug, Error)]
#[error("secrets validation failed:\n  {}", .0.join("\n  "))]
pub struct InsecureSecretsError(pub Vec<String>);

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(path).map_err(|e| format!("cannot stat {}: {e}", path.display()))?;
    let mode = meta.permissions().mode();

    if mode & 0o004 != 0 {
        return Err(format!(
            "secret file is world-readable (others +r): {} mode={mode:o}. Run: chmod o-r {}",
            path.display(),
            path.display()
        ));
    }
    if mode & 0o002 != 0 {
        return Err(format!(
            "secret file is world-writable (others +w): {} mode={mode:o}. Run: chmod o-w {}",
            path.display(),
            path.display()
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<(), String> {
    Ok(())
}

/// Load all required secrets from `secret_dir`, enforcing permissions.
pub fn load_secrets(secret_dir: &Path) -> Result<HashMap<String, String>, InsecureSecretsError> {
    if !secret_dir.is_dir() {
        return Err(InsecureSecretsError(vec![format!(
            "secrets directory does not exist: {}",
            secret_dir.display()
        )]));
    }

    let mut secrets = HashMap::new();
    let mut errors = Vec::new();

    for name in REQUIRED_SECRETS {
        let path = secret_dir.join(name);
        if !path.is_file() {
            errors.push(format!("missing required secret file: {}", path.display()));
            continue;
        }
        if let Err(e) = check_permissions(&path) {
            errors.push(e);
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let value = raw.trim().to_string();
                if value.is_empty() {
                    errors.push(format!("secret file is empty: {}", path.display()));
                } else {
                    secrets.insert(name.to_string(), value);
                }
            }
            Err(e) => errors.push(format!("cannot read {}: {e}", path.display())),
        }
    }

    if !errors.is_empty() {
        return Err(InsecureSecretsError(errors));
    }

    info!(count = secrets.len(), dir = %secret_dir.display(), "secrets loaded");
    Ok(secrets)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_secret(dir: &Path, name: &str, value: &str, mode: u32) {
        let path = dir.join(name);
        std::fs::write(&path, value).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    fn write_all_secrets(dir: &Path, mode: u32) {
        for name in REQUIRED_SECRETS {
            write_secret(dir, name, "super-secret-value", mode);
        }
    }

    #[test]
    fn loads_all_required_secrets() {
        let dir = tempfile::tempdir().unwrap();
        write_all_secrets(dir.path(), 0o600);
        let secrets = load_secrets(dir.path()).unwrap();
        assert_eq!(secrets.len(), REQUIRED_SECRETS.len());
        assert_eq!(secrets["LOCAL_STATE_SECRET"], "super-secret-value");
    }

    #[test]
    fn missing_directory_is_fatal() {
        let err = load_secrets(Path::new("/definitely/not/a/dir")).unwrap_err();
        assert!(err.0[0].contains("does not exist"));
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_all_secrets(dir.path(), 0o600);
        std::fs::remove_file(dir.path().join("AI_API_KEY")).unwrap();
        let err = load_secrets(dir.path()).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("AI_API_KEY")));
    }

    #[test]
    fn world_readable_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_all_secrets(dir.path(), 0o600);
        write_secret(dir.path(), "OPERATOR_KEY", "value", 0o644);
        let err = load_secrets(dir.path()).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("world-readable")));
    }

    #[test]
    fn world_writable_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_all_secrets(dir.path(), 0o600);
        write_secret(dir.path(), "OPERATOR_KEY", "value", 0o602);
        let err = load_secrets(dir.path()).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("world-writable")));
    }

    #[test]
    fn empty_secret_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_all_secrets(dir.path(), 0o600);
        write_secret(dir.path(), "EXCHANGE_API_KEY", "   \n", 0o600);
        let err = load_secrets(dir.path()).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("empty")));
    }

    #[test]
    fn whitespace_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        write_all_secrets(dir.path(), 0o600);
        write_secret(dir.path(), "AI_API_KEY", "  key-value \n", 0o600);
        let secrets = load_secrets(dir.path()).unwrap();
        assert_eq!(secrets["AI_API_KEY"], "key-value");
    }
}
