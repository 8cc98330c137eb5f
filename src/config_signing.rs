// =============================================================================
// Config manifest — HMAC-signed file hashes for tamper detection
// =============================================================================
//
// The manifest pins the SHA-256 of every operator-tunable config file and is
// itself signed under the operator key. Any missing file, hash mismatch, or
// signature mismatch is fatal at startup.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

pub const MANIFEST_SCHEMA_VERSION: &str = "kestrel.manifest.v1";

/// Files that must be present and pinned by the manifest.
pub const MANIFEST_FILES: [&str; 4] = [
    "config.yaml",
    "evidence_sources.json",
    "injection_patterns.json",
    "model_pricing.json",
];

#[derive(Debug, Error)]
pub enum ConfigTamperError {
    #[error("config manifest not found: {0}")]
    ManifestMissing(String),
    #[error("config manifest unreadable: {0}")]
    ManifestUnreadable(String),
    #[error("required config file missing: {0}")]
    FileMissing(String),
    #[error("manifest missing hash for: {0}")]
    HashMissing(String),
    #[error("hash mismatch for {file}: manifest={manifest_prefix}… current={current_prefix}…")]
    HashMismatch {
        file: String,
        manifest_prefix: String,
        current_prefix: String,
    },
    #[error("manifest signature verification failed")]
    SignatureMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub file_hashes: BTreeMap<String, String>,
    pub signature: String,
}

/// SHA-256 hex of a file's contents.
pub fn compute_file_hash(path: &Path) -> Result<String, ConfigTamperError> {
    let bytes = std::fs::read(path)
        .map_err(|_| ConfigTamperError::FileMissing(path.display().to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn canonical_hashes(config_dir: &Path) -> Result<BTreeMap<String, String>, ConfigTamperError> {
    let mut hashes = BTreeMap::new();
    for name in MANIFEST_FILES {
        let path = config_dir.join(name);
        if !path.is_file() {
            return Err(ConfigTamperError::FileMissing(path.display().to_string()));
        }
        hashes.insert(name.to_string(), compute_file_hash(&path)?);
    }
    Ok(hashes)
}

/// HMAC-SHA-256 over the sorted `k=v` lines of the hash map.
fn compute_signature(hashes: &BTreeMap<String, String>, operator_key: &str) -> String {
    let canonical = hashes
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");
    let mut mac =
        HmacSha256::new_from_slice(operator_key.as_bytes()).expect("HMAC accepts any key size");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Generate and write `manifest.json` for the config directory.
pub fn generate_manifest(
    config_dir: &Path,
    operator_key: &str,
) -> Result<Manifest, ConfigTamperError> {
    let hashes = canonical_hashes(config_dir)?;
    let signature = compute_signature(&hashes, operator_key);
    let manifest = Manifest {
        schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
        file_hashes: hashes,
        signature,
    };

    let body = serde_json::to_string_pretty(&manifest)
        .map_err(|e| ConfigTamperError::ManifestUnreadable(e.to_string()))?;
    std::fs::write(config_dir.join("manifest.json"), body + "\n")
        .map_err(|e| ConfigTamperError::ManifestUnreadable(e.to_string()))?;

    info!(dir = %config_dir.display(), "config manifest written");
    Ok(manifest)
}

/// Verify the manifest against the current config files.
pub fn verify_manifest(config_dir: &Path, operator_key: &str) -> Result<(), ConfigTamperError> {
    let manifest_path = config_dir.join("manifest.json");
    if !manifest_path.is_file() {
        return Err(ConfigTamperError::ManifestMissing(
            manifest_path.display().to_string(),
        ));
    }

    let raw = std::fs::read_to_string(&manifest_path)
        .map_err(|e| ConfigTamperError::ManifestUnreadable(e.to_string()))?;
    let manifest: Manifest = serde_json::from_str(&raw)
        .map_err(|e| ConfigTamperError::ManifestUnreadable(e.to_string()))?;

    let current = canonical_hashes(config_dir)?;
    for name in MANIFEST_FILES {
        let stored = manifest
            .file_hashes
            .get(name)
            .ok_or_else(|| ConfigTamperError::HashMissing(name.to_string()))?;
        let actual = current.get(name).expect("computed for every manifest file");
        if stored != actual {
            return Err(ConfigTamperError::HashMismatch {
                file: name.to_string(),
                manifest_prefix: stored.chars().take(16).collect(),
                current_prefix: actual.chars().take(16).collect(),
            });
        }
    }

    // Constant-time comparison through the MAC verify path.
    let mut mac = HmacSha256::new_from_slice(operator_key.as_bytes())
        .expect("HMAC accepts any key size");
    let canonical = current
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");
    mac.update(canonical.as_bytes());
    let sig_bytes =
        hex::decode(&manifest.signature).map_err(|_| ConfigTamperError::SignatureMismatch)?;
    if mac.verify_slice(&sig_bytes).is_err() {
        return Err(ConfigTamperError::SignatureMismatch);
    }

    info!("config manifest verified OK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "operator-key";

    fn write_config_files(dir: &Path) {
        std::fs::write(dir.join("config.yaml"), "watch: []\n").unwrap();
        std::fs::write(dir.join("evidence_sources.json"), "{\"sources\":[]}").unwrap();
        std::fs::write(
            dir.join("injection_patterns.json"),
            "{\"pattern_set_version\":\"1.0.0\",\"patterns\":[]}",
        )
        .unwrap();
        std::fs::write(dir.join("model_pricing.json"), "{}").unwrap();
    }

    #[test]
    fn generate_then_verify_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        write_config_files(dir.path());
        let manifest = generate_manifest(dir.path(), KEY).unwrap();
        assert_eq!(manifest.file_hashes.len(), 4);
        verify_manifest(dir.path(), KEY).unwrap();
    }

    #[test]
    fn modified_file_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        write_config_files(dir.path());
        generate_manifest(dir.path(), KEY).unwrap();

        std::fs::write(dir.path().join("config.yaml"), "watch: [tampered]\n").unwrap();
        match verify_manifest(dir.path(), KEY) {
            Err(ConfigTamperError::HashMismatch { file, .. }) => assert_eq!(file, "config.yaml"),
            other => panic!("expected hash mismatch, got {other:?}"),
        }
    }

    #[test]
    fn wrong_key_fails_signature() {
        let dir = tempfile::tempdir().unwrap();
        write_config_files(dir.path());
        generate_manifest(dir.path(), KEY).unwrap();
        assert!(matches!(
            verify_manifest(dir.path(), "other-key"),
            Err(ConfigTamperError::SignatureMismatch)
        ));
    }

    #[test]
    fn missing_config_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_config_files(dir.path());
        generate_manifest(dir.path(), KEY).unwrap();
        std::fs::remove_file(dir.path().join("model_pricing.json")).unwrap();
        assert!(matches!(
            verify_manifest(dir.path(), KEY),
            Err(ConfigTamperError::FileMissing(_))
        ));
    }

    #[test]
    fn missing_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_config_files(dir.path());
        assert!(matches!(
            verify_manifest(dir.path(), KEY),
            Err(ConfigTamperError::ManifestMissing(_))
        ));
    }
}
