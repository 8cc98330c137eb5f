// =============================================================================
// Arming ceremony — two-step TOTP + nonce flow bound to one process
// =============================================================================
//
// Step 1 validates an operator TOTP (with a replay block) and hands back a
// short-lived nonce. Step 2 consumes the nonce and writes the arming file,
// signed over the process start time so it is worthless to any other process.
// Every failure mode is a distinct error.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::constants::{ARMING_FILE_MAX_AGE_SEC, ARMING_NONCE1_TTL_SEC, TOTP_REPLAY_BLOCK_SEC};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq)]
pub enum ArmingError {
    #[error("TOTP code too short")]
    TotpTooShort,
    #[error("TOTP replay blocked ({0}s since last use)")]
    TotpReplay(i64),
    #[error("step 1 not completed")]
    Step1NotCompleted,
    #[error("nonce expired (>{ARMING_NONCE1_TTL_SEC}s)")]
    NonceExpired,
    #[error("nonce mismatch")]
    NonceMismatch,
    #[error("arming file not found")]
    FileMissing,
    #[error("arming file unreadable: {0}")]
    FileUnreadable(String),
    #[error("arming file bound to different process")]
    ProcessMismatch,
    #[error("arming file expired ({0}s > {ARMING_FILE_MAX_AGE_SEC}s)")]
    FileExpired(i64),
    #[error("arming signature mismatch")]
    SignatureMismatch,
}

/// On-disk arming record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArmingRecord {
    pub armed_at_utc: f64,
    pub process_start_unix_ms: i64,
    pub nonce1: String,
    pub arming_signature: String,
}

fn arming_signature(secret: &str, process_start_ms: i64, nonce1: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("{process_start_ms}:{nonce1}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn now_sec() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Two-step arming ceremony state for the current process.
pub struct ArmingCeremony {
    process_start_ms: i64,
    secret: String,
    arming_dir: PathBuf,
    nonce1: Option<String>,
    nonce1_created_at: f64,
    last_totp: String,
    last_totp_at: f64,
    armed: bool,
}

impl ArmingCeremony {
    pub fn new(process_start_ms: i64, secret: &str, arming_dir: impl Into<PathBuf>) -> Self {
        Self {
            process_start_ms,
            secret: secret.to_string(),
            arming_dir: arming_dir.into(),
            nonce1: None,
            nonce1_created_at: 0.0,
            last_totp: String::new(),
            last_totp_at: 0.0,
            armed: false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    fn arming_path(&self) -> PathBuf {
        self.arming_dir.join("arming.json")
    }

    /// Step 1: validate the operator TOTP and generate a 16-hex-char nonce
    /// with a 120-second TTL.
    pub fn step1_totp(&mut self, totp_code: &str) -> Result<String, ArmingError> {
        let now = now_sec();

        if totp_code == self.last_totp {
            let elapsed = (now - self.last_totp_at) as i64;
            if elapsed < TOTP_REPLAY_BLOCK_SEC {
                return Err(ArmingError::TotpReplay(elapsed));
            }
        }
        if totp_code.len() < 6 {
            return Err(ArmingError::TotpTooShort);
        }

        self.last_totp = totp_code.to_string();
        self.last_totp_at = now;

        let nonce_input = format!("{}.{}.{}", self.process_start_ms, now, totp_code);
        let mut hasher = Sha256::new();
        hasher.update(nonce_input.as_bytes());
        let nonce: String = hex::encode(hasher.finalize()).chars().take(16).collect();

        self.nonce1 = Some(nonce.clone());
        self.nonce1_created_at = now;

        info!("arming step 1 complete: nonce generated");
        Ok(nonce)
    }

    /// Step 2: confirm with the step-1 nonce and write the arming file. The
    /// nonce is consumed whether or not it matched its TTL.
    pub fn step2_confirm(&mut self, nonce1: &str) -> Result<ArmingRecord, ArmingError> {
        let Some(expected) = self.nonce1.clone() else {
            return Err(ArmingError::Step1NotCompleted);
        };

        let now = now_sec();
        if (now - self.nonce1_created_at) as i64 > ARMING_NONCE1_TTL_SEC {
            self.nonce1 = None;
            return Err(ArmingError::NonceExpired);
        }
        if nonce1 != expected {
            return Err(ArmingError::NonceMismatch);
        }

        let record = ArmingRecord {
            armed_at_utc: now,
            process_start_unix_ms: self.process_start_ms,
            nonce1: expected.clone(),
            arming_signature: arming_signature(&self.secret, self.process_start_ms, &expected),
        };

        std::fs::create_dir_all(&self.arming_dir)
            .map_err(|e| ArmingError::FileUnreadable(e.to_string()))?;
        let body = serde_json::to_string_pretty(&record)
            .map_err(|e| ArmingError::FileUnreadable(e.to_string()))?;
        std::fs::write(self.arming_path(), body)
            .map_err(|e| ArmingError::FileUnreadable(e.to_string()))?;

        self.armed = true;
        self.nonce1 = None;

        info!(path = %self.arming_path().display(), "arming ceremony complete");
        Ok(record)
    }

    /// Verify an existing arming file: readable, bound to this process, no
    /// older than 900 seconds, signature valid.
    pub fn verify_arming_file(&mut self) -> Result<(), ArmingError> {
        let path = self.arming_path();
        if !path.is_file() {
            return Err(ArmingError::FileMissing);
        }

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ArmingError::FileUnreadable(e.to_string()))?;
        let record: ArmingRecord = serde_json::from_str(&raw)
            .map_err(|e| ArmingError::FileUnreadable(e.to_string()))?;

        if record.process_start_unix_ms != self.process_start_ms {
            return Err(ArmingError::ProcessMismatch);
        }

        let age = (now_sec() - record.armed_at_utc) as i64;
        if age > ARMING_FILE_MAX_AGE_SEC {
            return Err(ArmingError::FileExpired(age));
        }

        let expected =
            arming_signature(&self.secret, record.process_start_unix_ms, &record.nonce1);
        if record.arming_signature != expected {
            return Err(ArmingError::SignatureMismatch);
        }

        self.armed = true;
        Ok(())
    }

    /// Consume the arming file on use: a single arming authorizes a single
    /// live session.
    pub fn consume(&mut self) -> std::io::Result<()> {
        self.armed = false;
        let path = self.arming_path();
        if path.is_file() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn backdate_nonce(&mut self, sec: f64) {
        self.nonce1_created_at -= sec;
    }
}

/// Verify the arming file written by another ceremony instance (e.g. the
/// engine checking what the operator shell produced).
pub fn verify_arming_file_at(
    arming_dir: &Path,
    process_start_ms: i64,
    secret: &str,
) -> Result<(), ArmingError> {
    let mut ceremony = ArmingCeremony::new(process_start_ms, secret, arming_dir);
    ceremony.verify_arming_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "arming-test-secret";

    #[test]
    fn full_ceremony_produces_verifiable_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ArmingCeremony::new(1000, SECRET, dir.path());

        let nonce = c.step1_totp("123456").unwrap();
        assert_eq!(nonce.len(), 16);

        let record = c.step2_confirm(&nonce).unwrap();
        assert_eq!(record.process_start_unix_ms, 1000);
        assert!(c.is_armed());

        // A fresh instance for the same process verifies the file.
        assert!(verify_arming_file_at(dir.path(), 1000, SECRET).is_ok());
    }

    #[test]
    fn short_totp_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ArmingCeremony::new(1, SECRET, dir.path());
        assert_eq!(c.step1_totp("123"), Err(ArmingError::TotpTooShort));
    }

    #[test]
    fn totp_replay_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ArmingCeremony::new(1, SECRET, dir.path());
        c.step1_totp("654321").unwrap();
        match c.step1_totp("654321") {
            Err(ArmingError::TotpReplay(_)) => {}
            other => panic!("expected replay block, got {other:?}"),
        }
        // A different code passes immediately.
        assert!(c.step1_totp("111222").is_ok());
    }

    #[test]
    fn step2_without_step1_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ArmingCeremony::new(1, SECRET, dir.path());
        assert_eq!(
            c.step2_confirm("deadbeefdeadbeef"),
            Err(ArmingError::Step1NotCompleted)
        );
    }

    #[test]
    fn expired_nonce_rejected_and_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ArmingCeremony::new(1, SECRET, dir.path());
        let nonce = c.step1_totp("123456").unwrap();
        c.backdate_nonce(ARMING_NONCE1_TTL_SEC as f64 + 1.0);
        assert_eq!(c.step2_confirm(&nonce), Err(ArmingError::NonceExpired));
        // The nonce was consumed by the failure.
        assert_eq!(c.step2_confirm(&nonce), Err(ArmingError::Step1NotCompleted));
    }

    #[test]
    fn nonce_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ArmingCeremony::new(1, SECRET, dir.path());
        c.step1_totp("123456").unwrap();
        assert_eq!(
            c.step2_confirm("0000000000000000"),
            Err(ArmingError::NonceMismatch)
        );
    }

    #[test]
    fn file_bound_to_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ArmingCeremony::new(3000, SECRET, dir.path());
        let nonce = c.step1_totp("123456").unwrap();
        c.step2_confirm(&nonce).unwrap();

        assert_eq!(
            verify_arming_file_at(dir.path(), 9999, SECRET),
            Err(ArmingError::ProcessMismatch)
        );
    }

    #[test]
    fn tampered_signature_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ArmingCeremony::new(4000, SECRET, dir.path());
        let nonce = c.step1_totp("123456").unwrap();
        let mut record = c.step2_confirm(&nonce).unwrap();

        record.nonce1 = "ffffffffffffffff".to_string();
        std::fs::write(
            dir.path().join("arming.json"),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();

        assert_eq!(
            verify_arming_file_at(dir.path(), 4000, SECRET),
            Err(ArmingError::SignatureMismatch)
        );
    }

    #[test]
    fn stale_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ArmingCeremony::new(5000, SECRET, dir.path());
        let nonce = c.step1_totp("123456").unwrap();
        let mut record = c.step2_confirm(&nonce).unwrap();

        record.armed_at_utc -= (ARMING_FILE_MAX_AGE_SEC + 10) as f64;
        // Re-sign is not needed: age is checked before the signature.
        std::fs::write(
            dir.path().join("arming.json"),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();

        match verify_arming_file_at(dir.path(), 5000, SECRET) {
            Err(ArmingError::FileExpired(_)) => {}
            other => panic!("expected expiry, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            verify_arming_file_at(dir.path(), 1, SECRET),
            Err(ArmingError::FileMissing)
        );
    }

    #[test]
    fn consume_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ArmingCeremony::new(6000, SECRET, dir.path());
        let nonce = c.step1_totp("123456").unwrap();
        c.step2_confirm(&nonce).unwrap();

        c.consume().unwrap();
        assert!(!c.is_armed());
        assert_eq!(
            verify_arming_file_at(dir.path(), 6000, SECRET),
            Err(ArmingError::FileMissing)
        );
    }
}
