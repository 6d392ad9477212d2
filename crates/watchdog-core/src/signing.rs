//! Key management and canonical record signing.
//!
//! A record is signed over its *identity* (path, hashes, metadata, timestamp,
//! algorithm). `signature` and `status` never enter the signed bytes. The
//! identity is encoded as compact JSON with object keys sorted at every level,
//! hashed with SHA-256, and the digest is signed with Ed25519.
//!
//! [`canonical_bytes`] is the only encoder; `sign` and `verify` both go
//! through it.

use crate::error::{Result, WatchdogError};
use crate::models::{FileMetadata, FileRecord, HashAlgorithm};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zeroize::Zeroizing;

pub const PRIVATE_KEY_FILE: &str = "private.key";
pub const PUBLIC_KEY_FILE: &str = "public.key";

const KEY_LEN: usize = 32;

// ── Canonical serialization ─────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedIdentity<'a> {
    path: &'a str,
    hashes: &'a BTreeMap<HashAlgorithm, String>,
    metadata: &'a FileMetadata,
    timestamp: &'a DateTime<Utc>,
    algorithm: HashAlgorithm,
}

impl<'a> From<&'a FileRecord> for SignedIdentity<'a> {
    fn from(record: &'a FileRecord) -> Self {
        Self {
            path: &record.path,
            hashes: &record.hashes,
            metadata: &record.metadata,
            timestamp: &record.timestamp,
            algorithm: record.algorithm,
        }
    }
}

/// Deterministic encoding of the signed portion of `record`.
pub fn canonical_bytes(record: &FileRecord) -> Result<Vec<u8>> {
    let value = serde_json::to_value(SignedIdentity::from(record))?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out.into_bytes())
}

/// Compact JSON with object keys in lexicographic order at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn record_digest(record: &FileRecord) -> Result<[u8; 32]> {
    let canonical = canonical_bytes(record)?;
    Ok(Sha256::digest(canonical).into())
}

// ── Sign / verify ───────────────────────────────────────────────────────────

/// Why a signature did not verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureFailure {
    Missing,
    Undecodable(String),
    WrongLength(usize),
    Mismatch,
    Encoding(String),
}

impl fmt::Display for SignatureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "record carries no signature"),
            Self::Undecodable(e) => write!(f, "signature is not valid base64: {e}"),
            Self::WrongLength(n) => write!(f, "signature has {n} bytes, expected 64"),
            Self::Mismatch => write!(f, "signature does not match record contents"),
            Self::Encoding(e) => write!(f, "record could not be encoded: {e}"),
        }
    }
}

/// Sign `record` and return the base64 signature.
pub fn sign(record: &FileRecord, key: &SigningKey) -> Result<String> {
    let digest = record_digest(record).map_err(|e| WatchdogError::Crypto(e.to_string()))?;
    let signature = key.sign(&digest);
    Ok(general_purpose::STANDARD.encode(signature.to_bytes()))
}

/// Check `signature` against `record`, reporting why it failed.
pub fn check_signature(
    record: &FileRecord,
    signature: &str,
    key: &VerifyingKey,
) -> std::result::Result<(), SignatureFailure> {
    let bytes = general_purpose::STANDARD
        .decode(signature.trim())
        .map_err(|e| SignatureFailure::Undecodable(e.to_string()))?;
    let signature =
        Signature::from_slice(&bytes).map_err(|_| SignatureFailure::WrongLength(bytes.len()))?;
    let digest = record_digest(record).map_err(|e| SignatureFailure::Encoding(e.to_string()))?;
    key.verify_strict(&digest, &signature)
        .map_err(|_| SignatureFailure::Mismatch)
}

/// Fail-closed verification: any malformed input is simply "not verified".
pub fn verify(record: &FileRecord, signature: &str, key: &VerifyingKey) -> bool {
    check_signature(record, signature, key).is_ok()
}

/// Verify the signature the record itself carries.
pub fn check_record(
    record: &FileRecord,
    key: &VerifyingKey,
) -> std::result::Result<(), SignatureFailure> {
    match record.signature.as_deref() {
        Some(sig) => check_signature(record, sig, key),
        None => Err(SignatureFailure::Missing),
    }
}

pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing = SigningKey::generate(&mut OsRng);
    let verifying = signing.verifying_key();
    (signing, verifying)
}

// ── Key store ───────────────────────────────────────────────────────────────

/// Two opaque key blobs on disk: `private.key` and `public.key`.
pub struct KeyStore {
    dir: PathBuf,
    signing_key: Option<SigningKey>,
    verifying_key: VerifyingKey,
}

impl KeyStore {
    /// Load the keypair from `dir`, generating it if neither blob exists.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| WatchdogError::file(dir, e))?;
        let private_path = dir.join(PRIVATE_KEY_FILE);
        let public_path = dir.join(PUBLIC_KEY_FILE);

        match (private_path.exists(), public_path.exists()) {
            (false, false) => {
                let (signing, verifying) = generate_keypair();
                write_private(&private_path, &signing)?;
                write_blob(&public_path, &verifying.to_bytes())?;
                info!(dir = %dir.display(), "generated new signing keypair");
                Ok(Self {
                    dir: dir.to_path_buf(),
                    signing_key: Some(signing),
                    verifying_key: verifying,
                })
            }
            (true, public_exists) => {
                let signing = read_private(&private_path)?;
                let verifying = signing.verifying_key();
                if public_exists {
                    let stored = read_public(&public_path)?;
                    if stored != verifying {
                        return Err(WatchdogError::Crypto(format!(
                            "public key in {} does not belong to the private key",
                            dir.display()
                        )));
                    }
                } else {
                    warn!(dir = %dir.display(), "public key missing; regenerating from private key");
                    write_blob(&public_path, &verifying.to_bytes())?;
                }
                Ok(Self {
                    dir: dir.to_path_buf(),
                    signing_key: Some(signing),
                    verifying_key: verifying,
                })
            }
            (false, true) => {
                warn!(dir = %dir.display(), "private key missing; store is verify-only");
                Ok(Self {
                    dir: dir.to_path_buf(),
                    signing_key: None,
                    verifying_key: read_public(&public_path)?,
                })
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn signing_key(&self) -> Result<&SigningKey> {
        self.signing_key
            .as_ref()
            .ok_or_else(|| WatchdogError::Crypto("private key not available".into()))
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.to_bytes())
    }
}

fn read_blob(path: &Path) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let data = Zeroizing::new(fs::read(path).map_err(|e| WatchdogError::file(path, e))?);
    if data.len() != KEY_LEN {
        return Err(WatchdogError::Crypto(format!(
            "invalid key file size for {}",
            path.display()
        )));
    }
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    out.copy_from_slice(&data);
    Ok(out)
}

fn read_private(path: &Path) -> Result<SigningKey> {
    let bytes = read_blob(path)?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn read_public(path: &Path) -> Result<VerifyingKey> {
    let bytes = read_blob(path)?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| WatchdogError::Crypto(format!("invalid public key: {e}")))
}

fn write_blob(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|e| WatchdogError::file(path, e))
}

/// Create the private key file. On unix it is created with mode 0600, so the
/// key is never readable by others, and an existing file is not replaced.
fn write_private(path: &Path, key: &SigningKey) -> Result<()> {
    let bytes = Zeroizing::new(key.to_bytes());
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| WatchdogError::file(path, e))?;
    file.write_all(&bytes[..])
        .and_then(|_| file.sync_all())
        .map_err(|e| WatchdogError::file(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileStatus;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn sample_record() -> FileRecord {
        let mut hashes = BTreeMap::new();
        hashes.insert(HashAlgorithm::Sha256, "ab".repeat(32));
        hashes.insert(HashAlgorithm::Blake3, "cd".repeat(32));
        let now = Utc::now();
        FileRecord {
            path: "/etc/app/a.conf".into(),
            hashes,
            metadata: FileMetadata {
                size: 42,
                mtime: now,
                atime: now,
                ctime: now,
                mode: 0o100644,
                file_id: 1234,
            },
            timestamp: now,
            algorithm: HashAlgorithm::Sha256,
            signature: None,
            status: FileStatus::New,
        }
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = serde_json::json!({"b": {"z": 1, "a": [ {"y": 2, "x": 1} ]}, "a": "s"});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":"s","b":{"a":[{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn test_canonical_bytes_exclude_signature_and_status() {
        let record = sample_record();
        let mut other = record.clone();
        other.signature = Some("anything".into());
        other.status = FileStatus::Modified;
        assert_eq!(
            canonical_bytes(&record).unwrap(),
            canonical_bytes(&other).unwrap()
        );
    }

    #[test]
    fn test_canonical_survives_persistence_roundtrip() {
        let record = sample_record();
        let json = serde_json::to_string_pretty(&record).unwrap();
        let back: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(
            canonical_bytes(&record).unwrap(),
            canonical_bytes(&back).unwrap()
        );
    }

    #[test]
    fn test_sign_then_verify() {
        let (sk, vk) = generate_keypair();
        let mut record = sample_record();
        let sig = sign(&record, &sk).unwrap();
        assert!(verify(&record, &sig, &vk));
        record.signature = Some(sig);
        assert!(check_record(&record, &vk).is_ok());
    }

    #[test]
    fn test_mutated_fields_fail_verification() {
        let (sk, vk) = generate_keypair();
        let record = sample_record();
        let sig = sign(&record, &sk).unwrap();

        let mut m = record.clone();
        m.path.push('x');
        assert!(!verify(&m, &sig, &vk));

        let mut m = record.clone();
        m.hashes.insert(HashAlgorithm::Sha256, "00".repeat(32));
        assert!(!verify(&m, &sig, &vk));

        let mut m = record.clone();
        m.metadata.size += 1;
        assert!(!verify(&m, &sig, &vk));

        let mut m = record.clone();
        m.metadata.mode = 0o100777;
        assert!(!verify(&m, &sig, &vk));

        let mut m = record.clone();
        m.timestamp = m.timestamp + chrono::Duration::seconds(1);
        assert!(!verify(&m, &sig, &vk));

        let mut m = record.clone();
        m.algorithm = HashAlgorithm::Blake3;
        assert!(!verify(&m, &sig, &vk));
    }

    #[test]
    fn test_malformed_signatures_are_not_verified() {
        let (sk, vk) = generate_keypair();
        let record = sample_record();
        let sig = sign(&record, &sk).unwrap();

        assert!(!verify(&record, "", &vk));
        assert!(!verify(&record, "!!not-base64!!", &vk));
        assert!(!verify(&record, &sig[..20], &vk));
        assert!(matches!(
            check_signature(&record, "AAAA", &vk),
            Err(SignatureFailure::WrongLength(3))
        ));

        let (_, other_vk) = generate_keypair();
        assert_eq!(
            check_signature(&record, &sig, &other_vk),
            Err(SignatureFailure::Mismatch)
        );
        assert_eq!(check_record(&record, &vk), Err(SignatureFailure::Missing));
    }

    #[test]
    fn test_key_creation_and_persistence() {
        let dir = tempdir().unwrap();
        let store = KeyStore::load_or_create(dir.path()).unwrap();
        assert!(dir.path().join(PRIVATE_KEY_FILE).exists());
        assert!(dir.path().join(PUBLIC_KEY_FILE).exists());
        let first = store.signing_key().unwrap().to_bytes();

        let reloaded = KeyStore::load_or_create(dir.path()).unwrap();
        assert_eq!(reloaded.signing_key().unwrap().to_bytes(), first);
        assert_eq!(reloaded.public_key_hex(), store.public_key_hex());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_created_owner_only_under_open_umask() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let previous = unsafe { libc::umask(0) };
        let created = KeyStore::load_or_create(dir.path());
        unsafe { libc::umask(previous) };
        created.unwrap();

        let mode = fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o077, 0, "group/other bits set: {:o}", mode & 0o777);
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_private_key_never_overwritten() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PRIVATE_KEY_FILE);
        fs::write(&path, b"existing").unwrap();
        let (signing, _) = generate_keypair();
        assert!(write_private(&path, &signing).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"existing");
    }

    #[test]
    fn test_public_key_regenerated_from_private() {
        let dir = tempdir().unwrap();
        let store = KeyStore::load_or_create(dir.path()).unwrap();
        let hex_before = store.public_key_hex();
        fs::remove_file(dir.path().join(PUBLIC_KEY_FILE)).unwrap();

        let store = KeyStore::load_or_create(dir.path()).unwrap();
        assert_eq!(store.public_key_hex(), hex_before);
        assert!(dir.path().join(PUBLIC_KEY_FILE).exists());
    }

    #[test]
    fn test_verify_only_store() {
        let dir = tempdir().unwrap();
        KeyStore::load_or_create(dir.path()).unwrap();
        fs::remove_file(dir.path().join(PRIVATE_KEY_FILE)).unwrap();

        let store = KeyStore::load_or_create(dir.path()).unwrap();
        assert!(matches!(store.signing_key(), Err(WatchdogError::Crypto(_))));
    }

    #[test]
    fn test_truncated_key_file_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(PRIVATE_KEY_FILE), b"short").unwrap();
        assert!(matches!(
            KeyStore::load_or_create(dir.path()),
            Err(WatchdogError::Crypto(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_sign_verify_roundtrip(
            path in "/[a-z]{1,12}/[a-z0-9_.]{1,16}",
            size in any::<u64>(),
            mode in any::<u32>(),
            file_id in any::<u64>(),
            digest in "[0-9a-f]{64}",
        ) {
            let (sk, vk) = generate_keypair();
            let mut record = sample_record();
            record.path = path;
            record.metadata.size = size;
            record.metadata.mode = mode;
            record.metadata.file_id = file_id;
            record.hashes.insert(HashAlgorithm::Sha256, digest);

            let sig = sign(&record, &sk).unwrap();
            record.signature = Some(sig.clone());

            let json = serde_json::to_string(&record).unwrap();
            let restored: FileRecord = serde_json::from_str(&json).unwrap();
            prop_assert!(verify(&restored, &sig, &vk));

            let mut tampered = restored.clone();
            tampered.metadata.size = size.wrapping_add(1);
            prop_assert!(!verify(&tampered, &sig, &vk));
        }

        #[test]
        fn prop_canonical_json_independent_of_insertion_order(
            entries in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..12)
        ) {
            let forward: serde_json::Map<String, Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(*v)))
                .collect();
            let reverse: serde_json::Map<String, Value> = entries
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), Value::from(*v)))
                .collect();
            prop_assert_eq!(
                canonical_json(&Value::Object(forward)),
                canonical_json(&Value::Object(reverse))
            );
        }
    }
}
