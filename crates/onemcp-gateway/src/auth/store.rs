//! File-backed session/token store.
//!
//! One JSON file per record under `<configDir>/sessions/`, named
//! `<prefix><id>.json`. Records carry their own expiry; expired records are
//! rejected on read and swept opportunistically. When an encryption key is
//! configured, payloads are sealed with AES-256-GCM (hex(nonce‖ct‖tag) on
//! disk); the 32-byte key is derived from the operator passphrase with
//! scrypt and a fixed salt.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::auth::{AuthContext, ServerAuthProvider};
use crate::error::GatewayError;

/// Key-derivation salt. Changing it invalidates every sealed record.
const KDF_SALT: &[u8] = b"1mcp-salt";
/// AES-256 key size.
const KEY_SIZE: usize = 32;
/// AES-GCM nonce size.
const NONCE_SIZE: usize = 12;

/// Record families, with their filename prefixes and TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Session,
    AuthCode,
    AuthRequest,
    Token,
}

impl RecordKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RecordKind::Session => "sess_",
            RecordKind::AuthCode => "code_",
            RecordKind::AuthRequest => "req_",
            RecordKind::Token => "tok_",
        }
    }

    pub fn ttl(&self) -> Duration {
        match self {
            RecordKind::Session => Duration::from_secs(24 * 60 * 60),
            RecordKind::AuthCode => Duration::from_secs(60),
            RecordKind::AuthRequest => Duration::from_secs(10 * 60),
            RecordKind::Token => Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    created_at: u64,
    expires_at: u64,
    value: serde_json::Value,
}

/// Claims payload of a `Token` record.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenRecord {
    pub subject: String,
    pub scopes: Vec<String>,
}

struct FieldCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl FieldCipher {
    fn from_passphrase(passphrase: &str) -> Result<Self, GatewayError> {
        let mut derived = [0u8; KEY_SIZE];
        let params = scrypt::Params::new(15, 8, 1, KEY_SIZE)
            .map_err(|e| GatewayError::Internal(format!("scrypt params: {e}")))?;
        scrypt::scrypt(passphrase.as_bytes(), KDF_SALT, &params, &mut derived)
            .map_err(|e| GatewayError::Internal(format!("key derivation failed: {e}")))?;

        let unbound = UnboundKey::new(&AES_256_GCM, &derived)
            .map_err(|_| GatewayError::Internal("failed to create encryption key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    fn seal(&self, plaintext: &str) -> Result<String, GatewayError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| GatewayError::Internal("failed to generate nonce".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| GatewayError::Internal("encryption failed".into()))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&in_out);
        Ok(hex::encode(result))
    }

    fn open(&self, ciphertext_hex: &str) -> Result<String, GatewayError> {
        let ciphertext = hex::decode(ciphertext_hex)
            .map_err(|_| GatewayError::Internal("invalid hex in stored record".into()))?;
        if ciphertext.len() < NONCE_SIZE + AES_256_GCM.tag_len() {
            return Err(GatewayError::Internal("stored record too short".into()));
        }

        let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_SIZE);
        let nonce_array: [u8; NONCE_SIZE] = nonce_bytes
            .try_into()
            .map_err(|_| GatewayError::Internal("invalid nonce".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_array);

        let mut in_out = encrypted.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| GatewayError::Internal("decryption failed".into()))?;
        String::from_utf8(plaintext.to_vec())
            .map_err(|_| GatewayError::Internal("decrypted record is not UTF-8".into()))
    }
}

/// The session/token store.
pub struct TokenStore {
    dir: PathBuf,
    cipher: Option<FieldCipher>,
}

impl TokenStore {
    /// Open (and create) the store under `<config_dir>/sessions/`.
    /// `encryption_key` enables sealing at rest.
    pub fn open(config_dir: &Path, encryption_key: Option<&str>) -> Result<Self, GatewayError> {
        let dir = config_dir.join("sessions");
        std::fs::create_dir_all(&dir)
            .map_err(|e| GatewayError::Internal(format!("cannot create {}: {e}", dir.display())))?;
        let cipher = encryption_key
            .map(FieldCipher::from_passphrase)
            .transpose()?;
        Ok(Self { dir, cipher })
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}.json", kind.prefix(), id))
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Persist a record with the kind's TTL.
    pub fn put(
        &self,
        kind: RecordKind,
        id: &str,
        value: serde_json::Value,
    ) -> Result<(), GatewayError> {
        let now = Self::now();
        let record = StoredRecord {
            created_at: now,
            expires_at: now + kind.ttl().as_secs(),
            value,
        };
        let json = serde_json::to_string(&record)
            .map_err(|e| GatewayError::Internal(format!("serialize record: {e}")))?;
        let contents = match &self.cipher {
            Some(cipher) => cipher.seal(&json)?,
            None => json,
        };
        let path = self.record_path(kind, id);
        std::fs::write(&path, contents)
            .map_err(|e| GatewayError::Internal(format!("write {}: {e}", path.display())))?;
        debug!(path = %path.display(), "stored record");
        Ok(())
    }

    /// Read a record; expired or unreadable records yield `None`.
    pub fn get(&self, kind: RecordKind, id: &str) -> Option<serde_json::Value> {
        let path = self.record_path(kind, id);
        let raw = std::fs::read_to_string(&path).ok()?;
        let json = match &self.cipher {
            Some(cipher) => match cipher.open(&raw) {
                Ok(json) => json,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable sealed record");
                    return None;
                }
            },
            None => raw,
        };
        let record: StoredRecord = serde_json::from_str(&json).ok()?;
        if record.expires_at <= Self::now() {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        Some(record.value)
    }

    pub fn delete(&self, kind: RecordKind, id: &str) {
        let _ = std::fs::remove_file(self.record_path(kind, id));
    }

    /// Remove every expired record. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            let json = match &self.cipher {
                Some(cipher) => match cipher.open(&raw) {
                    Ok(json) => json,
                    Err(_) => continue,
                },
                None => raw,
            };
            let Ok(record) = serde_json::from_str::<StoredRecord>(&json) else {
                continue;
            };
            if record.expires_at <= Self::now() && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Store a bearer token's claims. The filename carries a digest of the
    /// token, never the token itself.
    pub fn put_token(&self, token: &str, record: &TokenRecord) -> Result<(), GatewayError> {
        let value = serde_json::to_value(record)
            .map_err(|e| GatewayError::Internal(format!("serialize token record: {e}")))?;
        self.put(RecordKind::Token, &Self::token_id(token), value)
    }

    fn token_id(token: &str) -> String {
        let digest = Sha256::digest(token.as_bytes());
        hex::encode(&digest[..16])
    }
}

#[async_trait]
impl ServerAuthProvider for TokenStore {
    async fn validate_bearer(&self, token: &str) -> Result<AuthContext, GatewayError> {
        let value = self
            .get(RecordKind::Token, &Self::token_id(token))
            .ok_or_else(|| GatewayError::Unauthenticated("unknown or expired token".into()))?;
        let record: TokenRecord = serde_json::from_value(value)
            .map_err(|_| GatewayError::Unauthenticated("malformed token record".into()))?;
        Ok(AuthContext {
            subject: record.subject,
            scopes: record.scopes.into_iter().collect::<BTreeSet<_>>(),
            expires_at: SystemTime::now() + RecordKind::Token.ttl(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_roundtrip_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path(), None).unwrap();
        store
            .put(RecordKind::Session, "abc", json!({"client": "x"}))
            .unwrap();
        let value = store.get(RecordKind::Session, "abc").unwrap();
        assert_eq!(value["client"], "x");

        assert!(dir.path().join("sessions").join("sess_abc.json").exists());
    }

    #[test]
    fn sealed_records_roundtrip_and_resist_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path(), Some("passphrase-a")).unwrap();
        store
            .put(RecordKind::Token, "t1", json!({"subject": "s", "scopes": []}))
            .unwrap();
        assert!(store.get(RecordKind::Token, "t1").is_some());

        // On-disk form is hex, not JSON.
        let raw =
            std::fs::read_to_string(dir.path().join("sessions").join("tok_t1.json")).unwrap();
        assert!(!raw.contains("subject"));

        let wrong = TokenStore::open(dir.path(), Some("passphrase-b")).unwrap();
        assert!(wrong.get(RecordKind::Token, "t1").is_none());
    }

    #[tokio::test]
    async fn validates_stored_bearer_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path(), None).unwrap();
        store
            .put_token(
                "my-secret-token",
                &TokenRecord {
                    subject: "client-7".into(),
                    scopes: vec!["mcp:tools".into(), "tag:db".into()],
                },
            )
            .unwrap();

        let ctx = store.validate_bearer("my-secret-token").await.unwrap();
        assert_eq!(ctx.subject, "client-7");
        assert!(ctx.has_scope("mcp:tools"));
        assert!(ctx.has_scope("tag:db"));

        assert!(store.validate_bearer("other-token").await.is_err());
    }

    #[test]
    fn kind_prefixes_and_ttls() {
        assert_eq!(RecordKind::Session.prefix(), "sess_");
        assert_eq!(RecordKind::AuthCode.ttl(), Duration::from_secs(60));
        assert_eq!(RecordKind::AuthRequest.ttl(), Duration::from_secs(600));
        assert_eq!(RecordKind::Token.ttl(), Duration::from_secs(86400));
    }
}
