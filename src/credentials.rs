//! Credential vault
//!
//! Per-user exchange API keys are stored AES-256-GCM encrypted; plaintext
//! exists only for the duration of a single request.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::db::Db;

const NONCE_LEN: usize = 12;

/// Decrypted exchange credentials for one user.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

/// Outcome of a vault lookup.
#[derive(Debug)]
pub enum CredentialStatus {
    Ready(Credentials),
    NotConfigured,
    Inactive,
}

pub struct CredentialVault {
    db: Db,
    /// None when no encryption key is configured; lookups then fail per
    /// user instead of crashing the engine.
    key: Option<[u8; 32]>,
}

impl CredentialVault {
    pub fn new(db: Db, key_hex: &str) -> Result<Self> {
        if key_hex.trim().is_empty() {
            return Ok(Self { db, key: None });
        }
        let bytes = hex::decode(key_hex.trim()).context("ENCRYPTION_KEY is not valid hex")?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("ENCRYPTION_KEY must be 32 bytes (64 hex chars)"))?;
        Ok(Self { db, key: Some(key) })
    }

    fn key(&self) -> Result<&[u8; 32]> {
        self.key
            .as_ref()
            .ok_or_else(|| anyhow!("ENCRYPTION_KEY is not configured"))
    }

    /// Encrypt a secret for storage: base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key()?));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = BASE64.decode(encoded.trim()).context("bad base64")?;
        if raw.len() <= NONCE_LEN {
            bail!("ciphertext too short");
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key()?));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("decryption failed (wrong key or corrupt data)"))?;
        String::from_utf8(plaintext).context("decrypted secret is not utf-8")
    }

    /// Fetch and decrypt one user's credentials.
    pub fn get(&self, user_id: &str) -> Result<CredentialStatus> {
        let row = match self.db.get_api_keys(user_id)? {
            Some(row) => row,
            None => return Ok(CredentialStatus::NotConfigured),
        };
        if !row.is_active {
            return Ok(CredentialStatus::Inactive);
        }
        Ok(CredentialStatus::Ready(Credentials {
            api_key: self.decrypt(&row.api_key_enc)?,
            secret: self.decrypt(&row.secret_enc)?,
            passphrase: self.decrypt(&row.passphrase_enc)?,
        }))
    }

    /// Encrypt and store credentials for a user (key import path).
    pub fn store(&self, user_id: &str, creds: &Credentials) -> Result<()> {
        self.db.upsert_api_keys(
            user_id,
            &self.encrypt(&creds.api_key)?,
            &self.encrypt(&creds.secret)?,
            &self.encrypt(&creds.passphrase)?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        let db = Db::open_in_memory().unwrap();
        CredentialVault::new(db, &"ab".repeat(32)).unwrap()
    }

    #[test]
    fn round_trips_a_secret() {
        let v = vault();
        let enc = v.encrypt("bg_secret_key_123").unwrap();
        assert_ne!(enc, "bg_secret_key_123");
        assert_eq!(v.decrypt(&enc).unwrap(), "bg_secret_key_123");
    }

    #[test]
    fn distinct_nonces_give_distinct_ciphertexts() {
        let v = vault();
        let a = v.encrypt("same").unwrap();
        let b = v.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let v = vault();
        let enc = v.encrypt("secret").unwrap();
        let db = Db::open_in_memory().unwrap();
        let other = CredentialVault::new(db, &"cd".repeat(32)).unwrap();
        assert!(other.decrypt(&enc).is_err());
    }

    #[test]
    fn store_and_get_through_db() {
        let db = Db::open_in_memory().unwrap();
        let v = CredentialVault::new(db, &"ab".repeat(32)).unwrap();
        v.store(
            "user-1",
            &Credentials {
                api_key: "key".into(),
                secret: "sec".into(),
                passphrase: "pass".into(),
            },
        )
        .unwrap();

        match v.get("user-1").unwrap() {
            CredentialStatus::Ready(c) => {
                assert_eq!(c.api_key, "key");
                assert_eq!(c.secret, "sec");
                assert_eq!(c.passphrase, "pass");
            }
            other => panic!("expected ready credentials, got {other:?}"),
        }

        match v.get("nobody").unwrap() {
            CredentialStatus::NotConfigured => {}
            other => panic!("expected not configured, got {other:?}"),
        }
    }
}
