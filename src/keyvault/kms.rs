use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use dashmap::DashMap;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("kms key not found: {0}")]
    KeyNotFound(String),
    #[error("kms transient failure: {0}")]
    Transient(String),
    #[error("kms invalid input: {0}")]
    Invalid(String),
}

impl KmsError {
    /// Transient failures may be retried a bounded number of times; callers
    /// must never fall back to cached private key material.
    pub fn is_transient(&self) -> bool {
        matches!(self, KmsError::Transient(_))
    }
}

/// Capability surface of the external key-management service. Asymmetric
/// keys sign ES256 (IEEE-P1363 `R || S`); the symmetric operations envelope
/// secret database columns.
#[async_trait]
pub trait Kms: Send + Sync {
    /// Create a new key version under `parent`, returning its resource name.
    async fn create_key_version(&self, parent: &str) -> Result<String, KmsError>;

    /// Sign `message` with the named key version. Returns the 64-byte
    /// `R || S` signature, each component left-zero-padded.
    async fn sign(&self, key_version: &str, message: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Fetch the public half of the named key version.
    async fn public_key(&self, key_version: &str) -> Result<VerifyingKey, KmsError>;

    /// Authenticated encryption under the named symmetric key.
    async fn encrypt(&self, key: &str, plaintext: &[u8], aad: &[u8])
        -> Result<Vec<u8>, KmsError>;

    async fn decrypt(
        &self,
        key: &str,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, KmsError>;
}

/// In-process backend used by tests and single-node development. Key
/// material is provisioned on first use and retained per handle.
#[derive(Default)]
pub struct InMemoryKms {
    signing_keys: DashMap<String, SigningKey>,
    symmetric_keys: DashMap<String, [u8; 32]>,
    version_counters: DashMap<String, u64>,
    fail_transient: AtomicBool,
}

impl InMemoryKms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a transient error. Test hook for
    /// the fail-fast path.
    pub fn set_fail_transient(&self, fail: bool) {
        self.fail_transient.store(fail, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), KmsError> {
        if self.fail_transient.load(Ordering::SeqCst) {
            return Err(KmsError::Transient("kms unavailable".to_string()));
        }
        Ok(())
    }

    fn signing_key(&self, name: &str) -> SigningKey {
        self.signing_keys
            .entry(name.to_string())
            .or_insert_with(|| SigningKey::random(&mut rand::rngs::OsRng))
            .clone()
    }

    fn symmetric_key(&self, name: &str) -> [u8; 32] {
        *self.symmetric_keys.entry(name.to_string()).or_insert_with(|| {
            let mut key = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key);
            key
        })
    }
}

#[async_trait]
impl Kms for InMemoryKms {
    async fn create_key_version(&self, parent: &str) -> Result<String, KmsError> {
        self.check_available()?;
        let mut counter = self.version_counters.entry(parent.to_string()).or_insert(0);
        *counter += 1;
        let name = format!("{}/versions/{}", parent, *counter);
        self.signing_keys
            .insert(name.clone(), SigningKey::random(&mut rand::rngs::OsRng));
        Ok(name)
    }

    async fn sign(&self, key_version: &str, message: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.check_available()?;
        let key = self.signing_key(key_version);
        let signature: Signature = key.sign(message);
        Ok(signature.to_bytes().to_vec())
    }

    async fn public_key(&self, key_version: &str) -> Result<VerifyingKey, KmsError> {
        self.check_available()?;
        let key = self.signing_key(key_version);
        Ok(VerifyingKey::from(&key))
    }

    async fn encrypt(
        &self,
        key: &str,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        self.check_available()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.symmetric_key(key)));
        let mut nonce = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| KmsError::Invalid("encryption failed".to_string()))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    async fn decrypt(
        &self,
        key: &str,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        self.check_available()?;
        if ciphertext.len() < 12 {
            return Err(KmsError::Invalid("ciphertext too short".to_string()));
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.symmetric_key(key)));
        let (nonce, body) = ciphertext.split_at(12);
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad })
            .map_err(|_| KmsError::Invalid("decryption failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;

    #[tokio::test]
    async fn sign_produces_p1363_signature() {
        let kms = InMemoryKms::new();
        let sig = kms.sign("k1", b"payload").await.unwrap();
        assert_eq!(sig.len(), 64);

        let public = kms.public_key("k1").await.unwrap();
        let parsed = Signature::from_slice(&sig).unwrap();
        assert!(public.verify(b"payload", &parsed).is_ok());
    }

    #[tokio::test]
    async fn key_versions_are_distinct() {
        let kms = InMemoryKms::new();
        let v1 = kms.create_key_version("realms/1/certificate").await.unwrap();
        let v2 = kms.create_key_version("realms/1/certificate").await.unwrap();
        assert_ne!(v1, v2);

        let p1 = kms.public_key(&v1).await.unwrap();
        let p2 = kms.public_key(&v2).await.unwrap();
        assert_ne!(
            p1.to_encoded_point(false).as_bytes(),
            p2.to_encoded_point(false).as_bytes()
        );
    }

    #[tokio::test]
    async fn encrypt_round_trip_binds_aad() {
        let kms = InMemoryKms::new();
        let ct = kms.encrypt("db", b"+15555550100", b"realm:1").await.unwrap();
        assert_ne!(ct, b"+15555550100");

        let pt = kms.decrypt("db", &ct, b"realm:1").await.unwrap();
        assert_eq!(pt, b"+15555550100");

        assert!(kms.decrypt("db", &ct, b"realm:2").await.is_err());
    }

    #[tokio::test]
    async fn transient_failures_are_classified() {
        let kms = InMemoryKms::new();
        kms.set_fail_transient(true);
        let err = kms.sign("k1", b"payload").await.unwrap_err();
        assert!(err.is_transient());
    }
}
