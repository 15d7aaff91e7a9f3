use anyhow::{anyhow, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use once_cell::sync::OnceCell;
use sha2::Sha256;
use tracing::info;

use crate::config;

type HmacSha256 = Hmac<Sha256>;

/// An ordered list of HMAC keys. The first entry signs new values; every
/// entry is accepted on lookup, so prepending a key is a rotation and
/// removing the last entry orphans anything still indexed under it.
#[derive(Debug, Clone)]
pub struct KeySet {
    keys: Vec<Vec<u8>>,
}

impl KeySet {
    /// Parse a comma-separated list of base64 keys.
    pub fn parse(raw: &str) -> Result<Self> {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut keys = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let key = engine
                .decode(part)
                .map_err(|e| anyhow!("invalid base64 HMAC key: {}", e))?;
            if key.len() < 16 {
                return Err(anyhow!("HMAC key too short: {} bytes", key.len()));
            }
            keys.push(key);
        }
        if keys.is_empty() {
            return Err(anyhow!("HMAC key-set is empty"));
        }
        Ok(KeySet { keys })
    }

    /// HMAC under the current (first) key, hex encoded.
    pub fn index(&self, plaintext: &[u8]) -> String {
        mac_hex(&self.keys[0], plaintext)
    }

    /// HMACs under every key in the set, newest first. Used for lookups so
    /// records indexed under a rotated-out-of-front key are still found.
    pub fn index_all(&self, plaintext: &[u8]) -> Vec<String> {
        self.keys.iter().map(|k| mac_hex(k, plaintext)).collect()
    }

    #[cfg(test)]
    pub fn from_keys(keys: Vec<Vec<u8>>) -> Self {
        KeySet { keys }
    }
}

fn mac_hex(key: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Deterministic, non-reversible indexes for codes, tokens, API keys, and
/// the cache/limiter identifiers. A reader of the backing store or cache
/// sees only HMACs, never plaintext.
pub struct SecretIndex {
    code_keys: KeySet,
    token_keys: KeySet,
    apikey_signature_keys: KeySet,
    apikey_database_keys: KeySet,
    cache_keys: KeySet,
    rate_limit_keys: KeySet,
}

impl SecretIndex {
    #[cfg(test)]
    pub fn from_keysets(
        code_keys: KeySet,
        token_keys: KeySet,
        apikey_signature_keys: KeySet,
        apikey_database_keys: KeySet,
        cache_keys: KeySet,
        rate_limit_keys: KeySet,
    ) -> Self {
        SecretIndex {
            code_keys,
            token_keys,
            apikey_signature_keys,
            apikey_database_keys,
            cache_keys,
            rate_limit_keys,
        }
    }

    pub fn from_settings(settings: &config::Settings) -> Result<Self> {
        Ok(SecretIndex {
            code_keys: KeySet::parse(&settings.db_verification_code_database_key)
                .map_err(|e| anyhow!("DB_VERIFICATION_CODE_DATABASE_KEY: {}", e))?,
            token_keys: KeySet::parse(&settings.db_token_database_key)
                .map_err(|e| anyhow!("DB_TOKEN_DATABASE_KEY: {}", e))?,
            apikey_signature_keys: KeySet::parse(&settings.db_apikey_signature_key)
                .map_err(|e| anyhow!("DB_APIKEY_SIGNATURE_KEY: {}", e))?,
            apikey_database_keys: KeySet::parse(&settings.db_apikey_database_key)
                .map_err(|e| anyhow!("DB_APIKEY_DATABASE_KEY: {}", e))?,
            cache_keys: KeySet::parse(&settings.cache_hmac_key)
                .map_err(|e| anyhow!("CACHE_HMAC_KEY: {}", e))?,
            rate_limit_keys: KeySet::parse(&settings.rate_limit_hmac_key)
                .map_err(|e| anyhow!("RATE_LIMIT_HMAC_KEY: {}", e))?,
        })
    }

    pub fn index_code(&self, plaintext: &str) -> String {
        self.code_keys.index(plaintext.as_bytes())
    }

    pub fn index_code_all(&self, plaintext: &str) -> Vec<String> {
        self.code_keys.index_all(plaintext.as_bytes())
    }

    pub fn index_token(&self, token_id: &str) -> String {
        self.token_keys.index(token_id.as_bytes())
    }

    pub fn index_token_all(&self, token_id: &str) -> Vec<String> {
        self.token_keys.index_all(token_id.as_bytes())
    }

    /// The API key plaintext is HMACed twice: the signature the caller must
    /// echo inside the key, and the storage index used for lookup.
    pub fn index_api_key(&self, plaintext: &str) -> (String, String) {
        (
            self.apikey_signature_keys.index(plaintext.as_bytes()),
            self.apikey_database_keys.index(plaintext.as_bytes()),
        )
    }

    pub fn api_key_signatures(&self, plaintext: &str) -> Vec<String> {
        self.apikey_signature_keys.index_all(plaintext.as_bytes())
    }

    pub fn api_key_storage_all(&self, plaintext: &str) -> Vec<String> {
        self.apikey_database_keys.index_all(plaintext.as_bytes())
    }

    pub fn cache_key(&self, scope: &str) -> String {
        self.cache_keys.index(scope.as_bytes())
    }

    pub fn rate_limit_key(&self, scope: &str) -> String {
        self.rate_limit_keys.index(scope.as_bytes())
    }
}

static SECRET_INDEX: OnceCell<SecretIndex> = OnceCell::new();

pub fn init_secrets() -> Result<()> {
    if SECRET_INDEX.get().is_some() {
        return Ok(());
    }
    let index = SecretIndex::from_settings(config::get_settings())?;
    init_secrets_with(index)
}

pub fn init_secrets_with(index: SecretIndex) -> Result<()> {
    if SECRET_INDEX.get().is_some() {
        return Ok(());
    }
    SECRET_INDEX.set(index).ok();
    info!("Secret index initialized");
    Ok(())
}

pub fn get_secrets() -> &'static SecretIndex {
    SECRET_INDEX.get().expect("Secret index not initialized")
}
