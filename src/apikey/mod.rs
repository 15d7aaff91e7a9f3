use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};

use crate::config;
use crate::models::{ApiKey, ApiKeyType, Realm};
use crate::secrets::SecretIndex;

#[derive(Debug, Error)]
pub enum ApiKeyError {
    #[error("api key rejected")]
    Unauthorized,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A freshly generated key. The plaintext is shown once and never stored.
#[derive(Debug)]
pub struct GeneratedKey {
    pub plaintext: String,
    pub signature_hmac: String,
    pub storage_hmac: String,
}

/// Generate an API key for a realm.
///
/// Plaintext layout: `<prefix><random>.<realm_id>.<signature>`. The
/// signature is the HMAC the caller echoes back; the storage HMAC indexes
/// the record without the database ever holding the plaintext.
pub fn generate(secrets: &SecretIndex, realm_id: i64) -> GeneratedKey {
    let settings = config::get_settings();
    let random_part = hex::encode(rand::random::<[u8; 32]>());
    let base = format!("{}{}.{}", settings.api_key_prefix, random_part, realm_id);
    let (signature_hmac, storage_hmac) = secrets.index_api_key(&base);

    GeneratedKey {
        plaintext: format!("{}.{}", base, signature_hmac),
        signature_hmac,
        storage_hmac,
    }
}

/// Persist a generated key.
pub async fn create(
    pool: &PgPool,
    secrets: &SecretIndex,
    realm_id: i64,
    key_type: ApiKeyType,
    name: &str,
) -> Result<(String, ApiKey), sqlx::Error> {
    let generated = generate(secrets, realm_id);
    let row = sqlx::query_as::<_, ApiKey>(
        "INSERT INTO api_keys (realm_id, key_type, signature_hmac, storage_hmac, name)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING *",
    )
    .bind(realm_id)
    .bind(key_type)
    .bind(&generated.signature_hmac)
    .bind(&generated.storage_hmac)
    .bind(name)
    .fetch_one(pool)
    .await?;

    Ok((generated.plaintext, row))
}

/// Authorize an `X-API-Key` value: check the echoed signature against the
/// signature key-set, then resolve the record by storage HMAC and load its
/// realm. Signature and lookup use independent key-sets so a database
/// reader cannot forge keys.
pub async fn authorize(
    pool: &PgPool,
    secrets: &SecretIndex,
    provided: &str,
) -> Result<(ApiKey, Realm), ApiKeyError> {
    let (base, signature) = match provided.rsplit_once('.') {
        Some(parts) => parts,
        None => return Err(ApiKeyError::Unauthorized),
    };

    let valid_signature = secrets
        .api_key_signatures(base)
        .iter()
        .any(|expected| constant_time_str_eq(expected, signature));
    if !valid_signature {
        return Err(ApiKeyError::Unauthorized);
    }

    let storage_hmacs = secrets.api_key_storage_all(base);
    let key = sqlx::query_as::<_, ApiKey>(
        "SELECT * FROM api_keys WHERE storage_hmac = ANY($1)",
    )
    .bind(&storage_hmacs)
    .fetch_optional(pool)
    .await?
    .ok_or(ApiKeyError::Unauthorized)?;

    if key.disabled {
        warn!(api_key_id = key.id, realm_id = key.realm_id, "disabled api key used");
        return Err(ApiKeyError::Unauthorized);
    }

    let realm = sqlx::query_as::<_, Realm>("SELECT * FROM realms WHERE id = $1")
        .bind(key.realm_id)
        .fetch_optional(pool)
        .await?
        .ok_or(ApiKeyError::Unauthorized)?;

    // Best-effort usage timestamp.
    sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
        .bind(key.id)
        .execute(pool)
        .await
        .ok();

    info!(api_key_id = key.id, realm_id = realm.id, "api key authorized");
    Ok((key, realm))
}

fn constant_time_str_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::helpers::secret_index_fixture;

    #[test]
    fn generated_key_carries_echoable_signature() {
        let secrets = secret_index_fixture();
        let key = generate(&secrets, 7);

        let (base, signature) = key.plaintext.rsplit_once('.').unwrap();
        assert!(base.ends_with(".7"));
        assert_eq!(signature, key.signature_hmac);
        assert!(secrets
            .api_key_signatures(base)
            .contains(&signature.to_string()));
        assert!(secrets
            .api_key_storage_all(base)
            .contains(&key.storage_hmac));
    }

    #[test]
    fn forged_signature_does_not_match() {
        let secrets = secret_index_fixture();
        let key = generate(&secrets, 7);
        let (base, _) = key.plaintext.rsplit_once('.').unwrap();

        let forged = hex::encode([0u8; 32]);
        assert!(!secrets
            .api_key_signatures(base)
            .iter()
            .any(|expected| constant_time_str_eq(expected, &forged)));
    }
}
