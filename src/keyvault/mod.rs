use anyhow::{anyhow, Result};
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use p256::ecdsa::VerifyingKey;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config;
use crate::models::{KeyPurpose, Realm, SigningKey};

pub mod kms;

use kms::{Kms, KmsError};

/// Resolved signing key reference: which KMS version signs and the `kid`
/// embedded in the signed header.
#[derive(Debug, Clone)]
pub struct SignerRef {
    pub kid: String,
    pub kms_key_version: String,
}

/// Certificate signer with the claim policy the minted artifact carries.
#[derive(Debug, Clone)]
pub struct CertificateSigner {
    pub signer: SignerRef,
    pub issuer: String,
    pub audience: String,
    pub duration_secs: i64,
}

struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

impl<T: Clone> Cached<T> {
    fn new(value: T) -> Self {
        Cached {
            value,
            fetched_at: Instant::now(),
        }
    }

    fn fresh(&self, ttl: Duration) -> Option<T> {
        if self.fetched_at.elapsed() < ttl {
            Some(self.value.clone())
        } else {
            None
        }
    }
}

/// Signer and public-key resolution over the KMS, with bounded-TTL caches.
/// Signer handles are cached by `(realm, purpose)`; public keys are cached
/// by `kid` because signed artifacts carry `kid`, not a realm reference.
pub struct KeyVault {
    kms: Arc<dyn Kms>,
    signer_cache: DashMap<(i64, KeyPurpose), Cached<SignerRef>>,
    public_key_cache: DashMap<String, Cached<VerifyingKey>>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    signer_ttl: Duration,
    public_key_ttl: Duration,
}

impl KeyVault {
    pub fn new(kms: Arc<dyn Kms>) -> Self {
        let settings = config::get_settings();
        KeyVault {
            kms,
            signer_cache: DashMap::new(),
            public_key_cache: DashMap::new(),
            inflight: DashMap::new(),
            signer_ttl: Duration::from_secs(settings.signer_cache_ttl_secs),
            public_key_ttl: Duration::from_secs(settings.public_key_cache_ttl_secs),
        }
    }

    pub fn kms(&self) -> &Arc<dyn Kms> {
        &self.kms
    }

    /// Sign with a bounded retry on transient KMS failures. Never falls back
    /// to cached private material.
    pub async fn sign(&self, key_version: &str, message: &[u8]) -> Result<Vec<u8>, KmsError> {
        let mut attempts = 0;
        loop {
            match self.kms.sign(key_version, message).await {
                Ok(sig) => return Ok(sig),
                Err(e) if e.is_transient() && attempts < 2 => {
                    attempts += 1;
                    warn!(attempt = attempts, "transient KMS sign failure, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * attempts as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The system token signer. Tokens are always signed with the
    /// system-wide key; `kid` comes from configuration.
    pub async fn token_signer(&self) -> Result<SignerRef> {
        let settings = config::get_settings();
        if let Some(cached) = self.signer_cache.get(&(0, KeyPurpose::Token)) {
            if let Some(signer) = cached.fresh(self.signer_ttl) {
                return Ok(signer);
            }
        }
        let signer = SignerRef {
            kid: settings.token_signing_key_id.clone(),
            kms_key_version: settings.token_signing_key.clone(),
        };
        self.signer_cache
            .insert((0, KeyPurpose::Token), Cached::new(signer.clone()));
        Ok(signer)
    }

    /// Resolve the certificate signer for a realm: the realm's active
    /// signing key when it owns its keys, the system key otherwise.
    pub async fn certificate_signer(
        &self,
        pool: &PgPool,
        realm: &Realm,
    ) -> Result<CertificateSigner> {
        let settings = config::get_settings();
        let signer = if realm.use_realm_certificate_key {
            self.realm_signer(pool, realm.id, KeyPurpose::Certificate)
                .await?
        } else {
            SignerRef {
                kid: settings.certificate_signing_key_id.clone(),
                kms_key_version: settings.certificate_signing_key.clone(),
            }
        };

        let issuer = if realm.certificate_issuer.is_empty() {
            settings.certificate_issuer.clone()
        } else {
            realm.certificate_issuer.clone()
        };
        let audience = if realm.certificate_audience.is_empty() {
            settings.certificate_audience.clone()
        } else {
            realm.certificate_audience.clone()
        };
        let duration_secs = if realm.certificate_duration_secs > 0 {
            realm.certificate_duration_secs
        } else {
            settings.certificate_duration_secs
        };

        Ok(CertificateSigner {
            signer,
            issuer,
            audience,
            duration_secs,
        })
    }

    async fn realm_signer(
        &self,
        pool: &PgPool,
        realm_id: i64,
        purpose: KeyPurpose,
    ) -> Result<SignerRef> {
        let cache_key = (realm_id, purpose);
        if let Some(cached) = self.signer_cache.get(&cache_key) {
            if let Some(signer) = cached.fresh(self.signer_ttl) {
                return Ok(signer);
            }
        }

        let flight_key = format!("signer:{}:{}", realm_id, purpose.as_str());
        let guard = self.flight_guard(&flight_key);
        let _lock = guard.lock().await;

        // Another task may have refreshed while we waited.
        if let Some(cached) = self.signer_cache.get(&cache_key) {
            if let Some(signer) = cached.fresh(self.signer_ttl) {
                return Ok(signer);
            }
        }

        let row = sqlx::query_as::<_, SigningKey>(
            "SELECT * FROM signing_keys
             WHERE realm_id = $1 AND purpose = $2 AND state = 'active'",
        )
        .bind(realm_id)
        .bind(purpose)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow!("realm {} has no active {} key", realm_id, purpose.as_str()))?;

        let signer = SignerRef {
            kid: row.kid,
            kms_key_version: row.kms_key_version,
        };
        self.signer_cache
            .insert(cache_key, Cached::new(signer.clone()));
        Ok(signer)
    }

    /// Public key for a `kid`, from cache or via a single upstream fetch per
    /// missing key. On a fetch failure a not-yet-evicted cache entry keeps
    /// serving readers.
    pub async fn public_key(&self, pool: &PgPool, kid: &str) -> Result<VerifyingKey> {
        if let Some(cached) = self.public_key_cache.get(kid) {
            if let Some(key) = cached.fresh(self.public_key_ttl) {
                return Ok(key);
            }
        }

        let flight_key = format!("pk:{}", kid);
        let guard = self.flight_guard(&flight_key);
        let _lock = guard.lock().await;

        if let Some(cached) = self.public_key_cache.get(kid) {
            if let Some(key) = cached.fresh(self.public_key_ttl) {
                return Ok(key);
            }
        }

        let key_version = self.key_version_for_kid(pool, kid).await?;
        match self.kms.public_key(&key_version).await {
            Ok(key) => {
                self.public_key_cache
                    .insert(kid.to_string(), Cached::new(key));
                Ok(key)
            }
            Err(e) => {
                // Stale entries are acceptable for verification.
                if let Some(stale) = self.public_key_cache.get(kid) {
                    warn!(kid, error = %e, "public key refresh failed, serving stale entry");
                    return Ok(stale.value.clone());
                }
                Err(e.into())
            }
        }
    }

    async fn key_version_for_kid(&self, pool: &PgPool, kid: &str) -> Result<String> {
        let settings = config::get_settings();
        if kid == settings.token_signing_key_id {
            return Ok(settings.token_signing_key.clone());
        }
        if kid == settings.certificate_signing_key_id {
            return Ok(settings.certificate_signing_key.clone());
        }

        // Retired keys stay resolvable so outstanding artifacts verify
        // until their natural expiry.
        let version: Option<String> = sqlx::query_scalar(
            "SELECT kms_key_version FROM signing_keys
             WHERE kid = $1 AND state IN ('active', 'retired')",
        )
        .bind(kid)
        .fetch_optional(pool)
        .await?;

        version.ok_or_else(|| anyhow!("unknown kid"))
    }

    fn flight_guard(&self, key: &str) -> Arc<Mutex<()>> {
        self.inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a new pending key version for a realm.
    pub async fn new_key_version(
        &self,
        pool: &PgPool,
        realm_id: i64,
        purpose: KeyPurpose,
    ) -> Result<SigningKey> {
        let parent = format!("realms/{}/{}", realm_id, purpose.as_str());
        let version = self.kms.create_key_version(&parent).await?;
        let kid = format!(
            "r{}-{}-{}",
            realm_id,
            purpose.as_str(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let row = sqlx::query_as::<_, SigningKey>(
            "INSERT INTO signing_keys (realm_id, purpose, kms_key_version, kid, state, created_at)
             VALUES ($1, $2, $3, $4, 'pending', NOW())
             RETURNING *",
        )
        .bind(realm_id)
        .bind(purpose)
        .bind(&version)
        .bind(&kid)
        .fetch_one(pool)
        .await?;

        Ok(row)
    }

    /// Rotate the realm's key for a purpose: new version goes
    /// `pending -> active`, the previous active goes `active -> retired`.
    pub async fn rotate(
        &self,
        pool: &PgPool,
        realm_id: i64,
        purpose: KeyPurpose,
    ) -> Result<SigningKey> {
        let pending = self.new_key_version(pool, realm_id, purpose).await?;

        let mut tx = pool.begin().await?;
        sqlx::query(
            "UPDATE signing_keys SET state = 'retired', retired_at = NOW()
             WHERE realm_id = $1 AND purpose = $2 AND state = 'active'",
        )
        .bind(realm_id)
        .bind(purpose)
        .execute(&mut *tx)
        .await?;

        let active = sqlx::query_as::<_, SigningKey>(
            "UPDATE signing_keys SET state = 'active', activated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(pending.id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        self.signer_cache.remove(&(realm_id, purpose));
        info!(realm_id, purpose = purpose.as_str(), kid = %active.kid, "rotated signing key");
        Ok(active)
    }

    /// One idempotent scheduler pass over every realm that owns its
    /// certificate keys. A realm is eligible when it has no active key or
    /// the active key is older than the rotation interval.
    pub async fn rotation_tick(&self, pool: &PgPool) -> Result<usize> {
        let settings = config::get_settings();
        let realm_ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM realms WHERE use_realm_certificate_key")
                .fetch_all(pool)
                .await?;

        let mut rotated = 0;
        for realm_id in realm_ids {
            let active = sqlx::query_as::<_, SigningKey>(
                "SELECT * FROM signing_keys
                 WHERE realm_id = $1 AND purpose = 'certificate' AND state = 'active'",
            )
            .bind(realm_id)
            .fetch_optional(pool)
            .await?;

            let eligible = match &active {
                None => true,
                Some(key) => {
                    let activated = key.activated_at.unwrap_or(key.created_at);
                    let age = Utc::now().naive_utc() - activated;
                    age.num_seconds() > settings.key_rotation_interval_secs
                }
            };

            if eligible {
                self.rotate(pool, realm_id, KeyPurpose::Certificate).await?;
                rotated += 1;
            }
        }
        Ok(rotated)
    }

    /// Warm the system signer entries so the health check has something to
    /// report before the first request arrives.
    pub async fn prime(&self, pool: &PgPool) -> Result<()> {
        let token = self.token_signer().await?;
        self.public_key(pool, &token.kid).await?;

        let settings = config::get_settings();
        self.signer_cache.insert(
            (0, KeyPurpose::Certificate),
            Cached::new(SignerRef {
                kid: settings.certificate_signing_key_id.clone(),
                kms_key_version: settings.certificate_signing_key.clone(),
            }),
        );
        Ok(())
    }

    /// Health gate: at least one signer cache entry within TTL.
    pub fn has_valid_signer(&self) -> bool {
        self.signer_cache
            .iter()
            .any(|entry| entry.fetched_at.elapsed() < self.signer_ttl)
    }
}

static KEYVAULT: OnceCell<KeyVault> = OnceCell::new();

/// Initialize the global key vault. The backend is in-process unless a
/// cloud KMS is wired in at deploy time.
pub fn init_keyvault() -> Result<()> {
    init_keyvault_with(Arc::new(kms::InMemoryKms::new()))
}

pub fn init_keyvault_with(kms: Arc<dyn Kms>) -> Result<()> {
    if KEYVAULT.get().is_some() {
        return Ok(());
    }
    KEYVAULT.set(KeyVault::new(kms)).ok();
    info!("Key vault initialized");
    Ok(())
}

pub fn get_keyvault() -> &'static KeyVault {
    KEYVAULT.get().expect("Key vault not initialized")
}
