use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config;
use crate::keyvault::kms::Kms;
use crate::models::{Code, Realm, TestType};
use crate::secrets::SecretIndex;
use crate::store::CodeError;

const LONG_CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
const LONG_CODE_LENGTH: usize = 16;
const NONCE_LENGTH: usize = 32;

/// What the issuer asked for, after JSON validation.
#[derive(Debug, Clone)]
pub struct IssueSpec {
    pub test_type: TestType,
    pub symptom_date: Option<NaiveDate>,
    pub test_date: Option<NaiveDate>,
    pub tz_offset_minutes: i32,
    pub phone: Option<String>,
    pub external_id: Option<String>,
}

/// A freshly issued (or fingerprint-replayed) code with its plaintexts.
/// This is the only place plaintext codes exist outside the response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCode {
    pub uuid: Uuid,
    pub code: String,
    pub long_code: String,
    pub test_type: TestType,
    pub short_expires_at: NaiveDateTime,
    pub long_expires_at: NaiveDateTime,
    pub nonce: Option<Vec<u8>>,
}

/// The claimed code attributes Verify needs to mint a token.
#[derive(Debug, Clone)]
pub struct ClaimedCode {
    pub uuid: Uuid,
    pub test_type: TestType,
    pub symptom_date: Option<NaiveDate>,
    pub tz_offset_minutes: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CodeStatus {
    pub claimed: bool,
    pub short_expires_at: NaiveDateTime,
    pub long_expires_at: NaiveDateTime,
}

/// Issue a fresh code for the realm.
///
/// Validation happens here so `/api/issue` and `/api/batch-issue` share it.
/// Uniqueness collisions on the HMAC indexes retry with fresh randomness up
/// to the configured count, then fail.
pub async fn issue(
    pool: &PgPool,
    secrets: &SecretIndex,
    kms: &dyn Kms,
    realm: &Realm,
    spec: &IssueSpec,
    issuing_app_id: i64,
    now: NaiveDateTime,
) -> Result<IssuedCode, CodeError> {
    let settings = config::get_settings();

    if !realm.allows_test_type(spec.test_type) {
        return Err(CodeError::InvalidRequest(format!(
            "test type {} is not enabled for this realm",
            spec.test_type.as_str()
        )));
    }

    if let Some(symptom_date) = spec.symptom_date {
        validate_symptom_date(symptom_date, spec.tz_offset_minutes, realm, now)?;
    }

    if let Some(phone) = &spec.phone {
        if !is_e164(phone) {
            return Err(CodeError::InvalidRequest(
                "phone number must be in E.164 format".to_string(),
            ));
        }
    }

    let uuid = Uuid::new_v4();
    let short_expires_at = now + Duration::seconds(realm.code_duration_secs);
    let long_expires_at = now + Duration::seconds(realm.long_code_duration_secs);

    let nonce = if realm.use_authenticated_sms {
        let mut buf = vec![0u8; NONCE_LENGTH];
        rand::thread_rng().fill(&mut buf[..]);
        Some(buf)
    } else {
        None
    };

    let phone_encrypted = match &spec.phone {
        Some(phone) => Some(
            kms.encrypt(
                &settings.db_encryption_key,
                phone.as_bytes(),
                format!("realm:{}", realm.id).as_bytes(),
            )
            .await?,
        ),
        None => None,
    };

    for attempt in 0..=settings.collision_retry_count {
        let code = random_digits(realm.code_length as usize);
        let long_code = random_long_code();
        let short_hmac = secrets.index_code(&code);
        let long_hmac = secrets.index_code(&long_code);

        let result = sqlx::query(
            "INSERT INTO codes
             (realm_id, uuid, short_hmac, long_hmac, test_type, symptom_date, test_date,
              phone_encrypted, nonce, issuing_app_id, tz_offset_min, created_at,
              short_expires_at, long_expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(realm.id)
        .bind(uuid)
        .bind(&short_hmac)
        .bind(&long_hmac)
        .bind(spec.test_type)
        .bind(spec.symptom_date)
        .bind(spec.test_date)
        .bind(&phone_encrypted)
        .bind(&nonce)
        .bind(issuing_app_id)
        .bind(spec.tz_offset_minutes)
        .bind(now)
        .bind(short_expires_at)
        .bind(long_expires_at)
        .execute(pool)
        .await;

        match result {
            Ok(_) => {
                info!(realm_id = realm.id, code_uuid = %uuid, "issued code");
                return Ok(IssuedCode {
                    uuid,
                    code,
                    long_code,
                    test_type: spec.test_type,
                    short_expires_at,
                    long_expires_at,
                    nonce,
                });
            }
            Err(e) if is_unique_violation(&e) => {
                warn!(
                    realm_id = realm.id,
                    attempt, "code collision, regenerating"
                );
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(CodeError::Collision)
}

/// Atomically claim a code for Verify. The row lock makes the database the
/// serializer: exactly one of two racing claimants wins.
pub async fn verify_claim(
    pool: &PgPool,
    secrets: &SecretIndex,
    realm: &Realm,
    plaintext: &str,
    accept_types: &[TestType],
    nonce: Option<&[u8]>,
    now: NaiveDateTime,
) -> Result<(sqlx::Transaction<'static, sqlx::Postgres>, ClaimedCode), CodeError> {
    let hmacs = secrets.index_code_all(plaintext);

    let mut tx = pool.begin().await?;
    let code = sqlx::query_as::<_, Code>(
        "SELECT * FROM codes
         WHERE realm_id = $1 AND (short_hmac = ANY($2) OR long_hmac = ANY($2))
         FOR UPDATE",
    )
    .bind(realm.id)
    .bind(&hmacs)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(CodeError::NotFound)?;

    if code.claimed {
        return Err(CodeError::AlreadyClaimed);
    }

    // The long code stays claimable for its full window; the short code
    // only within the short TTL.
    let is_long = hmacs.contains(&code.long_hmac);
    let expires_at = if is_long {
        code.long_expires_at
    } else {
        code.short_expires_at
    };
    if now >= expires_at {
        return Err(CodeError::Expired);
    }

    if !accept_types.contains(&code.test_type) {
        return Err(CodeError::TestTypeNotAccepted);
    }

    if realm.use_authenticated_sms {
        let expected = code.nonce.as_deref().ok_or(CodeError::NonceMismatch)?;
        let provided = nonce.ok_or(CodeError::NonceMismatch)?;
        if !constant_time_eq(expected, provided) {
            return Err(CodeError::NonceMismatch);
        }
    }

    sqlx::query("UPDATE codes SET claimed = TRUE, claimed_at = $1 WHERE id = $2")
        .bind(now)
        .bind(code.id)
        .execute(&mut *tx)
        .await?;

    Ok((
        tx,
        ClaimedCode {
            uuid: code.uuid,
            test_type: code.test_type,
            symptom_date: code.symptom_date,
            tz_offset_minutes: code.tz_offset_min,
        },
    ))
}

/// Status by external UUID, for the issuing admin.
pub async fn check_status(
    pool: &PgPool,
    realm_id: i64,
    uuid: Uuid,
) -> Result<CodeStatus, CodeError> {
    sqlx::query_as::<_, CodeStatus>(
        "SELECT claimed, short_expires_at, long_expires_at FROM codes
         WHERE realm_id = $1 AND uuid = $2",
    )
    .bind(realm_id)
    .bind(uuid)
    .fetch_optional(pool)
    .await?
    .ok_or(CodeError::NotFound)
}

/// Manually expire a never-claimed code.
pub async fn expire(
    pool: &PgPool,
    realm_id: i64,
    uuid: Uuid,
    now: NaiveDateTime,
) -> Result<CodeStatus, CodeError> {
    let status = sqlx::query_as::<_, CodeStatus>(
        "UPDATE codes SET short_expires_at = $3, long_expires_at = $3
         WHERE realm_id = $1 AND uuid = $2 AND NOT claimed
         RETURNING claimed, short_expires_at, long_expires_at",
    )
    .bind(realm_id)
    .bind(uuid)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    match status {
        Some(status) => Ok(status),
        None => {
            // Distinguish a claimed code from a missing one.
            match check_status(pool, realm_id, uuid).await {
                Ok(_) => Err(CodeError::AlreadyClaimed),
                Err(CodeError::NotFound) => Err(CodeError::NotFound),
                Err(e) => Err(e),
            }
        }
    }
}

/// Issuance fingerprint for SMS-retry dedup: the same logical request
/// within the window replays the original response instead of minting a
/// second code.
pub fn fingerprint(realm_id: i64, spec: &IssueSpec) -> Option<String> {
    // Without an external id or phone there is nothing to correlate
    // retries by.
    if spec.external_id.is_none() && spec.phone.is_none() {
        return None;
    }
    Some(format!(
        "issue:{}:{}:{}:{}:{}",
        realm_id,
        spec.external_id.as_deref().unwrap_or(""),
        spec.phone.as_deref().unwrap_or(""),
        spec.test_type.as_str(),
        spec.symptom_date.map(|d| d.to_string()).unwrap_or_default(),
    ))
}

/// Look up a replayed issuance. Cache keys are HMAC-derived and values are
/// KMS-encrypted, so a cache reader recovers neither codes nor phone
/// numbers.
pub async fn fingerprint_lookup(
    redis: &ConnectionManager,
    secrets: &SecretIndex,
    kms: &dyn Kms,
    fingerprint: &str,
) -> Option<IssuedCode> {
    let settings = config::get_settings();
    let key = format!("fp:{}", secrets.cache_key(fingerprint));

    let mut conn = redis.clone();
    let encrypted: Option<Vec<u8>> = conn.get(&key).await.ok()?;
    let encrypted = encrypted.filter(|v| !v.is_empty())?;

    let plaintext = kms
        .decrypt(&settings.db_encryption_key, &encrypted, key.as_bytes())
        .await
        .ok()?;
    serde_json::from_slice(&plaintext).ok()
}

pub async fn fingerprint_store(
    redis: &ConnectionManager,
    secrets: &SecretIndex,
    kms: &dyn Kms,
    fingerprint: &str,
    issued: &IssuedCode,
) {
    let settings = config::get_settings();
    let key = format!("fp:{}", secrets.cache_key(fingerprint));

    let plaintext = match serde_json::to_vec(issued) {
        Ok(v) => v,
        Err(_) => return,
    };
    let encrypted = match kms
        .encrypt(&settings.db_encryption_key, &plaintext, key.as_bytes())
        .await
    {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to encrypt fingerprint entry");
            return;
        }
    };

    let ttl = settings.issue_fingerprint_window_secs;
    let mut conn = redis.clone();
    if let Err(e) = conn.set_ex::<_, _, ()>(&key, encrypted, ttl).await {
        warn!(error = %e, "failed to store fingerprint entry");
    }
}

fn validate_symptom_date(
    symptom_date: NaiveDate,
    tz_offset_minutes: i32,
    realm: &Realm,
    now: NaiveDateTime,
) -> Result<(), CodeError> {
    // "Today" as the client sees it, so a device just past its local
    // midnight is not rejected.
    let client_today = (now + Duration::minutes(tz_offset_minutes as i64)).date();

    if symptom_date > client_today {
        return Err(CodeError::BadSymptomDate(
            "symptom date is in the future".to_string(),
        ));
    }

    let age_days = if realm.symptom_age_days > 0 {
        realm.symptom_age_days as i64
    } else {
        config::get_settings().allowed_symptom_age_days()
    };
    let min_date = client_today - Duration::days(age_days);
    if symptom_date < min_date {
        return Err(CodeError::SymptomTooOld);
    }
    Ok(())
}

fn random_digits(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10)))
        .collect()
}

fn random_long_code() -> String {
    let mut rng = rand::thread_rng();
    (0..LONG_CODE_LENGTH)
        .map(|_| char::from(LONG_CODE_ALPHABET[rng.gen_range(0..LONG_CODE_ALPHABET.len())]))
        .collect()
}

fn is_e164(phone: &str) -> bool {
    let Some(rest) = phone.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&rest.len())
        && rest.starts_with(|c: char| ('1'..='9').contains(&c))
        && rest.chars().all(|c| c.is_ascii_digit())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
