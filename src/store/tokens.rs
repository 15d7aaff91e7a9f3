use chrono::NaiveDateTime;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::models::{TestType, TokenRecord};
use crate::secrets::SecretIndex;
use crate::store::TokenError;

/// Record a freshly minted token inside the transaction that claimed its
/// code, so a claim without a token record cannot be observed.
#[allow(clippy::too_many_arguments)]
pub async fn insert_tx(
    tx: &mut Transaction<'static, Postgres>,
    secrets: &SecretIndex,
    token_id: Uuid,
    realm_id: i64,
    test_type: TestType,
    symptom_interval: Option<i64>,
    subject: &str,
    issued_at: NaiveDateTime,
    expires_at: NaiveDateTime,
) -> Result<(), sqlx::Error> {
    let token_hmac = secrets.index_token(&token_id.to_string());
    sqlx::query(
        "INSERT INTO tokens
         (token_id, token_hmac, realm_id, test_type, symptom_interval, subject,
          issued_at, expires_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(token_id)
    .bind(&token_hmac)
    .bind(realm_id)
    .bind(test_type)
    .bind(symptom_interval)
    .bind(subject)
    .bind(issued_at)
    .bind(expires_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Atomically consume a token for Certify. Succeeds iff the token exists in
/// the realm, is unexpired, unused, and the subject asserted now is
/// byte-for-byte the subject recorded at verify time.
pub async fn claim(
    pool: &PgPool,
    secrets: &SecretIndex,
    token_id: &str,
    realm_id: i64,
    expected_subject: &str,
    now: NaiveDateTime,
) -> Result<(), TokenError> {
    let hmacs = secrets.index_token_all(token_id);

    let mut tx = pool.begin().await?;
    let token = sqlx::query_as::<_, TokenRecord>(
        "SELECT * FROM tokens
         WHERE realm_id = $1 AND token_hmac = ANY($2)
         FOR UPDATE",
    )
    .bind(realm_id)
    .bind(&hmacs)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(TokenError::NotFound)?;

    if token.used {
        return Err(TokenError::Used);
    }
    if now >= token.expires_at {
        return Err(TokenError::Expired);
    }
    if token.subject != expected_subject {
        return Err(TokenError::MetadataMismatch);
    }

    sqlx::query("UPDATE tokens SET used = TRUE, used_at = $1 WHERE id = $2")
        .bind(now)
        .bind(token.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(realm_id, token_id = %token.token_id, "token claimed");
    Ok(())
}
