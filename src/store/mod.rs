use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use once_cell::sync::OnceCell;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use crate::config;
use crate::keyvault::kms::KmsError;

pub mod codes;
pub mod tokens;

static CODE_CACHE: OnceCell<ConnectionManager> = OnceCell::new();

/// Redis connection used for the issuance fingerprint cache.
pub async fn init_code_cache() -> Result<()> {
    if CODE_CACHE.get().is_some() {
        return Ok(());
    }
    let settings = config::get_settings();
    let client = redis::Client::open(settings.redis_url.as_str())?;
    let conn = ConnectionManager::new(client).await?;
    CODE_CACHE.set(conn).ok();
    info!("Code cache initialized");
    Ok(())
}

pub fn get_code_cache() -> &'static ConnectionManager {
    CODE_CACHE.get().expect("Code cache not initialized")
}

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("bad symptom date: {0}")]
    BadSymptomDate(String),
    #[error("symptom date too old")]
    SymptomTooOld,
    #[error("code not found")]
    NotFound,
    #[error("code expired")]
    Expired,
    #[error("code already claimed")]
    AlreadyClaimed,
    #[error("test type not accepted")]
    TestTypeNotAccepted,
    #[error("nonce mismatch")]
    NonceMismatch,
    #[error("code collision not resolved")]
    Collision,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token not found")]
    NotFound,
    #[error("token expired")]
    Expired,
    #[error("token already used")]
    Used,
    #[error("token metadata mismatch")]
    MetadataMismatch,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Lazily destroy codes and tokens once past their expiry plus the grace
/// window. Runs on a periodic background tick.
pub async fn sweep(
    pool: &PgPool,
    now: NaiveDateTime,
    grace_secs: i64,
) -> Result<(u64, u64), sqlx::Error> {
    let cutoff = now - Duration::seconds(grace_secs);

    let codes = sqlx::query("DELETE FROM codes WHERE long_expires_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?
        .rows_affected();

    let tokens = sqlx::query("DELETE FROM tokens WHERE expires_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?
        .rows_affected();

    if codes > 0 || tokens > 0 {
        info!(codes, tokens, "swept expired records");
    }
    Ok((codes, tokens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::helpers::{cleanup_db, create_test_realm, issue_code, setup};
    use chrono::Utc;
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn sweep_removes_only_records_past_grace() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("sweep").await;
        let pool = crate::database::get_db();
        let live = issue_code(&realm, None).await;
        let doomed = issue_code(&realm, None).await;

        // Push one code a week past its long expiry.
        sqlx::query(
            "UPDATE codes SET short_expires_at = NOW() - INTERVAL '8 days',
                              long_expires_at = NOW() - INTERVAL '7 days'
             WHERE uuid = $1",
        )
        .bind(doomed.uuid)
        .execute(pool)
        .await
        .unwrap();

        let (codes, _) = sweep(pool, Utc::now().naive_utc(), 86400).await.unwrap();
        assert_eq!(codes, 1);

        let remaining: Vec<uuid::Uuid> =
            sqlx::query_scalar("SELECT uuid FROM codes WHERE realm_id = $1")
                .bind(realm.id)
                .fetch_all(pool)
                .await
                .unwrap();
        assert_eq!(remaining, vec![live.uuid]);

        cleanup_db().await;
    }
}
