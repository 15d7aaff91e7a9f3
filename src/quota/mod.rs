use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use sqlx::PgPool;
use tracing::info;

use crate::models::Realm;

/// Daily issuance quota, one counter per `(realm, UTC calendar day)`.
///
/// The reservation is a single conditional upsert so two racing issuers
/// cannot both pass the limit; the in-process cache only fast-rejects
/// realms already known to be exhausted.
pub struct QuotaStore {
    pool: &'static PgPool,
    cache: DashMap<i64, (NaiveDate, i64)>,
}

impl QuotaStore {
    pub fn new(pool: &'static PgPool) -> Self {
        QuotaStore {
            pool,
            cache: DashMap::new(),
        }
    }

    /// Reserve one unit of today's quota. Returns false when the realm is
    /// over its limit.
    pub async fn take(&self, realm: &Realm, now: NaiveDateTime) -> Result<bool, sqlx::Error> {
        if realm.daily_quota <= 0 {
            return Ok(true);
        }
        let day = now.date();

        if let Some(entry) = self.cache.get(&realm.id) {
            let (cached_day, count) = *entry;
            if cached_day == day && count >= realm.daily_quota {
                return Ok(false);
            }
        }

        let count: Option<i64> = sqlx::query_scalar(
            "INSERT INTO quota_counters (realm_id, day, count) VALUES ($1, $2, 1)
             ON CONFLICT (realm_id, day)
             DO UPDATE SET count = quota_counters.count + 1
             WHERE quota_counters.count < $3
             RETURNING count",
        )
        .bind(realm.id)
        .bind(day)
        .bind(realm.daily_quota)
        .fetch_optional(self.pool)
        .await?;

        match count {
            Some(count) => {
                self.cache.insert(realm.id, (day, count));
                Ok(true)
            }
            None => {
                self.cache.insert(realm.id, (day, realm.daily_quota));
                Ok(false)
            }
        }
    }

    /// Return a reservation when issuance failed downstream; a failed issue
    /// never consumes quota.
    pub async fn release(&self, realm_id: i64, now: NaiveDateTime) -> Result<(), sqlx::Error> {
        let day = now.date();
        sqlx::query(
            "UPDATE quota_counters SET count = GREATEST(count - 1, 0)
             WHERE realm_id = $1 AND day = $2",
        )
        .bind(realm_id)
        .bind(day)
        .execute(self.pool)
        .await?;

        if let Some(mut entry) = self.cache.get_mut(&realm_id) {
            if entry.0 == day && entry.1 > 0 {
                entry.1 -= 1;
            }
        }
        Ok(())
    }
}

static QUOTA: OnceCell<QuotaStore> = OnceCell::new();

pub fn init_quota(pool: &'static PgPool) -> Result<()> {
    if QUOTA.get().is_some() {
        return Ok(());
    }
    QUOTA.set(QuotaStore::new(pool)).ok();
    info!("Quota store initialized");
    Ok(())
}

pub fn get_quota() -> &'static QuotaStore {
    QUOTA.get().expect("Quota store not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::helpers::{cleanup_db, create_test_realm, reload_realm, setup};
    use chrono::{Duration, Utc};
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn concurrent_takes_never_exceed_the_limit() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("quota-race").await;
        sqlx::query("UPDATE realms SET daily_quota = 3 WHERE id = $1")
            .bind(realm.id)
            .execute(crate::database::get_db())
            .await
            .unwrap();
        let realm = reload_realm(realm.id).await;

        let quota = get_quota();
        let now = Utc::now().naive_utc();
        let (a, b, c, d) = tokio::join!(
            quota.take(&realm, now),
            quota.take(&realm, now),
            quota.take(&realm, now),
            quota.take(&realm, now),
        );
        let granted = [a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()]
            .iter()
            .filter(|granted| **granted)
            .count();
        assert_eq!(granted, 3);

        // The next calendar day starts a fresh counter.
        let tomorrow = now + Duration::days(1);
        assert!(quota.take(&realm, tomorrow).await.unwrap());

        cleanup_db().await;
    }

    #[tokio::test]
    #[serial]
    async fn release_returns_a_reservation() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("quota-release").await;
        sqlx::query("UPDATE realms SET daily_quota = 1 WHERE id = $1")
            .bind(realm.id)
            .execute(crate::database::get_db())
            .await
            .unwrap();
        let realm = reload_realm(realm.id).await;

        let quota = get_quota();
        let now = Utc::now().naive_utc();

        assert!(quota.take(&realm, now).await.unwrap());
        assert!(!quota.take(&realm, now).await.unwrap());

        quota.release(realm.id, now).await.unwrap();
        assert!(quota.take(&realm, now).await.unwrap());

        cleanup_db().await;
    }

    #[tokio::test]
    #[serial]
    async fn unlimited_realms_skip_the_counter() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("quota-unlimited").await;
        let quota = get_quota();
        let now = Utc::now().naive_utc();
        for _ in 0..5 {
            assert!(quota.take(&realm, now).await.unwrap());
        }

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM quota_counters WHERE realm_id = $1")
            .bind(realm.id)
            .fetch_one(crate::database::get_db())
            .await
            .unwrap();
        assert_eq!(rows, 0);

        cleanup_db().await;
    }
}
