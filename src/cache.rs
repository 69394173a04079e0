//! Persistent cache for computed metrics, keyed by target and date range.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::date_util::DateRange;
use crate::error::Result;
use crate::storage::repository;
use crate::storage::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Repository,
    User,
    Team,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Repository => "repository",
            MetricType::User => "user",
            MetricType::Team => "team",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub metric_type: MetricType,
    pub target_id: String,
    pub start_date: String,
    pub end_date: String,
}

impl CacheKey {
    pub fn new(metric_type: MetricType, target_id: &str, range: &DateRange) -> Self {
        Self {
            metric_type,
            target_id: target_id.to_string(),
            start_date: range.start_key(),
            end_date: range.end_key(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.metric_type.as_str(),
            self.target_id,
            self.start_date,
            self.end_date
        )
    }
}

/// Metric results stored in `metric_cache` with a fixed time-to-live.
#[derive(Clone)]
pub struct MetricCache {
    db: Database,
    ttl: Duration,
}

impl MetricCache {
    pub fn new(db: Database, ttl: std::time::Duration) -> Self {
        Self {
            db,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(1)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached value, or `None` when missing, expired or unreadable.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        let rendered = key.to_string();
        let row = self
            .db
            .reader()
            .call(move |conn| repository::get_cache_entry(conn, &rendered))
            .await?;
        let Some(row) = row else {
            log::debug!("Cache miss: {key}");
            return Ok(None);
        };

        let expired = DateTime::parse_from_rfc3339(&row.expires_at)
            .map(|at| Utc::now() > at.with_timezone(&Utc))
            .unwrap_or(true);
        if expired {
            log::debug!("Cache expired: {key}");
            return Ok(None);
        }

        match serde_json::from_str(&row.data) {
            Ok(value) => {
                log::debug!("Cache hit: {key}");
                Ok(Some(value))
            }
            Err(e) => {
                log::warn!("Discarding unreadable cache entry {key}: {e}");
                Ok(None)
            }
        }
    }

    pub async fn put<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> {
        self.put_with_expiry(key, value, Utc::now() + self.ttl).await
    }

    pub async fn put_with_expiry<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let data = serde_json::to_string(value)?;
        let key = key.clone();
        self.db
            .writer()
            .call(move |conn| {
                repository::put_cache_entry(
                    conn,
                    &key.to_string(),
                    key.metric_type.as_str(),
                    &key.target_id,
                    &key.start_date,
                    &key.end_date,
                    &data,
                    &expires_at,
                )
            })
            .await?;
        Ok(())
    }

    /// Drop every cached range for one target.
    pub async fn invalidate_target(&self, metric_type: MetricType, target_id: &str) -> Result<usize> {
        let target_id = target_id.to_string();
        let removed = self
            .db
            .writer()
            .call(move |conn| {
                repository::delete_cache_for_target(conn, metric_type.as_str(), &target_id)
            })
            .await?;
        Ok(removed)
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let removed = self
            .db
            .writer()
            .call(move |conn| repository::purge_expired_cache(conn, &now))
            .await?;
        if removed > 0 {
            log::info!("Purged {removed} expired cache entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        commits: u64,
    }

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        )
        .unwrap()
    }

    async fn cache() -> MetricCache {
        let db = Database::open_memory().await.unwrap();
        MetricCache::new(db, std::time::Duration::from_secs(3600))
    }

    #[test]
    fn test_key_format() {
        let key = CacheKey::new(MetricType::Repository, "api", &range());
        assert_eq!(key.to_string(), "repository:api:2024-01-01:2024-01-31");
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = cache().await;
        let key = CacheKey::new(MetricType::User, "a@example.com", &range());
        assert_eq!(cache.get::<Sample>(&key).await.unwrap(), None);

        cache.put(&key, &Sample { commits: 4 }).await.unwrap();
        assert_eq!(
            cache.get::<Sample>(&key).await.unwrap(),
            Some(Sample { commits: 4 })
        );

        // Last writer wins
        cache.put(&key, &Sample { commits: 9 }).await.unwrap();
        assert_eq!(cache.get::<Sample>(&key).await.unwrap().unwrap().commits, 9);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = cache().await;
        let key = CacheKey::new(MetricType::Team, "platform", &range());
        cache
            .put_with_expiry(&key, &Sample { commits: 1 }, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(cache.get::<Sample>(&key).await.unwrap(), None);

        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_target() {
        let cache = cache().await;
        let jan = CacheKey::new(MetricType::Repository, "api", &range());
        let other = CacheKey::new(MetricType::Repository, "web", &range());
        cache.put(&jan, &Sample { commits: 1 }).await.unwrap();
        cache.put(&other, &Sample { commits: 2 }).await.unwrap();

        assert_eq!(cache.invalidate_target(MetricType::Repository, "api").await.unwrap(), 1);
        assert_eq!(cache.get::<Sample>(&jan).await.unwrap(), None);
        assert!(cache.get::<Sample>(&other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_a_miss() {
        let cache = cache().await;
        let key = CacheKey::new(MetricType::User, "x", &range());
        cache.put(&key, &"not a sample").await.unwrap();
        assert_eq!(cache.get::<Sample>(&key).await.unwrap(), None);
    }
}
