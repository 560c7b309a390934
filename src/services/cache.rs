use crate::models::ProfileModel;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur with cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Cache miss: {0}")]
    CacheMiss(String),
}

/// Two-tier store for extracted profiles
///
/// L1 is an in-process moka cache. L2 is Redis when configured, which lets
/// several API instances see the same uploaded resumes.
pub struct CacheManager {
    redis: Option<Arc<tokio::sync::Mutex<ConnectionManager>>>,
    l1_cache: moka::future::Cache<String, Vec<u8>>,
    ttl_secs: u64,
}

impl CacheManager {
    /// Create a cache backed by Redis
    pub async fn new(redis_url: &str, l1_size: u64, ttl_secs: u64) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let redis = redis::aio::ConnectionManager::new(client).await?;

        Ok(Self {
            redis: Some(Arc::new(tokio::sync::Mutex::new(redis))),
            l1_cache: Self::build_l1(l1_size, ttl_secs),
            ttl_secs,
        })
    }

    /// Create a process-local cache with no Redis tier
    pub fn in_memory(l1_size: u64, ttl_secs: u64) -> Self {
        Self {
            redis: None,
            l1_cache: Self::build_l1(l1_size, ttl_secs),
            ttl_secs,
        }
    }

    fn build_l1(l1_size: u64, ttl_secs: u64) -> moka::future::Cache<String, Vec<u8>> {
        moka::future::CacheBuilder::new(l1_size)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build()
    }

    pub fn has_redis(&self) -> bool {
        self.redis.is_some()
    }

    /// Get a value from cache (L1 first, then L2)
    pub async fn get<T>(&self, key: &str) -> Result<T, CacheError>
    where
        T: for<'de> Deserialize<'de>,
    {
        if let Some(bytes) = self.l1_cache.get(key).await {
            tracing::trace!("L1 cache hit: {}", key);
            return Ok(serde_json::from_slice(&bytes)?);
        }

        if let Some(redis) = &self.redis {
            let mut conn = redis.lock().await;
            let value: Option<String> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut *conn)
                .await?;
            drop(conn);

            if let Some(json) = value {
                tracing::trace!("L2 cache hit: {}", key);
                self.l1_cache.insert(key.to_string(), json.as_bytes().to_vec()).await;
                return Ok(serde_json::from_str(&json)?);
            }
        }

        tracing::trace!("Cache miss: {}", key);
        Err(CacheError::CacheMiss(key.to_string()))
    }

    /// Set a value in every configured tier
    pub async fn set<T>(&self, key: &str, value: &T) -> Result<(), CacheError>
    where
        T: Serialize,
    {
        let json = serde_json::to_string(value)?;
        self.l1_cache.insert(key.to_string(), json.as_bytes().to_vec()).await;

        if let Some(redis) = &self.redis {
            let mut conn = redis.lock().await;
            redis::cmd("SETEX")
                .arg(key)
                .arg(self.ttl_secs)
                .arg(json)
                .query_async::<()>(&mut *conn)
                .await?;
        }

        tracing::trace!("Cache set: {}", key);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.l1_cache.invalidate(key).await;

        if let Some(redis) = &self.redis {
            let mut conn = redis.lock().await;
            redis::cmd("DEL")
                .arg(key)
                .query_async::<()>(&mut *conn)
                .await?;
        }
        Ok(())
    }

    pub async fn put_profile(&self, profile: &ProfileModel) -> Result<(), CacheError> {
        self.set(&CacheKey::profile(&profile.resume_id), profile).await
    }

    /// Look up an uploaded profile; a miss returns `Ok(None)`
    pub async fn get_profile(&self, resume_id: &str) -> Result<Option<ProfileModel>, CacheError> {
        match self.get(&CacheKey::profile(resume_id)).await {
            Ok(profile) => Ok(Some(profile)),
            Err(CacheError::CacheMiss(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn health_check(&self) -> bool {
        match &self.redis {
            Some(redis) => {
                let mut conn = redis.lock().await;
                redis::cmd("PING")
                    .query_async::<String>(&mut *conn)
                    .await
                    .is_ok()
            }
            None => true,
        }
    }
}

/// Cache key builder
pub struct CacheKey;

impl CacheKey {
    /// Key for an extracted resume profile
    pub fn profile(resume_id: &str) -> String {
        format!("profile:{}", resume_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Skill;

    fn profile() -> ProfileModel {
        ProfileModel {
            resume_id: "resume_abc".to_string(),
            skills: vec![Skill::new("Rust", 1.0)],
            seniority: None,
            location_preferences: Default::default(),
            desired_compensation: None,
        }
    }

    #[tokio::test]
    async fn test_in_memory_profile_round_trip() {
        let cache = CacheManager::in_memory(100, 60);
        assert!(!cache.has_redis());
        assert!(cache.get_profile("resume_abc").await.unwrap().is_none());

        cache.put_profile(&profile()).await.unwrap();
        let stored = cache.get_profile("resume_abc").await.unwrap().unwrap();
        assert_eq!(stored.skills[0].token, "rust");

        cache.delete(&CacheKey::profile("resume_abc")).await.unwrap();
        assert!(cache.get_profile("resume_abc").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_redis_cache_set_get() {
        let cache = CacheManager::new("redis://127.0.0.1:6379", 1000, 60)
            .await
            .expect("Failed to create cache");

        cache.set("test_key", &"test_value").await.unwrap();
        let result: String = cache.get("test_key").await.unwrap();
        assert_eq!(result, "test_value");

        cache.delete("test_key").await.unwrap();
        assert!(cache.get::<String>("test_key").await.is_err());
    }

    #[test]
    fn test_cache_key_builder() {
        assert_eq!(CacheKey::profile("resume_1"), "profile:resume_1");
    }
}
