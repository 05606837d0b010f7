use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

/// Cached billing state goes stale fast; five minutes balances offline
/// usability against serving outdated entitlements.
pub const CACHE_TTL: Duration = Duration::minutes(5);

pub const ENTITLEMENTS_CACHE_KEY: &str = "entitlements_cache";
pub const TOKEN_BALANCE_CACHE_KEY: &str = "token_balance_cache";

/// Wrapper persisted around every cached payload. The `user_id` scope check
/// is what prevents a newly signed-in user from reading the previous
/// account's entitlements off the same device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    /// Unix seconds at write time.
    pub timestamp: i64,
    pub user_id: Uuid,
}

/// Durable key-value backing for the cache store. Write failures are
/// non-fatal: the caller keeps working from in-memory state.
pub trait Storage: Send + Sync {
    fn read(&self, key: &str) -> Option<String>;
    fn write(&self, key: &str, value: &str) -> bool;
    fn remove(&self, key: &str);
}

/// One JSON file per key under a directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn write(&self, key: &str, value: &str) -> bool {
        if let Err(err) = std::fs::create_dir_all(&self.dir) {
            warn!(?err, dir = %self.dir.display(), "failed to create cache directory");
            return false;
        }
        match std::fs::write(self.path_for(key), value) {
            Ok(()) => true,
            Err(err) => {
                warn!(?err, key, "failed to persist cache entry");
                false
            }
        }
    }

    fn remove(&self, key: &str) {
        let _ = std::fs::remove_file(self.path_for(key));
    }
}

/// Non-durable backing used by tests and as the fallback when no cache
/// directory is available.
#[derive(Default)]
pub struct MemoryStorage {
    map: DashMap<String, String>,
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    fn write(&self, key: &str, value: &str) -> bool {
        self.map.insert(key.to_string(), value.to_string());
        true
    }

    fn remove(&self, key: &str) {
        self.map.remove(key);
    }
}

/// TTL-bounded, user-scoped cache over a `Storage` backing. Reads purge
/// anything missing, malformed, expired, or scoped to another user.
pub struct CacheStore {
    storage: Arc<dyn Storage>,
    ttl: Duration,
}

impl CacheStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            ttl: CACHE_TTL,
        }
    }

    pub fn with_ttl(storage: Arc<dyn Storage>, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str, user_id: Uuid) -> Option<T> {
        let raw = self.storage.read(key)?;
        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(?err, key, "purging malformed cache entry");
                self.storage.remove(key);
                return None;
            }
        };

        if entry.user_id != user_id {
            debug!(key, "purging cache entry scoped to another user");
            self.storage.remove(key);
            return None;
        }

        let age = OffsetDateTime::now_utc().unix_timestamp() - entry.timestamp;
        if age >= self.ttl.whole_seconds() {
            debug!(key, age, "purging expired cache entry");
            self.storage.remove(key);
            return None;
        }

        Some(entry.data)
    }

    pub fn set<T: Serialize>(&self, key: &str, data: &T, user_id: Uuid) {
        let entry = CacheEntry {
            data,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            user_id,
        };
        match serde_json::to_string(&entry) {
            Ok(raw) => {
                // A failed write is non-fatal; the caller continues with
                // whatever it holds in memory.
                let _ = self.storage.write(key, &raw);
            }
            Err(err) => warn!(?err, key, "failed to serialize cache entry"),
        }
    }

    pub fn clear(&self, keys: &[&str]) {
        for key in keys {
            self.storage.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::entitlement::TokenBalances;

    fn memory_store() -> (Arc<MemoryStorage>, CacheStore) {
        let storage = Arc::new(MemoryStorage::default());
        let store = CacheStore::new(storage.clone() as Arc<dyn Storage>);
        (storage, store)
    }

    #[test]
    fn set_then_get_round_trips_within_ttl() {
        let (_, store) = memory_store();
        let user = Uuid::new_v4();
        let balances = TokenBalances {
            ai_tokens: 5,
            export_tokens: 1,
            streak_shields: 0,
        };

        store.set(TOKEN_BALANCE_CACHE_KEY, &balances, user);
        let cached: TokenBalances = store.get(TOKEN_BALANCE_CACHE_KEY, user).unwrap();
        assert_eq!(cached, balances);
    }

    #[test]
    fn expired_entries_are_purged() {
        let storage = Arc::new(MemoryStorage::default());
        let store =
            CacheStore::with_ttl(storage.clone() as Arc<dyn Storage>, Duration::seconds(0));
        let user = Uuid::new_v4();
        store.set("k_cache", &42_i64, user);

        assert_eq!(store.get::<i64>("k_cache", user), None);
        assert!(storage.read("k_cache").is_none());
    }

    #[test]
    fn entries_for_another_user_are_invisible_and_purged() {
        let (storage, store) = memory_store();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        store.set("k_cache", &1_i64, alice);

        assert_eq!(store.get::<i64>("k_cache", bob), None);
        // conservative: the other account's entry is gone entirely
        assert!(storage.read("k_cache").is_none());
    }

    #[test]
    fn malformed_entries_are_purged() {
        let (storage, store) = memory_store();
        storage.write("k_cache", "not json at all");
        assert_eq!(store.get::<i64>("k_cache", Uuid::new_v4()), None);
        assert!(storage.read("k_cache").is_none());
    }

    #[test]
    fn clear_removes_named_keys() {
        let (storage, store) = memory_store();
        let user = Uuid::new_v4();
        store.set(ENTITLEMENTS_CACHE_KEY, &1_i64, user);
        store.set(TOKEN_BALANCE_CACHE_KEY, &2_i64, user);

        store.clear(&[ENTITLEMENTS_CACHE_KEY, TOKEN_BALANCE_CACHE_KEY]);
        assert!(storage.read(ENTITLEMENTS_CACHE_KEY).is_none());
        assert!(storage.read(TOKEN_BALANCE_CACHE_KEY).is_none());
    }

    #[test]
    fn file_storage_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path()));
        let store = CacheStore::new(storage as Arc<dyn Storage>);
        let user = Uuid::new_v4();

        store.set(ENTITLEMENTS_CACHE_KEY, &"payload".to_string(), user);
        let cached: String = store.get(ENTITLEMENTS_CACHE_KEY, user).unwrap();
        assert_eq!(cached, "payload");
    }
}
