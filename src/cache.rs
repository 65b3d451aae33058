//! Durable pose-track cache keyed by (content hash, model id).
//!
//! Entries are whole tracks; partial tracks are never written, and neither
//! are tracks that would not read back. A stored entry that no longer parses
//! or no longer matches its key is evicted on read and reported as a miss.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::db::models::{CacheKey, CachedTrackInfo, TrackStats};
use crate::db::{Database, DbError, Result};
use crate::pose::PoseTrack;

/// Storage seam for completed pose tracks. Implementations are shared
/// across sessions and must be safe to call from any thread.
pub trait PoseTrackCache: Send + Sync {
    /// Stored track for `key`, or `None` on a miss.
    fn get(&self, key: &CacheKey) -> Result<Option<PoseTrack>>;

    /// Store `track` under `key`, replacing any existing entry.
    fn put(&self, key: &CacheKey, track: &PoseTrack) -> Result<()>;

    fn evict(&self, key: &CacheKey) -> Result<bool>;

    fn clear(&self) -> Result<usize>;

    fn list_keys(&self) -> Result<Vec<CacheKey>>;
}

fn key_matches(key: &CacheKey, track: &PoseTrack) -> bool {
    track.metadata.source_video_content_hash == key.content_hash && track.metadata.model_id == key.model_id
}

/// Refuse tracks that would not read back: wrong key, bad shape, or values
/// JSON cannot carry.
fn check_put(key: &CacheKey, track: &PoseTrack) -> Result<()> {
    if !key_matches(key, track) {
        return Err(DbError::KeyMismatch(key.to_string()));
    }
    track.validate()?;
    Ok(())
}

/// Parse a stored body. `None` means the record is unusable and should be
/// evicted.
fn parse_stored(key: &CacheKey, body: &str) -> Option<PoseTrack> {
    match PoseTrack::from_json(body) {
        Ok(track) if key_matches(key, &track) => Some(track),
        Ok(_) => {
            log::warn!("Cached track {key} has mismatched metadata, evicting");
            None
        }
        Err(e) => {
            log::warn!("Cached track {key} is unreadable ({e}), evicting");
            None
        }
    }
}

/// SQLite-backed cache. Survives restarts.
pub struct SqliteCache {
    db: Mutex<Database>,
}

impl SqliteCache {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self.db.lock().map_err(|_| DbError::Poisoned)?;
        f(&db)
    }

    pub fn list(&self) -> Result<Vec<CachedTrackInfo>> {
        self.with_db(|db| db.list_pose_tracks())
    }

    pub fn stats(&self) -> Result<TrackStats> {
        self.with_db(|db| db.track_stats())
    }
}

impl PoseTrackCache for SqliteCache {
    fn get(&self, key: &CacheKey) -> Result<Option<PoseTrack>> {
        self.with_db(|db| {
            let Some(body) = db.get_pose_track_json(key)? else {
                return Ok(None);
            };
            let parsed = parse_stored(key, &body);
            if parsed.is_none() {
                db.delete_pose_track(key)?;
            }
            Ok(parsed)
        })
    }

    fn put(&self, key: &CacheKey, track: &PoseTrack) -> Result<()> {
        check_put(key, track)?;
        self.with_db(|db| db.put_pose_track(track))?;
        log::debug!("Cached {} frames for {key}", track.frames.len());
        Ok(())
    }

    fn evict(&self, key: &CacheKey) -> Result<bool> {
        self.with_db(|db| db.delete_pose_track(key))
    }

    fn clear(&self) -> Result<usize> {
        self.with_db(|db| db.clear_pose_tracks())
    }

    fn list_keys(&self) -> Result<Vec<CacheKey>> {
        self.with_db(|db| db.list_pose_track_keys())
    }
}

/// Process-local cache. Stores serialized tracks so reads go through the
/// same parse path as the durable cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<CacheKey, String>>> {
        self.entries.lock().map_err(|_| DbError::Poisoned)
    }
}

impl PoseTrackCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<PoseTrack>> {
        let mut entries = self.entries()?;
        let Some(body) = entries.get(key) else {
            return Ok(None);
        };
        let parsed = parse_stored(key, body);
        if parsed.is_none() {
            entries.remove(key);
        }
        Ok(parsed)
    }

    fn put(&self, key: &CacheKey, track: &PoseTrack) -> Result<()> {
        check_put(key, track)?;
        let body = serde_json::to_string(track)?;
        self.entries()?.insert(key.clone(), body);
        Ok(())
    }

    fn evict(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.entries()?.remove(key).is_some())
    }

    fn clear(&self) -> Result<usize> {
        let mut entries = self.entries()?;
        let n = entries.len();
        entries.clear();
        Ok(n)
    }

    fn list_keys(&self) -> Result<Vec<CacheKey>> {
        let mut keys: Vec<_> = self.entries()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::synthetic::SyntheticTrack;
    use pretty_assertions::assert_eq;

    fn sample() -> (CacheKey, PoseTrack) {
        let track = SyntheticTrack::new(2).jitter(2.0).drop_every(11).build("feedbeef", "blazepose");
        (CacheKey::new("feedbeef", "blazepose"), track)
    }

    fn caches() -> Vec<Box<dyn PoseTrackCache>> {
        vec![
            Box::new(SqliteCache::open_in_memory().unwrap()),
            Box::new(MemoryCache::new()),
        ]
    }

    #[test]
    fn test_put_then_get_is_deep_equal() {
        for cache in caches() {
            let (key, track) = sample();
            cache.put(&key, &track).unwrap();
            assert_eq!(cache.get(&key).unwrap(), Some(track));
        }
    }

    #[test]
    fn test_miss_and_clear() {
        for cache in caches() {
            let (key, track) = sample();
            assert!(cache.get(&key).unwrap().is_none());
            cache.put(&key, &track).unwrap();
            assert_eq!(cache.clear().unwrap(), 1);
            assert!(cache.get(&key).unwrap().is_none());
            assert!(cache.list_keys().unwrap().is_empty());
        }
    }

    #[test]
    fn test_put_overwrites() {
        for cache in caches() {
            let (key, first) = sample();
            let mut second = first.clone();
            second.metadata.model_version = "2".to_string();
            cache.put(&key, &first).unwrap();
            cache.put(&key, &second).unwrap();
            assert_eq!(cache.get(&key).unwrap(), Some(second));
            assert_eq!(cache.list_keys().unwrap(), vec![key]);
        }
    }

    #[test]
    fn test_evict() {
        for cache in caches() {
            let (key, track) = sample();
            cache.put(&key, &track).unwrap();
            assert!(cache.evict(&key).unwrap());
            assert!(!cache.evict(&key).unwrap());
            assert!(cache.get(&key).unwrap().is_none());
        }
    }

    #[test]
    fn test_malformed_record_is_a_miss_and_evicted() {
        let cache = SqliteCache::open_in_memory().unwrap();
        let (key, track) = sample();
        cache.put(&key, &track).unwrap();
        cache
            .with_db(|db| {
                db.conn.execute("UPDATE pose_tracks SET track_json = '{\"metadata\": 3'", [])?;
                Ok(())
            })
            .unwrap();

        assert!(cache.get(&key).unwrap().is_none());
        assert!(cache.list_keys().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_track_is_a_miss() {
        let cache = SqliteCache::open_in_memory().unwrap();
        let (key, track) = sample();
        cache.put(&key, &track).unwrap();

        // Parses, but frame_count no longer matches the frames.
        let mut broken = track.clone();
        broken.metadata.frame_count += 1;
        let body = serde_json::to_string(&broken).unwrap();
        cache
            .with_db(|db| {
                db.conn.execute("UPDATE pose_tracks SET track_json = ?1", [body])?;
                Ok(())
            })
            .unwrap();

        assert!(cache.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_non_finite_track_is_rejected_not_stored() {
        for cache in caches() {
            let (key, track) = sample();
            cache.put(&key, &track).unwrap();

            let mut bad = track.clone();
            bad.frames[0].keypoints[0].x = f64::NAN;
            assert!(matches!(cache.put(&key, &bad), Err(DbError::InvalidTrack(_))));

            // The earlier entry is untouched and still reads back.
            assert_eq!(cache.get(&key).unwrap(), Some(track));
            assert_eq!(cache.list_keys().unwrap(), vec![key]);
        }
    }

    #[test]
    fn test_memory_cache_evicts_records_it_cannot_use() {
        let cache = MemoryCache::new();
        let (key, track) = sample();
        let foreign = SyntheticTrack::new(1).build("0ther", "blazepose");

        for body in [serde_json::to_string(&foreign).unwrap(), "{\"frames\": [".to_string()] {
            cache.entries().unwrap().insert(key.clone(), body);
            assert!(cache.get(&key).unwrap().is_none());
            assert!(cache.list_keys().unwrap().is_empty());
        }

        cache.put(&key, &track).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(track));
    }

    #[test]
    fn test_put_rejects_mismatched_key() {
        let cache = SqliteCache::open_in_memory().unwrap();
        let (_, track) = sample();
        let wrong = CacheKey::new("other", "blazepose");
        assert!(cache.put(&wrong, &track).is_err());
        assert!(cache.list_keys().unwrap().is_empty());
    }

    #[test]
    fn test_durable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let (key, track) = sample();
        {
            let cache = SqliteCache::open(&path).unwrap();
            cache.put(&key, &track).unwrap();
        }
        let cache = SqliteCache::open(&path).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(track));
        assert_eq!(cache.stats().unwrap().tracks, 1);
        assert_eq!(cache.list().unwrap()[0].key, key);
    }
}
