use super::models::{CacheKey, CachedTrackInfo, TrackStats};
use super::{Database, Result};
use crate::pose::PoseTrack;
use rusqlite::{OptionalExtension, params};

impl Database {
    /// Insert or replace the stored track for its (content hash, model) key.
    /// A single statement, so readers see either the old row or the new one.
    pub fn put_pose_track(&self, track: &PoseTrack) -> Result<()> {
        let m = &track.metadata;
        let body = serde_json::to_string(track)?;
        self.conn.execute(
            "INSERT INTO pose_tracks (
                content_hash, model_id, model_version, format_version,
                source_video_name, frame_count, fps, duration_secs,
                extracted_at, track_json, stored_at
            ) VALUES (
                ?1, ?2, ?3, ?4,
                ?5, ?6, ?7, ?8,
                ?9, ?10, datetime('now')
            )
            ON CONFLICT(content_hash, model_id) DO UPDATE SET
                model_version = excluded.model_version,
                format_version = excluded.format_version,
                source_video_name = excluded.source_video_name,
                frame_count = excluded.frame_count,
                fps = excluded.fps,
                duration_secs = excluded.duration_secs,
                extracted_at = excluded.extracted_at,
                track_json = excluded.track_json,
                stored_at = datetime('now')
            ",
            params![
                m.source_video_content_hash, m.model_id, m.model_version, m.format_version,
                m.source_video_name, m.frame_count as i64, m.fps, m.source_duration_seconds,
                m.extracted_at.to_rfc3339(), body,
            ],
        )?;
        Ok(())
    }

    /// Raw JSON body for a key, unparsed.
    pub fn get_pose_track_json(&self, key: &CacheKey) -> Result<Option<String>> {
        let body = self
            .conn
            .query_row(
                "SELECT track_json FROM pose_tracks WHERE content_hash = ?1 AND model_id = ?2",
                params![key.content_hash, key.model_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body)
    }

    /// Remove one entry. Returns whether anything was deleted.
    pub fn delete_pose_track(&self, key: &CacheKey) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM pose_tracks WHERE content_hash = ?1 AND model_id = ?2",
            params![key.content_hash, key.model_id],
        )?;
        Ok(n > 0)
    }

    /// Remove every entry. Returns the number deleted.
    pub fn clear_pose_tracks(&self) -> Result<usize> {
        let n = self.conn.execute("DELETE FROM pose_tracks", [])?;
        Ok(n)
    }

    /// Summary of every stored track, newest first.
    pub fn list_pose_tracks(&self) -> Result<Vec<CachedTrackInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT content_hash, model_id, model_version, source_video_name,
                    frame_count, fps, duration_secs, extracted_at, stored_at
             FROM pose_tracks
             ORDER BY stored_at DESC, content_hash, model_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CachedTrackInfo {
                    key: CacheKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    model_version: row.get(2)?,
                    source_video_name: row.get(3)?,
                    frame_count: row.get(4)?,
                    fps: row.get(5)?,
                    duration_secs: row.get(6)?,
                    extracted_at: row.get(7)?,
                    stored_at: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_pose_track_keys(&self) -> Result<Vec<CacheKey>> {
        let mut stmt = self
            .conn
            .prepare("SELECT content_hash, model_id FROM pose_tracks ORDER BY content_hash, model_id")?;
        let keys = stmt
            .query_map([], |row| Ok(CacheKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Cache statistics.
    pub fn track_stats(&self) -> Result<TrackStats> {
        let (tracks, total_frames, total_duration_hours): (i64, i64, f64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(frame_count), 0),
                    COALESCE(SUM(duration_secs), 0.0) / 3600.0
             FROM pose_tracks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut model_stmt = self.conn.prepare(
            "SELECT model_id, COUNT(*) FROM pose_tracks GROUP BY model_id ORDER BY COUNT(*) DESC, model_id",
        )?;
        let models: Vec<(String, i64)> = model_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(TrackStats {
            tracks,
            total_frames,
            total_duration_hours,
            models,
        })
    }
}
