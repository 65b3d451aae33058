use std::fmt;

/// Cache identity: one pose track per (video content, model).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub content_hash: String,
    pub model_id: String,
}

impl CacheKey {
    pub fn new(content_hash: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash.into(),
            model_id: model_id.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.content_hash.get(..12).unwrap_or(&self.content_hash);
        write!(f, "{}@{}", short, self.model_id)
    }
}

/// Summary row for a cached track, read without parsing the JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedTrackInfo {
    pub key: CacheKey,
    pub model_version: String,
    pub source_video_name: String,
    pub frame_count: i64,
    pub fps: Option<f64>,
    pub duration_secs: Option<f64>,
    pub extracted_at: String,
    pub stored_at: String,
}

/// Cache-wide statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackStats {
    pub tracks: i64,
    pub total_frames: i64,
    pub total_duration_hours: f64,
    pub models: Vec<(String, i64)>,
}
