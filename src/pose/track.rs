use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{KeypointIndex, PoseFrame, coco_layout};

/// Current on-disk / in-cache PoseTrack layout version.
pub const FORMAT_VERSION: &str = "1.0";

/// Keypoint layout every stored frame uses.
pub const KEYPOINT_FORMAT: &str = "coco-17";

/// File suffix used for exported pose tracks.
pub const POSETRACK_SUFFIX: &str = ".posetrack.json";

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid pose track: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseTrackMetadata {
    #[serde(alias = "version")]
    pub format_version: String,
    #[serde(alias = "model")]
    pub model_id: String,
    #[serde(default)]
    pub model_version: String,
    #[serde(alias = "sourceVideoHash")]
    pub source_video_content_hash: String,
    #[serde(default)]
    pub source_video_name: String,
    #[serde(alias = "sourceVideoDuration", default)]
    pub source_duration_seconds: f64,
    #[serde(rename = "extractedAtISO8601", alias = "extractedAt")]
    pub extracted_at: DateTime<Utc>,
    pub frame_count: u64,
    #[serde(default)]
    pub fps: f64,
    #[serde(default)]
    pub video_width: u32,
    #[serde(default)]
    pub video_height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypoint_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypoint_count: Option<u32>,
}

/// The complete per-frame pose record for one video under one model.
/// This is the unit of caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseTrack {
    pub metadata: PoseTrackMetadata,
    pub frames: Vec<PoseFrame>,
}

impl PoseTrack {
    /// Parse and validate a track from JSON.
    pub fn from_json(json: &str) -> Result<Self, TrackError> {
        let track: PoseTrack = serde_json::from_str(json)?;
        track.validate()?;
        Ok(track)
    }

    pub fn to_json(&self) -> Result<String, TrackError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Read a `.posetrack.json` file.
    pub fn load(path: &Path) -> Result<Self, TrackError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Write a `.posetrack.json` file. Written to a sibling temp file first and
    /// renamed into place so readers never see a half-written track.
    pub fn save(&self, path: &Path) -> Result<(), TrackError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.partial");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Shape checks: identity present, frame count matches, numbers finite, frames ordered.
    pub fn validate(&self) -> Result<(), TrackError> {
        let meta = &self.metadata;
        if meta.source_video_content_hash.is_empty() {
            return Err(TrackError::Invalid("missing source video content hash".into()));
        }
        if meta.model_id.is_empty() {
            return Err(TrackError::Invalid("missing model id".into()));
        }
        if meta.frame_count != self.frames.len() as u64 {
            return Err(TrackError::Invalid(format!(
                "metadata says {} frames, track has {}",
                meta.frame_count,
                self.frames.len()
            )));
        }
        if !meta.fps.is_finite() || !meta.source_duration_seconds.is_finite() {
            return Err(TrackError::Invalid("non-finite fps or duration".into()));
        }
        if let Some(frame) = self.frames.iter().find(|f| !f.is_finite()) {
            return Err(TrackError::Invalid(format!(
                "non-finite value in frame {}",
                frame.frame_index
            )));
        }
        for pair in self.frames.windows(2) {
            if pair[1].frame_index <= pair[0].frame_index || pair[1].video_time < pair[0].video_time {
                return Err(TrackError::Invalid(format!(
                    "frames out of order at index {}",
                    pair[1].frame_index
                )));
            }
        }
        Ok(())
    }

    /// Rewrite every frame's keypoints into the COCO-17 layout. Tracks from
    /// extractors that emit the full BlazePose-33 set are remapped; a frame
    /// that cannot be mapped fails the whole track.
    pub fn normalize_layout(&mut self) -> Result<(), TrackError> {
        let declared = self.metadata.keypoint_format.as_deref().unwrap_or(KEYPOINT_FORMAT);
        let already_coco = declared == KEYPOINT_FORMAT
            && self.frames.iter().all(|f| {
                f.keypoints.is_empty() || f.keypoints.len() == KeypointIndex::COUNT
            });
        if already_coco {
            return Ok(());
        }

        for frame in &mut self.frames {
            let keypoints = std::mem::take(&mut frame.keypoints);
            let found = keypoints.len();
            frame.keypoints = coco_layout(keypoints).ok_or_else(|| {
                TrackError::Invalid(format!(
                    "frame {}: {found} {declared} keypoints do not map to {KEYPOINT_FORMAT}",
                    frame.frame_index
                ))
            })?;
        }
        log::debug!("Remapped {} frames from {declared} to {KEYPOINT_FORMAT}", self.frames.len());
        self.metadata.keypoint_format = Some(KEYPOINT_FORMAT.to_string());
        self.metadata.keypoint_count = Some(KeypointIndex::COUNT as u32);
        Ok(())
    }

    /// Frame whose `video_time` is nearest `time`. Ties go to the earlier frame.
    pub fn frame_nearest(&self, time: f64) -> Option<&PoseFrame> {
        if self.frames.is_empty() || !time.is_finite() {
            return None;
        }
        let idx = self.frames.partition_point(|f| f.video_time < time);
        let after = self.frames.get(idx);
        let before = idx.checked_sub(1).and_then(|i| self.frames.get(i));
        match (before, after) {
            (Some(b), Some(a)) => {
                if (time - b.video_time) <= (a.video_time - time) {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    /// Number of frames that carry trustworthy angles.
    pub fn frames_with_pose(&self) -> usize {
        self.frames.iter().filter(|f| f.has_pose()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::synthetic::SyntheticTrack;

    fn sample() -> PoseTrack {
        SyntheticTrack::new(1).frames_per_phase(5).build("abc123", "blazepose")
    }

    #[test]
    fn test_validate_accepts_synthetic_track() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_frame_count_mismatch() {
        let mut track = sample();
        track.frames.pop();
        assert!(matches!(track.validate(), Err(TrackError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_out_of_order_frames() {
        let mut track = sample();
        track.frames.swap(1, 2);
        assert!(track.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_values() {
        let mut track = sample();
        track.frames[2].keypoints[0].y = f64::INFINITY;
        assert!(matches!(track.validate(), Err(TrackError::Invalid(_))));

        let mut track = sample();
        track.metadata.fps = f64::NAN;
        assert!(track.validate().is_err());
    }

    #[test]
    fn test_normalize_remaps_blazepose_frames() {
        let mut track = sample();
        let expected = track.frames.clone();
        for frame in &mut track.frames {
            // Spread the COCO landmarks over a 33-slot BlazePose list.
            let mut full = vec![crate::pose::Keypoint::new(0.0, 0.0, 0.0); crate::pose::BLAZEPOSE_COUNT];
            for (slot, &src) in crate::pose::BLAZEPOSE_TO_COCO.iter().enumerate() {
                full[src] = frame.keypoints[slot].clone();
            }
            frame.keypoints = full;
        }
        track.metadata.keypoint_format = Some("blazepose-33".into());
        track.metadata.keypoint_count = Some(33);

        track.normalize_layout().unwrap();
        assert_eq!(track.metadata.keypoint_format.as_deref(), Some(KEYPOINT_FORMAT));
        assert_eq!(track.metadata.keypoint_count, Some(17));
        for (frame, want) in track.frames.iter().zip(&expected) {
            let xs: Vec<f64> = frame.keypoints.iter().map(|k| k.x).collect();
            let want: Vec<f64> = want.keypoints.iter().map(|k| k.x).collect();
            assert_eq!(xs, want);
        }
    }

    #[test]
    fn test_normalize_rejects_unmappable_frames() {
        let mut track = sample();
        track.frames[0].keypoints.truncate(9);
        assert!(matches!(track.normalize_layout(), Err(TrackError::Invalid(_))));
    }

    #[test]
    fn test_from_json_rejects_missing_frames() {
        let json = r#"{"metadata": {"formatVersion": "1.0"}}"#;
        assert!(matches!(PoseTrack::from_json(json), Err(TrackError::Json(_))));
    }

    #[test]
    fn test_legacy_metadata_names() {
        let json = r#"{
            "metadata": {
                "version": "1.0",
                "model": "blazepose",
                "modelVersion": "mediapipe-0.10.9",
                "keypointFormat": "coco-17",
                "keypointCount": 17,
                "sourceVideoHash": "deadbeef",
                "sourceVideoName": "swing.mp4",
                "sourceVideoDuration": 0.0333,
                "extractedAt": "2024-03-01T12:00:00.123456+00:00",
                "frameCount": 1,
                "fps": 30.0,
                "videoWidth": 1080,
                "videoHeight": 1920
            },
            "frames": [
                {"frameIndex": 0, "timestamp": 0.0, "videoTime": 0.0, "keypoints": [], "score": 0}
            ]
        }"#;
        let track = PoseTrack::from_json(json).unwrap();
        assert_eq!(track.metadata.model_id, "blazepose");
        assert_eq!(track.metadata.source_video_content_hash, "deadbeef");
        assert_eq!(track.metadata.keypoint_count, Some(17));

        // Canonical names on the way out.
        let out = track.to_json().unwrap();
        assert!(out.contains("\"sourceVideoContentHash\""));
        assert!(out.contains("\"extractedAtISO8601\""));
        assert!(!out.contains("\"sourceVideoHash\""));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swing.posetrack.json");
        let track = sample();
        track.save(&path).unwrap();
        let loaded = PoseTrack::load(&path).unwrap();
        assert_eq!(loaded, track);
        assert!(!path.with_extension("json.partial").exists());
    }

    #[test]
    fn test_frame_nearest() {
        let track = sample();
        let first = &track.frames[0];
        let second = &track.frames[1];
        assert_eq!(track.frame_nearest(-5.0).unwrap().frame_index, first.frame_index);
        assert_eq!(track.frame_nearest(1e9).unwrap().frame_index, track.frames.last().unwrap().frame_index);
        let just_past_second = second.video_time + 0.001;
        assert_eq!(track.frame_nearest(just_past_second).unwrap().frame_index, second.frame_index);
        assert!(track.frame_nearest(f64::NAN).is_none());
    }
}
