//! Live frame sources.
//!
//! A source yields frames for one video in order and can be told to stop.
//! Pose estimation itself lives behind this trait; the crate ships a replay
//! source that plays back a stored track, optionally paced to real time.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::pose::synthetic::SyntheticTrack;
use crate::pose::{PoseTrack, RawFrame, TrackError};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Pose file error: {0}")]
    Track(#[from] TrackError),
    #[error("Frame source failed: {0}")]
    Backend(String),
}

/// What the source knows about the video up front.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceInfo {
    pub video_name: String,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub duration_seconds: f64,
    pub total_frames: Option<u64>,
}

#[async_trait]
pub trait FrameSource: Send {
    fn info(&self) -> SourceInfo;

    /// Next frame in order, or `None` once the video is exhausted.
    async fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError>;

    /// Stop producing frames and release any backend resources.
    fn cancel(&mut self);
}

/// Plays back pre-computed frames. Stored angles are dropped; the consumer
/// recomputes them from keypoints.
pub struct ReplaySource {
    info: SourceInfo,
    frames: VecDeque<RawFrame>,
    delay: Option<Duration>,
    cancelled: bool,
}

impl ReplaySource {
    pub fn new(info: SourceInfo, frames: Vec<RawFrame>) -> Self {
        Self {
            info,
            frames: frames.into(),
            delay: None,
            cancelled: false,
        }
    }

    pub fn from_track(track: &PoseTrack) -> Self {
        let m = &track.metadata;
        let info = SourceInfo {
            video_name: m.source_video_name.clone(),
            fps: m.fps,
            width: m.video_width,
            height: m.video_height,
            duration_seconds: m.source_duration_seconds,
            total_frames: Some(track.frames.len() as u64),
        };
        Self::new(info, track.frames.iter().map(RawFrame::from).collect())
    }

    /// Load a `.posetrack.json` file as a source.
    pub fn from_file(path: &Path) -> Result<Self, SourceError> {
        let mut track = PoseTrack::load(path)?;
        track.normalize_layout()?;
        let mut source = Self::from_track(&track);
        if source.info.video_name.is_empty() {
            source.info.video_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(source)
    }

    pub fn from_synthetic(synthetic: &SyntheticTrack, video_name: &str) -> Self {
        let frames = synthetic.raw_frames();
        let fps = synthetic.frame_rate();
        let info = SourceInfo {
            video_name: video_name.to_string(),
            fps,
            width: 1080,
            height: 1920,
            duration_seconds: frames.len() as f64 / fps,
            total_frames: Some(frames.len() as u64),
        };
        Self::new(info, frames)
    }

    /// Sleep this long before handing out each frame.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = (!delay.is_zero()).then_some(delay);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

#[async_trait]
impl FrameSource for ReplaySource {
    fn info(&self) -> SourceInfo {
        self.info.clone()
    }

    async fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
        if self.cancelled {
            return Ok(None);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.frames.pop_front())
    }

    fn cancel(&mut self) {
        if !self.cancelled {
            log::debug!(
                "Replay source for {} cancelled with {} frames unread",
                self.info.video_name,
                self.frames.len()
            );
        }
        self.cancelled = true;
        self.frames.clear();
    }
}
