//! Pipeline notifications.
//!
//! Everything a UI or test harness needs to follow an extraction is published
//! as a plain message on a channel. Nothing in the pipeline waits on a
//! consumer; a closed or missing receiver only costs a log line.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::analyzer::angles::Angles;
use crate::analyzer::reps::{Checkpoint, Repetition};
use crate::db::models::CacheKey;

/// A completed rep as published to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepEvent {
    pub rep_number: u32,
    /// Time of the closing `Top` checkpoint.
    pub video_time: f64,
    /// Angles at the closing `Top` checkpoint.
    pub angles: Angles,
    pub checkpoints: [Checkpoint; 4],
}

impl From<&Repetition> for RepEvent {
    fn from(rep: &Repetition) -> Self {
        let top = rep.top();
        Self {
            rep_number: rep.rep_number,
            video_time: top.video_time,
            angles: top.angles,
            checkpoints: rep.checkpoints.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    ExtractionStarted {
        key: CacheKey,
        total_frames: Option<u64>,
    },
    ExtractionProgress {
        key: CacheKey,
        frames_processed: u64,
        /// Only when the source knows its length.
        percent: Option<f64>,
    },
    RepDetected {
        key: CacheKey,
        rep: RepEvent,
    },
    ExtractionComplete {
        key: CacheKey,
        frame_count: u64,
        rep_count: usize,
        elapsed: Duration,
    },
    ExtractionCancelled {
        key: CacheKey,
        frames_processed: u64,
    },
    ExtractionFailed {
        key: CacheKey,
        error: String,
    },
    CacheHit {
        key: CacheKey,
        frame_count: u64,
        rep_count: usize,
    },
}

impl PipelineEvent {
    pub fn key(&self) -> &CacheKey {
        match self {
            Self::ExtractionStarted { key, .. }
            | Self::ExtractionProgress { key, .. }
            | Self::RepDetected { key, .. }
            | Self::ExtractionComplete { key, .. }
            | Self::ExtractionCancelled { key, .. }
            | Self::ExtractionFailed { key, .. }
            | Self::CacheHit { key, .. } => key,
        }
    }
}

/// Cheap-to-clone publisher. A sender without a channel drops everything.
#[derive(Clone, Debug, Default)]
pub struct EventSender {
    tx: Option<UnboundedSender<PipelineEvent>>,
}

impl EventSender {
    pub fn new(tx: UnboundedSender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Publish an event. If the receiver is gone the event is dropped and logged.
    pub fn send(&self, event: PipelineEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.send(event) {
            log::debug!("Dropping pipeline event, receiver closed: {:?}", e.0);
        }
    }
}
