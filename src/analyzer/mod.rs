pub mod angles;
pub mod phase;
pub mod reps;

use serde::{Deserialize, Serialize};

use crate::pose::{PoseFrame, PoseTrack, RawFrame};
use angles::{Angles, DEFAULT_MIN_CONFIDENCE, compute_angles};
use phase::{PhaseState, PhaseThresholds, SwingPhase};
use reps::{RepCounter, Repetition};

/// Tuning for the angle → phase → rep pipeline (`[analysis]` config table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Keypoints below this confidence are ignored by the angle calculator.
    pub min_keypoint_confidence: f64,
    pub phase: PhaseThresholds,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            min_keypoint_confidence: DEFAULT_MIN_CONFIDENCE,
            phase: PhaseThresholds::default(),
        }
    }
}

/// Result of pushing one frame through the pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameOutcome {
    /// Phase held after this frame.
    pub phase: Option<SwingPhase>,
    /// Set when this frame confirmed a phase change.
    pub entered: Option<SwingPhase>,
    /// Set when this frame closed a rep.
    pub repetition: Option<Repetition>,
}

/// Single-session pipeline: angles → phase → reps, one frame at a time,
/// strictly in frame order.
#[derive(Debug, Clone)]
pub struct SwingAnalyzer {
    settings: AnalysisSettings,
    phase: PhaseState,
    reps: RepCounter,
}

impl SwingAnalyzer {
    pub fn new(settings: AnalysisSettings) -> Self {
        Self {
            settings,
            phase: PhaseState::new(),
            reps: RepCounter::new(),
        }
    }

    /// Compute angles for a source frame, then advance. Returns the finished
    /// frame (angles attached) alongside the outcome.
    pub fn process(&mut self, raw: RawFrame) -> (PoseFrame, FrameOutcome) {
        let angles = compute_angles(&raw.keypoints, self.settings.min_keypoint_confidence);
        let frame = raw.into_pose_frame(angles);
        let outcome = self.push(&frame);
        (frame, outcome)
    }

    /// Advance using the angles already stored on `frame`.
    pub fn push(&mut self, frame: &PoseFrame) -> FrameOutcome {
        let (next, update) = self.phase.advance(frame.angles.as_ref(), &self.settings.phase);
        self.phase = next;
        let repetition = self.reps.observe(frame, &update);
        if let Some(rep) = &repetition {
            log::debug!(
                "Rep {} closed at {:.2}s (frame {})",
                rep.rep_number,
                rep.completed_at_video_time,
                frame.frame_index
            );
        }
        FrameOutcome {
            phase: update.held,
            entered: update.entered,
            repetition,
        }
    }

    pub fn rep_count(&self) -> u32 {
        self.reps.count()
    }

    pub fn phase(&self) -> Option<SwingPhase> {
        self.phase.current()
    }
}

/// Offline pass over stored frames with a fresh pipeline. Deterministic: the
/// same frames always give the same reps and per-frame phases.
pub fn analyze_frames(
    frames: &[PoseFrame],
    settings: &AnalysisSettings,
) -> (Vec<Repetition>, Vec<Option<SwingPhase>>) {
    let mut analyzer = SwingAnalyzer::new(settings.clone());
    let mut repetitions = Vec::new();
    let mut phases = Vec::with_capacity(frames.len());
    for frame in frames {
        let outcome = analyzer.push(frame);
        phases.push(outcome.phase);
        repetitions.extend(outcome.repetition);
    }
    (repetitions, phases)
}

/// Replace every frame's stored angles with freshly computed ones. Returns the
/// number of frames that ended up with angles.
pub fn recompute_angles(track: &mut PoseTrack, min_confidence: f64) -> usize {
    let mut with_pose = 0;
    for frame in &mut track.frames {
        frame.angles = compute_angles(&frame.keypoints, min_confidence);
        if frame.angles.is_some() {
            with_pose += 1;
        }
    }
    with_pose
}

/// Angle readout for a playback position.
#[derive(Debug, Clone, PartialEq)]
pub enum AngleReadout {
    Pose {
        frame_index: u64,
        video_time: f64,
        angles: Angles,
        phase: Option<SwingPhase>,
    },
    NoPose,
}

/// A completed track together with everything derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackAnalysis {
    pub track: PoseTrack,
    pub repetitions: Vec<Repetition>,
    phases: Vec<Option<SwingPhase>>,
}

impl TrackAnalysis {
    /// Derive reps from a stored track's frames.
    pub fn from_track(track: PoseTrack, settings: &AnalysisSettings) -> Self {
        let (repetitions, phases) = analyze_frames(&track.frames, settings);
        Self {
            track,
            repetitions,
            phases,
        }
    }

    /// Assemble from a live run that already produced reps and phases.
    pub(crate) fn from_parts(
        track: PoseTrack,
        repetitions: Vec<Repetition>,
        phases: Vec<Option<SwingPhase>>,
    ) -> Self {
        Self {
            track,
            repetitions,
            phases,
        }
    }

    pub fn rep_count(&self) -> usize {
        self.repetitions.len()
    }

    /// Reps whose closing Top was reached at or before `time`.
    pub fn reps_completed_by(&self, time: f64) -> usize {
        self.repetitions
            .iter()
            .filter(|r| r.completed_at_video_time <= time)
            .count()
    }

    /// Angles of the frame nearest `time`, or `NoPose`.
    pub fn readout_at(&self, time: f64) -> AngleReadout {
        let Some(frame) = self.track.frame_nearest(time) else {
            return AngleReadout::NoPose;
        };
        let Some(angles) = frame.angles else {
            return AngleReadout::NoPose;
        };
        let phase = self
            .track
            .frames
            .binary_search_by(|f| f.frame_index.cmp(&frame.frame_index))
            .ok()
            .and_then(|i| self.phases.get(i).copied().flatten());
        AngleReadout::Pose {
            frame_index: frame.frame_index,
            video_time: frame.video_time,
            angles,
            phase,
        }
    }
}
