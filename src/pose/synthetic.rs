//! Deterministic synthetic swing tracks.
//!
//! Poses are built so that the angle calculator recovers the requested
//! `(spine, arm)` pair exactly. Used as a stand-in frame source and as test
//! fixtures.

use chrono::{TimeZone, Utc};

use super::{KEYPOINT_FORMAT, Keypoint, KeypointIndex, PoseTrack, PoseTrackMetadata, RawFrame};
use crate::analyzer::angles::{DEFAULT_MIN_CONFIDENCE, compute_angles};
use crate::analyzer::phase::{PhaseThresholds, SwingPhase};
use crate::pose::track::FORMAT_VERSION;

const WIDTH: u32 = 1080;
const HEIGHT: u32 = 1920;
const SHOULDER: (f64, f64) = (540.0, 700.0);
const TORSO_LEN: f64 = 320.0;
const ARM_LEN: f64 = 260.0;
const LEG_LEN: f64 = 420.0;

/// Builder for an N-cycle swing track.
#[derive(Debug, Clone)]
pub struct SyntheticTrack {
    cycles: usize,
    frames_per_phase: usize,
    transition_frames: usize,
    fps: f64,
    jitter_degrees: f64,
    drop_every: Option<usize>,
    confidence: f64,
    partial_until: Option<SwingPhase>,
    thresholds: PhaseThresholds,
}

impl SyntheticTrack {
    pub fn new(cycles: usize) -> Self {
        Self {
            cycles,
            frames_per_phase: 15,
            transition_frames: 0,
            fps: 30.0,
            jitter_degrees: 0.0,
            drop_every: None,
            confidence: 0.9,
            partial_until: None,
            thresholds: PhaseThresholds::default(),
        }
    }

    /// Frames held at each phase's reference pose.
    pub fn frames_per_phase(mut self, n: usize) -> Self {
        self.frames_per_phase = n.max(1);
        self
    }

    /// Interpolated frames between consecutive phase holds.
    pub fn transition_frames(mut self, n: usize) -> Self {
        self.transition_frames = n;
        self
    }

    pub fn fps(mut self, fps: f64) -> Self {
        if fps.is_finite() && fps > 0.0 {
            self.fps = fps;
        }
        self
    }

    pub fn frame_rate(&self) -> f64 {
        self.fps
    }

    /// Deterministic wobble added to both angles, up to this many degrees.
    pub fn jitter(mut self, degrees: f64) -> Self {
        self.jitter_degrees = degrees.abs();
        self
    }

    /// Every n-th frame has no detection (empty keypoints).
    pub fn drop_every(mut self, n: usize) -> Self {
        self.drop_every = (n > 0).then_some(n);
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// After the full cycles, continue a further cycle only up to `phase`.
    pub fn partial_until(mut self, phase: SwingPhase) -> Self {
        self.partial_until = Some(phase);
        self
    }

    /// Hold phases in order: an opening Top, then each cycle, then the partial tail.
    fn schedule(&self) -> Vec<SwingPhase> {
        let mut phases = vec![SwingPhase::Top];
        for _ in 0..self.cycles {
            phases.extend([
                SwingPhase::Connect,
                SwingPhase::Bottom,
                SwingPhase::Release,
                SwingPhase::Top,
            ]);
        }
        if let Some(last) = self.partial_until {
            if last != SwingPhase::Top {
                let mut phase = SwingPhase::Connect;
                loop {
                    phases.push(phase);
                    if phase == last {
                        break;
                    }
                    phase = phase.next();
                }
            }
        }
        phases
    }

    /// Target `(spine, arm)` per frame, plus the frame index where each
    /// closing Top hold starts.
    fn targets(&self) -> (Vec<(f64, f64)>, Vec<usize>) {
        let schedule = self.schedule();
        let mut targets = Vec::new();
        let mut top_starts = Vec::new();

        for (i, phase) in schedule.iter().enumerate() {
            let to = self.thresholds.reference(*phase);
            if i > 0 {
                let from = self.thresholds.reference(schedule[i - 1]);
                for step in 1..=self.transition_frames {
                    let u = step as f64 / (self.transition_frames + 1) as f64;
                    targets.push((
                        from.spine + (to.spine - from.spine) * u,
                        from.arm + (to.arm - from.arm) * u,
                    ));
                }
                if *phase == SwingPhase::Top {
                    top_starts.push(targets.len());
                }
            }
            for _ in 0..self.frames_per_phase {
                targets.push((to.spine, to.arm));
            }
        }
        (targets, top_starts)
    }

    /// Video times at which each completed cycle's closing Top hold begins.
    pub fn expected_top_times(&self) -> Vec<f64> {
        let (_, top_starts) = self.targets();
        top_starts.into_iter().map(|i| i as f64 / self.fps).collect()
    }

    pub fn raw_frames(&self) -> Vec<RawFrame> {
        let (targets, _) = self.targets();
        targets
            .into_iter()
            .enumerate()
            .map(|(i, (spine, arm))| {
                let dropped = self.drop_every.is_some_and(|n| i % n == n - 1);
                let (keypoints, overall_score) = if dropped {
                    (Vec::new(), 0.0)
                } else {
                    let (ds, da) = self.wobble(i);
                    (pose_keypoints(spine + ds, arm + da, self.confidence), self.confidence)
                };
                RawFrame {
                    frame_index: i as u64,
                    video_time: i as f64 / self.fps,
                    keypoints,
                    overall_score,
                }
            })
            .collect()
    }

    /// Complete track with angles attached, as an extraction would produce it.
    pub fn build(&self, content_hash: &str, model_id: &str) -> PoseTrack {
        let frames: Vec<_> = self
            .raw_frames()
            .into_iter()
            .map(|raw| {
                let angles = compute_angles(&raw.keypoints, DEFAULT_MIN_CONFIDENCE);
                raw.into_pose_frame(angles)
            })
            .collect();
        let duration = frames.len() as f64 / self.fps;

        PoseTrack {
            metadata: PoseTrackMetadata {
                format_version: FORMAT_VERSION.to_string(),
                model_id: model_id.to_string(),
                model_version: "synthetic".to_string(),
                source_video_content_hash: content_hash.to_string(),
                source_video_name: format!("synthetic-{}x.mp4", self.cycles),
                source_duration_seconds: duration,
                // Fixed so identical builders produce identical tracks.
                extracted_at: Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
                frame_count: frames.len() as u64,
                fps: self.fps,
                video_width: WIDTH,
                video_height: HEIGHT,
                keypoint_format: Some(KEYPOINT_FORMAT.to_string()),
                keypoint_count: Some(KeypointIndex::COUNT as u32),
            },
            frames,
        }
    }

    fn wobble(&self, i: usize) -> (f64, f64) {
        if self.jitter_degrees == 0.0 {
            return (0.0, 0.0);
        }
        let t = i as f64;
        (
            self.jitter_degrees * (t * 1.7).sin(),
            self.jitter_degrees * (t * 2.3 + 0.5).cos(),
        )
    }
}

/// A full COCO-17 skeleton whose spine and arm angles (from screen-down) are
/// exactly `spine` and `arm` degrees.
pub fn pose_keypoints(spine: f64, arm: f64, confidence: f64) -> Vec<Keypoint> {
    let (sx, sy) = SHOULDER;
    let (s, a) = (spine.to_radians(), arm.to_radians());

    // Hips sit behind the shoulders as the torso hinges forward.
    let hip = (sx - TORSO_LEN * s.sin(), sy + TORSO_LEN * s.cos());
    let wrist = (sx + ARM_LEN * a.sin(), sy + ARM_LEN * a.cos());
    let elbow = ((sx + wrist.0) / 2.0, (sy + wrist.1) / 2.0);
    let knee = (hip.0 + 20.0, hip.1 + LEG_LEN / 2.0);
    let ankle = (hip.0, hip.1 + LEG_LEN);
    let head = (sx + 60.0 * s.sin(), sy - 90.0 * s.cos());

    let mut kps = vec![Keypoint::new(0.0, 0.0, confidence); KeypointIndex::COUNT];
    let mut set = |index: KeypointIndex, (x, y): (f64, f64)| {
        kps[index as usize] = Keypoint {
            x,
            y,
            confidence,
            name: Some(index.name().to_string()),
        };
    };
    set(KeypointIndex::Nose, head);
    set(KeypointIndex::LeftEye, (head.0 - 8.0, head.1 - 10.0));
    set(KeypointIndex::RightEye, (head.0 + 8.0, head.1 - 10.0));
    set(KeypointIndex::LeftEar, (head.0 - 18.0, head.1 - 4.0));
    set(KeypointIndex::RightEar, (head.0 + 18.0, head.1 - 4.0));
    set(KeypointIndex::LeftShoulder, (sx - 10.0, sy));
    set(KeypointIndex::RightShoulder, (sx + 10.0, sy));
    set(KeypointIndex::LeftElbow, (elbow.0 - 6.0, elbow.1));
    set(KeypointIndex::RightElbow, (elbow.0 + 6.0, elbow.1));
    set(KeypointIndex::LeftWrist, (wrist.0 - 4.0, wrist.1));
    set(KeypointIndex::RightWrist, (wrist.0 + 4.0, wrist.1));
    set(KeypointIndex::LeftHip, (hip.0 - 12.0, hip.1));
    set(KeypointIndex::RightHip, (hip.0 + 12.0, hip.1));
    set(KeypointIndex::LeftKnee, (knee.0 - 12.0, knee.1));
    set(KeypointIndex::RightKnee, (knee.0 + 12.0, knee.1));
    set(KeypointIndex::LeftAnkle, (ankle.0 - 12.0, ankle.1));
    set(KeypointIndex::RightAnkle, (ankle.0 + 12.0, ankle.1));
    kps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pose_keypoints_round_trip_through_angle_calculator() {
        for (spine, arm) in [(15.0, 160.0), (35.0, 40.0), (50.0, 30.0), (25.0, 130.0), (0.0, 0.0)] {
            let kps = pose_keypoints(spine, arm, 0.9);
            let a = compute_angles(&kps, DEFAULT_MIN_CONFIDENCE).unwrap();
            assert!((a.spine_angle - spine).abs() < 1e-9, "spine {spine}");
            assert!((a.arm_to_vertical_angle - arm).abs() < 1e-9, "arm {arm}");
        }
    }

    #[test]
    fn test_frame_counts() {
        assert_eq!(SyntheticTrack::new(1).raw_frames().len(), 75);
        assert_eq!(SyntheticTrack::new(3).raw_frames().len(), 195);
        let with_transitions = SyntheticTrack::new(1).frames_per_phase(10).transition_frames(4);
        assert_eq!(with_transitions.raw_frames().len(), 50 + 16);
    }

    #[test]
    fn test_partial_tail() {
        let track = SyntheticTrack::new(2)
            .frames_per_phase(5)
            .partial_until(SwingPhase::Release);
        assert_eq!(track.raw_frames().len(), 5 * (1 + 8 + 3));
        assert_eq!(track.expected_top_times().len(), 2);
    }

    #[test]
    fn test_dropped_frames_are_empty() {
        let frames = SyntheticTrack::new(1).drop_every(5).raw_frames();
        assert!(frames[4].keypoints.is_empty());
        assert_eq!(frames[4].overall_score, 0.0);
        assert_eq!(frames[3].keypoints.len(), KeypointIndex::COUNT);
    }

    #[test]
    fn test_build_is_deterministic_and_valid() {
        let a = SyntheticTrack::new(2).jitter(3.0).build("h", "m");
        let b = SyntheticTrack::new(2).jitter(3.0).build("h", "m");
        assert_eq!(a, b);
        assert!(a.validate().is_ok());
        assert_eq!(a.frames_with_pose(), a.frames.len());
    }

    #[test]
    fn test_expected_top_times() {
        let times = SyntheticTrack::new(2).frames_per_phase(15).expected_top_times();
        assert_eq!(times.len(), 2);
        assert!((times[0] - 60.0 / 30.0).abs() < 1e-9);
        assert!((times[1] - 120.0 / 30.0).abs() < 1e-9);
    }
}
