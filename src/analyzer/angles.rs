//! Body angles from a single frame of keypoints.
//!
//! Both angles are measured from the screen's downward vertical (+y), starting
//! at the shoulder midpoint:
//! - spine: shoulder midpoint → hip midpoint (0 = upright, 90 = torso horizontal)
//! - arm: shoulder midpoint → wrist (0 = hanging straight down, 180 = overhead)
//!
//! Only magnitudes are reported; the swing looks the same mirrored.

use serde::{Deserialize, Serialize};

use crate::pose::{Keypoint, KeypointIndex};

/// Default keypoint confidence below which a landmark is not trusted.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.3;

/// Vectors shorter than this (in pixels) have no meaningful direction.
const MIN_VECTOR_LENGTH: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Angles {
    pub spine_angle: f64,
    pub arm_to_vertical_angle: f64,
    pub arm_to_spine_angle: f64,
}

impl Angles {
    /// Build a consistent angle set from the two measured angles.
    pub fn from_measured(spine_angle: f64, arm_to_vertical_angle: f64) -> Self {
        let spine_angle = spine_angle.abs();
        let arm_to_vertical_angle = arm_to_vertical_angle.abs();
        Self {
            spine_angle,
            arm_to_vertical_angle,
            arm_to_spine_angle: (arm_to_vertical_angle - spine_angle).abs(),
        }
    }
}

/// Compute body angles from a COCO-17 keypoint list, or `None` if the list
/// has another layout or the shoulders, hips or dominant wrist fall below
/// `min_confidence`. Never returns a partial set.
pub fn compute_angles(keypoints: &[Keypoint], min_confidence: f64) -> Option<Angles> {
    if keypoints.len() != KeypointIndex::COUNT {
        return None;
    }
    let kp = |index: KeypointIndex| &keypoints[index as usize];
    let usable = |index: KeypointIndex| {
        let k = kp(index);
        k.is_usable(min_confidence) && k.x.is_finite() && k.y.is_finite()
    };

    let torso = [
        KeypointIndex::LeftShoulder,
        KeypointIndex::RightShoulder,
        KeypointIndex::LeftHip,
        KeypointIndex::RightHip,
    ];
    if !torso.into_iter().all(usable) {
        return None;
    }

    let wrist = arm_endpoint(
        kp(KeypointIndex::LeftWrist),
        usable(KeypointIndex::LeftWrist),
        kp(KeypointIndex::RightWrist),
        usable(KeypointIndex::RightWrist),
    )?;

    let shoulder_mid = midpoint(kp(KeypointIndex::LeftShoulder), kp(KeypointIndex::RightShoulder));
    let hip_mid = midpoint(kp(KeypointIndex::LeftHip), kp(KeypointIndex::RightHip));

    let spine = angle_from_down(hip_mid.0 - shoulder_mid.0, hip_mid.1 - shoulder_mid.1)?;
    let arm = angle_from_down(wrist.0 - shoulder_mid.0, wrist.1 - shoulder_mid.1)?;

    Some(Angles::from_measured(spine, arm))
}

/// The dominant wrist is the more confident one; it must be usable. When both
/// wrists are usable (two-handed grip) their midpoint is used.
fn arm_endpoint(
    left: &Keypoint,
    left_ok: bool,
    right: &Keypoint,
    right_ok: bool,
) -> Option<(f64, f64)> {
    match (left_ok, right_ok) {
        (true, true) => Some(midpoint(left, right)),
        (true, false) if left.confidence >= right.confidence => Some((left.x, left.y)),
        (false, true) if right.confidence >= left.confidence => Some((right.x, right.y)),
        _ => None,
    }
}

fn midpoint(a: &Keypoint, b: &Keypoint) -> (f64, f64) {
    ((a.x + b.x) / 2.0, (a.y + b.y) / 2.0)
}

/// Angle in degrees between (dx, dy) and screen-down (0, 1).
fn angle_from_down(dx: f64, dy: f64) -> Option<f64> {
    let len = (dx * dx + dy * dy).sqrt();
    if !len.is_finite() || len < MIN_VECTOR_LENGTH {
        return None;
    }
    let cos = (dy / len).clamp(-1.0, 1.0);
    Some(cos.acos().to_degrees())
}
