pub mod synthetic;
pub mod track;

use serde::{Deserialize, Deserializer, Serialize};

use crate::analyzer::angles::Angles;

pub use track::{KEYPOINT_FORMAT, PoseTrack, PoseTrackMetadata, TrackError};

/// COCO-17 keypoint layout, the order every frame's `keypoints` follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum KeypointIndex {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl KeypointIndex {
    pub const COUNT: usize = 17;

    pub const NAMES: [&'static str; Self::COUNT] = [
        "nose",
        "left_eye",
        "right_eye",
        "left_ear",
        "right_ear",
        "left_shoulder",
        "right_shoulder",
        "left_elbow",
        "right_elbow",
        "left_wrist",
        "right_wrist",
        "left_hip",
        "right_hip",
        "left_knee",
        "right_knee",
        "left_ankle",
        "right_ankle",
    ];

    pub fn name(self) -> &'static str {
        Self::NAMES[self as usize]
    }
}

/// Landmarks in the full BlazePose layout.
pub const BLAZEPOSE_COUNT: usize = 33;

/// BlazePose-33 landmark that fills each COCO-17 slot.
pub const BLAZEPOSE_TO_COCO: [usize; KeypointIndex::COUNT] =
    [0, 2, 5, 7, 8, 11, 12, 13, 14, 15, 16, 23, 24, 25, 26, 27, 28];

/// Rearrange keypoints into COCO-17 order. COCO-17 and BlazePose-33 lists
/// are mapped by position unless their names disagree; anything else is
/// looked up by name. `None` when a landmark cannot be found.
pub fn coco_layout(mut keypoints: Vec<Keypoint>) -> Option<Vec<Keypoint>> {
    let named_as = |kp: &Keypoint, slot: usize| {
        kp.name.as_deref().is_none_or(|name| name == KeypointIndex::NAMES[slot])
    };

    match keypoints.len() {
        0 => return Some(keypoints),
        KeypointIndex::COUNT if keypoints.iter().enumerate().all(|(slot, kp)| named_as(kp, slot)) => {
            return Some(keypoints);
        }
        BLAZEPOSE_COUNT
            if BLAZEPOSE_TO_COCO
                .iter()
                .enumerate()
                .all(|(slot, &src)| named_as(&keypoints[src], slot)) =>
        {
            return Some(
                BLAZEPOSE_TO_COCO
                    .iter()
                    .zip(KeypointIndex::NAMES)
                    .map(|(&src, name)| Keypoint {
                        name: Some(name.to_string()),
                        ..keypoints[src].clone()
                    })
                    .collect(),
            );
        }
        _ => {}
    }

    KeypointIndex::NAMES
        .iter()
        .map(|&name| {
            let pos = keypoints.iter().position(|kp| kp.name.as_deref() == Some(name))?;
            Some(keypoints.swap_remove(pos))
        })
        .collect()
}

/// One tracked body landmark in frame pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    /// Detection confidence, 0..1. Older extractors call this `score`.
    #[serde(alias = "score")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Keypoint {
    pub fn new(x: f64, y: f64, confidence: f64) -> Self {
        Self { x, y, confidence, name: None }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.confidence.is_finite()
    }

    /// Confidence at or above `floor`.
    pub fn is_usable(&self, floor: f64) -> bool {
        self.confidence.is_finite() && self.confidence >= floor
    }
}

/// A single frame of pose output. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseFrame {
    pub frame_index: u64,
    /// Milliseconds from video start.
    #[serde(deserialize_with = "de_millis")]
    pub timestamp: i64,
    /// Seconds from video start.
    pub video_time: f64,
    /// Either `KeypointIndex::COUNT` landmarks or empty when nothing was detected.
    #[serde(default)]
    pub keypoints: Vec<Keypoint>,
    #[serde(alias = "score", default)]
    pub overall_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angles: Option<Angles>,
}

impl PoseFrame {
    /// Keypoint at a COCO index, if the frame carries a full layout.
    pub fn keypoint(&self, index: KeypointIndex) -> Option<&Keypoint> {
        if self.keypoints.len() != KeypointIndex::COUNT {
            return None;
        }
        self.keypoints.get(index as usize)
    }

    /// Every number in the frame is finite, so it survives a JSON round trip.
    pub fn is_finite(&self) -> bool {
        self.video_time.is_finite()
            && self.overall_score.is_finite()
            && self.keypoints.iter().all(Keypoint::is_finite)
            && self.angles.is_none_or(|a| {
                a.spine_angle.is_finite()
                    && a.arm_to_vertical_angle.is_finite()
                    && a.arm_to_spine_angle.is_finite()
            })
    }

    pub fn has_pose(&self) -> bool {
        self.angles.is_some()
    }
}

/// What a frame source yields: a frame before the pipeline attaches angles.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub frame_index: u64,
    pub video_time: f64,
    pub keypoints: Vec<Keypoint>,
    pub overall_score: f64,
}

impl RawFrame {
    /// Attach computed angles, producing the immutable pipeline frame.
    /// Keypoints with non-finite values become zero-confidence landmarks at
    /// the origin.
    pub fn into_pose_frame(self, angles: Option<Angles>) -> PoseFrame {
        let keypoints = self
            .keypoints
            .into_iter()
            .map(|kp| {
                if kp.is_finite() {
                    kp
                } else {
                    Keypoint { x: 0.0, y: 0.0, confidence: 0.0, ..kp }
                }
            })
            .collect();
        PoseFrame {
            frame_index: self.frame_index,
            timestamp: (self.video_time * 1000.0).round() as i64,
            video_time: self.video_time,
            keypoints,
            overall_score: if self.overall_score.is_finite() { self.overall_score } else { 0.0 },
            angles,
        }
    }
}

impl From<&PoseFrame> for RawFrame {
    fn from(frame: &PoseFrame) -> Self {
        Self {
            frame_index: frame.frame_index,
            video_time: frame.video_time,
            keypoints: frame.keypoints.clone(),
            overall_score: frame.overall_score,
        }
    }
}

/// Older extractors write fractional milliseconds (`33.33`); round to whole ms.
fn de_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Ok(value.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypoint_names_match_layout() {
        assert_eq!(KeypointIndex::LeftShoulder.name(), "left_shoulder");
        assert_eq!(KeypointIndex::RightAnkle.name(), "right_ankle");
        assert_eq!(KeypointIndex::NAMES.len(), KeypointIndex::COUNT);
    }

    #[test]
    fn test_frame_accepts_legacy_field_names() {
        let json = r#"{
            "frameIndex": 3,
            "timestamp": 100.04,
            "videoTime": 0.1,
            "keypoints": [{"x": 1.0, "y": 2.0, "z": 0.0, "score": 0.9, "name": "nose"}],
            "score": 0.75
        }"#;
        let frame: PoseFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.frame_index, 3);
        assert_eq!(frame.timestamp, 100);
        assert_eq!(frame.keypoints[0].confidence, 0.9);
        assert_eq!(frame.overall_score, 0.75);
        assert!(frame.angles.is_none());
    }

    #[test]
    fn test_short_keypoint_list_has_no_landmarks() {
        let frame = RawFrame {
            frame_index: 0,
            video_time: 0.0,
            keypoints: vec![Keypoint::new(1.0, 1.0, 1.0)],
            overall_score: 1.0,
        }
        .into_pose_frame(None);
        assert!(frame.keypoint(KeypointIndex::Nose).is_none());
        assert!(!frame.has_pose());
    }

    #[test]
    fn test_timestamp_derived_from_video_time() {
        let frame = RawFrame {
            frame_index: 45,
            video_time: 1.5,
            keypoints: Vec::new(),
            overall_score: 0.0,
        }
        .into_pose_frame(None);
        assert_eq!(frame.timestamp, 1500);
    }

    #[test]
    fn test_non_finite_keypoints_are_zeroed() {
        let mut nan = Keypoint::new(f64::NAN, 4.0, 0.9);
        nan.name = Some("nose".into());
        let frame = RawFrame {
            frame_index: 0,
            video_time: 0.0,
            keypoints: vec![nan, Keypoint::new(1.0, 2.0, f64::INFINITY), Keypoint::new(1.0, 2.0, 0.5)],
            overall_score: f64::NAN,
        }
        .into_pose_frame(None);
        assert!(frame.is_finite());
        assert_eq!(frame.keypoints[0].confidence, 0.0);
        assert_eq!(frame.keypoints[0].name.as_deref(), Some("nose"));
        assert_eq!(frame.keypoints[1], Keypoint::new(0.0, 0.0, 0.0));
        assert_eq!(frame.keypoints[2], Keypoint::new(1.0, 2.0, 0.5));
        assert_eq!(frame.overall_score, 0.0);
    }

    /// BlazePose-33 list where landmark `i` sits at (i, i).
    fn blazepose(named: bool) -> Vec<Keypoint> {
        (0..BLAZEPOSE_COUNT)
            .map(|i| {
                let mut kp = Keypoint::new(i as f64, i as f64, 0.9);
                if named {
                    kp.name = Some(format!("landmark_{i}"));
                }
                kp
            })
            .collect()
    }

    #[test]
    fn test_blazepose_maps_by_position() {
        let coco = coco_layout(blazepose(false)).unwrap();
        assert_eq!(coco.len(), KeypointIndex::COUNT);
        assert_eq!(coco[KeypointIndex::LeftShoulder as usize].x, 11.0);
        assert_eq!(coco[KeypointIndex::RightWrist as usize].x, 16.0);
        assert_eq!(coco[KeypointIndex::LeftHip as usize].x, 23.0);
        assert_eq!(coco[KeypointIndex::RightAnkle as usize].x, 28.0);
        assert_eq!(coco[KeypointIndex::RightHip as usize].name.as_deref(), Some("right_hip"));
    }

    #[test]
    fn test_unknown_order_maps_by_name() {
        let mut kps: Vec<Keypoint> = KeypointIndex::NAMES
            .iter()
            .enumerate()
            .map(|(i, name)| Keypoint {
                name: Some(name.to_string()),
                ..Keypoint::new(i as f64, 0.0, 0.9)
            })
            .collect();
        kps.reverse();
        let coco = coco_layout(kps).unwrap();
        for (slot, kp) in coco.iter().enumerate() {
            assert_eq!(kp.x, slot as f64);
        }
    }

    #[test]
    fn test_unmappable_layout_is_rejected() {
        // Right length, wrong names.
        assert!(coco_layout(blazepose(true)).is_none());
        assert!(coco_layout(vec![Keypoint::new(1.0, 1.0, 1.0); 5]).is_none());
        assert_eq!(coco_layout(Vec::new()), Some(Vec::new()));
    }
}
