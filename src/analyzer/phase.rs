//! Swing phase classification.
//!
//! `classify` is a pure nearest-reference lookup. `PhaseState` adds hysteresis
//! on top: it is a small `Copy` value that callers thread through each call,
//! so every session owns its own state.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::angles::Angles;

/// The four body configurations of a swing, in cycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SwingPhase {
    Top,
    Connect,
    Bottom,
    Release,
}

impl SwingPhase {
    pub const ALL: [SwingPhase; 4] = [Self::Top, Self::Connect, Self::Bottom, Self::Release];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Next phase in the cycle `Top → Connect → Bottom → Release → Top`.
    pub fn next(self) -> Self {
        Self::ALL[(self.index() + 1) % Self::ALL.len()]
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Connect => "connect",
            Self::Bottom => "bottom",
            Self::Release => "release",
        }
    }
}

impl fmt::Display for SwingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reference `(spine, arm-to-vertical)` pair for one phase, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseReference {
    pub spine: f64,
    pub arm: f64,
}

impl PhaseReference {
    pub const fn new(spine: f64, arm: f64) -> Self {
        Self { spine, arm }
    }

    /// Combined angular distance (L1 over both angles).
    pub fn distance(&self, angles: &Angles) -> f64 {
        (angles.spine_angle - self.spine).abs() + (angles.arm_to_vertical_angle - self.arm).abs()
    }
}

/// Classifier tuning. Loaded from the `[analysis.phase]` config table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseThresholds {
    pub top: PhaseReference,
    pub connect: PhaseReference,
    pub bottom: PhaseReference,
    pub release: PhaseReference,
    /// A new phase that beats the held one by more than this is accepted at once.
    pub noise_band_degrees: f64,
    /// Consecutive observations needed otherwise (first sighting counts as one).
    pub confirm_frames: u32,
}

impl Default for PhaseThresholds {
    fn default() -> Self {
        Self {
            top: PhaseReference::new(15.0, 160.0),
            connect: PhaseReference::new(35.0, 40.0),
            bottom: PhaseReference::new(50.0, 30.0),
            release: PhaseReference::new(25.0, 130.0),
            noise_band_degrees: 20.0,
            confirm_frames: 2,
        }
    }
}

impl PhaseThresholds {
    pub fn reference(&self, phase: SwingPhase) -> &PhaseReference {
        match phase {
            SwingPhase::Top => &self.top,
            SwingPhase::Connect => &self.connect,
            SwingPhase::Bottom => &self.bottom,
            SwingPhase::Release => &self.release,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseMatch {
    pub phase: SwingPhase,
    pub distance: f64,
}

/// Nearest reference phase. Ties resolve in cycle order starting at `Top`.
pub fn classify(angles: &Angles, thresholds: &PhaseThresholds) -> PhaseMatch {
    let mut best = PhaseMatch {
        phase: SwingPhase::Top,
        distance: thresholds.top.distance(angles),
    };
    for phase in &SwingPhase::ALL[1..] {
        let distance = thresholds.reference(*phase).distance(angles);
        if distance < best.distance {
            best = PhaseMatch { phase: *phase, distance };
        }
    }
    best
}

/// What one observation did to the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseUpdate {
    /// Raw nearest phase for this frame; `None` when the frame has no angles.
    pub observed: Option<SwingPhase>,
    /// Phase held after this frame; `None` until anything has been classified.
    pub held: Option<SwingPhase>,
    /// Set when this frame confirmed a change of held phase.
    pub entered: Option<SwingPhase>,
}

/// Hysteresis state for one session.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseState {
    current: Option<SwingPhase>,
    candidate: Option<SwingPhase>,
    confirm_count: u32,
}

impl PhaseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<SwingPhase> {
        self.current
    }

    /// Feed one frame's angles. Frames without angles leave the state untouched.
    #[must_use]
    pub fn advance(self, angles: Option<&Angles>, thresholds: &PhaseThresholds) -> (Self, PhaseUpdate) {
        let Some(angles) = angles else {
            let update = PhaseUpdate {
                observed: None,
                held: self.current,
                entered: None,
            };
            return (self, update);
        };

        let nearest = classify(angles, thresholds);
        let observed = Some(nearest.phase);

        let Some(current) = self.current else {
            return Self::switch_to(nearest.phase);
        };

        if nearest.phase == current {
            let state = Self {
                current: Some(current),
                candidate: None,
                confirm_count: 0,
            };
            let update = PhaseUpdate {
                observed,
                held: Some(current),
                entered: None,
            };
            return (state, update);
        }

        let margin = thresholds.reference(current).distance(angles) - nearest.distance;
        if margin > thresholds.noise_band_degrees {
            return Self::switch_to(nearest.phase);
        }

        let confirm_count = if self.candidate == Some(nearest.phase) {
            self.confirm_count + 1
        } else {
            1
        };
        if confirm_count >= thresholds.confirm_frames {
            return Self::switch_to(nearest.phase);
        }

        let state = Self {
            current: Some(current),
            candidate: Some(nearest.phase),
            confirm_count,
        };
        let update = PhaseUpdate {
            observed,
            held: Some(current),
            entered: None,
        };
        (state, update)
    }

    fn switch_to(phase: SwingPhase) -> (Self, PhaseUpdate) {
        let state = Self {
            current: Some(phase),
            candidate: None,
            confirm_count: 0,
        };
        let update = PhaseUpdate {
            observed: Some(phase),
            held: Some(phase),
            entered: Some(phase),
        };
        (state, update)
    }
}
