//! Repetition counting.
//!
//! A rep is one closed `Top → Connect → Bottom → Release → Top` cycle. The
//! counter consumes confirmed phase changes in frame order; out-of-order
//! phases are ignored without dropping the rep in progress, and a rep that
//! never returns to `Top` is never counted.

use serde::{Deserialize, Serialize};

use super::angles::Angles;
use super::phase::{PhaseUpdate, SwingPhase};
use crate::pose::PoseFrame;

/// Representative frame for one phase of one rep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub rep_number: u32,
    pub phase: SwingPhase,
    pub frame_index: u64,
    pub video_time: f64,
    pub angles: Angles,
}

/// A completed rep. Never mutated once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repetition {
    /// 1-based.
    pub rep_number: u32,
    /// One per phase, indexed by `SwingPhase::index()`.
    pub checkpoints: [Checkpoint; 4],
    pub completed_at_video_time: f64,
}

impl Repetition {
    pub fn checkpoint(&self, phase: SwingPhase) -> &Checkpoint {
        &self.checkpoints[phase.index()]
    }

    /// The closing `Top` checkpoint.
    pub fn top(&self) -> &Checkpoint {
        self.checkpoint(SwingPhase::Top)
    }
}

/// First frame a phase was observed in since the last confirmed change.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sighting {
    frame_index: u64,
    video_time: f64,
    angles: Angles,
}

impl Sighting {
    fn into_checkpoint(self, rep_number: u32, phase: SwingPhase) -> Checkpoint {
        Checkpoint {
            rep_number,
            phase,
            frame_index: self.frame_index,
            video_time: self.video_time,
            angles: self.angles,
        }
    }
}

/// How far the rep in progress has come.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Progress {
    #[default]
    Idle,
    Connect,
    Bottom,
    Release,
}

#[derive(Debug, Clone, Default)]
pub struct RepCounter {
    progress: Progress,
    /// Connect, Bottom, Release sightings of the rep in progress.
    pending: [Option<Sighting>; 3],
    first_seen: [Option<Sighting>; 4],
    completed: u32,
}

impl RepCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed reps so far.
    pub fn count(&self) -> u32 {
        self.completed
    }

    /// Whether a cycle has started but not closed.
    pub fn in_progress(&self) -> bool {
        self.progress != Progress::Idle
    }

    /// Consume one frame and the classifier's verdict on it. Returns the rep
    /// this frame completed, if any.
    pub fn observe(&mut self, frame: &PoseFrame, update: &PhaseUpdate) -> Option<Repetition> {
        if let (Some(observed), Some(angles)) = (update.observed, frame.angles) {
            self.first_seen[observed.index()].get_or_insert(Sighting {
                frame_index: frame.frame_index,
                video_time: frame.video_time,
                angles,
            });
        }

        let entered = update.entered?;
        let sighting = self.first_seen[entered.index()].take();
        self.first_seen = [None; 4];
        // `entered` always comes with angles for this frame, so a sighting exists.
        let sighting = sighting?;

        match (entered, self.progress) {
            (SwingPhase::Connect, Progress::Idle) => {
                self.pending = [Some(sighting), None, None];
                self.progress = Progress::Connect;
            }
            (SwingPhase::Bottom, Progress::Connect) => {
                self.pending[1] = Some(sighting);
                self.progress = Progress::Bottom;
            }
            (SwingPhase::Release, Progress::Bottom) => {
                self.pending[2] = Some(sighting);
                self.progress = Progress::Release;
            }
            (SwingPhase::Top, Progress::Release) => {
                return self.complete(sighting, frame.video_time);
            }
            (phase, progress) => {
                log::trace!(
                    "Ignoring out-of-order {} at frame {} (progress {:?})",
                    phase,
                    frame.frame_index,
                    progress
                );
            }
        }
        None
    }

    fn complete(&mut self, top: Sighting, completed_at: f64) -> Option<Repetition> {
        let [Some(connect), Some(bottom), Some(release)] = self.pending else {
            self.reset();
            return None;
        };
        self.completed += 1;
        let n = self.completed;
        self.reset();

        Some(Repetition {
            rep_number: n,
            checkpoints: [
                top.into_checkpoint(n, SwingPhase::Top),
                connect.into_checkpoint(n, SwingPhase::Connect),
                bottom.into_checkpoint(n, SwingPhase::Bottom),
                release.into_checkpoint(n, SwingPhase::Release),
            ],
            completed_at_video_time: completed_at,
        })
    }

    fn reset(&mut self) {
        self.progress = Progress::Idle;
        self.pending = [None; 3];
    }
}
