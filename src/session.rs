//! Per-video mode selection.
//!
//! Opening a video looks up its pose track. A hit replays stored angles and
//! derives reps once, offline; playback never feeds the rep counter again. A
//! miss starts an extraction, or joins the one already running for the same
//! key. Dropping or cancelling a session releases its claim on the
//! extraction; the last session out cancels it. A cancelled extraction stays
//! registered until it has wound down, and new opens for its key wait for
//! that before starting over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;

use crate::analyzer::{AnalysisSettings, AngleReadout, TrackAnalysis};
use crate::cache::PoseTrackCache;
use crate::db::models::CacheKey;
use crate::events::{EventSender, PipelineEvent};
use crate::extract::{DEFAULT_PROGRESS_EVERY, ExtractError, Extractor, RunControl};
use crate::source::{FrameSource, SourceError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Extraction cancelled")]
    Cancelled,
    #[error("Extraction failed: {0}")]
    Failed(String),
}

impl From<ExtractError> for SessionError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Cancelled => Self::Cancelled,
            other => Self::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No stored track; reps are counted live as frames arrive.
    Extracting,
    /// Stored track found; reps were derived once from it.
    Cached,
}

type SharedExtraction = Shared<BoxFuture<'static, Result<Arc<TrackAnalysis>, SessionError>>>;

struct InFlight {
    id: u64,
    control: RunControl,
    waiters: usize,
    /// Cancelled by its last session; no longer joinable.
    cancelled: bool,
    result: SharedExtraction,
}

impl InFlight {
    fn joinable(&self) -> bool {
        !self.cancelled && self.result.peek().is_none()
    }
}

type Registry = Arc<Mutex<HashMap<CacheKey, InFlight>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<CacheKey, InFlight>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decides, per opened video, whether to extract or replay. Shared by every
/// session using the same cache.
pub struct ModeSelector {
    cache: Arc<dyn PoseTrackCache>,
    model_id: String,
    model_version: String,
    settings: AnalysisSettings,
    events: EventSender,
    progress_every: u64,
    in_flight: Registry,
    next_id: AtomicU64,
}

impl ModeSelector {
    pub fn new(cache: Arc<dyn PoseTrackCache>, model_id: impl Into<String>) -> Self {
        Self {
            cache,
            model_id: model_id.into(),
            model_version: String::new(),
            settings: AnalysisSettings::default(),
            events: EventSender::disabled(),
            progress_every: DEFAULT_PROGRESS_EVERY,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }

    pub fn settings(mut self, settings: AnalysisSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn progress_every(mut self, frames: u64) -> Self {
        self.progress_every = frames;
        self
    }

    pub fn key_for(&self, content_hash: &str) -> CacheKey {
        CacheKey::new(content_hash, self.model_id.clone())
    }

    /// Number of extractions currently running and not cancelled.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).values().filter(|entry| !entry.cancelled).count()
    }

    /// Open a video by content hash. `make_source` is only called when a new
    /// extraction has to start.
    pub async fn open<F>(&self, content_hash: &str, make_source: F) -> Result<VideoSession, SessionError>
    where
        F: FnOnce() -> Result<Box<dyn FrameSource>, SourceError>,
    {
        let key = self.key_for(content_hash);

        if let Some(session) = self.join(&key) {
            return Ok(session);
        }
        if let Some(analysis) = self.lookup(&key).await {
            log::info!("Cache hit for {key}: {} reps", analysis.rep_count());
            self.events.send(PipelineEvent::CacheHit {
                key: key.clone(),
                frame_count: analysis.track.frames.len() as u64,
                rep_count: analysis.rep_count(),
            });
            return Ok(VideoSession {
                key,
                mode: Mode::Cached,
                state: SessionState::Ready(Arc::new(analysis)),
            });
        }
        self.start(key, make_source).await
    }

    /// Extract regardless of what the cache holds. Still joins a running
    /// extraction for the same key.
    pub async fn extract<F>(&self, content_hash: &str, make_source: F) -> Result<VideoSession, SessionError>
    where
        F: FnOnce() -> Result<Box<dyn FrameSource>, SourceError>,
    {
        self.start(self.key_for(content_hash), make_source).await
    }

    /// Attach to a running extraction for `key`, if there is one.
    fn join(&self, key: &CacheKey) -> Option<VideoSession> {
        let mut map = lock(&self.in_flight);
        self.join_locked(&mut map, key)
    }

    fn join_locked(&self, map: &mut HashMap<CacheKey, InFlight>, key: &CacheKey) -> Option<VideoSession> {
        let entry = map.get_mut(key).filter(|entry| entry.joinable())?;
        entry.waiters += 1;
        log::debug!("Joining extraction of {key} ({} waiters)", entry.waiters);
        Some(VideoSession {
            key: key.clone(),
            mode: Mode::Extracting,
            state: SessionState::Pending(Pending {
                id: entry.id,
                result: entry.result.clone(),
                registry: Arc::clone(&self.in_flight),
            }),
        })
    }

    /// Cache read plus the offline rep pass, off the async runtime. Any
    /// failure is a miss.
    async fn lookup(&self, key: &CacheKey) -> Option<TrackAnalysis> {
        let cache = Arc::clone(&self.cache);
        let settings = self.settings.clone();
        let lookup_key = key.clone();
        let lookup = tokio::task::spawn_blocking(move || {
            cache
                .get(&lookup_key)
                .map(|hit| hit.map(|track| TrackAnalysis::from_track(track, &settings)))
        })
        .await;

        match lookup {
            Ok(Ok(hit)) => hit,
            Ok(Err(e)) => {
                log::warn!("Cache lookup for {key} failed ({e}), treating as a miss");
                None
            }
            Err(e) => {
                log::warn!("Cache lookup task for {key} failed ({e}), treating as a miss");
                None
            }
        }
    }

    async fn start<F>(&self, key: CacheKey, make_source: F) -> Result<VideoSession, SessionError>
    where
        F: FnOnce() -> Result<Box<dyn FrameSource>, SourceError>,
    {
        loop {
            let settling = {
                // Held until the new entry is registered, so a concurrent miss
                // on the same key joins this run instead of starting its own.
                let mut map = lock(&self.in_flight);
                if let Some(session) = self.join_locked(&mut map, &key) {
                    return Ok(session);
                }
                let winding_down = map
                    .get(&key)
                    .filter(|entry| entry.cancelled && entry.result.peek().is_none())
                    .map(|entry| entry.result.clone());
                match winding_down {
                    Some(result) => result,
                    None => return self.launch(&mut map, key, make_source),
                }
            };
            log::debug!("Waiting for cancelled extraction of {key} to wind down");
            let _ = settling.await;
        }
    }

    /// Register and spawn a new extraction. Replaces any finished entry
    /// under the same key.
    fn launch<F>(
        &self,
        map: &mut HashMap<CacheKey, InFlight>,
        key: CacheKey,
        make_source: F,
    ) -> Result<VideoSession, SessionError>
    where
        F: FnOnce() -> Result<Box<dyn FrameSource>, SourceError>,
    {
        let mut source = match make_source() {
            Ok(source) => source,
            Err(e) => {
                log::warn!("Could not open frame source for {key}: {e}");
                self.events.send(PipelineEvent::ExtractionFailed {
                    key: key.clone(),
                    error: e.to_string(),
                });
                return Err(SessionError::Failed(e.to_string()));
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let control = RunControl::new();
        let extractor = Extractor::new(key.clone(), self.settings.clone())
            .model_version(self.model_version.clone())
            .cache(Arc::clone(&self.cache))
            .events(self.events.clone())
            .progress_every(self.progress_every);

        let run_control = control.clone();
        let result: SharedExtraction = async move {
            extractor
                .run(source.as_mut(), &run_control)
                .await
                .map(Arc::new)
                .map_err(SessionError::from)
        }
        .boxed()
        .shared();

        map.insert(
            key.clone(),
            InFlight {
                id,
                control,
                waiters: 1,
                cancelled: false,
                result: result.clone(),
            },
        );

        // Drive the extraction even while no session is polling it, then
        // deregister. A newer entry under the same key is left alone.
        let registry = Arc::clone(&self.in_flight);
        let driver_key = key.clone();
        let driven = result.clone();
        tokio::spawn(async move {
            let _ = driven.await;
            let mut map = lock(&registry);
            if map.get(&driver_key).is_some_and(|entry| entry.id == id) {
                map.remove(&driver_key);
            }
        });

        Ok(VideoSession {
            key,
            mode: Mode::Extracting,
            state: SessionState::Pending(Pending {
                id,
                result,
                registry: Arc::clone(&self.in_flight),
            }),
        })
    }
}

struct Pending {
    id: u64,
    result: SharedExtraction,
    registry: Registry,
}

impl Pending {
    /// Drop this session's claim. The last claim cancels the run when asked.
    fn release(&self, key: &CacheKey, cancel_if_last: bool) {
        let mut map = lock(&self.registry);
        let Some(entry) = map.get_mut(key) else {
            return;
        };
        if entry.id != self.id {
            return;
        }
        entry.waiters = entry.waiters.saturating_sub(1);
        if entry.waiters > 0 || !cancel_if_last {
            return;
        }
        if entry.control.cancel() {
            log::info!("Last session left {key}, cancelling extraction");
            entry.cancelled = true;
        } else {
            log::debug!("Last session left {key}, extraction already committed");
        }
    }
}

enum SessionState {
    Ready(Arc<TrackAnalysis>),
    Pending(Pending),
    Closed(SessionError),
}

/// What the player shows at a playback position.
#[derive(Debug, Clone, PartialEq)]
pub struct Playback {
    pub readout: AngleReadout,
    /// Reps whose closing `Top` is at or before the position.
    pub reps_so_far: usize,
    pub total_reps: usize,
}

/// One opened video. Dropping it tears the session down.
pub struct VideoSession {
    key: CacheKey,
    mode: Mode,
    state: SessionState,
}

impl VideoSession {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The finished analysis, once available.
    pub fn analysis(&self) -> Option<&Arc<TrackAnalysis>> {
        match &self.state {
            SessionState::Ready(analysis) => Some(analysis),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.analysis().is_some()
    }

    /// Wait for the analysis. Immediate in cached mode.
    pub async fn wait(&mut self) -> Result<Arc<TrackAnalysis>, SessionError> {
        let pending = match &self.state {
            SessionState::Ready(analysis) => return Ok(Arc::clone(analysis)),
            SessionState::Closed(e) => return Err(e.clone()),
            SessionState::Pending(pending) => pending,
        };

        let outcome = pending.result.clone().await;
        pending.release(&self.key, false);
        self.state = match &outcome {
            Ok(analysis) => SessionState::Ready(Arc::clone(analysis)),
            Err(e) => SessionState::Closed(e.clone()),
        };
        outcome
    }

    /// Leave the session. A pending extraction is cancelled if no other
    /// session is waiting on it.
    pub fn cancel(&mut self) {
        if let SessionState::Pending(pending) = &self.state {
            pending.release(&self.key, true);
        }
        self.state = SessionState::Closed(SessionError::Cancelled);
    }

    pub fn rep_count(&self) -> Option<usize> {
        self.analysis().map(|a| a.rep_count())
    }

    /// Readout for a playback position. Pure lookup into the finished
    /// analysis: seeking or replaying never changes the counts.
    pub fn playback(&self, time: f64) -> Option<Playback> {
        let analysis = self.analysis()?;
        Some(Playback {
            readout: analysis.readout_at(time),
            reps_so_far: analysis.reps_completed_by(time),
            total_reps: analysis.rep_count(),
        })
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        if let SessionState::Pending(pending) = &self.state {
            pending.release(&self.key, true);
        }
    }
}
