//! First-time extraction: drive a frame source through the analyzer, publish
//! reps as they close, and store the finished track.
//!
//! Frames are consumed one at a time in arrival order. A run commits its
//! result at most once, right before the cache write. A cancel lands either
//! before the commit, and the draft is discarded unwritten, or after it, and
//! the run completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::analyzer::{AnalysisSettings, SwingAnalyzer, TrackAnalysis};
use crate::cache::PoseTrackCache;
use crate::db::models::CacheKey;
use crate::events::{EventSender, PipelineEvent, RepEvent};
use crate::pose::track::FORMAT_VERSION;
use crate::pose::{KEYPOINT_FORMAT, KeypointIndex, PoseFrame, PoseTrack, PoseTrackMetadata};
use crate::source::{FrameSource, SourceError, SourceInfo};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Extraction cancelled")]
    Cancelled,
    #[error("Frame source error: {0}")]
    Source(#[from] SourceError),
}

/// Default number of frames between progress events.
pub const DEFAULT_PROGRESS_EVERY: u64 = 30;

const RUNNING: u8 = 0;
const CANCELLED: u8 = 1;
const COMMITTED: u8 = 2;

/// Stop switch for a single run. Cancel and commit race on one atomic, so
/// exactly one of them wins.
#[derive(Clone, Debug, Default)]
pub struct RunControl {
    token: CancellationToken,
    state: Arc<AtomicU8>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the run. Returns false when it already committed its result,
    /// in which case it runs to completion.
    pub fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.token.cancel();
        }
        won
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    fn commit(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// One extraction job for one (video, model) key.
#[derive(Clone)]
pub struct Extractor {
    key: CacheKey,
    model_version: String,
    settings: AnalysisSettings,
    cache: Option<Arc<dyn PoseTrackCache>>,
    events: EventSender,
    progress_every: u64,
}

impl Extractor {
    pub fn new(key: CacheKey, settings: AnalysisSettings) -> Self {
        Self {
            key,
            model_version: String::new(),
            settings,
            cache: None,
            events: EventSender::disabled(),
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }

    pub fn model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }

    /// Store the finished track here. Without a cache the result is only returned.
    pub fn cache(mut self, cache: Arc<dyn PoseTrackCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// 0 disables progress events.
    pub fn progress_every(mut self, frames: u64) -> Self {
        self.progress_every = frames;
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Run to completion or cancellation. `control` must be fresh.
    pub async fn run(
        &self,
        source: &mut dyn FrameSource,
        control: &RunControl,
    ) -> Result<TrackAnalysis, ExtractError> {
        let started = Instant::now();
        let info = source.info();
        log::info!("Extracting {} ({})", self.key, info.video_name);
        self.events.send(PipelineEvent::ExtractionStarted {
            key: self.key.clone(),
            total_frames: info.total_frames,
        });

        let mut analyzer = SwingAnalyzer::new(self.settings.clone());
        let mut frames: Vec<PoseFrame> = Vec::new();
        let mut phases = Vec::new();
        let mut repetitions = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = control.cancelled() => None,
                next = source.next_frame() => Some(next),
            };
            let Some(next) = next else {
                return Err(self.abort(source, frames.len()));
            };

            let raw = match next {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Frame source for {} failed: {e}", self.key);
                    source.cancel();
                    self.events.send(PipelineEvent::ExtractionFailed {
                        key: self.key.clone(),
                        error: e.to_string(),
                    });
                    return Err(e.into());
                }
            };

            if !raw.video_time.is_finite() {
                log::warn!("Skipping frame {} with no usable video time", raw.frame_index);
                continue;
            }
            if let Some(last) = frames.last() {
                if raw.frame_index <= last.frame_index || raw.video_time < last.video_time {
                    log::warn!(
                        "Skipping out-of-order frame {} ({:.3}s) after frame {}",
                        raw.frame_index,
                        raw.video_time,
                        last.frame_index
                    );
                    continue;
                }
            }

            let (frame, outcome) = analyzer.process(raw);
            log::trace!(
                "frame {} t={:.3} phase={:?} entered={:?}",
                frame.frame_index,
                frame.video_time,
                outcome.phase,
                outcome.entered
            );
            frames.push(frame);
            phases.push(outcome.phase);

            if let Some(rep) = outcome.repetition {
                self.events.send(PipelineEvent::RepDetected {
                    key: self.key.clone(),
                    rep: RepEvent::from(&rep),
                });
                repetitions.push(rep);
            }

            let processed = frames.len() as u64;
            if self.progress_every > 0 && processed % self.progress_every == 0 {
                self.events.send(PipelineEvent::ExtractionProgress {
                    key: self.key.clone(),
                    frames_processed: processed,
                    percent: info
                        .total_frames
                        .filter(|&total| total > 0)
                        .map(|total| (processed as f64 / total as f64 * 100.0).min(100.0)),
                });
            }
        }

        let frames_processed = frames.len();
        let track = self.finish_track(&info, frames);
        let Some(track) = self.commit(track, control).await else {
            return Err(self.abort(source, frames_processed));
        };

        let analysis = TrackAnalysis::from_parts(track, repetitions, phases);
        let elapsed = started.elapsed();
        log::info!(
            "Extracted {}: {} frames, {} reps in {:.1}s",
            self.key,
            analysis.track.frames.len(),
            analysis.rep_count(),
            elapsed.as_secs_f64()
        );
        self.events.send(PipelineEvent::ExtractionComplete {
            key: self.key.clone(),
            frame_count: analysis.track.frames.len() as u64,
            rep_count: analysis.rep_count(),
            elapsed,
        });
        Ok(analysis)
    }

    fn abort(&self, source: &mut dyn FrameSource, frames_processed: usize) -> ExtractError {
        source.cancel();
        log::info!(
            "Extraction of {} cancelled after {frames_processed} frames, draft discarded",
            self.key
        );
        self.events.send(PipelineEvent::ExtractionCancelled {
            key: self.key.clone(),
            frames_processed: frames_processed as u64,
        });
        ExtractError::Cancelled
    }

    fn finish_track(&self, info: &SourceInfo, frames: Vec<PoseFrame>) -> PoseTrack {
        let last_time = frames.last().map(|f| f.video_time).unwrap_or(0.0);
        let fps = if info.fps.is_finite() && info.fps > 0.0 {
            info.fps
        } else if frames.len() > 1 && last_time > 0.0 {
            (frames.len() - 1) as f64 / last_time
        } else {
            0.0
        };
        let duration = if info.duration_seconds.is_finite() && info.duration_seconds > 0.0 {
            info.duration_seconds
        } else {
            last_time
        };

        PoseTrack {
            metadata: PoseTrackMetadata {
                format_version: FORMAT_VERSION.to_string(),
                model_id: self.key.model_id.clone(),
                model_version: self.model_version.clone(),
                source_video_content_hash: self.key.content_hash.clone(),
                source_video_name: info.video_name.clone(),
                source_duration_seconds: duration,
                extracted_at: Utc::now(),
                frame_count: frames.len() as u64,
                fps,
                video_width: info.width,
                video_height: info.height,
                keypoint_format: Some(KEYPOINT_FORMAT.to_string()),
                keypoint_count: Some(KeypointIndex::COUNT as u32),
            },
            frames,
        }
    }

    /// Commit the finished track and write it to the cache off the async
    /// runtime. `None` when the run was cancelled first. Write failures are
    /// logged and the track is still returned for in-memory use.
    async fn commit(&self, track: PoseTrack, control: &RunControl) -> Option<PoseTrack> {
        if !control.commit() {
            log::info!("Skipped cache write for {}, extraction cancelled", self.key);
            return None;
        }
        let Some(cache) = &self.cache else {
            return Some(track);
        };

        let track = Arc::new(track);
        let write = {
            let cache = Arc::clone(cache);
            let key = self.key.clone();
            let track = Arc::clone(&track);
            tokio::task::spawn_blocking(move || cache.put(&key, &track))
        };

        match write.await {
            Ok(Ok(())) => log::debug!("Stored track for {}", self.key),
            Ok(Err(e)) => log::warn!("Failed to cache track for {}: {e}", self.key),
            Err(e) => log::warn!("Cache write task for {} failed: {e}", self.key),
        }

        Some(Arc::try_unwrap(track).unwrap_or_else(|shared| (*shared).clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::{DbError, Result as DbResult};
    use crate::pose::RawFrame;
    use crate::pose::synthetic::SyntheticTrack;
    use crate::source::ReplaySource;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn key() -> CacheKey {
        CacheKey::new("c0ffee", "blazepose")
    }

    fn drain(rx: &mut UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Replays frames and cancels `control` when asked for frame number `at`.
    struct CancellingSource {
        inner: ReplaySource,
        control: RunControl,
        at: usize,
        served: usize,
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FrameSource for CancellingSource {
        fn info(&self) -> SourceInfo {
            self.inner.info()
        }

        async fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
            if self.served == self.at {
                self.control.cancel();
            }
            self.served += 1;
            self.inner.next_frame().await
        }

        fn cancel(&mut self) {
            self.cancelled.store(true, Ordering::SeqCst);
            self.inner.cancel();
        }
    }

    struct FailingSource {
        served: usize,
    }

    #[async_trait]
    impl FrameSource for FailingSource {
        fn info(&self) -> SourceInfo {
            SourceInfo::default()
        }

        async fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
            self.served += 1;
            if self.served > 5 {
                return Err(SourceError::Backend("model crashed".into()));
            }
            let frame = SyntheticTrack::new(1).raw_frames().remove(self.served - 1);
            Ok(Some(frame))
        }

        fn cancel(&mut self) {}
    }

    struct BrokenCache;

    impl PoseTrackCache for BrokenCache {
        fn get(&self, _: &CacheKey) -> DbResult<Option<PoseTrack>> {
            Err(DbError::Poisoned)
        }
        fn put(&self, _: &CacheKey, _: &PoseTrack) -> DbResult<()> {
            Err(DbError::Poisoned)
        }
        fn evict(&self, _: &CacheKey) -> DbResult<bool> {
            Err(DbError::Poisoned)
        }
        fn clear(&self) -> DbResult<usize> {
            Err(DbError::Poisoned)
        }
        fn list_keys(&self) -> DbResult<Vec<CacheKey>> {
            Err(DbError::Poisoned)
        }
    }

    /// Holds every `put` until released, reporting when one begins.
    struct GatedCache {
        inner: MemoryCache,
        entered: std::sync::Mutex<std::sync::mpsc::Sender<()>>,
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl PoseTrackCache for GatedCache {
        fn get(&self, key: &CacheKey) -> DbResult<Option<PoseTrack>> {
            self.inner.get(key)
        }
        fn put(&self, key: &CacheKey, track: &PoseTrack) -> DbResult<()> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            self.inner.put(key, track)
        }
        fn evict(&self, key: &CacheKey) -> DbResult<bool> {
            self.inner.evict(key)
        }
        fn clear(&self) -> DbResult<usize> {
            self.inner.clear()
        }
        fn list_keys(&self) -> DbResult<Vec<CacheKey>> {
            self.inner.list_keys()
        }
    }

    #[test]
    fn test_cancel_and_commit_are_exclusive() {
        let control = RunControl::new();
        assert!(control.commit());
        assert!(!control.cancel());
        assert!(!control.is_cancelled());

        let control = RunControl::new();
        assert!(control.cancel());
        assert!(control.is_cancelled());
        assert!(!control.commit());
        assert!(!control.cancel());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_write_lets_the_write_finish() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let cache = Arc::new(GatedCache {
            inner: MemoryCache::new(),
            entered: std::sync::Mutex::new(entered_tx),
            release: std::sync::Mutex::new(release_rx),
        });
        let (events, mut rx) = EventSender::channel();
        let extractor = Extractor::new(key(), AnalysisSettings::default())
            .cache(cache.clone())
            .events(events);
        let control = RunControl::new();

        let run = {
            let control = control.clone();
            tokio::spawn(async move {
                let mut source = ReplaySource::from_synthetic(&SyntheticTrack::new(1), "swing.mp4");
                extractor.run(&mut source, &control).await
            })
        };
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(!control.cancel());
        release_tx.send(()).unwrap();

        let analysis = run.await.unwrap().unwrap();
        assert_eq!(analysis.rep_count(), 1);
        assert_eq!(cache.get(&key()).unwrap(), Some(analysis.track.clone()));
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, PipelineEvent::ExtractionCancelled { .. })));
    }

    #[tokio::test]
    async fn test_complete_run_stores_track_and_matches_offline_pass() {
        let synthetic = SyntheticTrack::new(3).transition_frames(4).jitter(2.0);
        let cache = Arc::new(MemoryCache::new());
        let (events, mut rx) = EventSender::channel();
        let extractor = Extractor::new(key(), AnalysisSettings::default())
            .model_version("test")
            .cache(cache.clone())
            .events(events);

        let mut source = ReplaySource::from_synthetic(&synthetic, "swing.mp4");
        let analysis = extractor.run(&mut source, &RunControl::new()).await.unwrap();
        assert_eq!(analysis.rep_count(), 3);

        let stored = cache.get(&key()).unwrap().unwrap();
        assert_eq!(stored, analysis.track);
        assert_eq!(stored.metadata.source_video_name, "swing.mp4");
        assert_eq!(stored.metadata.model_version, "test");

        let offline = TrackAnalysis::from_track(stored, &AnalysisSettings::default());
        assert_eq!(offline.repetitions, analysis.repetitions);

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(PipelineEvent::ExtractionStarted { .. })));
        let reps: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::RepDetected { rep, .. } => Some(rep.rep_number),
                _ => None,
            })
            .collect();
        assert_eq!(reps, vec![1, 2, 3]);
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::ExtractionProgress { .. })));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::ExtractionComplete { rep_count: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_discards_draft() {
        let control = RunControl::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut source = CancellingSource {
            inner: ReplaySource::from_synthetic(&SyntheticTrack::new(2), "swing.mp4"),
            control: control.clone(),
            at: 40,
            served: 0,
            cancelled: cancelled.clone(),
        };
        let cache = Arc::new(MemoryCache::new());
        let (events, mut rx) = EventSender::channel();
        let extractor = Extractor::new(key(), AnalysisSettings::default())
            .cache(cache.clone())
            .events(events);

        let result = extractor.run(&mut source, &control).await;
        assert!(matches!(result, Err(ExtractError::Cancelled)));
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(cache.list_keys().unwrap().is_empty());

        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::ExtractionCancelled { frames_processed: 41, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_after_last_frame_skips_write() {
        let synthetic = SyntheticTrack::new(1).frames_per_phase(4);
        let total = synthetic.raw_frames().len();
        let control = RunControl::new();
        let mut source = CancellingSource {
            inner: ReplaySource::from_synthetic(&synthetic, "swing.mp4"),
            control: control.clone(),
            at: total,
            served: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let cache = Arc::new(MemoryCache::new());
        let extractor = Extractor::new(key(), AnalysisSettings::default()).cache(cache.clone());

        let result = extractor.run(&mut source, &control).await;
        assert!(matches!(result, Err(ExtractError::Cancelled)));
        assert!(cache.get(&key()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_source_failure_writes_nothing() {
        let cache = Arc::new(MemoryCache::new());
        let (events, mut rx) = EventSender::channel();
        let extractor = Extractor::new(key(), AnalysisSettings::default())
            .cache(cache.clone())
            .events(events);

        let result = extractor.run(&mut FailingSource { served: 0 }, &RunControl::new()).await;
        assert!(matches!(result, Err(ExtractError::Source(SourceError::Backend(_)))));
        assert!(cache.list_keys().unwrap().is_empty());
        assert!(drain(&mut rx).iter().any(|e| matches!(e, PipelineEvent::ExtractionFailed { .. })));
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_returns_result() {
        let extractor =
            Extractor::new(key(), AnalysisSettings::default()).cache(Arc::new(BrokenCache));
        let mut source = ReplaySource::from_synthetic(&SyntheticTrack::new(2), "swing.mp4");
        let analysis = extractor.run(&mut source, &RunControl::new()).await.unwrap();
        assert_eq!(analysis.rep_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inter_frame_delay_does_not_change_result() {
        let synthetic = SyntheticTrack::new(2).transition_frames(3).jitter(3.0);
        let extractor = Extractor::new(key(), AnalysisSettings::default()).progress_every(0);

        let mut fast = ReplaySource::from_synthetic(&synthetic, "a.mp4");
        let mut slow =
            ReplaySource::from_synthetic(&synthetic, "a.mp4").with_delay(Duration::from_millis(33));
        let a = extractor.run(&mut fast, &RunControl::new()).await.unwrap();
        let b = extractor.run(&mut slow, &RunControl::new()).await.unwrap();

        assert_eq!(a.repetitions, b.repetitions);
        assert_eq!(a.track.frames, b.track.frames);
    }

    #[tokio::test]
    async fn test_out_of_order_and_timeless_frames_are_skipped() {
        let mut frames = SyntheticTrack::new(1).frames_per_phase(5).raw_frames();
        let stale = frames[3].clone();
        frames.insert(6, stale);
        let info = SourceInfo {
            video_name: "shuffled.mp4".into(),
            fps: 30.0,
            ..SourceInfo::default()
        };
        let mut timeless = frames[8].clone();
        timeless.frame_index = 1_000;
        timeless.video_time = f64::NAN;
        frames.insert(9, timeless);
        let expected_len = frames.len() - 2;
        let mut source = ReplaySource::new(info, frames);

        let extractor = Extractor::new(key(), AnalysisSettings::default());
        let analysis = extractor.run(&mut source, &RunControl::new()).await.unwrap();
        assert_eq!(analysis.track.frames.len(), expected_len);
        assert!(analysis.track.validate().is_ok());
        assert_eq!(analysis.rep_count(), 1);
    }
}
