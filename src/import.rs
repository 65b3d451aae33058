//! Bulk import and export of `.posetrack.json` files.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use thiserror::Error;
use walkdir::WalkDir;

use crate::analyzer::recompute_angles;
use crate::cache::PoseTrackCache;
use crate::db::DbError;
use crate::db::models::CacheKey;
use crate::pose::track::POSETRACK_SUFFIX;
use crate::pose::{PoseTrack, TrackError};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Cache error: {0}")]
    Cache(#[from] DbError),
    #[error("Pose file error: {0}")]
    Track(#[from] TrackError),
}

#[derive(Debug, Default, PartialEq)]
pub struct ImportResult {
    pub found: u64,
    pub imported: u64,
    pub failed: u64,
}

fn is_posetrack_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.to_lowercase().ends_with(POSETRACK_SUFFIX))
}

/// Collect pose track files under `paths`. Files named directly are taken
/// as-is; directories are walked for `*.posetrack.json`.
pub fn find_posetrack_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        for entry in WalkDir::new(path).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && is_posetrack_file(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

/// Read one file, bring its keypoints into COCO-17 order and replace its
/// stored angles with our own.
pub fn load_for_import(path: &Path, min_confidence: f64) -> Result<PoseTrack, TrackError> {
    let mut track = PoseTrack::load(path)?;
    track.normalize_layout()?;
    let with_pose = recompute_angles(&mut track, min_confidence);
    log::debug!(
        "{}: {} frames, {} with pose",
        path.display(),
        track.frames.len(),
        with_pose
    );
    Ok(track)
}

fn progress_bar(len: u64, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Parse files on a rayon pool, then store each under its own key.
/// Unreadable files are logged and counted, never fatal.
pub fn import_tracks(
    cache: &dyn PoseTrackCache,
    paths: &[PathBuf],
    min_confidence: f64,
    workers: usize,
    show_progress: bool,
) -> Result<ImportResult, ImportError> {
    let files = find_posetrack_files(paths);
    let mut result = ImportResult {
        found: files.len() as u64,
        ..ImportResult::default()
    };
    if files.is_empty() {
        return Ok(result);
    }

    let pb = progress_bar(result.found, show_progress);
    pb.set_message("Reading...");

    let load = |path: &PathBuf| {
        let loaded = load_for_import(path, min_confidence);
        pb.inc(1);
        loaded
    };
    let loaded: Vec<Result<PoseTrack, TrackError>> =
        match rayon::ThreadPoolBuilder::new().num_threads(workers.max(1)).build() {
            Ok(pool) => pool.install(|| files.par_iter().map(load).collect()),
            Err(e) => {
                log::warn!("Failed to build import pool ({e}), reading serially");
                files.iter().map(load).collect()
            }
        };

    pb.set_position(0);
    pb.set_message("Storing...");
    for (path, track) in files.iter().zip(loaded) {
        pb.inc(1);
        let track = match track {
            Ok(track) => track,
            Err(e) => {
                log::warn!("Skipping {}: {e}", path.display());
                result.failed += 1;
                continue;
            }
        };
        let key = CacheKey::new(
            track.metadata.source_video_content_hash.clone(),
            track.metadata.model_id.clone(),
        );
        match cache.put(&key, &track) {
            Ok(()) => result.imported += 1,
            Err(e) => {
                log::warn!("Failed to store {} as {key}: {e}", path.display());
                result.failed += 1;
            }
        }
    }

    pb.finish_with_message(format!(
        "Done: {} imported, {} failed",
        result.imported, result.failed
    ));
    Ok(result)
}

/// Write a cached track to `path`. Returns false when nothing is cached for `key`.
pub fn export_track(cache: &dyn PoseTrackCache, key: &CacheKey, path: &Path) -> Result<bool, ImportError> {
    let Some(track) = cache.get(key)? else {
        return Ok(false);
    };
    track.save(path)?;
    log::info!("Exported {key} to {}", path.display());
    Ok(true)
}

/// Default export file name for a key.
pub fn export_file_name(key: &CacheKey) -> String {
    let short = key.content_hash.get(..16).unwrap_or(&key.content_hash);
    format!("{short}-{}{POSETRACK_SUFFIX}", key.model_id)
}
