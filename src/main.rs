use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swingcount::analyzer::phase::SwingPhase;
use swingcount::analyzer::{AngleReadout, TrackAnalysis};
use swingcount::cache::{PoseTrackCache, SqliteCache};
use swingcount::db::models::CacheKey;
use swingcount::events::{EventSender, PipelineEvent};
use swingcount::pose::synthetic::SyntheticTrack;
use swingcount::session::{Mode, ModeSelector};
use swingcount::source::{FrameSource, ReplaySource, SourceError};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "swingcount", version, about = "Kettlebell swing rep counter")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print content hashes for video files (directories are walked)
    Hash {
        paths: Vec<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Count reps in a video: replay from cache, or extract from a pose file
    Analyze {
        /// Video file (identifies the cache entry by content)
        video: PathBuf,

        /// Pose track to use as the live frame source on a cache miss
        #[arg(long)]
        poses: Option<PathBuf>,

        /// Pose model id (defaults to config model_id)
        #[arg(long)]
        model: Option<String>,

        /// Delay between frames in milliseconds (defaults to config frame_delay_ms)
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Extract even if a cached track exists
        #[arg(long)]
        refresh: bool,
    },

    /// List reps and checkpoints for a cached track
    Reps {
        /// Content hash (unique prefix is enough)
        hash: String,

        #[arg(long)]
        model: Option<String>,
    },

    /// Show the angle readout nearest a playback time
    Angles {
        /// Content hash (unique prefix is enough)
        hash: String,

        /// Playback position in seconds
        #[arg(short, long)]
        time: f64,

        #[arg(long)]
        model: Option<String>,
    },

    /// Import .posetrack.json files into the cache (angles are recomputed)
    Import {
        paths: Vec<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Write a cached track to a .posetrack.json file
    Export {
        /// Content hash (unique prefix is enough)
        hash: String,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        model: Option<String>,
    },

    /// Generate a deterministic synthetic swing track
    Synth {
        /// Number of complete swings
        #[arg(short, long, default_value = "3")]
        cycles: usize,

        #[arg(long, default_value = "15")]
        frames_per_phase: usize,

        /// Interpolated frames between phases
        #[arg(long, default_value = "0")]
        transitions: usize,

        /// Angle wobble in degrees
        #[arg(long, default_value = "0")]
        jitter: f64,

        /// Drop every n-th detection (0 = none)
        #[arg(long, default_value = "0")]
        drop_every: usize,

        /// End with a partial swing reaching this phase
        #[arg(long)]
        partial: Option<String>,

        /// Content hash to record (defaults to a hash of the parameters)
        #[arg(long)]
        hash: Option<String>,

        #[arg(long)]
        model: Option<String>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inspect or prune the pose-track cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Show cache statistics
    Stats,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// List cached tracks
    List,
    /// Remove every cached track
    Clear,
    /// Remove cached tracks for one video
    Evict {
        /// Content hash (unique prefix is enough)
        hash: String,

        /// Only this model (default: every model)
        #[arg(long)]
        model: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = swingcount::config::AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli.db_path
        .or(config.db_path.clone())
        .unwrap_or_else(swingcount::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let cache = Arc::new(SqliteCache::open(&db_path).context("Failed to open database")?);

    match cli.command {
        Commands::Hash { paths, jobs } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let videos = collect_videos(&paths);
            if videos.is_empty() {
                println!("No video files found.");
                return Ok(());
            }
            let hashes = swingcount::hash::content_hash_many(&videos, workers);
            for (path, hash) in videos.iter().zip(hashes) {
                match hash {
                    Ok(hash) => println!("{}  {}", hash, path.display()),
                    Err(e) => log::warn!("Failed to hash {}: {}", path.display(), e),
                }
            }
        }

        Commands::Analyze { video, poses, model, delay_ms, refresh } => {
            let content_hash = swingcount::hash::content_hash(&video)
                .with_context(|| format!("Failed to hash {}", video.display()))?;
            let model_id = model.unwrap_or_else(|| config.model_id.clone());
            let delay = Duration::from_millis(delay_ms.unwrap_or(config.frame_delay_ms));

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;

            let analysis = runtime.block_on(async {
                let (events, mut rx) = EventSender::channel();
                let selector = ModeSelector::new(cache.clone(), model_id)
                    .model_version(config.model_version.clone())
                    .settings(config.analysis.clone())
                    .events(events)
                    .progress_every(config.progress_every);

                let make_source = move || -> std::result::Result<Box<dyn FrameSource>, SourceError> {
                    let path = poses.ok_or_else(|| {
                        SourceError::Backend("no cached track; pass --poses to extract".into())
                    })?;
                    let source = ReplaySource::from_file(&path)?.with_delay(delay);
                    Ok(Box::new(source))
                };
                let mut session = if refresh {
                    selector.extract(&content_hash, make_source).await?
                } else {
                    selector.open(&content_hash, make_source).await?
                };

                let pb = ProgressBar::new(0);
                if let Ok(style) = ProgressStyle::with_template(
                    "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                ) {
                    pb.set_style(style.progress_chars("#>-"));
                }
                if session.mode() == Mode::Cached {
                    pb.finish_and_clear();
                }

                let result = loop {
                    tokio::select! {
                        result = session.wait() => break result,
                        Some(event) = rx.recv() => show_event(&pb, &event),
                    }
                };
                while let Ok(event) = rx.try_recv() {
                    show_event(&pb, &event);
                }
                pb.finish_and_clear();

                let mode = match session.mode() {
                    Mode::Cached => "cached",
                    Mode::Extracting => "extracted",
                };
                anyhow::Ok((result?, mode))
            })?;

            let (analysis, mode) = analysis;
            println!(
                "{} ({}): {} reps in {} frames",
                video.display(),
                mode,
                analysis.rep_count(),
                analysis.track.frames.len()
            );
            println!();
            print_rep_table(&analysis);
        }

        Commands::Reps { hash, model } => {
            let model_id = model.unwrap_or_else(|| config.model_id.clone());
            let key = resolve_key(cache.as_ref(), &hash, Some(&model_id))?;
            let analysis = load_analysis(cache.as_ref(), &key, &config)?;
            println!(
                "{} ({}): {} reps in {} frames",
                analysis.track.metadata.source_video_name,
                key,
                analysis.rep_count(),
                analysis.track.frames.len()
            );
            println!();
            print_rep_table(&analysis);
        }

        Commands::Angles { hash, time, model } => {
            let model_id = model.unwrap_or_else(|| config.model_id.clone());
            let key = resolve_key(cache.as_ref(), &hash, Some(&model_id))?;
            let analysis = load_analysis(cache.as_ref(), &key, &config)?;
            match analysis.readout_at(time) {
                AngleReadout::Pose { frame_index, video_time, angles, phase } => {
                    println!("Frame {} at {:.3}s", frame_index, video_time);
                    println!("  Spine:        {:>6.1}°", angles.spine_angle);
                    println!("  Arm:          {:>6.1}°", angles.arm_to_vertical_angle);
                    println!("  Arm to spine: {:>6.1}°", angles.arm_to_spine_angle);
                    println!(
                        "  Phase:        {}",
                        phase.map(|p| p.label()).unwrap_or("unclassified")
                    );
                }
                AngleReadout::NoPose => println!("No pose at {:.3}s", time),
            }
            println!(
                "Reps completed by {:.3}s: {}/{}",
                time,
                analysis.reps_completed_by(time),
                analysis.rep_count()
            );
        }

        Commands::Import { paths, jobs } => {
            if paths.is_empty() {
                anyhow::bail!("No paths to import. Pass files or directories as arguments.");
            }
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let result = swingcount::import::import_tracks(
                cache.as_ref(),
                &paths,
                config.analysis.min_keypoint_confidence,
                workers,
                true,
            )
            .context("Import failed")?;
            println!(
                "Import complete: {} found, {} imported, {} failed",
                result.found, result.imported, result.failed
            );
        }

        Commands::Export { hash, output, model } => {
            let model_id = model.unwrap_or_else(|| config.model_id.clone());
            let key = resolve_key(cache.as_ref(), &hash, Some(&model_id))?;
            let path = output
                .unwrap_or_else(|| PathBuf::from(swingcount::import::export_file_name(&key)));
            if swingcount::import::export_track(cache.as_ref(), &key, &path).context("Export failed")? {
                println!("Wrote {}", path.display());
            } else {
                println!("No cached track for {}.", key);
            }
        }

        Commands::Synth {
            cycles, frames_per_phase, transitions, jitter, drop_every, partial, hash, model, output,
        } => {
            let mut synthetic = SyntheticTrack::new(cycles)
                .frames_per_phase(frames_per_phase)
                .transition_frames(transitions)
                .jitter(jitter)
                .drop_every(drop_every);
            if let Some(name) = partial {
                let phase = SwingPhase::ALL
                    .into_iter()
                    .find(|p| p.label().eq_ignore_ascii_case(&name))
                    .with_context(|| format!("Unknown phase \"{}\"", name))?;
                synthetic = synthetic.partial_until(phase);
            }

            let content_hash = hash.unwrap_or_else(|| {
                swingcount::hash::content_hash_bytes(
                    format!("synthetic:{cycles}:{frames_per_phase}:{transitions}:{jitter}:{drop_every}")
                        .as_bytes(),
                )
            });
            let model_id = model.unwrap_or_else(|| config.model_id.clone());
            let track = synthetic.build(&content_hash, &model_id);
            let path = output.unwrap_or_else(|| {
                PathBuf::from(format!("synthetic-{}x{}", cycles, swingcount::pose::track::POSETRACK_SUFFIX))
            });
            track.save(&path).with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Wrote {} ({} frames, hash {})",
                path.display(),
                track.frames.len(),
                content_hash
            );
        }

        Commands::Cache { action } => match action {
            CacheCommand::List => {
                let tracks = cache.list().context("Query failed")?;
                if tracks.is_empty() {
                    println!("Cache is empty.");
                    return Ok(());
                }
                println!(
                    "{:<16} {:<12} {:>7} {:>6} {:>7}  {:<20} {}",
                    "Hash", "Model", "Frames", "FPS", "Secs", "Stored", "Video"
                );
                println!("{}", "-".repeat(90));
                for t in &tracks {
                    let short = t.key.content_hash.get(..16).unwrap_or(&t.key.content_hash);
                    println!(
                        "{:<16} {:<12} {:>7} {:>6.1} {:>7.1}  {:<20} {}",
                        short,
                        t.key.model_id,
                        t.frame_count,
                        t.fps.unwrap_or(0.0),
                        t.duration_secs.unwrap_or(0.0),
                        t.stored_at,
                        t.source_video_name,
                    );
                }
            }
            CacheCommand::Clear => {
                let removed = cache.clear().context("Clear failed")?;
                println!("Removed {} cached tracks", removed);
            }
            CacheCommand::Evict { hash, model } => {
                let keys = matching_keys(cache.as_ref(), &hash, model.as_deref())?;
                if keys.is_empty() {
                    println!("No cached tracks match \"{}\".", hash);
                    return Ok(());
                }
                let mut removed = 0;
                for key in &keys {
                    if cache.evict(key).context("Evict failed")? {
                        removed += 1;
                    }
                }
                println!("Evicted {} cached tracks", removed);
            }
        },

        Commands::Stats => {
            let stats = cache.stats().context("Failed to get stats")?;
            println!("Cache Statistics");
            println!("================");
            println!("Cached tracks:    {}", stats.tracks);
            println!("Total frames:     {}", stats.total_frames);
            println!("Total duration:   {:.2} hours", stats.total_duration_hours);
            println!();

            if !stats.models.is_empty() {
                println!("Models:");
                for (model, count) in &stats.models {
                    println!("  {:<16} {}", model, count);
                }
            }
        }
    }

    Ok(())
}

/// Video files named directly, plus any found under directories.
fn collect_videos(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut videos = Vec::new();
    for path in paths {
        if path.is_file() {
            videos.push(path.clone());
            continue;
        }
        for entry in WalkDir::new(path).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if swingcount::VIDEO_EXTENSIONS.contains(&ext.as_str()) {
                videos.push(entry.into_path());
            }
        }
    }
    videos
}

/// Cached keys whose hash starts with `prefix`, optionally for one model.
fn matching_keys(cache: &dyn PoseTrackCache, prefix: &str, model: Option<&str>) -> Result<Vec<CacheKey>> {
    let prefix = prefix.to_lowercase();
    Ok(cache
        .list_keys()
        .context("Query failed")?
        .into_iter()
        .filter(|k| k.content_hash.starts_with(&prefix))
        .filter(|k| model.is_none_or(|m| k.model_id == m))
        .collect())
}

fn resolve_key(cache: &dyn PoseTrackCache, prefix: &str, model: Option<&str>) -> Result<CacheKey> {
    let mut keys = matching_keys(cache, prefix, model)?;
    match keys.len() {
        0 => anyhow::bail!("No cached track matching \"{}\"", prefix),
        1 => Ok(keys.remove(0)),
        n => anyhow::bail!("\"{}\" matches {} cached tracks; use a longer prefix", prefix, n),
    }
}

fn load_analysis(
    cache: &dyn PoseTrackCache,
    key: &CacheKey,
    config: &swingcount::config::AppConfig,
) -> Result<TrackAnalysis> {
    let track = cache
        .get(key)
        .context("Query failed")?
        .with_context(|| format!("Cached track for {} is unreadable", key))?;
    Ok(TrackAnalysis::from_track(track, &config.analysis))
}

fn show_event(pb: &ProgressBar, event: &PipelineEvent) {
    match event {
        PipelineEvent::ExtractionStarted { total_frames, .. } => {
            pb.set_length(total_frames.unwrap_or(0));
            pb.set_message("Extracting...");
        }
        PipelineEvent::ExtractionProgress { frames_processed, .. } => {
            pb.set_position(*frames_processed);
        }
        PipelineEvent::RepDetected { rep, .. } => {
            pb.println(format!(
                "Rep {} at {:.2}s (arm {:.0}°, spine {:.0}°)",
                rep.rep_number, rep.video_time, rep.angles.arm_to_vertical_angle, rep.angles.spine_angle
            ));
        }
        PipelineEvent::ExtractionComplete { frame_count, rep_count, elapsed, .. } => {
            log::info!(
                "Extraction finished: {} frames, {} reps in {:.1}s",
                frame_count,
                rep_count,
                elapsed.as_secs_f64()
            );
        }
        PipelineEvent::ExtractionCancelled { .. } | PipelineEvent::ExtractionFailed { .. } => {
            pb.abandon();
        }
        PipelineEvent::CacheHit { frame_count, rep_count, .. } => {
            log::info!("Replaying cached track: {} frames, {} reps", frame_count, rep_count);
        }
    }
}

/// Print one row per rep with the time and angles of each checkpoint.
fn print_rep_table(analysis: &TrackAnalysis) {
    if analysis.repetitions.is_empty() {
        println!("No completed reps.");
        return;
    }

    println!(
        "{:>3}  {:>8}  {:>5} {:>5} {:>5}  {:>8} {:>8} {:>8}",
        "Rep", "Top(s)", "Arm", "Spine", "A-S", "Connect", "Bottom", "Release"
    );
    println!("{}", "-".repeat(64));

    for rep in &analysis.repetitions {
        let top = rep.top();
        println!(
            "{:>3}  {:>8.2}  {:>5.0} {:>5.0} {:>5.0}  {:>8.2} {:>8.2} {:>8.2}",
            rep.rep_number,
            top.video_time,
            top.angles.arm_to_vertical_angle,
            top.angles.spine_angle,
            top.angles.arm_to_spine_angle,
            rep.checkpoint(SwingPhase::Connect).video_time,
            rep.checkpoint(SwingPhase::Bottom).video_time,
            rep.checkpoint(SwingPhase::Release).video_time,
        );
    }

    println!();
    println!("Arm/Spine/A-S = angles at the closing Top (degrees); phase columns are checkpoint times");
}

