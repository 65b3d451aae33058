pub mod analyzer;
pub mod cache;
pub mod config;
pub mod db;
pub mod events;
pub mod extract;
pub mod hash;
pub mod import;
pub mod pose;
pub mod session;
pub mod source;

/// Video file extensions picked up when hashing directories
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "avi", "mkv", "webm"];

/// Application name for XDG paths
pub const APP_NAME: &str = "swingcount";
