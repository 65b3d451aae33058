//! Video content identity.
//!
//! Small files are hashed whole. Larger files hash the first and last MiB plus
//! the file size, which is fast on multi-gigabyte videos and stable enough to
//! key the pose-track cache. Output is lowercase hex SHA-256.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use sha2::{Digest, Sha256};

/// Bytes read from each end of a large file.
pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// Hash a video file on disk.
pub fn content_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    content_hash_reader(&mut file, len)
}

/// Hash `len` bytes available from `reader`.
pub fn content_hash_reader<R: Read + Seek>(reader: &mut R, len: u64) -> io::Result<String> {
    let mut hasher = Sha256::new();

    if len <= CHUNK_SIZE * 2 {
        reader.seek(SeekFrom::Start(0))?;
        let mut all = Vec::with_capacity(len as usize);
        reader.read_to_end(&mut all)?;
        hasher.update(&all);
        return Ok(hex::encode(hasher.finalize()));
    }

    let mut chunk = vec![0u8; CHUNK_SIZE as usize];
    reader.seek(SeekFrom::Start(0))?;
    reader.read_exact(&mut chunk)?;
    hasher.update(&chunk);

    reader.seek(SeekFrom::Start(len - CHUNK_SIZE))?;
    reader.read_exact(&mut chunk)?;
    hasher.update(&chunk);

    hasher.update(len.to_le_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Hash an in-memory video.
pub fn content_hash_bytes(bytes: &[u8]) -> String {
    let mut cursor = io::Cursor::new(bytes);
    // Reading from memory cannot fail.
    content_hash_reader(&mut cursor, bytes.len() as u64).unwrap_or_default()
}

/// Hash many files on a bounded rayon pool. Order of results matches `paths`.
pub fn content_hash_many(paths: &[PathBuf], jobs: usize) -> Vec<io::Result<String>> {
    let pool = match rayon::ThreadPoolBuilder::new().num_threads(jobs.max(1)).build() {
        Ok(pool) => pool,
        Err(e) => {
            log::warn!("Failed to build hashing pool ({e}), hashing serially");
            return paths.iter().map(|p| content_hash(p)).collect();
        }
    };
    pool.install(|| paths.par_iter().map(|p| content_hash(p)).collect())
}
