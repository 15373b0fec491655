//! Local hash checks: whole-file SHA-1 and the cached-chunk skip rule.

use crate::error::{ChunkSyncError, Result};
use crate::types::ChunkInfo;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Computes the SHA-1 of a local file.
///
/// The file is read through a fixed buffer on a blocking task so large files never
/// sit in memory and the async runtime is not stalled.
pub async fn compute_file_sha1(path: &Path) -> Result<[u8; 20]> {
    let path: PathBuf = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<[u8; 20]> {
        use std::io::Read;

        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(crate::chunk::STREAM_BUFFER_SIZE, file);
        let mut hasher = Sha1::new();
        let mut buffer = vec![0u8; crate::chunk::STREAM_BUFFER_SIZE];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hasher.finalize().into())
    })
    .await
    .map_err(|e| ChunkSyncError::IoError(std::io::Error::other(format!("Task join error: {}", e))))?
}

/// Lower-case hex rendering of a digest, for logs and listings.
pub fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decides whether a decompressed chunk already in the cache can be reused.
///
/// This function performs the following checks:
/// 1. The cache file exists
/// 2. Its size equals the chunk's window size
/// 3. Unless `skip_verify` is set, its SHA-1 equals the chunk's hash
///
/// A file that fails the hash check is deleted so the download starts clean.
///
/// # Returns
///
/// `Ok(true)` if the cached chunk is valid, `Ok(false)` if it must be downloaded.
pub async fn verify_cached_chunk(path: &Path, info: &ChunkInfo, skip_verify: bool) -> Result<bool> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(_) => return Ok(false),
    };

    if metadata.len() != info.window_size as u64 {
        debug!(
            "Cached chunk {} has {} bytes, expected {}",
            info.guid,
            metadata.len(),
            info.window_size
        );
        return Ok(false);
    }

    if skip_verify {
        info!("✅ Chunk {} trusted (size match, verification skipped)", info.guid);
        return Ok(true);
    }

    match compute_file_sha1(path).await {
        Ok(sha) if sha == info.sha_hash => {
            debug!("✅ Chunk {} already cached and verified", info.guid);
            Ok(true)
        }
        Ok(sha) => {
            warn!(
                "❌ Cached chunk {} failed verification (got {}), re-downloading",
                info.guid,
                hex_digest(&sha)
            );
            discard_corrupt_chunk(path).await;
            Ok(false)
        }
        Err(e) => {
            warn!("⚠️  Failed to hash cached chunk {}: {}", info.guid, e);
            Ok(false)
        }
    }
}

/// Removes a chunk that failed verification. Returns false if it is still on disk.
async fn discard_corrupt_chunk(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!("Failed to remove corrupt chunk {}: {}", path.display(), e);
            false
        }
    }
}
