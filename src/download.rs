//! Chunk download functionality.

use crate::chunk;
use crate::error::{ChunkSyncError, Result};
use crate::progress::ProgressSink;
use crate::types::ChunkInfo;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

/// Streams the body of `url` into `dest`, crediting every received byte to `progress`.
///
/// # Returns
///
/// The number of bytes written, or an error for a non-success status, a transport
/// failure or a short body.
pub(crate) async fn fetch_to_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    progress: &dyn ProgressSink,
) -> Result<u64> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ChunkSyncError::Network(format!("HTTP {} from {}", status, url)));
    }
    let content_length = response.content_length();

    let mut file = BufWriter::with_capacity(
        chunk::STREAM_BUFFER_SIZE,
        tokio::fs::File::create(dest).await?,
    );
    let mut byte_stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(piece) = byte_stream.next().await {
        let piece = piece?;
        file.write_all(&piece).await?;
        written += piece.len() as u64;
        progress.add_bytes(piece.len() as u64);
    }
    file.flush().await?;

    match content_length {
        Some(expected) if expected != written => {
            return Err(ChunkSyncError::Network(format!(
                "Body size mismatch for {}: expected {} bytes, got {} bytes",
                url, expected, written
            )));
        }
        Some(_) => {}
        None => debug!(
            "Content-Length header was not present for {}. Cannot verify body size.",
            url
        ),
    }

    Ok(written)
}

/// Downloads one chunk from `url` and decodes it to `{cache_dir}/{guid}`.
///
/// The compressed body lands in `{guid}.tmp` first; that file is removed whether
/// decoding succeeds or not.
pub(crate) async fn download_chunk(
    client: &reqwest::Client,
    url: &str,
    cache_dir: &Path,
    info: &ChunkInfo,
    progress: &dyn ProgressSink,
) -> Result<PathBuf> {
    let tmp_path = cache_dir.join(format!("{}.tmp", info.guid));
    let dest = cache_dir.join(info.guid.to_string());

    let result = async {
        fetch_to_file(client, url, &tmp_path, progress).await?;

        let src = tmp_path.clone();
        let out = dest.clone();
        let expected = info.clone();
        tokio::task::spawn_blocking(move || chunk::decode_to_file(&src, &out, &expected))
            .await
            .map_err(|e| {
                ChunkSyncError::IoError(std::io::Error::other(format!("Task join error: {}", e)))
            })??;
        Ok::<_, ChunkSyncError>(())
    }
    .await;

    if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", tmp_path.display(), e);
        }
    }

    result.map(|_| dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::DownloadProgress;
    use crate::types::Guid;

    #[tokio::test]
    async fn test_unreachable_mirror_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let info = ChunkInfo {
            guid: Guid([5, 6, 7, 8]),
            rolling_hash: 0,
            sha_hash: [0; 20],
            group_num: 0,
            window_size: 16,
            file_size: 16,
        };
        let client = reqwest::Client::new();
        let progress = DownloadProgress::new();

        // port 9 (discard) on loopback is closed in test environments
        let err = download_chunk(&client, "http://127.0.0.1:9/x.chunk", dir.path(), &info, &progress)
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
