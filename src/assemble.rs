//! Rebuilding files from decompressed chunks in the cache.

use crate::chunk::STREAM_BUFFER_SIZE;
use crate::error::{ChunkSyncError, Result};
use crate::progress::ProgressSink;
use crate::types::FileManifest;
use crate::verify::{compute_file_sha1, hex_digest};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Files assembled concurrently per batch.
pub const ASSEMBLY_BATCH_SIZE: usize = 4;

/// Resolves a manifest path under `root`, refusing anything that would escape it.
pub fn resolve_destination(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ChunkSyncError::Storage(format!(
                    "path {:?} escapes destination {}",
                    relative,
                    root.display()
                )));
            }
        }
    }
    if depth == 0 {
        return Err(ChunkSyncError::Storage(format!(
            "empty file name in manifest: {:?}",
            relative
        )));
    }
    Ok(out)
}

/// Writes one file by copying each chunk part out of `{cache_dir}/{guid}`.
///
/// A missing chunk file, or one too short for a part, is a
/// [`ChunkSyncError::MissingData`] error and the partial output is removed.
pub fn assemble_file(fm: &FileManifest, cache_dir: &Path, dest_root: &Path) -> Result<u64> {
    let dest = resolve_destination(dest_root, &fm.filename)?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let result = write_parts(fm, cache_dir, &dest);
    if result.is_err() {
        if let Err(e) = std::fs::remove_file(&dest) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove partial file {}: {}", dest.display(), e);
            }
        }
    }
    let written = result?;

    #[cfg(unix)]
    if fm.is_executable() {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))?;
    }

    debug!("Assembled {} ({} bytes)", fm.filename, written);
    Ok(written)
}

fn write_parts(fm: &FileManifest, cache_dir: &Path, dest: &Path) -> Result<u64> {
    let mut out = BufWriter::with_capacity(STREAM_BUFFER_SIZE, std::fs::File::create(dest)?);
    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
    let mut written = 0u64;

    for part in &fm.chunk_parts {
        let chunk_path = cache_dir.join(part.guid.to_string());
        let mut chunk_file = match std::fs::File::open(&chunk_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ChunkSyncError::MissingData(format!(
                    "chunk {} needed by {} is not in the cache",
                    part.guid, fm.filename
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let needed = part.offset as u64 + part.size as u64;
        let available = chunk_file.metadata()?.len();
        if available < needed {
            return Err(ChunkSyncError::MissingData(format!(
                "chunk {} has {} bytes, {} needs {}",
                part.guid, available, fm.filename, needed
            )));
        }

        chunk_file.seek(SeekFrom::Start(part.offset as u64))?;
        let mut remaining = part.size as u64;
        let mut slice = chunk_file.take(remaining);
        while remaining > 0 {
            let n = slice.read(&mut buffer)?;
            if n == 0 {
                return Err(ChunkSyncError::MissingData(format!(
                    "chunk {} ended early while building {}",
                    part.guid, fm.filename
                )));
            }
            out.write_all(&buffer[..n])?;
            remaining -= n as u64;
        }
        written += part.size as u64;
    }

    out.flush()?;
    Ok(written)
}

/// Checks an assembled file against the manifest's whole-file SHA-1.
pub async fn verify_file_hash(path: &Path, expected: &[u8; 20]) -> Result<()> {
    let actual = compute_file_sha1(path).await?;
    if &actual != expected {
        return Err(ChunkSyncError::Integrity(format!(
            "{}: SHA-1 {} does not match expected {}",
            path.display(),
            hex_digest(&actual),
            hex_digest(expected)
        )));
    }
    Ok(())
}

/// Assembles `files` in batches of [`ASSEMBLY_BATCH_SIZE`] blocking tasks.
///
/// Every task in a batch settles before the first failure is returned. With `verify`
/// set, each file's SHA-1 is checked after it is written.
pub async fn assemble_files(
    files: &[FileManifest],
    cache_dir: &Path,
    dest_root: &Path,
    verify: bool,
    progress: &dyn ProgressSink,
) -> Result<u64> {
    tokio::fs::create_dir_all(dest_root).await?;
    let mut total = 0u64;

    for (batch_idx, batch) in files.chunks(ASSEMBLY_BATCH_SIZE).enumerate() {
        if !progress.is_active() {
            warn!("Assembly cancelled before batch {}", batch_idx);
            return Err(ChunkSyncError::Cancelled);
        }

        let tasks: Vec<_> = batch
            .iter()
            .map(|fm| {
                let fm = fm.clone();
                let cache_dir = cache_dir.to_path_buf();
                let dest_root = dest_root.to_path_buf();
                tokio::task::spawn_blocking(move || assemble_file(&fm, &cache_dir, &dest_root))
            })
            .collect();

        let mut first_error = None;
        for task in tasks {
            match task.await {
                Ok(Ok(size)) => total += size,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(ChunkSyncError::IoError(std::io::Error::other(
                        format!("Task join error: {}", e),
                    )));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if verify {
            for fm in batch {
                let path = resolve_destination(dest_root, &fm.filename)?;
                verify_file_hash(&path, &fm.hash).await?;
            }
        }
    }

    info!("📂 Assembled {} files ({} bytes)", files.len(), total);
    Ok(total)
}
