//! Splitting a save directory into fixed-size chunks plus a manifest.
//!
//! Files are packed back to back into 1 MiB buffers, so a small file shares a chunk
//! with its neighbours and a large one spans several chunks. Each finished buffer is
//! zero-padded, hashed and compressed into one chunk file.

use crate::chunk::{self, STREAM_BUFFER_SIZE};
use crate::error::{ChunkSyncError, Result};
use crate::rolling_hash;
use crate::types::{ChunkInfo, ChunkPart, FileManifest, Guid, Manifest, ManifestMeta, CHUNK_SIZE};
use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Feature level written into packaged save manifests.
pub const SAVE_FEATURE_LEVEL: u32 = 18;

/// Custom field recording the save folder template the files came from.
pub const CLOUD_SAVE_FOLDER_FIELD: &str = "CloudSaveFolder";

/// A fully compressed chunk ready for upload.
#[derive(Debug, Clone)]
pub struct FinishedChunk {
    pub info: ChunkInfo,
    pub data: Vec<u8>,
}

/// Fixed-capacity accumulator for one chunk.
///
/// The builder is the only place chunk GUIDs are minted: a fresh GUID is drawn on the
/// first append after a reset, and both the parts handed out and the finished
/// [`ChunkInfo`] carry it.
pub struct ChunkBuilder {
    buffer: Box<[u8]>,
    len: usize,
    guid: Option<Guid>,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
            len: 0,
            guid: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.len
    }

    /// Copies as much of `data` as fits.
    ///
    /// Returns the chunk GUID, the offset the copy landed at, and how many bytes were
    /// taken (zero when the buffer is already full).
    pub fn append(&mut self, data: &[u8]) -> (Guid, u32, usize) {
        let guid = *self.guid.get_or_insert_with(Guid::random);
        let offset = self.len;
        let taken = data.len().min(self.remaining());
        self.buffer[offset..offset + taken].copy_from_slice(&data[..taken]);
        self.len += taken;
        (guid, offset as u32, taken)
    }

    /// Pads, hashes and compresses the buffered bytes, then resets the builder.
    ///
    /// Returns `None` when nothing has been appended since the last reset.
    pub fn finalize(&mut self) -> Result<Option<FinishedChunk>> {
        let guid = match self.guid.take() {
            Some(guid) if self.len > 0 => guid,
            _ => {
                self.len = 0;
                return Ok(None);
            }
        };

        self.buffer[self.len..].fill(0);
        let sha_hash: [u8; 20] = Sha1::digest(&self.buffer).into();
        let rolling = rolling_hash::hash(&self.buffer);
        let data = chunk::encode(&self.buffer, guid, rolling, sha_hash)?;

        let info = ChunkInfo {
            guid,
            rolling_hash: rolling,
            sha_hash,
            group_num: rolling_hash::group_num(&guid),
            window_size: self.buffer.len() as u32,
            file_size: data.len() as u64,
        };
        debug!(
            "Finalized chunk {} ({} used bytes, {} compressed)",
            guid,
            self.len,
            data.len()
        );
        self.len = 0;
        Ok(Some(FinishedChunk { info, data }))
    }
}

impl Default for ChunkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Output of [`ChunkPackager::package`].
#[derive(Debug, Clone)]
pub struct PackagedSave {
    /// Storage key to bytes: every chunk under `ChunksV4/`, plus the manifest.
    pub files: BTreeMap<String, Vec<u8>>,
    pub manifest: Manifest,
    /// Key of the manifest in `files`, e.g. `manifests/2024.01.02-03.04.05.manifest`.
    pub manifest_name: String,
}

impl PackagedSave {
    /// Chunk keys only, in upload order.
    pub fn chunk_names(&self) -> impl Iterator<Item = &str> {
        self.files
            .keys()
            .map(String::as_str)
            .filter(move |name| *name != self.manifest_name)
    }
}

/// Packages the files below a root directory.
pub struct ChunkPackager {
    root: PathBuf,
    allow_list: Option<BTreeSet<String>>,
}

impl ChunkPackager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allow_list: None,
        }
    }

    /// Restricts packaging to these forward-slash relative paths.
    pub fn with_allow_list<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_list = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    /// Regular, non-empty files under the root as (relative path, absolute path),
    /// sorted by lower-case file name and then lower-case relative path.
    pub fn collect_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| ChunkSyncError::IoError(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = relative_path(&self.root, entry.path())?;
            if let Some(allow) = &self.allow_list {
                if !allow.contains(&relative) {
                    continue;
                }
            }
            if entry.metadata().map_err(|e| ChunkSyncError::IoError(e.into()))?.len() == 0 {
                debug!("Skipping empty file {}", relative);
                continue;
            }
            files.push((relative, entry.into_path()));
        }

        files.sort_by_cached_key(|(relative, _)| {
            let name = relative.rsplit('/').next().unwrap_or(relative).to_lowercase();
            (name, relative.to_lowercase())
        });
        Ok(files)
    }

    /// Splits every collected file into chunks and builds the manifest.
    ///
    /// `app_name` and `account_id` are concatenated into the manifest's app name;
    /// `save_folder` is recorded as the `CloudSaveFolder` custom field.
    pub fn package(
        &self,
        app_name: &str,
        account_id: &str,
        save_folder: &str,
        now: DateTime<Utc>,
    ) -> Result<PackagedSave> {
        let sources = self.collect_files()?;
        if sources.is_empty() {
            return Err(ChunkSyncError::MissingData(format!(
                "no files to package under {}",
                self.root.display()
            )));
        }

        let mut builder = ChunkBuilder::new();
        let mut chunks: Vec<FinishedChunk> = Vec::new();
        let mut file_list = Vec::with_capacity(sources.len());
        let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];

        for (relative, path) in &sources {
            let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, std::fs::File::open(path)?);
            let mut hasher = Sha1::new();
            let mut parts: Vec<ChunkPart> = Vec::new();
            let mut file_offset = 0u64;

            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);

                let mut pending = &buffer[..n];
                while !pending.is_empty() {
                    if builder.remaining() == 0 {
                        chunks.extend(builder.finalize()?);
                    }
                    let (guid, offset, taken) = builder.append(pending);
                    push_part(&mut parts, guid, offset, taken as u32, file_offset);
                    file_offset += taken as u64;
                    pending = &pending[taken..];
                }
            }

            file_list.push(FileManifest {
                filename: relative.clone(),
                hash: hasher.finalize().into(),
                chunk_parts: parts,
                ..FileManifest::default()
            });
        }
        chunks.extend(builder.finalize()?);

        let build_version = now.format("%Y.%m.%d-%H.%M.%S").to_string();
        let manifest_name = format!("manifests/{}.manifest", build_version);
        let mut custom_fields = BTreeMap::new();
        custom_fields.insert(CLOUD_SAVE_FOLDER_FIELD.to_string(), save_folder.to_string());

        let manifest = Manifest {
            meta: ManifestMeta {
                feature_level: SAVE_FEATURE_LEVEL,
                app_name: format!("{}{}", app_name, account_id),
                build_version,
                ..ManifestMeta::default()
            },
            chunk_data_list: chunks.iter().map(|c| c.info.clone()).collect(),
            file_manifest_list: file_list,
            custom_fields,
        };

        let chunk_dir = manifest.chunk_dir();
        let mut files = BTreeMap::new();
        for finished in chunks {
            files.insert(finished.info.chunk_path(chunk_dir), finished.data);
        }
        files.insert(manifest_name.clone(), manifest.serialize()?);

        info!(
            "📦 Packaged {} files into {} chunks ({})",
            manifest.file_manifest_list.len(),
            manifest.chunk_data_list.len(),
            manifest_name
        );
        Ok(PackagedSave {
            files,
            manifest,
            manifest_name,
        })
    }
}

/// Extends the previous part when the new bytes continue it inside the same chunk.
fn push_part(parts: &mut Vec<ChunkPart>, guid: Guid, offset: u32, size: u32, file_offset: u64) {
    if let Some(last) = parts.last_mut() {
        if last.guid == guid && last.offset + last.size == offset {
            last.size += size;
            return;
        }
    }
    parts.push(ChunkPart {
        guid,
        offset,
        size,
        file_offset,
    });
}

/// Forward-slash path of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        ChunkSyncError::Storage(format!(
            "{} is not under {}",
            path.display(),
            root.display()
        ))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::assemble_file;
    use chrono::TimeZone;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn test_builder_mints_guid_on_first_append() {
        let mut builder = ChunkBuilder::new();
        assert!(builder.finalize().unwrap().is_none());

        let (g1, off1, n1) = builder.append(b"abc");
        let (g2, off2, _) = builder.append(b"def");
        assert_eq!(g1, g2);
        assert_eq!((off1, n1, off2), (0, 3, 3));

        let finished = builder.finalize().unwrap().unwrap();
        assert_eq!(finished.info.guid, g1);
        assert_eq!(finished.info.window_size as usize, CHUNK_SIZE);
        assert!(builder.is_empty());

        let (g3, off3, _) = builder.append(b"x");
        assert_ne!(g3, g1);
        assert_eq!(off3, 0);
    }

    #[test]
    fn test_finalized_chunk_hashes_padded_buffer() {
        let mut builder = ChunkBuilder::new();
        builder.append(b"save data");
        let finished = builder.finalize().unwrap().unwrap();

        let mut padded = vec![0u8; CHUNK_SIZE];
        padded[..9].copy_from_slice(b"save data");
        let sha: [u8; 20] = Sha1::digest(&padded).into();
        assert_eq!(finished.info.sha_hash, sha);
        assert_eq!(finished.info.rolling_hash, rolling_hash::hash(&padded));
        assert_eq!(finished.info.group_num, rolling_hash::group_num(&finished.info.guid));
        assert_eq!(chunk::decode(&finished.data).unwrap(), padded);
    }

    #[test]
    fn test_collect_files_order_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b/Zeta.sav", b"1");
        write(dir.path(), "a/alpha.sav", b"2");
        write(dir.path(), "c/ALPHA.sav", b"3");
        write(dir.path(), "empty.sav", b"");

        let files = ChunkPackager::new(dir.path()).collect_files().unwrap();
        let names: Vec<_> = files.iter().map(|(rel, _)| rel.as_str()).collect();
        assert_eq!(names, vec!["a/alpha.sav", "c/ALPHA.sav", "b/Zeta.sav"]);

        let only = ChunkPackager::new(dir.path())
            .with_allow_list(["b/Zeta.sav"])
            .collect_files()
            .unwrap();
        assert_eq!(only.len(), 1);
    }

    #[test]
    fn test_package_layout_and_reassembly() {
        let src = tempfile::tempdir().unwrap();
        let big: Vec<u8> = (0..(CHUNK_SIZE + 300_000)).map(|i| (i % 241) as u8).collect();
        write(src.path(), "profile.dat", b"profile bytes");
        write(src.path(), "slots/slot1.sav", &big);
        write(src.path(), "zero.bin", b"");

        let packaged = ChunkPackager::new(src.path())
            .package("GameApp", "acct42", "{appdata}/Game", fixed_time())
            .unwrap();
        let manifest = &packaged.manifest;

        assert_eq!(packaged.manifest_name, "manifests/2024.01.02-03.04.05.manifest");
        assert_eq!(manifest.meta.app_name, "GameAppacct42");
        assert_eq!(manifest.meta.build_version, "2024.01.02-03.04.05");
        assert_eq!(manifest.meta.feature_level, 18);
        assert_eq!(manifest.custom_fields["CloudSaveFolder"], "{appdata}/Game");
        assert_eq!(manifest.file_manifest_list.len(), 2);
        assert_eq!(manifest.chunk_data_list.len(), 2);
        assert_eq!(packaged.files.len(), 3);
        assert_eq!(packaged.chunk_names().count(), 2);
        for name in packaged.chunk_names() {
            assert!(name.starts_with("ChunksV4/"));
            assert!(name.ends_with(".chunk"));
        }
        manifest.validate().unwrap();

        let parsed = Manifest::read_all(&packaged.files[&packaged.manifest_name]).unwrap();
        assert_eq!(&parsed, manifest);

        // decode every chunk into a cache and rebuild the files from the manifest
        let cache = tempfile::tempdir().unwrap();
        for info in &manifest.chunk_data_list {
            let data = chunk::decode(&packaged.files[&info.chunk_path("ChunksV4")]).unwrap();
            std::fs::write(cache.path().join(info.guid.to_string()), data).unwrap();
        }
        let out = tempfile::tempdir().unwrap();
        for fm in &manifest.file_manifest_list {
            assemble_file(fm, cache.path(), out.path()).unwrap();
        }
        assert_eq!(std::fs::read(out.path().join("profile.dat")).unwrap(), b"profile bytes");
        assert_eq!(std::fs::read(out.path().join("slots/slot1.sav")).unwrap(), big);
    }

    #[test]
    fn test_empty_directory_is_missing_data() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChunkPackager::new(dir.path())
            .package("A", "B", "", fixed_time())
            .unwrap_err();
        assert!(matches!(err, ChunkSyncError::MissingData(_)));
    }
}
