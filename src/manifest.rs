//! Binary manifest codec and the lookups used by install and sync.
//! JSON manifests are detected by [`Manifest::read_all`] and parsed elsewhere.
//!
//! A manifest is a 41-byte header followed by a (normally zlib) body made of four
//! size-prefixed sections: meta, chunk data list, file manifest list and custom fields.
//! Every section is skipped to its declared end after parsing, so newer writers can
//! append fields without breaking this reader.

use crate::error::{ChunkSyncError, Result};
use crate::types::{ChunkInfo, ChunkPart, FileManifest, Guid, Manifest, ManifestMeta};
use crate::wire::{self, ByteReader};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Write};
use tracing::{debug, warn};

pub const MANIFEST_MAGIC: u32 = 0x44BEC00C;
const MANIFEST_HEADER_SIZE: u32 = 41;
const STORED_COMPRESSED: u8 = 0x1;

const MIN_SERIALIZATION_VERSION: u32 = 17;
const MAX_SERIALIZATION_VERSION: u32 = 21;

// smallest possible per-element footprint of each column set, used to bound counts
const MIN_CHUNK_RECORD: usize = 16 + 8 + 20 + 1 + 4 + 8;
const MIN_FILE_RECORD: usize = 4 + 4 + 20 + 1 + 4 + 4;
const MIN_PART_RECORD: usize = 4 + 16 + 4 + 4;

impl Manifest {
    /// Parses a complete manifest file, binary or JSON.
    pub fn read_all(data: &[u8]) -> Result<Manifest> {
        if crate::json_manifest::looks_like_json(data) {
            return crate::json_manifest::parse(data);
        }
        let mut r = ByteReader::new(data);
        let magic = r.u32()?;
        if magic != MANIFEST_MAGIC {
            return Err(ChunkSyncError::Format(format!(
                "bad manifest magic {:#010x}",
                magic
            )));
        }
        let header_size = r.u32()?;
        let size_uncompressed = r.u32()? as usize;
        let size_compressed = r.u32()? as usize;
        let sha_hash: [u8; 20] = r.array()?;
        let stored_as = r.u8()?;
        let version = r.u32()?;
        if header_size < MANIFEST_HEADER_SIZE {
            return Err(ChunkSyncError::Format(format!(
                "manifest header size {} is smaller than {}",
                header_size, MANIFEST_HEADER_SIZE
            )));
        }
        r.seek(header_size as usize)?;

        let body = if stored_as & STORED_COMPRESSED != 0 {
            let compressed = if size_compressed <= r.remaining() {
                r.take(size_compressed)?
            } else {
                return Err(ChunkSyncError::Format(format!(
                    "manifest body truncated: {} of {} compressed bytes",
                    r.remaining(),
                    size_compressed
                )));
            };
            inflate_body(compressed, size_uncompressed)?
        } else {
            r.rest().to_vec()
        };

        let computed: [u8; 20] = Sha1::digest(&body).into();
        if computed != sha_hash {
            return Err(ChunkSyncError::Integrity(
                "manifest body SHA-1 mismatch".to_string(),
            ));
        }
        debug!(
            "Manifest header v{}: {} body bytes ({} stored)",
            version,
            body.len(),
            size_compressed
        );

        let mut r = ByteReader::new(&body);
        let meta = read_meta(&mut r)?;
        let chunk_data_list = read_chunk_data_list(&mut r)?;
        let file_manifest_list = read_file_manifest_list(&mut r)?;
        let custom_fields = if r.remaining() > 0 {
            read_custom_fields(&mut r)?
        } else {
            BTreeMap::new()
        };

        Ok(Manifest {
            meta,
            chunk_data_list,
            file_manifest_list,
            custom_fields,
        })
    }

    /// Writes the manifest with a zlib body; `read_all` of the result yields `self`.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        write_meta(&mut body, &self.meta)?;
        write_chunk_data_list(&mut body, &self.chunk_data_list)?;
        write_file_manifest_list(&mut body, &self.file_manifest_list)?;
        write_custom_fields(&mut body, &self.custom_fields)?;

        let sha_hash: [u8; 20] = Sha1::digest(&body).into();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        let compressed = encoder.finish()?;

        let version = self
            .meta
            .feature_level
            .max(MIN_SERIALIZATION_VERSION)
            .min(MAX_SERIALIZATION_VERSION);

        let mut out = Vec::with_capacity(MANIFEST_HEADER_SIZE as usize + compressed.len());
        wire::put_u32(&mut out, MANIFEST_MAGIC);
        wire::put_u32(&mut out, MANIFEST_HEADER_SIZE);
        wire::put_u32(&mut out, wire::wire_len(body.len(), "manifest body")?);
        wire::put_u32(&mut out, wire::wire_len(compressed.len(), "compressed manifest")?);
        out.extend_from_slice(&sha_hash);
        wire::put_u8(&mut out, STORED_COMPRESSED);
        wire::put_u32(&mut out, version);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Chunk directory name for this manifest's feature level.
    pub fn chunk_dir(&self) -> &'static str {
        match self.meta.feature_level {
            v if v >= 15 => "ChunksV4",
            v if v >= 6 => "ChunksV3",
            v if v >= 3 => "ChunksV2",
            _ => "Chunks",
        }
    }

    pub fn chunk_by_guid(&self, guid: &Guid) -> Option<&ChunkInfo> {
        self.chunk_data_list.iter().find(|c| &c.guid == guid)
    }

    pub fn file_by_path(&self, path: &str) -> Option<&FileManifest> {
        self.file_manifest_list.iter().find(|f| f.filename == path)
    }

    /// Every chunk referenced by any file, once each, in first-reference order.
    pub fn required_chunks(&self) -> Vec<ChunkInfo> {
        self.collect_chunks(self.file_manifest_list.iter())
    }

    /// Chunks needed to build only the listed files.
    pub fn chunks_for_files<'a, I>(&self, paths: I) -> Vec<ChunkInfo>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let wanted: HashSet<&str> = paths.into_iter().collect();
        self.collect_chunks(
            self.file_manifest_list
                .iter()
                .filter(|f| wanted.contains(f.filename.as_str())),
        )
    }

    fn collect_chunks<'a>(&self, files: impl Iterator<Item = &'a FileManifest>) -> Vec<ChunkInfo> {
        let by_guid: HashMap<Guid, &ChunkInfo> =
            self.chunk_data_list.iter().map(|c| (c.guid, c)).collect();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for part in files.flat_map(|f| f.chunk_parts.iter()) {
            if !seen.insert(part.guid) {
                continue;
            }
            match by_guid.get(&part.guid) {
                Some(info) => out.push((*info).clone()),
                None => warn!("Chunk {} referenced but not in chunk list", part.guid),
            }
        }
        out
    }

    /// Compressed bytes to fetch for a full install.
    pub fn total_download_size(&self) -> u64 {
        self.required_chunks().iter().map(|c| c.file_size).sum()
    }

    /// Bytes on disk after a full install.
    pub fn total_installed_size(&self) -> u64 {
        self.file_manifest_list.iter().map(|f| f.file_size()).sum()
    }

    /// Checks that every file's parts are contiguous and resolve to a chunk large enough
    /// to hold them.
    pub fn validate(&self) -> Result<()> {
        let by_guid: HashMap<Guid, &ChunkInfo> =
            self.chunk_data_list.iter().map(|c| (c.guid, c)).collect();
        for file in &self.file_manifest_list {
            file.validate()?;
            for part in &file.chunk_parts {
                let info = by_guid.get(&part.guid).ok_or_else(|| {
                    ChunkSyncError::MissingData(format!(
                        "{} references unknown chunk {}",
                        file.filename, part.guid
                    ))
                })?;
                if part.offset as u64 + part.size as u64 > info.window_size as u64 {
                    return Err(ChunkSyncError::Format(format!(
                        "{}: part {}+{} exceeds chunk {} window {}",
                        file.filename, part.offset, part.size, part.guid, info.window_size
                    )));
                }
            }
        }
        Ok(())
    }

    /// File-level differences going from `old` to `new`.
    pub fn compare(old: &Manifest, new: &Manifest) -> ManifestComparison {
        let old_files: HashMap<&str, &FileManifest> = old
            .file_manifest_list
            .iter()
            .map(|f| (f.filename.as_str(), f))
            .collect();
        let new_names: HashSet<&str> = new
            .file_manifest_list
            .iter()
            .map(|f| f.filename.as_str())
            .collect();

        let mut comparison = ManifestComparison::default();
        for file in &new.file_manifest_list {
            match old_files.get(file.filename.as_str()) {
                None => comparison.added.push(file.filename.clone()),
                Some(previous) if previous.hash != file.hash => {
                    comparison.modified.push(file.filename.clone())
                }
                Some(_) => comparison.unchanged.push(file.filename.clone()),
            }
        }
        for file in &old.file_manifest_list {
            if !new_names.contains(file.filename.as_str()) {
                comparison.removed.push(file.filename.clone());
            }
        }
        comparison
    }

    /// Chunks of `new` that must be fetched to update an install of `old`: everything
    /// used by added or modified files that `old` does not already provide.
    pub fn delta_chunks(old: &Manifest, new: &Manifest) -> Vec<ChunkInfo> {
        let comparison = Manifest::compare(old, new);
        let owned: HashSet<Guid> = old.chunk_data_list.iter().map(|c| c.guid).collect();
        new.chunks_for_files(
            comparison
                .added
                .iter()
                .chain(comparison.modified.iter())
                .map(String::as_str),
        )
        .into_iter()
        .filter(|c| !owned.contains(&c.guid))
        .collect()
    }
}

impl FileManifest {
    /// Parts must start at offset 0 and follow each other without gaps or overlaps.
    pub fn validate(&self) -> Result<()> {
        let mut expected = 0u64;
        for part in &self.chunk_parts {
            if part.file_offset != expected {
                return Err(ChunkSyncError::Format(format!(
                    "{}: part at {} but expected {}",
                    self.filename, part.file_offset, expected
                )));
            }
            expected += part.size as u64;
        }
        Ok(())
    }
}

/// Output of [`Manifest::compare`], file names grouped by change kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestComparison {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ManifestComparison {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty())
    }
}

fn inflate_body(compressed: &[u8], size_uncompressed: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    ZlibDecoder::new(compressed)
        .take(size_uncompressed as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|e| ChunkSyncError::Format(format!("corrupt manifest body: {}", e)))?;
    if body.len() != size_uncompressed {
        return Err(ChunkSyncError::Integrity(format!(
            "manifest body is {} bytes, header says {}",
            body.len(),
            size_uncompressed
        )));
    }
    Ok(body)
}

fn read_meta(r: &mut ByteReader<'_>) -> Result<ManifestMeta> {
    let start = r.position();
    let size = r.u32()?;
    let data_version = r.u8()?;

    let mut meta = ManifestMeta {
        feature_level: r.u32()?,
        is_file_data: r.u8()? == 1,
        app_id: r.u32()?,
        app_name: r.fstring()?,
        build_version: r.fstring()?,
        launch_exe: r.fstring()?,
        launch_command: r.fstring()?,
        ..ManifestMeta::default()
    };
    let prereq_count = r.count(4, "prerequisite id")?;
    meta.prereq_ids = (0..prereq_count)
        .map(|_| r.fstring())
        .collect::<Result<_>>()?;
    meta.prereq_name = r.fstring()?;
    meta.prereq_path = r.fstring()?;
    meta.prereq_args = r.fstring()?;
    if data_version >= 1 {
        meta.build_id = r.fstring()?;
    }
    if data_version >= 2 {
        meta.uninstall_action_path = r.fstring()?;
        meta.uninstall_action_args = r.fstring()?;
    }

    r.finish_section(start, size, "meta section")?;
    Ok(meta)
}

fn write_meta(buf: &mut Vec<u8>, meta: &ManifestMeta) -> Result<()> {
    let data_version = if !meta.uninstall_action_path.is_empty()
        || !meta.uninstall_action_args.is_empty()
    {
        2
    } else if !meta.build_id.is_empty() {
        1
    } else {
        0
    };

    let start = begin_section(buf, data_version);
    wire::put_u32(buf, meta.feature_level);
    wire::put_u8(buf, u8::from(meta.is_file_data));
    wire::put_u32(buf, meta.app_id);
    wire::put_fstring(buf, &meta.app_name)?;
    wire::put_fstring(buf, &meta.build_version)?;
    wire::put_fstring(buf, &meta.launch_exe)?;
    wire::put_fstring(buf, &meta.launch_command)?;
    wire::put_u32(buf, wire::wire_len(meta.prereq_ids.len(), "prerequisite list")?);
    for id in &meta.prereq_ids {
        wire::put_fstring(buf, id)?;
    }
    wire::put_fstring(buf, &meta.prereq_name)?;
    wire::put_fstring(buf, &meta.prereq_path)?;
    wire::put_fstring(buf, &meta.prereq_args)?;
    if data_version >= 1 {
        wire::put_fstring(buf, &meta.build_id)?;
    }
    if data_version >= 2 {
        wire::put_fstring(buf, &meta.uninstall_action_path)?;
        wire::put_fstring(buf, &meta.uninstall_action_args)?;
    }
    end_section(buf, start)
}

fn read_chunk_data_list(r: &mut ByteReader<'_>) -> Result<Vec<ChunkInfo>> {
    let start = r.position();
    let size = r.u32()?;
    let _version = r.u8()?;
    let count = r.count(MIN_CHUNK_RECORD, "chunk")?;

    let guids = (0..count).map(|_| r.guid()).collect::<Result<Vec<_>>>()?;
    let rolling_hashes = (0..count).map(|_| r.u64()).collect::<Result<Vec<_>>>()?;
    let sha_hashes = (0..count)
        .map(|_| r.array::<20>())
        .collect::<Result<Vec<_>>>()?;
    let group_nums = (0..count).map(|_| r.u8()).collect::<Result<Vec<_>>>()?;
    let window_sizes = (0..count).map(|_| r.u32()).collect::<Result<Vec<_>>>()?;
    let file_sizes = (0..count).map(|_| r.u64()).collect::<Result<Vec<_>>>()?;

    r.finish_section(start, size, "chunk data list")?;

    Ok((0..count)
        .map(|i| ChunkInfo {
            guid: guids[i],
            rolling_hash: rolling_hashes[i],
            sha_hash: sha_hashes[i],
            group_num: group_nums[i],
            window_size: window_sizes[i],
            file_size: file_sizes[i],
        })
        .collect())
}

fn write_chunk_data_list(buf: &mut Vec<u8>, chunks: &[ChunkInfo]) -> Result<()> {
    let start = begin_section(buf, 0);
    wire::put_u32(buf, wire::wire_len(chunks.len(), "chunk list")?);
    for c in chunks {
        wire::put_guid(buf, &c.guid);
    }
    for c in chunks {
        wire::put_u64(buf, c.rolling_hash);
    }
    for c in chunks {
        buf.extend_from_slice(&c.sha_hash);
    }
    for c in chunks {
        wire::put_u8(buf, c.group_num);
    }
    for c in chunks {
        wire::put_u32(buf, c.window_size);
    }
    for c in chunks {
        wire::put_u64(buf, c.file_size);
    }
    end_section(buf, start)
}

fn read_file_manifest_list(r: &mut ByteReader<'_>) -> Result<Vec<FileManifest>> {
    let start = r.position();
    let size = r.u32()?;
    let version = r.u8()?;
    let count = r.count(MIN_FILE_RECORD, "file")?;

    let mut files: Vec<FileManifest> = (0..count)
        .map(|_| -> Result<FileManifest> {
            Ok(FileManifest {
                filename: r.fstring()?,
                ..FileManifest::default()
            })
        })
        .collect::<Result<_>>()?;
    for file in files.iter_mut() {
        file.symlink_target = r.fstring()?;
    }
    for file in files.iter_mut() {
        file.hash = r.array()?;
    }
    for file in files.iter_mut() {
        file.flags = r.u8()?;
    }
    for file in files.iter_mut() {
        let tag_count = r.count(4, "install tag")?;
        file.install_tags = (0..tag_count).map(|_| r.fstring()).collect::<Result<_>>()?;
    }
    for file in files.iter_mut() {
        let part_count = r.count(MIN_PART_RECORD, "chunk part")?;
        let mut file_offset = 0u64;
        let mut parts = Vec::with_capacity(part_count);
        for _ in 0..part_count {
            let part_start = r.position();
            let part_size = r.u32()?;
            let guid = r.guid()?;
            let offset = r.u32()?;
            let size = r.u32()?;
            r.finish_section(part_start, part_size, "chunk part")?;
            parts.push(ChunkPart {
                guid,
                offset,
                size,
                file_offset,
            });
            file_offset += size as u64;
        }
        file.chunk_parts = parts;
    }
    if version >= 1 {
        for file in files.iter_mut() {
            let has_md5 = r.u32()?;
            if has_md5 != 0 {
                file.hash_md5 = Some(r.array()?);
            }
        }
        for file in files.iter_mut() {
            file.mime_type = r.fstring()?;
        }
    }
    if version >= 2 {
        for file in files.iter_mut() {
            file.hash_sha256 = r.array()?;
        }
    }

    r.finish_section(start, size, "file manifest list")?;
    Ok(files)
}

fn write_file_manifest_list(buf: &mut Vec<u8>, files: &[FileManifest]) -> Result<()> {
    let version = if files.iter().any(|f| f.hash_sha256 != [0u8; 32]) {
        2
    } else if files
        .iter()
        .any(|f| f.hash_md5.is_some() || !f.mime_type.is_empty())
    {
        1
    } else {
        0
    };

    let start = begin_section(buf, version);
    wire::put_u32(buf, wire::wire_len(files.len(), "file list")?);
    for f in files {
        wire::put_fstring(buf, &f.filename)?;
    }
    for f in files {
        wire::put_fstring(buf, &f.symlink_target)?;
    }
    for f in files {
        buf.extend_from_slice(&f.hash);
    }
    for f in files {
        wire::put_u8(buf, f.flags);
    }
    for f in files {
        wire::put_u32(buf, wire::wire_len(f.install_tags.len(), "install tags")?);
        for tag in &f.install_tags {
            wire::put_fstring(buf, tag)?;
        }
    }
    for f in files {
        wire::put_u32(buf, wire::wire_len(f.chunk_parts.len(), "chunk parts")?);
        for part in &f.chunk_parts {
            wire::put_u32(buf, MIN_PART_RECORD as u32);
            wire::put_guid(buf, &part.guid);
            wire::put_u32(buf, part.offset);
            wire::put_u32(buf, part.size);
        }
    }
    if version >= 1 {
        for f in files {
            match &f.hash_md5 {
                Some(md5) => {
                    wire::put_u32(buf, 1);
                    buf.extend_from_slice(md5);
                }
                None => wire::put_u32(buf, 0),
            }
        }
        for f in files {
            wire::put_fstring(buf, &f.mime_type)?;
        }
    }
    if version >= 2 {
        for f in files {
            buf.extend_from_slice(&f.hash_sha256);
        }
    }
    end_section(buf, start)
}

fn read_custom_fields(r: &mut ByteReader<'_>) -> Result<BTreeMap<String, String>> {
    let start = r.position();
    let size = r.u32()?;
    let _version = r.u8()?;
    let count = r.count(8, "custom field")?;

    let keys = (0..count).map(|_| r.fstring()).collect::<Result<Vec<_>>>()?;
    let values = (0..count).map(|_| r.fstring()).collect::<Result<Vec<_>>>()?;

    r.finish_section(start, size, "custom fields")?;
    Ok(keys.into_iter().zip(values).collect())
}

fn write_custom_fields(buf: &mut Vec<u8>, fields: &BTreeMap<String, String>) -> Result<()> {
    let start = begin_section(buf, 0);
    wire::put_u32(buf, wire::wire_len(fields.len(), "custom fields")?);
    for key in fields.keys() {
        wire::put_fstring(buf, key)?;
    }
    for value in fields.values() {
        wire::put_fstring(buf, value)?;
    }
    end_section(buf, start)
}

/// Reserves the section size and writes its version; returns the section start.
fn begin_section(buf: &mut Vec<u8>, version: u8) -> usize {
    let start = buf.len();
    wire::put_u32(buf, 0);
    wire::put_u8(buf, version);
    start
}

fn end_section(buf: &mut [u8], start: usize) -> Result<()> {
    let size = wire::wire_len(buf.len() - start, "manifest section")?;
    wire::patch_u32(buf, start, size);
    Ok(())
}
