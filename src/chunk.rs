//! Chunk wire format: versioned header followed by a (usually zlib) payload.

use crate::error::{ChunkSyncError, Result};
use crate::types::{ChunkInfo, Guid};
use crate::wire::{self, ByteReader};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, warn};

pub const CHUNK_MAGIC: u32 = 0xB1FE3AA2;
pub const CHUNK_HEADER_VERSION: u32 = 3;
pub const CHUNK_HEADER_SIZE: u32 = 66;

/// `stored_as` bit marking a zlib payload.
pub const STORED_COMPRESSED: u8 = 0x1;
/// `hash_type`: both rolling hash and SHA-1 present.
const HASH_TYPE_BOTH: u8 = 0x3;

/// Fixed buffer size for every streaming read/write.
pub(crate) const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Headers larger than this are treated as corrupt rather than skipped.
const MAX_HEADER_SIZE: u32 = 4096;

// magic + version + header_size + compressed_size + guid + rolling hash + stored_as
const V1_HEADER_SIZE: u32 = 4 + 4 + 4 + 4 + 16 + 8 + 1;
// + sha + hash_type
const V2_HEADER_SIZE: u32 = V1_HEADER_SIZE + 20 + 1;

/// Parsed chunk header. Fields absent from older header versions are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub header_version: u32,
    pub header_size: u32,
    pub compressed_size: u32,
    pub guid: Guid,
    pub rolling_hash: u64,
    pub stored_as: u8,
    pub sha_hash: Option<[u8; 20]>,
    pub hash_type: Option<u8>,
    pub uncompressed_size: Option<u32>,
}

impl ChunkHeader {
    pub fn is_compressed(&self) -> bool {
        self.stored_as & STORED_COMPRESSED != 0
    }

    /// Reads exactly `header_size` bytes, leaving `reader` at the first payload byte.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut fixed = [0u8; 12];
        read_header_bytes(reader, &mut fixed)?;
        let mut r = ByteReader::new(&fixed);
        let magic = r.u32()?;
        if magic != CHUNK_MAGIC {
            return Err(ChunkSyncError::Format(format!(
                "bad chunk magic {:#010x}",
                magic
            )));
        }
        let header_version = r.u32()?;
        let header_size = r.u32()?;

        let minimum = match header_version {
            0 | 1 => V1_HEADER_SIZE,
            2 => V2_HEADER_SIZE,
            _ => CHUNK_HEADER_SIZE,
        };
        if header_size < minimum || header_size > MAX_HEADER_SIZE {
            return Err(ChunkSyncError::Format(format!(
                "chunk header v{} has invalid size {}",
                header_version, header_size
            )));
        }

        let mut rest = vec![0u8; header_size as usize - fixed.len()];
        read_header_bytes(reader, &mut rest)?;
        let mut r = ByteReader::new(&rest);
        let compressed_size = r.u32()?;
        let guid = r.guid()?;
        let rolling_hash = r.u64()?;
        let stored_as = r.u8()?;

        let (sha_hash, hash_type) = if header_version >= 2 {
            (Some(r.array::<20>()?), Some(r.u8()?))
        } else {
            (None, None)
        };
        let uncompressed_size = if header_version >= 3 {
            Some(r.u32()?)
        } else {
            None
        };

        Ok(Self {
            header_version,
            header_size,
            compressed_size,
            guid,
            rolling_hash,
            stored_as,
            sha_hash,
            hash_type,
            uncompressed_size,
        })
    }
}

fn read_header_bytes<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            ChunkSyncError::Format("truncated chunk header".to_string())
        }
        _ => ChunkSyncError::IoError(e),
    })
}

/// Compresses a padded chunk buffer and prefixes it with a v3 header.
pub fn encode(padded: &[u8], guid: Guid, rolling_hash: u64, sha_hash: [u8; 20]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(padded)?;
    let payload = encoder.finish()?;

    let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE as usize + payload.len());
    wire::put_u32(&mut out, CHUNK_MAGIC);
    wire::put_u32(&mut out, CHUNK_HEADER_VERSION);
    wire::put_u32(&mut out, CHUNK_HEADER_SIZE);
    wire::put_u32(&mut out, wire::wire_len(payload.len(), "chunk payload")?);
    wire::put_guid(&mut out, &guid);
    wire::put_u64(&mut out, rolling_hash);
    wire::put_u8(&mut out, STORED_COMPRESSED);
    out.extend_from_slice(&sha_hash);
    wire::put_u8(&mut out, HASH_TYPE_BOTH);
    wire::put_u32(&mut out, wire::wire_len(padded.len(), "chunk buffer")?);
    debug_assert_eq!(out.len(), CHUNK_HEADER_SIZE as usize);

    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decodes a whole chunk held in memory.
pub fn decode(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    decode_stream(bytes, &mut out, None)?;
    Ok(out)
}

/// Result of a streaming decode.
#[derive(Debug, Clone)]
pub struct DecodedChunk {
    pub header: ChunkHeader,
    /// Uncompressed bytes written to the destination.
    pub size: u64,
}

/// Streams a chunk from `reader` into `writer` through fixed 64 KiB buffers.
///
/// The output length is checked against the header's `uncompressed_size` (or the
/// expected window size for older headers) and its SHA-1 against the header's hash
/// (or the expected one). When `expected` is given its GUID and hash must agree with
/// the header.
pub fn decode_stream<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    expected: Option<&ChunkInfo>,
) -> Result<DecodedChunk> {
    let header = ChunkHeader::read_from(&mut reader)?;

    if let Some(info) = expected {
        if info.guid != header.guid {
            return Err(ChunkSyncError::Integrity(format!(
                "chunk header guid {} does not match expected {}",
                header.guid, info.guid
            )));
        }
        if let Some(sha) = header.sha_hash {
            if sha != info.sha_hash {
                return Err(ChunkSyncError::Integrity(format!(
                    "chunk {} header hash disagrees with manifest",
                    info.guid
                )));
            }
        }
    }

    let expected_size = header
        .uncompressed_size
        .or_else(|| expected.map(|info| info.window_size))
        .map(u64::from);
    let expected_sha = header.sha_hash.or_else(|| expected.map(|info| info.sha_hash));

    let payload = reader.take(header.compressed_size as u64);
    let (written, computed) = if header.is_compressed() {
        let inflater = ZlibDecoder::new(BufReader::with_capacity(STREAM_BUFFER_SIZE, payload));
        pump(inflater, writer, &header.guid, expected_size)?
    } else {
        pump(payload, writer, &header.guid, expected_size)?
    };

    if let Some(limit) = expected_size {
        if written != limit {
            return Err(ChunkSyncError::Integrity(format!(
                "chunk {} size mismatch: expected {} bytes, got {}",
                header.guid, limit, written
            )));
        }
    }
    if let Some(sha) = expected_sha {
        if computed != sha {
            return Err(ChunkSyncError::Integrity(format!(
                "chunk {} SHA-1 mismatch",
                header.guid
            )));
        }
    }

    Ok(DecodedChunk {
        header,
        size: written,
    })
}

/// Copies `source` into `writer`, hashing as it goes and stopping as soon as more
/// than `limit` bytes come out.
fn pump<S: Read, W: Write>(
    mut source: S,
    writer: &mut W,
    guid: &Guid,
    limit: Option<u64>,
) -> Result<(u64, [u8; 20])> {
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
    let mut written: u64 = 0;
    loop {
        let n = source.read(&mut buffer).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::UnexpectedEof => {
                ChunkSyncError::Integrity(format!("corrupt payload in chunk {}: {}", guid, e))
            }
            _ => ChunkSyncError::IoError(e),
        })?;
        if n == 0 {
            break;
        }
        written += n as u64;
        if let Some(limit) = limit {
            if written > limit {
                return Err(ChunkSyncError::Integrity(format!(
                    "chunk {} inflates past its declared {} bytes",
                    guid, limit
                )));
            }
        }
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n])?;
    }
    Ok((written, hasher.finalize().into()))
}

/// Decodes the chunk file at `src` into `dest`.
///
/// On any failure `dest` is removed so a partial chunk is never left in the cache.
pub fn decode_to_file(src: &Path, dest: &Path, expected: &ChunkInfo) -> Result<u64> {
    let result = (|| -> Result<u64> {
        let input = BufReader::with_capacity(STREAM_BUFFER_SIZE, std::fs::File::open(src)?);
        let mut output = BufWriter::with_capacity(STREAM_BUFFER_SIZE, std::fs::File::create(dest)?);
        let decoded = decode_stream(input, &mut output, Some(expected))?;
        output.flush()?;
        Ok(decoded.size)
    })();

    match result {
        Ok(size) => {
            debug!("Decoded chunk {} ({} bytes)", expected.guid, size);
            Ok(size)
        }
        Err(e) => {
            if let Err(rm) = std::fs::remove_file(dest) {
                if rm.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove partial chunk {}: {}", dest.display(), rm);
                }
            }
            Err(e)
        }
    }
}
