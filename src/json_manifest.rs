//! Older JSON manifest format, parsed into the same [`Manifest`] model as the binary one.
//!
//! Numbers and hashes in this format are "blobs": strings of three-digit decimal byte
//! values, least significant byte first (`"013000000000"` is 13). Chunk GUIDs are
//! 32 hex digits, and chunk SHA-1s are plain hex.

use crate::error::{ChunkSyncError, Result};
use crate::types::{
    ChunkInfo, ChunkPart, FileManifest, Guid, Manifest, ManifestMeta, CHUNK_SIZE,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Feature level assumed when `ManifestFileVersion` is absent.
const DEFAULT_FEATURE_LEVEL: u32 = 13;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonManifest {
    #[serde(rename = "ManifestFileVersion")]
    manifest_file_version: String,
    #[serde(rename = "bIsFileData")]
    is_file_data: bool,
    #[serde(rename = "AppID")]
    app_id: String,
    #[serde(rename = "AppNameString")]
    app_name: String,
    #[serde(rename = "BuildVersionString")]
    build_version: String,
    #[serde(rename = "LaunchExeString")]
    launch_exe: String,
    #[serde(rename = "LaunchCommand")]
    launch_command: String,
    #[serde(rename = "PrereqIds")]
    prereq_ids: Vec<String>,
    #[serde(rename = "PrereqName")]
    prereq_name: String,
    #[serde(rename = "PrereqPath")]
    prereq_path: String,
    #[serde(rename = "PrereqArgs")]
    prereq_args: String,
    #[serde(rename = "FileManifestList")]
    files: Vec<JsonFile>,
    #[serde(rename = "ChunkHashList")]
    chunk_hashes: BTreeMap<String, String>,
    #[serde(rename = "ChunkShaList")]
    chunk_shas: BTreeMap<String, String>,
    #[serde(rename = "DataGroupList")]
    data_groups: BTreeMap<String, String>,
    #[serde(rename = "ChunkFilesizeList")]
    chunk_file_sizes: BTreeMap<String, String>,
    #[serde(rename = "CustomFields")]
    custom_fields: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonFile {
    #[serde(rename = "Filename")]
    filename: String,
    #[serde(rename = "FileHash")]
    file_hash: String,
    #[serde(rename = "bIsReadOnly")]
    read_only: bool,
    #[serde(rename = "bIsCompressed")]
    compressed: bool,
    #[serde(rename = "bIsUnixExecutable")]
    executable: bool,
    #[serde(rename = "InstallTags")]
    install_tags: Vec<String>,
    #[serde(rename = "FileChunkParts")]
    chunk_parts: Vec<JsonChunkPart>,
}

#[derive(Debug, Deserialize)]
struct JsonChunkPart {
    #[serde(rename = "Guid")]
    guid: String,
    #[serde(rename = "Offset")]
    offset: String,
    #[serde(rename = "Size")]
    size: String,
}

/// True when `data` starts, after whitespace, with a JSON object.
pub(crate) fn looks_like_json(data: &[u8]) -> bool {
    data.iter()
        .find(|&&b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
        .is_some_and(|&b| b == b'{')
}

/// Parses a JSON manifest. Every chunk gets a 1 MiB window.
pub(crate) fn parse(data: &[u8]) -> Result<Manifest> {
    let json: JsonManifest = serde_json::from_slice(data)
        .map_err(|e| ChunkSyncError::Format(format!("invalid JSON manifest: {}", e)))?;

    let feature_level = if json.manifest_file_version.is_empty() {
        DEFAULT_FEATURE_LEVEL
    } else {
        blob_u32(&json.manifest_file_version, "ManifestFileVersion")?
    };
    let meta = ManifestMeta {
        feature_level,
        is_file_data: json.is_file_data,
        app_id: if json.app_id.is_empty() {
            0
        } else {
            blob_u32(&json.app_id, "AppID")?
        },
        app_name: json.app_name,
        build_version: json.build_version,
        launch_exe: json.launch_exe,
        launch_command: json.launch_command,
        prereq_ids: json.prereq_ids,
        prereq_name: json.prereq_name,
        prereq_path: json.prereq_path,
        prereq_args: json.prereq_args,
        ..ManifestMeta::default()
    };

    let chunk_data_list = json
        .chunk_file_sizes
        .iter()
        .map(|(key, file_size)| -> Result<ChunkInfo> {
            let lookup =
                |list: &BTreeMap<String, String>| list.get(key).cloned().unwrap_or_default();
            let group = blob_u64(&lookup(&json.data_groups), "DataGroupList")?;
            Ok(ChunkInfo {
                guid: parse_guid(key)?,
                rolling_hash: blob_u64(&lookup(&json.chunk_hashes), "ChunkHashList")?,
                sha_hash: parse_sha_hex(&lookup(&json.chunk_shas))?,
                group_num: u8::try_from(group).map_err(|_| {
                    ChunkSyncError::Format(format!(
                        "data group {} of chunk {} out of range",
                        group, key
                    ))
                })?,
                window_size: CHUNK_SIZE as u32,
                file_size: blob_u64(file_size, "ChunkFilesizeList")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let file_manifest_list = json
        .files
        .into_iter()
        .map(convert_file)
        .collect::<Result<Vec<_>>>()?;

    debug!(
        "JSON manifest v{}: {} files, {} chunks",
        feature_level,
        file_manifest_list.len(),
        chunk_data_list.len()
    );
    Ok(Manifest {
        meta,
        chunk_data_list,
        file_manifest_list,
        custom_fields: json.custom_fields,
    })
}

fn convert_file(file: JsonFile) -> Result<FileManifest> {
    let mut flags = 0;
    if file.read_only {
        flags |= FileManifest::FLAG_READ_ONLY;
    }
    if file.compressed {
        flags |= FileManifest::FLAG_COMPRESSED;
    }
    if file.executable {
        flags |= FileManifest::FLAG_EXECUTABLE;
    }

    let mut file_offset = 0u64;
    let mut chunk_parts = Vec::with_capacity(file.chunk_parts.len());
    for part in &file.chunk_parts {
        let size = blob_u32(&part.size, "chunk part size")?;
        chunk_parts.push(ChunkPart {
            guid: parse_guid(&part.guid)?,
            offset: blob_u32(&part.offset, "chunk part offset")?,
            size,
            file_offset,
        });
        file_offset += size as u64;
    }

    Ok(FileManifest {
        hash: blob_array(&file.file_hash, "FileHash")?,
        filename: file.filename,
        flags,
        install_tags: file.install_tags,
        chunk_parts,
        ..FileManifest::default()
    })
}

/// Decodes a blob into its bytes, least significant first.
fn blob_bytes(blob: &str, what: &str) -> Result<Vec<u8>> {
    if blob.len() % 3 != 0 {
        return Err(ChunkSyncError::Format(format!(
            "{} blob {:?} is not a whole number of bytes",
            what, blob
        )));
    }
    blob.as_bytes()
        .chunks(3)
        .map(|digits| {
            std::str::from_utf8(digits)
                .ok()
                .and_then(|d| d.parse::<u8>().ok())
                .ok_or_else(|| {
                    ChunkSyncError::Format(format!("{} blob {:?} is malformed", what, blob))
                })
        })
        .collect()
}

fn blob_u64(blob: &str, what: &str) -> Result<u64> {
    let bytes = blob_bytes(blob, what)?;
    if bytes.len() > 8 {
        return Err(ChunkSyncError::Format(format!(
            "{} blob holds {} bytes, more than a u64",
            what,
            bytes.len()
        )));
    }
    Ok(bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

fn blob_u32(blob: &str, what: &str) -> Result<u32> {
    let value = blob_u64(blob, what)?;
    u32::try_from(value)
        .map_err(|_| ChunkSyncError::Format(format!("{} value {} exceeds u32", what, value)))
}

/// Fixed-size hash blob; a short blob is zero-padded.
fn blob_array<const N: usize>(blob: &str, what: &str) -> Result<[u8; N]> {
    let bytes = blob_bytes(blob, what)?;
    if bytes.len() > N {
        return Err(ChunkSyncError::Format(format!(
            "{} blob holds {} bytes, expected at most {}",
            what,
            bytes.len(),
            N
        )));
    }
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(&bytes);
    Ok(out)
}

/// 32 hex digits (dashes allowed), read as four big-endian words.
fn parse_guid(text: &str) -> Result<Guid> {
    let hex: String = text.chars().filter(|&c| c != '-').collect();
    if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ChunkSyncError::Format(format!("invalid chunk GUID {:?}", text)));
    }
    let mut words = [0u32; 4];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16)
            .map_err(|e| ChunkSyncError::Format(format!("invalid chunk GUID {:?}: {}", text, e)))?;
    }
    Ok(Guid(words))
}

/// 40 hex digits; an absent hash is all zero.
fn parse_sha_hex(text: &str) -> Result<[u8; 20]> {
    let mut out = [0u8; 20];
    if text.is_empty() {
        return Ok(out);
    }
    if text.len() != 40 || !text.is_ascii() {
        return Err(ChunkSyncError::Format(format!("invalid chunk SHA-1 {:?}", text)));
    }
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16)
            .map_err(|e| ChunkSyncError::Format(format!("invalid chunk SHA-1 {:?}: {}", text, e)))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    {
        "ManifestFileVersion": "013000000000",
        "bIsFileData": false,
        "AppID": "000000000000",
        "AppNameString": "Fern",
        "BuildVersionString": "1.0.2",
        "LaunchExeString": "Fern.exe",
        "LaunchCommand": "",
        "PrereqIds": [],
        "FileManifestList": [
            {
                "Filename": "Fern.exe",
                "FileHash": "001002003004005006007008009010011012013014015016017018019020",
                "bIsUnixExecutable": true,
                "InstallTags": ["core"],
                "FileChunkParts": [
                    { "Guid": "0A0B0C0D11121314A1A2A3A4FFFFFFFF", "Offset": "000000000000", "Size": "000001000000" },
                    { "Guid": "0A0B0C0D11121314A1A2A3A4FFFFFFFF", "Offset": "000001000000", "Size": "016000000000" }
                ]
            }
        ],
        "ChunkHashList": { "0A0B0C0D11121314A1A2A3A4FFFFFFFF": "171000000000000000000000" },
        "ChunkShaList": { "0A0B0C0D11121314A1A2A3A4FFFFFFFF": "a9993e364706816aba3e25717850c26c9cd0d89d" },
        "DataGroupList": { "0A0B0C0D11121314A1A2A3A4FFFFFFFF": "042" },
        "ChunkFilesizeList": { "0A0B0C0D11121314A1A2A3A4FFFFFFFF": "000004000000" },
        "CustomFields": { "CloudSaveFolder": "{appdata}/Fern" }
    }"#;

    #[test]
    fn test_parse_sample_manifest() {
        let manifest = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(manifest.meta.feature_level, 13);
        assert_eq!(manifest.meta.app_name, "Fern");
        assert_eq!(manifest.meta.build_version, "1.0.2");
        assert_eq!(manifest.chunk_dir(), "ChunksV3");

        let chunk = &manifest.chunk_data_list[0];
        assert_eq!(chunk.guid, Guid([0x0A0B0C0D, 0x11121314, 0xA1A2A3A4, 0xFFFFFFFF]));
        assert_eq!(chunk.rolling_hash, 171);
        assert_eq!(chunk.group_num, 42);
        assert_eq!(chunk.file_size, 1024);
        assert_eq!(chunk.window_size, CHUNK_SIZE as u32);
        assert_eq!(chunk.sha_hash[0], 0xa9);

        let file = &manifest.file_manifest_list[0];
        assert!(file.is_executable());
        assert_eq!(file.hash[..3], [1, 2, 3]);
        assert_eq!(file.install_tags, vec!["core"]);
        assert_eq!(file.chunk_parts[1].offset, 256);
        assert_eq!(file.chunk_parts[1].file_offset, 256);
        assert_eq!(file.file_size(), 256 + 16);
        assert_eq!(
            manifest.custom_fields.get("CloudSaveFolder").map(String::as_str),
            Some("{appdata}/Fern")
        );
        manifest.validate().unwrap();
    }

    #[test]
    fn test_read_all_detects_json() {
        let padded = format!("\n  {}", SAMPLE);
        assert!(looks_like_json(padded.as_bytes()));
        assert!(!looks_like_json(&crate::manifest::MANIFEST_MAGIC.to_le_bytes()));
        assert!(!looks_like_json(b"   "));

        let manifest = Manifest::read_all(padded.as_bytes()).unwrap();
        assert_eq!(manifest, parse(SAMPLE.as_bytes()).unwrap());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let manifest = parse(br#"{"AppNameString": "Bare"}"#).unwrap();
        assert_eq!(manifest.meta.feature_level, DEFAULT_FEATURE_LEVEL);
        assert_eq!(manifest.meta.app_name, "Bare");
        assert!(manifest.chunk_data_list.is_empty());
        assert!(manifest.file_manifest_list.is_empty());
    }

    #[test]
    fn test_blob_decoding() {
        assert_eq!(blob_u64("013000000000", "v").unwrap(), 13);
        assert_eq!(blob_u64("000001", "v").unwrap(), 256);
        assert_eq!(blob_u64("", "v").unwrap(), 0);
        assert!(blob_u64("0130", "v").is_err());
        assert!(blob_u64("999", "v").is_err());
        assert!(blob_u64("001002003004005006007008009", "v").is_err());
        assert!(blob_u32("000000000000001", "v").is_err());
        assert_eq!(blob_array::<4>("001", "h").unwrap(), [1, 0, 0, 0]);
    }

    #[test]
    fn test_malformed_json_is_format_error() {
        for bad in [
            &br#"{"FileManifestList": 5}"#[..],
            br#"{"ChunkFilesizeList": {"nothex": "001"}}"#,
            br#"{"ChunkFilesizeList": {"0A0B0C0D11121314A1A2A3A4FFFFFFFF": "001"}, "DataGroupList": {"0A0B0C0D11121314A1A2A3A4FFFFFFFF": "001001"}}"#,
            b"{ truncated",
        ] {
            assert!(matches!(
                Manifest::read_all(bad),
                Err(ChunkSyncError::Format(_))
            ));
        }
    }
}
