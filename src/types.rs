//! Data structures and configuration shared by the codecs, the downloader and sync.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Uncompressed size of every chunk buffer (1 MiB).
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// 128-bit chunk identifier, four little-endian `u32` words on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid(pub [u32; 4]);

impl Guid {
    /// Mints a fresh random identifier.
    pub fn random() -> Self {
        Guid([
            rand::random(),
            rand::random(),
            rand::random(),
            rand::random(),
        ])
    }

    /// The 16 raw bytes as serialized in manifests and chunk headers.
    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, word) in self.0.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_le_bytes([
                bytes[i * 4],
                bytes[i * 4 + 1],
                bytes[i * 4 + 2],
                bytes[i * 4 + 3],
            ]);
        }
        Guid(words)
    }

    /// Upper-case, undelimited form used in chunk storage paths.
    pub fn path_hex(&self) -> String {
        self.0.iter().map(|w| format!("{:08X}", w)).collect()
    }
}

impl fmt::Display for Guid {
    /// Lower-case dashed form, also used as the chunk cache file name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:08x}-{:08x}-{:08x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// One entry of the manifest's chunk data list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub guid: Guid,
    /// Rolling hash of the padded uncompressed buffer.
    pub rolling_hash: u64,
    /// SHA-1 of the padded uncompressed buffer.
    pub sha_hash: [u8; 20],
    /// `crc32(guid) % 100`.
    pub group_num: u8,
    /// Uncompressed size (normally [`CHUNK_SIZE`]).
    pub window_size: u32,
    /// Compressed size as stored on the CDN, header included.
    pub file_size: u64,
}

impl ChunkInfo {
    /// Relative storage path of this chunk under `chunk_dir` (e.g. `ChunksV4`).
    pub fn chunk_path(&self, chunk_dir: &str) -> String {
        self.storage_path(chunk_dir, false)
    }

    /// Like [`chunk_path`](Self::chunk_path), but with `hash_prefix_v3` set a
    /// `ChunksV3` chunk is sharded by the first two hex digits of its rolling hash
    /// instead of its group number. Other directories always use the group number.
    pub fn storage_path(&self, chunk_dir: &str, hash_prefix_v3: bool) -> String {
        let hash_hex = format!("{:016X}", self.rolling_hash);
        let subfolder = if hash_prefix_v3 && chunk_dir == "ChunksV3" {
            hash_hex[..2].to_string()
        } else {
            format!("{:02}", self.group_num)
        };
        format!(
            "{}/{}/{}_{}.chunk",
            chunk_dir,
            subfolder,
            hash_hex,
            self.guid.path_hex()
        )
    }
}

/// Slice of one chunk consumed by a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPart {
    pub guid: Guid,
    /// Offset into the uncompressed chunk buffer.
    pub offset: u32,
    pub size: u32,
    /// Offset into the destination file.
    pub file_offset: u64,
}

/// How a single file is composed from chunk parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileManifest {
    /// Forward-slash relative path.
    pub filename: String,
    pub symlink_target: String,
    /// SHA-1 of the whole file.
    pub hash: [u8; 20],
    pub flags: u8,
    pub install_tags: Vec<String>,
    pub chunk_parts: Vec<ChunkPart>,
    pub hash_md5: Option<[u8; 16]>,
    pub mime_type: String,
    /// All zero when unknown.
    pub hash_sha256: [u8; 32],
}

impl FileManifest {
    pub const FLAG_READ_ONLY: u8 = 0x1;
    pub const FLAG_COMPRESSED: u8 = 0x2;
    pub const FLAG_EXECUTABLE: u8 = 0x4;

    /// Size of the reconstructed file.
    pub fn file_size(&self) -> u64 {
        self.chunk_parts.iter().map(|p| p.size as u64).sum()
    }

    pub fn is_executable(&self) -> bool {
        self.flags & Self::FLAG_EXECUTABLE != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & Self::FLAG_READ_ONLY != 0
    }
}

/// Build metadata block of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestMeta {
    pub feature_level: u32,
    pub is_file_data: bool,
    pub app_id: u32,
    pub app_name: String,
    pub build_version: String,
    pub launch_exe: String,
    pub launch_command: String,
    pub prereq_ids: Vec<String>,
    pub prereq_name: String,
    pub prereq_path: String,
    pub prereq_args: String,
    pub build_id: String,
    pub uninstall_action_path: String,
    pub uninstall_action_args: String,
}

impl Default for ManifestMeta {
    fn default() -> Self {
        Self {
            feature_level: 18,
            is_file_data: false,
            app_id: 0,
            app_name: String::new(),
            build_version: String::new(),
            launch_exe: String::new(),
            launch_command: String::new(),
            prereq_ids: Vec::new(),
            prereq_name: String::new(),
            prereq_path: String::new(),
            prereq_args: String::new(),
            build_id: String::new(),
            uninstall_action_path: String::new(),
            uninstall_action_args: String::new(),
        }
    }
}

/// Complete description of a build: chunks, files and metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub meta: ManifestMeta,
    pub chunk_data_list: Vec<ChunkInfo>,
    pub file_manifest_list: Vec<FileManifest>,
    pub custom_fields: BTreeMap<String, String>,
}

/// A CDN base URL serving chunks for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnMirror {
    /// e.g. `https://download.example.com`
    pub base_url: String,
    /// Query string appended to each request, with or without a leading `?`.
    pub auth_query_params: String,
    /// Build directory prefix, e.g. `/Builds/Org/o-abc/xyz/default`.
    pub cloud_dir: String,
    /// Mirror shards `ChunksV3` by rolling-hash prefix rather than group number.
    pub hash_prefix_v3: bool,
}

impl CdnMirror {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_query_params: String::new(),
            cloud_dir: String::new(),
            hash_prefix_v3: false,
        }
    }

    /// Full URL of `info` under `chunk_dir`, using this mirror's shard layout.
    pub fn url_for(&self, info: &ChunkInfo, chunk_dir: &str) -> String {
        self.chunk_url(&info.storage_path(chunk_dir, self.hash_prefix_v3))
    }

    /// Full URL of `chunk_path` on this mirror.
    pub fn chunk_url(&self, chunk_path: &str) -> String {
        let mut url = format!("{}{}/{}", self.base_url, self.cloud_dir, chunk_path);
        let auth = self.auth_query_params.trim_start_matches('?');
        if !auth.is_empty() {
            url.push('?');
            url.push_str(auth);
        }
        url
    }
}

/// Configuration for chunk downloads.
///
/// # Example
///
/// ```
/// use chunksync::DownloadConfig;
///
/// let config = DownloadConfig {
///     max_concurrent_downloads: 8,
///     ..DownloadConfig::default()
/// };
/// assert_eq!(config.max_attempts, 3);
/// ```
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Directory holding GUID-named decompressed chunks.
    pub cache_dir: PathBuf,
    /// Chunks fetched concurrently per batch (default: 6).
    pub max_concurrent_downloads: usize,
    /// Attempts per chunk, each attempt walking every mirror (default: 3).
    pub max_attempts: usize,
    /// First retry delay; doubles on every further retry (default: 1000 ms).
    pub retry_base_delay_ms: u64,
    pub connect_timeout: Duration,
    /// Whole-request timeout, body included.
    pub request_timeout: Duration,
    /// Check each assembled file's SHA-1 against the manifest.
    pub verify_files: bool,
    /// Trust any cached chunk of the right size without hashing it.
    pub skip_verify: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".chunk-cache"),
            max_concurrent_downloads: 6,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            verify_files: true,
            skip_verify: false,
        }
    }
}

/// Configuration for cloud-save sync.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the save storage service.
    pub api_base_url: String,
    /// Chunk settings used for save downloads; its `cache_dir` holds per-game caches.
    pub download: DownloadConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://datastorage-public-service-liveegs.live.use1a.on.epicgames.com"
                .to_string(),
            download: DownloadConfig::default(),
        }
    }
}

/// What the caller asked `sync` to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreferredAction {
    /// Decide from local/remote state and timestamps.
    #[default]
    Auto,
    /// Overwrite local saves with the cloud copy.
    Download,
    /// Replace the cloud copy with local saves.
    Upload,
}

/// Outcome of sync detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Upload,
    Download,
    Conflict,
    None,
}

/// Observable state of one (account, game) sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Detecting,
    Downloading,
    Uploading,
    ResolvingConflict,
}

/// A game whose saves are synchronized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveGame {
    pub game_id: u32,
    /// Store-side application name used in API paths.
    pub app_name: String,
    /// Save folder template, e.g. `{appdata}/Studio/Game/Saves`.
    pub save_folder: String,
    pub install_dir: Option<PathBuf>,
}

/// Bearer credentials for the save storage service.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_token: String,
    pub account_id: String,
    pub display_name: Option<String>,
}
