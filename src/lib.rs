//! chunksync - Chunked content distribution and cloud-save sync engine
//!
//! This library reads and writes binary build manifests, downloads and decodes
//! compressed chunks from CDN mirrors, rebuilds files from chunk parts, packages a
//! directory into chunks, and keeps a game's save directory in sync with a cloud
//! storage service.
//!
//! # Features
//!
//! - **Manifest Codec**: Versioned binary manifests with SHA-1 checked zlib bodies,
//!   plus the older JSON manifest format
//! - **Chunk Codec**: Streaming chunk decoding with size and hash verification
//! - **Mirror Failover**: Every mirror is tried per attempt, with exponential backoff
//! - **Cache Reuse**: Verified chunks already on disk are never fetched twice
//! - **Save Sync**: Upload, download and per-file conflict resolution
//!
//! # Example
//!
//! ```no_run
//! use chunksync::{CdnMirror, DownloadConfig, DownloadOrchestrator, DownloadProgress, Manifest};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manifest = Manifest::read_all(&std::fs::read("build.manifest")?)?;
//! let orchestrator = DownloadOrchestrator::new(DownloadConfig::default())?;
//! let mirrors = vec![CdnMirror::new("https://cdn.example.com")];
//!
//! orchestrator
//!     .install(&manifest, &mirrors, Path::new("./game"), Arc::new(DownloadProgress::new()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod assemble;
pub mod chunk;
pub mod cloud;
mod download;
pub mod error;
mod json_manifest;
pub mod manifest;
pub mod orchestrator;
pub mod packager;
pub mod progress;
pub mod rolling_hash;
pub mod save_path;
pub mod sync;
pub mod types;
pub mod verify;
mod wire;

pub use cloud::{RemoteFile, SaveListing, SaveSyncClient};
pub use error::{ChunkSyncError, Result};
pub use manifest::ManifestComparison;
pub use orchestrator::{ChunkJob, DownloadOrchestrator, DownloadReport, InstallReport};
pub use packager::{ChunkPackager, PackagedSave};
pub use progress::{DownloadProgress, ProgressBarSink, ProgressSink};
pub use save_path::{FixedSaveDir, SaveDirResolver, TemplateSaveDirResolver};
pub use sync::{
    CredentialProvider, InFlightSyncs, JsonFileStateStore, MemoryStateStore, StaticCredentials,
    SyncCoordinator, SyncStateStore,
};
pub use types::{
    CdnMirror, ChunkInfo, ChunkPart, Credentials, DownloadConfig, FileManifest, Guid, Manifest,
    ManifestMeta, PreferredAction, SaveGame, SyncAction, SyncConfig, SyncPhase, CHUNK_SIZE,
};
