//! Cloud-save synchronization: deciding a direction and running the download, upload
//! or per-file conflict flow for one (account, game).

use crate::assemble::assemble_files;
use crate::cloud::{RemoteFile, SaveListing, SaveSyncClient};
use crate::error::{ChunkSyncError, Result};
use crate::orchestrator::{build_client, ChunkJob, DownloadOrchestrator};
use crate::packager::{ChunkPackager, PackagedSave};
use crate::progress::{DownloadProgress, ProgressSink};
use crate::save_path::SaveDirResolver;
use crate::types::{
    Credentials, FileManifest, Manifest, PreferredAction, SaveGame, SyncAction, SyncConfig,
    SyncPhase,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Key under which the last successful sync time of a game is stored.
pub fn sync_state_key(game_id: u32) -> String {
    format!("sync_timestamp_{}", game_id)
}

/// Persistent string key-value storage for sync bookkeeping.
pub trait SyncStateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Process-local store, mostly useful in tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Store backed by a single JSON object on disk.
///
/// Writes go to a sibling `.tmp` file that is then renamed over the original.
#[derive(Debug)]
pub struct JsonFileStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl SyncStateStore for JsonFileStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = lock(&self.write_lock);
        let mut values = self.load()?;
        values.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&values)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Supplies bearer credentials, refreshing them if needed.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Account the credentials belong to. Must not touch the network.
    fn account_id(&self) -> String;

    async fn credentials(&self) -> Result<Credentials>;
}

/// Credentials fixed at construction time.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    fn account_id(&self) -> String {
        self.0.account_id.clone()
    }

    async fn credentials(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// Identifies one sync target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncKey {
    pub account_id: String,
    pub game_id: u32,
}

/// Set of syncs currently running, with the phase each one is in.
///
/// Share one instance (behind an `Arc`) between coordinators that must exclude each
/// other.
#[derive(Debug, Default)]
pub struct InFlightSyncs {
    active: Mutex<HashMap<SyncKey, SyncPhase>>,
}

impl InFlightSyncs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` unless it is already running. The returned guard releases the
    /// key when dropped.
    pub fn try_begin(self: &Arc<Self>, key: SyncKey) -> Option<SyncGuard> {
        let mut active = lock(&self.active);
        if active.contains_key(&key) {
            return None;
        }
        active.insert(key.clone(), SyncPhase::Detecting);
        Some(SyncGuard {
            owner: Arc::clone(self),
            key,
        })
    }

    /// Current phase of `key`, `Idle` when nothing is running.
    pub fn phase(&self, key: &SyncKey) -> SyncPhase {
        lock(&self.active)
            .get(key)
            .copied()
            .unwrap_or(SyncPhase::Idle)
    }

    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Membership of one key in an [`InFlightSyncs`] set.
#[derive(Debug)]
pub struct SyncGuard {
    owner: Arc<InFlightSyncs>,
    key: SyncKey,
}

impl SyncGuard {
    pub fn key(&self) -> &SyncKey {
        &self.key
    }

    pub fn set_phase(&self, phase: SyncPhase) {
        debug!("Sync {:?} -> {:?}", self.key, phase);
        if let Some(current) = lock(&self.owner.active).get_mut(&self.key) {
            *current = phase;
        }
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        lock(&self.owner.active).remove(&self.key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// What the cloud side looks like when choosing a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// The listing request failed.
    Unavailable,
    /// Nothing stored.
    Empty,
    /// Objects stored but no manifest among them.
    NoManifest,
    Manifest { last_modified: DateTime<Utc> },
}

/// Chooses the sync direction.
///
/// `local_newest` is the newest local modification time, `None` when the save
/// directory holds no files. An absent `last_sync` orders before every timestamp.
pub fn decide_action(
    local_newest: Option<DateTime<Utc>>,
    remote: RemoteState,
    last_sync: Option<DateTime<Utc>>,
) -> SyncAction {
    let has_local = local_newest.is_some();
    let remote_time = match remote {
        RemoteState::Unavailable | RemoteState::Empty => {
            return if has_local {
                SyncAction::Upload
            } else {
                SyncAction::None
            };
        }
        RemoteState::NoManifest if has_local => return SyncAction::Upload,
        RemoteState::NoManifest => return SyncAction::Download,
        RemoteState::Manifest { last_modified } => last_modified,
    };
    let Some(local_time) = local_newest else {
        return SyncAction::Download;
    };

    if let Some(last) = last_sync {
        let remote_newer = remote_time > last;
        let local_newer = local_time > last;
        match (remote_newer, local_newer) {
            (true, false) => return SyncAction::Download,
            (false, true) => return SyncAction::Upload,
            (true, true) => return SyncAction::Conflict,
            (false, false) => {}
        }
    }

    if last_sync.map_or(true, |last| remote_time >= last) {
        SyncAction::Download
    } else {
        SyncAction::None
    }
}

/// Per-file outcome of a conflict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictPlan {
    pub upload: Vec<String>,
    pub download: Vec<String>,
    /// Present on both sides with equal timestamps.
    pub unchanged: Vec<String>,
}

/// Compares every path on either side; every remote path carries `remote_time`.
pub fn plan_conflict<'a, I>(
    local: &BTreeMap<String, DateTime<Utc>>,
    remote_paths: I,
    remote_time: DateTime<Utc>,
) -> ConflictPlan
where
    I: IntoIterator<Item = &'a str>,
{
    let remote: BTreeSet<&str> = remote_paths.into_iter().collect();
    let mut plan = ConflictPlan::default();

    for (path, local_time) in local {
        if !remote.contains(path.as_str()) {
            debug!("Only local: {}", path);
            plan.upload.push(path.clone());
        } else if *local_time > remote_time {
            debug!("Local is newer: {}", path);
            plan.upload.push(path.clone());
        } else if remote_time > *local_time {
            debug!("Cloud is newer: {}", path);
            plan.download.push(path.clone());
        } else {
            plan.unchanged.push(path.clone());
        }
    }
    for path in remote {
        if !local.contains_key(path) {
            debug!("Only in cloud: {}", path);
            plan.download.push(path.to_string());
        }
    }
    plan
}

/// Every file under `dir` (forward-slash relative path) with its modification time.
/// A missing directory yields an empty map.
pub async fn scan_local(dir: &Path) -> Result<BTreeMap<String, DateTime<Utc>>> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<BTreeMap<String, DateTime<Utc>>> {
        let mut files = BTreeMap::new();
        if !dir.is_dir() {
            return Ok(files);
        }
        for entry in WalkDir::new(&dir).follow_links(false) {
            let entry = entry.map_err(|e| ChunkSyncError::IoError(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .map_err(|e| ChunkSyncError::IoError(e.into()))?
                .modified()?;
            let relative = crate::packager::relative_path(&dir, entry.path())?;
            files.insert(relative, DateTime::<Utc>::from(modified));
        }
        Ok(files)
    })
    .await
    .map_err(|e| ChunkSyncError::IoError(std::io::Error::other(format!("Task join error: {}", e))))?
}

/// Listing timestamp of `file`; unparseable values order as the Unix epoch.
fn remote_time(file: &RemoteFile) -> DateTime<Utc> {
    file.modified_at().unwrap_or_else(|| {
        warn!("Unparseable cloud timestamp {:?}", file.last_modified);
        DateTime::<Utc>::from(std::time::UNIX_EPOCH)
    })
}

/// Cache subdirectory for one account's copy of one game's saves.
fn save_cache_name(account_id: &str, game_id: u32) -> String {
    let account: String = account_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("save-{}-{}", account, game_id)
}

/// Sets the modification time of every written file to `modified`, so the next
/// automatic sync sees the local copy as no newer than the cloud one. Failures are
/// logged and skipped.
async fn stamp_mtimes(
    save_dir: &Path,
    files: &[FileManifest],
    modified: DateTime<Utc>,
) -> Result<()> {
    let paths = files
        .iter()
        .map(|f| crate::assemble::resolve_destination(save_dir, &f.filename))
        .collect::<Result<Vec<_>>>()?;
    let time = std::time::SystemTime::from(modified);

    tokio::task::spawn_blocking(move || {
        for path in paths {
            let stamped = std::fs::File::options()
                .write(true)
                .open(&path)
                .or_else(|_| std::fs::File::open(&path))
                .and_then(|file| file.set_modified(time));
            if let Err(e) = stamped {
                warn!("Failed to set modification time of {}: {}", path.display(), e);
            }
        }
    })
    .await
    .map_err(|e| ChunkSyncError::IoError(std::io::Error::other(format!("Task join error: {}", e))))
}

/// The cloud manifest a download works from, with the listing it came from.
struct RemoteManifest<'a> {
    listing: &'a SaveListing,
    key: &'a str,
    file: &'a RemoteFile,
    manifest: &'a Manifest,
}

/// Drives save synchronization for any number of games.
pub struct SyncCoordinator {
    cloud: SaveSyncClient,
    downloader: DownloadOrchestrator,
    credentials: Arc<dyn CredentialProvider>,
    resolver: Arc<dyn SaveDirResolver>,
    state: Arc<dyn SyncStateStore>,
    in_flight: Arc<InFlightSyncs>,
    progress: Arc<dyn ProgressSink>,
}

impl SyncCoordinator {
    /// Builds a coordinator with one HTTP client shared by the storage API and the
    /// chunk downloader.
    pub fn new(
        config: SyncConfig,
        credentials: Arc<dyn CredentialProvider>,
        resolver: Arc<dyn SaveDirResolver>,
        state: Arc<dyn SyncStateStore>,
    ) -> Result<Self> {
        let client = build_client(&config.download)?;
        Ok(Self {
            cloud: SaveSyncClient::new(client.clone(), config.api_base_url),
            downloader: DownloadOrchestrator::with_client(client, config.download),
            credentials,
            resolver,
            state,
            in_flight: Arc::new(InFlightSyncs::new()),
            progress: Arc::new(DownloadProgress::new()),
        })
    }

    /// Shares an in-flight set with other coordinators.
    pub fn with_in_flight(mut self, in_flight: Arc<InFlightSyncs>) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn in_flight(&self) -> &Arc<InFlightSyncs> {
        &self.in_flight
    }

    pub fn phase(&self, account_id: &str, game_id: u32) -> SyncPhase {
        self.in_flight.phase(&SyncKey {
            account_id: account_id.to_string(),
            game_id,
        })
    }

    /// Synchronizes one game's saves.
    ///
    /// Returns `false` when another sync for the same account and game is running, or
    /// when any step fails; the cause is logged. A duplicate is rejected before any
    /// credentials are fetched.
    pub async fn sync(&self, game: &SaveGame, preferred: PreferredAction) -> bool {
        let key = SyncKey {
            account_id: self.credentials.account_id(),
            game_id: game.game_id,
        };
        let Some(guard) = self.in_flight.try_begin(key) else {
            warn!(
                "Sync already in progress for {} ({}), skipping duplicate request",
                game.app_name, game.game_id
            );
            return false;
        };
        let credentials = match self.credentials.credentials().await {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("❌ No credentials for cloud saves: {}", e);
                return false;
            }
        };
        if credentials.account_id != guard.key().account_id {
            warn!(
                "Credentials are for account {}, sync was claimed for {}",
                credentials.account_id,
                guard.key().account_id
            );
        }

        info!(
            "☁️  Starting sync for {} ({}), action: {:?}",
            game.app_name, game.game_id, preferred
        );
        match self.run(game, preferred, &credentials, &guard).await {
            Ok(action) => {
                info!("✅ Sync for {} completed ({:?})", game.app_name, action);
                self.progress.set_status("Sync complete");
                true
            }
            Err(e) => {
                error!("❌ Sync for {} failed: {}", game.app_name, e);
                self.progress.set_status("Sync failed");
                false
            }
        }
    }

    async fn run(
        &self,
        game: &SaveGame,
        preferred: PreferredAction,
        credentials: &Credentials,
        guard: &SyncGuard,
    ) -> Result<SyncAction> {
        let save_dir = self.resolver.resolve(game, credentials)?;
        let action = match preferred {
            PreferredAction::Download => SyncAction::Download,
            PreferredAction::Upload => SyncAction::Upload,
            PreferredAction::Auto => {
                self.progress.set_status("Checking saves");
                self.detect_action(game, credentials, &save_dir).await?
            }
        };
        info!("🔍 Sync action for {}: {:?}", game.app_name, action);

        match action {
            SyncAction::Download => {
                guard.set_phase(SyncPhase::Downloading);
                self.download_saves(game, credentials, &save_dir).await?;
            }
            SyncAction::Upload => {
                guard.set_phase(SyncPhase::Uploading);
                self.upload_saves(game, credentials, &save_dir).await?;
            }
            SyncAction::Conflict => {
                guard.set_phase(SyncPhase::ResolvingConflict);
                self.resolve_conflict(game, credentials, &save_dir).await?;
            }
            SyncAction::None => info!("No sync needed for {}", game.app_name),
        }
        Ok(action)
    }

    /// Compares local files, the cloud listing and the stored last-sync time.
    pub async fn detect_action(
        &self,
        game: &SaveGame,
        credentials: &Credentials,
        save_dir: &Path,
    ) -> Result<SyncAction> {
        let local = scan_local(save_dir).await?;
        let local_newest = local.values().max().copied();

        let remote = match self.cloud.list(credentials, &game.app_name).await {
            Ok(listing) if listing.is_empty() => RemoteState::Empty,
            Ok(listing) => match listing.latest_manifest() {
                Some((_, file)) => RemoteState::Manifest {
                    last_modified: remote_time(file),
                },
                None => RemoteState::NoManifest,
            },
            Err(e) => {
                warn!(
                    "Failed to list cloud saves for {}, will upload if local files exist: {}",
                    game.app_name, e
                );
                RemoteState::Unavailable
            }
        };
        let last_sync = self.last_sync(game.game_id)?;
        debug!(
            "{} local files (newest {:?}), remote {:?}, last sync {:?}",
            local.len(),
            local_newest,
            remote,
            last_sync
        );
        Ok(decide_action(local_newest, remote, last_sync))
    }

    fn last_sync(&self, game_id: u32) -> Result<Option<DateTime<Utc>>> {
        let Some(value) = self.state.get(&sync_state_key(game_id))? else {
            return Ok(None);
        };
        match crate::cloud::parse_timestamp(&value) {
            Some(time) => Ok(Some(time)),
            None => {
                warn!("Ignoring unparseable last sync time {:?}", value);
                Ok(None)
            }
        }
    }

    fn mark_synced_now(&self, game_id: u32) -> Result<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.state.set(&sync_state_key(game_id), &now)
    }

    /// Replaces local saves with the latest cloud manifest's files.
    async fn download_saves(
        &self,
        game: &SaveGame,
        credentials: &Credentials,
        save_dir: &Path,
    ) -> Result<()> {
        let listing = self.cloud.list(credentials, &game.app_name).await?;
        if listing.is_empty() {
            return Err(ChunkSyncError::MissingData(format!(
                "no cloud saves for {}",
                game.app_name
            )));
        }
        let (manifest_key, manifest_file) = listing.latest_manifest().ok_or_else(|| {
            ChunkSyncError::MissingData(format!("no manifest in cloud saves for {}", game.app_name))
        })?;
        info!(
            "Found manifest {} ({})",
            manifest_key, manifest_file.last_modified
        );

        if let Some(last) = self.last_sync(game.game_id)? {
            if last >= remote_time(manifest_file) {
                info!("Local saves for {} are up to date", game.app_name);
                return Ok(());
            }
        }

        let manifest = self.fetch_manifest(manifest_key, manifest_file).await?;
        let remote = RemoteManifest {
            listing: &listing,
            key: manifest_key,
            file: manifest_file,
            manifest: &manifest,
        };
        let files = self
            .fetch_and_assemble(
                credentials,
                game.game_id,
                &remote,
                &manifest.file_manifest_list,
                save_dir,
            )
            .await?;
        info!("📥 Downloaded {} save files for {}", files, game.app_name);

        self.state
            .set(&sync_state_key(game.game_id), &manifest_file.last_modified)
    }

    async fn fetch_manifest(&self, key: &str, file: &RemoteFile) -> Result<Manifest> {
        let link = file.read_link.as_deref().ok_or_else(|| {
            ChunkSyncError::MissingData(format!("manifest {} has no read link", key))
        })?;
        let bytes = self.cloud.download(link).await?;
        if bytes.is_empty() {
            return Err(ChunkSyncError::Format(format!("manifest {} is empty", key)));
        }
        let manifest = Manifest::read_all(&bytes)?;
        manifest.validate()?;
        debug!(
            "Manifest {}: {} files, {} chunks",
            key,
            manifest.file_manifest_list.len(),
            manifest.chunk_data_list.len()
        );
        Ok(manifest)
    }

    /// Fetches the chunks `files` need through the listing's read links and writes the
    /// files under `save_dir`, stamped with the manifest's upload time. Returns the
    /// number of files written.
    async fn fetch_and_assemble(
        &self,
        credentials: &Credentials,
        game_id: u32,
        remote: &RemoteManifest<'_>,
        files: &[FileManifest],
        save_dir: &Path,
    ) -> Result<usize> {
        let chunk_dir = remote.manifest.chunk_dir();
        let jobs = remote
            .manifest
            .chunks_for_files(files.iter().map(|f| f.filename.as_str()))
            .into_iter()
            .map(|info| -> Result<ChunkJob> {
                let link = remote
                    .listing
                    .chunk_read_link(remote.key, &info.chunk_path(chunk_dir))?;
                Ok(ChunkJob {
                    urls: vec![link.to_string()],
                    info,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let config = self.downloader.config();
        let cache_dir = config
            .cache_dir
            .join(save_cache_name(&credentials.account_id, game_id));
        self.progress.set_status("Downloading saves");
        let result = match self
            .downloader
            .download_chunks(jobs, &cache_dir, Arc::clone(&self.progress))
            .await
        {
            Ok(_) => {
                assemble_files(
                    files,
                    &cache_dir,
                    save_dir,
                    config.verify_files,
                    self.progress.as_ref(),
                )
                .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&cache_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove chunk cache {}: {}", cache_dir.display(), e);
            }
        }
        result?;

        stamp_mtimes(save_dir, files, remote_time(remote.file)).await?;
        Ok(files.len())
    }

    /// Packages the whole save directory and uploads it.
    async fn upload_saves(
        &self,
        game: &SaveGame,
        credentials: &Credentials,
        save_dir: &Path,
    ) -> Result<()> {
        self.package_and_upload(game, credentials, save_dir).await?;
        self.mark_synced_now(game.game_id)
    }

    async fn package_and_upload(
        &self,
        game: &SaveGame,
        credentials: &Credentials,
        save_dir: &Path,
    ) -> Result<()> {
        self.progress.set_status("Packaging saves");
        let root = save_dir.to_path_buf();
        let app_name = game.app_name.clone();
        let account_id = credentials.account_id.clone();
        let save_folder = game.save_folder.clone();
        let now = Utc::now();
        let packaged = tokio::task::spawn_blocking(move || -> Result<PackagedSave> {
            ChunkPackager::new(root).package(&app_name, &account_id, &save_folder, now)
        })
        .await
        .map_err(|e| {
            ChunkSyncError::IoError(std::io::Error::other(format!("Task join error: {}", e)))
        })??;

        self.upload_packaged(credentials, &game.app_name, packaged)
            .await?;
        Ok(())
    }

    /// Uploads every chunk of `packaged`, then its manifest. Nothing is uploaded
    /// unless every name was granted a write link, and the manifest is only written
    /// after all chunks succeeded.
    pub async fn upload_packaged(
        &self,
        credentials: &Credentials,
        app_name: &str,
        packaged: PackagedSave,
    ) -> Result<usize> {
        let names: Vec<String> = packaged.files.keys().cloned().collect();
        let links = self
            .cloud
            .request_write_links(credentials, app_name, &names)
            .await?;
        let link_for = |name: &str| -> Result<String> {
            links.get(name).cloned().ok_or_else(|| {
                ChunkSyncError::Network(format!("no write link granted for {}", name))
            })
        };

        let PackagedSave {
            mut files,
            manifest_name,
            ..
        } = packaged;
        let manifest_link = link_for(&manifest_name)?;
        let manifest_bytes = files.remove(&manifest_name).ok_or_else(|| {
            ChunkSyncError::MissingData(format!("packaged save lacks {}", manifest_name))
        })?;
        let uploads = files
            .into_iter()
            .map(|(name, data)| -> Result<(String, String, Vec<u8>)> {
                Ok((link_for(&name)?, name, data))
            })
            .collect::<Result<Vec<_>>>()?;

        let total = uploads.len();
        let batch_size = self.downloader.config().max_concurrent_downloads.max(1);
        self.progress.set_status("Uploading saves");
        info!("📤 Uploading {} chunks for {}", total, app_name);

        let mut queue = uploads.into_iter();
        let mut uploaded = 0usize;
        loop {
            let batch: Vec<_> = queue.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            if !self.progress.is_active() {
                warn!("Upload cancelled after {}/{} chunks", uploaded, total);
                return Err(ChunkSyncError::Cancelled);
            }

            let tasks: Vec<_> = batch
                .into_iter()
                .map(|(link, name, data)| {
                    let cloud = self.cloud.clone();
                    let progress = Arc::clone(&self.progress);
                    tokio::spawn(async move {
                        let size = data.len() as u64;
                        match cloud.upload(&link, data).await {
                            Ok(()) => {
                                debug!("Uploaded chunk {} ({} bytes)", name, size);
                                progress.add_bytes(size);
                                Ok(())
                            }
                            Err(e) => {
                                error!("Failed to upload chunk {}: {}", name, e);
                                Err(e)
                            }
                        }
                    })
                })
                .collect();

            let mut first_error = None;
            for task in tasks {
                match task.await {
                    Ok(Ok(())) => uploaded += 1,
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(e) => {
                        first_error.get_or_insert(ChunkSyncError::IoError(
                            std::io::Error::other(format!("Task join error: {}", e)),
                        ));
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let manifest_size = manifest_bytes.len();
        self.cloud.upload(&manifest_link, manifest_bytes).await?;
        info!(
            "✅ Uploaded {} chunks and manifest {} ({} bytes)",
            uploaded, manifest_name, manifest_size
        );
        Ok(uploaded)
    }

    /// Resolves a two-sided change file by file, then uploads the full directory if
    /// anything local won.
    async fn resolve_conflict(
        &self,
        game: &SaveGame,
        credentials: &Credentials,
        save_dir: &Path,
    ) -> Result<()> {
        let local = scan_local(save_dir).await?;
        info!("Found {} local files", local.len());

        let listing = self.cloud.list(credentials, &game.app_name).await?;
        let Some((manifest_key, manifest_file)) = listing.latest_manifest() else {
            warn!("No manifest in cloud, uploading all local files");
            return self.upload_saves(game, credentials, save_dir).await;
        };
        let manifest = match self.fetch_manifest(manifest_key, manifest_file).await {
            Ok(manifest) if manifest.file_manifest_list.is_empty() => {
                warn!("Cloud manifest {} is empty, uploading all local files", manifest_key);
                return self.upload_saves(game, credentials, save_dir).await;
            }
            Ok(manifest) => manifest,
            Err(
                e @ (ChunkSyncError::Format(_)
                | ChunkSyncError::Integrity(_)
                | ChunkSyncError::MissingData(_)),
            ) => {
                warn!("Unusable cloud manifest {} ({}), uploading local files", manifest_key, e);
                return self.upload_saves(game, credentials, save_dir).await;
            }
            Err(e) => return Err(e),
        };

        let plan = plan_conflict(
            &local,
            manifest
                .file_manifest_list
                .iter()
                .map(|f| f.filename.as_str()),
            remote_time(manifest_file),
        );
        info!(
            "Conflict plan: {} to download, {} to upload, {} unchanged",
            plan.download.len(),
            plan.upload.len(),
            plan.unchanged.len()
        );

        if !plan.download.is_empty() {
            let wanted: BTreeSet<&str> = plan.download.iter().map(String::as_str).collect();
            let files: Vec<FileManifest> = manifest
                .file_manifest_list
                .iter()
                .filter(|f| wanted.contains(f.filename.as_str()))
                .cloned()
                .collect();
            let remote = RemoteManifest {
                listing: &listing,
                key: manifest_key,
                file: manifest_file,
                manifest: &manifest,
            };
            self.fetch_and_assemble(credentials, game.game_id, &remote, &files, save_dir)
                .await?;
        }
        if !plan.upload.is_empty() {
            self.package_and_upload(game, credentials, save_dir).await?;
        }

        self.mark_synced_now(game.game_id)
    }
}
