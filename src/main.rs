use anyhow::{bail, Context, Result};
use chrono::Utc;
use chunksync::{
    CdnMirror, ChunkPackager, Credentials, DownloadConfig, DownloadOrchestrator, FixedSaveDir,
    JsonFileStateStore, Manifest, PreferredAction, ProgressBarSink, ProgressSink, SaveGame,
    StaticCredentials, SyncConfig, SyncCoordinator,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chunksync")]
#[command(about = "Install chunked builds and sync cloud saves", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a summary of a manifest file
    Inspect {
        /// Path to the manifest (binary or JSON)
        manifest: PathBuf,
    },

    /// Download every chunk of a manifest and assemble its files
    Install {
        /// Path to the manifest (binary or JSON)
        #[arg(long)]
        manifest: PathBuf,

        /// CDN base URL, repeat for failover order
        #[arg(long = "mirror", required = true)]
        mirrors: Vec<String>,

        /// Build directory on the CDN (e.g. /Builds/Org/abc/default)
        #[arg(long, default_value = "")]
        cloud_dir: String,

        /// Query string appended to every chunk request
        #[arg(long, default_value = "")]
        auth_query: String,

        /// Mirrors shard ChunksV3 by rolling-hash prefix
        #[arg(long)]
        v3_hash_prefix: bool,

        /// Installation directory
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        download: DownloadArgs,
    },

    /// Split a directory into chunks plus a manifest
    Package {
        /// Directory to package
        dir: PathBuf,

        /// Where to write the chunk tree and manifest
        #[arg(long)]
        out: PathBuf,

        #[arg(long)]
        app_name: String,

        #[arg(long)]
        account_id: String,

        /// Save folder template recorded in the manifest
        #[arg(long, default_value = "")]
        save_folder: String,
    },

    /// Synchronize a save directory with cloud storage
    Sync {
        #[arg(long)]
        app_name: String,

        #[arg(long)]
        game_id: u32,

        /// Local save directory
        #[arg(long)]
        save_dir: PathBuf,

        /// Bearer token for the storage service
        #[arg(long)]
        token: String,

        #[arg(long)]
        account_id: String,

        /// JSON file holding last-sync timestamps
        #[arg(long, default_value = "chunksync-state.json")]
        state_file: PathBuf,

        #[arg(long, value_enum, default_value_t = ActionArg::Auto)]
        action: ActionArg,

        /// Storage service base URL
        #[arg(long)]
        api_url: Option<String>,

        #[command(flatten)]
        download: DownloadArgs,
    },
}

#[derive(Args, Debug)]
struct DownloadArgs {
    /// Chunk cache directory
    #[arg(long, default_value = ".chunk-cache")]
    cache_dir: PathBuf,

    /// Concurrent chunk downloads per batch
    #[arg(long, default_value_t = 6)]
    concurrency: usize,

    /// Attempts per chunk
    #[arg(long, default_value_t = 3)]
    attempts: usize,

    /// Connect timeout (e.g. "30s")
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    connect_timeout: Duration,

    /// Whole-request timeout (e.g. "1m")
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    request_timeout: Duration,

    /// Skip SHA-1 checks of assembled files
    #[arg(long)]
    no_verify: bool,
}

impl DownloadArgs {
    fn config(&self) -> DownloadConfig {
        DownloadConfig {
            cache_dir: self.cache_dir.clone(),
            max_concurrent_downloads: self.concurrency,
            max_attempts: self.attempts,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            verify_files: !self.no_verify,
            ..DownloadConfig::default()
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ActionArg {
    Auto,
    Download,
    Upload,
}

impl From<ActionArg> for PreferredAction {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::Auto => PreferredAction::Auto,
            ActionArg::Download => PreferredAction::Download,
            ActionArg::Upload => PreferredAction::Upload,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("chunksync={}", log_level))
        .init();

    match cli.command {
        Command::Inspect { manifest } => inspect(manifest),
        Command::Install {
            manifest,
            mirrors,
            cloud_dir,
            auth_query,
            v3_hash_prefix,
            output,
            download,
        } => {
            let mirrors = mirrors
                .into_iter()
                .map(|base_url| CdnMirror {
                    base_url,
                    auth_query_params: auth_query.clone(),
                    cloud_dir: cloud_dir.clone(),
                    hash_prefix_v3: v3_hash_prefix,
                })
                .collect();
            install(manifest, mirrors, output, download).await
        }
        Command::Package {
            dir,
            out,
            app_name,
            account_id,
            save_folder,
        } => package(dir, out, app_name, account_id, save_folder).await,
        Command::Sync {
            app_name,
            game_id,
            save_dir,
            token,
            account_id,
            state_file,
            action,
            api_url,
            download,
        } => {
            let game = SaveGame {
                game_id,
                app_name,
                save_folder: save_dir.to_string_lossy().into_owned(),
                install_dir: None,
            };
            let credentials = Credentials {
                access_token: token,
                account_id,
                display_name: None,
            };
            let mut config = SyncConfig {
                download: download.config(),
                ..SyncConfig::default()
            };
            if let Some(url) = api_url {
                config.api_base_url = url;
            }
            sync(game, credentials, save_dir, state_file, action.into(), config).await
        }
    }
}

fn read_manifest(path: &Path) -> Result<Manifest> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    Manifest::read_all(&bytes).with_context(|| format!("Failed to parse manifest {}", path.display()))
}

fn inspect(path: PathBuf) -> Result<()> {
    let manifest = read_manifest(&path)?;
    let meta = &manifest.meta;
    println!("App:            {}", meta.app_name);
    println!("Build version:  {}", meta.build_version);
    println!("Feature level:  {}", meta.feature_level);
    println!("Files:          {}", manifest.file_manifest_list.len());
    println!("Chunks:         {}", manifest.chunk_data_list.len());
    println!("Download size:  {} bytes", manifest.total_download_size());
    println!("Installed size: {} bytes", manifest.total_installed_size());
    for (key, value) in &manifest.custom_fields {
        println!("  {} = {}", key, value);
    }
    if let Err(e) = manifest.validate() {
        warn!("Manifest is inconsistent: {}", e);
    }
    Ok(())
}

async fn install(
    manifest_path: PathBuf,
    mirrors: Vec<CdnMirror>,
    output: PathBuf,
    download: DownloadArgs,
) -> Result<()> {
    info!("🚀 chunksync - Build Installer");
    let manifest = read_manifest(&manifest_path)?;
    info!("Mirrors: {:?}", mirrors.iter().map(|m| &m.base_url).collect::<Vec<_>>());
    info!("Output directory: {:?}", output);

    let orchestrator = DownloadOrchestrator::new(download.config())?;
    let progress = Arc::new(ProgressBarSink::new(manifest.total_download_size()));
    let on_interrupt = Arc::clone(&progress);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current batch");
            on_interrupt.cancel();
        }
    });

    let sink: Arc<dyn ProgressSink> = progress.clone();
    let report = orchestrator
        .install(&manifest, &mirrors, &output, sink)
        .await
        .context("Install failed")?;
    progress.finish("done");

    info!(
        "✅ Installed {} files ({} bytes): {} chunks downloaded, {} reused",
        report.files, report.installed_bytes, report.chunks.downloaded, report.chunks.reused
    );
    Ok(())
}

async fn package(
    dir: PathBuf,
    out: PathBuf,
    app_name: String,
    account_id: String,
    save_folder: String,
) -> Result<()> {
    let packaged = ChunkPackager::new(&dir)
        .package(&app_name, &account_id, &save_folder, Utc::now())
        .with_context(|| format!("Failed to package {}", dir.display()))?;

    for (name, data) in &packaged.files {
        let dest = out.join(name);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, data)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
    }

    info!(
        "✅ Wrote {} chunks and {} to {}",
        packaged.manifest.chunk_data_list.len(),
        packaged.manifest_name,
        out.display()
    );
    Ok(())
}

async fn sync(
    game: SaveGame,
    credentials: Credentials,
    save_dir: PathBuf,
    state_file: PathBuf,
    action: PreferredAction,
    config: SyncConfig,
) -> Result<()> {
    info!("☁️  chunksync - Cloud Save Sync");
    let coordinator = SyncCoordinator::new(
        config,
        Arc::new(StaticCredentials(credentials)),
        Arc::new(FixedSaveDir(save_dir)),
        Arc::new(JsonFileStateStore::new(state_file)),
    )?;

    if !coordinator.sync(&game, action).await {
        bail!("Sync of {} failed, see log for the cause", game.app_name);
    }
    Ok(())
}
