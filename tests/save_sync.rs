mod common;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chunksync::sync::{sync_state_key, SyncKey};
use chunksync::{
    CredentialProvider, Credentials, DownloadConfig, FixedSaveDir, InFlightSyncs, Manifest, MemoryStateStore,
    PreferredAction, SaveGame, StaticCredentials, SyncAction, SyncConfig, SyncCoordinator,
    SyncPhase, SyncStateStore,
};
use common::{read_tree, write_file, TestServer};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const ACCOUNT: &str = "acct42";

fn credentials() -> Credentials {
    Credentials {
        access_token: "token".to_string(),
        account_id: ACCOUNT.to_string(),
        display_name: Some("Player".to_string()),
    }
}

fn game() -> SaveGame {
    SaveGame {
        game_id: 5,
        app_name: "Fern".to_string(),
        save_folder: "{appdata}/Fern/Saved".to_string(),
        install_dir: None,
    }
}

fn coordinator(
    server: &TestServer,
    save_dir: &Path,
    cache_dir: &Path,
    state: Arc<dyn SyncStateStore>,
) -> SyncCoordinator {
    let config = SyncConfig {
        api_base_url: server.url(""),
        download: DownloadConfig {
            cache_dir: cache_dir.to_path_buf(),
            max_attempts: 2,
            retry_base_delay_ms: 10,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            ..DownloadConfig::default()
        },
    };
    SyncCoordinator::new(
        config,
        Arc::new(StaticCredentials(credentials())),
        Arc::new(FixedSaveDir(save_dir.to_path_buf())),
        state,
    )
    .unwrap()
}

fn set_mtime(path: &Path, time: DateTime<Utc>) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::from(time)).unwrap();
}

fn stored_manifests(server: &TestServer) -> Vec<Manifest> {
    server
        .blob_keys()
        .iter()
        .filter(|k| k.ends_with(".manifest"))
        .map(|k| Manifest::read_all(&server.blob(k).unwrap()).unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_then_download_reproduces_directory() {
    let server = TestServer::start().await;
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("source");
    let target = work.path().join("target");
    write_file(&source, "profile.dat", b"profile");
    write_file(&source, "slot1/save.sav", &vec![0x5a; 1_200_000]);
    write_file(&source, "slot2/save.sav", b"second slot");

    let uploader_state = Arc::new(MemoryStateStore::new());
    let uploader = coordinator(&server, &source, &work.path().join("cache-a"), uploader_state.clone());
    assert!(uploader.sync(&game(), PreferredAction::Upload).await);
    assert!(uploader_state.get(&sync_state_key(5)).unwrap().is_some());

    let keys = server.blob_keys();
    assert!(keys.iter().all(|k| k.starts_with("acct42/Fern/")));
    assert_eq!(keys.iter().filter(|k| k.ends_with(".manifest")).count(), 1);
    let manifest = &stored_manifests(&server)[0];
    assert_eq!(manifest.meta.app_name, format!("Fern{}", ACCOUNT));
    assert_eq!(
        manifest.custom_fields.get("CloudSaveFolder").map(String::as_str),
        Some("{appdata}/Fern/Saved")
    );

    let downloader_state = Arc::new(MemoryStateStore::new());
    let downloader = coordinator(&server, &target, &work.path().join("cache-b"), downloader_state.clone());
    assert!(downloader.sync(&game(), PreferredAction::Auto).await);
    assert_eq!(read_tree(&target), read_tree(&source));
    assert_eq!(
        downloader_state.get(&sync_state_key(5)).unwrap().as_deref(),
        Some("2024-01-01T00:00:00.000Z")
    );
    assert!(!work.path().join("cache-b/save-acct42-5").exists());

    // downloaded files carry the cloud time, so an automatic sync does not upload them back
    let cloud_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let modified = std::fs::metadata(target.join("slot1/save.sav")).unwrap().modified().unwrap();
    assert_eq!(DateTime::<Utc>::from(modified), cloud_time);
    assert_eq!(
        downloader.detect_action(&game(), &credentials(), &target).await.unwrap(),
        SyncAction::Download
    );

    // already at the cloud's timestamp: nothing is fetched or uploaded
    let fetched = server.count_requests("/blob/");
    let link_requests = |server: &TestServer| {
        server.requests().iter().filter(|r| r.starts_with("POST")).count()
    };
    assert_eq!(link_requests(&server), 1);
    assert!(downloader.sync(&game(), PreferredAction::Auto).await);
    assert!(downloader.sync(&game(), PreferredAction::Download).await);
    assert_eq!(server.count_requests("/blob/"), fetched);
    assert_eq!(link_requests(&server), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_newer_cloud_copy_without_history_is_downloaded() {
    let server = TestServer::start().await;
    let work = tempfile::tempdir().unwrap();
    let saves = work.path().join("saves");
    write_file(&saves, "save.dat", b"local");
    set_mtime(&saves.join("save.dat"), Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());
    server.put_blob(
        "acct42/Fern/manifests/2024.06.01-12.00.00.manifest",
        b"unused".to_vec(),
        "2024-06-01T12:00:00.000Z",
    );

    let sync = coordinator(&server, &saves, &work.path().join("cache"), Arc::new(MemoryStateStore::new()));
    let action = sync.detect_action(&game(), &credentials(), &saves).await.unwrap();
    assert_eq!(action, SyncAction::Download);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_conflict_resolves_per_file() {
    let server = TestServer::start().await;
    server.set_upload_time("2030-01-01T00:00:00.000Z");
    let work = tempfile::tempdir().unwrap();

    let remote_side = work.path().join("remote");
    write_file(&remote_side, "cloud_wins.sav", b"cloud version");
    write_file(&remote_side, "local_wins.sav", b"cloud copy");
    write_file(&remote_side, "remote_only.sav", b"only in cloud");
    let seeder = coordinator(&server, &remote_side, &work.path().join("cache-a"), Arc::new(MemoryStateStore::new()));
    assert!(seeder.sync(&game(), PreferredAction::Upload).await);

    let local_side = work.path().join("local");
    write_file(&local_side, "cloud_wins.sav", b"stale local");
    write_file(&local_side, "local_wins.sav", b"fresh local");
    write_file(&local_side, "local_only.sav", b"only here");
    set_mtime(&local_side.join("cloud_wins.sav"), Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    set_mtime(&local_side.join("local_wins.sav"), Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap());
    set_mtime(&local_side.join("local_only.sav"), Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());

    let state = Arc::new(MemoryStateStore::new());
    state.set(&sync_state_key(5), "2020-01-01T00:00:00.000Z").unwrap();
    let sync = coordinator(&server, &local_side, &work.path().join("cache-b"), state.clone());
    assert_eq!(
        sync.detect_action(&game(), &credentials(), &local_side).await.unwrap(),
        SyncAction::Conflict
    );

    assert!(sync.sync(&game(), PreferredAction::Auto).await);

    let tree = read_tree(&local_side);
    assert_eq!(tree["cloud_wins.sav"], b"cloud version");
    assert_eq!(tree["local_wins.sav"], b"fresh local");
    assert_eq!(tree["remote_only.sav"], b"only in cloud");
    assert_eq!(tree["local_only.sav"], b"only here");

    // the follow-up upload carries the whole merged directory
    let merged = stored_manifests(&server)
        .into_iter()
        .find(|m| m.file_by_path("local_only.sav").is_some())
        .expect("manifest with local changes");
    assert_eq!(merged.file_manifest_list.len(), 4);

    let last_sync = state.get(&sync_state_key(5)).unwrap().unwrap();
    assert!(last_sync.as_str() > "2020-01-01T00:00:00.000Z");
    assert_eq!(sync.phase(ACCOUNT, 5), SyncPhase::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_concurrent_sync_is_rejected() {
    let server = TestServer::start().await;
    let work = tempfile::tempdir().unwrap();
    let saves = work.path().join("saves");
    std::fs::create_dir_all(&saves).unwrap();
    let sync = coordinator(&server, &saves, &work.path().join("cache"), Arc::new(MemoryStateStore::new()));

    let (game_a, game_b) = (game(), game());
    let (first, second) = tokio::join!(
        sync.sync(&game_a, PreferredAction::Auto),
        sync.sync(&game_b, PreferredAction::Auto)
    );
    assert!(first);
    assert!(!second);
    assert!(sync.in_flight().is_empty());

    let in_flight = Arc::new(InFlightSyncs::new());
    let _held = in_flight
        .try_begin(SyncKey {
            account_id: ACCOUNT.to_string(),
            game_id: 5,
        })
        .unwrap();
    let requests_before = server.requests().len();
    let blocked = sync.with_in_flight(in_flight);
    assert!(!blocked.sync(&game(), PreferredAction::Upload).await);
    assert_eq!(server.requests().len(), requests_before);
}

/// Hands out credentials slowly and counts how often it was asked.
struct SlowCredentials {
    calls: AtomicUsize,
}

#[async_trait]
impl CredentialProvider for SlowCredentials {
    fn account_id(&self) -> String {
        ACCOUNT.to_string()
    }

    async fn credentials(&self) -> chunksync::Result<Credentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(credentials())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_sync_is_rejected_before_fetching_credentials() {
    let server = TestServer::start().await;
    let work = tempfile::tempdir().unwrap();
    let saves = work.path().join("saves");
    std::fs::create_dir_all(&saves).unwrap();

    let provider = Arc::new(SlowCredentials {
        calls: AtomicUsize::new(0),
    });
    let config = SyncConfig {
        api_base_url: server.url(""),
        download: DownloadConfig {
            cache_dir: work.path().join("cache"),
            ..DownloadConfig::default()
        },
    };
    let in_flight = Arc::new(InFlightSyncs::new());
    let _held = in_flight
        .try_begin(SyncKey {
            account_id: ACCOUNT.to_string(),
            game_id: 5,
        })
        .unwrap();
    let sync = SyncCoordinator::new(
        config,
        provider.clone(),
        Arc::new(FixedSaveDir(saves)),
        Arc::new(MemoryStateStore::new()),
    )
    .unwrap()
    .with_in_flight(in_flight);

    let started = std::time::Instant::now();
    assert!(!sync.sync(&game(), PreferredAction::Auto).await);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_chunk_upload_never_publishes_manifest() {
    let server = TestServer::start().await;
    server.reject_puts_containing("ChunksV4");
    let work = tempfile::tempdir().unwrap();
    let saves = work.path().join("saves");
    write_file(&saves, "save.sav", b"payload");

    let state = Arc::new(MemoryStateStore::new());
    let sync = coordinator(&server, &saves, &work.path().join("cache"), state.clone());
    assert!(!sync.sync(&game(), PreferredAction::Upload).await);

    assert!(server.blob_keys().iter().all(|k| !k.ends_with(".manifest")));
    assert!(state.get(&sync_state_key(5)).unwrap().is_none());
}
