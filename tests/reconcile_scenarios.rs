use playlist_reconcile_engine::analyzer::Analyzer;
use playlist_reconcile_engine::config::Config;
use playlist_reconcile_engine::executor::Executor;
use playlist_reconcile_engine::models::{CorePayload, Service, WorkAction, WorkPayload};
use playlist_reconcile_engine::quota::QuotaLedger;
use playlist_reconcile_engine::store::{SqliteStore, Store};
use playlist_reconcile_engine::vault::Vault;
use rusqlite::Connection;
use serde_json::json;
use std::sync::Arc;

fn valid_token() -> String {
    json!({
        "access_token": "still-good",
        "token_type": "Bearer",
        "expires_at": chrono::Utc::now().timestamp() + 3600,
        "refresh_token": "refresh-token",
        "scope": "playlist-modify-private"
    })
    .to_string()
}

async fn new_store_with_mapping(sync_tracks: bool) -> (tempfile::TempDir, Arc<dyn Store>, i64) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("reconcile.db");
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db_path).unwrap());
    store.save_credential("spotify", &valid_token(), None, None).await.unwrap();
    store.save_credential("youtube", &valid_token(), None, None).await.unwrap();
    let mapping_id = store
        .insert_mapping("splaylist", "yplaylist", None, None, false, sync_tracks, 60)
        .await
        .unwrap();
    (dir, store, mapping_id)
}

fn force_item_due_now(db_path: &std::path::Path, item_id: i64) {
    let conn = Connection::open(db_path).unwrap();
    conn.execute(
        "UPDATE sync_items SET next_attempt_at = ?1 WHERE id = ?2",
        rusqlite::params![chrono::Utc::now().to_rfc3339(), item_id],
    )
    .unwrap();
}

/// Scenario A: a track missing on one side is discovered by the Analyzer and
/// pushed across by the Executor, in both directions, in a single pass.
#[tokio::test]
async fn basic_bidirectional_add_reaches_both_destinations() {
    let (dir, store, mapping_id) = new_store_with_mapping(true).await;
    let db_path = dir.path().join("reconcile.db");

    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    std::env::set_var("SPOTIFY_AUTH_BASE", &base);
    std::env::set_var("SPOTIFY_API_BASE", &base);
    std::env::set_var("YOUTUBE_AUTH_BASE", &base);
    std::env::set_var("YOUTUBE_API_BASE", &base);

    let _m_tracks_s = server
        .mock("GET", "/playlists/splaylist/tracks?fields=items(track(id,name)),next&limit=100")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "items": [{ "track": { "id": "s1", "name": "Song One" } }], "next": null }).to_string())
        .create_async()
        .await;
    let _m_tracks_y = server
        .mock("GET", "/playlistItems?part=snippet,contentDetails&maxResults=50&playlistId=yplaylist")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({ "items": [{ "contentDetails": { "videoId": "y1" }, "snippet": { "title": "Song Two" } }] })
                .to_string(),
        )
        .create_async()
        .await;

    let vault = Arc::new(Vault::new(store.clone()));
    let cfg = Config::default();
    let analyzer = Arc::new(Analyzer::new(store.clone(), vault.clone(), &cfg));

    // two concurrent ticks must not double-enqueue: the in-flight guard lets
    // only one pass actually run; the other observes it and returns at once.
    let a = analyzer.clone();
    let b = analyzer.clone();
    tokio::join!(a.tick(), b.tick());

    let items = store.active_work_items(mapping_id).await.unwrap();
    assert_eq!(items.len(), 2, "exactly one add_track item per direction");
    let to_s = items.iter().find(|i| i.destination_service == Service::S).unwrap();
    let to_y = items.iter().find(|i| i.destination_service == Service::Y).unwrap();
    assert_eq!(to_s.source_track_id.as_deref(), Some("y1"));
    assert_eq!(to_y.source_track_id.as_deref(), Some("s1"));

    // simulate already-resolved destination tracks so the Executor doesn't
    // need to exercise the search_track fallback in this scenario.
    for (item, destination_track_id) in [(to_s, "s-dest-1"), (to_y, "y-dest-1")] {
        let mut payload: WorkPayload = item.payload.clone();
        payload.destination_track_id = Some(destination_track_id.to_string());
        store.update_payload(item.id, &payload).await.unwrap();
    }

    let _m_add_s = server
        .mock("POST", "/playlists/splaylist/tracks")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(json!({ "snapshot_id": "s1" }).to_string())
        .create_async()
        .await;
    let _m_add_y = server
        .mock("POST", "/playlistItems?part=snippet")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "id": "item1" }).to_string())
        .create_async()
        .await;

    let quota = Arc::new(QuotaLedger::new(cfg.youtube_daily_quota));
    let executor = Executor::new(store.clone(), vault, quota, &cfg);
    executor.tick().await;

    let counts = store.queue_status_counts().await.unwrap();
    assert_eq!(counts.get("done").copied().unwrap_or(0), 2);
    _m_add_s.assert_async().await;
    _m_add_y.assert_async().await;
}

/// Scenario B: exhausting the daily quota defers the work item without
/// touching the remote API or the blacklist.
#[tokio::test]
async fn quota_exhaustion_defers_without_blacklisting() {
    let (dir, store, mapping_id) = new_store_with_mapping(false).await;
    let _dir = dir;

    let core = CorePayload::AddTrack { source_track_id: "t1".into() };
    let item = store
        .enqueue_work_item(mapping_id, Service::Y, WorkAction::AddTrack, Service::S, Some("t1"), Some("Song"), core)
        .await
        .unwrap()
        .unwrap();
    let mut payload = item.payload.clone();
    payload.destination_track_id = Some("y-dest".into());
    store.update_payload(item.id, &payload).await.unwrap();

    let server = mockito::Server::new_async().await;
    let base = server.url();
    std::env::set_var("SPOTIFY_AUTH_BASE", &base);
    std::env::set_var("SPOTIFY_API_BASE", &base);
    std::env::set_var("YOUTUBE_AUTH_BASE", &base);
    std::env::set_var("YOUTUBE_API_BASE", &base);

    let vault = Arc::new(Vault::new(store.clone()));
    let cfg = Config::default();
    let quota = Arc::new(QuotaLedger::new(0));
    let executor = Executor::new(store.clone(), vault, quota, &cfg);
    executor.tick().await;

    let counts = store.queue_status_counts().await.unwrap();
    assert_eq!(counts.get("skipped").copied().unwrap_or(0), 1);
    assert!(store.list_blacklist().await.unwrap().is_empty());
}

/// Scenario C: a 404 from the remote API is a fatal outcome that both skips
/// the work item and blacklists the source track for that destination.
#[tokio::test]
async fn fatal_remote_error_skips_and_blacklists() {
    let (dir, store, mapping_id) = new_store_with_mapping(false).await;
    let _dir = dir;

    let core = CorePayload::AddTrack { source_track_id: "missing-track".into() };
    let item = store
        .enqueue_work_item(
            mapping_id,
            Service::Y,
            WorkAction::AddTrack,
            Service::S,
            Some("missing-track"),
            Some("Song"),
            core,
        )
        .await
        .unwrap()
        .unwrap();
    let mut payload = item.payload.clone();
    payload.destination_track_id = Some("y-dest".into());
    store.update_payload(item.id, &payload).await.unwrap();

    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    std::env::set_var("SPOTIFY_AUTH_BASE", &base);
    std::env::set_var("SPOTIFY_API_BASE", &base);
    std::env::set_var("YOUTUBE_AUTH_BASE", &base);
    std::env::set_var("YOUTUBE_API_BASE", &base);

    let _m_add = server
        .mock("POST", "/playlistItems?part=snippet")
        .with_status(404)
        .with_header("content-type", "application/json")
        .with_body(json!({ "error": { "message": "playlist item could not be found" } }).to_string())
        .create_async()
        .await;

    let vault = Arc::new(Vault::new(store.clone()));
    let cfg = Config::default();
    let quota = Arc::new(QuotaLedger::new(cfg.youtube_daily_quota));
    let executor = Executor::new(store.clone(), vault, quota, &cfg);
    executor.tick().await;

    let counts = store.queue_status_counts().await.unwrap();
    assert_eq!(counts.get("skipped").copied().unwrap_or(0), 1);

    let blacklist = store.list_blacklist().await.unwrap();
    assert_eq!(blacklist.len(), 1);
    assert_eq!(blacklist[0].source_track_id, "missing-track");
    assert_eq!(blacklist[0].destination_service, Service::Y);
    assert_eq!(blacklist[0].reason, playlist_reconcile_engine::models::BlacklistReason::NotFound);
}

/// Scenario D: a transient server error is retried with backoff, and the
/// next attempt (once due) succeeds.
#[tokio::test]
async fn transient_error_retries_then_succeeds() {
    let (dir, store, mapping_id) = new_store_with_mapping(false).await;
    let db_path = dir.path().join("reconcile.db");

    let core = CorePayload::AddTrack { source_track_id: "t1".into() };
    let item = store
        .enqueue_work_item(mapping_id, Service::S, WorkAction::AddTrack, Service::Y, Some("t1"), Some("Song"), core)
        .await
        .unwrap()
        .unwrap();
    let mut payload = item.payload.clone();
    payload.destination_track_id = Some("s-dest".into());
    store.update_payload(item.id, &payload).await.unwrap();

    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    std::env::set_var("SPOTIFY_AUTH_BASE", &base);
    std::env::set_var("SPOTIFY_API_BASE", &base);
    std::env::set_var("YOUTUBE_AUTH_BASE", &base);
    std::env::set_var("YOUTUBE_API_BASE", &base);

    let m_fail = server
        .mock("POST", "/playlists/splaylist/tracks")
        .with_status(503)
        .with_header("content-type", "application/json")
        .with_body(json!({ "error": "upstream unavailable" }).to_string())
        .create_async()
        .await;

    let vault = Arc::new(Vault::new(store.clone()));
    let cfg = Config::default();
    let quota = Arc::new(QuotaLedger::new(cfg.youtube_daily_quota));
    let executor = Executor::new(store.clone(), vault.clone(), quota.clone(), &cfg);
    executor.tick().await;

    let counts = store.queue_status_counts().await.unwrap();
    assert_eq!(counts.get("pending").copied().unwrap_or(0), 1, "a transient failure goes back to pending");
    m_fail.assert_async().await;

    // mockito matches the most-recently-created mock first, so this
    // supersedes `m_fail` for the retry without needing to remove it.
    let _m_ok = server
        .mock("POST", "/playlists/splaylist/tracks")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(json!({ "snapshot_id": "s2" }).to_string())
        .create_async()
        .await;

    force_item_due_now(&db_path, item.id);
    executor.tick().await;

    let counts = store.queue_status_counts().await.unwrap();
    assert_eq!(counts.get("done").copied().unwrap_or(0), 1);
}
