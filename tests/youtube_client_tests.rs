use playlist_reconcile_engine::api::youtube::YoutubeClient;
use playlist_reconcile_engine::api::RemoteClient;
use playlist_reconcile_engine::store::mem::InMemoryStore;
use playlist_reconcile_engine::store::Store;
use serde_json::json;
use std::sync::Arc;

fn expired_token() -> String {
    json!({
        "access_token": "old",
        "token_type": "Bearer",
        "expires_at": 0,
        "refresh_token": "refresh-youtube",
        "scope": "youtube"
    })
    .to_string()
}

fn valid_token() -> String {
    json!({
        "access_token": "still-good",
        "token_type": "Bearer",
        "expires_at": chrono::Utc::now().timestamp() + 3600,
        "refresh_token": "refresh-youtube",
        "scope": "youtube"
    })
    .to_string()
}

#[tokio::test]
async fn refreshes_expired_token_before_listing_tracks() {
    let mut server = mockito::Server::new_async().await;
    std::env::set_var("YOUTUBE_AUTH_BASE", server.url());
    std::env::set_var("YOUTUBE_API_BASE", server.url());

    let _m_token = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "access_token": "new-access-token",
                "token_type": "Bearer",
                "expires_in": 3600,
                "scope": "youtube"
            })
            .to_string(),
        )
        .create_async()
        .await;

    let _m_items = server
        .mock(
            "GET",
            "/playlistItems?part=snippet,contentDetails&maxResults=50&playlistId=pl1",
        )
        .match_header("authorization", "Bearer new-access-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "items": [{
                    "contentDetails": { "videoId": "v1" },
                    "snippet": { "title": "Video One" }
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(vec![]));
    store.save_credential("youtube", &expired_token(), None, None).await.unwrap();
    let client = YoutubeClient::new("cid".into(), "csecret".into(), store);

    let tracks = client.playlist_tracks("pl1").await.unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].id, "v1");
}

#[tokio::test]
async fn add_track_to_playlist_succeeds_with_valid_token() {
    let mut server = mockito::Server::new_async().await;
    std::env::set_var("YOUTUBE_AUTH_BASE", server.url());
    std::env::set_var("YOUTUBE_API_BASE", server.url());

    let _m_add = server
        .mock("POST", "/playlistItems?part=snippet")
        .match_header("authorization", "Bearer still-good")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "id": "item1" }).to_string())
        .create_async()
        .await;

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(vec![]));
    store.save_credential("youtube", &valid_token(), None, None).await.unwrap();
    let client = YoutubeClient::new("cid".into(), "csecret".into(), store);

    client.add_track_to_playlist("pl1", "v2").await.unwrap();
}

#[tokio::test]
async fn rename_playlist_rate_limited_returns_error() {
    let mut server = mockito::Server::new_async().await;
    std::env::set_var("YOUTUBE_AUTH_BASE", server.url());
    std::env::set_var("YOUTUBE_API_BASE", server.url());

    let _m_rename = server
        .mock("PUT", "/playlists?part=snippet")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"quotaExceeded"}"#)
        .create_async()
        .await;

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(vec![]));
    store.save_credential("youtube", &valid_token(), None, None).await.unwrap();
    let client = YoutubeClient::new("cid".into(), "csecret".into(), store);

    let err = client.rename_playlist("pl1", "New Name").await.unwrap_err();
    assert!(err.to_string().to_lowercase().contains("rate limit"));
}
