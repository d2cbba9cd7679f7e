use super::RemoteClient;
use crate::models::{RemoteTrack, Service};
use crate::store::Store;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: i64,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

/// `RemoteClient` for `Y` (YouTube Data API v3). Endpoints overridable via
/// `YOUTUBE_AUTH_BASE`/`YOUTUBE_API_BASE` for test isolation.
pub struct YoutubeClient {
    client: Client,
    client_id: String,
    client_secret: String,
    store: Arc<dyn Store>,
    token: tokio::sync::Mutex<Option<StoredToken>>,
}

impl YoutubeClient {
    pub fn new(client_id: String, client_secret: String, store: Arc<dyn Store>) -> Self {
        YoutubeClient {
            client: Client::new(),
            client_id,
            client_secret,
            store,
            token: tokio::sync::Mutex::new(None),
        }
    }

    fn auth_base() -> String {
        env::var("YOUTUBE_AUTH_BASE").unwrap_or_else(|_| "https://oauth2.googleapis.com".into())
    }

    fn api_base() -> String {
        env::var("YOUTUBE_API_BASE").unwrap_or_else(|_| "https://www.googleapis.com/youtube/v3".into())
    }

    async fn load_token(&self) -> Result<Option<StoredToken>> {
        match self.store.load_credential("youtube").await? {
            Some((json, _, _)) if !json.is_empty() => Ok(Some(serde_json::from_str(&json)?)),
            _ => Ok(None),
        }
    }

    async fn persist_token(&self, st: &StoredToken) -> Result<()> {
        let json = serde_json::to_string(st)?;
        self.store.save_credential("youtube", &json, None, None).await
    }

    async fn ensure_token(&self) -> Result<()> {
        let mut lock = self.token.lock().await;
        if lock.is_none() {
            if let Some(st) = self.load_token().await? {
                *lock = Some(st);
            }
        }
        if let Some(st) = &*lock {
            let now = Utc::now().timestamp();
            if now + 30 >= st.expires_at {
                debug!("youtube token near expiry, refreshing");
                let mut cur = st.clone();
                self.refresh_token(&mut cur).await?;
                *lock = Some(cur);
            }
        }
        Ok(())
    }

    async fn refresh_token(&self, cur: &mut StoredToken) -> Result<()> {
        let refresh_token = cur.refresh_token.clone().ok_or_else(|| anyhow!("no refresh token"))?;
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let url = format!("{}/token", Self::auth_base());
        let resp = self.client.post(&url).form(&params).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("token refresh failed: {} - {}", status, body));
        }
        let j: serde_json::Value = resp.json().await?;
        cur.access_token = j["access_token"].as_str().ok_or_else(|| anyhow!("no access_token"))?.to_string();
        cur.token_type = "Bearer".into();
        cur.expires_at = Utc::now().timestamp() + j["expires_in"].as_i64().unwrap_or(3600);
        if let Some(s) = j["scope"].as_str() {
            cur.scope = Some(s.to_string());
        }
        self.persist_token(cur).await?;
        Ok(())
    }

    async fn bearer(&self) -> Result<String> {
        self.ensure_token().await?;
        let lock = self.token.lock().await;
        let st = lock.as_ref().ok_or_else(|| anyhow!("no token loaded"))?;
        Ok(format!("Bearer {}", st.access_token))
    }

    fn rate_limit_err(status: reqwest::StatusCode) -> anyhow::Error {
        anyhow!("rate limit ({}): too many requests", status)
    }
}

#[async_trait]
impl RemoteClient for YoutubeClient {
    fn service(&self) -> Service {
        Service::Y
    }

    fn is_authenticated(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    async fn playlist_tracks(&self, playlist_ref: &str) -> Result<Vec<RemoteTrack>> {
        let mut tracks = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let bearer = self.bearer().await?;
            let mut url = format!(
                "{}/playlistItems?part=snippet,contentDetails&maxResults=50&playlistId={}",
                Self::api_base(),
                playlist_ref
            );
            if let Some(pt) = &page_token {
                url.push_str(&format!("&pageToken={}", pt));
            }
            let resp = self.client.get(&url).header(AUTHORIZATION, &bearer).send().await?;
            let status = resp.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(Self::rate_limit_err(status));
            }
            if !status.is_success() {
                let txt = resp.text().await.unwrap_or_default();
                return Err(anyhow!("playlistItems.list failed: {} => {}", status, txt));
            }
            let j: serde_json::Value = resp.json().await?;
            if let Some(items) = j["items"].as_array() {
                for it in items {
                    let video_id = it["contentDetails"]["videoId"].as_str();
                    let title = it["snippet"]["title"].as_str();
                    if let (Some(id), Some(title)) = (video_id, title) {
                        tracks.push(RemoteTrack { id: id.to_string(), title: title.to_string() });
                    }
                }
            }
            page_token = j["nextPageToken"].as_str().map(|s| s.to_string());
            if page_token.is_none() {
                break;
            }
        }
        let mut seen = std::collections::HashSet::new();
        tracks.retain(|t| seen.insert(t.id.clone()));
        Ok(tracks)
    }

    async fn add_track_to_playlist(&self, playlist_ref: &str, track_id: &str) -> Result<()> {
        let bearer = self.bearer().await?;
        let url = format!("{}/playlistItems?part=snippet", Self::api_base());
        let body = json!({
            "snippet": {
                "playlistId": playlist_ref,
                "resourceId": { "kind": "youtube#video", "videoId": track_id }
            }
        });
        let resp = self.client.post(&url).header(AUTHORIZATION, &bearer).json(&body).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::rate_limit_err(status));
        }
        if !status.is_success() {
            let txt = resp.text().await.unwrap_or_default();
            return Err(anyhow!("playlistItems.insert failed: {} => {}", status, txt));
        }
        Ok(())
    }

    async fn rename_playlist(&self, playlist_ref: &str, new_name: &str) -> Result<()> {
        let bearer = self.bearer().await?;
        let url = format!("{}/playlists?part=snippet", Self::api_base());
        let body = json!({
            "id": playlist_ref,
            "snippet": { "title": new_name }
        });
        let resp = self.client.put(&url).header(AUTHORIZATION, &bearer).json(&body).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::rate_limit_err(status));
        }
        if !status.is_success() {
            let txt = resp.text().await.unwrap_or_default();
            return Err(anyhow!("playlists.update failed: {} => {}", status, txt));
        }
        Ok(())
    }

    async fn search_track(&self, query: &str) -> Result<Vec<RemoteTrack>> {
        let bearer = self.bearer().await?;
        let url = format!(
            "{}/search?part=snippet&type=video&videoCategoryId=10&maxResults=5&q={}",
            Self::api_base(),
            urlencoding::encode(query)
        );
        let resp = self.client.get(&url).header(AUTHORIZATION, &bearer).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::rate_limit_err(status));
        }
        if !status.is_success() {
            return Ok(Vec::new());
        }
        let j: serde_json::Value = resp.json().await?;
        let mut out = Vec::new();
        if let Some(items) = j["items"].as_array() {
            for it in items {
                let id = it["id"]["videoId"].as_str();
                let title = it["snippet"]["title"].as_str();
                if let (Some(id), Some(title)) = (id, title) {
                    out.push(RemoteTrack { id: id.to_string(), title: title.to_string() });
                }
            }
        }
        Ok(out)
    }
}
