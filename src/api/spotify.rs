use super::RemoteClient;
use crate::models::{RemoteTrack, Service};
use crate::store::Store;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: i64,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

/// `RemoteClient` for `S` (Spotify Web API). Endpoints may be overridden by
/// `SPOTIFY_AUTH_BASE`/`SPOTIFY_API_BASE` env vars (tests point these at a
/// local mock server).
pub struct SpotifyClient {
    client: Client,
    client_id: String,
    client_secret: String,
    store: Arc<dyn Store>,
    token: tokio::sync::Mutex<Option<StoredToken>>,
}

impl SpotifyClient {
    pub fn new(client_id: String, client_secret: String, store: Arc<dyn Store>) -> Self {
        SpotifyClient {
            client: Client::new(),
            client_id,
            client_secret,
            store,
            token: tokio::sync::Mutex::new(None),
        }
    }

    fn auth_base() -> String {
        env::var("SPOTIFY_AUTH_BASE").unwrap_or_else(|_| "https://accounts.spotify.com".into())
    }

    fn api_base() -> String {
        env::var("SPOTIFY_API_BASE").unwrap_or_else(|_| "https://api.spotify.com/v1".into())
    }

    async fn load_token(&self) -> Result<Option<StoredToken>> {
        match self.store.load_credential("spotify").await? {
            Some((json, _, _)) if !json.is_empty() => Ok(Some(serde_json::from_str(&json)?)),
            _ => Ok(None),
        }
    }

    async fn persist_token(&self, st: &StoredToken) -> Result<()> {
        let json = serde_json::to_string(st)?;
        self.store.save_credential("spotify", &json, None, None).await
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
                debug!("spotify token near expiry, refreshing");
                let mut cur = st.clone();
                self.refresh_token(&mut cur).await?;
                *lock = Some(cur);
            }
        }
        Ok(())
    }

    async fn refresh_token(&self, cur: &mut StoredToken) -> Result<()> {
        let refresh_token = cur.refresh_token.clone().ok_or_else(|| anyhow!("no refresh token"))?;
        let params = [("grant_type", "refresh_token"), ("refresh_token", &refresh_token)];
        let auth_header = format!(
            "Basic {}",
            general_purpose::STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret))
        );
        let url = format!("{}/api/token", Self::auth_base());
        let resp = self.client.post(&url).header(AUTHORIZATION, auth_header).form(&params).send().await?;
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

    fn rate_limit_err(resp: &reqwest::Response) -> anyhow::Error {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        anyhow!("rate limit (429): retry_after={:?}", retry_after)
    }
}

#[async_trait]
impl RemoteClient for SpotifyClient {
    fn service(&self) -> Service {
        Service::S
    }

    fn is_authenticated(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    async fn playlist_tracks(&self, playlist_ref: &str) -> Result<Vec<RemoteTrack>> {
        let mut tracks = Vec::new();
        let mut next: Option<String> = Some(format!(
            "{}/playlists/{}/tracks?fields=items(track(id,name)),next&limit=100",
            Self::api_base(),
            playlist_ref
        ));
        while let Some(url) = next {
            let bearer = self.bearer().await?;
            let resp = self.client.get(&url).header(AUTHORIZATION, &bearer).send().await?;
            let status = resp.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(Self::rate_limit_err(&resp));
            }
            if status.as_u16() == 401 {
                self.ensure_token().await?;
                return Err(anyhow!("unauthorized listing playlist tracks"));
            }
            if !status.is_success() {
                let txt = resp.text().await.unwrap_or_default();
                return Err(anyhow!("list playlist tracks failed: {} => {}", status, txt));
            }
            let j: serde_json::Value = resp.json().await?;
            if let Some(items) = j["items"].as_array() {
                for it in items {
                    if let (Some(id), Some(name)) = (it["track"]["id"].as_str(), it["track"]["name"].as_str()) {
                        tracks.push(RemoteTrack { id: id.to_string(), title: name.to_string() });
                    }
                }
            }
            next = j["next"].as_str().map(|s| s.to_string());
        }
        let mut seen = std::collections::HashSet::new();
        tracks.retain(|t| seen.insert(t.id.clone()));
        Ok(tracks)
    }

    async fn add_track_to_playlist(&self, playlist_ref: &str, track_id: &str) -> Result<()> {
        let bearer = self.bearer().await?;
        let url = format!("{}/playlists/{}/tracks", Self::api_base(), playlist_ref);
        let uri = format!("spotify:track:{}", track_id);
        let body = json!({ "uris": [uri] });
        let resp = self.client.post(&url).header(AUTHORIZATION, &bearer).json(&body).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::rate_limit_err(&resp));
        }
        if !status.is_success() {
            let txt = resp.text().await.unwrap_or_default();
            return Err(anyhow!("add track failed: {} => {}", status, txt));
        }
        Ok(())
    }

    async fn rename_playlist(&self, playlist_ref: &str, new_name: &str) -> Result<()> {
        let bearer = self.bearer().await?;
        let url = format!("{}/playlists/{}", Self::api_base(), playlist_ref);
        let body = json!({ "name": new_name });
        let resp = self.client.put(&url).header(AUTHORIZATION, &bearer).json(&body).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::rate_limit_err(&resp));
        }
        if !status.is_success() {
            return Err(anyhow!("rename failed: {}", status));
        }
        Ok(())
    }

    async fn search_track(&self, query: &str) -> Result<Vec<RemoteTrack>> {
        let url = format!(
            "{}/search?q={}&type=track&limit=5",
            Self::api_base(),
            urlencoding::encode(query)
        );
        let bearer = self.bearer().await?;
        let resp = self.client.get(&url).header(AUTHORIZATION, &bearer).header(ACCEPT, "application/json").send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::rate_limit_err(&resp));
        }
        if !status.is_success() {
            warn!(status = %status, "spotify search failed");
            return Ok(Vec::new());
        }
        let j: serde_json::Value = resp.json().await?;
        let mut out = Vec::new();
        if let Some(items) = j["tracks"]["items"].as_array() {
            for it in items {
                if let (Some(id), Some(name)) = (it["id"].as_str(), it["name"].as_str()) {
                    out.push(RemoteTrack { id: id.to_string(), title: name.to_string() });
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) fn api_base_for_tests() -> String {
    SpotifyClient::api_base()
}
