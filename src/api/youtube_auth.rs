use super::pkce;
use crate::config::Config;
use crate::store::{SqliteStore, Store};
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use url::Url;

/// Manual copy/paste OAuth helper for `Y` (Google's installed-app flow),
/// the same shape as `spotify_auth::run_spotify_auth` but with PKCE since
/// Google requires it for installed/desktop app clients that can't keep a
/// client secret confidential — `client_secret` is still accepted here
/// because Google's installed-app registration issues one anyway, but the
/// PKCE verifier is what actually binds the code exchange.
#[derive(Serialize, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: i64,
    refresh_token: Option<String>,
    scope: Option<String>,
}

pub async fn run_youtube_auth(cfg: &Config) -> Result<()> {
    use std::io;

    println!("Enter your YouTube (Google) client_id:");
    let mut client_id = String::new();
    io::stdin().read_line(&mut client_id)?;
    let client_id = client_id.trim().to_string();
    if client_id.is_empty() {
        return Err(anyhow!("no client_id provided"));
    }

    println!("Enter your YouTube (Google) client_secret:");
    let mut client_secret = String::new();
    io::stdin().read_line(&mut client_secret)?;
    let client_secret = client_secret.trim().to_string();
    if client_secret.is_empty() {
        return Err(anyhow!("no client_secret provided"));
    }

    println!("Enter your redirect URI (leave blank for http://127.0.0.1:8888/):");
    let mut redirect_uri = String::new();
    io::stdin().read_line(&mut redirect_uri)?;
    let redirect_uri = {
        let trimmed = redirect_uri.trim();
        if trimmed.is_empty() {
            "http://127.0.0.1:8888/".to_string()
        } else {
            trimmed.to_string()
        }
    };

    let verifier = pkce::generate_code_verifier();
    let challenge = pkce::code_challenge_s256(&verifier);

    let mut url = Url::parse("https://accounts.google.com/o/oauth2/v2/auth")?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &client_id)
        .append_pair(
            "scope",
            "https://www.googleapis.com/auth/youtube https://www.googleapis.com/auth/youtube.force-ssl",
        )
        .append_pair("redirect_uri", &redirect_uri)
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent")
        .append_pair("code_challenge", &challenge)
        .append_pair("code_challenge_method", "S256");

    println!(
        "Open this URL in your browser and authorize the application:\n\n{}\n",
        url
    );
    println!("After authorizing, you'll be redirected to your redirect URI. Copy the full redirect URL and paste it here.");
    println!("Paste redirect URL:");
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();
    let parsed = Url::parse(input).map_err(|e| anyhow!("invalid url pasted: {}", e))?;
    let code = parsed
        .query_pairs()
        .find(|(k, _)| k == "code")
        .ok_or_else(|| anyhow!("no code in redirect URL"))?
        .1
        .into_owned();

    let client = Client::new();
    let params = [
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", &redirect_uri),
        ("client_id", &client_id),
        ("client_secret", &client_secret),
        ("code_verifier", &verifier),
    ];
    let auth_base = std::env::var("YOUTUBE_AUTH_BASE")
        .unwrap_or_else(|_| "https://oauth2.googleapis.com".into());
    let resp = client.post(format!("{}/token", auth_base)).form(&params).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let txt = resp.text().await.unwrap_or_default();
        return Err(anyhow!("token exchange failed: {} => {}", status, txt));
    }

    let tr: TokenResponse = resp.json().await?;
    let expires_at = chrono::Utc::now().timestamp() + tr.expires_in;
    let stored_token = crate::api::youtube::StoredToken {
        access_token: tr.access_token,
        token_type: tr.token_type,
        expires_at,
        refresh_token: tr.refresh_token,
        scope: tr.scope,
    };
    let token_json = serde_json::to_string(&stored_token)?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg.db_path)?);
    store
        .save_credential("youtube", &token_json, Some(&client_id), Some(&client_secret))
        .await?;

    info!("youtube tokens saved for provider 'youtube'");
    println!("Saved tokens. You can now run `tick`/`serve`, which will use the YouTube client.");

    Ok(())
}
