//! Client Factory / Credential Vault: resolves credentials and hands back an
//! authenticated `RemoteClient` for a service.

use crate::api::spotify::SpotifyClient;
use crate::api::youtube::YoutubeClient;
use crate::api::RemoteClient;
use crate::models::Service;
use crate::store::Store;
use anyhow::Result;
use std::sync::Arc;

/// Per-call construction is acceptable; only token state is cached, and
/// that lives inside each `RemoteClient`, not here.
pub struct Vault {
    store: Arc<dyn Store>,
}

impl Vault {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Vault { store }
    }

    /// Credential precedence: a DB-stored `client_id`/`client_secret` (set by
    /// the `auth` subcommands) wins over the environment variable fallback,
    /// which is used only when no row is stored yet.
    async fn resolve_credentials(&self, provider: &str, env_id: &str, env_secret: &str) -> Result<(String, String)> {
        if let Some((_, Some(id), Some(secret))) = self.store.load_credential(provider).await? {
            if !id.is_empty() && !secret.is_empty() {
                return Ok((id, secret));
            }
        }
        Ok((
            std::env::var(env_id).unwrap_or_default(),
            std::env::var(env_secret).unwrap_or_default(),
        ))
    }

    pub async fn client_for(&self, service: Service) -> Result<Arc<dyn RemoteClient>> {
        match service {
            Service::S => {
                let (client_id, client_secret) =
                    self.resolve_credentials("spotify", "SPOTIFY_CLIENT_ID", "SPOTIFY_CLIENT_SECRET").await?;
                Ok(Arc::new(SpotifyClient::new(client_id, client_secret, self.store.clone())))
            }
            Service::Y => {
                let (client_id, client_secret) =
                    self.resolve_credentials("youtube", "YOUTUBE_CLIENT_ID", "YOUTUBE_CLIENT_SECRET").await?;
                Ok(Arc::new(YoutubeClient::new(client_id, client_secret, self.store.clone())))
            }
        }
    }
}
