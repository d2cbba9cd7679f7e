pub mod pkce;
pub mod spotify;
pub mod spotify_auth;
pub mod youtube;
pub mod youtube_auth;

use crate::models::{RemoteTrack, Service};
use anyhow::Result;

/// Minimal capability set the Analyzer/Executor need from either remote
/// service. `S` and `Y` differ wildly in their native wire protocols
/// (Spotify Web API vs. YouTube Data API v3's `playlistItems`/`search`
/// resources) but both reduce to these five operations.
#[async_trait::async_trait]
pub trait RemoteClient: Send + Sync {
    /// Which service this client talks to (for logging and blacklist scoping).
    fn service(&self) -> Service;

    /// List tracks currently in a remote playlist, de-duplicated, stable order.
    async fn playlist_tracks(&self, playlist_ref: &str) -> Result<Vec<RemoteTrack>>;

    /// Add an already-resolved track to a playlist.
    async fn add_track_to_playlist(&self, playlist_ref: &str, track_id: &str) -> Result<()>;

    /// Rename a playlist.
    async fn rename_playlist(&self, playlist_ref: &str, new_name: &str) -> Result<()>;

    /// Cross-catalog resolution: search by free-text query (the Executor
    /// passes the source track's title). Returns candidates best-match-first.
    async fn search_track(&self, query: &str) -> Result<Vec<RemoteTrack>>;

    /// Whether this client currently holds usable credentials.
    fn is_authenticated(&self) -> bool;
}
