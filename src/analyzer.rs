//! Analyzer: periodic scheduler that picks due mappings, diffs both sides,
//! and enqueues work. Fires on a 1-minute tick and never overlaps its own
//! run.

use crate::activity::ActivitySink;
use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::models::{ActivityLevel, CorePayload, JobType, Mapping, RemoteTrack, Service, WorkAction};
use crate::store::Store;
use crate::vault::Vault;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Guards against two overlapping analyzer passes. The Analyzer has no
/// per-mapping parallelism to protect, just the one process-wide tick.
pub struct Analyzer {
    store: Arc<dyn Store>,
    blacklist: Blacklist,
    vault: Arc<Vault>,
    sink: ActivitySink,
    in_flight: AtomicBool,
}

impl Analyzer {
    pub fn new(store: Arc<dyn Store>, vault: Arc<Vault>, cfg: &Config) -> Self {
        Analyzer {
            blacklist: Blacklist::new(store.clone()),
            sink: ActivitySink::new(store.clone(), std::time::Duration::from_millis(cfg.sink_timeout_ms)),
            store,
            vault,
            in_flight: AtomicBool::new(false),
        }
    }

    pub async fn tick(&self) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("analyzer tick skipped: previous pass still in flight");
            return;
        }
        let result = self.run_once().await;
        self.in_flight.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            error!(error = %e, "analyzer tick failed");
        }
    }

    async fn run_once(&self) -> Result<()> {
        let mappings = self.store.list_mappings().await?;
        let now = Utc::now();
        for mapping in mappings {
            if !is_due(&mapping, now) {
                continue;
            }
            if let Err(e) = self.analyze(&mapping, now).await {
                error!(mapping_id = mapping.id, error = %e, "analyzer failed for mapping, continuing");
                self.sink
                    .record(
                        ActivityLevel::Error,
                        &format!("analysis failed for mapping {}: {}", mapping.id, e),
                        JobType::Analysis,
                        None,
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn analyze(&self, mapping: &Mapping, now: DateTime<Utc>) -> Result<()> {
        let client_s = self.vault.client_for(Service::S).await?;
        let client_y = self.vault.client_for(Service::Y).await?;

        let tracks_s = client_s.playlist_tracks(&mapping.source_playlist_ref_s).await?;
        let tracks_y = client_y.playlist_tracks(&mapping.source_playlist_ref_y).await?;

        if mapping.sync_tracks {
            self.sync_tracks(mapping, &tracks_s, &tracks_y).await?;
        }

        if mapping.sync_name {
            self.sync_name(mapping).await?;
        }

        let interval = mapping.effective_interval_minutes();
        let next = now + chrono::Duration::minutes(interval);
        self.store
            .update_mapping_schedule(mapping.id, &now.to_rfc3339(), &next.to_rfc3339())
            .await?;

        Ok(())
    }

    async fn sync_tracks(
        &self,
        mapping: &Mapping,
        tracks_s: &[RemoteTrack],
        tracks_y: &[RemoteTrack],
    ) -> Result<()> {
        let ids_s: HashSet<&str> = tracks_s.iter().map(|t| t.id.as_str()).collect();
        let ids_y: HashSet<&str> = tracks_y.iter().map(|t| t.id.as_str()).collect();

        let diff_to_s: Vec<&RemoteTrack> = tracks_y.iter().filter(|t| !ids_s.contains(t.id.as_str())).collect();
        let diff_to_y: Vec<&RemoteTrack> = tracks_s.iter().filter(|t| !ids_y.contains(t.id.as_str())).collect();

        let candidates_s: Vec<String> = diff_to_s.iter().map(|t| t.id.clone()).collect();
        let kept_s = self.blacklist.filter(mapping.id, Service::S, candidates_s).await;
        for t in diff_to_s.iter().filter(|t| kept_s.contains(&t.id)) {
            self.enqueue_add(mapping, Service::Y, Service::S, t).await?;
        }

        let candidates_y: Vec<String> = diff_to_y.iter().map(|t| t.id.clone()).collect();
        let kept_y = self.blacklist.filter(mapping.id, Service::Y, candidates_y).await;
        for t in diff_to_y.iter().filter(|t| kept_y.contains(&t.id)) {
            self.enqueue_add(mapping, Service::S, Service::Y, t).await?;
        }

        Ok(())
    }

    async fn enqueue_add(
        &self,
        mapping: &Mapping,
        source_service: Service,
        destination_service: Service,
        track: &RemoteTrack,
    ) -> Result<()> {
        let core = CorePayload::AddTrack { source_track_id: track.id.clone() };
        let enqueued = self
            .store
            .enqueue_work_item(
                mapping.id,
                destination_service,
                WorkAction::AddTrack,
                source_service,
                Some(&track.id),
                Some(&track.title),
                core,
            )
            .await?;
        if enqueued.is_some() {
            info!(mapping_id = mapping.id, track_id = %track.id, destination = %destination_service, "enqueued add_track");
        }
        Ok(())
    }

    /// Rename policy: `Y`'s name is canonical. If both names are present
    /// and differ, rename the side whose name isn't canonical.
    async fn sync_name(&self, mapping: &Mapping) -> Result<()> {
        let name_y = match &mapping.name_y {
            Some(n) if !n.is_empty() => n,
            _ => return Ok(()),
        };
        let name_s = match &mapping.name_s {
            Some(n) if !n.is_empty() => n,
            _ => return Ok(()),
        };
        if name_s == name_y {
            return Ok(());
        }

        let core = CorePayload::RenamePlaylist { new_name: name_y.clone() };
        let enqueued = self
            .store
            .enqueue_work_item(
                mapping.id,
                Service::S,
                WorkAction::RenamePlaylist,
                Service::Y,
                None,
                None,
                core,
            )
            .await?;
        if enqueued.is_some() {
            info!(mapping_id = mapping.id, new_name = %name_y, "enqueued rename_playlist on S");
        }
        Ok(())
    }
}

/// A mapping is due when it has never been analyzed, or its
/// `next_analysis_at` has passed. Timestamps are parsed with a prioritized
/// fallback chain; total parse failure treats the mapping as due
/// (fail-forward) rather than silently skipping it forever.
fn is_due(mapping: &Mapping, now: DateTime<Utc>) -> bool {
    match &mapping.next_analysis_at {
        None => true,
        Some(s) => match parse_timestamp(s) {
            Some(t) => now > t,
            None => true,
        },
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(t, Utc));
    }
    if let Ok(t) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(t, Utc));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Mapping;
    use crate::store::mem::InMemoryStore;

    fn mapping(next_analysis_at: Option<String>, name_s: Option<&str>, name_y: Option<&str>) -> Mapping {
        Mapping {
            id: 1,
            source_playlist_ref_s: "s1".into(),
            source_playlist_ref_y: "y1".into(),
            name_s: name_s.map(|s| s.to_string()),
            name_y: name_y.map(|s| s.to_string()),
            sync_name: true,
            sync_tracks: true,
            interval_minutes: 60,
            last_analysis_at: None,
            next_analysis_at,
        }
    }

    #[test]
    fn never_analyzed_is_due() {
        assert!(is_due(&mapping(None, None, None), Utc::now()));
    }

    #[test]
    fn future_next_analysis_is_not_due() {
        let future = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        assert!(!is_due(&mapping(Some(future), None, None), Utc::now()));
    }

    #[test]
    fn past_next_analysis_is_due() {
        let past = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        assert!(is_due(&mapping(Some(past), None, None), Utc::now()));
    }

    #[test]
    fn unparseable_timestamp_fails_forward_to_due() {
        assert!(is_due(&mapping(Some("not-a-timestamp".into()), None, None), Utc::now()));
    }

    #[tokio::test]
    async fn sync_tracks_enqueues_both_directions_and_skips_duplicates() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(vec![]));
        let vault = Arc::new(Vault::new(store.clone()));
        let analyzer = Analyzer::new(store.clone(), vault, &Config::default());

        let m = mapping(None, None, None);
        let tracks_s = vec![RemoteTrack { id: "t1".into(), title: "Song One".into() }];
        let tracks_y = vec![RemoteTrack { id: "t2".into(), title: "Song Two".into() }];

        analyzer.sync_tracks(&m, &tracks_s, &tracks_y).await.unwrap();
        // running again with the same diff must not create a second active item
        analyzer.sync_tracks(&m, &tracks_s, &tracks_y).await.unwrap();

        let counts = store.queue_status_counts().await.unwrap();
        assert_eq!(counts.get("pending").copied().unwrap_or(0), 2);

        let items = store.active_work_items(m.id).await.unwrap();
        let t1_item = items.iter().find(|i| i.source_track_id.as_deref() == Some("t1")).unwrap();
        assert_eq!(t1_item.destination_service, Service::Y, "a track only on S must be added to Y");
        let t2_item = items.iter().find(|i| i.source_track_id.as_deref() == Some("t2")).unwrap();
        assert_eq!(t2_item.destination_service, Service::S, "a track only on Y must be added to S");
    }

    #[tokio::test]
    async fn sync_name_renames_s_toward_ys_canonical_name() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(vec![]));
        let vault = Arc::new(Vault::new(store.clone()));
        let analyzer = Analyzer::new(store.clone(), vault, &Config::default());

        let m = mapping(None, Some("My Jams"), Some("My Jams 2024"));
        analyzer.sync_name(&m).await.unwrap();
        // a second pass over the same mapping must not enqueue a duplicate rename
        analyzer.sync_name(&m).await.unwrap();

        let items = store.active_work_items(m.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].destination_service, Service::S);
        assert_eq!(items[0].action, WorkAction::RenamePlaylist);
        match &items[0].payload.core {
            CorePayload::RenamePlaylist { new_name } => assert_eq!(new_name, "My Jams 2024"),
            other => panic!("expected RenamePlaylist payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sync_name_is_noop_when_names_match() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(vec![]));
        let vault = Arc::new(Vault::new(store.clone()));
        let analyzer = Analyzer::new(store.clone(), vault, &Config::default());

        let m = mapping(None, Some("Same Name"), Some("Same Name"));
        analyzer.sync_name(&m).await.unwrap();

        assert!(store.active_work_items(m.id).await.unwrap().is_empty());
    }
}
