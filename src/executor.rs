//! Executor: periodic worker pool that drains due queue items, resolves
//! destination tracks, performs remote mutations, classifies failures, and
//! retries or blacklists.

use crate::activity::ActivitySink;
use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::error::RemoteOutcome as Classified;
use crate::models::{
    ActivityLevel, BlacklistReason, JobType, Service, WorkAction, WorkItem, WorkStatus,
};
use crate::quota::QuotaLedger;
use crate::store::Store;
use crate::vault::Vault;
use anyhow::Result;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, warn};

pub struct Executor {
    store: Arc<dyn Store>,
    blacklist: Blacklist,
    vault: Arc<Vault>,
    quota: Arc<QuotaLedger>,
    sink: ActivitySink,
    batch_size: usize,
    max_concurrency: usize,
    youtube_add_track_cost: i64,
    youtube_rename_cost: i64,
}

impl Executor {
    pub fn new(store: Arc<dyn Store>, vault: Arc<Vault>, quota: Arc<QuotaLedger>, cfg: &Config) -> Self {
        Executor {
            blacklist: Blacklist::new(store.clone()),
            sink: ActivitySink::new(store.clone(), std::time::Duration::from_millis(cfg.sink_timeout_ms)),
            store,
            vault,
            quota,
            batch_size: cfg.batch_size,
            max_concurrency: cfg.max_concurrency,
            youtube_add_track_cost: cfg.youtube_add_track_cost,
            youtube_rename_cost: cfg.youtube_rename_cost,
        }
    }

    pub async fn tick(&self) {
        if let Err(e) = self.run_once().await {
            error!(error = %e, "executor tick failed");
        }
    }

    async fn run_once(&self) -> Result<()> {
        let due = self.store.lease_due(self.batch_size).await?;
        if due.is_empty() {
            return Ok(());
        }
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut in_flight = FuturesUnordered::new();
        for item in due {
            let sem = semaphore.clone();
            in_flight.push(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore not closed");
                self.process_one(item).await;
            });
        }
        while in_flight.next().await.is_some() {}
        Ok(())
    }

    async fn process_one(&self, item: WorkItem) {
        if !self.store.mark_running(item.id).await.unwrap_or(false) {
            // lost the interlock race to another tick; nothing to do.
            return;
        }

        let mut item = item;
        item.status = WorkStatus::Running;

        let outcome = self.execute(&mut item).await;
        let attempts = item.attempts + 1;

        match outcome {
            Ok(()) => {
                if let Err(e) = self.store.mark_done(item.id, attempts).await {
                    error!(work_item_id = item.id, error = %e, "failed to persist done status");
                }
                self.log(ActivityLevel::Info, &format!("work item {} completed", item.id), Some(item.id)).await;
            }
            Err(classified) => self.handle_failure(item, attempts, classified).await,
        }
    }

    /// Resolves the destination track (for `add_track`) then performs the
    /// remote mutation. Returns a `Classified` error on any failure so the
    /// caller can route it through the outcome-classification table.
    async fn execute(&self, item: &mut WorkItem) -> std::result::Result<(), Classified> {
        let mapping = self.store.get_mapping(item.mapping_id).await.map_err(Classified::transient)?;
        let destination_playlist_ref = match item.destination_service {
            Service::S => mapping.source_playlist_ref_s.as_str(),
            Service::Y => mapping.source_playlist_ref_y.as_str(),
        };
        let destination_client = self.vault.client_for(item.destination_service).await.map_err(Classified::transient)?;

        match item.action {
            WorkAction::AddTrack => {
                if item.payload.destination_track_id.is_none() {
                    let title = item.source_track_title.clone().unwrap_or_default();
                    let candidates = destination_client
                        .search_track(&title)
                        .await
                        .map_err(|e| Classified::Fatal { reason: BlacklistReason::SearchFailed, message: e.to_string() })?;
                    let resolved = candidates.into_iter().next();
                    match resolved {
                        Some(track) => {
                            item.payload.destination_track_id = Some(track.id.clone());
                            if let Err(e) = self.store.update_payload(item.id, &item.payload).await {
                                warn!(work_item_id = item.id, error = %e, "failed to persist resolved destination_track_id");
                            }
                        }
                        None => {
                            return Err(Classified::Fatal {
                                reason: BlacklistReason::SearchFailed,
                                message: format!("no search results for '{}'", title),
                            });
                        }
                    }
                }
                let destination_track_id = item.payload.destination_track_id.clone().unwrap();

                if item.destination_service == Service::Y
                    && !self.quota.check_and_consume(self.youtube_add_track_cost)
                {
                    return Err(Classified::Quota);
                }

                destination_client
                    .add_track_to_playlist(destination_playlist_ref, &destination_track_id)
                    .await
                    .map_err(Classified::classify)
            }
            WorkAction::RenamePlaylist => {
                let new_name = match &item.payload.core {
                    crate::models::CorePayload::RenamePlaylist { new_name } => new_name.clone(),
                    _ => return Err(Classified::transient(anyhow::anyhow!("rename item missing new_name"))),
                };

                if item.destination_service == Service::Y
                    && !self.quota.check_and_consume(self.youtube_rename_cost)
                {
                    return Err(Classified::Quota);
                }

                destination_client
                    .rename_playlist(destination_playlist_ref, &new_name)
                    .await
                    .map_err(Classified::classify)
            }
        }
    }

    async fn handle_failure(&self, item: WorkItem, attempts: i64, classified: Classified) {
        match classified {
            Classified::Quota => {
                self.log(ActivityLevel::Warn, "quota exhausted, deferring work item", Some(item.id)).await;
                if let Err(e) = self.store.mark_skipped(item.id, item.attempts, "quota").await {
                    error!(work_item_id = item.id, error = %e, "failed to persist quota-skip");
                }
            }
            Classified::Fatal { reason, message } => {
                let truncated = truncate(&format!("fatal: {}", message), 500);
                if item.action == WorkAction::AddTrack {
                    if let Some(track_id) = &item.source_track_id {
                        if let Err(e) = self.blacklist.record(item.mapping_id, item.destination_service, track_id, reason).await {
                            warn!(work_item_id = item.id, error = %e, "failed to record blacklist entry");
                        }
                    }
                }
                if let Err(e) = self.store.mark_skipped(item.id, attempts, &truncated).await {
                    error!(work_item_id = item.id, error = %e, "failed to persist fatal-skip");
                }
                self.log(ActivityLevel::Error, &truncated, Some(item.id)).await;
            }
            Classified::RateLimit(message) => {
                let backoff_seconds = backoff_for(attempts);
                let next_attempt_at = (Utc::now() + chrono::Duration::seconds(backoff_seconds)).to_rfc3339();
                let truncated = truncate(&format!("rate_limit: {}", message), 500);
                if let Err(e) = self
                    .store
                    .mark_retry(item.id, attempts, backoff_seconds, &next_attempt_at, &truncated)
                    .await
                {
                    error!(work_item_id = item.id, error = %e, "failed to persist retry");
                }
                self.log(ActivityLevel::Warn, &truncated, Some(item.id)).await;
            }
            Classified::Transient(message) => {
                let backoff_seconds = backoff_for(attempts);
                let next_attempt_at = (Utc::now() + chrono::Duration::seconds(backoff_seconds)).to_rfc3339();
                let truncated = truncate(&format!("transient: {}", message), 500);
                if let Err(e) = self
                    .store
                    .mark_retry(item.id, attempts, backoff_seconds, &next_attempt_at, &truncated)
                    .await
                {
                    error!(work_item_id = item.id, error = %e, "failed to persist retry");
                }
                self.log(ActivityLevel::Warn, &truncated, Some(item.id)).await;
            }
        }
    }

    async fn log(&self, level: ActivityLevel, message: &str, work_item_id: Option<i64>) {
        self.sink.record(level, message, JobType::Execution, work_item_id).await;
    }
}

/// `backoff_seconds := min(2^attempts * 30, 3600)`.
fn backoff_for(attempts: i64) -> i64 {
    let exp = 2i64.saturating_pow(attempts.clamp(0, 62) as u32).saturating_mul(30);
    exp.min(3600)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
