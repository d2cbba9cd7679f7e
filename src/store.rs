//! Store Facade: typed access to records and indexed queries over the
//! collaborator record store. `SqliteStore` is the production
//! implementation (pooled `rusqlite` connections via `r2d2`); `InMemoryStore`
//! backs engine-logic unit tests that don't need real SQL semantics.

use crate::error::StoreError;
use crate::models::{
    ActivityLevel, BlacklistEntry, BlacklistReason, CorePayload, JobType, Mapping, Service,
    WorkAction, WorkItem, WorkPayload, WorkStatus,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

const SCHEMA: &str = include_str!("../db/schema.sql");

/// Everything the reconciliation engine needs from the collaborator record
/// store. Methods are `async` so callers never need to know whether an
/// implementation is blocking (sqlite, bridged via `spawn_blocking`) or
/// purely in-memory.
#[async_trait]
pub trait Store: Send + Sync {
    /// Local equivalent of the external mapping-management UI the engine
    /// assumes exists in production; used by the `mapping add` CLI helper
    /// for manual setup.
    #[allow(clippy::too_many_arguments)]
    async fn insert_mapping(
        &self,
        source_playlist_ref_s: &str,
        source_playlist_ref_y: &str,
        name_s: Option<&str>,
        name_y: Option<&str>,
        sync_name: bool,
        sync_tracks: bool,
        interval_minutes: i64,
    ) -> Result<i64>;
    async fn list_mappings(&self) -> Result<Vec<Mapping>>;
    async fn get_mapping(&self, mapping_id: i64) -> Result<Mapping>;
    async fn update_mapping_schedule(
        &self,
        mapping_id: i64,
        last_analysis_at: &str,
        next_analysis_at: &str,
    ) -> Result<()>;

    /// Active (pending/running) items for a mapping, used by the analyzer's
    /// application-level dedup scan.
    async fn active_work_items(&self, mapping_id: i64) -> Result<Vec<WorkItem>>;

    /// Insert a new work item unless an active item with the same logical
    /// identity already exists. Returns `None` when skipped by dedup.
    #[allow(clippy::too_many_arguments)]
    async fn enqueue_work_item(
        &self,
        mapping_id: i64,
        destination_service: Service,
        action: WorkAction,
        source_service: Service,
        source_track_id: Option<&str>,
        source_track_title: Option<&str>,
        core: CorePayload,
    ) -> Result<Option<WorkItem>>;

    async fn lease_due(&self, batch: usize) -> Result<Vec<WorkItem>>;
    /// `pending -> running` interlock transition. Returns `false` if the item
    /// was no longer pending (already claimed by another tick).
    async fn mark_running(&self, id: i64) -> Result<bool>;
    async fn update_payload(&self, id: i64, payload: &WorkPayload) -> Result<()>;
    async fn mark_done(&self, id: i64, attempts: i64) -> Result<()>;
    async fn mark_retry(
        &self,
        id: i64,
        attempts: i64,
        backoff_seconds: i64,
        next_attempt_at: &str,
        last_error: &str,
    ) -> Result<()>;
    async fn mark_skipped(&self, id: i64, attempts: i64, last_error: &str) -> Result<()>;

    async fn queue_status_counts(&self) -> Result<HashMap<String, i64>>;

    /// Entries visible to a mapping: its own plus global (`mapping_id` NULL).
    async fn blacklist_for(
        &self,
        mapping_id: i64,
        destination_service: Service,
    ) -> Result<Vec<BlacklistEntry>>;
    async fn upsert_blacklist(
        &self,
        mapping_id: Option<i64>,
        destination_service: Service,
        source_track_id: &str,
        reason: BlacklistReason,
    ) -> Result<()>;
    async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>>;
    async fn delete_blacklist(&self, id: i64) -> Result<()>;

    async fn save_credential(
        &self,
        provider: &str,
        token_json: &str,
        client_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> Result<()>;
    async fn load_credential(
        &self,
        provider: &str,
    ) -> Result<Option<(String, Option<String>, Option<String>)>>;

    async fn record_activity(
        &self,
        level: ActivityLevel,
        message: &str,
        job_type: JobType,
        work_item_id: Option<i64>,
    ) -> Result<()>;
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn work_payload_from_row(core_payload: &str, payload_json: &str) -> Result<WorkPayload> {
    let _: CorePayload = serde_json::from_str(core_payload)
        .with_context(|| format!("core_payload not valid JSON: {}", core_payload))?;
    let payload: WorkPayload = serde_json::from_str(payload_json)
        .with_context(|| format!("payload not valid JSON: {}", payload_json))?;
    Ok(payload)
}

fn row_to_work_item(
    id: i64,
    mapping_id: i64,
    destination_service: String,
    action: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    next_attempt_at: String,
    backoff_seconds: i64,
    source_track_id: Option<String>,
    source_track_title: Option<String>,
    source_service: String,
    core_payload: String,
    payload_json: String,
) -> Result<WorkItem> {
    Ok(WorkItem {
        id,
        mapping_id,
        destination_service: Service::parse(&destination_service)
            .ok_or_else(|| anyhow!("bad destination_service: {}", destination_service))?,
        action: WorkAction::parse(&action).ok_or_else(|| anyhow!("bad action: {}", action))?,
        status: WorkStatus::parse(&status).ok_or_else(|| anyhow!("bad status: {}", status))?,
        attempts,
        last_error,
        next_attempt_at,
        backoff_seconds,
        source_track_id,
        source_track_title,
        source_service: Service::parse(&source_service)
            .ok_or_else(|| anyhow!("bad source_service: {}", source_service))?,
        payload: work_payload_from_row(&core_payload, &payload_json)?,
        core_payload,
    })
}

/// `rusqlite`-backed implementation, pooled with `r2d2`/`r2d2_sqlite` rather
/// than opening a fresh `Connection` per operation.
pub struct SqliteStore {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = r2d2::Pool::new(manager).context("building sqlite connection pool")?;
        {
            let conn = pool.get().context("getting sqlite connection")?;
            run_migrations(&conn)?;
        }
        Ok(SqliteStore { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("getting pooled sqlite connection")
    }
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_mapping(
        &self,
        source_playlist_ref_s: &str,
        source_playlist_ref_y: &str,
        name_s: Option<&str>,
        name_y: Option<&str>,
        sync_name: bool,
        sync_tracks: bool,
        interval_minutes: i64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let s_ref = source_playlist_ref_s.to_string();
        let y_ref = source_playlist_ref_y.to_string();
        let name_s = name_s.map(|s| s.to_string());
        let name_y = name_y.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || -> Result<i64> {
            conn.execute(
                "INSERT INTO mappings (source_playlist_ref_s, source_playlist_ref_y, name_s, name_y, \
                 sync_name, sync_tracks, interval_minutes) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    s_ref,
                    y_ref,
                    name_s,
                    name_y,
                    sync_name as i64,
                    sync_tracks as i64,
                    interval_minutes
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?
    }

    async fn list_mappings(&self) -> Result<Vec<Mapping>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || -> Result<Vec<Mapping>> {
            let mut stmt = conn.prepare(
                "SELECT id, source_playlist_ref_s, source_playlist_ref_y, name_s, name_y, \
                 sync_name, sync_tracks, interval_minutes, last_analysis_at, next_analysis_at \
                 FROM mappings ORDER BY id DESC",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(Mapping {
                    id: r.get(0)?,
                    source_playlist_ref_s: r.get(1)?,
                    source_playlist_ref_y: r.get(2)?,
                    name_s: r.get(3)?,
                    name_y: r.get(4)?,
                    sync_name: r.get::<_, i64>(5)? != 0,
                    sync_tracks: r.get::<_, i64>(6)? != 0,
                    interval_minutes: r.get(7)?,
                    last_analysis_at: r.get(8)?,
                    next_analysis_at: r.get(9)?,
                })
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await?
    }

    async fn get_mapping(&self, mapping_id: i64) -> Result<Mapping> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || -> Result<Mapping> {
            conn.query_row(
                "SELECT id, source_playlist_ref_s, source_playlist_ref_y, name_s, name_y, \
                 sync_name, sync_tracks, interval_minutes, last_analysis_at, next_analysis_at \
                 FROM mappings WHERE id = ?1",
                params![mapping_id],
                |r| {
                    Ok(Mapping {
                        id: r.get(0)?,
                        source_playlist_ref_s: r.get(1)?,
                        source_playlist_ref_y: r.get(2)?,
                        name_s: r.get(3)?,
                        name_y: r.get(4)?,
                        sync_name: r.get::<_, i64>(5)? != 0,
                        sync_tracks: r.get::<_, i64>(6)? != 0,
                        interval_minutes: r.get(7)?,
                        last_analysis_at: r.get(8)?,
                        next_analysis_at: r.get(9)?,
                    })
                },
            )
            .optional()
            .context("querying mapping")?
            .ok_or(StoreError::MappingNotFound(mapping_id))
            .map_err(anyhow::Error::from)
        })
        .await?
    }

    async fn update_mapping_schedule(
        &self,
        mapping_id: i64,
        last_analysis_at: &str,
        next_analysis_at: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        let last = last_analysis_at.to_string();
        let next = next_analysis_at.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.execute(
                "UPDATE mappings SET last_analysis_at = ?1, next_analysis_at = ?2 WHERE id = ?3",
                params![last, next, mapping_id],
            )?;
            Ok(())
        })
        .await?
    }

    async fn active_work_items(&self, mapping_id: i64) -> Result<Vec<WorkItem>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || -> Result<Vec<WorkItem>> {
            let mut stmt = conn.prepare(
                "SELECT id, mapping_id, destination_service, action, status, attempts, last_error, \
                 next_attempt_at, backoff_seconds, source_track_id, source_track_title, \
                 source_service, core_payload, payload FROM sync_items \
                 WHERE mapping_id = ?1 AND status IN ('pending', 'running')",
            )?;
            let rows = stmt.query_map(params![mapping_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, i64>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, i64>(8)?,
                    r.get::<_, Option<String>>(9)?,
                    r.get::<_, Option<String>>(10)?,
                    r.get::<_, String>(11)?,
                    r.get::<_, String>(12)?,
                    r.get::<_, String>(13)?,
                ))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (
                    id,
                    mapping_id,
                    dest,
                    action,
                    status,
                    attempts,
                    last_error,
                    next_attempt_at,
                    backoff_seconds,
                    source_track_id,
                    source_track_title,
                    source_service,
                    core_payload,
                    payload,
                ) = r?;
                out.push(row_to_work_item(
                    id,
                    mapping_id,
                    dest,
                    action,
                    status,
                    attempts,
                    last_error,
                    next_attempt_at,
                    backoff_seconds,
                    source_track_id,
                    source_track_title,
                    source_service,
                    core_payload,
                    payload,
                )?);
            }
            Ok(out)
        })
        .await?
    }

    async fn enqueue_work_item(
        &self,
        mapping_id: i64,
        destination_service: Service,
        action: WorkAction,
        source_service: Service,
        source_track_id: Option<&str>,
        source_track_title: Option<&str>,
        core: CorePayload,
    ) -> Result<Option<WorkItem>> {
        let conn = self.conn()?;
        let core_key = core.to_key();
        let source_track_id = source_track_id.map(|s| s.to_string());
        let source_track_title = source_track_title.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || -> Result<Option<WorkItem>> {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM sync_items WHERE mapping_id = ?1 AND destination_service = ?2 \
                     AND action = ?3 AND core_payload = ?4 AND status IN ('pending', 'running')",
                    params![
                        mapping_id,
                        destination_service.as_str(),
                        action.as_str(),
                        core_key
                    ],
                    |r| r.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(None);
            }

            let payload = WorkPayload {
                core: core.clone(),
                destination_track_id: None,
                marker_nanos: std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or(0),
            };
            let payload_json = serde_json::to_string(&payload)?;
            let next_attempt_at = now_iso();

            // Partial unique index is the belt-and-braces guard; a
            // concurrent writer racing past the scan above still fails here.
            let insert_res = conn.execute(
                "INSERT INTO sync_items (mapping_id, destination_service, action, status, \
                 attempts, next_attempt_at, backoff_seconds, source_track_id, source_track_title, \
                 source_service, core_payload, payload) \
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, 30, ?5, ?6, ?7, ?8, ?9)",
                params![
                    mapping_id,
                    destination_service.as_str(),
                    action.as_str(),
                    next_attempt_at,
                    source_track_id,
                    source_track_title,
                    source_service.as_str(),
                    core_key,
                    payload_json,
                ],
            );
            match insert_res {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
            let id = conn.last_insert_rowid();
            Ok(Some(row_to_work_item(
                id,
                mapping_id,
                destination_service.as_str().to_string(),
                action.as_str().to_string(),
                "pending".to_string(),
                0,
                None,
                next_attempt_at,
                30,
                source_track_id,
                source_track_title,
                source_service.as_str().to_string(),
                core_key,
                payload_json,
            )?))
        })
        .await?
    }

    async fn lease_due(&self, batch: usize) -> Result<Vec<WorkItem>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || -> Result<Vec<WorkItem>> {
            let now = now_iso();
            let mut stmt = conn.prepare(
                "SELECT id, mapping_id, destination_service, action, status, attempts, last_error, \
                 next_attempt_at, backoff_seconds, source_track_id, source_track_title, \
                 source_service, core_payload, payload FROM sync_items \
                 WHERE status = 'pending' AND next_attempt_at <= ?1 \
                 ORDER BY id ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, batch as i64], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, i64>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, i64>(8)?,
                    r.get::<_, Option<String>>(9)?,
                    r.get::<_, Option<String>>(10)?,
                    r.get::<_, String>(11)?,
                    r.get::<_, String>(12)?,
                    r.get::<_, String>(13)?,
                ))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (
                    id,
                    mapping_id,
                    dest,
                    action,
                    status,
                    attempts,
                    last_error,
                    next_attempt_at,
                    backoff_seconds,
                    source_track_id,
                    source_track_title,
                    source_service,
                    core_payload,
                    payload,
                ) = r?;
                out.push(row_to_work_item(
                    id,
                    mapping_id,
                    dest,
                    action,
                    status,
                    attempts,
                    last_error,
                    next_attempt_at,
                    backoff_seconds,
                    source_track_id,
                    source_track_title,
                    source_service,
                    core_payload,
                    payload,
                )?);
            }
            Ok(out)
        })
        .await?
    }

    async fn mark_running(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let n = conn.execute(
                "UPDATE sync_items SET status = 'running' WHERE id = ?1 AND status = 'pending'",
                params![id],
            )?;
            Ok(n == 1)
        })
        .await?
    }

    async fn update_payload(&self, id: i64, payload: &WorkPayload) -> Result<()> {
        let conn = self.conn()?;
        let payload_json = serde_json::to_string(payload)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.execute(
                "UPDATE sync_items SET payload = ?1 WHERE id = ?2",
                params![payload_json, id],
            )?;
            Ok(())
        })
        .await?
    }

    async fn mark_done(&self, id: i64, attempts: i64) -> Result<()> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.execute(
                "UPDATE sync_items SET status = 'done', attempts = ?1, last_error = '' WHERE id = ?2",
                params![attempts, id],
            )?;
            Ok(())
        })
        .await?
    }

    async fn mark_retry(
        &self,
        id: i64,
        attempts: i64,
        backoff_seconds: i64,
        next_attempt_at: &str,
        last_error: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        let next = next_attempt_at.to_string();
        let err = last_error.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.execute(
                "UPDATE sync_items SET status = 'pending', attempts = ?1, backoff_seconds = ?2, \
                 next_attempt_at = ?3, last_error = ?4 WHERE id = ?5",
                params![attempts, backoff_seconds, next, err, id],
            )?;
            Ok(())
        })
        .await?
    }

    async fn mark_skipped(&self, id: i64, attempts: i64, last_error: &str) -> Result<()> {
        let conn = self.conn()?;
        let err = last_error.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.execute(
                "UPDATE sync_items SET status = 'skipped', attempts = ?1, last_error = ?2 WHERE id = ?3",
                params![attempts, err, id],
            )?;
            Ok(())
        })
        .await?
    }

    async fn queue_status_counts(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || -> Result<HashMap<String, i64>> {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM sync_items GROUP BY status")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
            let mut out = HashMap::new();
            for r in rows {
                let (status, count) = r?;
                out.insert(status, count);
            }
            Ok(out)
        })
        .await?
    }

    async fn blacklist_for(
        &self,
        mapping_id: i64,
        destination_service: Service,
    ) -> Result<Vec<BlacklistEntry>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || -> Result<Vec<BlacklistEntry>> {
            let mut stmt = conn.prepare(
                "SELECT id, mapping_id, destination_service, source_track_id, reason, \
                 skip_counter, last_skipped_at FROM blacklist \
                 WHERE destination_service = ?1 AND (mapping_id = ?2 OR mapping_id IS NULL)",
            )?;
            let rows = stmt.query_map(params![destination_service.as_str(), mapping_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, Option<i64>>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, i64>(5)?,
                    r.get::<_, String>(6)?,
                ))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (id, mapping_id, dest, track_id, reason, counter, last) = r?;
                out.push(BlacklistEntry {
                    id,
                    mapping_id,
                    destination_service: Service::parse(&dest)
                        .ok_or_else(|| anyhow!("bad destination_service"))?,
                    source_track_id: track_id,
                    reason: BlacklistReason::parse(&reason)
                        .ok_or_else(|| anyhow!("bad reason"))?,
                    skip_counter: counter,
                    last_skipped_at: last,
                });
            }
            Ok(out)
        })
        .await?
    }

    async fn upsert_blacklist(
        &self,
        mapping_id: Option<i64>,
        destination_service: Service,
        source_track_id: &str,
        reason: BlacklistReason,
    ) -> Result<()> {
        let conn = self.conn()?;
        let track_id = source_track_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let now = now_iso();
            conn.execute(
                "INSERT INTO blacklist (mapping_id, destination_service, source_track_id, reason, \
                 skip_counter, last_skipped_at) VALUES (?1, ?2, ?3, ?4, 1, ?5) \
                 ON CONFLICT (COALESCE(mapping_id, -1), destination_service, source_track_id) \
                 DO UPDATE SET reason = excluded.reason, skip_counter = skip_counter + 1, \
                 last_skipped_at = excluded.last_skipped_at",
                params![
                    mapping_id,
                    destination_service.as_str(),
                    track_id,
                    reason.as_str(),
                    now
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || -> Result<Vec<BlacklistEntry>> {
            let mut stmt = conn.prepare(
                "SELECT id, mapping_id, destination_service, source_track_id, reason, \
                 skip_counter, last_skipped_at FROM blacklist ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, Option<i64>>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, i64>(5)?,
                    r.get::<_, String>(6)?,
                ))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (id, mapping_id, dest, track_id, reason, counter, last) = r?;
                out.push(BlacklistEntry {
                    id,
                    mapping_id,
                    destination_service: Service::parse(&dest)
                        .ok_or_else(|| anyhow!("bad destination_service"))?,
                    source_track_id: track_id,
                    reason: BlacklistReason::parse(&reason)
                        .ok_or_else(|| anyhow!("bad reason"))?,
                    skip_counter: counter,
                    last_skipped_at: last,
                });
            }
            Ok(out)
        })
        .await?
    }

    async fn delete_blacklist(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.execute("DELETE FROM blacklist WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await?
    }

    async fn save_credential(
        &self,
        provider: &str,
        token_json: &str,
        client_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let provider = provider.to_string();
        let token_json = token_json.to_string();
        let client_id = client_id.map(|s| s.to_string());
        let client_secret = client_secret.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.execute(
                "INSERT INTO credentials (provider, token_json, client_id, client_secret, last_refreshed) \
                 VALUES (?1, ?2, ?3, ?4, strftime('%s','now')) \
                 ON CONFLICT(provider) DO UPDATE SET token_json = excluded.token_json, \
                 client_id = COALESCE(excluded.client_id, credentials.client_id), \
                 client_secret = COALESCE(excluded.client_secret, credentials.client_secret), \
                 last_refreshed = strftime('%s','now')",
                params![provider, token_json, client_id, client_secret],
            )?;
            Ok(())
        })
        .await?
    }

    async fn load_credential(
        &self,
        provider: &str,
    ) -> Result<Option<(String, Option<String>, Option<String>)>> {
        let conn = self.conn()?;
        let provider = provider.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<(String, Option<String>, Option<String>)>> {
            let row = conn
                .query_row(
                    "SELECT token_json, client_id, client_secret FROM credentials WHERE provider = ?1",
                    params![provider],
                    |r| {
                        Ok((
                            r.get::<_, Option<String>>(0)?.unwrap_or_default(),
                            r.get::<_, Option<String>>(1)?,
                            r.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    async fn record_activity(
        &self,
        level: ActivityLevel,
        message: &str,
        job_type: JobType,
        work_item_id: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let message: String = message.chars().take(1024).collect();
        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.execute(
                "INSERT INTO activity_logs (level, message, job_type, work_item_id) VALUES (?1, ?2, ?3, ?4)",
                params![level.as_str(), message, job_type.as_str(), work_item_id],
            )?;
            Ok(())
        })
        .await?
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::models::{ActivityLevel, JobType};

    #[tokio::test]
    async fn enqueue_dedup_skips_second_active_item() {
        let (_dir, store) = open_test_store();
        let mapping_id = {
            let conn = store.conn().unwrap();
            seed_mapping(&conn, "s1", "y1")
        };
        let core = CorePayload::AddTrack { source_track_id: "t1".into() };
        let first = store
            .enqueue_work_item(
                mapping_id,
                Service::Y,
                WorkAction::AddTrack,
                Service::S,
                Some("t1"),
                Some("Alpha"),
                core.clone(),
            )
            .await
            .unwrap();
        assert!(first.is_some());
        let second = store
            .enqueue_work_item(
                mapping_id,
                Service::Y,
                WorkAction::AddTrack,
                Service::S,
                Some("t1"),
                Some("Alpha"),
                core,
            )
            .await
            .unwrap();
        assert!(second.is_none());
        let active = store.active_work_items(mapping_id).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_allows_recreation_after_terminal_state() {
        let (_dir, store) = open_test_store();
        let mapping_id = {
            let conn = store.conn().unwrap();
            seed_mapping(&conn, "s1", "y1")
        };
        let core = CorePayload::AddTrack { source_track_id: "t1".into() };
        let item = store
            .enqueue_work_item(
                mapping_id,
                Service::Y,
                WorkAction::AddTrack,
                Service::S,
                Some("t1"),
                Some("Alpha"),
                core.clone(),
            )
            .await
            .unwrap()
            .unwrap();
        store.mark_done(item.id, 1).await.unwrap();
        let recreated = store
            .enqueue_work_item(
                mapping_id,
                Service::Y,
                WorkAction::AddTrack,
                Service::S,
                Some("t1"),
                Some("Alpha"),
                core,
            )
            .await
            .unwrap();
        assert!(recreated.is_some());
    }

    #[tokio::test]
    async fn lease_due_respects_next_attempt_at() {
        let (_dir, store) = open_test_store();
        let mapping_id = {
            let conn = store.conn().unwrap();
            seed_mapping(&conn, "s1", "y1")
        };
        let item = store
            .enqueue_work_item(
                mapping_id,
                Service::S,
                WorkAction::AddTrack,
                Service::Y,
                Some("t1"),
                Some("Alpha"),
                CorePayload::AddTrack { source_track_id: "t1".into() },
            )
            .await
            .unwrap()
            .unwrap();
        let due = store.lease_due(50).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, item.id);
    }

    #[tokio::test]
    async fn mark_running_is_an_interlock() {
        let (_dir, store) = open_test_store();
        let mapping_id = {
            let conn = store.conn().unwrap();
            seed_mapping(&conn, "s1", "y1")
        };
        let item = store
            .enqueue_work_item(
                mapping_id,
                Service::S,
                WorkAction::AddTrack,
                Service::Y,
                Some("t1"),
                Some("Alpha"),
                CorePayload::AddTrack { source_track_id: "t1".into() },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(store.mark_running(item.id).await.unwrap());
        // a second concurrent worker trying the same item must lose.
        assert!(!store.mark_running(item.id).await.unwrap());
    }

    #[tokio::test]
    async fn blacklist_upsert_increments_skip_counter() {
        let (_dir, store) = open_test_store();
        store
            .upsert_blacklist(Some(1), Service::S, "t1", BlacklistReason::NotFound)
            .await
            .unwrap();
        store
            .upsert_blacklist(Some(1), Service::S, "t1", BlacklistReason::Forbidden)
            .await
            .unwrap();
        let entries = store.list_blacklist().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].skip_counter, 2);
        assert_eq!(entries[0].reason, BlacklistReason::Forbidden);
    }

    #[tokio::test]
    async fn blacklist_for_includes_global_entries() {
        let (_dir, store) = open_test_store();
        store
            .upsert_blacklist(None, Service::S, "global1", BlacklistReason::Invalid)
            .await
            .unwrap();
        store
            .upsert_blacklist(Some(7), Service::S, "scoped1", BlacklistReason::Invalid)
            .await
            .unwrap();
        let visible = store.blacklist_for(7, Service::S).await.unwrap();
        let ids: Vec<&str> = visible.iter().map(|e| e.source_track_id.as_str()).collect();
        assert!(ids.contains(&"global1"));
        assert!(ids.contains(&"scoped1"));
    }

    #[tokio::test]
    async fn activity_log_is_append_only() {
        let (_dir, store) = open_test_store();
        store
            .record_activity(ActivityLevel::Info, "hello", JobType::System, None)
            .await
            .unwrap();
        store
            .record_activity(ActivityLevel::Error, "oops", JobType::Execution, Some(1))
            .await
            .unwrap();
        // no read API beyond counts is specified for this facade; verify via
        // queue_status_counts-adjacent behavior instead: writes don't error.
    }

    #[tokio::test]
    async fn credential_round_trip_preserves_client_id_on_token_refresh() {
        let (_dir, store) = open_test_store();
        store
            .save_credential("spotify", "{\"access_token\":\"a\"}", Some("cid"), Some("secret"))
            .await
            .unwrap();
        store
            .save_credential("spotify", "{\"access_token\":\"b\"}", None, None)
            .await
            .unwrap();
        let (token, client_id, client_secret) =
            store.load_credential("spotify").await.unwrap().unwrap();
        assert_eq!(token, "{\"access_token\":\"b\"}");
        assert_eq!(client_id.as_deref(), Some("cid"));
        assert_eq!(client_secret.as_deref(), Some("secret"));
    }
}

/// In-memory `Store` used by analyzer/executor unit tests where real SQL
/// semantics (constraints, persistence across restarts) aren't needed.
pub mod mem {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemState {
        mappings: Vec<Mapping>,
        items: Vec<WorkItem>,
        next_item_id: i64,
        blacklist: Vec<BlacklistEntry>,
        next_blacklist_id: i64,
        credentials: HashMap<String, (String, Option<String>, Option<String>)>,
        activity: Vec<(ActivityLevel, String, JobType, Option<i64>)>,
    }

    pub struct InMemoryStore {
        state: Mutex<MemState>,
    }

    impl InMemoryStore {
        pub fn new(mappings: Vec<Mapping>) -> Self {
            InMemoryStore {
                state: Mutex::new(MemState {
                    mappings,
                    next_item_id: 1,
                    next_blacklist_id: 1,
                    ..Default::default()
                }),
            }
        }

        pub fn activity_log(&self) -> Vec<(ActivityLevel, String, JobType, Option<i64>)> {
            self.state.lock().unwrap().activity.clone()
        }
    }

    #[async_trait]
    impl Store for InMemoryStore {
        async fn insert_mapping(
            &self,
            source_playlist_ref_s: &str,
            source_playlist_ref_y: &str,
            name_s: Option<&str>,
            name_y: Option<&str>,
            sync_name: bool,
            sync_tracks: bool,
            interval_minutes: i64,
        ) -> Result<i64> {
            let mut st = self.state.lock().unwrap();
            let id = st.mappings.iter().map(|m| m.id).max().unwrap_or(0) + 1;
            st.mappings.push(Mapping {
                id,
                source_playlist_ref_s: source_playlist_ref_s.to_string(),
                source_playlist_ref_y: source_playlist_ref_y.to_string(),
                name_s: name_s.map(|s| s.to_string()),
                name_y: name_y.map(|s| s.to_string()),
                sync_name,
                sync_tracks,
                interval_minutes,
                last_analysis_at: None,
                next_analysis_at: None,
            });
            Ok(id)
        }

        async fn list_mappings(&self) -> Result<Vec<Mapping>> {
            Ok(self.state.lock().unwrap().mappings.clone())
        }

        async fn get_mapping(&self, mapping_id: i64) -> Result<Mapping> {
            self.state
                .lock()
                .unwrap()
                .mappings
                .iter()
                .find(|m| m.id == mapping_id)
                .cloned()
                .ok_or(StoreError::MappingNotFound(mapping_id))
                .map_err(anyhow::Error::from)
        }

        async fn update_mapping_schedule(
            &self,
            mapping_id: i64,
            last_analysis_at: &str,
            next_analysis_at: &str,
        ) -> Result<()> {
            let mut st = self.state.lock().unwrap();
            if let Some(m) = st.mappings.iter_mut().find(|m| m.id == mapping_id) {
                m.last_analysis_at = Some(last_analysis_at.to_string());
                m.next_analysis_at = Some(next_analysis_at.to_string());
            }
            Ok(())
        }

        async fn active_work_items(&self, mapping_id: i64) -> Result<Vec<WorkItem>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .items
                .iter()
                .filter(|i| {
                    i.mapping_id == mapping_id
                        && matches!(i.status, WorkStatus::Pending | WorkStatus::Running)
                })
                .cloned()
                .collect())
        }

        async fn enqueue_work_item(
            &self,
            mapping_id: i64,
            destination_service: Service,
            action: WorkAction,
            source_service: Service,
            source_track_id: Option<&str>,
            source_track_title: Option<&str>,
            core: CorePayload,
        ) -> Result<Option<WorkItem>> {
            let mut st = self.state.lock().unwrap();
            let core_key = core.to_key();
            let dup = st.items.iter().any(|i| {
                i.mapping_id == mapping_id
                    && i.destination_service == destination_service
                    && i.action == action
                    && i.core_payload == core_key
                    && matches!(i.status, WorkStatus::Pending | WorkStatus::Running)
            });
            if dup {
                return Ok(None);
            }
            let id = st.next_item_id;
            st.next_item_id += 1;
            let item = WorkItem {
                id,
                mapping_id,
                destination_service,
                action,
                status: WorkStatus::Pending,
                attempts: 0,
                last_error: None,
                next_attempt_at: now_iso(),
                backoff_seconds: 30,
                source_track_id: source_track_id.map(|s| s.to_string()),
                source_track_title: source_track_title.map(|s| s.to_string()),
                source_service,
                core_payload: core_key,
                payload: WorkPayload {
                    core,
                    destination_track_id: None,
                    marker_nanos: std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_nanos())
                        .unwrap_or(0),
                },
            };
            st.items.push(item.clone());
            Ok(Some(item))
        }

        async fn lease_due(&self, batch: usize) -> Result<Vec<WorkItem>> {
            let st = self.state.lock().unwrap();
            let now = now_iso();
            Ok(st
                .items
                .iter()
                .filter(|i| i.status == WorkStatus::Pending && i.next_attempt_at <= now)
                .take(batch)
                .cloned()
                .collect())
        }

        async fn mark_running(&self, id: i64) -> Result<bool> {
            let mut st = self.state.lock().unwrap();
            if let Some(i) = st.items.iter_mut().find(|i| i.id == id) {
                if i.status == WorkStatus::Pending {
                    i.status = WorkStatus::Running;
                    return Ok(true);
                }
            }
            Ok(false)
        }

        async fn update_payload(&self, id: i64, payload: &WorkPayload) -> Result<()> {
            let mut st = self.state.lock().unwrap();
            if let Some(i) = st.items.iter_mut().find(|i| i.id == id) {
                i.payload = payload.clone();
            }
            Ok(())
        }

        async fn mark_done(&self, id: i64, attempts: i64) -> Result<()> {
            let mut st = self.state.lock().unwrap();
            if let Some(i) = st.items.iter_mut().find(|i| i.id == id) {
                i.status = WorkStatus::Done;
                i.attempts = attempts;
                i.last_error = Some(String::new());
            }
            Ok(())
        }

        async fn mark_retry(
            &self,
            id: i64,
            attempts: i64,
            backoff_seconds: i64,
            next_attempt_at: &str,
            last_error: &str,
        ) -> Result<()> {
            let mut st = self.state.lock().unwrap();
            if let Some(i) = st.items.iter_mut().find(|i| i.id == id) {
                i.status = WorkStatus::Pending;
                i.attempts = attempts;
                i.backoff_seconds = backoff_seconds;
                i.next_attempt_at = next_attempt_at.to_string();
                i.last_error = Some(last_error.to_string());
            }
            Ok(())
        }

        async fn mark_skipped(&self, id: i64, attempts: i64, last_error: &str) -> Result<()> {
            let mut st = self.state.lock().unwrap();
            if let Some(i) = st.items.iter_mut().find(|i| i.id == id) {
                i.status = WorkStatus::Skipped;
                i.attempts = attempts;
                i.last_error = Some(last_error.to_string());
            }
            Ok(())
        }

        async fn queue_status_counts(&self) -> Result<HashMap<String, i64>> {
            let st = self.state.lock().unwrap();
            let mut out = HashMap::new();
            for i in &st.items {
                *out.entry(i.status.as_str().to_string()).or_insert(0) += 1;
            }
            Ok(out)
        }

        async fn blacklist_for(
            &self,
            mapping_id: i64,
            destination_service: Service,
        ) -> Result<Vec<BlacklistEntry>> {
            let st = self.state.lock().unwrap();
            Ok(st
                .blacklist
                .iter()
                .filter(|b| {
                    b.destination_service == destination_service
                        && (b.mapping_id.is_none() || b.mapping_id == Some(mapping_id))
                })
                .cloned()
                .collect())
        }

        async fn upsert_blacklist(
            &self,
            mapping_id: Option<i64>,
            destination_service: Service,
            source_track_id: &str,
            reason: BlacklistReason,
        ) -> Result<()> {
            let mut st = self.state.lock().unwrap();
            if let Some(e) = st.blacklist.iter_mut().find(|e| {
                e.mapping_id == mapping_id
                    && e.destination_service == destination_service
                    && e.source_track_id == source_track_id
            }) {
                e.skip_counter += 1;
                e.reason = reason;
                e.last_skipped_at = now_iso();
            } else {
                let id = st.next_blacklist_id;
                st.next_blacklist_id += 1;
                st.blacklist.push(BlacklistEntry {
                    id,
                    mapping_id,
                    destination_service,
                    source_track_id: source_track_id.to_string(),
                    reason,
                    skip_counter: 1,
                    last_skipped_at: now_iso(),
                });
            }
            Ok(())
        }

        async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>> {
            Ok(self.state.lock().unwrap().blacklist.clone())
        }

        async fn delete_blacklist(&self, id: i64) -> Result<()> {
            self.state.lock().unwrap().blacklist.retain(|e| e.id != id);
            Ok(())
        }

        async fn save_credential(
            &self,
            provider: &str,
            token_json: &str,
            client_id: Option<&str>,
            client_secret: Option<&str>,
        ) -> Result<()> {
            self.state.lock().unwrap().credentials.insert(
                provider.to_string(),
                (
                    token_json.to_string(),
                    client_id.map(|s| s.to_string()),
                    client_secret.map(|s| s.to_string()),
                ),
            );
            Ok(())
        }

        async fn load_credential(
            &self,
            provider: &str,
        ) -> Result<Option<(String, Option<String>, Option<String>)>> {
            Ok(self.state.lock().unwrap().credentials.get(provider).cloned())
        }

        async fn record_activity(
            &self,
            level: ActivityLevel,
            message: &str,
            job_type: JobType,
            work_item_id: Option<i64>,
        ) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .activity
                .push((level, message.to_string(), job_type, work_item_id));
            Ok(())
        }
    }
}
