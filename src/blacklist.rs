//! Blacklist: memoized failure records that stop the Analyzer from
//! re-enqueueing tracks the Executor has already given up on.

use crate::models::{BlacklistReason, Service};
use crate::store::Store;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

pub struct Blacklist {
    store: Arc<dyn Store>,
}

impl Blacklist {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Blacklist { store }
    }

    /// Drop any candidate id already blacklisted for this mapping and
    /// destination service (scoped entries plus global ones). Lookup
    /// failures are fail-open: log and return the candidates unfiltered,
    /// since the cost of one redundant attempt is bounded.
    pub async fn filter(
        &self,
        mapping_id: i64,
        destination_service: Service,
        candidates: Vec<String>,
    ) -> Vec<String> {
        match self.store.blacklist_for(mapping_id, destination_service).await {
            Ok(entries) => {
                let blocked: HashSet<&str> =
                    entries.iter().map(|e| e.source_track_id.as_str()).collect();
                candidates.into_iter().filter(|c| !blocked.contains(c.as_str())).collect()
            }
            Err(e) => {
                warn!(error = %e, "blacklist lookup failed, failing open");
                candidates
            }
        }
    }

    pub async fn record(
        &self,
        mapping_id: i64,
        destination_service: Service,
        source_track_id: &str,
        reason: BlacklistReason,
    ) -> anyhow::Result<()> {
        self.store
            .upsert_blacklist(Some(mapping_id), destination_service, source_track_id, reason)
            .await
    }
}
