//! Activity Sink: append-only event log written from the Analyzer and
//! Executor at phase boundaries and on errors. Writes are best-effort: a
//! failing or slow sink must never hold up the engine.

use crate::models::{ActivityLevel, JobType};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct ActivitySink {
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl ActivitySink {
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        ActivitySink { store, timeout }
    }

    pub async fn record(&self, level: ActivityLevel, message: &str, job_type: JobType, work_item_id: Option<i64>) {
        let fut = self.store.record_activity(level, message, job_type, work_item_id);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "activity sink write failed"),
            Err(_) => warn!(timeout_ms = self.timeout.as_millis() as u64, "activity sink write timed out"),
        }
    }
}
