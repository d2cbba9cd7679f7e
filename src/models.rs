use serde::{Deserialize, Serialize};

/// Which remote service a row or work item refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    S,
    Y,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::S => "s",
            Service::Y => "y",
        }
    }

    pub fn opposite(&self) -> Service {
        match self {
            Service::S => Service::Y,
            Service::Y => Service::S,
        }
    }

    pub fn parse(s: &str) -> Option<Service> {
        match s {
            "s" => Some(Service::S),
            "y" => Some(Service::Y),
            _ => None,
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub id: i64,
    pub source_playlist_ref_s: String,
    pub source_playlist_ref_y: String,
    pub name_s: Option<String>,
    pub name_y: Option<String>,
    pub sync_name: bool,
    pub sync_tracks: bool,
    pub interval_minutes: i64,
    pub last_analysis_at: Option<String>,
    pub next_analysis_at: Option<String>,
}

impl Mapping {
    /// Boundary behavior: `interval_minutes = 0` (or a negative, malformed
    /// value) defaults to 60.
    pub fn effective_interval_minutes(&self) -> i64 {
        if self.interval_minutes <= 0 {
            60
        } else {
            self.interval_minutes
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkAction {
    AddTrack,
    RenamePlaylist,
}

impl WorkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkAction::AddTrack => "add_track",
            WorkAction::RenamePlaylist => "rename_playlist",
        }
    }

    pub fn parse(s: &str) -> Option<WorkAction> {
        match s {
            "add_track" => Some(WorkAction::AddTrack),
            "rename_playlist" => Some(WorkAction::RenamePlaylist),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkStatus {
    Pending,
    Running,
    Done,
    Error,
    Skipped,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Running => "running",
            WorkStatus::Done => "done",
            WorkStatus::Error => "error",
            WorkStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<WorkStatus> {
        match s {
            "pending" => Some(WorkStatus::Pending),
            "running" => Some(WorkStatus::Running),
            "done" => Some(WorkStatus::Done),
            "error" => Some(WorkStatus::Error),
            "skipped" => Some(WorkStatus::Skipped),
            _ => None,
        }
    }
}

/// `core_payload` as stored/compared for dedup: the intrinsic key of the
/// work, independent of any resolution state (e.g. `destination_track_id`)
/// the executor later attaches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum CorePayload {
    AddTrack { source_track_id: String },
    RenamePlaylist { new_name: String },
}

impl CorePayload {
    pub fn to_key(&self) -> String {
        // Stable, order-independent string used both for the application-level
        // dedup scan and as the value stored in the partial-unique SQL index.
        serde_json::to_string(self).expect("CorePayload serializes")
    }
}

/// Full payload stored alongside a work item: the core payload plus whatever
/// the executor has resolved so far, plus a uniqueness marker so that two
/// rows sharing the same core payload (one terminal, one freshly enqueued)
/// never collide on the full JSON blob itself (only the partial index on
/// `core_payload` is meant to constrain active rows).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPayload {
    #[serde(flatten)]
    pub core: CorePayload,
    pub destination_track_id: Option<String>,
    /// Nanosecond-resolution marker making every inserted row's `payload`
    /// column distinct.
    pub marker_nanos: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub mapping_id: i64,
    pub destination_service: Service,
    pub action: WorkAction,
    pub status: WorkStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_attempt_at: String,
    pub backoff_seconds: i64,
    pub source_track_id: Option<String>,
    pub source_track_title: Option<String>,
    pub source_service: Service,
    pub core_payload: String,
    pub payload: WorkPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlacklistReason {
    NotFound,
    Forbidden,
    Unauthorized,
    Invalid,
    SearchFailed,
    Error,
}

impl BlacklistReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlacklistReason::NotFound => "not_found",
            BlacklistReason::Forbidden => "forbidden",
            BlacklistReason::Unauthorized => "unauthorized",
            BlacklistReason::Invalid => "invalid",
            BlacklistReason::SearchFailed => "search_failed",
            BlacklistReason::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<BlacklistReason> {
        match s {
            "not_found" => Some(BlacklistReason::NotFound),
            "forbidden" => Some(BlacklistReason::Forbidden),
            "unauthorized" => Some(BlacklistReason::Unauthorized),
            "invalid" => Some(BlacklistReason::Invalid),
            "search_failed" => Some(BlacklistReason::SearchFailed),
            "error" => Some(BlacklistReason::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub id: i64,
    /// `None` means a global entry (applies across mappings).
    pub mapping_id: Option<i64>,
    pub destination_service: Service,
    pub source_track_id: String,
    pub reason: BlacklistReason,
    pub skip_counter: i64,
    pub last_skipped_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityLevel {
    Info,
    Warn,
    Error,
}

impl ActivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLevel::Info => "info",
            ActivityLevel::Warn => "warn",
            ActivityLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    Analysis,
    Execution,
    System,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Analysis => "analysis",
            JobType::Execution => "execution",
            JobType::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: i64,
    pub level: ActivityLevel,
    pub message: String,
    pub job_type: JobType,
    pub work_item_id: Option<i64>,
    pub created_at: String,
}

/// A single remote track as returned by a playlist listing: native id plus
/// display title. IDs are never comparable across services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_zero_defaults_to_sixty() {
        let m = Mapping {
            id: 1,
            source_playlist_ref_s: "s1".into(),
            source_playlist_ref_y: "y1".into(),
            name_s: None,
            name_y: None,
            sync_name: false,
            sync_tracks: true,
            interval_minutes: 0,
            last_analysis_at: None,
            next_analysis_at: None,
        };
        assert_eq!(m.effective_interval_minutes(), 60);
    }

    #[test]
    fn core_payload_key_is_stable_for_equal_values() {
        let a = CorePayload::AddTrack { source_track_id: "abc".into() };
        let b = CorePayload::AddTrack { source_track_id: "abc".into() };
        assert_eq!(a.to_key(), b.to_key());
        let c = CorePayload::AddTrack { source_track_id: "def".into() };
        assert_ne!(a.to_key(), c.to_key());
    }
}
