use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_analyzer_interval_sec")]
    pub analyzer_interval_sec: u64,
    #[serde(default = "default_executor_interval_sec")]
    pub executor_interval_sec: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_youtube_daily_quota")]
    pub youtube_daily_quota: i64,
    #[serde(default = "default_youtube_add_track_cost")]
    pub youtube_add_track_cost: i64,
    #[serde(default = "default_youtube_rename_cost")]
    pub youtube_rename_cost: i64,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Wall-clock budget for a single Activity Sink write.
    #[serde(default = "default_sink_timeout_ms")]
    pub sink_timeout_ms: u64,
}

fn default_analyzer_interval_sec() -> u64 { 60 }
fn default_executor_interval_sec() -> u64 { 60 }
fn default_batch_size() -> usize { 50 }
fn default_max_concurrency() -> usize { 5 }
fn default_youtube_daily_quota() -> i64 { 10_000 }
fn default_youtube_add_track_cost() -> i64 { 50 }
fn default_youtube_rename_cost() -> i64 { 1 }
fn default_db_path() -> PathBuf { "/var/lib/music-sync/reconcile.db".into() }
fn default_log_dir() -> PathBuf { "/var/log/music-sync".into() }
fn default_sink_timeout_ms() -> u64 { 5_000 }

impl Default for Config {
    fn default() -> Self {
        Config {
            analyzer_interval_sec: default_analyzer_interval_sec(),
            executor_interval_sec: default_executor_interval_sec(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            youtube_daily_quota: default_youtube_daily_quota(),
            youtube_add_track_cost: default_youtube_add_track_cost(),
            youtube_rename_cost: default_youtube_rename_cost(),
            db_path: default_db_path(),
            log_dir: default_log_dir(),
            sink_timeout_ms: default_sink_timeout_ms(),
        }
    }
}

impl Config {
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_all_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.max_concurrency, 5);
        assert_eq!(cfg.youtube_daily_quota, 10_000);
        assert_eq!(cfg.youtube_add_track_cost, 50);
    }

    #[test]
    fn overrides_take_effect() {
        let toml = r#"
            batch_size = 10
            max_concurrency = 2
            youtube_daily_quota = 500
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.max_concurrency, 2);
        assert_eq!(cfg.youtube_daily_quota, 500);
        // untouched fields keep defaults
        assert_eq!(cfg.youtube_add_track_cost, 50);
    }
}
