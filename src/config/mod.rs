use std::env;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// `DownloadModel` knob: `Chained` = at most one download per
/// server at a time; `Parallel` = sibling folders may download concurrently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadModel {
    Chained,
    Parallel,
}

impl Default for DownloadModel {
    fn default() -> Self {
        DownloadModel::Chained
    }
}

/// `deleteModel` knob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteModel {
    MoveToTrash,
    ImapDelete,
    DeleteNoTrash,
}

impl Default for DeleteModel {
    fn default() -> Self {
        DeleteModel::MoveToTrash
    }
}

/// Global auto-sync configuration. Loaded once at start from built-in
/// defaults overridable by `AUTOSYNC_*` env vars; no config file is
/// required.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Target bytes per FETCH batch. Default 50 KiB.
    pub group_size: u64,
    /// Max retries per batch. Default 3. Shared between the retry-on-failure
    /// path and the size-exceeded rollback path (`TryCurrentGroupAgain`).
    pub group_retry_count: u32,
    /// OS idle threshold in seconds. Default 30.
    pub idle_time_sec: u64,
    /// Periodic timer period. Default 1000ms.
    pub timer_interval: Duration,
    /// Discovery interval. Default 1 hour.
    pub auto_sync_frequency: Duration,
    /// Default update period when an account has none configured. Default 10 min.
    pub default_update_interval: Duration,
    /// `Chained` or `Parallel`.
    pub download_model: DownloadModel,
    /// Per-account age cutoff (days) for message exclusion; `<= 0` disables.
    pub offline_age_days_max: i64,
    /// Biff all folders, not just Inbox and marked. Default false.
    pub check_all_folders_for_new: bool,
    /// Keep IMAP-deleted messages visible. Default false.
    pub show_deleted_messages: bool,
    /// `MoveToTrash | ImapDelete | DeleteNoTrash`.
    pub delete_model: DeleteModel,
    /// First-pass size threshold for the message strategy.
    pub first_pass_size: u64,
    /// Header scan batch size for Discovery.
    pub discovery_batch_size: usize,
    /// Byte budget for the very first group dispatched on
    /// `NotifyDownloadQueueChanged`.
    pub first_group_size_limit: u64,
}

pub const DEFAULT_GROUP_SIZE: u64 = 50 * 1024;
pub const DEFAULT_GROUP_RETRY_COUNT: u32 = 3;
pub const DEFAULT_FIRST_PASS_SIZE: u64 = 300 * 1024;

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            group_size: DEFAULT_GROUP_SIZE,
            group_retry_count: DEFAULT_GROUP_RETRY_COUNT,
            idle_time_sec: 30,
            timer_interval: Duration::from_millis(1000),
            auto_sync_frequency: Duration::from_secs(3600),
            default_update_interval: Duration::from_secs(600),
            download_model: DownloadModel::Chained,
            offline_age_days_max: 0,
            check_all_folders_for_new: false,
            show_deleted_messages: false,
            delete_model: DeleteModel::MoveToTrash,
            first_pass_size: DEFAULT_FIRST_PASS_SIZE,
            discovery_batch_size: 100,
            first_group_size_limit: DEFAULT_GROUP_SIZE,
        }
    }
}

impl SyncConfig {
    /// Loads defaults, then overrides from `AUTOSYNC_*` env vars.
    pub fn load() -> Result<Self> {
        let mut cfg = SyncConfig::default();

        if let Some(v) = env_u64("AUTOSYNC_GROUP_SIZE") {
            cfg.group_size = v;
        }
        if let Some(v) = env_u32("AUTOSYNC_GROUP_RETRY_COUNT") {
            cfg.group_retry_count = v;
        }
        if let Some(v) = env_u64("AUTOSYNC_IDLE_TIME_SEC") {
            cfg.idle_time_sec = v;
        }
        if let Some(v) = env_u64("AUTOSYNC_TIMER_INTERVAL_MS") {
            cfg.timer_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("AUTOSYNC_FREQUENCY_SEC") {
            cfg.auto_sync_frequency = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("AUTOSYNC_DEFAULT_UPDATE_INTERVAL_SEC") {
            cfg.default_update_interval = Duration::from_secs(v);
        }
        if let Ok(v) = env::var("AUTOSYNC_DOWNLOAD_MODEL") {
            cfg.download_model = match v.to_ascii_lowercase().as_str() {
                "parallel" => DownloadModel::Parallel,
                _ => DownloadModel::Chained,
            };
        }
        if let Some(v) = env::var("AUTOSYNC_OFFLINE_AGE_DAYS_MAX")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
        {
            cfg.offline_age_days_max = v;
        }
        if let Ok(v) = env::var("AUTOSYNC_CHECK_ALL_FOLDERS_FOR_NEW") {
            cfg.check_all_folders_for_new = is_truthy(&v);
        }
        if let Ok(v) = env::var("AUTOSYNC_SHOW_DELETED_MESSAGES") {
            cfg.show_deleted_messages = is_truthy(&v);
        }
        if let Ok(v) = env::var("AUTOSYNC_DELETE_MODEL") {
            cfg.delete_model = match v.to_ascii_lowercase().as_str() {
                "imapdelete" => DeleteModel::ImapDelete,
                "deletenotrash" => DeleteModel::DeleteNoTrash,
                _ => DeleteModel::MoveToTrash,
            };
        }
        if let Some(v) = env_u64("AUTOSYNC_FIRST_PASS_SIZE") {
            cfg.first_pass_size = v;
        }

        Ok(cfg)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    env::var(name).ok().and_then(|s| s.parse::<u32>().ok())
}

fn is_truthy(s: &str) -> bool {
    s == "1" || s.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.group_size, 50 * 1024);
        assert_eq!(cfg.group_retry_count, 3);
        assert_eq!(cfg.idle_time_sec, 30);
        assert_eq!(cfg.timer_interval, Duration::from_millis(1000));
        assert_eq!(cfg.auto_sync_frequency, Duration::from_secs(3600));
        assert_eq!(cfg.default_update_interval, Duration::from_secs(600));
        assert_eq!(cfg.download_model, DownloadModel::Chained);
        assert_eq!(cfg.offline_age_days_max, 0);
    }
}
