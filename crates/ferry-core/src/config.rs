//! Service configuration, read from a TOML file.
//!
//! Every section has defaults, so an empty file (or no file) is a valid
//! configuration for a single-host setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{DEFAULT_SHARE, JobState, Owner};
use crate::error::FerryError;
use crate::ports::HookAction;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the `job.<id>.<suffix>` records.
    pub control_dir: PathBuf,
    pub staging: StagingConfig,
    pub limits: LimitsConfig,
    pub shares: SharesConfig,
    pub retention: RetentionConfig,
    pub transfer: TransferConfig,
    pub hooks: Vec<HookConfig>,
    /// Local accounts allowed to own jobs. Empty accepts every owner.
    pub users: Vec<UserConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_dir: PathBuf::from("/var/spool/ferry/control"),
            staging: StagingConfig::default(),
            limits: LimitsConfig::default(),
            shares: SharesConfig::default(),
            retention: RetentionConfig::default(),
            transfer: TransferConfig::default(),
            hooks: Vec::new(),
            users: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, FerryError> {
        let text = std::fs::read_to_string(path).map_err(|e| FerryError::io(path, e))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, FerryError> {
        let config: Config =
            toml::from_str(text).map_err(|e| FerryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FerryError> {
        if self.staging.max_retries == 0 {
            return Err(FerryError::Config(
                "staging.max_retries must be at least 1".to_string(),
            ));
        }
        if self.transfer.slots == 0 {
            return Err(FerryError::Config(
                "transfer.slots must be at least 1".to_string(),
            ));
        }
        let limited: u32 = self.shares.limited_shares.values().sum();
        if self.limits.max_processing > 0 && limited > self.limits.max_processing {
            return Err(FerryError::Config(format!(
                "limited share quotas ({limited}) exceed limits.max_processing ({})",
                self.limits.max_processing
            )));
        }
        let mut seen = Vec::new();
        for hook in &self.hooks {
            if hook.command.trim().is_empty() {
                return Err(FerryError::Config(format!(
                    "hook for {} has an empty command",
                    hook.state
                )));
            }
            if seen.contains(&hook.state) {
                return Err(FerryError::Config(format!(
                    "more than one hook for {}",
                    hook.state
                )));
            }
            seen.push(hook.state);
        }
        Ok(())
    }

    /// Whether jobs of this owner can be staged at all.
    pub fn knows_owner(&self, owner: &Owner) -> bool {
        self.users.is_empty() || self.users.iter().any(|u| u.uid == owner.uid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Retry budget of a staging stage.
    pub max_retries: u32,
    /// Base unit of the back-off between stage retries.
    pub retry_base_secs: u64,
    /// Tries of a single transfer before it fails for good.
    pub transfer_tries: u32,
    /// How long the user gets to upload user-managed inputs.
    pub user_upload_timeout_secs: u64,
    /// Time box for handling received jobs in one worker iteration.
    pub job_batch_millis: u64,
    /// Sleep between worker iterations.
    pub poll_interval_millis: u64,
    /// Compare locator options in written order instead of sorted.
    pub strict_option_order: bool,
    /// Fixed seed for the back-off jitter; entropy when unset.
    pub retry_seed: Option<u64>,
    /// Longest wait between two scheduling passes.
    pub wakeup_period_secs: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_base_secs: 10,
            transfer_tries: 3,
            user_upload_timeout_secs: 600,
            job_batch_millis: 500,
            poll_interval_millis: 50,
            strict_option_order: false,
            retry_seed: None,
            wakeup_period_secs: 60,
        }
    }
}

impl StagingConfig {
    pub fn user_upload_timeout(&self) -> Duration {
        Duration::from_secs(self.user_upload_timeout_secs)
    }

    pub fn job_batch(&self) -> Duration {
        Duration::from_millis(self.job_batch_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn wakeup_period(&self) -> Duration {
        Duration::from_secs(self.wakeup_period_secs)
    }
}

/// Admission limits. Zero means unlimited everywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Jobs held in memory at once.
    pub max_jobs: u32,
    /// Jobs in SUBMITTING / IN_BATCH_SYSTEM / CANCELING.
    pub max_jobs_running: u32,
    /// Jobs in PREPARING + FINISHING.
    pub max_processing: u32,
    /// Extra staging slots one direction may use while the other is saturated.
    pub max_processing_emergency: u32,
    /// Staging jobs per owner identity.
    pub max_processing_per_owner: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_jobs: 0,
            max_jobs_running: 0,
            max_processing: 10,
            max_processing_emergency: 1,
            max_processing_per_owner: 0,
        }
    }
}

/// Owner attribute a transfer share is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareType {
    /// Every job lands in the default share.
    #[default]
    None,
    Dn,
    Vo,
    Uid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharesConfig {
    pub share_type: ShareType,
    /// Ceiling of an unprivileged share; 0 means the global limit.
    pub max_per_share: u32,
    /// Privileged shares with fixed quotas.
    pub limited_shares: BTreeMap<String, u32>,
}

impl Default for SharesConfig {
    fn default() -> Self {
        Self {
            share_type: ShareType::None,
            max_per_share: 10,
            limited_shares: BTreeMap::new(),
        }
    }
}

impl SharesConfig {
    pub fn share_for(&self, owner: &Owner) -> String {
        let key = match self.share_type {
            ShareType::None => None,
            ShareType::Dn => Some(owner.identity.clone()),
            ShareType::Vo => owner.vo.clone(),
            ShareType::Uid => Some(owner.uid.to_string()),
        };
        key.filter(|k| !k.is_empty())
            .unwrap_or_else(|| DEFAULT_SHARE.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub keep_finished_secs: u64,
    pub keep_deleted_secs: u64,
    /// Drop FINISHED jobs completely instead of keeping a DELETED trace.
    pub purge_finished: bool,
    pub max_reruns: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_finished_secs: 7 * 24 * 3600,
            keep_deleted_secs: 30 * 24 * 3600,
            purge_finished: false,
            max_reruns: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlMapping {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Concurrent transfers.
    pub slots: usize,
    /// Extra slots for high-priority transfers.
    pub emergency_slots: usize,
    /// Priority at or above which emergency slots may be used.
    pub emergency_priority: u8,
    /// Pause between two tries of the same transfer.
    pub retry_delay_millis: u64,
    pub cache_dirs: Vec<PathBuf>,
    /// Source prefix rewrites, first match wins.
    pub url_map: Vec<UrlMapping>,
    /// Dump of in-flight transfers, read back after a crash.
    pub dump_file: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            slots: 10,
            emergency_slots: 1,
            emergency_priority: 90,
            retry_delay_millis: 200,
            cache_dirs: Vec::new(),
            url_map: Vec::new(),
            dump_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// State whose entry triggers the hook.
    pub state: JobState,
    /// Shell command; `%I` is replaced by the job id, `%S` by the state.
    pub command: String,
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "HookAction::pass")]
    pub on_success: HookAction,
    #[serde(default = "HookAction::fail")]
    pub on_failure: HookAction,
    #[serde(default = "HookAction::fail")]
    pub on_timeout: HookAction,
}

fn default_hook_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub uid: u32,
    #[serde(default)]
    pub name: Option<String>,
}
