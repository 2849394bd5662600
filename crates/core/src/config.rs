use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;
use crate::types::ReprocessPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default = "default_sync_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    /// Explicit HTTP proxy for the sync endpoint. `None` follows HTTPS_PROXY.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_sync_timeout")]
    pub timeout_secs: u64,
}

fn default_sync_url() -> String {
    "https://app.pricespy.ai/api/aimatch/sync".to_string()
}

fn default_sync_timeout() -> u64 {
    60
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: default_sync_url(),
            token: String::new(),
            proxy: None,
            timeout_secs: default_sync_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// "chrome" or "edge".
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_chat_url")]
    pub chat_url: String,
    #[serde(default = "default_headed")]
    pub headed: bool,
    /// Overrides `<base>/browser/profile`.
    #[serde(default)]
    pub profile_dir: Option<String>,
    #[serde(default = "default_input_selector")]
    pub input_selector: String,
    #[serde(default = "default_deep_analysis_label")]
    pub deep_analysis_label: String,
    #[serde(default = "default_quota_notice")]
    pub quota_notice: String,
}

fn default_engine() -> String {
    "chrome".to_string()
}

fn default_chat_url() -> String {
    "https://x.com/i/grok/".to_string()
}

fn default_headed() -> bool {
    true
}

fn default_input_selector() -> String {
    "textarea[placeholder='Ask anything']".to_string()
}

fn default_deep_analysis_label() -> String {
    "DeepSearch".to_string()
}

fn default_quota_notice() -> String {
    "You've reached your limit of 30 Grok DeepSearch questions per 2 hours for now. Please check back later to continue.".to_string()
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            chat_url: default_chat_url(),
            headed: default_headed(),
            profile_dir: None,
            input_selector: default_input_selector(),
            deep_analysis_label: default_deep_analysis_label(),
            quota_notice: default_quota_notice(),
        }
    }
}

/// Waits and timeouts of the comparison protocol, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolConfig {
    #[serde(default = "default_input_timeout")]
    pub input_timeout_secs: u64,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_trigger_timeout")]
    pub trigger_timeout_secs: u64,
    #[serde(default = "default_quota_probe")]
    pub quota_probe_secs: u64,
    #[serde(default = "default_analysis_budget")]
    pub analysis_budget_secs: u64,
    #[serde(default = "default_analysis_min")]
    pub analysis_min_secs: u64,
    #[serde(default = "default_analysis_poll")]
    pub analysis_poll_secs: u64,
    #[serde(default = "default_followup_settle")]
    pub followup_settle_secs: u64,
    #[serde(default = "default_verdict_budget")]
    pub verdict_budget_secs: u64,
    #[serde(default = "default_marker_probe")]
    pub marker_probe_secs: u64,
    #[serde(default = "default_input_delay_min")]
    pub input_delay_min_secs: u64,
    #[serde(default = "default_input_delay_max")]
    pub input_delay_max_secs: u64,
    #[serde(default = "default_cooldown")]
    pub default_cooldown_secs: u64,
}

fn default_input_timeout() -> u64 {
    20
}

fn default_recovery_timeout() -> u64 {
    40
}

fn default_trigger_timeout() -> u64 {
    20
}

fn default_quota_probe() -> u64 {
    3
}

fn default_analysis_budget() -> u64 {
    126 // 2.1 minutes
}

fn default_analysis_min() -> u64 {
    30
}

fn default_analysis_poll() -> u64 {
    10
}

fn default_followup_settle() -> u64 {
    5
}

fn default_verdict_budget() -> u64 {
    9
}

fn default_marker_probe() -> u64 {
    2
}

fn default_input_delay_min() -> u64 {
    1
}

fn default_input_delay_max() -> u64 {
    5
}

fn default_cooldown() -> u64 {
    2 * 60 * 60
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            input_timeout_secs: default_input_timeout(),
            recovery_timeout_secs: default_recovery_timeout(),
            trigger_timeout_secs: default_trigger_timeout(),
            quota_probe_secs: default_quota_probe(),
            analysis_budget_secs: default_analysis_budget(),
            analysis_min_secs: default_analysis_min(),
            analysis_poll_secs: default_analysis_poll(),
            followup_settle_secs: default_followup_settle(),
            verdict_budget_secs: default_verdict_budget(),
            marker_probe_secs: default_marker_probe(),
            input_delay_min_secs: default_input_delay_min(),
            input_delay_max_secs: default_input_delay_max(),
            default_cooldown_secs: default_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Overrides `<base>/ai_queue.db`.
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub reprocess: ReprocessPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLoopConfig {
    #[serde(default = "default_idle")]
    pub idle_secs: u64,
    #[serde(default = "default_error_penalty")]
    pub error_penalty_secs: u64,
    #[serde(default = "default_session_restart")]
    pub session_restart_secs: u64,
}

fn default_idle() -> u64 {
    10 * 60
}

fn default_error_penalty() -> u64 {
    60
}

fn default_session_restart() -> u64 {
    30
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_idle(),
            error_penalty_secs: default_error_penalty(),
            session_restart_secs: default_session_restart(),
        }
    }
}

impl RunLoopConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn error_penalty(&self) -> Duration {
        Duration::from_secs(self.error_penalty_secs)
    }

    pub fn session_restart(&self) -> Duration {
        Duration::from_secs(self.session_restart_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub run_loop: RunLoopConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load the config file if present, then apply environment overrides.
    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `AIMATCH_SYNC_TOKEN` (or the older `SYNC_TOKEN`) and `AIMATCH_SYNC_URL`
    /// take precedence over the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup("AIMATCH_SYNC_TOKEN")
            .or_else(|| lookup("SYNC_TOKEN"))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if let Some(token) = token {
            self.sync.token = token;
        }
        if let Some(url) = lookup("AIMATCH_SYNC_URL").filter(|u| !u.trim().is_empty()) {
            self.sync.url = url.trim().to_string();
        }
    }

    /// Fails when the run loop cannot talk to the server.
    pub fn validate_for_run(&self) -> Result<()> {
        if self.sync.token.trim().is_empty() {
            return Err(Error::Config(
                "sync token is empty (set sync.token or AIMATCH_SYNC_TOKEN)".to_string(),
            ));
        }
        if !self.sync.url.starts_with("http://") && !self.sync.url.starts_with("https://") {
            return Err(Error::Config(format!("sync url is not http(s): {}", self.sync.url)));
        }
        if self.protocol.analysis_poll_secs == 0 {
            return Err(Error::Config(
                "protocol.analysisPollSecs must be at least 1".to_string(),
            ));
        }
        if self.protocol.input_delay_min_secs > self.protocol.input_delay_max_secs {
            return Err(Error::Config(
                "protocol.inputDelayMinSecs exceeds inputDelayMaxSecs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn queue_db_path(&self, paths: &Paths) -> PathBuf {
        self.queue
            .db_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.queue_db())
    }

    pub fn profile_dir(&self, paths: &Paths) -> PathBuf {
        self.browser
            .profile_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.browser_profile_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_config_uses_defaults() {
        let raw = r#"{
  "sync": { "token": "abc" },
  "queue": { "reprocess": "retryUnresolved" }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.sync.token, "abc");
        assert_eq!(cfg.sync.url, "https://app.pricespy.ai/api/aimatch/sync");
        assert_eq!(cfg.queue.reprocess, ReprocessPolicy::RetryUnresolved);
        assert_eq!(cfg.protocol.analysis_budget_secs, 126);
        assert_eq!(cfg.run_loop.idle_secs, 600);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [("SYNC_TOKEN", " legacy "), ("AIMATCH_SYNC_URL", "http://localhost:9000/sync")]
            .into_iter()
            .collect();
        let mut cfg = Config::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.sync.token, "legacy");
        assert_eq!(cfg.sync.url, "http://localhost:9000/sync");

        let env: HashMap<&str, &str> = [("SYNC_TOKEN", "old"), ("AIMATCH_SYNC_TOKEN", "new")]
            .into_iter()
            .collect();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.sync.token, "new");
    }

    #[test]
    fn test_validate_for_run() {
        let mut cfg = Config::default();
        assert!(matches!(cfg.validate_for_run(), Err(Error::Config(_))));
        cfg.sync.token = "t".to_string();
        assert!(cfg.validate_for_run().is_ok());
        cfg.sync.url = "ftp://nope".to_string();
        assert!(cfg.validate_for_run().is_err());
    }

    #[test]
    fn test_zero_analysis_poll_is_rejected() {
        let mut cfg = Config::default();
        cfg.sync.token = "t".to_string();
        cfg.protocol.analysis_poll_secs = 0;
        let err = cfg.validate_for_run().unwrap_err();
        assert!(err.to_string().contains("analysisPollSecs"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = Config::default();
        cfg.browser.headed = false;
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert!(!loaded.browser.headed);
    }
}
