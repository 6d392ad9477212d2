use crate::error::{Result, WatchdogError};
use crate::models::{HashAlgorithm, Severity};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelSettings {
    Console,
    Telegram {
        bot_token: String,
        chat_id: String,
    },
    Email {
        to: String,
        #[serde(default)]
        from: Option<String>,
        #[serde(default = "default_sendmail")]
        sendmail: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSettings {
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelSettings>,
    #[serde(default)]
    pub min_severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSettings {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceSettings {
    pub workers: usize,
    pub recovery_delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSettings {
    pub max_alerts: usize,
    pub max_scan_history: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub baseline_path: Option<PathBuf>,
    #[serde(default)]
    pub keys_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogSettings {
    /// Default algorithm; verification compares this digest
    pub hash_algorithm: HashAlgorithm,
    /// Every digest recorded per file at scan time
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<HashAlgorithm>,
    pub monitored_dirs: Vec<PathBuf>,
    /// Extension filters such as ".conf"; empty matches every file
    #[serde(default)]
    pub file_types: Vec<String>,
    /// Poll interval in seconds
    pub check_interval: u64,
    #[serde(default)]
    pub signatures: SignatureSettings,
    #[serde(default)]
    pub alerting: AlertSettings,
    #[serde(default)]
    pub performance: PerformanceSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

fn default_algorithms() -> Vec<HashAlgorithm> {
    HashAlgorithm::ALL.to_vec()
}

fn default_channels() -> Vec<ChannelSettings> {
    vec![ChannelSettings::Console]
}

fn default_sendmail() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}

impl Default for SignatureSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            min_severity: Severity::Low,
        }
    }
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            recovery_delay_secs: 60,
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_alerts: 1000,
            max_scan_history: 100,
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::Sha256,
            algorithms: default_algorithms(),
            monitored_dirs: vec![],
            file_types: vec![],
            check_interval: 300,
            signatures: SignatureSettings::default(),
            alerting: AlertSettings::default(),
            performance: PerformanceSettings::default(),
            retention: RetentionSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl WatchdogSettings {
    /// Load settings from a JSON file. A missing file yields defaults; a
    /// malformed or invalid one is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no settings file; using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|e| WatchdogError::file(path, e))?;
        let mut settings: Self = serde_json::from_str(&data)
            .map_err(|e| WatchdogError::Config(format!("{}: {e}", path.display())))?;
        settings.normalize();
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WatchdogError::file(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| WatchdogError::file(path, e))
    }

    /// Ensure the default algorithm is among the recorded ones, drop
    /// duplicates, and trim extension filters.
    pub fn normalize(&mut self) {
        if !self.algorithms.contains(&self.hash_algorithm) {
            self.algorithms.insert(0, self.hash_algorithm);
        }
        let mut seen = Vec::with_capacity(self.algorithms.len());
        self.algorithms.retain(|a| {
            if seen.contains(a) {
                false
            } else {
                seen.push(*a);
                true
            }
        });
        for ext in &mut self.file_types {
            *ext = ext.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_interval == 0 {
            return Err(WatchdogError::Config(
                "check_interval must be at least 1 second".into(),
            ));
        }
        if self.performance.workers == 0 {
            return Err(WatchdogError::Config("workers must be at least 1".into()));
        }
        if !self.algorithms.contains(&self.hash_algorithm) {
            return Err(WatchdogError::Config(format!(
                "algorithms must include the default algorithm {}",
                self.hash_algorithm
            )));
        }
        for ext in &self.file_types {
            if ext.is_empty() || !ext.starts_with('.') {
                return Err(WatchdogError::Config(format!(
                    "file type filter {ext:?} must start with '.'"
                )));
            }
        }
        for channel in &self.alerting.channels {
            match channel {
                ChannelSettings::Console => {}
                ChannelSettings::Telegram { bot_token, chat_id } => {
                    if bot_token.trim().is_empty() || chat_id.trim().is_empty() {
                        return Err(WatchdogError::Config(
                            "telegram channel needs bot_token and chat_id".into(),
                        ));
                    }
                }
                ChannelSettings::Email { to, .. } => {
                    if !to.contains('@') {
                        return Err(WatchdogError::Config(format!(
                            "email channel recipient {to:?} is not an address"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_secs(self.performance.recovery_delay_secs)
    }

    pub fn baseline_path(&self) -> Result<PathBuf> {
        match &self.storage.baseline_path {
            Some(p) => Ok(p.clone()),
            None => paths::baseline_path(),
        }
    }

    pub fn keys_dir(&self) -> Result<PathBuf> {
        match &self.storage.keys_dir {
            Some(p) => Ok(p.clone()),
            None => paths::keys_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_minimal_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"hash_algorithm":"blake3","monitored_dirs":["/tmp/watch"],"file_types":[".conf"],"check_interval":5}"#,
        )
        .unwrap();
        let settings = WatchdogSettings::load(&path).unwrap();
        assert_eq!(settings.hash_algorithm, HashAlgorithm::Blake3);
        assert_eq!(settings.algorithms.len(), 3);
        assert!(settings.signatures.enabled);
        assert_eq!(settings.alerting.channels, vec![ChannelSettings::Console]);
        assert_eq!(settings.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_default_algorithm_always_recorded() {
        let mut settings = WatchdogSettings {
            hash_algorithm: HashAlgorithm::Sha512,
            algorithms: vec![HashAlgorithm::Blake3, HashAlgorithm::Blake3],
            ..Default::default()
        };
        settings.normalize();
        assert_eq!(
            settings.algorithms,
            vec![HashAlgorithm::Sha512, HashAlgorithm::Blake3]
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            WatchdogSettings::load(&path),
            Err(WatchdogError::Config(_))
        ));
    }

    #[test]
    fn test_validation_rules() {
        let mut s = WatchdogSettings::default();
        assert!(s.validate().is_ok());

        s.check_interval = 0;
        assert!(s.validate().is_err());
        s.check_interval = 5;

        s.file_types = vec!["conf".into()];
        assert!(s.validate().is_err());
        s.file_types = vec![".conf".into()];

        s.alerting.channels = vec![ChannelSettings::Telegram {
            bot_token: "".into(),
            chat_id: "1".into(),
        }];
        assert!(s.validate().is_err());
        s.alerting.channels = vec![ChannelSettings::Console];

        s.performance.workers = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults_and_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let settings = WatchdogSettings::load(&path).unwrap();
        assert_eq!(settings, WatchdogSettings::default());
        settings.save(&path).unwrap();
        assert_eq!(WatchdogSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_channel_settings_tagged() {
        let json = r#"[{"type":"console"},{"type":"email","to":"ops@example.com"}]"#;
        let channels: Vec<ChannelSettings> = serde_json::from_str(json).unwrap();
        assert_eq!(channels[0], ChannelSettings::Console);
        match &channels[1] {
            ChannelSettings::Email { to, from, sendmail } => {
                assert_eq!(to, "ops@example.com");
                assert!(from.is_none());
                assert_eq!(sendmail, &PathBuf::from("/usr/sbin/sendmail"));
            }
            other => panic!("unexpected channel {other:?}"),
        }
    }
}
