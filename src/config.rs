//! Filesystem locations, timers and the configuration snapshot the service
//! loop consumes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration key the agent reacts to.
pub const GLOBAL_CONFIG_KEY: &str = "global";

/// Snapshot entry that toggles debug logging.
pub const DEBUG_ENABLE_KEY: &str = "debug.enable";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub device_node: PathBuf,
    /// DER SubjectPublicKeyInfo of the device key
    pub ecc_public_key: PathBuf,
    pub device_cert: PathBuf,
    /// Present only on devices whose identity key lives in software
    pub device_key: PathBuf,
    pub credential_cache: PathBuf,
    pub lock_file: PathBuf,
    pub liveness_touch: PathBuf,
    pub global_config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            device_node: "/dev/tpmrm0".into(),
            ecc_public_key: "/var/tmp/tpm.eccpubk.der".into(),
            device_cert: "/config/device.cert.pem".into(),
            device_key: "/config/device.key.pem".into(),
            credential_cache: "/config/tpm_credential".into(),
            lock_file: "/var/tmp/zededa/tpm.lock".into(),
            liveness_touch: "/var/run/tpmmgr.touch".into(),
            global_config: "/persist/config/global".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub paths: Paths,
    /// Liveness period of the service loop
    pub tick_interval: Duration,
    /// Watchdog warns when a tick is this late
    pub warning_time: Duration,
    /// Watchdog gives up when a tick is this late
    pub error_time: Duration,
    /// Debug logging forced on from the command line
    pub debug_override: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: Paths::default(),
            tick_interval: Duration::from_secs(15),
            warning_time: Duration::from_secs(40),
            error_time: Duration::from_secs(3 * 60),
            debug_override: false,
        }
    }
}

/// Key/value view of a configuration item as delivered by the feed.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot(BTreeMap<String, String>);

impl ConfigSnapshot {
    /// Parses `key=value` lines; blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    entries.insert(key.trim().to_owned(), value.trim().to_owned());
                }
                None => warn!(line, "ignoring malformed configuration line"),
            }
        }
        Self(entries)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// `None` when the entry is missing or not a boolean.
    pub fn debug_enabled(&self) -> Option<bool> {
        self.get(DEBUG_ENABLE_KEY)?.parse().ok()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfigSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_layout() {
        let config = Config::default();
        assert_eq!(config.paths.device_node, PathBuf::from("/dev/tpmrm0"));
        assert_eq!(config.paths.credential_cache, PathBuf::from("/config/tpm_credential"));
        assert_eq!(config.tick_interval, Duration::from_secs(15));
    }

    #[test]
    fn parses_key_value_lines() {
        let snapshot = ConfigSnapshot::parse(
            "# agent settings\n\ndebug.enable = true\ntimer.config.interval=60\nnonsense\n",
        );
        assert_eq!(snapshot.debug_enabled(), Some(true));
        assert_eq!(snapshot.get("timer.config.interval"), Some("60"));
        assert_eq!(snapshot.get("nonsense"), None);
    }

    #[test]
    fn non_boolean_debug_flag_is_ignored() {
        let snapshot: ConfigSnapshot = [(DEBUG_ENABLE_KEY, "yes")].into_iter().collect();
        assert_eq!(snapshot.debug_enabled(), None);
    }
}
