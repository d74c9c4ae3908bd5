//! Master configuration (TOML)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client control address
    pub bind: String,
    /// Slave link address
    pub slave_bind: String,
    /// Address advertised for master-local passive connections
    pub pasv_address: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Generate a self-signed certificate when none is configured
    pub tls_enabled: bool,
    /// Refuse RETR/STOR unless PROT P is active
    pub deny_unencrypted_data: bool,
    /// Section name -> virtual root path
    pub sections: BTreeMap<String, String>,
    pub archive: ArchiveConfig,
    /// Upload credit multiplier
    pub credit_check_ratio: f64,
    /// Download credit multiplier
    pub credit_loss_ratio: f64,
    pub slave_selection: Vec<FilterConfig>,
    /// JSON-lines transfer log
    pub transfer_log: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:2121".to_string(),
            slave_bind: "0.0.0.0:2122".to_string(),
            pasv_address: None,
            tls_cert: None,
            tls_key: None,
            tls_enabled: false,
            deny_unencrypted_data: false,
            sections: BTreeMap::new(),
            archive: ArchiveConfig::default(),
            credit_check_ratio: 3.0,
            credit_loss_ratio: 1.0,
            slave_selection: vec![
                FilterConfig {
                    kind: FilterKind::Load,
                    multiplier: 1_000.0,
                    ..FilterConfig::default()
                },
                FilterConfig {
                    kind: FilterKind::Cycle,
                    assign: 1,
                    ..FilterConfig::default()
                },
            ],
            transfer_log: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub cycle_minutes: u64,
    pub archive_after_minutes: u64,
    /// Section names skipped by the maintenance sweep
    pub exclude: Vec<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            cycle_minutes: 10,
            archive_after_minutes: 60 * 24 * 7,
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    /// Penalise slaves that transferred in the same direction recently
    Mintime,
    /// Penalise slaves by number of active transfers
    Load,
    /// Prefer the least recently used slave
    Cycle,
    /// Prefer slaves that already hold most of the target directory
    Affinity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub kind: FilterKind,
    pub multiplier: f64,
    pub mintime_ms: i64,
    pub assign: i64,
    pub top: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            kind: FilterKind::Load,
            multiplier: 1.0,
            mintime_ms: 120_000,
            assign: 100,
            top: 1,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Config =
            toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    /// Section owning a virtual path (longest matching root)
    pub fn section_for(&self, path: &str) -> Option<&str> {
        self.sections
            .iter()
            .filter(|(_, root)| {
                let root = root.trim_end_matches('/');
                root.is_empty() || path == root || path.starts_with(&format!("{}/", root))
            })
            .max_by_key(|(_, root)| root.len())
            .map(|(name, _)| name.as_str())
    }

    pub fn is_archive_excluded(&self, section: &str) -> bool {
        self.archive.exclude.iter().any(|s| s == section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:2121");
        assert_eq!(cfg.slave_selection.len(), 2);
        assert!(!cfg.deny_unencrypted_data);
    }

    #[test]
    fn parses_sections_and_filters() {
        let text = r#"
            bind = "127.0.0.1:21"
            deny_unencrypted_data = true

            [sections]
            mp3 = "/mp3"
            tv = "/tv"

            [archive]
            cycle_minutes = 5
            exclude = ["tv"]

            [[slave_selection]]
            kind = "mintime"
            multiplier = 2.0
            mintime_ms = 60000
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:21");
        assert!(cfg.deny_unencrypted_data);
        assert_eq!(cfg.section_for("/mp3/album/track"), Some("mp3"));
        assert_eq!(cfg.section_for("/tv"), Some("tv"));
        assert_eq!(cfg.section_for("/tvshows"), None);
        assert!(cfg.is_archive_excluded("tv"));
        assert_eq!(cfg.archive.cycle_minutes, 5);
        assert_eq!(cfg.slave_selection[0].kind, FilterKind::Mintime);
        assert_eq!(cfg.slave_selection[0].top, 1);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("nope.toml")).is_err());
    }
}
