//! Configuration for journalstore

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the journal directory
    #[serde(default = "default_journal_path", rename = "journal-path")]
    pub journal_path: PathBuf,

    /// Leave streams whose name starts with `_` out of listings
    #[serde(default, rename = "hide-reserved")]
    pub hide_reserved: bool,
}

/// Same directory `sy` journals to by default
fn default_journal_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("switchyard")
        .join("journal")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            journal_path: default_journal_path(),
            hide_reserved: false,
        }
    }
}

impl Config {
    /// Load config from file, or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(config_path) = path {
            return Self::load_from_file(config_path);
        }

        let default_paths = [
            Some(PathBuf::from("journalstore.yml")),
            dirs::config_dir().map(|p| p.join("journalstore").join("config.yml")),
        ];
        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::load_from_file(path);
            }
        }

        Ok(Config::default())
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content).context(format!("Failed to parse config file: {}", path.display()))
    }

    /// Whether a stream belongs in a listing
    pub fn lists(&self, stream: &str) -> bool {
        !(self.hide_reserved && stream.starts_with('_'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_explicit_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.yml");
        std::fs::write(&path, "journal-path: /var/lib/switchyard/journal\nhide-reserved: true\n").unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.journal_path, PathBuf::from("/var/lib/switchyard/journal"));
        assert!(loaded.hide_reserved);
        assert!(!loaded.lists("_events"));
        assert!(loaded.lists("0192-instance"));
    }

    #[test]
    fn test_missing_key_uses_default() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.journal_path.ends_with("switchyard/journal"));
        assert!(config.lists("_metrics"));
    }

    #[test]
    fn test_unparsable_file_errors() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.yml");
        std::fs::write(&path, "hide-reserved: [nope").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
