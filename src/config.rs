use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::models::{NotifyTargets, Target};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("field \"healthchecks[{index}].url\" is malformed ({url:?}: {reason})")]
    InvalidUrl {
        index: usize,
        url: String,
        reason: String,
    },

    #[error("no notifications are configured for \"healthchecks[{index}]\"")]
    NoChannels { index: usize },
}

/// The active set of targets for a cycle.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub targets: Vec<Arc<Target>>,
}

/// Something that can produce a fresh [`Config`].
pub trait ConfigSource: Send + Sync + 'static {
    fn load(&self) -> Result<Config, ConfigError>;
}

/// Reads the healthcheck list from a YAML file on every call.
pub struct FileConfig {
    path: PathBuf,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfig {
    fn load(&self) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        let file: ConfigFile = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        file.resolve()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub healthchecks: Vec<HealthcheckEntry>,
    #[serde(default)]
    pub notify: Vec<NotifyEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthcheckEntry {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub notify: Vec<NotifyEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct NotifyEntry {
    #[serde(default)]
    pub slack: Option<String>,
    #[serde(default)]
    pub slack_mention: Vec<String>,
}

impl ConfigFile {
    /// Turns the raw file model into targets, inheriting the global notify
    /// block where an entry has none of its own. Any invalid entry fails
    /// the whole load.
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let targets = self
            .healthchecks
            .iter()
            .enumerate()
            .map(|(index, entry)| self.resolve_entry(index, entry).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Config { targets })
    }

    fn resolve_entry(&self, index: usize, entry: &HealthcheckEntry) -> Result<Target, ConfigError> {
        let url = Url::parse(&entry.url).map_err(|e| ConfigError::InvalidUrl {
            index,
            url: entry.url.clone(),
            reason: e.to_string(),
        })?;

        let name = match entry.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => url.host_str().map_or_else(|| url.to_string(), str::to_string),
        };

        let mut channels = slack_channels(&entry.notify);
        if channels.is_empty() {
            channels = slack_channels(&self.notify);
        }
        if channels.is_empty() {
            return Err(ConfigError::NoChannels { index });
        }

        let mut mentions = slack_mentions(&entry.notify);
        if mentions.is_empty() {
            mentions = slack_mentions(&self.notify);
        }

        Ok(Target::new(url, name, NotifyTargets { channels, mentions }))
    }
}

fn slack_channels(entries: &[NotifyEntry]) -> Vec<String> {
    entries.iter().filter_map(|n| n.slack.clone()).collect()
}

fn slack_mentions(entries: &[NotifyEntry]) -> Vec<String> {
    entries.iter().flat_map(|n| n.slack_mention.iter().cloned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, ConfigError> {
        serde_yaml::from_str::<ConfigFile>(yaml).unwrap().resolve()
    }

    #[test]
    fn entry_channels_override_defaults() {
        let config = parse(
            r##"
healthchecks:
  - url: https://a.example/health
    name: A
    notify:
      - slack: "#ops"
        slack_mention: [U1]
notify:
  - slack: "#alerts"
    slack_mention: [U9]
"##,
        )
        .unwrap();

        let target = &config.targets[0];
        assert_eq!(target.name, "A");
        assert_eq!(target.notify.channels, vec!["#ops"]);
        assert_eq!(target.notify.mentions, vec!["U1"]);
    }

    #[test]
    fn defaults_fill_missing_channels_and_mentions() {
        let config = parse(
            r##"
healthchecks:
  - url: https://b.example:8443/
notify:
  - slack: "#alerts"
    slack_mention: [U9]
  - slack: "#oncall"
"##,
        )
        .unwrap();

        let target = &config.targets[0];
        assert_eq!(target.name, "b.example");
        assert_eq!(target.notify.channels, vec!["#alerts", "#oncall"]);
        assert_eq!(target.notify.mentions, vec!["U9"]);
    }

    #[test]
    fn own_channel_still_inherits_default_mentions() {
        let config = parse(
            r##"
healthchecks:
  - url: http://c.example
    notify:
      - slack: "#c"
notify:
  - slack_mention: [U7]
"##,
        )
        .unwrap();

        assert_eq!(config.targets[0].notify.channels, vec!["#c"]);
        assert_eq!(config.targets[0].notify.mentions, vec!["U7"]);
    }

    #[test]
    fn entry_without_any_channel_fails_whole_load() {
        let err = parse(
            r##"
healthchecks:
  - url: http://ok.example
    notify:
      - slack: "#x"
  - url: http://orphan.example
"##,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NoChannels { index: 1 }));
    }

    #[test]
    fn malformed_url_reports_index() {
        let err = parse(
            r##"
healthchecks:
  - url: not a url
notify:
  - slack: "#x"
"##,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { index: 0, .. }));
    }

    #[test]
    fn same_url_in_different_case_shares_identity() {
        let config = parse(
            r##"
healthchecks:
  - url: http://dup.example/Up
    name: one
  - url: HTTP://DUP.example/up
    name: two
notify:
  - slack: "#x"
"##,
        )
        .unwrap();
        assert_eq!(config.targets[0].id, config.targets[1].id);
        assert_ne!(config.targets[0].name, config.targets[1].name);
    }

    #[test]
    fn empty_document_has_no_targets() {
        let config = parse("healthchecks: []\n").unwrap();
        assert!(config.targets.is_empty());
    }

    #[test]
    fn file_source_reports_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let source = FileConfig::new(&path);
        assert!(matches!(source.load(), Err(ConfigError::Read { .. })));

        std::fs::write(&path, "{ healthchecks: ").unwrap();
        assert!(matches!(source.load(), Err(ConfigError::Parse { .. })));

        std::fs::write(
            &path,
            "healthchecks:\n  - url: http://a.example\nnotify:\n  - slack: \"#x\"\n",
        )
        .unwrap();
        let config = source.load().unwrap();
        assert_eq!(config.targets.len(), 1);
        assert_eq!(source.path(), path.as_path());
    }
}
