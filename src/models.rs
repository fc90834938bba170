use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Url;
use sha1::{Digest, Sha1};
use std::fmt;
use std::sync::Arc;

/// Where notifications for a target go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyTargets {
    pub channels: Vec<String>,
    pub mentions: Vec<String>,
}

/// One configured endpoint. Immutable once built; a config reload replaces
/// the whole set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    pub url: Url,
    pub name: String,
    pub notify: NotifyTargets,
}

impl Target {
    pub fn new(url: Url, name: impl Into<String>, notify: NotifyTargets) -> Self {
        Self {
            id: target_id(&url),
            url,
            name: name.into(),
            notify,
        }
    }
}

/// Identity of a target: padded base64url of the SHA-1 of the lower-cased
/// URL. Existing state files are keyed this way.
///
/// Two entries with the same effective URL share one stored record.
pub fn target_id(url: &Url) -> String {
    URL_SAFE.encode(Sha1::digest(url.as_str().to_lowercase().as_bytes()))
}

/// Outcome of probing one target once.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub target: Arc<Target>,
    pub timestamp: DateTime<Utc>,
    pub status: bool,
    pub message: String,
}

impl ProbeResult {
    pub fn up(target: Arc<Target>) -> Self {
        Self {
            target,
            timestamp: Utc::now(),
            status: true,
            message: String::new(),
        }
    }

    pub fn down(target: Arc<Target>, error: &str) -> Self {
        Self {
            target,
            timestamp: Utc::now(),
            status: false,
            message: failure_reason(error),
        }
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.status {
            write!(f, "{} is up", self.target.name)
        } else {
            write!(f, "{} is down: {}", self.target.name, self.message)
        }
    }
}

/// Shortens transport error text to its last non-empty colon-separated
/// segment. Lossy and meant for humans only.
pub fn failure_reason(error: &str) -> String {
    error
        .rsplit(':')
        .map(str::trim)
        .find(|segment| !segment.is_empty())
        .unwrap_or_else(|| error.trim())
        .to_string()
}

/// How a new result compares to what was stored for its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    NoChange,
    Added,
    Updated,
}
