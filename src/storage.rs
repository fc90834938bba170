//! Last-known result per target, persisted as one JSON document.
//!
//! Every update is a full read-modify-write of the file under a single
//! lock. Read problems degrade to an empty map and write problems are
//! logged, so a broken disk never stops the monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::models::{ProbeResult, Transition};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("storage file {path:?} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Persisted record for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub time: DateTime<Utc>,
    pub status: bool,
    pub message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    urls: BTreeMap<String, StoredState>,
}

pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records `result` and classifies it against the previous record.
    ///
    /// The record is overwritten even when nothing changed, so the stored
    /// time always tracks the latest capture.
    pub async fn update(&self, result: &ProbeResult) -> Transition {
        let _guard = self.lock.lock().await;

        let mut model = self.read_or_default().await;
        let record = StoredState {
            time: result.timestamp,
            status: result.status,
            message: result.message.clone(),
        };

        let transition = match model.urls.insert(result.target.id.clone(), record) {
            None => Transition::Added,
            Some(previous) if previous.status != result.status => {
                if result.status {
                    info!(target_name = %result.target.name, "host is now up");
                } else {
                    warn!(target_name = %result.target.name, reason = %result.message, "host is now down");
                }
                Transition::Updated
            }
            Some(_) => Transition::NoChange,
        };

        if let Err(e) = self.write(&model).await {
            warn!(error = %e, "unable to persist state, keeping in-memory classification");
        }

        transition
    }

    /// Current persisted records keyed by target id.
    pub async fn snapshot(&self) -> BTreeMap<String, StoredState> {
        let _guard = self.lock.lock().await;
        self.read_or_default().await.urls
    }

    async fn read_or_default(&self) -> StateFile {
        match self.read().await {
            Ok(model) => model,
            Err(StorageError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                StateFile::default()
            }
            Err(e) => {
                warn!(error = %e, "unable to load state, starting from empty");
                StateFile::default()
            }
        }
    }

    async fn read(&self) -> Result<StateFile, StorageError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Json {
            path: self.path.clone(),
            source,
        })
    }

    async fn write(&self, model: &StateFile) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        model.serialize(&mut ser).map_err(|source| StorageError::Json {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        let io_err = |source| StorageError::Io {
            path: self.path.clone(),
            source,
        };
        tokio::fs::write(&tmp, &buf).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NotifyTargets, Target};
    use chrono::Duration;
    use reqwest::Url;
    use std::sync::Arc;

    fn target(url: &str) -> Arc<Target> {
        Arc::new(Target::new(
            Url::parse(url).unwrap(),
            "svc",
            NotifyTargets::default(),
        ))
    }

    fn result(target: &Arc<Target>, status: bool, at: DateTime<Utc>) -> ProbeResult {
        ProbeResult {
            target: target.clone(),
            timestamp: at,
            status,
            message: if status { String::new() } else { "timeout".into() },
        }
    }

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn first_result_is_added_with_exact_fields() {
        let (_dir, store) = store();
        let t = target("http://a.example");
        let r = result(&t, false, Utc::now());

        assert_eq!(store.update(&r).await, Transition::Added);

        let records = store.snapshot().await;
        assert_eq!(
            records.get(&t.id),
            Some(&StoredState {
                time: r.timestamp,
                status: false,
                message: "timeout".into(),
            })
        );
    }

    #[tokio::test]
    async fn same_status_is_no_change_but_time_advances() {
        let (_dir, store) = store();
        let t = target("http://a.example");
        let first = Utc::now();
        let later = first + Duration::seconds(60);

        store.update(&result(&t, true, first)).await;
        assert_eq!(store.update(&result(&t, true, later)).await, Transition::NoChange);
        assert_eq!(store.snapshot().await[&t.id].time, later);
    }

    #[tokio::test]
    async fn flipped_status_is_updated() {
        let (_dir, store) = store();
        let t = target("http://a.example");
        let now = Utc::now();

        store.update(&result(&t, true, now)).await;
        assert_eq!(store.update(&result(&t, false, now)).await, Transition::Updated);
        assert_eq!(store.update(&result(&t, true, now)).await, Transition::Updated);
    }

    #[tokio::test]
    async fn repeated_updates_never_report_added_twice() {
        let (_dir, store) = store();
        let t = target("http://a.example");
        let mut at = Utc::now();

        assert_eq!(store.update(&result(&t, true, at)).await, Transition::Added);
        for _ in 0..3 {
            at = store.snapshot().await[&t.id].time + Duration::seconds(1);
            assert_ne!(store.update(&result(&t, true, at)).await, Transition::Added);
        }
    }

    #[tokio::test]
    async fn url_case_maps_to_one_record() {
        let (_dir, store) = store();
        let lower = target("http://a.example/up");
        let upper = target("HTTP://A.EXAMPLE/UP");

        store.update(&result(&lower, true, Utc::now())).await;
        assert_eq!(
            store.update(&result(&upper, true, Utc::now())).await,
            Transition::NoChange
        );
        assert_eq!(store.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_treated_as_empty() {
        let (_dir, store) = store();
        std::fs::write(store.path(), "{ not json").unwrap();

        let t = target("http://a.example");
        assert_eq!(store.update(&result(&t, true, Utc::now())).await, Transition::Added);
        assert_eq!(store.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn unwritable_location_still_classifies() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("missing").join("state.json"));
        let t = target("http://a.example");

        assert_eq!(store.update(&result(&t, true, Utc::now())).await, Transition::Added);
        // nothing was persisted, so the next update starts from empty again
        assert_eq!(store.update(&result(&t, true, Utc::now())).await, Transition::Added);
    }

    #[tokio::test]
    async fn file_layout_is_pretty_urls_map() {
        let (_dir, store) = store();
        let t = target("http://a.example");
        store.update(&result(&t, false, Utc::now())).await;

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\n    \"urls\": {"));

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let record = &value["urls"][&t.id];
        assert_eq!(record["status"], false);
        assert_eq!(record["message"], "timeout");
        assert!(DateTime::parse_from_rfc3339(record["time"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_records() {
        let (_dir, store) = store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let t = target(&format!("http://host{i}.example"));
                    store.update(&result(&t, true, Utc::now())).await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Transition::Added);
        }
        assert_eq!(store.snapshot().await.len(), 16);
    }
}
