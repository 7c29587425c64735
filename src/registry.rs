//! Durable registry of hosted apps
//!
//! Each app owns one directory under `<data_dir>/apps/<app_id>/` holding the
//! uploaded code file, the dependency manifest, the execution environment,
//! the cumulative log and a `meta.json` record. Every mutation persists
//! `meta.json` atomically (write temp, then rename) before it is considered
//! committed, so a restarted orchestrator can reconstruct full state.

use crate::error::HostError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CODE_FILE: &str = "app.py";
pub const MANIFEST_FILE: &str = "requirements.txt";
pub const ENV_DIR: &str = "venv";
pub const LOG_FILE: &str = "run.log";
pub const META_FILE: &str = "meta.json";

/// Lifecycle state of an app. Associated data keeps illegal combinations
/// unrepresentable: only starting/running states carry a port, only a
/// failed state carries an error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AppStatus {
    Created,
    Installing,
    Starting { port: u16 },
    Running { port: u16, pid: u32 },
    Stopping { port: u16, pid: Option<u32> },
    Stopped,
    Failed { error: String },
}

impl AppStatus {
    /// Internal port bound to this app, while provisioned for running
    pub fn port(&self) -> Option<u16> {
        match self {
            AppStatus::Starting { port }
            | AppStatus::Running { port, .. }
            | AppStatus::Stopping { port, .. } => Some(*port),
            _ => None,
        }
    }

    /// OS process id, while a process is believed alive
    pub fn pid(&self) -> Option<u32> {
        match self {
            AppStatus::Running { pid, .. } => Some(*pid),
            AppStatus::Stopping { pid, .. } => *pid,
            _ => None,
        }
    }

    /// Last failure message, retained until the next successful transition
    pub fn error(&self) -> Option<&str> {
        match self {
            AppStatus::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// Short status label used in API responses and logs
    pub fn label(&self) -> &'static str {
        match self {
            AppStatus::Created => "created",
            AppStatus::Installing => "installing",
            AppStatus::Starting { .. } => "starting",
            AppStatus::Running { .. } => "running",
            AppStatus::Stopping { .. } => "stopping",
            AppStatus::Stopped => "stopped",
            AppStatus::Failed { .. } => "failed",
        }
    }

    /// Stable idle states from which provisioning may begin
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            AppStatus::Created | AppStatus::Stopped | AppStatus::Failed { .. }
        )
    }
}

/// One hosted app's durable metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    pub app_id: String,
    pub name: String,
    pub status: AppStatus,
    /// Bumped on every mutating request; in-flight pipelines capture it at
    /// start and abort once it moves on
    pub generation: u64,
    pub code_path: PathBuf,
    pub manifest_path: PathBuf,
    pub env_path: PathBuf,
    pub log_path: PathBuf,
    pub code_sha256: String,
    pub manifest_sha256: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registry of all hosted apps: sharded in-memory view plus per-app
/// `meta.json` persistence
pub struct AppRegistry {
    apps_dir: PathBuf,
    apps: DashMap<String, AppRecord>,
    /// App ids in creation order
    order: Mutex<Vec<String>>,
}

impl AppRegistry {
    /// Open the registry rooted at `<data_dir>/apps`, loading any records
    /// persisted by a previous run
    pub fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self, HostError> {
        let apps_dir = data_dir.as_ref().join("apps");
        std::fs::create_dir_all(&apps_dir)?;

        let apps = DashMap::new();
        let mut records: Vec<AppRecord> = Vec::new();
        for entry in std::fs::read_dir(&apps_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let meta_path = entry.path().join(META_FILE);
            if !meta_path.exists() {
                continue;
            }
            match std::fs::read_to_string(&meta_path)
                .map_err(HostError::from)
                .and_then(|s| {
                    serde_json::from_str::<AppRecord>(&s)
                        .map_err(|e| HostError::Persist(e.to_string()))
                }) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %meta_path.display(), error = %e, "Skipping unreadable app record");
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let order: Vec<String> = records.iter().map(|r| r.app_id.clone()).collect();
        for record in records {
            apps.insert(record.app_id.clone(), record);
        }
        debug!(count = order.len(), dir = %apps_dir.display(), "Registry loaded");

        Ok(Self {
            apps_dir,
            apps,
            order: Mutex::new(order),
        })
    }

    pub fn app_dir(&self, app_id: &str) -> PathBuf {
        self.apps_dir.join(app_id)
    }

    /// Create an app record and its on-disk layout from uploaded content
    pub fn create(
        &self,
        name: &str,
        code: &[u8],
        manifest: &[u8],
    ) -> Result<AppRecord, HostError> {
        let app_id = Uuid::new_v4().simple().to_string();
        let dir = self.app_dir(&app_id);
        std::fs::create_dir_all(&dir)?;

        let code_path = dir.join(CODE_FILE);
        let manifest_path = dir.join(MANIFEST_FILE);
        std::fs::write(&code_path, code)?;
        std::fs::write(&manifest_path, manifest)?;

        let now = Utc::now();
        let record = AppRecord {
            app_id: app_id.clone(),
            name: name.to_string(),
            status: AppStatus::Created,
            generation: 1,
            code_path,
            manifest_path,
            env_path: dir.join(ENV_DIR),
            log_path: dir.join(LOG_FILE),
            code_sha256: sha256_hex(code),
            manifest_sha256: sha256_hex(manifest),
            created_at: now,
            updated_at: now,
        };
        self.persist(&record)?;

        self.apps.insert(app_id.clone(), record.clone());
        self.order.lock().push(app_id);
        Ok(record)
    }

    pub fn get(&self, app_id: &str) -> Result<AppRecord, HostError> {
        self.apps
            .get(app_id)
            .map(|r| r.clone())
            .ok_or_else(|| HostError::NotFound(app_id.to_string()))
    }

    /// All apps in creation order
    pub fn list(&self) -> Vec<AppRecord> {
        let order = self.order.lock();
        order
            .iter()
            .filter_map(|id| self.apps.get(id).map(|r| r.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Atomic read-modify-write of one record. The mutation is applied to a
    /// copy, persisted, and only then committed to the in-memory view, so a
    /// persistence failure cannot corrupt committed state.
    pub fn update<F>(&self, app_id: &str, mutate: F) -> Result<AppRecord, HostError>
    where
        F: FnOnce(&mut AppRecord) -> Result<(), HostError>,
    {
        let mut entry = self
            .apps
            .get_mut(app_id)
            .ok_or_else(|| HostError::NotFound(app_id.to_string()))?;
        let mut next = entry.clone();
        mutate(&mut next)?;
        next.updated_at = Utc::now();
        self.persist(&next)?;
        *entry = next.clone();
        Ok(next)
    }

    /// Remove the record and the app's on-disk artifacts. The caller must
    /// have stopped the app first.
    pub fn remove(&self, app_id: &str) -> Result<(), HostError> {
        let (_, record) = self
            .apps
            .remove(app_id)
            .ok_or_else(|| HostError::NotFound(app_id.to_string()))?;
        self.order.lock().retain(|id| id != app_id);
        let dir = self.app_dir(&record.app_id);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(app_id, dir = %dir.display(), error = %e, "Failed to remove app directory");
            }
        }
        Ok(())
    }

    fn persist(&self, record: &AppRecord) -> Result<(), HostError> {
        let dir = self.app_dir(&record.app_id);
        let tmp = dir.join(format!("{}.tmp", META_FILE));
        let final_path = dir.join(META_FILE);
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| HostError::Persist(e.to_string()))?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &final_path)?;
        Ok(())
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
