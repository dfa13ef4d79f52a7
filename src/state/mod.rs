//! Persisted environment state
//!
//! One combined JSON record keyed by service id. Every update rewrites the
//! whole file through a synced temp file and a rename, so a crash mid-write
//! leaves either the old record or the new one, never a torn file.
//!
//! The file is shared with other control processes (a CLI install while the
//! control panel is open). Updates merge into what is on disk at write time,
//! and [`StateStore::refresh`] picks up changes made elsewhere.

use crate::errors::{OrchestratorError, Result};
use crate::registry::ServiceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const STATE_FORMAT_VERSION: u32 = 1;

/// Provisioning status of one environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvironmentStatus {
    Missing,
    Provisioning,
    Ready,
    Broken,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EnvironmentStatus::Missing => "missing",
            EnvironmentStatus::Provisioning => "provisioning",
            EnvironmentStatus::Ready => "ready",
            EnvironmentStatus::Broken => "broken",
        };
        f.write_str(text)
    }
}

/// Durable per-service record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub status: EnvironmentStatus,
    /// Dependency set version that was last installed completely
    pub installed_version: Option<String>,
    /// Artifact name -> verified sha256
    #[serde(default)]
    pub verified_artifacts: BTreeMap<String, String>,
    pub last_verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Default for EnvironmentState {
    fn default() -> Self {
        Self::missing()
    }
}

impl EnvironmentState {
    pub fn missing() -> Self {
        Self {
            status: EnvironmentStatus::Missing,
            installed_version: None,
            verified_artifacts: BTreeMap::new(),
            last_verified_at: None,
            last_error: None,
        }
    }

    /// A verified, runnable environment
    pub fn ready(version: impl Into<String>, verified: BTreeMap<String, String>) -> Self {
        Self {
            status: EnvironmentStatus::Ready,
            installed_version: Some(version.into()),
            verified_artifacts: verified,
            last_verified_at: Some(Utc::now()),
            last_error: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == EnvironmentStatus::Ready
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    environments: BTreeMap<String, EnvironmentState>,
}

/// Owner of the on-disk environment record
pub struct StateStore {
    path: PathBuf,
    records: Mutex<BTreeMap<ServiceId, EnvironmentState>>,
}

impl StateStore {
    /// Open the record, treating an absent file as "everything missing".
    ///
    /// A file that exists but cannot be parsed is fatal: silently starting
    /// over would re-download gigabytes and hide the corruption.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| OrchestratorError::InstallRootUnwritable {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let records = Self::load(&path)?;

        debug!(path = %path.display(), records = records.len(), "environment state loaded");

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn load(path: &Path) -> Result<BTreeMap<ServiceId, EnvironmentState>> {
        if path.exists() {
            Self::read_records(path)
        } else {
            Ok(BTreeMap::new())
        }
    }

    fn read_records(path: &Path) -> Result<BTreeMap<ServiceId, EnvironmentState>> {
        let corrupt = |reason: String| OrchestratorError::StateCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        let json = fs::read_to_string(path).map_err(|e| corrupt(e.to_string()))?;
        let file: StateFile = serde_json::from_str(&json).map_err(|e| corrupt(e.to_string()))?;

        if file.version != STATE_FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {} (expected {})",
                file.version, STATE_FORMAT_VERSION
            )));
        }

        let mut records = BTreeMap::new();
        for (key, state) in file.environments {
            match key.parse::<ServiceId>() {
                Ok(id) => {
                    records.insert(id, state);
                }
                Err(_) => warn!(key = %key, "ignoring state record for unknown service"),
            }
        }
        Ok(records)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file so records written by another process are seen.
    ///
    /// A file that became corrupt since open is reported, and the cached
    /// records are left as they were.
    pub fn refresh(&self) -> Result<()> {
        let mut records = self.lock();
        let fresh = Self::load(&self.path)?;
        if *records != fresh {
            debug!(path = %self.path.display(), "environment state changed on disk");
            *records = fresh;
        }
        Ok(())
    }

    /// Current record for a service; absent means Missing
    pub fn get(&self, id: ServiceId) -> EnvironmentState {
        self.lock().get(&id).cloned().unwrap_or_default()
    }

    /// Durably replace the record for one service.
    ///
    /// The in-memory copy only changes once the file is safely on disk.
    pub fn put(&self, id: ServiceId, state: EnvironmentState) -> Result<()> {
        let mut records = self.lock();
        let mut next = Self::load(&self.path)?;
        next.insert(id, state);
        self.write_atomic(&next)?;
        *records = next;
        Ok(())
    }

    /// Forget a service, returning it to Missing
    pub fn remove(&self, id: ServiceId) -> Result<()> {
        let mut records = self.lock();
        let mut next = Self::load(&self.path)?;
        if !next.contains_key(&id) {
            *records = next;
            return Ok(());
        }
        next.remove(&id);
        self.write_atomic(&next)?;
        *records = next;
        Ok(())
    }

    /// Copy of every record, with Missing filled in for absent services
    pub fn snapshot(&self) -> BTreeMap<ServiceId, EnvironmentState> {
        let records = self.lock();
        ServiceId::ALL
            .iter()
            .map(|id| (*id, records.get(id).cloned().unwrap_or_default()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ServiceId, EnvironmentState>> {
        // A panic while holding the lock never leaves a half-applied map:
        // the map is only swapped after a successful write.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_atomic(&self, records: &BTreeMap<ServiceId, EnvironmentState>) -> Result<()> {
        let file = StateFile {
            version: STATE_FORMAT_VERSION,
            environments: records
                .iter()
                .map(|(id, state)| (id.as_str().to_string(), state.clone()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        let unwritable = |e: std::io::Error| OrchestratorError::InstallRootUnwritable {
            path: self.path.clone(),
            reason: e.to_string(),
        };

        {
            let mut handle = fs::File::create(&tmp).map_err(unwritable)?;
            handle.write_all(&json).map_err(unwritable)?;
            handle.sync_all().map_err(unwritable)?;
        }
        fs::rename(&tmp, &self.path).map_err(unwritable)?;

        #[cfg(unix)]
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (StateStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::open(temp_dir.path().join("environments.json")).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_absent_file_means_missing() {
        let (store, _temp) = create_test_store();
        assert_eq!(store.get(ServiceId::Gary).status, EnvironmentStatus::Missing);
        assert_eq!(store.snapshot().len(), 3);
    }

    #[test]
    fn test_put_survives_reopen() {
        let (store, temp) = create_test_store();
        let mut verified = BTreeMap::new();
        verified.insert("model.bin".to_string(), "ab".repeat(32));
        store
            .put(ServiceId::Jerry, EnvironmentState::ready("main@torch", verified.clone()))
            .unwrap();

        let reopened = StateStore::open(temp.path().join("environments.json")).unwrap();
        let state = reopened.get(ServiceId::Jerry);
        assert!(state.is_ready());
        assert_eq!(state.verified_artifacts, verified);
        assert_eq!(state.installed_version.as_deref(), Some("main@torch"));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let (store, temp) = create_test_store();
        store.put(ServiceId::Gary, EnvironmentState::missing()).unwrap();
        assert!(!temp.path().join("environments.json.tmp").exists());
        assert!(temp.path().join("environments.json").exists());
    }

    #[test]
    fn test_corrupt_file_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("environments.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = StateStore::open(&path).err().unwrap();
        assert!(matches!(err, OrchestratorError::StateCorrupt { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_version_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("environments.json");
        std::fs::write(&path, r#"{"version": 99, "environments": {}}"#).unwrap();

        assert!(matches!(
            StateStore::open(&path),
            Err(OrchestratorError::StateCorrupt { .. })
        ));
    }

    #[test]
    fn test_remove_returns_to_missing() {
        let (store, _temp) = create_test_store();
        store
            .put(ServiceId::Terry, EnvironmentState::ready("v1", BTreeMap::new()))
            .unwrap();
        store.remove(ServiceId::Terry).unwrap();
        assert_eq!(store.get(ServiceId::Terry).status, EnvironmentStatus::Missing);
        store.remove(ServiceId::Terry).unwrap();
    }

    #[test]
    fn test_records_are_independent() {
        let (store, _temp) = create_test_store();
        store
            .put(ServiceId::Gary, EnvironmentState::ready("v1", BTreeMap::new()))
            .unwrap();
        let mut broken = EnvironmentState::missing();
        broken.status = EnvironmentStatus::Broken;
        store.put(ServiceId::Terry, broken).unwrap();

        assert!(store.get(ServiceId::Gary).is_ready());
        assert_eq!(store.get(ServiceId::Terry).status, EnvironmentStatus::Broken);
        assert_eq!(store.get(ServiceId::Jerry).status, EnvironmentStatus::Missing);
    }

    #[test]
    fn test_refresh_sees_other_process_writes() {
        let (store, temp) = create_test_store();
        let other = StateStore::open(temp.path().join("environments.json")).unwrap();

        other
            .put(ServiceId::Gary, EnvironmentState::ready("v1", BTreeMap::new()))
            .unwrap();
        assert_eq!(store.get(ServiceId::Gary).status, EnvironmentStatus::Missing);

        store.refresh().unwrap();
        assert!(store.get(ServiceId::Gary).is_ready());

        other.remove(ServiceId::Gary).unwrap();
        store.refresh().unwrap();
        assert_eq!(store.get(ServiceId::Gary).status, EnvironmentStatus::Missing);
    }

    #[test]
    fn test_put_keeps_records_written_elsewhere() {
        let (store, temp) = create_test_store();
        let other = StateStore::open(temp.path().join("environments.json")).unwrap();

        other
            .put(ServiceId::Terry, EnvironmentState::ready("v1", BTreeMap::new()))
            .unwrap();
        store
            .put(ServiceId::Jerry, EnvironmentState::ready("v2", BTreeMap::new()))
            .unwrap();

        let reopened = StateStore::open(temp.path().join("environments.json")).unwrap();
        assert!(reopened.get(ServiceId::Terry).is_ready());
        assert!(reopened.get(ServiceId::Jerry).is_ready());
    }

    #[test]
    fn test_refresh_reports_corruption() {
        let (store, temp) = create_test_store();
        store
            .put(ServiceId::Gary, EnvironmentState::ready("v1", BTreeMap::new()))
            .unwrap();
        std::fs::write(temp.path().join("environments.json"), "{ torn").unwrap();

        assert!(matches!(store.refresh(), Err(OrchestratorError::StateCorrupt { .. })));
        assert!(store.get(ServiceId::Gary).is_ready());
    }
}
