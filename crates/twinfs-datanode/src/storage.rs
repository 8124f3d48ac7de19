//! Collaborator seams for the local storage stack.
//!
//! The on-disk layout manager, block store, and integrity scanner each have
//! their own concurrency contracts; the namespace service manager only calls
//! the operations declared here. Two [`Storage`] implementations ship with
//! the crate: a disk-backed one for real deployments and a simulated one
//! that skips recovery entirely.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{info, warn};
use twinfs_proto::{NamespaceInfo, StorageInfo};
use twinfs_types::NamespaceId;

use crate::settings::StartupOption;
use crate::{DataNodeError, LOCAL_LAYOUT_VERSION};

/// Errors from the storage stack.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage has not been recovered for namespace {0}")]
    NotRecovered(NamespaceId),

    #[error("nothing to roll back to under {0}")]
    NothingToRollback(PathBuf),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// The layout manager: storage id persistence and state recovery.
pub trait Storage: Send + Sync {
    /// The persisted storage id; empty when the node has never registered.
    fn storage_id(&self) -> String;

    fn set_storage_id(&self, id: &str);

    /// Persist the storage identity to every data directory.
    fn write_all(&self) -> StorageResult<()>;

    /// Top-level state recovery across all data directories. Run once per
    /// process; callers serialise this with the node-wide storage lock.
    fn recover_transition_read(
        &self,
        info: &NamespaceInfo,
        startup: StartupOption,
    ) -> StorageResult<()>;

    /// Per-namespace state recovery.
    fn recover_namespace(
        &self,
        info: &NamespaceInfo,
        startup: StartupOption,
        nameservice_id: Option<&str>,
    ) -> StorageResult<()>;

    fn namespace_storage_info(&self, ns: NamespaceId) -> StorageResult<StorageInfo>;

    fn namespace_data_dir(&self, ns: NamespaceId) -> PathBuf;

    fn remove_namespace_storage(&self, ns: NamespaceId) -> StorageResult<()>;

    fn has_namespace(&self, ns: NamespaceId) -> bool;
}

/// The block store: holds the actual block replicas.
pub trait BlockStore: Send + Sync {
    fn add_namespace(&self, ns: NamespaceId, dir: &Path);
    fn remove_namespace(&self, ns: NamespaceId);
}

/// The block integrity scanner.
pub trait Scanner: Send + Sync {
    fn add_namespace(&self, ns: NamespaceId);
    fn remove_namespace(&self, ns: NamespaceId);
}

// ---------------------------------------------------------------------------
// Data directory validation
// ---------------------------------------------------------------------------

/// Validate the configured data directories, creating missing ones.
///
/// Bad directories are dropped with a warning; startup fails only when none
/// remain usable.
pub fn validate_data_dirs(dirs: &[PathBuf]) -> crate::Result<Vec<PathBuf>> {
    let mut usable = Vec::with_capacity(dirs.len());
    for dir in dirs {
        match check_dir(dir) {
            Ok(()) => usable.push(dir.clone()),
            Err(e) => warn!(dir = %dir.display(), error = %e, "dropping invalid data directory"),
        }
    }
    if usable.is_empty() {
        return Err(DataNodeError::Disk {
            path: PathBuf::new(),
            reason: "all configured data directories are invalid".into(),
        });
    }
    Ok(usable)
}

fn check_dir(dir: &Path) -> crate::Result<()> {
    let disk_err = |reason: String| DataNodeError::Disk {
        path: dir.to_path_buf(),
        reason,
    };
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| disk_err(format!("cannot create: {e}")))?;
    }
    let meta = std::fs::metadata(dir).map_err(|e| disk_err(format!("cannot stat: {e}")))?;
    if !meta.is_dir() {
        return Err(disk_err("not a directory".into()));
    }
    if meta.permissions().readonly() {
        return Err(disk_err("not writable".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Disk-backed implementation
// ---------------------------------------------------------------------------

const STORAGE_ID_FILE: &str = "storage_id";
const CURRENT_DIR: &str = "current";
const PREVIOUS_DIR: &str = "previous";

#[derive(Default)]
struct DiskState {
    storage_id: String,
    recovered: bool,
    namespaces: HashMap<NamespaceId, StorageInfo>,
}

/// Disk-backed [`Storage`].
///
/// Each data directory holds a `current/` tree with one `NS-<id>/` subtree
/// per namespace and a `storage_id` file. `previous/` is the rollback target.
pub struct DiskStorage {
    dirs: Vec<PathBuf>,
    state: Mutex<DiskState>,
}

impl DiskStorage {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            state: Mutex::new(DiskState::default()),
        }
    }

    fn io_err(path: &Path, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn ns_dir(root: &Path, ns: NamespaceId) -> PathBuf {
        root.join(CURRENT_DIR).join(format!("NS-{}", *ns))
    }
}

impl Storage for DiskStorage {
    fn storage_id(&self) -> String {
        self.state.lock().storage_id.clone()
    }

    fn set_storage_id(&self, id: &str) {
        self.state.lock().storage_id = id.to_string();
    }

    fn write_all(&self) -> StorageResult<()> {
        let id = self.storage_id();
        for dir in &self.dirs {
            let current = dir.join(CURRENT_DIR);
            std::fs::create_dir_all(&current).map_err(|e| Self::io_err(&current, e))?;
            let path = current.join(STORAGE_ID_FILE);
            std::fs::write(&path, &id).map_err(|e| Self::io_err(&path, e))?;
        }
        Ok(())
    }

    fn recover_transition_read(
        &self,
        _info: &NamespaceInfo,
        startup: StartupOption,
    ) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.recovered {
            return Ok(());
        }
        for dir in &self.dirs {
            let current = dir.join(CURRENT_DIR);
            let previous = dir.join(PREVIOUS_DIR);
            if startup == StartupOption::Rollback {
                if !previous.exists() {
                    return Err(StorageError::NothingToRollback(dir.clone()));
                }
                if current.exists() {
                    std::fs::remove_dir_all(&current).map_err(|e| Self::io_err(&current, e))?;
                }
                std::fs::rename(&previous, &current).map_err(|e| Self::io_err(&previous, e))?;
                info!(dir = %dir.display(), "rolled back storage state");
            }
            std::fs::create_dir_all(&current).map_err(|e| Self::io_err(&current, e))?;
            // Adopt a previously persisted storage id from the first
            // directory that has one.
            if state.storage_id.is_empty() {
                let id_file = current.join(STORAGE_ID_FILE);
                if let Ok(id) = std::fs::read_to_string(&id_file) {
                    state.storage_id = id.trim().to_string();
                }
            }
        }
        state.recovered = true;
        Ok(())
    }

    fn recover_namespace(
        &self,
        info: &NamespaceInfo,
        _startup: StartupOption,
        nameservice_id: Option<&str>,
    ) -> StorageResult<()> {
        let ns = info.namespace_id;
        for dir in &self.dirs {
            let ns_dir = Self::ns_dir(dir, ns);
            std::fs::create_dir_all(&ns_dir).map_err(|e| Self::io_err(&ns_dir, e))?;
        }
        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.state.lock().namespaces.insert(
            ns,
            StorageInfo {
                layout_version: LOCAL_LAYOUT_VERSION,
                namespace_id: ns,
                creation_time,
            },
        );
        info!(
            namespace_id = *ns,
            nameservice_id = nameservice_id.unwrap_or("<default>"),
            "namespace storage ready"
        );
        Ok(())
    }

    fn namespace_storage_info(&self, ns: NamespaceId) -> StorageResult<StorageInfo> {
        self.state
            .lock()
            .namespaces
            .get(&ns)
            .cloned()
            .ok_or(StorageError::NotRecovered(ns))
    }

    fn namespace_data_dir(&self, ns: NamespaceId) -> PathBuf {
        Self::ns_dir(&self.dirs[0], ns)
    }

    fn remove_namespace_storage(&self, ns: NamespaceId) -> StorageResult<()> {
        self.state.lock().namespaces.remove(&ns);
        for dir in &self.dirs {
            let ns_dir = Self::ns_dir(dir, ns);
            if ns_dir.exists() {
                std::fs::remove_dir_all(&ns_dir).map_err(|e| Self::io_err(&ns_dir, e))?;
            }
        }
        Ok(())
    }

    fn has_namespace(&self, ns: NamespaceId) -> bool {
        self.state.lock().namespaces.contains_key(&ns)
    }
}

// ---------------------------------------------------------------------------
// Simulated implementation
// ---------------------------------------------------------------------------

/// [`Storage`] that never touches disk.
///
/// Selected by `dfs.datanode.simulateddatastorage`; the storage info is
/// synthesized from the handshake result.
#[derive(Default)]
pub struct SimulatedStorage {
    state: Mutex<DiskState>,
}

impl SimulatedStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for SimulatedStorage {
    fn storage_id(&self) -> String {
        self.state.lock().storage_id.clone()
    }

    fn set_storage_id(&self, id: &str) {
        self.state.lock().storage_id = id.to_string();
    }

    fn write_all(&self) -> StorageResult<()> {
        Ok(())
    }

    fn recover_transition_read(
        &self,
        _info: &NamespaceInfo,
        _startup: StartupOption,
    ) -> StorageResult<()> {
        self.state.lock().recovered = true;
        Ok(())
    }

    fn recover_namespace(
        &self,
        info: &NamespaceInfo,
        _startup: StartupOption,
        _nameservice_id: Option<&str>,
    ) -> StorageResult<()> {
        self.state.lock().namespaces.insert(
            info.namespace_id,
            StorageInfo {
                layout_version: info.layout_version,
                namespace_id: info.namespace_id,
                creation_time: 0,
            },
        );
        Ok(())
    }

    fn namespace_storage_info(&self, ns: NamespaceId) -> StorageResult<StorageInfo> {
        self.state
            .lock()
            .namespaces
            .get(&ns)
            .cloned()
            .ok_or(StorageError::NotRecovered(ns))
    }

    fn namespace_data_dir(&self, ns: NamespaceId) -> PathBuf {
        PathBuf::from(format!("/simulated/NS-{}", *ns))
    }

    fn remove_namespace_storage(&self, ns: NamespaceId) -> StorageResult<()> {
        self.state.lock().namespaces.remove(&ns);
        Ok(())
    }

    fn has_namespace(&self, ns: NamespaceId) -> bool {
        self.state.lock().namespaces.contains_key(&ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns_info(id: u32) -> NamespaceInfo {
        NamespaceInfo {
            namespace_id: NamespaceId(id),
            layout_version: LOCAL_LAYOUT_VERSION,
            build_version: "test".into(),
        }
    }

    #[test]
    fn test_validate_data_dirs_drops_bad() {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("good");
        let bad = tmp.path().join("occupied");
        std::fs::write(&bad, b"a file, not a directory").unwrap();

        let usable = validate_data_dirs(&[good.clone(), bad]).unwrap();
        assert_eq!(usable, vec![good.clone()]);
        assert!(good.is_dir(), "missing directories are created");
    }

    #[test]
    fn test_validate_data_dirs_all_bad() {
        let tmp = tempfile::tempdir().unwrap();
        let bad = tmp.path().join("occupied");
        std::fs::write(&bad, b"x").unwrap();
        let err = validate_data_dirs(&[bad]).unwrap_err();
        assert!(matches!(err, DataNodeError::Disk { .. }));
    }

    #[test]
    fn test_disk_storage_id_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = vec![tmp.path().join("d0"), tmp.path().join("d1")];

        let storage = DiskStorage::new(dirs.clone());
        storage
            .recover_transition_read(&ns_info(1), StartupOption::Regular)
            .unwrap();
        assert_eq!(storage.storage_id(), "");

        storage.set_storage_id("DS-42");
        storage.write_all().unwrap();

        // A fresh instance over the same directories reads the id back.
        let reopened = DiskStorage::new(dirs);
        reopened
            .recover_transition_read(&ns_info(1), StartupOption::Regular)
            .unwrap();
        assert_eq!(reopened.storage_id(), "DS-42");
    }

    #[test]
    fn test_disk_namespace_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(vec![tmp.path().to_path_buf()]);
        storage
            .recover_transition_read(&ns_info(7), StartupOption::Regular)
            .unwrap();
        storage
            .recover_namespace(&ns_info(7), StartupOption::Regular, Some("alpha"))
            .unwrap();

        assert!(storage.has_namespace(NamespaceId(7)));
        let info = storage.namespace_storage_info(NamespaceId(7)).unwrap();
        assert_eq!(info.namespace_id, NamespaceId(7));
        assert_eq!(info.layout_version, LOCAL_LAYOUT_VERSION);
        assert!(storage.namespace_data_dir(NamespaceId(7)).ends_with("NS-7"));

        storage.remove_namespace_storage(NamespaceId(7)).unwrap();
        assert!(!storage.has_namespace(NamespaceId(7)));
        assert!(matches!(
            storage.namespace_storage_info(NamespaceId(7)),
            Err(StorageError::NotRecovered(_))
        ));
    }

    #[test]
    fn test_disk_rollback_without_previous() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(vec![tmp.path().to_path_buf()]);
        let err = storage
            .recover_transition_read(&ns_info(1), StartupOption::Rollback)
            .unwrap_err();
        assert!(matches!(err, StorageError::NothingToRollback(_)));
    }

    #[test]
    fn test_disk_rollback_restores_previous() {
        let tmp = tempfile::tempdir().unwrap();
        let previous = tmp.path().join(PREVIOUS_DIR);
        std::fs::create_dir_all(&previous).unwrap();
        std::fs::write(previous.join(STORAGE_ID_FILE), "DS-old").unwrap();

        let storage = DiskStorage::new(vec![tmp.path().to_path_buf()]);
        storage
            .recover_transition_read(&ns_info(1), StartupOption::Rollback)
            .unwrap();
        assert_eq!(storage.storage_id(), "DS-old");
        assert!(!tmp.path().join(PREVIOUS_DIR).exists());
    }

    #[test]
    fn test_simulated_storage() {
        let storage = SimulatedStorage::new();
        storage
            .recover_transition_read(&ns_info(3), StartupOption::Regular)
            .unwrap();
        storage
            .recover_namespace(&ns_info(3), StartupOption::Regular, None)
            .unwrap();
        assert!(storage.has_namespace(NamespaceId(3)));
        storage.set_storage_id("DS-sim");
        storage.write_all().unwrap();
        assert_eq!(storage.storage_id(), "DS-sim");
    }
}
