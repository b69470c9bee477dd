//! Deployment store – the host's persisted copy of a deployed kernel.
//!
//! A deployment is written once by `heartbeat deploy` and afterwards only
//! rewritten by successful protected heartbeats (new events, spent nonces).
//! The deployment record inside it never changes.
//!
//! Hosts serialize on `deployment.lock` with `flock(LOCK_EX)` from load to
//! save, so two processes can never both spend the same nonce.  The lock is
//! advisory and Unix only; [`DeploymentStore::update`] additionally refuses
//! to overwrite a deployment that changed since it was loaded.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use heartbeat_kernel::KernelSnapshot;
use thiserror::Error;

const DEPLOYMENT_FILE: &str = "deployment.json";
const LOCK_FILE: &str = "deployment.lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a kernel is already deployed at {0}")]
    AlreadyDeployed(PathBuf),

    #[error("no kernel deployed at {0}; run `heartbeat deploy` first")]
    NotDeployed(PathBuf),

    #[error("deployment record in {0} differs from the kernel being saved")]
    RecordMismatch(PathBuf),

    #[error("deployment at {0} changed since it was loaded; retry the call")]
    Conflict(PathBuf),

    #[error("deployment file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("deployment file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// `deployment.json` inside a state directory.
pub struct DeploymentStore {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Exclusive hold on a deployment.  Released when dropped.
#[derive(Debug)]
pub struct DeploymentLock {
    _file: File,
}

impl DeploymentStore {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(DEPLOYMENT_FILE),
            lock_path: dir.join(LOCK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the first snapshot of a new deployment.  Refuses to replace an
    /// existing one.
    pub fn create(&self, snapshot: &KernelSnapshot) -> Result<(), StoreError> {
        if self.path.exists() {
            return Err(StoreError::AlreadyDeployed(self.path.clone()));
        }
        let raw = serde_json::to_vec_pretty(snapshot)?;
        write_owner_only(&self.path, &raw, true).map_err(|source| {
            if source.kind() == std::io::ErrorKind::AlreadyExists {
                StoreError::AlreadyDeployed(self.path.clone())
            } else {
                StoreError::Io {
                    path: self.path.clone(),
                    source,
                }
            }
        })
    }

    pub fn load(&self) -> Result<KernelSnapshot, StoreError> {
        if !self.path.exists() {
            return Err(StoreError::NotDeployed(self.path.clone()));
        }
        let raw = fs::read(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Block until this process holds the deployment exclusively.
    pub fn lock(&self) -> Result<DeploymentLock, StoreError> {
        let file = self.open_lock_file()?;
        flock_exclusive(&file, false).map_err(|source| StoreError::Io {
            path: self.lock_path.clone(),
            source,
        })?;
        Ok(DeploymentLock { _file: file })
    }

    /// Like [`lock`](Self::lock) but returns `None` instead of waiting when
    /// another holder exists.
    pub fn try_lock(&self) -> Result<Option<DeploymentLock>, StoreError> {
        let file = self.open_lock_file()?;
        let acquired = flock_exclusive(&file, true).map_err(|source| StoreError::Io {
            path: self.lock_path.clone(),
            source,
        })?;
        Ok(acquired.then_some(DeploymentLock { _file: file }))
    }

    fn open_lock_file(&self) -> Result<File, StoreError> {
        if !self.path.exists() {
            return Err(StoreError::NotDeployed(self.path.clone()));
        }
        let mut options = fs::OpenOptions::new();
        options.create(true).write(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(&self.lock_path).map_err(|source| StoreError::Io {
            path: self.lock_path.clone(),
            source,
        })
    }

    /// Replace `loaded` with `next`.
    ///
    /// Refuses with [`StoreError::Conflict`] when the stored deployment is
    /// no longer `loaded`, and with [`StoreError::RecordMismatch`] when
    /// `next` would change the deployment record or authority key.
    pub fn update(&self, loaded: &KernelSnapshot, next: &KernelSnapshot) -> Result<(), StoreError> {
        let current = self.load()?;
        if current.record != next.record || current.authority_key != next.authority_key {
            return Err(StoreError::RecordMismatch(self.path.clone()));
        }
        if current != *loaded {
            return Err(StoreError::Conflict(self.path.clone()));
        }
        let raw = serde_json::to_vec_pretty(next)?;
        let tmp = self.path.with_extension("json.tmp");
        write_owner_only(&tmp, &raw, false)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// `flock(LOCK_EX)` on `file`, optionally non-blocking.  Returns `Ok(false)`
/// only when `nonblocking` is set and someone else holds the lock.  A no-op
/// that always succeeds off Unix.
fn flock_exclusive(file: &File, nonblocking: bool) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let mut op = libc::LOCK_EX;
        if nonblocking {
            op |= libc::LOCK_NB;
        }
        loop {
            // SAFETY: `file` owns a valid descriptor for the whole call.
            let result = unsafe { libc::flock(file.as_raw_fd(), op) };
            if result == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock if nonblocking => return Ok(false),
                _ => return Err(err),
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (file, nonblocking);
        Ok(true)
    }
}

/// Write `contents` to `path` readable by the owner only on Unix.  A missing
/// parent directory is created with `0o700`; an existing one is left alone.
/// With `create_new` the write fails if the file already exists.
pub(crate) fn write_owner_only(
    path: &Path,
    contents: &[u8],
    create_new: bool,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
        }
    }
    let mut options = fs::OpenOptions::new();
    options.write(true);
    if create_new {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use heartbeat_types::{ConsumedNonce, DeploymentRecord, KernelIdentity, Nonce};

    fn snapshot() -> KernelSnapshot {
        KernelSnapshot {
            identity: KernelIdentity::default(),
            record: DeploymentRecord {
                deployed_at: 1_000,
                deployed_height: 0,
            },
            authority_key: "11".repeat(32),
            replay_protection: false,
            consumed_nonces: Vec::new(),
            events: Vec::new(),
        }
    }

    #[test]
    fn create_then_load() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = DeploymentStore::in_dir(dir.path());
        store.create(&snapshot()).expect("create");
        assert_eq!(store.load().expect("load"), snapshot());
    }

    #[test]
    fn second_deploy_is_refused() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = DeploymentStore::in_dir(dir.path());
        store.create(&snapshot()).expect("create");
        assert!(matches!(
            store.create(&snapshot()),
            Err(StoreError::AlreadyDeployed(_))
        ));
    }

    #[test]
    fn load_without_deployment_fails() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = DeploymentStore::in_dir(dir.path());
        assert!(matches!(store.load(), Err(StoreError::NotDeployed(_))));
    }

    #[test]
    fn update_cannot_change_the_deployment_record() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = DeploymentStore::in_dir(dir.path());
        store.create(&snapshot()).expect("create");

        let mut moved = snapshot();
        moved.record.deployed_at = 2_000;
        assert!(matches!(
            store.update(&snapshot(), &moved),
            Err(StoreError::RecordMismatch(_))
        ));

        let mut same = snapshot();
        same.replay_protection = true;
        store.update(&snapshot(), &same).expect("update");
        assert!(store.load().unwrap().replay_protection);
    }

    #[test]
    fn update_from_a_stale_load_is_a_conflict() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = DeploymentStore::in_dir(dir.path());
        store.create(&snapshot()).expect("create");

        let first = store.load().expect("load");
        let second = store.load().expect("load");
        let spend = |base: &KernelSnapshot| {
            let mut next = base.clone();
            next.consumed_nonces.push(ConsumedNonce {
                nonce: Nonce([1u8; 32]),
                not_after: None,
            });
            next
        };

        store.update(&first, &spend(&first)).expect("first update");
        assert!(matches!(
            store.update(&second, &spend(&second)),
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.load().unwrap().consumed_nonces.len(), 1);
    }

    #[test]
    fn lock_requires_a_deployment() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = DeploymentStore::in_dir(dir.path());
        assert!(matches!(store.lock(), Err(StoreError::NotDeployed(_))));
    }

    #[cfg(unix)]
    #[test]
    fn lock_excludes_a_second_holder() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = DeploymentStore::in_dir(dir.path());
        store.create(&snapshot()).expect("create");

        let held = store.lock().expect("lock");
        assert!(store.try_lock().expect("try_lock").is_none());
        drop(held);
        assert!(store.try_lock().expect("try_lock").is_some());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = DeploymentStore::in_dir(dir.path());
        std::fs::write(store.path(), b"{not json").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt(_))));
    }

    #[cfg(unix)]
    #[test]
    fn deployment_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let state_dir = dir.path().join("state");
        let store = DeploymentStore::in_dir(&state_dir);
        store.create(&snapshot()).expect("create");

        let file_mode = std::fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(&state_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }
}
