//! Process-wide print lock backed by a durable record.
//!
//! The record is keyed by the pid of whoever currently owns the job: the
//! host while it prepares a submission, then the spawned toolchain once
//! [`LockGuard::transfer`] hands it over. The toolchain deletes the record
//! itself when it finishes, so release does not have to happen in the
//! process that acquired. A record whose owner is no longer alive is
//! treated as free.

use chrono::{DateTime, Utc};
use makeme_shared::LockState;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::job_runner::pid_alive;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_pid: Option<u32>,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn owned_by(pid: u32) -> Self {
        Self {
            owner_pid: Some(pid),
            acquired_at: Utc::now(),
        }
    }

    /// A record naming a pid that no longer exists.
    pub fn is_stale(&self) -> bool {
        self.owner_pid.is_some_and(|pid| !pid_alive(pid))
    }

    fn state(&self) -> LockState {
        LockState::Held {
            owner_pid: self.owner_pid,
            acquired_at: self.acquired_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum LockStoreError {
    #[error("IO error on lock record: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to encode lock record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Print job already running (owner pid {owner_pid:?}, since {acquired_at})")]
    AlreadyLocked {
        owner_pid: Option<u32>,
        acquired_at: DateTime<Utc>,
    },
    #[error(transparent)]
    Store(#[from] LockStoreError),
}

/// Outcome of an exclusive create.
#[derive(Debug, PartialEq, Eq)]
pub enum Created {
    Yes,
    Exists,
}

/// What is currently stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stored {
    Missing,
    /// Present but empty or unreadable.
    Invalid,
    Record(LockRecord),
}

/// Durable storage for the single lock record.
///
/// Every mutating call is atomic with respect to the others, so a
/// compare-and-delete never removes a record created by someone else.
pub trait LockStore: Send + Sync {
    /// Store `record` only if nothing is stored yet.
    fn create(&self, record: &LockRecord) -> Result<Created, LockStoreError>;
    fn load(&self) -> Result<Stored, LockStoreError>;
    /// Overwrite the record only while `expected` is still stored.
    fn replace(&self, expected: &LockRecord, record: &LockRecord) -> Result<bool, LockStoreError>;
    /// Remove the record only while `expected` is still stored.
    fn remove_if(&self, expected: &Stored) -> Result<bool, LockStoreError>;
    /// Unconditional and idempotent.
    fn remove(&self) -> Result<(), LockStoreError>;
    /// Filesystem location, for processes that clear the lock themselves.
    fn location(&self) -> Option<&Path> {
        None
    }
}

#[cfg(unix)]
type Exclusive = nix::fcntl::Flock<std::fs::File>;
#[cfg(not(unix))]
type Exclusive = std::sync::MutexGuard<'static, ()>;

/// JSON lock record at a fixed path.
///
/// Mutations are serialized by an exclusive `flock` on a sidecar
/// `<lock>.guard` file, across threads and processes alike. The sidecar is
/// never deleted. Reads need no guard: records are always renamed into place
/// whole.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    path: PathBuf,
}

impl FileLockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    fn guard_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".guard");
        self.dir().join(name)
    }

    #[cfg(unix)]
    fn exclusive(&self) -> Result<Exclusive, LockStoreError> {
        use nix::fcntl::{Flock, FlockArg};

        std::fs::create_dir_all(self.dir())?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.guard_path())?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| LockStoreError::Io(io::Error::from(errno)))
    }

    #[cfg(not(unix))]
    fn exclusive(&self) -> Result<Exclusive, LockStoreError> {
        // Without flock only in-process callers are serialized.
        static LOCAL: Mutex<()> = Mutex::new(());
        std::fs::create_dir_all(self.dir())?;
        Ok(LOCAL.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn staged(&self, record: &LockRecord) -> Result<NamedTempFile, LockStoreError> {
        std::fs::create_dir_all(self.dir())?;
        let mut tmp = NamedTempFile::new_in(self.dir())?;
        serde_json::to_writer(tmp.as_file_mut(), record)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    fn unlink(&self) -> Result<(), LockStoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl LockStore for FileLockStore {
    fn create(&self, record: &LockRecord) -> Result<Created, LockStoreError> {
        let tmp = self.staged(record)?;
        let _guard = self.exclusive()?;
        // Linking into place fails if the path exists, so readers never see a partial record.
        match tmp.persist_noclobber(&self.path) {
            Ok(_) => Ok(Created::Yes),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(Created::Exists),
            Err(e) => Err(e.error.into()),
        }
    }

    fn load(&self) -> Result<Stored, LockStoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Stored::Missing),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => return Ok(Stored::Invalid),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(content.trim()) {
            Ok(record) => Ok(Stored::Record(record)),
            Err(_) => Ok(Stored::Invalid),
        }
    }

    fn replace(&self, expected: &LockRecord, record: &LockRecord) -> Result<bool, LockStoreError> {
        let tmp = self.staged(record)?;
        let _guard = self.exclusive()?;
        match self.load()? {
            Stored::Record(current) if &current == expected => {
                tmp.persist(&self.path).map_err(|e| LockStoreError::Io(e.error))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove_if(&self, expected: &Stored) -> Result<bool, LockStoreError> {
        let _guard = self.exclusive()?;
        let current = self.load()?;
        if current == Stored::Missing || &current != expected {
            return Ok(false);
        }
        self.unlink()?;
        Ok(true)
    }

    fn remove(&self) -> Result<(), LockStoreError> {
        let _guard = self.exclusive()?;
        self.unlink()
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// In-memory store for tests
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    inner: Mutex<Option<Stored>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with arbitrary content.
    pub fn with(stored: Stored) -> Self {
        Self {
            inner: Mutex::new(Some(stored)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Stored>> {
        // A poisoned slot still holds a consistent Option.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LockStore for MemoryLockStore {
    fn create(&self, record: &LockRecord) -> Result<Created, LockStoreError> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Ok(Created::Exists);
        }
        *slot = Some(Stored::Record(record.clone()));
        Ok(Created::Yes)
    }

    fn load(&self) -> Result<Stored, LockStoreError> {
        Ok(self.slot().clone().unwrap_or(Stored::Missing))
    }

    fn replace(&self, expected: &LockRecord, record: &LockRecord) -> Result<bool, LockStoreError> {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(Stored::Record(current)) if current == expected => {
                *slot = Some(Stored::Record(record.clone()));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove_if(&self, expected: &Stored) -> Result<bool, LockStoreError> {
        let mut slot = self.slot();
        if slot.as_ref() == Some(expected) {
            *slot = None;
            return Ok(true);
        }
        Ok(false)
    }

    fn remove(&self) -> Result<(), LockStoreError> {
        *self.slot() = None;
        Ok(())
    }
}

/// The print lock. Cheap to clone; all state lives in the store.
#[derive(Clone)]
pub struct JobLock {
    store: Arc<dyn LockStore>,
}

impl JobLock {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileLockStore::new(path)))
    }

    pub fn location(&self) -> Option<&Path> {
        self.store.location()
    }

    /// Take the lock on behalf of the current process.
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        self.acquire_for(std::process::id())
    }

    pub fn acquire_for(&self, owner_pid: u32) -> Result<LockGuard, LockError> {
        let record = LockRecord::owned_by(owner_pid);
        // One retry after reclaiming a stale or invalid record.
        for _ in 0..2 {
            if self.store.create(&record)? == Created::Yes {
                tracing::info!("Job lock acquired by pid {}", owner_pid);
                return Ok(LockGuard {
                    lock: self.clone(),
                    record,
                    armed: true,
                });
            }
            match self.store.load()? {
                Stored::Record(existing) if existing.is_stale() => {
                    let (pid, since) = (existing.owner_pid, existing.acquired_at);
                    // Only the exact record seen here is removed; a fresh owner's record survives.
                    if self.store.remove_if(&Stored::Record(existing))? {
                        tracing::warn!("Reclaimed stale job lock held by dead pid {:?} since {}", pid, since);
                    }
                }
                Stored::Record(existing) => {
                    return Err(LockError::AlreadyLocked {
                        owner_pid: existing.owner_pid,
                        acquired_at: existing.acquired_at,
                    });
                }
                Stored::Invalid => {
                    if self.store.remove_if(&Stored::Invalid)? {
                        tracing::warn!("Discarded unreadable job lock record");
                    }
                }
                // Released between create and load.
                Stored::Missing => {}
            }
        }
        match self.store.load()? {
            Stored::Record(existing) => Err(LockError::AlreadyLocked {
                owner_pid: existing.owner_pid,
                acquired_at: existing.acquired_at,
            }),
            _ => Err(LockError::AlreadyLocked {
                owner_pid: None,
                acquired_at: Utc::now(),
            }),
        }
    }

    /// Current holder, without modifying the store. A stale record reads as free.
    pub fn inspect(&self) -> Result<LockState, LockError> {
        Ok(match self.store.load()? {
            Stored::Record(record) if !record.is_stale() => record.state(),
            _ => LockState::Free,
        })
    }

    /// Idempotent.
    pub fn release(&self) -> Result<(), LockError> {
        self.store.remove()?;
        tracing::info!("Job lock released");
        Ok(())
    }

    /// Release only if the record still names `pid`.
    pub fn release_if_owner(&self, pid: u32) -> Result<bool, LockError> {
        match self.store.load()? {
            Stored::Record(record) if record.owner_pid == Some(pid) => {
                let released = self.store.remove_if(&Stored::Record(record))?;
                if released {
                    tracing::info!("Job lock released for pid {}", pid);
                }
                Ok(released)
            }
            _ => Ok(false),
        }
    }

    fn remove_if_current(&self, expected: &LockRecord) -> Result<bool, LockError> {
        Ok(self.store.remove_if(&Stored::Record(expected.clone()))?)
    }
}

/// Held lock. Dropping it releases the lock unless ownership moved to a job process.
pub struct LockGuard {
    lock: JobLock,
    record: LockRecord,
    armed: bool,
}

impl LockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Hand the lock to the spawned job process. From here on the job clears it.
    pub fn transfer(mut self, pid: u32) -> Result<(), LockError> {
        self.armed = false;
        let record = LockRecord {
            owner_pid: Some(pid),
            acquired_at: self.record.acquired_at,
        };
        if !self.lock.store.replace(&self.record, &record)? {
            tracing::debug!("Job lock no longer ours, not handing it to pid {}", pid);
        }
        Ok(())
    }

    /// Release explicitly, surfacing store errors that `Drop` would only log.
    pub fn release(mut self) -> Result<(), LockError> {
        self.armed = false;
        self.lock.remove_if_current(&self.record).map(|_| ())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::info!("Releasing job lock after an unlaunched submission");
            if let Err(e) = self.lock.remove_if_current(&self.record) {
                tracing::warn!("Failed to release job lock: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_lock() -> JobLock {
        JobLock::new(Arc::new(MemoryLockStore::new()))
    }

    #[test]
    fn second_acquire_observes_the_holder() {
        let lock = memory_lock();
        let guard = lock.acquire().unwrap();
        match lock.acquire() {
            Err(LockError::AlreadyLocked { owner_pid, acquired_at }) => {
                assert_eq!(owner_pid, Some(std::process::id()));
                assert_eq!(acquired_at, guard.record().acquired_at);
            }
            other => panic!("expected AlreadyLocked, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn dropping_an_untransferred_guard_frees_the_lock() {
        let lock = memory_lock();
        drop(lock.acquire().unwrap());
        assert_eq!(lock.inspect().unwrap(), LockState::Free);
    }

    #[test]
    fn transferred_guard_keeps_the_lock_for_the_new_owner() {
        let lock = memory_lock();
        let own = std::process::id();
        lock.acquire().unwrap().transfer(own).unwrap();
        assert!(lock.inspect().unwrap().is_held());
        assert!(!lock.release_if_owner(own.wrapping_add(1)).unwrap());
        assert!(lock.release_if_owner(own).unwrap());
        assert_eq!(lock.inspect().unwrap(), LockState::Free);
    }

    #[test]
    fn invalid_record_counts_as_free() {
        let lock = JobLock::new(Arc::new(MemoryLockStore::with(Stored::Invalid)));
        assert_eq!(lock.inspect().unwrap(), LockState::Free);
        assert!(lock.acquire().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn dead_owner_is_reclaimed() {
        let dead = LockRecord::owned_by(i32::MAX as u32);
        let lock = JobLock::new(Arc::new(MemoryLockStore::with(Stored::Record(dead))));
        assert_eq!(lock.inspect().unwrap(), LockState::Free);
        let guard = lock.acquire().unwrap();
        assert_eq!(guard.record().owner_pid, Some(std::process::id()));
    }

    #[test]
    fn record_without_pid_is_never_stale() {
        let record = LockRecord { owner_pid: None, acquired_at: Utc::now() };
        let lock = JobLock::new(Arc::new(MemoryLockStore::with(Stored::Record(record))));
        assert!(lock.inspect().unwrap().is_held());
        assert!(matches!(lock.acquire(), Err(LockError::AlreadyLocked { owner_pid: None, .. })));
    }

    #[test]
    fn reclaim_only_removes_the_record_it_saw() {
        let stale = LockRecord::owned_by(i32::MAX as u32);
        let store = MemoryLockStore::with(Stored::Record(stale.clone()));
        assert!(store.remove_if(&Stored::Record(stale.clone())).unwrap());

        let fresh = LockRecord::owned_by(std::process::id());
        assert_eq!(store.create(&fresh).unwrap(), Created::Yes);
        assert!(!store.remove_if(&Stored::Record(stale)).unwrap());
        assert!(!store.remove_if(&Stored::Invalid).unwrap());
        assert_eq!(store.load().unwrap(), Stored::Record(fresh));
    }

    #[test]
    fn transfer_leaves_a_new_owner_alone() {
        let lock = memory_lock();
        let guard = lock.acquire().unwrap();
        // The job cleared the record and another submission took the lock.
        lock.release().unwrap();
        let other = lock.acquire_for(1).unwrap();

        guard.transfer(4242).unwrap();
        assert_eq!(lock.store.load().unwrap(), Stored::Record(other.record().clone()));
    }
}
