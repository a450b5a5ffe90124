//! Input locks.
//!
//! A lock is a marker file created with `O_EXCL` next to the locked path
//! (`/media/in/movie.mkv` -> `/media/in/movie.mkv.lock`). It records the owner's
//! pid, the owner's process instance, a random token and the acquisition time,
//! so a later process can tell whether the owner is still alive and reclaim the
//! lock if it is not. The instance tells a restarted process that reused its
//! predecessor's pid (pid 1 in a container) apart from that predecessor.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors from lock operations. Contention is not an error; see [`LockOutcome`].
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode lock info: {0}")]
    Encode(#[from] serde_json::Error),
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    /// [`process_instance`] of the owner; empty in locks written before it existed.
    #[serde(default)]
    pub instance: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

/// Proof of ownership of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub path: PathBuf,
    pub lock_path: PathBuf,
    pub token: String,
}

/// Result of [`LockManager::acquire`].
#[derive(Debug)]
pub enum LockOutcome {
    Acquired(LockHandle),
    /// Held by a live owner (or being reclaimed by someone else).
    AlreadyLocked(Option<LockInfo>),
}

/// Marker-file path for `path`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

/// Random id of this run of the process, shared by every [`LockManager`] in it.
pub fn process_instance() -> &'static str {
    static INSTANCE: OnceLock<String> = OnceLock::new();
    INSTANCE.get_or_init(|| Uuid::new_v4().to_string())
}

/// Whether a process with this pid exists.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    if unsafe { libc::kill(pid as i32, 0) } == 0 {
        return true;
    }
    // EPERM: exists but belongs to another user.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Reads a lock file. `Ok(None)` if it does not exist; `Err` if unreadable.
pub fn read_lock(lock_path: &Path) -> Result<Option<LockInfo>, io::Error> {
    match fs::read_to_string(lock_path) {
        Ok(content) => serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Creates, inspects, reclaims and releases lock files.
#[derive(Debug, Clone)]
pub struct LockManager {
    pid: u32,
    stale_after: Duration,
}

impl LockManager {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            pid: std::process::id(),
            stale_after,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Tries to take the lock for `path`.
    ///
    /// A lock whose owner is dead, which carries this process's pid but an
    /// earlier instance, or which is unreadable and older than `stale_after`,
    /// is reclaimed.
    pub fn acquire(&self, path: &Path) -> Result<LockOutcome, LockError> {
        let lock_path = lock_path_for(path);
        let token = Uuid::new_v4().to_string();

        if let Some(handle) = self.try_create(path, &lock_path, &token)? {
            debug!("Acquired lock {}", lock_path.display());
            return Ok(LockOutcome::Acquired(handle));
        }

        let existing = read_lock(&lock_path);
        if !self.is_stale(&lock_path, &existing) {
            return Ok(LockOutcome::AlreadyLocked(existing.ok().flatten()));
        }

        self.reclaim(path, &lock_path, &token, existing.ok().flatten())
    }

    /// Re-takes a lock a previous process acquired for a job with `token`.
    ///
    /// Returns `None` if another live owner holds the lock under a different token.
    pub fn adopt(&self, path: &Path, token: &str) -> Result<Option<LockHandle>, LockError> {
        let lock_path = lock_path_for(path);
        let handle = LockHandle {
            path: path.to_path_buf(),
            lock_path: lock_path.clone(),
            token: token.to_string(),
        };

        match read_lock(&lock_path) {
            Ok(Some(info)) if info.token == token => {
                if info.pid != self.pid || info.instance != process_instance() {
                    self.write_info(&lock_path, token)?;
                    info!("Adopted lock {} from pid {}", lock_path.display(), info.pid);
                }
                Ok(Some(handle))
            }
            Ok(None) => Ok(self.try_create(path, &lock_path, token)?),
            existing => {
                if self.is_stale(&lock_path, &existing) {
                    match self.reclaim(path, &lock_path, token, existing.ok().flatten())? {
                        LockOutcome::Acquired(handle) => Ok(Some(handle)),
                        LockOutcome::AlreadyLocked(_) => Ok(None),
                    }
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Removes the lock if it still carries the handle's token. Releasing twice is a no-op.
    pub fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        self.release_token(&handle.path, &handle.token)
    }

    /// Like [`release`](Self::release) for callers holding only the persisted token.
    pub fn release_token(&self, path: &Path, token: &str) -> Result<(), LockError> {
        let lock_path = lock_path_for(path);
        match read_lock(&lock_path) {
            Ok(None) => Ok(()),
            Ok(Some(info)) if info.token == token => match fs::remove_file(&lock_path) {
                Ok(()) => {
                    debug!("Released lock {}", lock_path.display());
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(LockError::io(&lock_path, e)),
            },
            Ok(Some(info)) => {
                warn!(
                    "Not releasing {}: now owned by pid {} with another token",
                    lock_path.display(),
                    info.pid
                );
                Ok(())
            }
            Err(e) => {
                warn!("Not releasing unreadable lock {}: {}", lock_path.display(), e);
                Ok(())
            }
        }
    }

    /// Current owner of the lock on `path`, if any.
    pub fn inspect(&self, path: &Path) -> Option<LockInfo> {
        read_lock(&lock_path_for(path)).ok().flatten()
    }

    fn try_create(
        &self,
        path: &Path,
        lock_path: &Path,
        token: &str,
    ) -> Result<Option<LockHandle>, LockError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(LockError::io(lock_path, e)),
        };
        let info = self.info(token);
        let json = serde_json::to_vec(&info)?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| LockError::io(lock_path, e))?;
        Ok(Some(LockHandle {
            path: path.to_path_buf(),
            lock_path: lock_path.to_path_buf(),
            token: token.to_string(),
        }))
    }

    fn info(&self, token: &str) -> LockInfo {
        LockInfo {
            pid: self.pid,
            instance: process_instance().to_string(),
            token: token.to_string(),
            acquired_at: Utc::now(),
        }
    }

    /// Overwrites an owned lock file in place (tmp + rename).
    fn write_info(&self, lock_path: &Path, token: &str) -> Result<(), LockError> {
        let mut tmp = lock_path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let json = serde_json::to_vec(&self.info(token))?;
        {
            let mut file = File::create(&tmp).map_err(|e| LockError::io(&tmp, e))?;
            file.write_all(&json)
                .and_then(|_| file.sync_all())
                .map_err(|e| LockError::io(&tmp, e))?;
        }
        fs::rename(&tmp, lock_path).map_err(|e| LockError::io(lock_path, e))
    }

    fn is_stale(&self, lock_path: &Path, existing: &Result<Option<LockInfo>, io::Error>) -> bool {
        match existing {
            // Vanished between create and read; let the caller's reclaim path retry.
            Ok(None) => true,
            // Our own pid from another instance: we crashed and got the pid back.
            Ok(Some(info)) if info.pid == self.pid => info.instance != process_instance(),
            Ok(Some(info)) => !pid_alive(info.pid),
            // Unreadable: possibly a writer between create and write. Only age makes it stale.
            Err(_) => file_age(lock_path)
                .map(|age| age > self.stale_after)
                .unwrap_or(false),
        }
    }

    /// Replaces a stale lock. Reclaimers serialize on a `<lock>.reclaim` guard so
    /// two processes cannot both delete-then-create.
    fn reclaim(
        &self,
        path: &Path,
        lock_path: &Path,
        token: &str,
        observed: Option<LockInfo>,
    ) -> Result<LockOutcome, LockError> {
        let mut guard = lock_path.as_os_str().to_owned();
        guard.push(".reclaim");
        let guard = PathBuf::from(guard);

        match OpenOptions::new().write(true).create_new(true).open(&guard) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let abandoned = file_age(&guard)
                    .map(|age| age > self.stale_after)
                    .unwrap_or(false);
                if abandoned {
                    warn!("Removing abandoned reclaim guard {}", guard.display());
                    let _ = fs::remove_file(&guard);
                }
                return Ok(LockOutcome::AlreadyLocked(observed));
            }
            Err(e) => return Err(LockError::io(&guard, e)),
        }

        let result = self.reclaim_guarded(path, lock_path, token, observed);
        if let Err(e) = fs::remove_file(&guard) {
            warn!("Failed to remove reclaim guard {}: {}", guard.display(), e);
        }
        result
    }

    fn reclaim_guarded(
        &self,
        path: &Path,
        lock_path: &Path,
        token: &str,
        observed: Option<LockInfo>,
    ) -> Result<LockOutcome, LockError> {
        // Re-check under the guard: someone may have reclaimed and released already.
        let current = read_lock(lock_path);
        let unchanged = match (&current, &observed) {
            (Ok(Some(now)), Some(before)) => now == before,
            (Ok(None), _) => true,
            (Err(_), None) => true,
            _ => false,
        };
        if !unchanged || !self.is_stale(lock_path, &current) {
            return Ok(LockOutcome::AlreadyLocked(current.ok().flatten()));
        }

        if let Some(info) = &observed {
            warn!(
                "Reclaiming stale lock {} (pid {} acquired {})",
                lock_path.display(),
                info.pid,
                info.acquired_at.to_rfc3339()
            );
        } else {
            warn!("Reclaiming unreadable lock {}", lock_path.display());
        }
        match fs::remove_file(lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(LockError::io(lock_path, e)),
        }

        match self.try_create(path, lock_path, token)? {
            Some(handle) => Ok(LockOutcome::Acquired(handle)),
            None => Ok(LockOutcome::AlreadyLocked(read_lock(lock_path).ok().flatten())),
        }
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    /// Writes a lock owned by `pid`; our own pid is written as a live owner in this instance.
    fn write_foreign_lock(path: &Path, pid: u32, token: &str) {
        let instance = if pid == std::process::id() {
            process_instance().to_string()
        } else {
            "elsewhere".to_string()
        };
        write_lock_info(path, pid, &instance, token, Utc::now());
    }

    fn write_lock_info(path: &Path, pid: u32, instance: &str, token: &str, at: DateTime<Utc>) {
        let info = LockInfo {
            pid,
            instance: instance.to_string(),
            token: token.to_string(),
            acquired_at: at,
        };
        fs::write(lock_path_for(path), serde_json::to_vec(&info).unwrap()).unwrap();
    }

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/media/in/movie.mkv")),
            PathBuf::from("/media/in/movie.mkv.lock")
        );
    }

    #[test]
    fn test_acquire_then_contend() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.mkv");
        let locks = LockManager::new(Duration::from_secs(3600));

        let handle = match locks.acquire(&file).unwrap() {
            LockOutcome::Acquired(handle) => handle,
            other => panic!("expected acquire, got {:?}", other),
        };
        let info = read_lock(&handle.lock_path).unwrap().unwrap();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.token, handle.token);

        match locks.acquire(&file).unwrap() {
            LockOutcome::AlreadyLocked(Some(owner)) => assert_eq!(owner.token, handle.token),
            other => panic!("expected contention, got {:?}", other),
        }
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.mkv");
        let locks = LockManager::new(Duration::from_secs(3600));
        let LockOutcome::Acquired(handle) = locks.acquire(&file).unwrap() else {
            panic!("expected acquire");
        };

        locks.release(&handle).unwrap();
        assert!(!handle.lock_path.exists());
        locks.release(&handle).unwrap();
        assert!(matches!(locks.acquire(&file).unwrap(), LockOutcome::Acquired(_)));
    }

    #[test]
    fn test_release_leaves_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.mkv");
        let locks = LockManager::new(Duration::from_secs(3600));
        write_foreign_lock(&file, std::process::id(), "someone-else");

        locks.release_token(&file, "mine").unwrap();
        assert!(lock_path_for(&file).exists());
    }

    #[test]
    fn test_dead_owner_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.mkv");
        let locks = LockManager::new(Duration::from_secs(3600));
        write_foreign_lock(&file, dead_pid(), "crashed");

        match locks.acquire(&file).unwrap() {
            LockOutcome::Acquired(handle) => assert_ne!(handle.token, "crashed"),
            other => panic!("expected reclaim, got {:?}", other),
        }
        let guard = dir.path().join("a.mkv.lock.reclaim");
        assert!(!guard.exists());
    }

    #[test]
    fn test_own_pid_from_previous_instance_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.mkv");
        let locks = LockManager::new(Duration::from_secs(3600));
        let three_days_ago = Utc::now() - chrono::Duration::days(3);
        write_lock_info(&file, std::process::id(), "crashed-incarnation", "old", three_days_ago);

        let LockOutcome::Acquired(handle) = locks.acquire(&file).unwrap() else {
            panic!("expected reclaim of our previous instance's lock");
        };
        let info = read_lock(&handle.lock_path).unwrap().unwrap();
        assert_eq!(info.instance, process_instance());
        assert_ne!(info.token, "old");

        // Locks written before instances were recorded count as a previous instance too.
        let legacy = dir.path().join("b.mkv");
        fs::write(
            lock_path_for(&legacy),
            format!(
                r#"{{"pid":{},"token":"t","acquired_at":"{}"}}"#,
                std::process::id(),
                three_days_ago.to_rfc3339()
            ),
        )
        .unwrap();
        assert!(matches!(locks.acquire(&legacy).unwrap(), LockOutcome::Acquired(_)));
    }

    #[test]
    fn test_adopt_rewrites_previous_instance_with_same_pid() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.mkv");
        let locks = LockManager::new(Duration::from_secs(3600));
        write_lock_info(&file, std::process::id(), "crashed-incarnation", "job-token", Utc::now());

        let handle = locks.adopt(&file, "job-token").unwrap().unwrap();
        let info = read_lock(&handle.lock_path).unwrap().unwrap();
        assert_eq!(info.token, "job-token");
        assert_eq!(info.instance, process_instance());
    }

    #[test]
    fn test_unreadable_lock_respects_age() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.mkv");
        fs::write(lock_path_for(&file), b"").unwrap();

        let patient = LockManager::new(Duration::from_secs(3600));
        assert!(matches!(
            patient.acquire(&file).unwrap(),
            LockOutcome::AlreadyLocked(None)
        ));

        std::thread::sleep(Duration::from_millis(20));
        let impatient = LockManager::new(Duration::from_millis(1));
        assert!(matches!(
            impatient.acquire(&file).unwrap(),
            LockOutcome::Acquired(_)
        ));
    }

    #[test]
    fn test_adopt_keeps_token_of_crashed_owner() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.mkv");
        let locks = LockManager::new(Duration::from_secs(3600));
        write_foreign_lock(&file, dead_pid(), "job-token");

        let handle = locks.adopt(&file, "job-token").unwrap().unwrap();
        assert_eq!(handle.token, "job-token");
        let info = read_lock(&handle.lock_path).unwrap().unwrap();
        assert_eq!(info.pid, std::process::id());

        // A live owner under a different token is left alone.
        write_foreign_lock(&file, std::process::id(), "other");
        assert!(locks.adopt(&file, "job-token").unwrap().is_none());
    }

    #[test]
    fn test_adopt_recreates_missing_lock() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.mkv");
        let locks = LockManager::new(Duration::from_secs(3600));
        let handle = locks.adopt(&file, "job-token").unwrap().unwrap();
        assert!(handle.lock_path.exists());
    }

    #[test]
    fn test_pid_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
        assert!(!pid_alive(dead_pid()));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let dir = TempDir::new().unwrap();
        let file = Arc::new(dir.path().join("race.mkv"));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let file = Arc::clone(&file);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let locks = LockManager::new(Duration::from_secs(3600));
                    barrier.wait();
                    matches!(locks.acquire(&file).unwrap(), LockOutcome::Acquired(_))
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_reclaim_single_winner() {
        let dir = TempDir::new().unwrap();
        let file = Arc::new(dir.path().join("stale.mkv"));
        write_foreign_lock(&file, dead_pid(), "crashed");
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let file = Arc::clone(&file);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let locks = LockManager::new(Duration::from_secs(3600));
                    barrier.wait();
                    matches!(locks.acquire(&file).unwrap(), LockOutcome::Acquired(_))
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(lock_path_for(&file).exists());
    }
}
