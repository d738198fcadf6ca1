//! Host-wide environment locks.
//!
//! Several scheduler processes on one host may share a handler configuration
//! table. [`EnvironmentLocks`] keeps them from driving the same environment
//! at once: a JSON file maps each locked environment id to the pid holding
//! it, and every read-modify-write of that file happens under an exclusive
//! `flock` on the sibling `<file>.lock`.
//!
//! Entries left behind by a process that died are removed by
//! [`prune`](EnvironmentLocks::prune).
//!
//! # Example
//!
//! ```no_run
//! use suitesched::environment::locks::EnvironmentLocks;
//!
//! let locks = EnvironmentLocks::new("/tmp/suitesched-environments.json");
//! if locks.lock("aws-account-1")? {
//!     // ... drive the environment ...
//!     locks.release("aws-account-1")?;
//! }
//! # Ok::<(), suitesched::environment::locks::LockError>(())
//! ```

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Errors from reading or writing the lock file.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Failed to access lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt lock file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type LockResult<T> = Result<T, LockError>;

/// Environment id -> pid of the holding process.
type Held = BTreeMap<String, u32>;

/// File-backed set of locked environment ids shared between processes.
#[derive(Debug, Clone)]
pub struct EnvironmentLocks {
    path: PathBuf,
    guard_path: PathBuf,
    pid: u32,
}

impl EnvironmentLocks {
    /// Locks recorded in `path`, held on behalf of the current process.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut guard_path = path.clone().into_os_string();
        guard_path.push(".lock");
        Self {
            path,
            guard_path: PathBuf::from(guard_path),
            pid: std::process::id(),
        }
    }

    /// Records locks as held by `pid` instead of the current process.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Takes `env_id`. Returns `false` if some process already holds it,
    /// this one included.
    pub fn lock(&self, env_id: &str) -> LockResult<bool> {
        self.update(|held| {
            if held.contains_key(env_id) {
                return false;
            }
            held.insert(env_id.to_string(), self.pid);
            true
        })
    }

    /// Drops `env_id` whoever holds it. Releasing a free id is a no-op.
    pub fn release(&self, env_id: &str) -> LockResult<()> {
        self.update(|held| {
            held.remove(env_id);
        })
    }

    /// Pid currently holding `env_id`, if any.
    pub fn holder(&self, env_id: &str) -> LockResult<Option<u32>> {
        self.update(|held| held.get(env_id).copied())
    }

    /// Removes entries whose holder is no longer a running scheduler.
    ///
    /// With `include_self`, entries held by this process go too. Returns
    /// the ids that were removed.
    pub fn prune(&self, include_self: bool) -> LockResult<Vec<String>> {
        self.prune_with(include_self, is_scheduler_process)
    }

    /// Like [`prune`](Self::prune) with a caller-supplied liveness check.
    pub fn prune_with(
        &self,
        include_self: bool,
        is_live: impl Fn(u32) -> bool,
    ) -> LockResult<Vec<String>> {
        self.update(|held| {
            let stale: Vec<String> = held
                .iter()
                .filter(|&(_, &pid)| {
                    if pid == self.pid {
                        include_self
                    } else {
                        !is_live(pid)
                    }
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                held.remove(id);
            }
            stale
        })
    }

    fn update<T>(&self, change: impl FnOnce(&mut Held) -> T) -> LockResult<T> {
        let _guard = FileGuard::acquire(&self.guard_path).map_err(|source| LockError::Io {
            path: self.guard_path.clone(),
            source,
        })?;

        let mut held = self.read()?;
        let before = held.clone();
        let out = change(&mut held);
        if held != before {
            self.write(&held)?;
        }
        Ok(out)
    }

    fn read(&self) -> LockResult<Held> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Held::new()),
            Err(source) => {
                return Err(LockError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if content.trim().is_empty() {
            return Ok(Held::new());
        }
        serde_json::from_str(&content).map_err(|source| LockError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, held: &Held) -> LockResult<()> {
        let json = serde_json::to_string_pretty(held).map_err(|source| LockError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, json).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Exclusive `flock` held until drop.
struct FileGuard {
    file: File,
}

impl FileGuard {
    fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        flock(&file, true)?;
        Ok(Self { file })
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = flock(&self.file, false);
    }
}

#[cfg(unix)]
fn flock(file: &File, exclusive: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_UN };
    loop {
        let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _exclusive: bool) -> io::Result<()> {
    Ok(())
}

/// Returns `true` if `pid` is alive and looks like a suitesched process.
#[cfg(unix)]
pub fn is_scheduler_process(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 only checks existence; EPERM still means alive.
    if unsafe { libc::kill(raw, 0) } != 0
        && io::Error::last_os_error().raw_os_error() != Some(libc::EPERM)
    {
        return false;
    }

    // Pids get recycled; an unrelated program does not hold our locks.
    match std::fs::read(format!("/proc/{}/cmdline", pid)) {
        Ok(cmdline) => String::from_utf8_lossy(&cmdline).contains(env!("CARGO_PKG_NAME")),
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn is_scheduler_process(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const OTHER_PID: u32 = 1;
    const RUNNER_PID: u32 = 100;
    const OBSERVER_PID: u32 = 7;

    fn locks(dir: &tempfile::TempDir) -> EnvironmentLocks {
        EnvironmentLocks::new(dir.path().join("environments.json"))
    }

    #[test]
    fn test_lock_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(&dir);

        assert!(locks.lock("ENV").unwrap());
        assert!(!locks.lock("ENV").unwrap());
        assert_eq!(locks.holder("ENV").unwrap(), Some(std::process::id()));

        locks.release("ENV").unwrap();
        assert_eq!(locks.holder("ENV").unwrap(), None);
        assert!(locks.lock("ENV").unwrap());
    }

    #[test]
    fn test_locks_are_shared_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = locks(&dir).with_pid(OTHER_PID);
        let second = locks(&dir).with_pid(RUNNER_PID);

        assert!(first.lock("ENV").unwrap());
        assert!(!second.lock("ENV").unwrap());
        assert_eq!(second.holder("ENV").unwrap(), Some(OTHER_PID));
        assert!(dir.path().join("environments.json.lock").exists());
    }

    #[test]
    fn test_prune_drops_dead_holders() {
        let dir = tempfile::tempdir().unwrap();
        let is_live = |pid: u32| pid != OTHER_PID;

        for env in ["ENV1", "ENV2"] {
            assert!(locks(&dir).with_pid(OTHER_PID).lock(env).unwrap());
        }
        for env in ["ENV3", "ENV4"] {
            assert!(locks(&dir).with_pid(RUNNER_PID).lock(env).unwrap());
        }

        let observer = locks(&dir).with_pid(OBSERVER_PID);
        let pruned = observer.prune_with(false, is_live).unwrap();
        assert_eq!(pruned, vec!["ENV1".to_string(), "ENV2".to_string()]);

        for env in ["ENV1", "ENV2"] {
            assert!(observer.lock(env).unwrap());
        }
        for env in ["ENV3", "ENV4"] {
            assert!(!observer.lock(env).unwrap());
        }

        // A live runner keeps its own entries unless it asks otherwise.
        let runner = locks(&dir).with_pid(RUNNER_PID);
        assert!(runner.prune_with(false, is_live).unwrap().is_empty());
        runner.prune_with(true, is_live).unwrap();

        for env in ["ENV3", "ENV4"] {
            assert!(observer.lock(env).unwrap());
        }
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(&dir);
        std::fs::write(locks.path(), "not json").unwrap();

        assert!(matches!(locks.lock("ENV"), Err(LockError::Corrupt { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_current_process_counts_as_scheduler() {
        assert!(is_scheduler_process(std::process::id()));
        assert!(!is_scheduler_process(0));
        assert!(!is_scheduler_process(999_999_999));
    }
}
