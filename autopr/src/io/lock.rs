//! PID lock file that keeps two orchestrators off the same repository.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    held: bool,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock. Returns `Ok(false)` if another live process holds it.
    ///
    /// A lock left behind by a process that no longer exists is replaced.
    pub fn acquire(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        for _ in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("write lock {}", self.path.display()))?;
                    self.held = true;
                    debug!(path = %self.path.display(), "lock acquired");
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let Some(stale_pid) = self.stale_holder() else {
                        return Ok(false);
                    };
                    warn!(path = %self.path.display(), stale_pid, "removing stale lock");
                    if !remove_if_held_by(&self.path, stale_pid)? {
                        debug!(path = %self.path.display(), "lock changed hands, retrying");
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("create lock {}", self.path.display()));
                }
            }
        }
        Ok(false)
    }

    /// Release the lock if held. Releasing an unheld lock is a no-op.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(err = %e, path = %self.path.display(), "failed to remove lock"),
        }
    }

    /// PID of a holder that no longer exists, if the lock is stale.
    fn stale_holder(&self) -> Option<u32> {
        let pid = read_holder(&self.path)?;
        (!process_alive(pid)).then_some(pid)
    }
}

/// Unreadable contents yield `None`: another process may be mid-write.
fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Remove the lock only if it still names `pid`.
///
/// Another process may have replaced the stale lock with its own since it was
/// inspected; that fresh lock must survive.
fn remove_if_held_by(path: &Path, pid: u32) -> Result<bool> {
    if read_holder(path) != Some(pid) {
        return Ok(false);
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove stale lock {}", path.display())),
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}
