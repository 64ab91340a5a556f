//! Inter-process gate around the serial port.
//!
//! The modem is a shared peripheral: several processes (a daemon, a cron
//! job, a shell one-liner) may hold the same device node open. Every AT
//! transaction therefore takes an advisory `flock` on a well-known
//! lockfile in addition to the channel's own in-process `Mutex`. The two
//! layers are always acquired together — mutex first, flock second — and
//! both release on every exit path via `Drop`.
//!
//! Where the filesystem (or platform) does not support advisory locks,
//! this layer degrades to a no-op: serial access is then serialized
//! within the process only, and a warning is logged once.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::{Flock, FlockArg};
use tracing::warn;

/// Default lockfile shared by all users of the modem.
pub const DEFAULT_LOCKFILE: &str = "/tmp/sim800ctl.lock";

/// Advisory exclusive lock on a named file.
///
/// `acquire()` blocks until the lock is granted and returns a guard that
/// unlocks on drop. A `None` path disables the inter-process layer.
pub struct LockFile {
    path: Option<PathBuf>,
    warned: AtomicBool,
}

impl LockFile {
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            warned: AtomicBool::new(false),
        }
    }

    /// Take the exclusive flock, blocking until granted.
    ///
    /// Returns `None` when the layer is disabled or unsupported; callers
    /// proceed with in-process locking only.
    pub fn acquire(&self) -> Option<Flock<File>> {
        let path = self.path.as_ref()?;

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(path)
        {
            Ok(f) => f,
            Err(e) => {
                self.warn_once(&format!("cannot open lockfile {}: {e}", path.display()));
                return None;
            }
        };

        match Flock::lock(file, FlockArg::LockExclusive) {
            Ok(guard) => Some(guard),
            Err((_, e)) => {
                self.warn_once(&format!("flock on {} unsupported: {e}", path.display()));
                None
            }
        }
    }

    fn warn_once(&self, msg: &str) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("{msg} — continuing with in-process locking only");
        }
    }
}
