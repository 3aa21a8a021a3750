use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fd_lock::{RwLock, RwLockWriteGuard};
use serde::Serialize;
use tracing::debug;

use crate::error::BootstrapError;
use crate::fsutil::ensure_parent;

/// The OS lock file guarding an isolated runtime directory.
///
/// The file sits next to the runtime (`<root>.lock`) because the runtime
/// itself may be deleted while the lock is held. Exclusion comes from an
/// advisory OS lock on the open file, which the kernel drops when the holder
/// exits; the PID written into the file is only a hint for diagnostics.
pub struct RuntimeLockFile {
    root: PathBuf,
    path: PathBuf,
    file: RwLock<File>,
}

/// A held runtime lock. Functions that create or delete a runtime take
/// `&RuntimeLock` so the precondition is carried by the type.
pub struct RuntimeLock<'a> {
    root: &'a Path,
    path: &'a Path,
    guard: RwLockWriteGuard<'a, File>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockStatus {
    Free,
    Held { pid: Option<u32> },
}

pub fn lock_path_for(root: &Path) -> PathBuf {
    let mut name = root
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "runtime".into());
    name.push(".lock");
    root.with_file_name(name)
}

impl RuntimeLockFile {
    pub fn open(root: &Path) -> Result<RuntimeLockFile, BootstrapError> {
        let path = lock_path_for(root);
        ensure_parent(&path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(RuntimeLockFile {
            root: root.to_path_buf(),
            path,
            file: RwLock::new(file),
        })
    }

    /// Takes the lock without waiting; another holder gives `LockHeld`.
    pub fn acquire(&mut self) -> Result<RuntimeLock<'_>, BootstrapError> {
        let mut guard = match self.file.try_write() {
            Ok(guard) => guard,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Err(BootstrapError::LockHeld {
                    path: self.path.clone(),
                    pid: read_holder_pid(&self.path),
                });
            }
            Err(err) => return Err(BootstrapError::Io(err)),
        };
        record_pid(&mut guard)?;
        debug!(lock = %self.path.display(), "runtime lock acquired");
        Ok(RuntimeLock {
            root: &self.root,
            path: &self.path,
            guard,
        })
    }
}

fn record_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

impl fmt::Debug for RuntimeLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeLock")
            .field("root", &self.root)
            .field("path", &self.path)
            .finish()
    }
}

impl RuntimeLock<'_> {
    pub fn path(&self) -> &Path {
        self.path
    }

    pub fn guards(&self, root: &Path) -> Result<(), BootstrapError> {
        if self.root != root {
            return Err(BootstrapError::Process(format!(
                "runtime lock for {} does not cover {}",
                self.root.display(),
                root.display()
            )));
        }
        Ok(())
    }
}

impl Drop for RuntimeLock<'_> {
    fn drop(&mut self) {
        // The file stays; removing it would let a waiter lock an unlinked inode.
        let _ = self.guard.set_len(0);
        debug!(lock = %self.path.display(), "runtime lock released");
    }
}

/// PID recorded by the current holder. Empty while the holder is still writing it.
pub fn read_holder_pid(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<u32>().ok()
}

/// Reports whether some process holds the runtime lock, without creating the
/// lock file when it is absent.
pub fn lock_status(root: &Path) -> Result<LockStatus, BootstrapError> {
    let path = lock_path_for(root);
    let file = match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LockStatus::Free),
        Err(err) => return Err(BootstrapError::Io(err)),
    };
    let mut lock = RwLock::new(file);
    let status = match lock.try_write() {
        Ok(_guard) => LockStatus::Free,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => LockStatus::Held {
            pid: read_holder_pid(&path),
        },
        Err(err) => return Err(BootstrapError::Io(err)),
    };
    Ok(status)
}
