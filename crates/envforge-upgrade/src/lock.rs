use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::warn;

use crate::error::UpgradeError;

/// Exclusive upgrade lock; released on drop.
///
/// The file records the owner pid. A file whose OS lock is free was left
/// behind by a dead process (typically across a reboot) and is reclaimed.
#[derive(Debug)]
pub struct UpgradeLock {
    path: PathBuf,
    file: Option<File>,
}

impl UpgradeLock {
    pub fn acquire(path: &Path) -> Result<Self, UpgradeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                UpgradeError::io(format!("failed to create {}", parent.display()), err)
            })?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| {
                UpgradeError::io(format!("failed to open upgrade lock: {}", path.display()), err)
            })?;

        if let Err(err) = file.try_lock_exclusive() {
            if is_contended(&err) {
                return Err(UpgradeError::LockConflict {
                    pid: read_pid(&mut file),
                });
            }
            return Err(UpgradeError::io(
                format!("failed to lock {}", path.display()),
                err,
            ));
        }

        if let Some(previous) = read_pid(&mut file) {
            if previous != std::process::id() {
                warn!("reclaiming stale upgrade lock left by pid={previous}");
            }
        }
        write_pid(&mut file).map_err(|err| {
            UpgradeError::io(format!("failed to record lock owner: {}", path.display()), err)
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    pub fn release(&mut self) -> Result<(), UpgradeError> {
        if let Some(file) = self.file.take() {
            let _ = file.set_len(0);
            file.unlock().map_err(|err| {
                UpgradeError::io(format!("failed to unlock {}", self.path.display()), err)
            })?;
        }
        Ok(())
    }
}

impl Drop for UpgradeLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.set_len(0);
            let _ = file.unlock();
        }
    }
}

/// Pid recorded in a lock file, if any.
pub fn lock_holder(path: &Path) -> Option<u32> {
    let mut file = File::open(path).ok()?;
    read_pid(&mut file)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut raw = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut raw).ok()?;
    raw.trim().parse().ok()
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}
