use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{RelayError, Result};

use super::{InstructionStore, PendingInstruction};

/// Pending instructions kept as one pretty-printed JSON array.
///
/// Every read-modify-write holds an advisory lock on `<file>.lock`, and writes go
/// through a temp file + rename so readers in other processes never see a torn file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_unlocked(&self) -> Result<Vec<PendingInstruction>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents).map_err(|e| RelayError::Storage {
            reason: format!("corrupt instruction file {}: {}", self.path.display(), e),
        })
    }

    fn write_unlocked(&self, instructions: &[PendingInstruction]) -> Result<()> {
        let json = serde_json::to_string_pretty(instructions)?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        set_file_permissions_0600(&tmp_path);
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn lock(&self) -> Result<FileLock> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        FileLock::acquire(&self.path)
    }
}

impl InstructionStore for JsonFileStore {
    fn append(&self, instruction: PendingInstruction) -> Result<()> {
        let _lock = self.lock()?;
        let mut instructions = self.read_unlocked()?;
        instructions.push(instruction);
        self.write_unlocked(&instructions)
    }

    fn read_all(&self) -> Result<Vec<PendingInstruction>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let _lock = self.lock()?;
        self.read_unlocked()
    }

    fn clear(&self) -> Result<()> {
        let _lock = self.lock()?;
        self.write_unlocked(&[])
    }

    fn take_all(&self) -> Result<Vec<PendingInstruction>> {
        let _lock = self.lock()?;
        let instructions = self.read_unlocked()?;
        if !instructions.is_empty() {
            self.write_unlocked(&[])?;
        }
        Ok(instructions)
    }
}

/// Set file permissions to 0600 (owner read/write only).
#[cfg(unix)]
fn set_file_permissions_0600(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(0o600);
    let _ = fs::set_permissions(path, perms);
}

#[cfg(not(unix))]
fn set_file_permissions_0600(_path: &Path) {}

/// Advisory file lock using flock(2) on a .lock file, released on drop.
struct FileLock {
    _file: fs::File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self> {
        let lock_path = path.with_extension("lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        flock_exclusive(&file)?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &fs::File) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let ret = unsafe { libc::flock(fd, libc::LOCK_EX) };
    if ret != 0 {
        return Err(RelayError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &fs::File) -> Result<()> {
    Ok(())
}
