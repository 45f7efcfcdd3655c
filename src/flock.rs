//! Exclusive directory lock.
//!
//! The engine assumes single-process ownership of its directory; the lock
//! file turns that assumption into an enforced invariant. The PID is
//! written into the file for debugging.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates (or truncates) the lock file and takes an exclusive,
    /// non-blocking lock on it.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; fall back to best effort.
        Ok(())
    }

    /// Removes the lock file. The kernel lock itself is released when the
    /// file handle drops.
    pub fn unlock(self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exclusive_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.lock");

        let lock = FileLock::lock(&path).expect("first lock should succeed");
        assert!(FileLock::lock(&path).is_err(), "second lock must fail");

        lock.unlock().expect("unlock failed");
        let relock = FileLock::lock(&path).expect("relock after unlock should succeed");
        drop(relock);
    }

    #[test]
    fn test_lock_file_contains_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.lock");
        let _lock = FileLock::lock(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }
}
