// Single-instance guard: exclusive flock on a well-known file, released on drop
use crate::errors::DaqError;
use nix::fcntl::{FlockArg, flock};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub struct SingletonLock {
    file: File,
    path: PathBuf,
}

impl SingletonLock {
    pub fn acquire(path: &Path) -> Result<Self, DaqError> {
        let mut file = OpenOptions::new().create(true).truncate(false).write(true).open(path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|e| {
            DaqError::Lock(format!("{} is held by another instance ({e})", path.display()))
        })?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        info!(path = %path.display(), "singleton lock acquired");
        Ok(Self { file, path: path.to_path_buf() })
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        match flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            Ok(()) => info!(path = %self.path.display(), "singleton lock released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to release singleton lock"),
        }
    }
}
