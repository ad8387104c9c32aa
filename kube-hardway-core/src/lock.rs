use std::{
    fs::File,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another run for cluster '{cluster}' is in progress (lock file '{}')! Remove the file if that run is gone.", .path.display())]
    AlreadyRunning { cluster: String, path: PathBuf },
    #[error("Io error: {}", .0)]
    IoError(std::io::Error),
}

/// Exclusive run lock of a single cluster, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(state_directory: &Path, cluster: &str) -> Result<Self, LockError> {
        std::fs::create_dir_all(state_directory).map_err(LockError::IoError)?;

        let path = state_directory.join(format!("{cluster}.lock"));
        let mut file = match File::options().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                return Err(LockError::AlreadyRunning {
                    cluster: cluster.to_owned(),
                    path,
                })
            }
            Err(error) => return Err(LockError::IoError(error)),
        };

        writeln!(file, "{}", std::process::id()).map_err(LockError::IoError)?;
        debug!("Acquired run lock '{}'", path.display());

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            warn!("Couldn't remove run lock '{}'! {error}", self.path.display());
        }
    }
}
