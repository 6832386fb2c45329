// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Run exclusion. */

use {
    crate::error::{MirrorError, Result},
    std::{io::Write, path::PathBuf},
};

/// An exclusive lock file guarding a mirror base directory.
///
/// Creation is atomic (`O_CREAT | O_EXCL`); a pre-existing file means
/// another run is active. The file is removed when the instance drops.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock, recording the holder's pid.
    pub fn acquire(path: PathBuf) -> Result<Self> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(MirrorError::LockContention(path))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_contention_and_release() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apt-mirror.lock");

        let lock = LockFile::acquire(path.clone())?;
        assert!(path.exists());

        assert!(matches!(
            LockFile::acquire(path.clone()),
            Err(MirrorError::LockContention(_))
        ));

        drop(lock);
        assert!(!path.exists());

        // Reacquirable after release.
        let _lock = LockFile::acquire(path.clone())?;

        Ok(())
    }
}
