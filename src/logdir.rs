//! The shared log directory convention: `<work>/dump`.

use std::path::Path;
use std::path::PathBuf;

use crate::error::SchedulerError;

/// The log directory shared across every submission in a run.
///
/// Derived from the work directory (or the current directory if none is
/// configured) and created on demand; the core never deletes it.
#[derive(Debug, Clone)]
pub struct LogDirectory(PathBuf);

impl LogDirectory {
    /// The directory name appended to the work directory.
    const DIR_NAME: &'static str = "dump";

    /// Derives the log directory from an optional work directory.
    pub fn new(work_dir: Option<&Path>) -> Self {
        let base = work_dir.map(Path::to_path_buf).unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        });
        Self(base.join(Self::DIR_NAME))
    }

    /// Creates the directory if it does not already exist.
    pub fn ensure(&self) -> Result<(), SchedulerError> {
        std::fs::create_dir_all(&self.0).map_err(|source| SchedulerError::Io {
            path: self.0.clone(),
            source,
        })
    }

    /// The directory's path.
    pub fn path(&self) -> &Path {
        &self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derives_from_work_dir() {
        let dir = LogDirectory::new(Some(Path::new("/tmp/run")));
        assert_eq!(dir.path(), Path::new("/tmp/run/dump"));
    }

    #[test]
    fn creates_directory_on_demand() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = LogDirectory::new(Some(tmp.path()));
        assert!(!dir.path().exists());
        dir.ensure().unwrap();
        assert!(dir.path().is_dir());
    }
}
