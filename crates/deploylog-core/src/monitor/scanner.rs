//! Watched-directory scanner.
//!
//! Producers are not required to write atomically. A file is considered
//! complete once its fingerprint is unchanged across two consecutive scans
//! (when settling is enabled).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::fingerprint::{FileKind, Fingerprint, FingerprintStore, IncomingFile};

/// Lists eligible, stable files in the watched directory.
#[derive(Debug)]
pub struct DirectoryScanner {
    watch_dir: PathBuf,
    container_extension: String,
    settle_polls: bool,
    pending: HashMap<String, Fingerprint>,
}

impl DirectoryScanner {
    /// Create a scanner.
    #[must_use]
    pub fn new(watch_dir: impl Into<PathBuf>, container_extension: impl Into<String>) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            container_extension: container_extension.into(),
            settle_polls: true,
            pending: HashMap::new(),
        }
    }

    /// Require (or not) an unchanged fingerprint on two scans.
    #[must_use]
    pub const fn with_settle_polls(mut self, settle: bool) -> Self {
        self.settle_polls = settle;
        self
    }

    /// The watched directory.
    #[must_use]
    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    /// Describe a single file, or `None` if it is not a pipeline input.
    pub fn describe(&self, path: &Path) -> std::io::Result<Option<IncomingFile>> {
        let metadata = std::fs::symlink_metadata(path)?;
        if !metadata.is_file() {
            return Ok(None);
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let Some(kind) = FileKind::classify(name, &self.container_extension) else {
            return Ok(None);
        };
        Ok(Some(IncomingFile {
            name: name.to_string(),
            path: path.to_path_buf(),
            fingerprint: Fingerprint::from_metadata(&metadata)?,
            kind,
        }))
    }

    /// Files ready for processing, ordered by (mtime, name).
    pub fn scan(&mut self, store: &FingerprintStore) -> std::io::Result<Vec<IncomingFile>> {
        let mut observed = Vec::new();
        for entry in std::fs::read_dir(&self.watch_dir)? {
            let entry = entry?;
            match self.describe(&entry.path()) {
                Ok(Some(file)) if store.is_eligible(&file) => observed.push(file),
                Ok(_) => {},
                // Vanished between listing and stat.
                Err(e) => trace!(path = %entry.path().display(), error = %e, "skipping entry"),
            }
        }

        let mut ready: Vec<IncomingFile> = if self.settle_polls {
            let previous = std::mem::take(&mut self.pending);
            let mut ready = Vec::new();
            for file in observed {
                if previous.get(&file.name) == Some(&file.fingerprint) {
                    ready.push(file);
                } else {
                    debug!(file = %file.name, "waiting for file to settle");
                    self.pending.insert(file.name.clone(), file.fingerprint);
                }
            }
            // Ready files stay pending until recorded; a failed run is
            // retried on the next scan without settling again.
            for file in &ready {
                self.pending.insert(file.name.clone(), file.fingerprint);
            }
            ready
        } else {
            observed
        };

        ready.sort_by(|a, b| {
            (a.fingerprint.modified, &a.name).cmp(&(b.fingerprint.modified, &b.name))
        });
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_is_ready_after_two_stable_scans() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pkg.zip"), b"zip").unwrap();
        let store = FingerprintStore::in_memory();
        let mut scanner = DirectoryScanner::new(dir.path(), "msg");

        assert!(scanner.scan(&store).unwrap().is_empty());
        let ready = scanner.scan(&store).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].kind, FileKind::Archive);
    }

    #[test]
    fn test_growing_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        std::fs::write(&path, b"zi").unwrap();
        let store = FingerprintStore::in_memory();
        let mut scanner = DirectoryScanner::new(dir.path(), "msg");

        assert!(scanner.scan(&store).unwrap().is_empty());
        std::fs::write(&path, b"zip plus more").unwrap();
        assert!(scanner.scan(&store).unwrap().is_empty());
        assert_eq!(scanner.scan(&store).unwrap().len(), 1);
    }

    #[test]
    fn test_recorded_files_and_other_extensions_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let done = dir.path().join("done.zip");
        std::fs::write(&done, b"zip").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"txt").unwrap();
        std::fs::create_dir(dir.path().join("sub.zip")).unwrap();
        std::fs::write(dir.path().join("mail.MSG"), b"msg").unwrap();

        let mut store = FingerprintStore::in_memory();
        let scanner = DirectoryScanner::new(dir.path(), "msg").with_settle_polls(false);
        let fp = scanner.describe(&done).unwrap().unwrap().fingerprint;
        store.record("done.zip", fp.size, fp.modified).unwrap();

        let mut scanner = scanner;
        let ready = scanner.scan(&store).unwrap();
        let names: Vec<_> = ready.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["mail.MSG"]);
        assert_eq!(ready[0].kind, FileKind::Container);
    }

    #[test]
    fn test_order_is_mtime_then_name() {
        let dir = tempfile::tempdir().unwrap();
        let when = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        for (name, offset) in [("b.zip", 0), ("a.zip", 0), ("c.zip", -60)] {
            let path = dir.path().join(name);
            std::fs::write(&path, name).unwrap();
            let mtime = if offset < 0 {
                when - std::time::Duration::from_secs(60)
            } else {
                when
            };
            std::fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }

        let store = FingerprintStore::in_memory();
        let mut scanner = DirectoryScanner::new(dir.path(), "msg").with_settle_polls(false);
        let names: Vec<_> = scanner
            .scan(&store)
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["c.zip", "a.zip", "b.zip"]);
    }
}
