//! Idempotent on-disk boolean, used to persist phase completion per VM
//! (spec.md §2 component 1). Presence of the file is the only state; we
//! never read its contents.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Marker {
    path: PathBuf,
}

impl Marker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Marker { path: path.into() }
    }

    pub fn is_set(&self) -> bool {
        self.path.is_file()
    }

    /// Creates the marker file. Idempotent: setting an already-set marker
    /// is a no-op and does not touch the file's mtime, so repeated Prepare
    /// calls are observably idempotent (§8).
    pub fn set(&self) -> Result<()> {
        if self.is_set() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating marker directory {}", parent.display()))?;
        }
        std::fs::File::create(&self.path)
            .with_context(|| format!("creating marker {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_idempotent_on_mtime() {
        let dir = tempdir();
        let marker = Marker::new(dir.join("ready"));
        marker.set().unwrap();
        let mtime1 = std::fs::metadata(marker.path()).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        marker.set().unwrap();
        let mtime2 = std::fs::metadata(marker.path()).unwrap().modified().unwrap();

        assert_eq!(mtime1, mtime2);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn unset_marker_reports_false() {
        let dir = tempdir();
        let marker = Marker::new(dir.join("installed"));
        assert!(!marker.is_set());
        std::fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("vlab-marker-test-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
