// Filesystem access for cache directories

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Recursive file count and byte size of a directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirUsage {
    pub file_count: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirTimes {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

/// The filesystem operations the cache manager performs
pub trait CacheFs: Send + Sync {
    fn dir_exists(&self, path: &Path) -> bool;

    /// Immediate subdirectories of `path`
    fn list_dirs(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    fn dir_times(&self, path: &Path) -> io::Result<DirTimes>;

    fn measure(&self, path: &Path) -> io::Result<DirUsage>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// [`CacheFs`] backed by `std::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFs;

impl CacheFs for StdFs {
    fn dir_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_dirs(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    fn dir_times(&self, path: &Path) -> io::Result<DirTimes> {
        let metadata = fs::metadata(path)?;
        Ok(DirTimes {
            // Not every platform records a birth time
            created: metadata.created().ok().map(DateTime::<Utc>::from),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    fn measure(&self, path: &Path) -> io::Result<DirUsage> {
        let mut usage = DirUsage::default();
        let mut pending = vec![path.to_path_buf()];

        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else {
                    usage.file_count += 1;
                    usage.total_bytes += entry.metadata()?.len();
                }
            }
        }

        Ok(usage)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_counts_nested_files() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.bin"), vec![0u8; 100]).unwrap();
        fs::create_dir(root.path().join("nested")).unwrap();
        fs::write(root.path().join("nested").join("b.bin"), vec![0u8; 28]).unwrap();

        let usage = StdFs.measure(root.path()).unwrap();
        assert_eq!(
            usage,
            DirUsage {
                file_count: 2,
                total_bytes: 128
            }
        );
    }

    #[test]
    fn test_list_dirs_skips_files() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("one")).unwrap();
        fs::create_dir(root.path().join("two")).unwrap();
        fs::write(root.path().join("file.txt"), "x").unwrap();

        let mut dirs = StdFs.list_dirs(root.path()).unwrap();
        dirs.sort();
        assert_eq!(
            dirs,
            vec![root.path().join("one"), root.path().join("two")]
        );
    }

    #[test]
    fn test_measure_missing_directory_fails() {
        let root = tempfile::tempdir().unwrap();
        assert!(StdFs.measure(&root.path().join("missing")).is_err());
        assert!(!StdFs.dir_exists(&root.path().join("missing")));
    }
}
