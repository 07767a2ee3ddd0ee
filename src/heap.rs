// # File Heap
//
// Two-level directory tree under the cache root holding out-of-line values.
// Files are named by 16 random bytes, hex-encoded: the first two hex chars
// form the top-level directory, the next two the second level, and the
// remainder plus a `.val` suffix form the file name.

use crate::error::Result;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File heap rooted at the cache directory.
#[derive(Debug, Clone)]
pub struct FileHeap {
    directory: PathBuf,
}

impl FileHeap {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    /// Cache root this heap lives under.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Reserve a fresh heap file name.
    ///
    /// Both directory levels are created; writing the file itself is the
    /// caller's job. Returns the relative path (stored in the index) and
    /// the absolute path (to write to).
    pub fn create(&self) -> Result<(String, PathBuf)> {
        let raw: [u8; 16] = rand::random();
        let name = hex::encode(raw);

        let relative = format!("{}/{}/{}.val", &name[..2], &name[2..4], &name[4..]);
        let full_path = self
            .directory
            .join(&name[..2])
            .join(&name[2..4])
            .join(format!("{}.val", &name[4..]));

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok((relative, full_path))
    }

    /// Absolute path for a relative heap file name.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.directory.join(relative)
    }

    /// Open a heap file for streaming reads.
    pub fn open(&self, relative: &str) -> std::io::Result<File> {
        File::open(self.path(relative))
    }

    /// Read a heap file whole.
    pub fn read_bytes(&self, relative: &str) -> std::io::Result<Vec<u8>> {
        fs::read(self.path(relative))
    }

    /// Delete a heap file.
    ///
    /// A missing file is not an error: concurrent sweeps may delete the
    /// same file. Returns whether the file existed.
    pub fn remove(&self, relative: &str) -> Result<bool> {
        match fs::remove_file(self.path(relative)) {
            Ok(()) => {
                debug!(file = relative, "removed heap file");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
