//! Storage directory layout
//!
//! File layout:
//! - `cache.db`: SQLite metadata index (plus its `-wal`/`-shm` companions)
//! - `tmp/`: blob payloads being written, and blobs set aside by a removal
//!   that has not committed yet
//! - `ab/cd/<uuid>.val`: committed blob files, two levels of hashed subdirectories

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use memmap2::Mmap;
use tracing::warn;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::codec::{create_header, decode_blob, Encoded};
use crate::error::{Error, Result};
use crate::key::Value;

/// Name of the index file inside the cache directory
pub const INDEX_FILE: &str = "cache.db";

const TMP_DIR: &str = "tmp";
const BLOB_EXT: &str = "val";
const TMP_EXT: &str = "tmp";
const TRASH_EXT: &str = "trash";

/// Blob files at least this large are memory mapped when read (1 MB)
const MMAP_THRESHOLD: u64 = 1024 * 1024;

/// A file found while scanning the blob tree
#[derive(Debug, Clone)]
pub struct BlobFile {
    /// Path relative to the root, `/`-separated
    pub filename: String,
    /// Last modification time
    pub modified: SystemTime,
}

/// A blob moved out of the tree by an uncommitted removal
#[derive(Debug)]
pub(crate) struct StagedRemoval {
    filename: String,
    trash: PathBuf,
}

/// Owns the on-disk layout of one cache
#[derive(Debug, Clone)]
pub struct Directory {
    root: PathBuf,
}

impl Directory {
    /// Open or create a cache directory
    ///
    /// # Arguments
    /// * `path` - Root directory of the cache
    ///
    /// # Returns
    /// * `Result<Directory>` - Fails if the directory cannot be created
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Directory { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the SQLite index file
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Absolute path of a blob file name stored in the index
    pub fn blob_path(&self, filename: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in filename.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(Error::Corrupt(format!("invalid blob filename {:?}", filename)));
            }
            path.push(part);
        }
        Ok(path)
    }

    /// Write an encoded payload to a new blob file
    ///
    /// The payload is written under `tmp/` and renamed into place, so the
    /// returned filename never refers to a partially written file.
    ///
    /// # Returns
    /// * `Result<String>` - Filename to record in the index
    pub fn write_blob(&self, encoded: &Encoded) -> Result<String> {
        let id = Uuid::new_v4().simple().to_string();
        let filename = format!("{}/{}/{}.{}", &id[0..2], &id[2..4], &id[4..], BLOB_EXT);
        let tmp_path = self.root.join(TMP_DIR).join(format!("{}.{}", id, TMP_EXT));
        let final_path = self.blob_path(&filename)?;

        let result = (|| -> io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&create_header(encoded.mode, encoded.size()))?;
            file.write_all(&encoded.payload)?;
            file.sync_all()?;
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&tmp_path, &final_path)
        })();

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(filename)
    }

    /// Read and decode a blob file
    ///
    /// # Returns
    /// * `Result<Option<Value>>` - `None` if the file does not exist (yet or any more)
    pub fn read_blob(&self, filename: &str) -> Result<Option<Value>> {
        let path = self.blob_path(filename)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let len = file.metadata()?.len();
        if len >= MMAP_THRESHOLD {
            // SAFETY: blob files are immutable once renamed into place; they are
            // only ever unlinked, which leaves an existing mapping valid.
            let map = unsafe { Mmap::map(&file)? };
            decode_blob(&map).map(Some)
        } else {
            let mut contents = Vec::with_capacity(len as usize);
            (&file).read_to_end(&mut contents)?;
            decode_blob(&contents).map(Some)
        }
    }

    /// Delete a blob file
    ///
    /// # Returns
    /// * `Result<bool>` - `false` if it was already gone
    pub fn remove_blob(&self, filename: &str) -> Result<bool> {
        match fs::remove_file(self.blob_path(filename)?) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Best-effort removal used when an index transaction did not commit.
    pub fn discard_blob(&self, filename: &str) {
        if let Err(err) = self.remove_blob(filename) {
            warn!(filename, error = %err, "failed to discard uncommitted blob");
        }
    }

    /// Move blob files aside ahead of a commit that forgets them
    ///
    /// Files already gone are skipped. If any move fails, the ones already
    /// moved are put back and the error is returned.
    pub(crate) fn stage_removals(&self, filenames: &[String]) -> Result<Vec<StagedRemoval>> {
        let mut staged = Vec::with_capacity(filenames.len());
        for filename in filenames {
            match self.stage_removal(filename) {
                Ok(Some(removal)) => staged.push(removal),
                Ok(None) => {}
                Err(err) => {
                    self.restore_removals(staged);
                    return Err(err);
                }
            }
        }
        Ok(staged)
    }

    fn stage_removal(&self, filename: &str) -> Result<Option<StagedRemoval>> {
        let path = self.blob_path(filename)?;
        let id = Uuid::new_v4().simple().to_string();
        let trash = self.root.join(TMP_DIR).join(format!("{}.{}", id, TRASH_EXT));
        match fs::rename(&path, &trash) {
            Ok(()) => Ok(Some(StagedRemoval {
                filename: filename.to_string(),
                trash,
            })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Put staged blobs back after the transaction failed to commit.
    pub(crate) fn restore_removals(&self, staged: Vec<StagedRemoval>) {
        for removal in staged {
            let restored = self
                .blob_path(&removal.filename)
                .and_then(|path| fs::rename(&removal.trash, path).map_err(Error::from));
            if let Err(err) = restored {
                warn!(filename = %removal.filename, error = %err, "failed to restore staged blob");
            }
        }
    }

    /// Unlink staged blobs once their removal committed.
    pub(crate) fn purge_removals(&self, staged: Vec<StagedRemoval>) {
        for removal in staged {
            if let Err(err) = fs::remove_file(&removal.trash) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(filename = %removal.filename, error = %err, "failed to unlink removed blob");
                }
            }
        }
    }

    /// List every committed blob file
    pub fn scan_blobs(&self) -> Result<Vec<BlobFile>> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXT)
            {
                continue;
            }
            if let Some(filename) = self.relative_name(path) {
                found.push(BlobFile {
                    filename,
                    modified: entry.metadata().map_err(|e| Error::Io(e.into()))?.modified()?,
                });
            }
        }
        Ok(found)
    }

    /// List leftover temporary files
    pub fn scan_temp(&self) -> Result<Vec<BlobFile>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(self.root.join(TMP_DIR))? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            if let Some(filename) = self.relative_name(&entry.path()) {
                found.push(BlobFile {
                    filename,
                    modified: metadata.modified()?,
                });
            }
        }
        Ok(found)
    }

    fn relative_name(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, Placement};
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_blob() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();

        let encoded = encode(Value::from("x".repeat(200)), 10);
        assert_eq!(encoded.placement, Placement::File);

        let filename = directory.write_blob(&encoded).unwrap();
        assert!(filename.ends_with(".val"));
        assert_eq!(filename.split('/').count(), 3);

        let value = directory.read_blob(&filename).unwrap().unwrap();
        assert_eq!(value, Value::from("x".repeat(200)));
        assert!(directory.scan_temp().unwrap().is_empty());
    }

    #[test]
    fn test_large_blob_is_mapped() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();

        let payload = vec![7u8; 2 * 1024 * 1024];
        let filename = directory
            .write_blob(&encode(Value::Bytes(payload.clone()), 0))
            .unwrap();

        assert_eq!(
            directory.read_blob(&filename).unwrap(),
            Some(Value::Bytes(payload))
        );
    }

    #[test]
    fn test_missing_blob_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();

        assert_eq!(directory.read_blob("aa/bb/missing.val").unwrap(), None);
        assert!(!directory.remove_blob("aa/bb/missing.val").unwrap());
    }

    #[test]
    fn test_remove_blob() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();
        let filename = directory
            .write_blob(&encode(Value::Bytes(vec![1; 64]), 0))
            .unwrap();

        assert!(directory.remove_blob(&filename).unwrap());
        assert_eq!(directory.read_blob(&filename).unwrap(), None);
    }

    #[test]
    fn test_rejects_escaping_filenames() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();

        assert!(directory.blob_path("../etc/passwd").is_err());
        assert!(directory.blob_path("aa//b.val").is_err());
    }

    #[test]
    fn test_scan_blobs() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();
        let a = directory.write_blob(&encode(Value::Bytes(vec![1; 8]), 0)).unwrap();
        let b = directory.write_blob(&encode(Value::Bytes(vec![2; 8]), 0)).unwrap();

        let mut names: Vec<_> = directory
            .scan_blobs()
            .unwrap()
            .into_iter()
            .map(|f| f.filename)
            .collect();
        names.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_staged_removal_purge_and_restore() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();
        let a = directory.write_blob(&encode(Value::Bytes(vec![1; 8]), 0)).unwrap();
        let b = directory.write_blob(&encode(Value::Bytes(vec![2; 8]), 0)).unwrap();

        let names = vec![a.clone(), "aa/bb/missing.val".to_string()];
        let staged = directory.stage_removals(&names).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(directory.read_blob(&a).unwrap(), None);
        assert_eq!(directory.scan_temp().unwrap().len(), 1);

        directory.restore_removals(staged);
        assert_eq!(directory.read_blob(&a).unwrap(), Some(Value::Bytes(vec![1; 8])));

        let staged = directory.stage_removals(&[a.clone(), b.clone()]).unwrap();
        directory.purge_removals(staged);
        assert!(directory.scan_blobs().unwrap().is_empty());
        assert!(directory.scan_temp().unwrap().is_empty());
    }

    #[test]
    fn test_failed_stage_puts_earlier_moves_back() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();
        let a = directory.write_blob(&encode(Value::Bytes(vec![1; 8]), 0)).unwrap();

        let names = vec![a.clone(), "../escape.val".to_string()];
        assert!(directory.stage_removals(&names).is_err());
        assert_eq!(directory.read_blob(&a).unwrap(), Some(Value::Bytes(vec![1; 8])));
        assert!(directory.scan_temp().unwrap().is_empty());
    }

    #[test]
    fn test_stage_fails_when_tmp_is_unusable() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();
        let a = directory.write_blob(&encode(Value::Bytes(vec![1; 8]), 0)).unwrap();

        fs::remove_dir_all(directory.root().join(TMP_DIR)).unwrap();
        fs::write(directory.root().join(TMP_DIR), b"not a directory").unwrap();

        assert!(directory.stage_removals(&[a.clone()]).is_err());
        assert_eq!(directory.read_blob(&a).unwrap(), Some(Value::Bytes(vec![1; 8])));
    }
}
