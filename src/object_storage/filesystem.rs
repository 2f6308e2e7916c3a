//! Filesystem-backed `StorageBackend`, scoped under a root directory per
//! `Context::workspace_root_dir`. The one concrete storage implementation
//! this crate ships; wire-protocol backends (S3, GCS, ...) are out of scope.
//!
//! Grounded on the teacher's `object_storage::s3::S3`: same retry-wrapped
//! call shape (`execute_api` here instead of inline `retry::retry`), same
//! "validate key, then perform I/O" structure as `is_bucket_name_valid`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{ErrorKind, OsmoError, OsmoResult};
use crate::models::Context;
use crate::object_storage::{
    execute_api, invalid_key_error, FixedDelayRetry, ObjectInfo, ResumableStream, StorageBackend,
};

const CHUNK_SIZE: usize = 64 * 1024;

pub struct FilesystemStorage {
    context: Context,
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(context: Context, root: impl Into<PathBuf>) -> Self {
        FilesystemStorage { context, root: root.into() }
    }

    fn is_key_valid(object_key: &str) -> bool {
        !object_key.is_empty() && !object_key.contains("..")
    }

    fn resolve(&self, object_key: &str) -> OsmoResult<PathBuf> {
        if !Self::is_key_valid(object_key) {
            return Err(invalid_key_error(object_key));
        }
        Ok(self.root.join(object_key))
    }

    fn retry_handler() -> FixedDelayRetry {
        FixedDelayRetry::new(Duration::from_millis(200), 3)
    }
}

impl StorageBackend for FilesystemStorage {
    fn context(&self) -> &Context {
        &self.context
    }

    fn exists(&self, object_key: &str) -> OsmoResult<bool> {
        let path = self.resolve(object_key)?;
        Ok(path.is_file())
    }

    fn info(&self, object_key: &str) -> OsmoResult<ObjectInfo> {
        let path = self.resolve(object_key)?;
        match fs::metadata(&path) {
            Ok(metadata) => Ok(ObjectInfo { size: metadata.len(), exists: true }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(ObjectInfo { size: 0, exists: false })
            }
            Err(err) => Err(OsmoError::with_source(ErrorKind::Server, "failed to stat object", err)),
        }
    }

    fn get(&self, object_key: &str) -> OsmoResult<Vec<u8>> {
        let path = self.resolve(object_key)?;
        let mut handler = Self::retry_handler();
        let response = execute_api(
            || fs::read(&path).map_err(|err| OsmoError::with_source(ErrorKind::Transient, "failed to read object", err)),
            &mut handler,
        )?;
        Ok(response.result)
    }

    fn list(&self, prefix: &str) -> OsmoResult<Vec<String>> {
        let base = if prefix.is_empty() { self.root.clone() } else { self.resolve(prefix)? };
        let mut keys = Vec::new();
        collect_keys(&self.root, &base, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn upload(&self, object_key: &str, content: &[u8]) -> OsmoResult<()> {
        let path = self.resolve(object_key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| OsmoError::with_source(ErrorKind::Server, "failed to create parent directory", err))?;
        }
        let mut handler = Self::retry_handler();
        execute_api(
            || fs::write(&path, content).map_err(|err| OsmoError::with_source(ErrorKind::Transient, "failed to write object", err)),
            &mut handler,
        )?;
        Ok(())
    }

    fn download(&self, object_key: &str) -> OsmoResult<Box<dyn ResumableStream>> {
        let path = self.resolve(object_key)?;
        let file = fs::File::open(&path)
            .map_err(|err| OsmoError::with_source(ErrorKind::Transient, "failed to open object for download", err))?;
        Ok(Box::new(FileResumableStream { file, delivered: 0 }))
    }

    fn copy(&self, source_key: &str, dest_key: &str) -> OsmoResult<()> {
        let source = self.resolve(source_key)?;
        let dest = self.resolve(dest_key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| OsmoError::with_source(ErrorKind::Server, "failed to create parent directory", err))?;
        }
        fs::copy(&source, &dest).map_err(|err| OsmoError::with_source(ErrorKind::Transient, "failed to copy object", err))?;
        Ok(())
    }

    fn delete(&self, object_key: &str) -> OsmoResult<()> {
        let path = self.resolve(object_key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(OsmoError::with_source(ErrorKind::Server, "failed to delete object", err)),
        }
    }
}

fn collect_keys(root: &Path, dir: &Path, out: &mut Vec<String>) -> OsmoResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    let entries = fs::read_dir(dir).map_err(|err| OsmoError::with_source(ErrorKind::Server, "failed to list directory", err))?;
    for entry in entries {
        let entry = entry.map_err(|err| OsmoError::with_source(ErrorKind::Server, "failed to read directory entry", err))?;
        let path = entry.path();
        if path.is_dir() {
            collect_keys(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// A resumable stream over a filesystem handle. Resumption on a transient
/// read error reopens the file and seeks to `delivered`.
struct FileResumableStream {
    file: fs::File,
    delivered: u64,
}

impl ResumableStream for FileResumableStream {
    fn next_chunk(&mut self) -> OsmoResult<Option<Vec<u8>>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let read = self
            .file
            .read(&mut buf)
            .map_err(|err| OsmoError::with_source(ErrorKind::Transient, "failed to read chunk", err))?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        self.delivered += read as u64;
        Ok(Some(buf))
    }

    fn bytes_delivered(&self) -> u64 {
        self.delivered
    }
}
