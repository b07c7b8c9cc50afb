use crate::error::{BusError, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Plain-text record storage behind the config file and the two JSONL logs.
///
/// Writers only ever replace the whole record or append one line; nothing is
/// rewritten in place.
pub trait RecordStore: Send + Sync {
    /// Human readable location, used in log lines.
    fn describe(&self) -> String;

    /// Whole contents, or `None` when the record does not exist yet.
    fn read_all(&self) -> Result<Option<String>>;

    fn write_all(&self, contents: &str) -> Result<()>;

    /// Appends `line` plus a trailing newline as one write.
    fn append_line(&self, line: &str) -> Result<()>;

    /// Bytes from `offset` to the current end. Empty if the record is absent
    /// or has not grown past `offset`.
    fn read_from(&self, offset: u64) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn storage_error(&self, source: std::io::Error) -> BusError {
        BusError::Storage {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn ensure_parent(&self) -> Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent).map_err(|e| self.storage_error(e))
            }
            _ => Ok(()),
        }
    }
}

impl RecordStore for FileStore {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn read_all(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.storage_error(e)),
        }
    }

    fn write_all(&self, contents: &str) -> Result<()> {
        self.ensure_parent()?;
        fs::write(&self.path, contents).map_err(|e| self.storage_error(e))
    }

    fn append_line(&self, line: &str) -> Result<()> {
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.storage_error(e))?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf).map_err(|e| self.storage_error(e))
    }

    fn read_from(&self, offset: u64) -> Result<Vec<u8>> {
        let mut file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.storage_error(e)),
        };

        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_to_end(&mut buf))
            .map_err(|e| self.storage_error(e))?;
        Ok(buf)
    }
}

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contents: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.contents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn read_all(&self) -> Result<Option<String>> {
        match self.lock().as_ref() {
            Some(bytes) => String::from_utf8(bytes.clone())
                .map(Some)
                .map_err(|e| BusError::Storage {
                    path: self.describe(),
                    source: std::io::Error::new(ErrorKind::InvalidData, e),
                }),
            None => Ok(None),
        }
    }

    fn write_all(&self, contents: &str) -> Result<()> {
        *self.lock() = Some(contents.as_bytes().to_vec());
        Ok(())
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let mut guard = self.lock();
        let bytes = guard.get_or_insert_with(Vec::new);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        Ok(())
    }

    fn read_from(&self, offset: u64) -> Result<Vec<u8>> {
        let guard = self.lock();
        let bytes = guard.as_deref().unwrap_or_default();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        Ok(bytes[start..].to_vec())
    }
}
