//! Block file abstraction.
//!
//! The page pool talks to storage through the `BlockFile` trait so that the
//! same pool can run on top of a real file in production and an in-memory,
//! fault-injecting file in tests.
//!
//! # Contract
//!
//! - `read` returns the number of bytes actually read. Reading past the end
//!   of the file is not an error; the short count tells the caller where the
//!   data stops.
//! - `write` extends the file as needed.
//! - `sync` makes every previous write durable.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Positioned byte I/O on a single backing file.
pub trait BlockFile: Send {
    /// Read into `buf` starting at byte `offset`.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` only
    /// when the end of the file was reached.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError>;

    /// Write all of `buf` at byte `offset`.
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), FileError>;

    /// Make all previous writes durable.
    fn sync(&mut self) -> Result<(), FileError>;

    /// Release the file. Later operations fail with `FileError::Closed`.
    fn close(&mut self) -> Result<(), FileError>;

    /// Current length of the file in bytes.
    fn len(&self) -> Result<u64, FileError>;

    /// Whether the file holds no bytes at all.
    fn is_empty(&self) -> Result<bool, FileError> {
        Ok(self.len()? == 0)
    }
}

/// A `BlockFile` backed by a file on disk.
#[derive(Debug)]
pub struct OsFile {
    file: Option<File>,
    path: PathBuf,
}

impl OsFile {
    /// Create a new file at the given path.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path) -> Result<Self, FileError> {
        if path.exists() {
            return Err(FileError::AlreadyExists(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(FileError::Io)?;

        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    /// Open an existing file.
    pub fn open(path: &Path) -> Result<Self, FileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(FileError::Io)?;

        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    /// Path the file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&mut self) -> Result<&mut File, FileError> {
        self.file.as_mut().ok_or(FileError::Closed)
    }
}

impl BlockFile for OsFile {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError> {
        let file = self.handle()?;
        file.seek(SeekFrom::Start(offset)).map_err(FileError::Io)?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(FileError::Io(e)),
            }
        }
        Ok(filled)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), FileError> {
        let file = self.handle()?;
        file.seek(SeekFrom::Start(offset)).map_err(FileError::Io)?;
        file.write_all(buf).map_err(FileError::Io)
    }

    fn sync(&mut self) -> Result<(), FileError> {
        self.handle()?.sync_all().map_err(FileError::Io)
    }

    fn close(&mut self) -> Result<(), FileError> {
        match self.file.take() {
            Some(file) => file.sync_all().map_err(FileError::Io),
            None => Err(FileError::Closed),
        }
    }

    fn len(&self) -> Result<u64, FileError> {
        let file = self.file.as_ref().ok_or(FileError::Closed)?;
        Ok(file.metadata().map_err(FileError::Io)?.len())
    }
}

/// Errors that can occur during file operations.
#[derive(Debug)]
pub enum FileError {
    /// I/O error.
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(PathBuf),
    /// Fault injected by a test file.
    InjectedFault(String),
    /// The file has been closed.
    Closed,
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::Closed => write!(f, "file is closed"),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
