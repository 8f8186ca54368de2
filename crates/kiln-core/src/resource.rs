// src/resource.rs
//! Maps a request path onto the document root and opens the file for
//! zero-copy transmission.

use crate::http::StatusCode;
use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use tracing::{debug, warn};

/// Room for document root + request path, terminator included.
pub const REAL_PATH_CAPACITY: usize = 200;

/// A read-only private mapping of a whole file. Unmapped on drop.
pub struct MappedFile {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is read-only and owned by exactly one connection.
unsafe impl Send for MappedFile {}

impl MappedFile {
    pub fn map(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map an empty file"));
        }
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len).finish()
    }
}

/// Outcome of resolving a request target.
#[derive(Debug)]
pub enum Resolution {
    /// Serve this file. `map` is `None` for an empty file.
    File {
        path: PathBuf,
        map: Option<MappedFile>,
    },
    Missing,
    Forbidden,
    /// Directories are never listed; answered like a client error.
    Directory,
    /// Path buffer overflow or a failure to open or map the file.
    Internal,
}

impl Resolution {
    pub fn status(&self) -> StatusCode {
        match self {
            Resolution::File { .. } => StatusCode::Ok,
            Resolution::Missing => StatusCode::NotFound,
            Resolution::Forbidden => StatusCode::Forbidden,
            Resolution::Directory => StatusCode::BadRequest,
            Resolution::Internal => StatusCode::InternalError,
        }
    }
}

/// Resolves request paths against a fixed absolute document root.
#[derive(Debug, Clone)]
pub struct DocRoot {
    root: PathBuf,
}

impl DocRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Concatenate the root and the request path, bounded by
    /// [`REAL_PATH_CAPACITY`].
    pub fn real_path(&self, request_path: &str) -> Option<PathBuf> {
        let root = self.root.as_os_str().as_bytes();
        if root.len() + request_path.len() > REAL_PATH_CAPACITY - 1 {
            return None;
        }
        let mut joined = Vec::with_capacity(root.len() + request_path.len());
        joined.extend_from_slice(root);
        joined.extend_from_slice(request_path.as_bytes());
        Some(PathBuf::from(OsStr::from_bytes(&joined)))
    }

    pub fn resolve(&self, request_path: &str) -> Resolution {
        if request_path.split('/').any(|segment| segment == "..") {
            debug!(path = request_path, "refusing path with parent segment");
            return Resolution::Forbidden;
        }
        let Some(path) = self.real_path(request_path) else {
            warn!(path = request_path, "real path exceeds {} bytes", REAL_PATH_CAPACITY);
            return Resolution::Internal;
        };

        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return Resolution::Missing,
        };
        if meta.permissions().mode() & libc::S_IROTH == 0 {
            return Resolution::Forbidden;
        }
        if meta.is_dir() {
            return Resolution::Directory;
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "open failed");
                return Resolution::Internal;
            }
        };
        let map = if meta.len() == 0 {
            None
        } else {
            match MappedFile::map(&file, meta.len() as usize) {
                Ok(map) => Some(map),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "mmap failed");
                    return Resolution::Internal;
                }
            }
        };
        // The mapping stays valid after the descriptor is closed.
        drop(file);
        Resolution::File { path, map }
    }
}
