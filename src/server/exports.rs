//! Export resolution: turning a peer's file handle into a lockable file.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

use crate::lockf::FileRef;
use crate::server::NlmStat;

/// Failure resolving a file handle.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VfsError {
    /// Handle does not name a live file.
    Stale,

    /// File lives on a read-only export.
    ReadOnly,

    /// Peer is not allowed to access the export.
    Access,

    Other,
}

impl VfsError {
    /// Maps to the reply status the peer sees.
    pub fn to_stat(self) -> NlmStat {
        match self {
            VfsError::Stale => NlmStat::StaleFh,
            VfsError::ReadOnly => NlmStat::ReadOnlyFs,
            _ => NlmStat::Failed,
        }
    }
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            VfsError::Stale => "stale file handle",
            VfsError::ReadOnly => "read-only export",
            VfsError::Access => "access denied",
            VfsError::Other => "export lookup failed",
        };
        write!(f, "{}", s)
    }
}

/// Resolves `(peer address, file handle)` to a lockable file.
pub trait ExportResolver: Send + Sync {
    fn resolve(
        &self,
        peer: Option<SocketAddr>,
        fh: &[u8],
    ) -> Result<FileRef, VfsError>;
}

#[derive(Debug, Clone, Copy)]
struct ExportEntry {
    file: FileRef,
    read_only: bool,
}

/// In-memory table of exported file handles.
#[derive(Debug, Default)]
pub struct MemExports {
    entries: RwLock<HashMap<Vec<u8>, ExportEntry>>,
}

impl MemExports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports `fh` as `file`, replacing any previous entry.
    pub fn export(&self, fh: &[u8], file: FileRef, read_only: bool) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fh.to_vec(), ExportEntry { file, read_only });
    }

    /// Withdraws `fh`; later requests naming it see a stale handle.
    pub fn unexport(&self, fh: &[u8]) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(fh)
            .is_some()
    }
}

impl ExportResolver for MemExports {
    fn resolve(
        &self,
        _peer: Option<SocketAddr>,
        fh: &[u8],
    ) -> Result<FileRef, VfsError> {
        let entries =
            self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(fh) {
            Some(entry) if entry.read_only => Err(VfsError::ReadOnly),
            Some(entry) => Ok(entry.file),
            None => Err(VfsError::Stale),
        }
    }
}
