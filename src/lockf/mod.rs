//! Byte-range lock primitive contract used by the lock manager.
//!
//! Locks are advisory and keyed by owner `(sysid, pid)`, where `sysid`
//! identifies the remote host on whose behalf a lock is held. Blocking
//! acquisitions complete asynchronously: the primitive invokes the supplied
//! grant callback from whatever context releases the conflicting lock.

mod memtable;

pub use memtable::MemLockTable;

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Locally-assigned remote host identifier used as lock owner key.
pub type Sysid = u32;

/// Token identifying one asynchronous acquisition, supplied by the caller
/// and used later to cancel it.
pub type CancelToken = u64;

/// Callback invoked exactly once when a pending asynchronous acquisition
/// gets granted. Never invoked if the acquisition is cancelled.
pub type GrantCallback = Box<dyn FnOnce() + Send + 'static>;

/// Lock type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    /// Read lock, may be shared with other readers.
    Shared,

    /// Write lock.
    Exclusive,
}

impl LockKind {
    #[inline]
    pub fn from_exclusive(exclusive: bool) -> Self {
        if exclusive {
            LockKind::Exclusive
        } else {
            LockKind::Shared
        }
    }

    #[inline]
    pub fn is_exclusive(self) -> bool {
        self == LockKind::Exclusive
    }

    /// Two locks of different owners conflict unless both are shared.
    #[inline]
    pub fn conflicts_with(self, other: LockKind) -> bool {
        self.is_exclusive() || other.is_exclusive()
    }
}

/// Byte range of a lock. A length of 0 means "through end of file".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub struct LockRange {
    pub offset: u64,
    pub len: u64,
}

impl LockRange {
    #[inline]
    pub fn new(offset: u64, len: u64) -> Self {
        LockRange { offset, len }
    }

    /// Exclusive end offset; `u64::MAX` stands for end of file.
    #[inline]
    pub fn end(&self) -> u64 {
        if self.len == 0 {
            u64::MAX
        } else {
            self.offset.saturating_add(self.len)
        }
    }

    /// Converts back from half-open bounds as stored in a range map.
    #[inline]
    pub fn from_bounds(start: u64, end: u64) -> Self {
        if end == u64::MAX {
            LockRange::new(start, 0)
        } else {
            LockRange::new(start, end - start)
        }
    }

    /// Half-open range form, or `None` if it covers no byte at all.
    #[inline]
    pub fn as_range(&self) -> Option<Range<u64>> {
        let end = self.end();
        if self.offset < end {
            Some(self.offset..end)
        } else {
            None
        }
    }

    #[inline]
    pub fn overlaps(&self, other: &LockRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

impl fmt::Display for LockRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.len == 0 {
            write!(f, "[{},EOF)", self.offset)
        } else {
            write!(f, "[{},{})", self.offset, self.end())
        }
    }
}

/// Owner of a byte-range lock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
pub struct LockOwner {
    pub sysid: Sysid,
    pub pid: u32,
}

/// Reference to a lockable file as resolved from a peer's file handle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
pub struct FileRef(pub u64);

/// Full lock descriptor handed to the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLock {
    pub range: LockRange,
    pub pid: u32,
    pub sysid: Sysid,
    pub kind: LockKind,
}

impl FileLock {
    #[inline]
    pub fn owner(&self) -> LockOwner {
        LockOwner {
            sysid: self.sysid,
            pid: self.pid,
        }
    }

    /// Whether two descriptors name the same request from one host, i.e.
    /// identical range, pid and lock type.
    #[inline]
    pub fn same_request(&self, other: &FileLock) -> bool {
        self.range == other.range
            && self.pid == other.pid
            && self.kind == other.kind
    }
}

/// Failure of a lock primitive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Conflicting lock held and the caller asked not to wait.
    WouldBlock,

    /// Waiting would close a cycle in the waits-for graph.
    Deadlock,

    /// Lock table is full.
    NoResources,

    /// Malformed request, e.g. a range covering no byte.
    Invalid,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            LockError::WouldBlock => "conflicting lock held",
            LockError::Deadlock => "deadlock detected",
            LockError::NoResources => "no lock resources available",
            LockError::Invalid => "invalid lock request",
        };
        write!(f, "{}", s)
    }
}

/// Immediate outcome of an asynchronous acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncAcquire {
    /// Lock granted synchronously; the callback is dropped uncalled.
    Granted,

    /// Lock queued; the callback fires once it gets granted.
    Pending,
}

/// Outcome of cancelling an asynchronous acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Request removed before being granted; its callback will never fire.
    Cancelled,

    /// Request was no longer queued: the grant already happened (or is
    /// happening) and the callback has been or is being invoked.
    AlreadyCompleted,
}

/// The byte-range lock primitive the lock manager drives. Every method is
/// non-blocking; grants of queued requests are delivered through callbacks.
pub trait LockPrimitive: Send + Sync {
    /// Returns the first lock conflicting with `lock`, if any.
    fn test(
        &self,
        file: FileRef,
        lock: &FileLock,
    ) -> Result<Option<FileLock>, LockError>;

    /// Acquires `lock` or fails with `WouldBlock` right away.
    fn acquire_sync(
        &self,
        file: FileRef,
        lock: &FileLock,
    ) -> Result<(), LockError>;

    /// Acquires `lock`, queueing it under `token` if it cannot be granted
    /// now. `on_grant` fires once the queued request gets granted, possibly
    /// before this call has even returned.
    fn acquire_async(
        &self,
        file: FileRef,
        lock: &FileLock,
        token: CancelToken,
        on_grant: GrantCallback,
    ) -> Result<AsyncAcquire, LockError>;

    /// Cancels a queued acquisition.
    fn cancel(&self, file: FileRef, token: CancelToken) -> CancelOutcome;

    /// Releases the range of `lock` held by its owner.
    fn release(&self, file: FileRef, lock: &FileLock) -> Result<(), LockError>;

    /// Releases every lock held under `sysid`, on all files.
    fn release_all(&self, sysid: Sysid);

    /// Number of locks currently held under `sysid`.
    fn count_held(&self, sysid: Sysid) -> usize;
}
