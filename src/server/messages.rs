//! Decoded NLM request arguments and replies exchanged with the RPC layer.

use std::net::SocketAddr;

use crate::lockf::{FileLock, LockKind, LockRange, Sysid};

use serde::{Deserialize, Serialize};

/// Opaque cookie echoed back in every reply.
pub type Cookie = Vec<u8>;

/// Lock descriptor as sent by a peer.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct NlmLock {
    /// Peer's own name for itself, the key of its host record.
    pub caller_name: String,

    /// File handle of the target file.
    pub fh: Vec<u8>,

    /// Peer-side owner handle.
    pub oh: Vec<u8>,

    /// Peer-side process id.
    pub svid: u32,

    pub l_offset: u64,
    pub l_len: u64,
}

impl NlmLock {
    #[inline]
    pub fn range(&self) -> LockRange {
        LockRange::new(self.l_offset, self.l_len)
    }

    /// Builds the descriptor handed to the lock primitive on behalf of the
    /// host owning `sysid`.
    #[inline]
    pub fn to_file_lock(&self, sysid: Sysid, exclusive: bool) -> FileLock {
        FileLock {
            range: self.range(),
            pid: self.svid,
            sysid,
            kind: LockKind::from_exclusive(exclusive),
        }
    }
}

/// Arguments of a Test request.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct TestArgs {
    pub cookie: Cookie,
    pub exclusive: bool,
    pub alock: NlmLock,
}

/// Grant notification sent back to a peer; same shape as a Test request.
pub type GrantedArgs = TestArgs;

/// Arguments of a Lock request.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct LockArgs {
    pub cookie: Cookie,

    /// Peer is willing to wait for an out-of-band grant.
    pub block: bool,

    pub exclusive: bool,
    pub alock: NlmLock,

    /// Peer restores a lock it held before it restarted.
    pub reclaim: bool,

    /// Peer's current NSM state counter.
    pub state: i32,
}

/// Arguments of a Cancel request.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct CancelArgs {
    pub cookie: Cookie,
    pub block: bool,
    pub exclusive: bool,
    pub alock: NlmLock,
}

/// Arguments of an Unlock request.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct UnlockArgs {
    pub cookie: Cookie,
    pub alock: NlmLock,
}

/// Arguments of a FreeAll request.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct NotifyArgs {
    pub name: String,
    pub state: i32,
}

/// Transport-level context of an inbound request.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RequestCtx {
    /// Remote address the request came from.
    pub addr: SocketAddr,

    /// NLM protocol version the request was made with.
    pub vers: u32,
}

/// Status code of a reply.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum NlmStat {
    Granted,
    Denied,
    DeniedNoLocks,
    Blocked,
    DeniedGracePeriod,
    Deadlock,
    ReadOnlyFs,
    StaleFh,
    Failed,
}

/// Conflicting holder reported by a denied Test.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TestHolder {
    pub exclusive: bool,
    pub svid: u32,

    /// Always empty: the holder's owner handle is not recorded anywhere.
    pub oh: Vec<u8>,

    pub l_offset: u64,
    pub l_len: u64,
}

/// Reply to a Test request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TestRes {
    pub cookie: Cookie,
    pub stat: NlmStat,

    /// Set iff `stat` is `Denied`.
    pub holder: Option<TestHolder>,
}

/// Reply to Lock, Cancel and Unlock requests.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Res {
    pub cookie: Cookie,
    pub stat: NlmStat,
}

impl Res {
    #[inline]
    pub(crate) fn new(cookie: &Cookie, stat: NlmStat) -> Self {
        Res {
            cookie: cookie.clone(),
            stat,
        }
    }
}

impl TestRes {
    #[inline]
    pub(crate) fn new(cookie: &Cookie, stat: NlmStat) -> Self {
        TestRes {
            cookie: cookie.clone(),
            stat,
            holder: None,
        }
    }
}
