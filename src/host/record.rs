//! Per-peer host record.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::host::GrantClient;
use crate::lockf::{FileLock, FileRef, LockPrimitive, Sysid};
use crate::server::GrantedArgs;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// NLM RPC program number.
pub const NLM_PROG: u32 = 100021;

/// Original NLM protocol version.
pub const NLM_VERS: u32 = 1;

/// Version adding share reservations and asynchronous procedures.
pub const NLM_VERSX: u32 = 3;

/// 64-bit offsets version.
pub const NLM_VERS4: u32 = 4;

/// Local status monitor registration state of a host.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MonitorState {
    Unmonitored,
    Monitored,
    MonitorFailed,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            MonitorState::Unmonitored => "unmonitored",
            MonitorState::Monitored => "monitored",
            MonitorState::MonitorFailed => "monitor-failed",
        };
        write!(f, "{}", s)
    }
}

/// Identifier of an async lock request, doubling as its cancel token.
pub type AsyncLockId = u64;

/// One outstanding blocking lock request.
pub(crate) struct AsyncLock {
    /// File being locked.
    pub(crate) file: FileRef,

    /// Lock descriptor as handed to the lock primitive.
    pub(crate) lock: FileLock,

    /// Pre-built grant notification payload.
    pub(crate) granted: GrantedArgs,

    /// Set once the grant path is done with this request.
    pub(crate) settled: Arc<watch::Sender<bool>>,
}

/// Cached outbound client to a host's NLM.
pub(crate) struct CachedClient {
    pub(crate) client: Arc<dyn GrantClient>,
    pub(crate) created: Instant,
}

/// Mutable part of a host, guarded by the host lock.
pub(crate) struct HostState {
    /// Last seen remote address.
    pub(crate) addr: Option<SocketAddr>,

    /// NLM protocol version of the last request.
    pub(crate) vers: u32,

    /// Last seen NSM state counter of the peer; 0 if never seen.
    pub(crate) nsm_state: i32,

    /// Local monitoring state.
    pub(crate) monitor: MonitorState,

    /// Time at which the host counts as idle.
    pub(crate) idle_timeout: Instant,

    /// Outbound client used for grant notifications.
    pub(crate) rpc: Option<CachedClient>,

    /// Requests awaiting grant, in submission order.
    pub(crate) pending: BTreeMap<AsyncLockId, AsyncLock>,

    /// Requests whose grant has been sent, awaiting cleanup.
    pub(crate) finished: BTreeMap<AsyncLockId, AsyncLock>,
}

/// A remote NLM peer.
pub struct Host {
    caller_name: String,
    sysid: Sysid,
    pub(crate) state: Mutex<HostState>,
}

impl Host {
    pub(crate) fn new(
        caller_name: &str,
        sysid: Sysid,
        idle_timeout: Instant,
    ) -> Self {
        Host {
            caller_name: caller_name.into(),
            sysid,
            state: Mutex::new(HostState {
                addr: None,
                vers: 0,
                nsm_state: 0,
                monitor: MonitorState::Unmonitored,
                idle_timeout,
                rpc: None,
                pending: BTreeMap::new(),
                finished: BTreeMap::new(),
            }),
        }
    }

    #[inline]
    pub fn caller_name(&self) -> &str {
        &self.caller_name
    }

    #[inline]
    pub fn sysid(&self) -> Sysid {
        self.sysid
    }

    /// Takes a snapshot of the host, counting its locks in `lockf`.
    pub async fn info(&self, lockf: &dyn LockPrimitive) -> HostInfo {
        let st = self.state.lock().await;
        HostInfo {
            caller_name: self.caller_name.clone(),
            sysid: self.sysid,
            addr: st.addr,
            vers: st.vers,
            monitor: st.monitor,
            nsm_state: st.nsm_state,
            num_pending: st.pending.len(),
            num_finished: st.finished.len(),
            lock_count: lockf.count_held(self.sysid),
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Host")
            .field("caller_name", &self.caller_name)
            .field("sysid", &self.sysid)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a host.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HostInfo {
    pub caller_name: String,
    pub sysid: Sysid,
    pub addr: Option<SocketAddr>,
    pub vers: u32,
    pub monitor: MonitorState,
    pub nsm_state: i32,
    pub num_pending: usize,
    pub num_finished: usize,
    pub lock_count: usize,
}

#[cfg(test)]
mod record_tests {
    use super::*;
    use crate::lockf::MemLockTable;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fresh_host_info() {
        let host = Host::new("alice", 3, Instant::now());
        let info = host.info(&MemLockTable::new()).await;
        assert_eq!(info.caller_name, "alice");
        assert_eq!(info.sysid, 3);
        assert_eq!(info.addr, None);
        assert_eq!(info.monitor, MonitorState::Unmonitored);
        assert_eq!(info.nsm_state, 0);
        assert_eq!(info.num_pending + info.num_finished, 0);
        assert_eq!(info.lock_count, 0);
    }
}
