//! Recording mocks of the lock manager's collaborators, for tests.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::host::{
    sysid_from_priv, GrantClient, GrantedMsg, Mon, MonId, MyId, RpcConnector,
    SmResult, SmStatRes, StatusMonitor,
};
use crate::lockf::Sysid;
use crate::server::{LockArgs, NlmLock};
use crate::utils::NlmError;

use async_trait::async_trait;

use tokio::time::{self, Duration};

/// Call observed by `MockMonitor`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum MonCall {
    Mon { mon_name: String, sysid: Sysid },
    Unmon { mon_name: String },
    UnmonAll { my_name: String },
}

/// Status monitor that records calls and answers as configured.
pub(crate) struct MockMonitor {
    local_state: i32,
    calls: Mutex<Vec<MonCall>>,
    refusing: AtomicBool,
    unreachable: AtomicBool,
}

impl MockMonitor {
    pub(crate) fn new(local_state: i32) -> Self {
        MockMonitor {
            local_state,
            calls: Mutex::new(vec![]),
            refusing: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<MonCall> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, call: MonCall) -> Result<SmStatRes, NlmError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(NlmError::msg("connection refused"));
        }
        self.calls.lock().unwrap().push(call);
        let res = if self.refusing.load(Ordering::SeqCst) {
            SmResult::Fail
        } else {
            SmResult::Success
        };
        Ok(SmStatRes {
            res,
            state: self.local_state,
        })
    }
}

#[async_trait]
impl StatusMonitor for MockMonitor {
    async fn mon(&self, req: &Mon) -> Result<SmStatRes, NlmError> {
        self.answer(MonCall::Mon {
            mon_name: req.mon_id.mon_name.clone(),
            sysid: sysid_from_priv(&req.priv_),
        })
    }

    async fn unmon(&self, id: &MonId) -> Result<SmStatRes, NlmError> {
        self.answer(MonCall::Unmon {
            mon_name: id.mon_name.clone(),
        })
    }

    async fn unmon_all(&self, id: &MyId) -> Result<i32, NlmError> {
        self.answer(MonCall::UnmonAll {
            my_name: id.my_name.clone(),
        })
        .map(|res| res.state)
    }
}

type SentLog = Arc<Mutex<Vec<(SocketAddr, GrantedMsg)>>>;

/// Connector whose clients record every grant they are asked to send.
pub(crate) struct MockConnector {
    sent: SentLog,
    connects: AtomicUsize,
    unreachable: AtomicBool,
    stalled: Mutex<Option<IpAddr>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        MockConnector {
            sent: Arc::new(Mutex::new(vec![])),
            connects: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
            stalled: Mutex::new(None),
        }
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Makes lookups for peer `ip` hang for an hour.
    pub(crate) fn set_stalled(&self, ip: Option<IpAddr>) {
        *self.stalled.lock().unwrap() = ip;
    }

    pub(crate) fn num_connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<(SocketAddr, GrantedMsg)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl RpcConnector for MockConnector {
    async fn lookup(
        &self,
        peer: SocketAddr,
        _prog: u32,
        _vers: u32,
    ) -> Result<SocketAddr, NlmError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(NlmError::msg("port mapper unreachable"));
        }
        let stalled = *self.stalled.lock().unwrap();
        if stalled == Some(peer.ip()) {
            time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(SocketAddr::new(peer.ip(), 4045))
    }

    async fn connect(
        &self,
        endpoint: SocketAddr,
        _vers: u32,
    ) -> Result<Arc<dyn GrantClient>, NlmError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockClient {
            endpoint,
            sent: self.sent.clone(),
        }))
    }
}

struct MockClient {
    endpoint: SocketAddr,
    sent: SentLog,
}

#[async_trait]
impl GrantClient for MockClient {
    async fn send_granted(&self, msg: &GrantedMsg) -> Result<(), NlmError> {
        self.sent.lock().unwrap().push((self.endpoint, msg.clone()));
        Ok(())
    }
}

/// File handle exported writable by test fixtures.
pub(crate) const FH: &[u8] = b"fh-1";

/// Builds Lock arguments on file `FH`.
pub(crate) fn lock_args(
    name: &str,
    svid: u32,
    l_offset: u64,
    l_len: u64,
    exclusive: bool,
    block: bool,
) -> LockArgs {
    LockArgs {
        cookie: format!("{}-{}-{}", name, svid, l_offset).into_bytes(),
        block,
        exclusive,
        alock: NlmLock {
            caller_name: name.into(),
            fh: FH.to_vec(),
            oh: name.as_bytes().to_vec(),
            svid,
            l_offset,
            l_len,
        },
        reclaim: false,
        state: 0,
    }
}

/// Polls `cond` until it holds, panicking after about a second.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}
