//! Client side of the local status monitor (NSM), used to learn about peer
//! reboots.

use std::net::SocketAddr;

use crate::host::{Host, HostState, MonitorState, NLM_PROG};
use crate::lockf::Sysid;
use crate::utils::{read_frame, write_frame, NlmError};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::net::TcpStream;
use tokio::time::{self, Duration};

/// Status monitor RPC program number.
pub const SM_PROG: u32 = 100024;

/// Status monitor protocol version.
pub const SM_VERS: u32 = 1;

/// Version of our callback program the monitor notifies.
pub const NLM_SM: u32 = 0;

/// Procedure of our callback program the monitor notifies.
pub const NLM_SM_NOTIFY: u32 = 1;

/// Size of the private tag attached to a registration.
pub const SM_PRIV_SIZE: usize = 16;

/// Identity of the monitoring side, where notifications get delivered.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MyId {
    pub my_name: String,
    pub my_prog: u32,
    pub my_vers: u32,
    pub my_proc: u32,
}

impl MyId {
    /// Identity of our own NLM notify procedure on `my_name`.
    pub fn nlm(my_name: &str) -> Self {
        MyId {
            my_name: my_name.into(),
            my_prog: NLM_PROG,
            my_vers: NLM_SM,
            my_proc: NLM_SM_NOTIFY,
        }
    }
}

/// Names a monitored peer and who wants to hear about it.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MonId {
    pub mon_name: String,
    pub my_id: MyId,
}

/// Registration request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Mon {
    pub mon_id: MonId,

    /// Tag handed back verbatim in notifications.
    pub priv_: [u8; SM_PRIV_SIZE],
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum SmResult {
    Success,
    Fail,
}

/// Monitor's answer to a (de)registration.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct SmStatRes {
    pub res: SmResult,

    /// Local NSM state counter.
    pub state: i32,
}

/// Inbound notification that a monitored peer changed state.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SmStatus {
    pub mon_name: String,
    pub state: i32,
    pub priv_: [u8; SM_PRIV_SIZE],
}

/// Encodes a sysid into a registration's private tag.
pub fn sysid_to_priv(sysid: Sysid) -> [u8; SM_PRIV_SIZE] {
    let mut tag = [0; SM_PRIV_SIZE];
    tag[..4].copy_from_slice(&sysid.to_be_bytes());
    tag
}

/// Decodes the sysid out of a notification's private tag.
pub fn sysid_from_priv(tag: &[u8; SM_PRIV_SIZE]) -> Sysid {
    Sysid::from_be_bytes([tag[0], tag[1], tag[2], tag[3]])
}

/// The local status monitor service.
#[async_trait]
pub trait StatusMonitor: Send + Sync {
    /// Asks to be notified when `req.mon_id.mon_name` changes state.
    async fn mon(&self, req: &Mon) -> Result<SmStatRes, NlmError>;

    /// Withdraws a registration.
    async fn unmon(&self, id: &MonId) -> Result<SmStatRes, NlmError>;

    /// Withdraws every registration made by `id`; returns the local NSM
    /// state.
    async fn unmon_all(&self, id: &MyId) -> Result<i32, NlmError>;
}

fn mon_id(host: &Host, my_name: &str) -> MonId {
    MonId {
        mon_name: host.caller_name().into(),
        my_id: MyId::nlm(my_name),
    }
}

/// Records the first NSM state seen for the host and registers it with the
/// monitor if not yet monitored. A refusal marks the host `MonitorFailed`
/// for good; an unreachable monitor leaves it unmonitored.
pub(crate) async fn host_monitor(
    host: &Host,
    st: &mut HostState,
    state: i32,
    sm: &dyn StatusMonitor,
    my_name: &str,
) {
    if state != 0 && st.nsm_state == 0 {
        st.nsm_state = state;
        pf_info!(
            "host {} (sysid {}) has NSM state {}",
            host.caller_name(),
            host.sysid(),
            state
        );
    }

    if st.monitor != MonitorState::Unmonitored {
        return;
    }

    pf_info!("monitoring {} (sysid {})", host.caller_name(), host.sysid());
    let req = Mon {
        mon_id: mon_id(host, my_name),
        priv_: sysid_to_priv(host.sysid()),
    };
    match sm.mon(&req).await {
        Err(e) => {
            pf_warn!("failed to contact local NSM: {}", e);
        }
        Ok(res) if res.res == SmResult::Fail => {
            pf_warn!("local NSM refuses to monitor {}", host.caller_name());
            st.monitor = MonitorState::MonitorFailed;
        }
        Ok(_) => st.monitor = MonitorState::Monitored,
    }
}

/// Deregisters the host from the monitor. Callers make sure it holds no
/// locks any more.
pub(crate) async fn host_unmonitor(
    host: &Host,
    st: &mut HostState,
    sm: &dyn StatusMonitor,
    my_name: &str,
) {
    pf_info!("unmonitoring {} (sysid {})", host.caller_name(), host.sysid());
    match sm.unmon(&mon_id(host, my_name)).await {
        Err(e) => {
            pf_warn!("failed to contact local NSM: {}", e);
        }
        Ok(res) if res.res == SmResult::Fail => {
            pf_warn!("local NSM refuses to unmonitor {}", host.caller_name());
        }
        Ok(_) => st.monitor = MonitorState::Unmonitored,
    }
}

/// Request to the status monitor over TCP.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum SmRequest {
    Mon(Mon),
    Unmon(MonId),
    UnmonAll(MyId),
}

/// Reply from the status monitor over TCP.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum SmReply {
    StatRes(SmStatRes),
    State(i32),
}

/// Status monitor client speaking length-prefixed frames over TCP, one
/// connection per call.
pub struct TcpStatusMonitor {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpStatusMonitor {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        TcpStatusMonitor { addr, timeout }
    }

    async fn call(&self, req: &SmRequest) -> Result<SmReply, NlmError> {
        time::timeout(self.timeout, async {
            let mut conn = TcpStream::connect(self.addr).await?;
            write_frame(req, &mut conn).await?;
            read_frame(&mut conn).await
        })
        .await?
    }

    async fn call_stat(&self, req: &SmRequest) -> Result<SmStatRes, NlmError> {
        match self.call(req).await? {
            SmReply::StatRes(res) => Ok(res),
            reply => logged_err!("unexpected NSM reply {:?}", reply),
        }
    }
}

#[async_trait]
impl StatusMonitor for TcpStatusMonitor {
    async fn mon(&self, req: &Mon) -> Result<SmStatRes, NlmError> {
        self.call_stat(&SmRequest::Mon(req.clone())).await
    }

    async fn unmon(&self, id: &MonId) -> Result<SmStatRes, NlmError> {
        self.call_stat(&SmRequest::Unmon(id.clone())).await
    }

    async fn unmon_all(&self, id: &MyId) -> Result<i32, NlmError> {
        match self.call(&SmRequest::UnmonAll(id.clone())).await? {
            SmReply::State(state) => Ok(state),
            reply => logged_err!("unexpected NSM reply {:?}", reply),
        }
    }
}
