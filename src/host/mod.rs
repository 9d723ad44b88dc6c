//! Remote host tracking: host records and their registry, status monitor
//! registration, outbound grant clients and async lock requests.

mod asynclock;
mod monitor;
mod record;
mod registry;
mod rpcclient;

pub use asynclock::{AsyncLocker, Submitted};
pub use monitor::{
    sysid_from_priv, sysid_to_priv, Mon, MonId, MyId, SmReply, SmRequest,
    SmResult, SmStatRes, SmStatus, StatusMonitor, TcpStatusMonitor,
    NLM_SM, NLM_SM_NOTIFY, SM_PRIV_SIZE, SM_PROG, SM_VERS,
};
pub use record::{
    AsyncLockId, Host, HostInfo, MonitorState, NLM_PROG, NLM_VERS, NLM_VERS4,
    NLM_VERSX,
};
pub use registry::{HostRegistry, RegistryParams};
pub use rpcclient::{
    GrantClient, GrantedMsg, LegacyGrantedArgs, LegacyLock, PortmapReply,
    PortmapRequest, RpcConnector, TcpRpcConnector, PORTMAP_PORT,
};

pub(crate) use monitor::{host_monitor, host_unmonitor};
pub(crate) use record::{AsyncLock, CachedClient, HostState};
