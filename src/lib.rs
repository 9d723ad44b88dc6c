//! Network Lock Manager core: remote host tracking, byte-range lock
//! dispatch, asynchronous grants and reboot recovery.

#[macro_use]
mod utils;

pub mod host;
pub mod lockf;
pub mod server;

#[cfg(test)]
mod testkit;

// public interface exports
pub use utils::{logger_init, NlmError, ME};

pub use host::{
    Host, HostInfo, HostRegistry, MonitorState, RpcConnector, StatusMonitor,
    TcpRpcConnector, TcpStatusMonitor,
};
pub use lockf::{FileRef, LockPrimitive, MemLockTable, Sysid};
pub use server::{
    ExportResolver, LockManager, LockdConfig, MemExports, NlmStat,
};
