//! Registry of known remote hosts.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::host::{host_monitor, host_unmonitor, Host, MonitorState};
use crate::host::{HostState, StatusMonitor};
use crate::lockf::{LockPrimitive, Sysid};
use crate::server::RequestCtx;
use crate::utils::NlmError;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Registry parameters.
#[derive(Debug, Clone)]
pub struct RegistryParams {
    /// A host is idle after this long without a request.
    pub idle_timeout: Duration,

    /// Minimum spacing between idle sweeps.
    pub idle_period: Duration,

    /// Longest accepted caller name.
    pub max_name_len: usize,

    /// Our own name in status monitor requests.
    pub local_name: String,
}

struct RegistryInner {
    /// All known hosts, in creation order.
    hosts: Vec<Arc<Host>>,

    /// Sysid for the next host created; never reused.
    next_sysid: Sysid,

    /// Idle sweeps do not run before this time.
    next_idle_check: Instant,
}

/// The host registry. Lock order is registry first, then host.
pub struct HostRegistry {
    inner: Mutex<RegistryInner>,
    lockf: Arc<dyn LockPrimitive>,
    monitor: Arc<dyn StatusMonitor>,
    params: RegistryParams,
}

// HostRegistry public API implementation
impl HostRegistry {
    /// Creates an empty registry.
    pub fn new(
        params: RegistryParams,
        lockf: Arc<dyn LockPrimitive>,
        monitor: Arc<dyn StatusMonitor>,
    ) -> Self {
        HostRegistry {
            inner: Mutex::new(RegistryInner {
                hosts: vec![],
                next_sysid: 1,
                next_idle_check: Instant::now(),
            }),
            lockf,
            monitor,
            params,
        }
    }

    /// Pushes back the next idle sweep to one period from now.
    pub async fn defer_idle_check(&self) {
        let mut inner = self.inner.lock().await;
        inner.next_idle_check = Instant::now() + self.params.idle_period;
    }

    /// Finds the host called `name`, creating it if unknown, and resets its
    /// idle timeout. With a request context, records where the host talks
    /// from; a cached client bound to another address or version is dropped
    /// first.
    pub async fn find_or_create_by_name(
        &self,
        name: &str,
        ctx: Option<&RequestCtx>,
    ) -> Result<Arc<Host>, NlmError> {
        if name.len() > self.params.max_name_len {
            return logged_err!(
                "caller name of length {} exceeds limit {}",
                name.len(),
                self.params.max_name_len
            );
        }

        self.check_idle().await;

        let host = {
            let mut inner = self.inner.lock().await;
            let existing =
                inner.hosts.iter().find(|h| h.caller_name() == name).cloned();
            match existing {
                Some(host) => host,
                None => self.create_host(&mut inner, name)?,
            }
        };

        let mut st = host.state.lock().await;
        st.idle_timeout = Instant::now() + self.params.idle_timeout;
        if let Some(ctx) = ctx {
            if let (Some(addr), Some(_)) = (st.addr, &st.rpc) {
                if addr.ip() != ctx.addr.ip() || st.vers != ctx.vers {
                    pf_debug!(
                        "host {} moved from {} vers {} to {} vers {}",
                        name,
                        addr,
                        st.vers,
                        ctx.addr,
                        ctx.vers
                    );
                    st.drop_rpc();
                }
            }
            st.addr = Some(ctx.addr);
            st.vers = ctx.vers;
        }
        drop(st);

        Ok(host)
    }

    /// Finds the host last seen at the IP of `addr`, creating one named
    /// after the address if unknown, and resets its idle timeout.
    pub async fn find_or_create_by_addr(
        &self,
        addr: SocketAddr,
        vers: u32,
    ) -> Result<Arc<Host>, NlmError> {
        self.check_idle().await;

        let mut inner = self.inner.lock().await;
        let mut found = None;
        for host in inner.hosts.iter() {
            let st = host.state.lock().await;
            if st.addr.is_some_and(|a| a.ip() == addr.ip()) {
                found = Some(host.clone());
                break;
            }
        }

        let host = match found {
            Some(host) => host,
            None => {
                let name = addr.ip().to_string();
                let host = self.create_host(&mut inner, &name)?;
                let mut st = host.state.lock().await;
                st.addr = Some(addr);
                st.vers = vers;
                drop(st);
                host
            }
        };
        drop(inner);

        host.state.lock().await.idle_timeout =
            Instant::now() + self.params.idle_timeout;
        Ok(host)
    }

    /// Finds the host with the given sysid.
    pub async fn find_by_sysid(&self, sysid: Sysid) -> Option<Arc<Host>> {
        let inner = self.inner.lock().await;
        inner.hosts.iter().find(|h| h.sysid() == sysid).cloned()
    }

    /// Every host called exactly `name`.
    pub async fn hosts_named(&self, name: &str) -> Vec<Arc<Host>> {
        let inner = self.inner.lock().await;
        inner
            .hosts
            .iter()
            .filter(|h| h.caller_name() == name)
            .cloned()
            .collect()
    }

    /// Every known host, in creation order.
    pub async fn all(&self) -> Vec<Arc<Host>> {
        self.inner.lock().await.hosts.clone()
    }

    /// Forgets the host. A later request from the same peer creates a new
    /// host with a new sysid.
    pub async fn remove(&self, host: &Arc<Host>) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.hosts.len();
        inner.hosts.retain(|h| !Arc::ptr_eq(h, host));
        inner.hosts.len() != before
    }

    /// Registers the host with the status monitor, see `host_monitor()`.
    pub(crate) async fn monitor(
        &self,
        host: &Host,
        st: &mut HostState,
        state: i32,
    ) {
        host_monitor(
            host,
            st,
            state,
            self.monitor.as_ref(),
            &self.params.local_name,
        )
        .await;
    }

    /// Stops monitoring hosts that have been idle for a while and hold no
    /// locks; hosts still holding locks get their idle timeout pushed out.
    /// Runs at most once per idle period.
    pub async fn check_idle(&self) {
        let now = Instant::now();
        let hosts = {
            let mut inner = self.inner.lock().await;
            if now <= inner.next_idle_check {
                return;
            }
            inner.next_idle_check = now + self.params.idle_period;
            inner.hosts.clone()
        };

        for host in hosts {
            let mut st = host.state.lock().await;
            if st.monitor != MonitorState::Monitored || now <= st.idle_timeout {
                continue;
            }

            if self.lockf.count_held(host.sysid()) > 0 {
                st.idle_timeout = now + self.params.idle_timeout;
                continue;
            }
            host_unmonitor(
                &host,
                &mut st,
                self.monitor.as_ref(),
                &self.params.local_name,
            )
            .await;
        }
    }
}

// HostRegistry internal helpers
impl HostRegistry {
    fn create_host(
        &self,
        inner: &mut RegistryInner,
        name: &str,
    ) -> Result<Arc<Host>, NlmError> {
        let sysid = inner.next_sysid;
        inner.next_sysid = match sysid.checked_add(1) {
            Some(next) => next,
            None => return logged_err!("sysid space exhausted"),
        };

        pf_info!("new host {} (sysid {})", name, sysid);
        let host = Arc::new(Host::new(
            name,
            sysid,
            Instant::now() + self.params.idle_timeout,
        ));
        inner.hosts.push(host.clone());
        Ok(host)
    }
}
