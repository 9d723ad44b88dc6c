//! The lock manager: dispatch of Test/Lock/Cancel/Unlock requests, reboot
//! handling and server lifecycle.

use std::sync::Arc;

use crate::host::{
    sysid_from_priv, AsyncLocker, Host, HostInfo, HostRegistry, MyId,
    RegistryParams, RpcConnector, SmStatus, StatusMonitor, Submitted,
};
use crate::lockf::{CancelOutcome, FileRef, LockError, LockPrimitive};
use crate::server::{
    CancelArgs, ExportResolver, GrantedArgs, LockArgs, LockdConfig, NlmStat,
    NotifyArgs, RequestCtx, Res, TestArgs, TestHolder, TestRes, UnlockArgs,
};
use crate::utils::{NlmError, ME};

use tokio::time::{Duration, Instant};

/// Maps a lock primitive failure to the reply status.
fn lock_error_stat(e: LockError) -> NlmStat {
    match e {
        LockError::WouldBlock => NlmStat::Denied,
        LockError::Deadlock => NlmStat::Deadlock,
        LockError::NoResources => NlmStat::DeniedNoLocks,
        LockError::Invalid => NlmStat::Failed,
    }
}

/// The NLM lock manager.
pub struct LockManager {
    /// Configuration parameters.
    config: LockdConfig,

    /// Byte-range lock primitive locks are placed in.
    lockf: Arc<dyn LockPrimitive>,

    /// Resolver of peers' file handles.
    exports: Arc<dyn ExportResolver>,

    /// Local status monitor.
    monitor: Arc<dyn StatusMonitor>,

    /// Registry of known hosts.
    registry: HostRegistry,

    /// Tracker of blocking lock requests.
    locker: AsyncLocker,

    /// End of the grace period; only reclaims get through before it.
    grace_threshold: Instant,

    /// Local NSM state learned at start.
    local_nsm_state: i32,
}

// LockManager public API implementation
impl LockManager {
    /// Creates a lock manager from an optional TOML config string and its
    /// collaborators. Spawns the granter thread, so must be called within a
    /// tokio runtime.
    pub async fn new_and_setup(
        config_str: Option<&str>,
        lockf: Arc<dyn LockPrimitive>,
        exports: Arc<dyn ExportResolver>,
        monitor: Arc<dyn StatusMonitor>,
        connector: Arc<dyn RpcConnector>,
    ) -> Result<Self, NlmError> {
        let _ = ME.set("nlm".into());
        let config = LockdConfig::from_toml(config_str)?;

        let registry = HostRegistry::new(
            RegistryParams {
                idle_timeout: Duration::from_secs(config.idle_timeout_secs),
                idle_period: Duration::from_secs(config.idle_period_secs),
                max_name_len: config.max_name_len,
                local_name: config.local_name.clone(),
            },
            lockf.clone(),
            monitor.clone(),
        );
        let locker = AsyncLocker::new_and_setup(
            lockf.clone(),
            connector,
            Duration::from_secs(config.rpc_stale_secs),
        );

        Ok(LockManager {
            config,
            lockf,
            exports,
            monitor,
            registry,
            locker,
            grace_threshold: Instant::now(),
            local_nsm_state: 0,
        })
    }

    /// Starts serving: clears stale registrations at the local status
    /// monitor, learning its state, and opens the grace period.
    pub async fn start(&mut self) -> Result<(), NlmError> {
        let my_id = MyId::nlm(&self.config.local_name);
        self.local_nsm_state = match self.monitor.unmon_all(&my_id).await {
            Ok(state) => state,
            Err(e) => {
                return logged_err!("unable to contact local NSM: {}", e);
            }
        };
        pf_info!("local NSM state is {}", self.local_nsm_state);

        self.grace_threshold =
            Instant::now() + Duration::from_secs(self.config.grace_period_secs);
        self.registry.defer_idle_check().await;
        Ok(())
    }

    /// True while within the grace period.
    #[inline]
    pub fn in_grace(&self) -> bool {
        Instant::now() < self.grace_threshold
    }

    /// Local NSM state as learned at start.
    #[inline]
    pub fn local_nsm_state(&self) -> i32 {
        self.local_nsm_state
    }

    /// The host registry.
    #[inline]
    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Handles a Test request.
    pub async fn test(
        &self,
        args: &TestArgs,
        ctx: Option<&RequestCtx>,
    ) -> TestRes {
        let host = match self.resolve_host(&args.alock.caller_name, ctx).await
        {
            Some(host) => host,
            None => return TestRes::new(&args.cookie, NlmStat::DeniedNoLocks),
        };
        pf_trace!("test from {} (sysid {})", host.caller_name(), host.sysid());

        self.locker.reap_finished(&host).await;
        if self.in_grace() {
            return TestRes::new(&args.cookie, NlmStat::DeniedGracePeriod);
        }
        let file = match self.resolve_file(&host, &args.alock.fh).await {
            Ok(file) => file,
            Err(stat) => return TestRes::new(&args.cookie, stat),
        };

        let fl = args.alock.to_file_lock(host.sysid(), args.exclusive);
        match self.lockf.test(file, &fl) {
            Ok(None) => TestRes::new(&args.cookie, NlmStat::Granted),
            Ok(Some(holder)) => TestRes {
                cookie: args.cookie.clone(),
                stat: NlmStat::Denied,
                holder: Some(TestHolder {
                    exclusive: holder.kind.is_exclusive(),
                    svid: holder.pid,
                    oh: vec![],
                    l_offset: holder.range.offset,
                    l_len: holder.range.len,
                }),
            },
            Err(e) => {
                pf_warn!("test for {} failed: {}", host.caller_name(), e);
                TestRes::new(&args.cookie, NlmStat::Failed)
            }
        }
    }

    /// Handles a Lock request. With `monitor` set, a changed peer NSM state
    /// is treated as a missed reboot notification, and a granted lock gets
    /// the host registered with the status monitor.
    pub async fn lock(
        &self,
        args: &LockArgs,
        ctx: Option<&RequestCtx>,
        monitor: bool,
    ) -> Res {
        let host = match self.resolve_host(&args.alock.caller_name, ctx).await
        {
            Some(host) => host,
            None => return Res::new(&args.cookie, NlmStat::DeniedNoLocks),
        };
        pf_trace!("lock from {} (sysid {})", host.caller_name(), host.sysid());

        if monitor && args.state != 0 {
            let known = host.state.lock().await.nsm_state;
            if known != 0 && known != args.state {
                // host rebooted without telling us
                self.host_notify(&host, args.state, false).await;
            }
        }

        self.locker.reap_finished(&host).await;
        if self.in_grace() && !args.reclaim {
            return Res::new(&args.cookie, NlmStat::DeniedGracePeriod);
        }
        let file = match self.resolve_file(&host, &args.alock.fh).await {
            Ok(file) => file,
            Err(stat) => return Res::new(&args.cookie, stat),
        };

        let fl = args.alock.to_file_lock(host.sysid(), args.exclusive);
        let result = if args.block {
            // grants must be deliverable before we promise one
            if let Err(e) = self.locker.host_rpc(&host).await {
                pf_warn!("cannot reach NLM of {}: {}", host.caller_name(), e);
                return Res::new(&args.cookie, NlmStat::Failed);
            }

            let granted = GrantedArgs {
                cookie: args.cookie.clone(),
                exclusive: args.exclusive,
                alock: args.alock.clone(),
            };
            match self.locker.submit(&host, file, fl, granted).await {
                Ok(Submitted::Granted) => Ok(()),
                Ok(Submitted::Pending(_)) | Ok(Submitted::Duplicate) => {
                    return Res::new(&args.cookie, NlmStat::Blocked);
                }
                Err(e) => Err(e),
            }
        } else {
            self.lockf.acquire_sync(file, &fl)
        };

        match result {
            Ok(()) => {
                if monitor {
                    let mut st = host.state.lock().await;
                    self.registry.monitor(&host, &mut st, args.state).await;
                }
                Res::new(&args.cookie, NlmStat::Granted)
            }
            Err(e) => Res::new(&args.cookie, lock_error_stat(e)),
        }
    }

    /// Handles a Cancel request. `Denied` if no matching request is pending
    /// or its grant already fired.
    pub async fn cancel(
        &self,
        args: &CancelArgs,
        ctx: Option<&RequestCtx>,
    ) -> Res {
        let host = match self.resolve_host(&args.alock.caller_name, ctx).await
        {
            Some(host) => host,
            None => return Res::new(&args.cookie, NlmStat::DeniedNoLocks),
        };
        pf_trace!(
            "cancel from {} (sysid {})",
            host.caller_name(),
            host.sysid()
        );

        self.locker.reap_finished(&host).await;
        if self.in_grace() {
            return Res::new(&args.cookie, NlmStat::DeniedGracePeriod);
        }
        if let Err(stat) = self.resolve_file(&host, &args.alock.fh).await {
            return Res::new(&args.cookie, stat);
        }

        let fl = args.alock.to_file_lock(host.sysid(), args.exclusive);
        let stat = match self.locker.cancel_matching(&host, &fl).await {
            Some(CancelOutcome::Cancelled) => NlmStat::Granted,
            Some(CancelOutcome::AlreadyCompleted) | None => NlmStat::Denied,
        };
        Res::new(&args.cookie, stat)
    }

    /// Handles an Unlock request. Local failures are not reported; the
    /// protocol has no status for them.
    pub async fn unlock(
        &self,
        args: &UnlockArgs,
        ctx: Option<&RequestCtx>,
    ) -> Res {
        let host = match self.resolve_host(&args.alock.caller_name, ctx).await
        {
            Some(host) => host,
            None => return Res::new(&args.cookie, NlmStat::DeniedNoLocks),
        };
        pf_trace!(
            "unlock from {} (sysid {})",
            host.caller_name(),
            host.sysid()
        );

        self.locker.reap_finished(&host).await;
        if self.in_grace() {
            return Res::new(&args.cookie, NlmStat::DeniedGracePeriod);
        }
        let file = match self.resolve_file(&host, &args.alock.fh).await {
            Ok(file) => file,
            Err(stat) => return Res::new(&args.cookie, stat),
        };

        let fl = args.alock.to_file_lock(host.sysid(), false);
        if let Err(e) = self.lockf.release(file, &fl) {
            pf_debug!("unlock for {} ignored: {}", host.caller_name(), e);
        }
        Res::new(&args.cookie, NlmStat::Granted)
    }

    /// Handles a FreeAll request: the peer called `args.name` restarted.
    pub async fn free_all(&self, args: &NotifyArgs) {
        pf_trace!("free_all for {}", args.name);
        for host in self.registry.hosts_named(&args.name).await {
            self.host_notify(&host, args.state, false).await;
        }
    }

    /// Handles a status monitor notification, tagged with the sysid the
    /// host was registered with.
    pub async fn sm_notify(&self, status: &SmStatus) {
        pf_trace!("sm_notify for {}", status.mon_name);
        let sysid = sysid_from_priv(&status.priv_);
        match self.registry.find_by_sysid(sysid).await {
            Some(host) => self.host_notify(&host, status.state, false).await,
            None => pf_debug!("sm_notify for unknown sysid {}", sysid),
        }
    }

    /// Reacts to a host state change: cancels its pending requests, drops
    /// every lock it holds and its cached client, and records `new_state`.
    /// With `destroy`, the host is forgotten as well.
    pub async fn host_notify(
        &self,
        host: &Arc<Host>,
        new_state: i32,
        destroy: bool,
    ) {
        if new_state != 0 {
            pf_info!(
                "host {} (sysid {}) rebooted, new state is {}",
                host.caller_name(),
                host.sysid(),
                new_state
            );
        }

        self.locker.cancel_all(host).await;
        self.locker.reap_finished(host).await;

        self.lockf.release_all(host.sysid());
        {
            let mut st = host.state.lock().await;
            st.drop_rpc();
            st.nsm_state = new_state;
        }

        if destroy {
            self.registry.remove(host).await;
        }
    }

    /// Tears down all host state and stops the granter thread.
    pub async fn shutdown(&self) {
        for host in self.registry.all().await {
            self.host_notify(&host, 0, true).await;
        }
        self.locker.shutdown();
        pf_info!("lock manager shut down");
    }

    /// Snapshots of all known hosts.
    pub async fn hosts(&self) -> Vec<HostInfo> {
        let mut infos = vec![];
        for host in self.registry.all().await {
            infos.push(host.info(self.lockf.as_ref()).await);
        }
        infos
    }
}

// LockManager request preamble helpers
impl LockManager {
    async fn resolve_host(
        &self,
        name: &str,
        ctx: Option<&RequestCtx>,
    ) -> Option<Arc<Host>> {
        match self.registry.find_or_create_by_name(name, ctx).await {
            Ok(host) => Some(host),
            Err(e) => {
                pf_warn!("cannot resolve host: {}", e);
                None
            }
        }
    }

    async fn resolve_file(
        &self,
        host: &Host,
        fh: &[u8],
    ) -> Result<FileRef, NlmStat> {
        let addr = host.state.lock().await.addr;
        self.exports.resolve(addr, fh).map_err(|e| {
            pf_debug!("fh of {} not resolved: {}", host.caller_name(), e);
            e.to_stat()
        })
    }
}
