//! Tracking of blocking lock requests and delivery of their grants.
//!
//! A request goes onto its host's pending list before it is handed to the
//! lock primitive, so a grant callback can never run ahead of the
//! bookkeeping. Grant callbacks only enqueue an event; the granter task
//! hands each event to its own task, which sends the notification and moves
//! the request to the finished list, then marks it settled. Cancellation
//! that loses the race against a grant waits for that mark before
//! returning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::host::{
    AsyncLock, AsyncLockId, GrantClient, GrantedMsg, Host, HostState,
    RpcConnector,
};
use crate::lockf::{
    AsyncAcquire, CancelOutcome, FileLock, FileRef, GrantCallback, LockError,
    LockPrimitive,
};
use crate::server::GrantedArgs;
use crate::utils::NlmError;

use tokio::sync::{mpsc, watch, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Immediate outcome of submitting a blocking lock request.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Submitted {
    /// Granted right away, nothing tracked.
    Granted,

    /// Queued; a grant notification follows later.
    Pending(AsyncLockId),

    /// An identical request is already pending for the host.
    Duplicate,
}

/// Grant completion handed from a lock primitive callback to the granter.
struct GrantEvent {
    host: Arc<Host>,
    id: AsyncLockId,
    settled: Arc<watch::Sender<bool>>,
}

/// The async lock tracker.
pub struct AsyncLocker {
    /// Lock primitive requests get submitted to.
    lockf: Arc<dyn LockPrimitive>,

    /// Connector for (re)creating hosts' outbound clients.
    connector: Arc<dyn RpcConnector>,

    /// Lifetime of a cached outbound client.
    rpc_stale: Duration,

    /// Next request ID; doubles as the primitive's cancel token.
    next_id: AtomicU64,

    /// Sender side of the grant events channel, cloned into callbacks.
    tx_grant: mpsc::UnboundedSender<GrantEvent>,

    /// Join handle of the granter thread.
    granter_handle: JoinHandle<()>,
}

// AsyncLocker public API implementation
impl AsyncLocker {
    /// Creates the tracker and spawns its granter thread.
    pub fn new_and_setup(
        lockf: Arc<dyn LockPrimitive>,
        connector: Arc<dyn RpcConnector>,
        rpc_stale: Duration,
    ) -> Self {
        let (tx_grant, rx_grant) = mpsc::unbounded_channel();
        let granter_handle = tokio::spawn(Self::granter_thread(
            rx_grant,
            connector.clone(),
            rpc_stale,
        ));

        AsyncLocker {
            lockf,
            connector,
            rpc_stale,
            next_id: AtomicU64::new(1),
            tx_grant,
            granter_handle,
        }
    }

    /// Returns a usable client to the host's NLM, checking that grant
    /// notifications can be delivered at all.
    pub async fn host_rpc(
        &self,
        host: &Host,
    ) -> Result<Arc<dyn GrantClient>, NlmError> {
        let mut st = host.state.lock().await;
        st.get_rpc(self.connector.as_ref(), self.rpc_stale).await
    }

    /// Submits a blocking lock request for the host. Identical
    /// (range, pid, type) requests already pending are not resubmitted.
    pub async fn submit(
        &self,
        host: &Arc<Host>,
        file: FileRef,
        lock: FileLock,
        granted: GrantedArgs,
    ) -> Result<Submitted, LockError> {
        let mut st = host.state.lock().await;
        if st.pending.values().any(|af| af.lock.same_request(&lock)) {
            pf_debug!(
                "duplicate async lock {} pid {} for {}",
                lock.range,
                lock.pid,
                host.caller_name()
            );
            return Ok(Submitted::Duplicate);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let settled = Arc::new(watch::channel(false).0);
        st.pending.insert(
            id,
            AsyncLock {
                file,
                lock,
                granted,
                settled: settled.clone(),
            },
        );

        // host lock stays held until the primitive has the request, so a
        // concurrent cancel always finds it there
        let on_grant = self.grant_callback(host.clone(), id, settled);
        match self.lockf.acquire_async(file, &lock, id, on_grant) {
            Ok(AsyncAcquire::Pending) => {
                pf_debug!(
                    "pending async lock {} for {} (sysid {})",
                    id,
                    host.caller_name(),
                    host.sysid()
                );
                Ok(Submitted::Pending(id))
            }
            Ok(AsyncAcquire::Granted) => {
                st.pending.remove(&id);
                Ok(Submitted::Granted)
            }
            Err(e) => {
                st.pending.remove(&id);
                Err(e)
            }
        }
    }

    /// Cancels the pending request matching `lock` by range, pid and type.
    /// Returns `None` if no such request is pending.
    pub async fn cancel_matching(
        &self,
        host: &Host,
        lock: &FileLock,
    ) -> Option<CancelOutcome> {
        let st = host.state.lock().await;
        let id = st
            .pending
            .iter()
            .find(|(_, af)| af.lock.same_request(lock))
            .map(|(&id, _)| id)?;
        Some(self.cancel_locked(host, st, id).await)
    }

    /// Cancels the pending request `id`.
    pub async fn cancel(&self, host: &Host, id: AsyncLockId) -> CancelOutcome {
        let st = host.state.lock().await;
        self.cancel_locked(host, st, id).await
    }

    /// Cancels every pending request of the host, one at a time, until the
    /// pending list is empty.
    pub async fn cancel_all(&self, host: &Host) {
        loop {
            let st = host.state.lock().await;
            let id = match st.pending.keys().next() {
                Some(&id) => id,
                None => break,
            };
            self.cancel_locked(host, st, id).await;
        }
    }

    /// Frees every finished request of the host. Returns how many.
    pub async fn reap_finished(&self, host: &Host) -> usize {
        let mut st = host.state.lock().await;
        let num = st.finished.len();
        st.finished.clear();
        num
    }

    /// Stops the granter thread.
    pub fn shutdown(&self) {
        self.granter_handle.abort();
    }
}

// AsyncLocker granter thread implementation
impl AsyncLocker {
    /// Builds the primitive's grant callback for request `id`. It only
    /// enqueues an event; if the granter is gone the request is settled on
    /// the spot so no canceller waits forever.
    fn grant_callback(
        &self,
        host: Arc<Host>,
        id: AsyncLockId,
        settled: Arc<watch::Sender<bool>>,
    ) -> GrantCallback {
        let tx_grant = self.tx_grant.clone();
        Box::new(move || {
            let event = GrantEvent { host, id, settled };
            if let Err(e) = tx_grant.send(event) {
                e.0.settled.send_replace(true);
            }
        })
    }

    /// Cancels pending request `id` with the host lock held. If the grant
    /// already fired, releases the lock and waits for the granter to settle
    /// the request.
    async fn cancel_locked(
        &self,
        host: &Host,
        mut st: MutexGuard<'_, HostState>,
        id: AsyncLockId,
    ) -> CancelOutcome {
        let (file, settled) = match st.pending.get(&id) {
            Some(af) => (af.file, af.settled.clone()),
            None => return CancelOutcome::AlreadyCompleted,
        };

        match self.lockf.cancel(file, id) {
            CancelOutcome::Cancelled => {
                st.pending.remove(&id);
                pf_debug!(
                    "async lock {} for {} (sysid {}) cancelled",
                    id,
                    host.caller_name(),
                    host.sysid()
                );
                CancelOutcome::Cancelled
            }

            CancelOutcome::AlreadyCompleted => {
                drop(st);
                let mut rx_settled = settled.subscribe();
                let _ = rx_settled.wait_for(|done| *done).await;

                // normally the granter moved it already
                let mut st = host.state.lock().await;
                if let Some(af) = st.pending.remove(&id) {
                    st.finished.insert(id, af);
                }
                CancelOutcome::AlreadyCompleted
            }
        }
    }

    /// Sends the grant notification of request `id`, then moves it from
    /// pending to finished.
    async fn on_granted(
        host: &Host,
        id: AsyncLockId,
        connector: &dyn RpcConnector,
        rpc_stale: Duration,
    ) {
        pf_debug!(
            "async lock {} for {} (sysid {}) granted",
            id,
            host.caller_name(),
            host.sysid()
        );

        let prepared = {
            let mut st = host.state.lock().await;
            let msg = st
                .pending
                .get(&id)
                .map(|af| GrantedMsg::for_version(st.vers, &af.granted));
            match msg {
                Some(msg) => {
                    Some((msg, st.get_rpc(connector, rpc_stale).await))
                }
                None => None,
            }
        };

        match prepared {
            Some((msg, Ok(client))) => {
                if let Err(e) = client.send_granted(&msg).await {
                    pf_warn!(
                        "error sending grant to {}: {}",
                        host.caller_name(),
                        e
                    );
                }
            }
            Some((_, Err(e))) => {
                pf_warn!("no rpc client for {}: {}", host.caller_name(), e);
            }
            None => {
                pf_warn!("granted async lock {} not pending", id);
            }
        }

        let mut st = host.state.lock().await;
        if let Some(af) = st.pending.remove(&id) {
            st.finished.insert(id, af);
        }
    }

    /// Granter thread function.
    async fn granter_thread(
        mut rx_grant: mpsc::UnboundedReceiver<GrantEvent>,
        connector: Arc<dyn RpcConnector>,
        rpc_stale: Duration,
    ) {
        pf_debug!("granter thread spawned");

        while let Some(GrantEvent { host, id, settled }) = rx_grant.recv().await
        {
            // a slow peer must not hold up grants to other hosts
            let connector = connector.clone();
            tokio::spawn(async move {
                Self::on_granted(&host, id, connector.as_ref(), rpc_stale)
                    .await;
                settled.send_replace(true);
            });
        }

        pf_debug!("granter thread exited");
    }
}

impl Drop for AsyncLocker {
    fn drop(&mut self) {
        self.granter_handle.abort();
    }
}

#[cfg(test)]
mod asynclock_tests {
    use super::*;
    use std::net::SocketAddr;
    use crate::host::NLM_VERS4;
    use crate::lockf::{LockKind, LockRange, MemLockTable, Sysid};
    use crate::server::NlmLock;
    use crate::testkit::MockConnector;
    use tokio::time::{self, Instant};

    const F: FileRef = FileRef(7);

    fn fl(sysid: Sysid, pid: u32, offset: u64, len: u64) -> FileLock {
        FileLock {
            range: LockRange::new(offset, len),
            pid,
            sysid,
            kind: LockKind::Exclusive,
        }
    }

    fn granted_for(lock: &FileLock) -> GrantedArgs {
        GrantedArgs {
            cookie: lock.pid.to_be_bytes().to_vec(),
            exclusive: true,
            alock: NlmLock {
                caller_name: "alice".into(),
                fh: vec![7],
                oh: vec![],
                svid: lock.pid,
                l_offset: lock.range.offset,
                l_len: lock.range.len,
            },
        }
    }

    async fn setup(
    ) -> (Arc<MemLockTable>, Arc<MockConnector>, AsyncLocker, Arc<Host>) {
        let lockf = Arc::new(MemLockTable::new());
        let connector = Arc::new(MockConnector::new());
        let locker = AsyncLocker::new_and_setup(
            lockf.clone(),
            connector.clone(),
            Duration::from_secs(120),
        );
        let host = Arc::new(Host::new("alice", 2, Instant::now()));
        {
            let mut st = host.state.lock().await;
            st.addr = "10.0.0.2:800".parse().ok();
            st.vers = NLM_VERS4;
        }
        (lockf, connector, locker, host)
    }

    async fn wait_finished(host: &Host, num: usize) {
        for _ in 0..500 {
            if host.state.lock().await.finished.len() >= num {
                return;
            }
            time::sleep(Duration::from_millis(2)).await;
        }
        panic!("grant not settled in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn grant_delivered_once() -> Result<(), NlmError> {
        let (lockf, connector, locker, host) = setup().await;
        lockf.acquire_sync(F, &fl(1, 1, 0, 100)).unwrap();

        let lock = fl(2, 5, 10, 10);
        let submitted =
            locker.submit(&host, F, lock, granted_for(&lock)).await.unwrap();
        assert!(matches!(submitted, Submitted::Pending(_)));
        assert_eq!(host.state.lock().await.pending.len(), 1);

        lockf.release_all(1);
        wait_finished(&host, 1).await;
        assert!(host.state.lock().await.pending.is_empty());
        assert_eq!(connector.sent().len(), 1);
        assert_eq!(connector.sent()[0].1.cookie(), &vec![0, 0, 0, 5]);
        assert_eq!(lockf.count_held(2), 1);

        assert_eq!(locker.reap_finished(&host).await, 1);
        assert_eq!(locker.reap_finished(&host).await, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_not_resubmitted() {
        let (lockf, _, locker, host) = setup().await;
        lockf.acquire_sync(F, &fl(1, 1, 0, 0)).unwrap();

        let lock = fl(2, 5, 0, 10);
        let first =
            locker.submit(&host, F, lock, granted_for(&lock)).await.unwrap();
        let again =
            locker.submit(&host, F, lock, granted_for(&lock)).await.unwrap();
        assert!(matches!(first, Submitted::Pending(_)));
        assert_eq!(again, Submitted::Duplicate);
        assert_eq!(host.state.lock().await.pending.len(), 1);
        assert_eq!(lockf.num_waiting(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn immediate_grant_untracked() {
        let (lockf, connector, locker, host) = setup().await;
        let lock = fl(2, 5, 0, 10);
        let submitted =
            locker.submit(&host, F, lock, granted_for(&lock)).await.unwrap();
        assert_eq!(submitted, Submitted::Granted);
        let st = host.state.lock().await;
        assert!(st.pending.is_empty() && st.finished.is_empty());
        assert!(connector.sent().is_empty());
        assert_eq!(lockf.count_held(2), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_pending_request() {
        let (lockf, connector, locker, host) = setup().await;
        lockf.acquire_sync(F, &fl(1, 1, 0, 0)).unwrap();

        let lock = fl(2, 5, 0, 10);
        locker.submit(&host, F, lock, granted_for(&lock)).await.unwrap();
        assert_eq!(
            locker.cancel_matching(&host, &fl(2, 6, 0, 10)).await,
            None
        );
        assert_eq!(
            locker.cancel_matching(&host, &lock).await,
            Some(CancelOutcome::Cancelled)
        );
        assert!(host.state.lock().await.pending.is_empty());

        lockf.release_all(1);
        time::sleep(Duration::from_millis(20)).await;
        assert!(connector.sent().is_empty());
        assert_eq!(lockf.count_held(2), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_after_grant_waits() {
        let (lockf, connector, locker, host) = setup().await;
        lockf.acquire_sync(F, &fl(1, 1, 0, 0)).unwrap();

        let lock = fl(2, 5, 0, 10);
        let id = match locker.submit(&host, F, lock, granted_for(&lock)).await
        {
            Ok(Submitted::Pending(id)) => id,
            other => panic!("unexpected submit result {:?}", other),
        };
        lockf.release_all(1);

        // regardless of timing the grant has settled once cancel returns
        let outcome = locker.cancel(&host, id).await;
        assert_eq!(outcome, CancelOutcome::AlreadyCompleted);
        let st = host.state.lock().await;
        assert!(st.pending.is_empty());
        assert_eq!(st.finished.len(), 1);
        assert_eq!(connector.sent().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_grant_race_exactly_once() {
        for round in 0..50u32 {
            let (lockf, connector, locker, host) = setup().await;
            lockf.acquire_sync(F, &fl(1, 1, 0, 0)).unwrap();

            let lock = fl(2, round, 0, 10);
            let id = match locker
                .submit(&host, F, lock, granted_for(&lock))
                .await
            {
                Ok(Submitted::Pending(id)) => id,
                other => panic!("unexpected submit result {:?}", other),
            };

            let releaser = {
                let lockf = lockf.clone();
                tokio::spawn(async move { lockf.release_all(1) })
            };
            let outcome = locker.cancel(&host, id).await;
            releaser.await.unwrap();
            time::sleep(Duration::from_millis(5)).await;

            let sent = connector.sent().len();
            match outcome {
                CancelOutcome::Cancelled => {
                    assert_eq!(sent, 0);
                    assert_eq!(lockf.count_held(2), 0);
                }
                CancelOutcome::AlreadyCompleted => {
                    assert_eq!(sent, 1);
                    assert_eq!(lockf.count_held(2), 1);
                }
            }
            let st = host.state.lock().await;
            assert!(st.pending.is_empty());
            assert!(st.finished.len() <= 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_all_drains() {
        let (lockf, connector, locker, host) = setup().await;
        lockf.acquire_sync(F, &fl(1, 1, 0, 0)).unwrap();
        for pid in 0..3 {
            let lock = fl(2, pid, pid as u64 * 10, 10);
            locker.submit(&host, F, lock, granted_for(&lock)).await.unwrap();
        }
        assert_eq!(lockf.num_waiting(), 3);

        locker.cancel_all(&host).await;
        assert!(host.state.lock().await.pending.is_empty());
        assert_eq!(lockf.num_waiting(), 0);
        lockf.release_all(1);
        time::sleep(Duration::from_millis(20)).await;
        assert!(connector.sent().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_peer_does_not_delay_others() {
        let (lockf, connector, locker, alice) = setup().await;
        let bob = Arc::new(Host::new("bob", 3, Instant::now()));
        {
            let mut st = bob.state.lock().await;
            st.addr = "10.0.0.3:800".parse().ok();
            st.vers = NLM_VERS4;
        }
        lockf.acquire_sync(F, &fl(1, 1, 0, 0)).unwrap();
        lockf.acquire_sync(FileRef(8), &fl(1, 1, 0, 0)).unwrap();

        let lock = fl(2, 5, 0, 10);
        locker.submit(&alice, F, lock, granted_for(&lock)).await.unwrap();
        let lock = fl(3, 6, 0, 10);
        locker
            .submit(&bob, FileRef(8), lock, granted_for(&lock))
            .await
            .unwrap();

        connector.set_stalled("10.0.0.2".parse().ok());
        lockf.release_all(1);
        wait_finished(&bob, 1).await;
        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        let bob_nlm: SocketAddr = "10.0.0.3:4045".parse().unwrap();
        assert_eq!(sent[0].0, bob_nlm);
        assert_eq!(lockf.count_held(2), 1);
        assert_eq!(lockf.count_held(3), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn grant_without_client_still_settles() {
        let (lockf, connector, locker, host) = setup().await;
        lockf.acquire_sync(F, &fl(1, 1, 0, 0)).unwrap();
        let lock = fl(2, 5, 0, 10);
        locker.submit(&host, F, lock, granted_for(&lock)).await.unwrap();

        connector.set_unreachable(true);
        lockf.release_all(1);
        wait_finished(&host, 1).await;
        assert!(connector.sent().is_empty());
    }
}
