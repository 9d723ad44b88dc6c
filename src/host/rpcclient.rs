//! Outbound RPC clients used to deliver grant notifications to peers.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::host::{CachedClient, HostState, NLM_PROG, NLM_VERS4};
use crate::server::{Cookie, GrantedArgs};
use crate::utils::{read_frame, write_frame, NlmError};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{self, Duration, Instant};

/// Lock descriptor of the pre-v4 protocols, with 32-bit offsets.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LegacyLock {
    pub caller_name: String,
    pub fh: Vec<u8>,
    pub oh: Vec<u8>,
    pub svid: u32,
    pub l_offset: u32,
    pub l_len: u32,
}

/// Grant notification of the pre-v4 protocols.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LegacyGrantedArgs {
    pub cookie: Cookie,
    pub exclusive: bool,
    pub alock: LegacyLock,
}

/// Grant notification in the form the receiving host understands.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum GrantedMsg {
    /// NLM version 4 `GRANTED_MSG`.
    Granted4(GrantedArgs),

    /// Legacy `GRANTED_MSG`.
    Granted1(LegacyGrantedArgs),
}

impl GrantedMsg {
    /// Builds the notification for a host speaking protocol `vers`,
    /// back-converting to the legacy form unless it is version 4. Offsets
    /// beyond 32 bits saturate.
    pub fn for_version(vers: u32, granted: &GrantedArgs) -> Self {
        if vers == NLM_VERS4 {
            return GrantedMsg::Granted4(granted.clone());
        }

        let narrow = |v: u64| u32::try_from(v).unwrap_or(u32::MAX);
        GrantedMsg::Granted1(LegacyGrantedArgs {
            cookie: granted.cookie.clone(),
            exclusive: granted.exclusive,
            alock: LegacyLock {
                caller_name: granted.alock.caller_name.clone(),
                fh: granted.alock.fh.clone(),
                oh: granted.alock.oh.clone(),
                svid: granted.alock.svid,
                l_offset: narrow(granted.alock.l_offset),
                l_len: narrow(granted.alock.l_len),
            },
        })
    }

    pub fn cookie(&self) -> &Cookie {
        match self {
            GrantedMsg::Granted4(args) => &args.cookie,
            GrantedMsg::Granted1(args) => &args.cookie,
        }
    }
}

/// Handle for sending messages to one peer's NLM.
#[async_trait]
pub trait GrantClient: Send + Sync {
    /// Sends a grant notification; no reply is expected.
    async fn send_granted(&self, msg: &GrantedMsg) -> Result<(), NlmError>;
}

/// Creates clients talking to peers' NLMs.
#[async_trait]
pub trait RpcConnector: Send + Sync {
    /// Asks the port mapper on `peer` where program `prog` version `vers`
    /// listens.
    async fn lookup(
        &self,
        peer: SocketAddr,
        prog: u32,
        vers: u32,
    ) -> Result<SocketAddr, NlmError>;

    /// Builds a client for the NLM at `endpoint`.
    async fn connect(
        &self,
        endpoint: SocketAddr,
        vers: u32,
    ) -> Result<Arc<dyn GrantClient>, NlmError>;
}

// HostState outbound client cache implementation
impl HostState {
    /// Returns the cached client to this host's NLM, creating it if absent
    /// or older than `stale`. Peers may change ports silently, so cached
    /// clients are never trusted for long.
    pub(crate) async fn get_rpc(
        &mut self,
        connector: &dyn RpcConnector,
        stale: Duration,
    ) -> Result<Arc<dyn GrantClient>, NlmError> {
        let now = Instant::now();
        if self
            .rpc
            .as_ref()
            .is_some_and(|cached| now > cached.created + stale)
        {
            pf_debug!("dropping stale rpc client to {:?}", self.addr);
            self.rpc = None;
        }

        if let Some(cached) = &self.rpc {
            return Ok(cached.client.clone());
        }

        let addr = match self.addr {
            Some(addr) => addr,
            None => return logged_err!("host address never seen"),
        };
        let endpoint = connector.lookup(addr, NLM_PROG, self.vers).await?;
        let client = connector.connect(endpoint, self.vers).await?;
        pf_debug!("created rpc client to {} vers {}", endpoint, self.vers);

        self.rpc = Some(CachedClient {
            client: client.clone(),
            created: now,
        });
        Ok(client)
    }

    /// Forgets the cached client, if any.
    #[inline]
    pub(crate) fn drop_rpc(&mut self) {
        self.rpc = None;
    }
}

/// Port mapper `GETPORT` query.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PortmapRequest {
    pub prog: u32,
    pub vers: u32,
}

/// Port mapper answer; port 0 means not registered.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PortmapReply {
    pub port: u16,
}

/// Well-known port mapper port.
pub const PORTMAP_PORT: u16 = 111;

/// Connector speaking length-prefixed frames over TCP.
pub struct TcpRpcConnector {
    portmap_port: u16,
    timeout: Duration,
}

impl TcpRpcConnector {
    pub fn new(portmap_port: u16, timeout: Duration) -> Self {
        TcpRpcConnector {
            portmap_port,
            timeout,
        }
    }
}

impl Default for TcpRpcConnector {
    fn default() -> Self {
        Self::new(PORTMAP_PORT, Duration::from_secs(25))
    }
}

#[async_trait]
impl RpcConnector for TcpRpcConnector {
    async fn lookup(
        &self,
        peer: SocketAddr,
        prog: u32,
        vers: u32,
    ) -> Result<SocketAddr, NlmError> {
        let portmap = SocketAddr::new(peer.ip(), self.portmap_port);
        let reply: PortmapReply = time::timeout(self.timeout, async {
            let mut conn = TcpStream::connect(portmap).await?;
            write_frame(&PortmapRequest { prog, vers }, &mut conn).await?;
            read_frame(&mut conn).await
        })
        .await??;

        if reply.port == 0 {
            return logged_err!(
                "program {} vers {} not registered at {}",
                prog,
                vers,
                portmap
            );
        }
        Ok(SocketAddr::new(peer.ip(), reply.port))
    }

    async fn connect(
        &self,
        endpoint: SocketAddr,
        vers: u32,
    ) -> Result<Arc<dyn GrantClient>, NlmError> {
        let conn =
            time::timeout(self.timeout, TcpStream::connect(endpoint)).await??;
        conn.set_nodelay(true)?;
        Ok(Arc::new(TcpGrantClient {
            conn: Mutex::new(conn),
            vers,
        }))
    }
}

/// Grant client over one TCP connection.
struct TcpGrantClient {
    conn: Mutex<TcpStream>,
    vers: u32,
}

#[async_trait]
impl GrantClient for TcpGrantClient {
    async fn send_granted(&self, msg: &GrantedMsg) -> Result<(), NlmError> {
        pf_trace!("sending grant vers {} cookie {:?}", self.vers, msg.cookie());
        let mut conn = self.conn.lock().await;
        write_frame(msg, &mut *conn).await
    }
}

#[cfg(test)]
mod rpcclient_tests {
    use super::*;
    use crate::host::Host;
    use crate::server::NlmLock;
    use crate::testkit::MockConnector;
    use tokio::net::TcpListener;

    fn granted_args(l_offset: u64, l_len: u64) -> GrantedArgs {
        GrantedArgs {
            cookie: vec![1, 2],
            exclusive: true,
            alock: NlmLock {
                caller_name: "alice".into(),
                fh: vec![0xf],
                oh: vec![0xa],
                svid: 5,
                l_offset,
                l_len,
            },
        }
    }

    #[test]
    fn legacy_back_conversion() {
        let args = granted_args(1 << 40, 10);
        assert_eq!(
            GrantedMsg::for_version(NLM_VERS4, &args),
            GrantedMsg::Granted4(args.clone())
        );
        match GrantedMsg::for_version(1, &args) {
            GrantedMsg::Granted1(legacy) => {
                assert_eq!(legacy.cookie, vec![1, 2]);
                assert_eq!(legacy.alock.caller_name, "alice");
                assert_eq!(legacy.alock.svid, 5);
                assert_eq!(legacy.alock.l_offset, u32::MAX);
                assert_eq!(legacy.alock.l_len, 10);
            }
            msg => panic!("unexpected message {:?}", msg),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_cache_and_staleness() -> Result<(), NlmError> {
        let connector = MockConnector::new();
        let host = Host::new("alice", 1, Instant::now());
        let mut st = host.state.lock().await;
        let stale = Duration::from_secs(120);

        // no address known yet
        assert!(st.get_rpc(&connector, stale).await.is_err());

        st.addr = Some("10.0.0.1:900".parse::<SocketAddr>()?);
        st.vers = NLM_VERS4;
        st.get_rpc(&connector, stale).await?;
        st.get_rpc(&connector, stale).await?;
        assert_eq!(connector.num_connects(), 1);

        // exactly at the staleness window still counts as fresh
        time::advance(stale).await;
        st.get_rpc(&connector, stale).await?;
        assert_eq!(connector.num_connects(), 1);

        time::advance(Duration::from_secs(1)).await;
        st.get_rpc(&connector, stale).await?;
        assert_eq!(connector.num_connects(), 2);

        st.drop_rpc();
        connector.set_unreachable(true);
        assert!(st.get_rpc(&connector, stale).await.is_err());
        assert!(st.rpc.is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_lookup_and_grant() -> Result<(), NlmError> {
        let nlm = TcpListener::bind("127.0.0.1:0").await?;
        let nlm_port = nlm.local_addr()?.port();
        let portmap = TcpListener::bind("127.0.0.1:0").await?;
        let portmap_port = portmap.local_addr()?.port();

        tokio::spawn(async move {
            let (mut conn, _) = portmap.accept().await?;
            let req: PortmapRequest = read_frame(&mut conn).await?;
            let port = if req.prog == NLM_PROG { nlm_port } else { 0 };
            write_frame(&PortmapReply { port }, &mut conn).await?;
            Ok::<(), NlmError>(())
        });
        let receiver = tokio::spawn(async move {
            let (mut conn, _) = nlm.accept().await?;
            let msg: GrantedMsg = read_frame(&mut conn).await?;
            Ok::<GrantedMsg, NlmError>(msg)
        });

        let connector =
            TcpRpcConnector::new(portmap_port, Duration::from_secs(5));
        let peer: SocketAddr = "127.0.0.1:700".parse()?;
        let endpoint = connector.lookup(peer, NLM_PROG, NLM_VERS4).await?;
        assert_eq!(endpoint, SocketAddr::new(peer.ip(), nlm_port));

        let client = connector.connect(endpoint, NLM_VERS4).await?;
        let msg = GrantedMsg::for_version(NLM_VERS4, &granted_args(0, 100));
        client.send_granted(&msg).await?;
        let got = receiver
            .await
            .map_err(|e| NlmError::msg(e.to_string()))??;
        assert_eq!(got, msg);
        Ok(())
    }
}
