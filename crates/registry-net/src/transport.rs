//! TCP gossip transport
//!
//! Every exchange is a short-lived connection that opens with a `Hello`
//! frame. Broadcasts are pushed to a random fan-out of known members on
//! each gossip tick; full state (and the member list) is exchanged with
//! one random member per push/pull tick and with every seed on join.

use crate::crypto::SecretKey;
use crate::delegate::Delegate;
use crate::framing::{Frame, FrameCodec, FrameError, FrameType, FRAME_OVERHEAD};
use crate::peer::{Hello, Member, NodeName};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Consecutive send failures before a member is dropped
pub const MAX_SEND_FAILURES: u32 = 3;

/// Byte budget for broadcasts pulled per gossip round
pub const MAX_GOSSIP_BYTES: usize = 64 * 1024;

/// Limit passed to [`Delegate::node_meta`]
pub const META_MAX_SIZE: usize = 512;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Timed out")]
    Timeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Unexpected frame: {0:?}")]
    UnexpectedFrame(FrameType),
    #[error("Failed to join any of {0} seed(s)")]
    JoinFailed(usize),
}

/// Network profile selecting gossip timing defaults
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// Loopback or single host
    Local,
    /// Low-latency local network
    Lan,
    /// Internet-scale latency
    #[default]
    Wan,
}

/// Transport configuration
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub name: NodeName,
    pub bind_addr: SocketAddr,
    /// Address announced to peers; port 0 means the bound port
    pub advertise_addr: Option<SocketAddr>,
    pub gossip_interval: Duration,
    /// Members contacted per gossip round
    pub gossip_nodes: usize,
    pub push_pull_interval: Duration,
    pub io_timeout: Duration,
    pub secret_key: Option<SecretKey>,
}

impl TransportConfig {
    /// Defaults for a network profile
    pub fn new(mode: NetworkMode, name: NodeName, bind_addr: SocketAddr) -> Self {
        let (gossip_ms, gossip_nodes, push_pull_secs, io_secs) = match mode {
            NetworkMode::Local => (100, 3, 15, 1),
            NetworkMode::Lan => (200, 3, 30, 10),
            NetworkMode::Wan => (500, 4, 60, 30),
        };

        Self {
            name,
            bind_addr,
            advertise_addr: None,
            gossip_interval: Duration::from_millis(gossip_ms),
            gossip_nodes,
            push_pull_interval: Duration::from_secs(push_pull_secs),
            io_timeout: Duration::from_secs(io_secs),
            secret_key: None,
        }
    }
}

/// Push/pull payload
#[derive(Debug, Serialize, Deserialize)]
struct PushPull {
    join: bool,
    members: Vec<Hello>,
    state: Vec<u8>,
}

type Connection = Framed<TcpStream, FrameCodec>;

/// Gossip transport driving a [`Delegate`]
pub struct Transport {
    config: TransportConfig,
    advertise: SocketAddr,
    delegate: Arc<dyn Delegate>,
    members: RwLock<HashMap<SocketAddr, Member>>,
    listener: Mutex<Option<TcpListener>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Transport {
    /// Bind the listener. Background loops start with [`Transport::start`].
    pub async fn bind(
        config: TransportConfig,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local = listener.local_addr()?;

        let advertise = match config.advertise_addr {
            Some(addr) if addr.port() == 0 => SocketAddr::new(addr.ip(), local.port()),
            Some(addr) => addr,
            None if local.ip().is_unspecified() => {
                warn!(
                    "Bound to {} without an advertise address; advertising loopback",
                    local
                );
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
            }
            None => local,
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            config,
            advertise,
            delegate,
            members: RwLock::new(HashMap::new()),
            listener: Mutex::new(Some(listener)),
            shutdown_tx,
        }))
    }

    /// Our node name
    pub fn name(&self) -> &NodeName {
        &self.config.name
    }

    /// Address announced to peers
    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise
    }

    /// Known members plus the local node
    pub fn num_members(&self) -> usize {
        self.members.read().len() + 1
    }

    /// Snapshot of known remote members
    pub fn members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    /// Spawn the accept, gossip and push/pull loops
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        match self.listener.lock().take() {
            Some(listener) => handles.push(tokio::spawn(self.clone().accept_loop(listener))),
            None => warn!("Transport already started"),
        }
        handles.push(tokio::spawn(self.clone().gossip_loop()));
        handles.push(tokio::spawn(self.clone().push_pull_loop()));

        info!(
            "Transport {} listening, advertising {}",
            self.config.name, self.advertise
        );
        handles
    }

    /// Push/pull with every seed. Fails only if seeds were given and none answered.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize, TransportError> {
        let mut joined = 0;
        for seed in seeds {
            match self.push_pull(*seed, true).await {
                Ok(()) => {
                    info!("Joined cluster via {}", seed);
                    joined += 1;
                }
                Err(e) => warn!("Failed to join {}: {}", seed, e),
            }
        }

        if !seeds.is_empty() && joined == 0 {
            return Err(TransportError::JoinFailed(seeds.len()));
        }
        Ok(joined)
    }

    /// Stop all background loops
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn codec(&self) -> FrameCodec {
        match &self.config.secret_key {
            Some(key) => FrameCodec::with_secret_key(key.clone()),
            None => FrameCodec::new(),
        }
    }

    fn hello(&self) -> Hello {
        Hello {
            name: self.config.name.clone(),
            addr: self.advertise,
            meta: self.delegate.node_meta(META_MAX_SIZE),
        }
    }

    fn add_member(&self, hello: Hello) {
        if hello.name == self.config.name || hello.addr == self.advertise {
            return;
        }

        let count = {
            let mut members = self.members.write();
            if let Some(member) = members.get_mut(&hello.addr) {
                member.name = hello.name;
                member.meta = hello.meta;
                member.touch();
                return;
            }
            info!("Member {} joined at {}", hello.name, hello.addr);
            members.insert(hello.addr, Member::new(hello));
            members.len() + 1
        };
        self.delegate.notify_members(count);
    }

    fn mark_alive(&self, addr: SocketAddr) {
        if let Some(member) = self.members.write().get_mut(&addr) {
            member.touch();
        }
    }

    fn mark_failed(&self, addr: SocketAddr) {
        let count = {
            let mut members = self.members.write();
            let Some(member) = members.get_mut(&addr) else {
                return;
            };
            member.failures += 1;
            if member.failures < MAX_SEND_FAILURES {
                return;
            }
            warn!(
                "Dropping member {} at {} after {} failed sends",
                member.name, addr, member.failures
            );
            members.remove(&addr);
            members.len() + 1
        };
        self.delegate.notify_members(count);
    }

    fn random_members(&self, n: usize) -> Vec<SocketAddr> {
        let addrs: Vec<SocketAddr> = self.members.read().keys().copied().collect();
        addrs
            .choose_multiple(&mut rand::thread_rng(), n)
            .copied()
            .collect()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let transport = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = transport.handle_connection(stream).await {
                                    warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.config.gossip_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.gossip().await,
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    async fn push_pull_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.config.push_pull_interval);
        // The first tick completes immediately; join covers startup
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for addr in self.random_members(1) {
                        match self.push_pull(addr, false).await {
                            Ok(()) => self.mark_alive(addr),
                            Err(e) => {
                                debug!("Push/pull with {} failed: {}", addr, e);
                                self.mark_failed(addr);
                            }
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// One gossip round
    async fn gossip(&self) {
        let targets = self.random_members(self.config.gossip_nodes);
        if targets.is_empty() {
            return;
        }

        let messages = self.delegate.broadcasts(FRAME_OVERHEAD, MAX_GOSSIP_BYTES);
        if messages.is_empty() {
            return;
        }

        let sends = targets.iter().map(|addr| self.send_broadcasts(*addr, &messages));
        let results = futures::future::join_all(sends).await;

        for (addr, result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => self.mark_alive(addr),
                Err(e) => {
                    debug!("Gossip to {} failed: {}", addr, e);
                    self.mark_failed(addr);
                }
            }
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<Connection, TransportError> {
        let stream = timeout(self.config.io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let mut conn = Framed::new(stream, self.codec());
        let hello = postcard::to_allocvec(&self.hello())?;
        conn.send(Frame::new(FrameType::Hello, hello)).await?;
        Ok(conn)
    }

    async fn recv(&self, conn: &mut Connection) -> Result<Option<Frame>, TransportError> {
        match timeout(self.config.io_timeout, conn.next()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(None) => Ok(None),
            Ok(Some(frame)) => Ok(Some(frame?)),
        }
    }

    async fn send_broadcasts(
        &self,
        addr: SocketAddr,
        messages: &[Vec<u8>],
    ) -> Result<(), TransportError> {
        let mut conn = self.connect(addr).await?;
        for message in messages {
            conn.feed(Frame::new(FrameType::Broadcast, message.clone()))
                .await?;
        }
        conn.close().await?;
        Ok(())
    }

    fn push_pull_payload(&self, join: bool) -> Result<Vec<u8>, TransportError> {
        let mut members: Vec<Hello> = self.members.read().values().map(Member::hello).collect();
        members.push(self.hello());

        let payload = PushPull {
            join,
            members,
            state: self.delegate.local_state(join),
        };
        Ok(postcard::to_allocvec(&payload)?)
    }

    fn absorb_push_pull(&self, payload: &[u8]) -> Result<bool, TransportError> {
        let remote: PushPull = postcard::from_bytes(payload)?;
        for hello in remote.members {
            self.add_member(hello);
        }
        self.delegate.merge_remote_state(&remote.state, remote.join);
        Ok(remote.join)
    }

    /// Exchange full state with one peer
    async fn push_pull(&self, addr: SocketAddr, join: bool) -> Result<(), TransportError> {
        let mut conn = self.connect(addr).await?;
        conn.send(Frame::new(
            FrameType::PushPullRequest,
            self.push_pull_payload(join)?,
        ))
        .await?;

        loop {
            let frame = self
                .recv(&mut conn)
                .await?
                .ok_or(TransportError::ConnectionClosed)?;

            match frame.frame_type {
                FrameType::Hello => self.add_member(postcard::from_bytes(&frame.payload)?),
                FrameType::PushPullResponse => {
                    self.absorb_push_pull(&frame.payload)?;
                    return Ok(());
                }
                other => return Err(TransportError::UnexpectedFrame(other)),
            }
        }
    }

    /// Serve one inbound connection until the peer closes it
    async fn handle_connection(&self, stream: TcpStream) -> Result<(), TransportError> {
        let mut conn = Framed::new(stream, self.codec());

        while let Some(frame) = self.recv(&mut conn).await? {
            match frame.frame_type {
                FrameType::Hello => self.add_member(postcard::from_bytes(&frame.payload)?),
                FrameType::Broadcast => self.delegate.notify_msg(&frame.payload),
                FrameType::PushPullRequest => {
                    // Respond with our state as it was before absorbing theirs
                    let remote: PushPull = postcard::from_bytes(&frame.payload)?;
                    let response = self.push_pull_payload(remote.join)?;
                    for hello in remote.members {
                        self.add_member(hello);
                    }
                    self.delegate.merge_remote_state(&remote.state, remote.join);

                    let hello = postcard::to_allocvec(&self.hello())?;
                    conn.feed(Frame::new(FrameType::Hello, hello)).await?;
                    conn.send(Frame::new(FrameType::PushPullResponse, response))
                        .await?;
                }
                FrameType::Ping => conn.send(Frame::pong()).await?,
                other => debug!("Ignoring unexpected {:?} frame", other),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Broadcast, BroadcastQueue};

    struct Payload(Vec<u8>);

    impl Broadcast for Payload {
        fn invalidates(&self, _other: &dyn Broadcast) -> bool {
            false
        }

        fn message(&self) -> &[u8] {
            &self.0
        }
    }

    struct Recorder {
        state: Vec<u8>,
        queue: BroadcastQueue,
        messages: Mutex<Vec<Vec<u8>>>,
        remote_states: Mutex<Vec<(Vec<u8>, bool)>>,
    }

    impl Recorder {
        fn new(state: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                state: state.to_vec(),
                queue: BroadcastQueue::new(3),
                messages: Mutex::new(Vec::new()),
                remote_states: Mutex::new(Vec::new()),
            })
        }
    }

    impl Delegate for Recorder {
        fn node_meta(&self, _limit: usize) -> Vec<u8> {
            Vec::new()
        }

        fn notify_msg(&self, msg: &[u8]) {
            self.messages.lock().push(msg.to_vec());
        }

        fn broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
            self.queue.get_broadcasts(overhead, limit)
        }

        fn local_state(&self, _join: bool) -> Vec<u8> {
            self.state.clone()
        }

        fn merge_remote_state(&self, buf: &[u8], join: bool) {
            self.remote_states.lock().push((buf.to_vec(), join));
        }

        fn notify_members(&self, num_members: usize) {
            self.queue.set_num_nodes(num_members);
        }
    }

    fn config(name: &str, key: Option<&[u8]>) -> TransportConfig {
        let mut config = TransportConfig::new(
            NetworkMode::Local,
            NodeName(name.into()),
            "127.0.0.1:0".parse().unwrap(),
        );
        config.secret_key = key.map(|k| SecretKey::new(k).unwrap());
        config
    }

    async fn node(name: &str, state: &[u8], key: Option<&[u8]>) -> (Arc<Transport>, Arc<Recorder>) {
        let recorder = Recorder::new(state);
        let transport = Transport::bind(config(name, key), recorder.clone()).await.unwrap();
        transport.start();
        (transport, recorder)
    }

    #[tokio::test]
    async fn test_join_exchanges_state() {
        let (a, a_rec) = node("a", b"alpha", None).await;
        let (b, b_rec) = node("b", b"beta", None).await;

        let joined = b.join(&[a.advertise_addr()]).await.unwrap();
        assert_eq!(joined, 1);

        assert_eq!(*a_rec.remote_states.lock(), vec![(b"beta".to_vec(), true)]);
        assert_eq!(*b_rec.remote_states.lock(), vec![(b"alpha".to_vec(), true)]);
        assert_eq!(a.num_members(), 2);
        assert_eq!(b.num_members(), 2);
        assert_eq!(b_rec.queue.num_nodes(), 2);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_members_spread_through_push_pull() {
        let (a, _) = node("a", b"", None).await;
        let (b, _) = node("b", b"", None).await;
        let (c, _) = node("c", b"", None).await;

        b.join(&[a.advertise_addr()]).await.unwrap();
        c.join(&[a.advertise_addr()]).await.unwrap();

        // c learned b from a's member list
        assert_eq!(c.num_members(), 3);

        for t in [a, b, c] {
            t.shutdown();
        }
    }

    #[tokio::test]
    async fn test_broadcast_delivered() {
        let (a, a_rec) = node("a", b"", None).await;
        let (b, b_rec) = node("b", b"", None).await;
        b.join(&[a.advertise_addr()]).await.unwrap();

        b_rec.queue.queue(Box::new(Payload(b"change".to_vec())));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while a_rec.messages.lock().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "broadcast not delivered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(a_rec.messages.lock()[0], b"change".to_vec());

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_sealed_cluster() {
        let (a, a_rec) = node("a", b"alpha", Some(b"0123456789abcdef")).await;
        let (b, _) = node("b", b"beta", Some(b"0123456789abcdef")).await;
        let (c, _) = node("c", b"gamma", Some(b"fedcba9876543210")).await;

        assert_eq!(b.join(&[a.advertise_addr()]).await.unwrap(), 1);
        assert!(matches!(
            c.join(&[a.advertise_addr()]).await,
            Err(TransportError::JoinFailed(1))
        ));
        assert_eq!(a_rec.remote_states.lock().len(), 1);

        for t in [a, b, c] {
            t.shutdown();
        }
    }

    #[tokio::test]
    async fn test_join_unreachable_seed_fails() {
        let unused = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (t, _) = node("lonely", b"", None).await;

        assert!(matches!(
            t.join(&[unused]).await,
            Err(TransportError::JoinFailed(1))
        ));
        assert_eq!(t.join(&[]).await.unwrap(), 0);
        t.shutdown();
    }
}
