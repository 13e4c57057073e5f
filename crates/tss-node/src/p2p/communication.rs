//! Overlay transport
//!
//! Every conversation between nodes is one short-lived TCP stream: the
//! dialer writes a hello frame naming the protocol, its public key, its
//! advertised listen port, and the network rendezvous string, then the
//! protocol payload. The listener attributes the stream to the peer id
//! derived from the hello's key and dispatches by protocol:
//!
//! - round traffic is demultiplexed to the session subscribed under
//!   `(message type, message id)`;
//! - join-party streams are parked with the coordinator, which answers on
//!   the same stream;
//! - signature notifications go to the notifier;
//! - discovery greetings are answered with our address book.
//!
//! Peer addresses are learned from the bootstrap list, from discovery
//! replies, and from the hellos of inbound streams.

use super::address::NetAddress;
use super::framing::{read_length_prefixed, write_length_prefixed};
use crate::{NodeError, Result};
use dashmap::DashMap;
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tss_core::messages::{
    BroadcastBundle, JoinPartyRequest, MessageType, P2pMessage, WrappedMessage,
};
use tss_core::PeerId;

/// Capacity of the outbound broadcast channel; a full channel blocks the
/// producing session rather than dropping traffic.
const BROADCAST_CHANNEL_SIZE: usize = 1024;
/// How long we wait for a TCP connect
const TIMEOUT_CONNECTING: Duration = Duration::from_secs(10);
/// Cadence of bootstrap discovery greetings
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(2);

/// The sub-protocols multiplexed over the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Protocol {
    /// Session round traffic
    Rounds,
    /// Join-party coordination
    JoinParty,
    /// Keysign signature notification
    SignatureNotifier,
    /// Address-book exchange
    Discovery,
}

impl From<Protocol> for u8 {
    fn from(p: Protocol) -> u8 {
        match p {
            Protocol::Rounds => 1,
            Protocol::JoinParty => 2,
            Protocol::SignatureNotifier => 3,
            Protocol::Discovery => 4,
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, String> {
        match v {
            1 => Ok(Protocol::Rounds),
            2 => Ok(Protocol::JoinParty),
            3 => Ok(Protocol::SignatureNotifier),
            4 => Ok(Protocol::Discovery),
            other => Err(format!("unknown protocol {other}")),
        }
    }
}

/// First frame of every stream
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    protocol: Protocol,
    /// Compressed secp256k1 public key, hex
    pub_key: String,
    /// Port the dialer's own listener is reachable on
    listen_port: u16,
    rendezvous: String,
}

/// A join-party request parked with its stream; the coordinator replies on
/// the stream when the ceremony resolves.
pub struct InboundJoinParty {
    pub peer: PeerId,
    pub request: JoinPartyRequest,
    pub stream: TcpStream,
}

/// A signature-notifier payload attributed to its sender
pub struct InboundNotification {
    pub peer: PeerId,
    pub payload: Vec<u8>,
}

/// The shared overlay host
pub struct Communication {
    local_key: SigningKey,
    local_peer: PeerId,
    rendezvous: String,
    external_ip: Option<String>,
    listen_port: RwLock<u16>,

    peers: RwLock<HashMap<PeerId, SocketAddr>>,
    bootstrap: Vec<NetAddress>,

    subscribers: DashMap<(MessageType, String), mpsc::Sender<P2pMessage>>,
    broadcast_tx: mpsc::Sender<BroadcastBundle>,
    broadcast_rx: Mutex<Option<mpsc::Receiver<BroadcastBundle>>>,

    join_party_tx: Mutex<Option<mpsc::Sender<InboundJoinParty>>>,
    notifier_tx: Mutex<Option<mpsc::Sender<InboundNotification>>>,

    stop_tx: watch::Sender<bool>,
}

impl Communication {
    pub fn new(
        rendezvous: impl Into<String>,
        bootstrap: Vec<NetAddress>,
        port: u16,
        external_ip: Option<String>,
        local_key: SigningKey,
    ) -> Arc<Self> {
        let local_peer = PeerId::from_verifying_key(local_key.verifying_key());
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_CHANNEL_SIZE);
        let (stop_tx, _) = watch::channel(false);
        let mut peers = HashMap::new();
        for entry in &bootstrap {
            peers.insert(entry.peer.clone(), entry.addr);
        }
        Arc::new(Self {
            local_key,
            local_peer,
            rendezvous: rendezvous.into(),
            external_ip,
            listen_port: RwLock::new(port),
            peers: RwLock::new(peers),
            bootstrap,
            subscribers: DashMap::new(),
            broadcast_tx,
            broadcast_rx: Mutex::new(Some(broadcast_rx)),
            join_party_tx: Mutex::new(None),
            notifier_tx: Mutex::new(None),
            stop_tx,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer.clone()
    }

    pub fn local_pub_key_hex(&self) -> String {
        hex::encode(
            self.local_key
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes(),
        )
    }

    /// Sender for outbound session traffic
    pub fn broadcast_sender(&self) -> mpsc::Sender<BroadcastBundle> {
        self.broadcast_tx.clone()
    }

    /// Watch that flips once the host is shutting down
    pub fn stop_watch(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// The address this node advertises to its peers
    pub fn advertised_address(&self) -> NetAddress {
        let ip = self
            .external_ip
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let addr: SocketAddr = format!("{}:{}", ip, *self.listen_port.read())
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], *self.listen_port.read())));
        NetAddress::new(addr, self.local_peer.clone())
    }

    /// Every address we currently know, ourselves excluded
    pub fn address_book(&self) -> Vec<NetAddress> {
        self.peers
            .read()
            .iter()
            .map(|(peer, addr)| NetAddress::new(*addr, peer.clone()))
            .collect()
    }

    /// Whether we hold a dialable address for the peer
    pub fn knows_peer(&self, peer: &PeerId) -> bool {
        self.peers.read().contains_key(peer)
    }

    pub fn add_peer(&self, entry: NetAddress) {
        if entry.peer == self.local_peer {
            return;
        }
        self.peers.write().insert(entry.peer, entry.addr);
    }

    /// Bind the listener and spawn the accept loop, the broadcast pump,
    /// and the bootstrap discovery loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let port = *self.listen_port.read();
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let actual = listener.local_addr()?.port();
        *self.listen_port.write() = actual;
        info!(peer = %self.local_peer, port = actual, "overlay host created");

        let accept_host = Arc::clone(self);
        tokio::spawn(async move { accept_host.accept_loop(listener).await });

        let pump_host = Arc::clone(self);
        tokio::spawn(async move { pump_host.process_broadcast().await });

        if !self.bootstrap.is_empty() {
            let discovery_host = Arc::clone(self);
            tokio::spawn(async move { discovery_host.discovery_loop().await });
        }
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Register a session's channel for one `(message type, message id)`
    pub fn set_subscribe(&self, topic: MessageType, msg_id: &str, channel: mpsc::Sender<P2pMessage>) {
        self.subscribers
            .insert((topic, msg_id.to_string()), channel);
    }

    pub fn cancel_subscribe(&self, topic: MessageType, msg_id: &str) {
        self.subscribers.remove(&(topic, msg_id.to_string()));
    }

    fn get_subscriber(&self, topic: MessageType, msg_id: &str) -> Option<mpsc::Sender<P2pMessage>> {
        self.subscribers
            .get(&(topic, msg_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// The coordinator's inbox for parked join-party streams
    pub fn register_join_party_handler(&self, tx: mpsc::Sender<InboundJoinParty>) {
        *self.join_party_tx.lock() = Some(tx);
    }

    /// The notifier's inbox for signature payloads
    pub fn register_notifier_handler(&self, tx: mpsc::Sender<InboundNotification>) {
        *self.notifier_tx.lock() = Some(tx);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let host = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = host.handle_stream(stream, remote).await {
                                    debug!(error = %e, %remote, "stream handling ended");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "fail to accept connection");
                        }
                    }
                }
            }
        }
        debug!("accept loop stopped");
    }

    async fn handle_stream(&self, mut stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let hello_bytes = read_length_prefixed(&mut stream).await?;
        let hello: Hello = serde_json::from_slice(&hello_bytes)?;
        if hello.rendezvous != self.rendezvous {
            return Err(NodeError::InvalidRequest(format!(
                "peer belongs to network {}, ours is {}",
                hello.rendezvous, self.rendezvous
            )));
        }
        let key_bytes = hex::decode(&hello.pub_key)
            .map_err(|e| NodeError::InvalidRequest(format!("bad hello key: {e}")))?;
        let peer = PeerId::from_pub_key_bytes(&key_bytes)?;
        // learn where the peer can be dialed back
        self.add_peer(NetAddress::new(
            SocketAddr::new(remote.ip(), hello.listen_port),
            peer.clone(),
        ));

        match hello.protocol {
            Protocol::Rounds => {
                let payload = read_length_prefixed(&mut stream).await?;
                let wrapped: WrappedMessage = serde_json::from_slice(&payload)?;
                let Some(channel) = self.get_subscriber(wrapped.message_type, &wrapped.msg_id)
                else {
                    info!(msg_id = %wrapped.msg_id, ty = %wrapped.message_type,
                        "no subscriber found for this message");
                    return Ok(());
                };
                channel
                    .send(P2pMessage { peer, payload })
                    .await
                    .map_err(|_| NodeError::Shutdown)?;
                Ok(())
            }
            Protocol::JoinParty => {
                let payload = read_length_prefixed(&mut stream).await?;
                let request: JoinPartyRequest = serde_json::from_slice(&payload)?;
                let handler = self.join_party_tx.lock().clone();
                let Some(handler) = handler else {
                    warn!("no join-party handler registered");
                    return Ok(());
                };
                handler
                    .send(InboundJoinParty {
                        peer,
                        request,
                        stream,
                    })
                    .await
                    .map_err(|_| NodeError::Shutdown)?;
                Ok(())
            }
            Protocol::SignatureNotifier => {
                let payload = read_length_prefixed(&mut stream).await?;
                let handler = self.notifier_tx.lock().clone();
                let Some(handler) = handler else {
                    warn!("no signature notifier handler registered");
                    return Ok(());
                };
                handler
                    .send(InboundNotification { peer, payload })
                    .await
                    .map_err(|_| NodeError::Shutdown)?;
                Ok(())
            }
            Protocol::Discovery => {
                // the greeting frame itself carries nothing we need beyond
                // the hello; answer with our address book
                let _ = read_length_prefixed(&mut stream).await?;
                let mut book = self.address_book();
                book.push(self.advertised_address());
                let reply = serde_json::to_vec(&book.iter().map(|a| a.to_string()).collect::<Vec<_>>())?;
                write_length_prefixed(&mut stream, &reply).await
            }
        }
    }

    fn hello(&self, protocol: Protocol) -> Hello {
        Hello {
            protocol,
            pub_key: self.local_pub_key_hex(),
            listen_port: *self.listen_port.read(),
            rendezvous: self.rendezvous.clone(),
        }
    }

    /// Dial a peer and complete the hello; the caller owns the stream.
    pub async fn open_stream(&self, peer: &PeerId, protocol: Protocol) -> Result<TcpStream> {
        if *peer == self.local_peer {
            return Err(NodeError::InvalidRequest("refusing to dial ourselves".into()));
        }
        let addr = self
            .peers
            .read()
            .get(peer)
            .copied()
            .ok_or_else(|| NodeError::PeerUnreachable(peer.to_string()))?;
        let mut stream = tokio::time::timeout(TIMEOUT_CONNECTING, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::PeerUnreachable(peer.to_string()))?
            .map_err(|e| NodeError::PeerUnreachable(format!("{peer}: {e}")))?;
        let hello = serde_json::to_vec(&self.hello(protocol))?;
        write_length_prefixed(&mut stream, &hello).await?;
        Ok(stream)
    }

    /// Dial, deliver one frame, and close.
    pub async fn send_to_peer(&self, peer: &PeerId, protocol: Protocol, payload: &[u8]) -> Result<()> {
        let mut stream = self.open_stream(peer, protocol).await?;
        write_length_prefixed(&mut stream, payload).await
    }

    /// Serialize once, then deliver to every target sequentially. Streams
    /// that fail are logged and skipped; the echo and pull protocols
    /// compensate for individual losses.
    pub async fn broadcast_wrapped(&self, wrapped: &WrappedMessage, peers: &[PeerId]) {
        if peers.is_empty() {
            return;
        }
        let payload = match serde_json::to_vec(wrapped) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "fail to marshal a wrapped message to json bytes");
                return;
            }
        };
        for peer in peers {
            if *peer == self.local_peer {
                continue;
            }
            if let Err(e) = self.send_to_peer(peer, Protocol::Rounds, &payload).await {
                error!(error = %e, %peer, "fail to write to stream");
            }
        }
        debug!(count = peers.len(), "finished sending message to peers");
    }

    /// Drain the outbound channel until shutdown.
    async fn process_broadcast(self: Arc<Self>) {
        info!("start to process broadcast message channel");
        let mut rx = match self.broadcast_rx.lock().take() {
            Some(rx) => rx,
            None => {
                error!("broadcast pump already running");
                return;
            }
        };
        let mut stop = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                bundle = rx.recv() => {
                    let Some(bundle) = bundle else { break };
                    debug!(ty = %bundle.wrapped.message_type, peers = bundle.peers.len(),
                        "broadcast message");
                    self.broadcast_wrapped(&bundle.wrapped, &bundle.peers).await;
                }
            }
        }
        info!("stop process broadcast message channel");
    }

    /// Greet the bootstrap peers on a fixed cadence, merging whatever
    /// address book they answer with.
    async fn discovery_loop(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(DISCOVERY_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    for entry in &self.bootstrap {
                        if entry.peer == self.local_peer {
                            continue;
                        }
                        if let Err(e) = self.exchange_address_book(&entry.peer).await {
                            debug!(error = %e, peer = %entry.peer, "bootstrap greeting failed");
                        }
                    }
                }
            }
        }
    }

    async fn exchange_address_book(&self, peer: &PeerId) -> Result<()> {
        let mut stream = self.open_stream(peer, Protocol::Discovery).await?;
        write_length_prefixed(&mut stream, b"").await?;
        let reply = read_length_prefixed(&mut stream).await?;
        let entries: Vec<String> = serde_json::from_slice(&reply)?;
        for text in entries {
            match text.parse::<NetAddress>() {
                Ok(address) => self.add_peer(address),
                Err(e) => debug!(error = %e, "skip invalid address book entry"),
            }
        }
        Ok(())
    }
}
