//! Radio emulation over UDP broadcast. Every node on the segment binds the same
//! port; addressing, channel and link encryption live in the envelope (see `link`).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use adhoc_core::{FrameSink, MacAddr, SecretKey, Transport, TransportError};

use crate::link::{Envelope, LinkCipher};

/// Peer slots per node, broadcast included.
pub const MAX_PEERS: usize = 20;

/// Registered links: `None` for plaintext peers.
type LinkTable = HashMap<MacAddr, Option<LinkCipher>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(MacAddr);

pub struct UdpTransport {
    port: u16,
    broadcast_addr: Ipv4Addr,
    local: MacAddr,
    channel: Arc<AtomicU8>,
    links: Arc<Mutex<LinkTable>>,
    network_key: Option<SecretKey>,
    socket: Option<Arc<UdpSocket>>,
    receiver: Option<JoinHandle<()>>,
}

impl UdpTransport {
    pub fn new(port: u16, broadcast_addr: Ipv4Addr, local: MacAddr, channel: u8) -> Self {
        Self {
            port,
            broadcast_addr,
            local,
            channel: Arc::new(AtomicU8::new(channel)),
            links: Arc::new(Mutex::new(HashMap::new())),
            network_key: None,
            socket: None,
            receiver: None,
        }
    }

    /// Start feeding received frames into `sink`. Requires a started transport
    /// and a tokio runtime.
    pub fn spawn_receiver(&mut self, sink: FrameSink) -> Result<(), TransportError> {
        let socket = self
            .socket
            .clone()
            .ok_or_else(|| TransportError::Unavailable("transport not started".into()))?;
        let local = self.local;
        let channel = self.channel.clone();
        let links = self.links.clone();
        self.receiver = Some(tokio::spawn(async move {
            recv_loop(socket, local, channel, links, sink).await
        }));
        Ok(())
    }

    fn bind(&self) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // Several nodes may share one host.
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port);
        socket.bind(&bind.into())?;
        UdpSocket::from_std(socket.into())
    }

    fn destination(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.broadcast_addr, self.port))
    }
}

impl Transport for UdpTransport {
    type Handle = PeerHandle;

    fn start(&mut self, network_key: Option<&SecretKey>) -> Result<(), TransportError> {
        if self.socket.is_some() {
            return Err(TransportError::Unavailable("already started".into()));
        }
        let socket = self.bind()?;
        debug!(port = self.port, mac = %self.local, "udp transport bound");
        self.network_key = network_key.cloned();
        self.socket = Some(Arc::new(socket));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
        self.socket = None;
        self.network_key = None;
        if let Ok(mut links) = self.links.lock() {
            links.clear();
        }
    }

    fn local_mac(&self) -> MacAddr {
        self.local
    }

    fn register_peer(
        &mut self,
        mac: MacAddr,
        _channel: u8,
        link_key: Option<&SecretKey>,
    ) -> Result<PeerHandle, TransportError> {
        if self.socket.is_none() {
            return Err(TransportError::Unavailable("transport not started".into()));
        }
        let cipher = match (link_key, &self.network_key) {
            (None, _) => None,
            (Some(_), _) if mac.is_broadcast() => return Err(TransportError::PeerRejected(mac)),
            (Some(link), Some(network)) => Some(LinkCipher::new(network, link)),
            (Some(_), None) => return Err(TransportError::PeerRejected(mac)),
        };
        let mut links = self
            .links
            .lock()
            .map_err(|_| TransportError::Unavailable("link table poisoned".into()))?;
        if links.contains_key(&mac) {
            return Err(TransportError::PeerRejected(mac));
        }
        if links.len() >= MAX_PEERS {
            return Err(TransportError::PeerTableFull);
        }
        links.insert(mac, cipher);
        Ok(PeerHandle(mac))
    }

    fn unregister_peer(&mut self, handle: PeerHandle) {
        if let Ok(mut links) = self.links.lock() {
            links.remove(&handle.0);
        }
    }

    fn send(&mut self, handle: &PeerHandle, frame: &[u8]) -> bool {
        let Some(socket) = &self.socket else {
            return false;
        };
        let dst = handle.0;
        let channel = self.channel.load(Ordering::Relaxed);
        let cipher = match self.links.lock() {
            Ok(links) => match links.get(&dst) {
                Some(cipher) => cipher.clone(),
                None => return false,
            },
            Err(_) => return false,
        };
        let datagram = match cipher {
            Some(cipher) => match Envelope::sealed(self.local, dst, channel, frame, &cipher) {
                Ok(d) => d,
                Err(e) => {
                    warn!(%dst, "seal failed: {e}");
                    return false;
                }
            },
            None => Envelope::plain(self.local, dst, channel, frame),
        };
        match socket.try_send_to(&datagram, self.destination()) {
            Ok(n) => n == datagram.len(),
            Err(e) => {
                debug!(%dst, "send failed: {e}");
                false
            }
        }
    }

    fn set_channel(&mut self, channel: u8) {
        self.channel.store(channel, Ordering::Relaxed);
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
    }
}

/// Why a datagram never reached the core.
#[derive(Debug, PartialEq, Eq)]
enum Discard {
    Foreign,
    OwnFrame,
    NotForUs,
    OtherChannel,
    UnknownSealedPeer,
    PlaintextFromSealedPeer,
    Unauthenticated,
}

/// Filter and unwrap one datagram the way a radio would: own transmissions,
/// other destinations and other channels are invisible.
fn accept(
    datagram: &[u8],
    local: MacAddr,
    channel: u8,
    links: &LinkTable,
) -> Result<Envelope, Discard> {
    let mut env = Envelope::decode(datagram).map_err(|_| Discard::Foreign)?;
    if env.src == local {
        return Err(Discard::OwnFrame);
    }
    if env.dst != local && !env.dst.is_broadcast() {
        return Err(Discard::NotForUs);
    }
    if env.channel != channel {
        return Err(Discard::OtherChannel);
    }
    match (env.sealed, links.get(&env.src)) {
        (true, Some(Some(cipher))) => {
            env.open(cipher).map_err(|_| Discard::Unauthenticated)?;
        }
        (true, _) => return Err(Discard::UnknownSealedPeer),
        (false, Some(Some(_))) if !env.dst.is_broadcast() => {
            return Err(Discard::PlaintextFromSealedPeer)
        }
        (false, _) => {}
    }
    Ok(env)
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    local: MacAddr,
    channel: Arc<AtomicU8>,
    links: Arc<Mutex<LinkTable>>,
    sink: FrameSink,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let n = match socket.recv_from(&mut buf).await {
            Ok((n, _)) => n,
            Err(e) => {
                warn!("udp receive failed: {e}");
                continue;
            }
        };
        let verdict = match links.lock() {
            Ok(links) => accept(&buf[..n], local, channel.load(Ordering::Relaxed), &links),
            Err(_) => return,
        };
        match verdict {
            Ok(env) => {
                if !sink.deliver(env.src, &env.body, env.dst.is_broadcast()) {
                    debug!("core gone, receiver exiting");
                    return;
                }
            }
            Err(reason) => trace!(?reason, "datagram discarded"),
        }
    }
}

/// Random locally administered unicast address.
pub fn random_mac() -> MacAddr {
    let mut bytes: [u8; 6] = rand::random();
    bytes[0] = (bytes[0] & 0xFE) | 0x02;
    MacAddr::new(bytes)
}
