//! Single-port udp demultiplexing.
//!
//! One socket on a well-known port serves every remote peer.  The
//! first well-formed Binding request from an unknown peer is admitted
//! when its USERNAME names the ufrag of a registered component; that
//! peer then gets a dedicated virtual socket and all of its later
//! datagrams are routed straight there.  Unknown peers that send
//! anything else are dropped on the floor.

use std::{net::SocketAddr, sync::Arc};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use codec::{Decoder, attribute::UserName, method::{Kind, Method}};
use parking_lot::Mutex;
use stack::{Error, Transport};
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};

use crate::candidate::{Candidate, CandidateKind, Foundations, priority};

/// per-peer inbound queue depth.
const PEER_QUEUE_CAPACITY: usize = 64;

/// A per-peer slice of the shared port.
///
/// Receives block on the peer's own queue; sends delegate to the one
/// physical socket.  The virtual socket does not own the physical
/// one, dropping it only severs this peer's routing.
pub struct VirtualSocket {
    peer: SocketAddr,
    local: SocketAddr,
    physical: Arc<UdpSocket>,
    queue: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl VirtualSocket {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn receive(&self) -> Result<Bytes, Error> {
        self.queue
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::SocketClosed)
    }

    pub fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        match self.physical.try_send_to(bytes, self.peer) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::QueueFull),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

struct Registration {
    /// hands freshly admitted virtual sockets to the component.
    accept: mpsc::UnboundedSender<Arc<VirtualSocket>>,
}

struct Shared {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    peers: Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    ufrags: Mutex<HashMap<String, Registration>>,
}

/// The shared-port harvester.
pub struct SinglePortUdpHarvester {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl SinglePortUdpHarvester {
    pub async fn bind(listen: SocketAddr) -> Result<Self, Error> {
        let socket = Arc::new(UdpSocket::bind(listen).await?);
        let local = socket.local_addr()?;

        let shared = Arc::new(Shared {
            peers: Mutex::new(HashMap::new()),
            ufrags: Mutex::new(HashMap::new()),
            socket: socket.clone(),
            local,
        });

        let reader = tokio::spawn(recv_loop(shared.clone()));
        log::info!("single port harvester listening: addr={local}");

        Ok(Self { shared, reader })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local
    }

    /// Register a component's local ufrag.  Returns the accept queue
    /// on which its admitted virtual sockets arrive.
    pub fn register_ufrag(&self, ufrag: &str) -> mpsc::UnboundedReceiver<Arc<VirtualSocket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .ufrags
            .lock()
            .insert(ufrag.to_string(), Registration { accept: tx });

        rx
    }

    pub fn remove_ufrag(&self, ufrag: &str) {
        self.shared.ufrags.lock().remove(ufrag);
    }

    /// Drop a peer's routing; its virtual socket sees `SocketClosed`.
    pub fn remove_peer(&self, peer: &SocketAddr) {
        self.shared.peers.lock().remove(peer);
    }

    /// The host candidate a component advertises for the shared port.
    pub fn candidate_for(&self, foundations: &Foundations, component: u16) -> Candidate {
        Candidate {
            foundation: foundations.assign(CandidateKind::Host, self.shared.local.ip(), None),
            priority: priority(CandidateKind::Host, 65535, component),
            kind: CandidateKind::Host,
            transport: Transport::Udp,
            address: self.shared.local,
            base: self.shared.local,
            component,
            relay: None,
        }
    }
}

impl Drop for SinglePortUdpHarvester {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn recv_loop(shared: Arc<Shared>) {
    let mut buffer = vec![0u8; 2048];
    let mut decoder = Decoder::default();

    loop {
        let (size, from) = match shared.socket.recv_from(&mut buffer).await {
            Ok(result) => result,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                log::error!("single port socket closed: addr={}, err={e}", shared.local);
                break;
            }
        };

        let bytes = Bytes::copy_from_slice(&buffer[..size]);

        // known peer: straight to its virtual socket.
        {
            let peers = shared.peers.lock();
            if let Some(queue) = peers.get(&from) {
                if queue.try_send(bytes.clone()).is_err() {
                    log::warn!("virtual socket queue full, datagram dropped: peer={from}");
                }

                continue;
            }
        }

        // unknown peer: admission requires a Binding request naming a
        // registered ufrag, everything else is dropped.
        let Some(ufrag) = admission_ufrag(&mut decoder, &bytes) else {
            log::debug!("datagram from unknown peer dropped: peer={from}");
            continue;
        };

        let accept = {
            let ufrags = shared.ufrags.lock();
            match ufrags.get(&ufrag) {
                Some(registration) => registration.accept.clone(),
                None => {
                    log::debug!("unknown ufrag, datagram dropped: peer={from}, ufrag={ufrag}");
                    continue;
                }
            }
        };

        let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        let socket = Arc::new(VirtualSocket {
            physical: shared.socket.clone(),
            queue: tokio::sync::Mutex::new(rx),
            local: shared.local,
            peer: from,
        });

        // the admitting request is pushed into the virtual socket so
        // the component's receive path answers it like any other
        // connectivity check.
        let _ = tx.try_send(bytes);
        shared.peers.lock().insert(from, tx);

        if accept.send(socket).is_err() {
            // component went away between registration and admission.
            shared.peers.lock().remove(&from);
            continue;
        }

        log::info!("virtual socket admitted: peer={from}, addr={}", shared.local);
    }
}

/// The local half of USERNAME on a well-formed Binding request.
fn admission_ufrag(decoder: &mut Decoder, bytes: &[u8]) -> Option<String> {
    let message = decoder.decode(bytes).ok()?;
    if message.method() != Method::Binding(Kind::Request) {
        return None;
    }

    let username = message.get::<UserName>()?;
    Some(username.split(':').next().unwrap_or(username).to_string())
}
