//! Socket multiplexing.
//!
//! One physical udp socket fans out to any number of logical views,
//! each guarded by a packet filter.  A single receive task reads the
//! socket (which is what serializes physical receives); every
//! datagram is offered to every view in registration order and cloned
//! into the queue of each view whose filter accepts it.  Datagrams no
//! filter wants land in the fall-through queue, read through the mux
//! socket's own `receive`.
//!
//! Closing a view only drops its registration; the physical socket
//! stays open for the remaining views.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};

use crate::Error;

/// size of each view's pending queue; a slow consumer loses datagrams
/// rather than stalling its siblings.
pub const VIEW_QUEUE_CAPACITY: usize = 64;

/// Decides whether a datagram belongs to a view.
///
/// Filters run on the receive task with the registry lock held, so
/// they must be cheap and must not block.
pub trait PacketFilter: Send + Sync {
    fn accept(&self, packet: &[u8], from: SocketAddr) -> bool;
}

/// Accepts anything that parses as a stun message header.
pub struct StunFilter;

impl PacketFilter for StunFilter {
    fn accept(&self, packet: &[u8], _: SocketAddr) -> bool {
        codec::Decoder::is_message(packet)
    }
}

struct Registration {
    id: u64,
    filter: Arc<dyn PacketFilter>,
    queue: mpsc::Sender<(Bytes, SocketAddr)>,
}

struct MuxShared {
    views: Mutex<Vec<Registration>>,
    fallthrough: mpsc::Sender<(Bytes, SocketAddr)>,
}

/// Multiplexed udp socket.
pub struct MuxSocket {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    shared: Arc<MuxShared>,
    fallthrough: tokio::sync::Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
    ids: AtomicU64,
    reader: JoinHandle<()>,
}

impl MuxSocket {
    pub fn new(socket: Arc<UdpSocket>) -> Result<Self, Error> {
        let local = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(VIEW_QUEUE_CAPACITY);

        let shared = Arc::new(MuxShared {
            views: Mutex::new(Vec::new()),
            fallthrough: tx,
        });

        let reader = tokio::spawn(recv_loop(socket.clone(), shared.clone()));

        Ok(Self {
            fallthrough: tokio::sync::Mutex::new(rx),
            ids: AtomicU64::new(0),
            shared,
            socket,
            local,
            reader,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Register a filtered view over the physical socket.
    pub fn register(self: &Arc<Self>, filter: Arc<dyn PacketFilter>) -> MuxView {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(VIEW_QUEUE_CAPACITY);

        self.shared.views.lock().push(Registration {
            id,
            filter,
            queue: tx,
        });

        MuxView {
            mux: self.clone(),
            queue: tokio::sync::Mutex::new(rx),
            id,
        }
    }

    /// Fall-through receive: datagrams no registered filter accepted.
    pub async fn receive(&self) -> Result<(Bytes, SocketAddr), Error> {
        self.fallthrough
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::SocketClosed)
    }

    pub fn send_to(&self, bytes: &[u8], to: SocketAddr) -> Result<(), Error> {
        match self.socket.try_send_to(bytes, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::QueueFull),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn unregister(&self, id: u64) {
        self.shared.views.lock().retain(|view| view.id != id);
    }
}

impl Drop for MuxSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// A filtered slice of a mux socket.
///
/// `receive` yields the datagrams its filter accepted, in physical
/// arrival order.  Dropping the view removes its registration; any
/// blocked receiver wakes with `SocketClosed`.
pub struct MuxView {
    mux: Arc<MuxSocket>,
    queue: tokio::sync::Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
    id: u64,
}

impl MuxView {
    pub async fn receive(&self) -> Result<(Bytes, SocketAddr), Error> {
        self.queue.lock().await.recv().await.ok_or(Error::SocketClosed)
    }

    /// Sends delegate to the physical socket, a view owns no socket of
    /// its own.
    pub fn send_to(&self, bytes: &[u8], to: SocketAddr) -> Result<(), Error> {
        self.mux.send_to(bytes, to)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.mux.local_addr()
    }

    /// Remove the registration.  Equivalent to dropping the view but
    /// usable through an Arc.  Unregistering drops the queue sender,
    /// so a blocked `receive` drains and then observes `SocketClosed`.
    pub fn close(&self) {
        self.mux.unregister(self.id);
    }
}

impl Drop for MuxView {
    fn drop(&mut self) {
        self.mux.unregister(self.id);
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, shared: Arc<MuxShared>) {
    let mut buffer = vec![0u8; 2048];

    loop {
        let (size, from) = match socket.recv_from(&mut buffer).await {
            Ok(result) => result,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                log::error!("mux socket closed: err={e}");
                break;
            }
        };

        let bytes = Bytes::copy_from_slice(&buffer[..size]);
        let mut accepted = false;

        {
            let views = shared.views.lock();
            for view in views.iter() {
                if view.filter.accept(&bytes, from) {
                    accepted = true;
                    if view.queue.try_send((bytes.clone(), from)).is_err() {
                        log::warn!("mux view queue full, datagram dropped: from={from}");
                    }
                }
            }
        }

        if !accepted && shared.fallthrough.try_send((bytes, from)).is_err() {
            log::warn!("mux fall-through queue full, datagram dropped: from={from}");
        }
    }
}
