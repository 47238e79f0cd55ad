//! Socket connectors.
//!
//! One connector per bound local endpoint.  Each connector runs a
//! dedicated receive task that wraps inbound payloads as raw messages
//! and pushes them into the shared stack queue.  A fatal socket error
//! unregisters the connector and fails the client transactions that
//! were sending through it; a transient error (an icmp unreachable
//! bounced back on udp) only skips the datagram.

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{Arc, Weak},
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{Error, RawMessage, StackInner, Transport};

/// udp payloads are bounded by the mtu; 1472 is the usual ethernet
/// payload ceiling after ip and udp headers.
pub const UDP_RECV_BUFFER: usize = 1472;

/// upper bound for a single framed stun message on a stream
/// transport, larger frames indicate a broken or hostile peer.
pub const MAX_TCP_MESSAGE_SIZE: usize = 2048;

/// Send half of a virtual connector; the owner decides how bytes
/// actually reach the network (a turn relayed socket wraps them in
/// Send indications, for example).
pub type VirtualSender = Box<dyn Fn(&[u8], SocketAddr) -> Result<(), Error> + Send + Sync>;

enum Sender {
    Udp(Arc<UdpSocket>),
    Tcp(mpsc::UnboundedSender<Bytes>),
    Virtual(VirtualSender),
}

/// Registered connector endpoint: the send half plus the receive task
/// handle so removal can stop the loop.
pub(crate) struct ConnectorHandle {
    sender: Sender,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl ConnectorHandle {
    /// Synchronous send, usable from worker context.  Udp writes go
    /// straight to the socket; tcp writes are queued to the write task
    /// which applies the rfc4571 length prefix.
    pub(crate) fn send(&self, bytes: &[u8], to: SocketAddr) -> Result<(), Error> {
        match &self.sender {
            Sender::Udp(socket) => match socket.try_send_to(bytes, to) {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => Err(Error::QueueFull),
                Err(e) => Err(Error::Io(e)),
            },
            Sender::Tcp(tx) => tx
                .send(Bytes::copy_from_slice(bytes))
                .map_err(|_| Error::SocketClosed),
            Sender::Virtual(send) => send(bytes, to),
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }

        if let Some(writer) = &self.writer {
            writer.abort();
        }
    }
}

/// Register a connector with no socket of its own.  Inbound traffic
/// for it is fed through `StunStack::inject` by whoever owns the
/// transport underneath.
pub(crate) fn register_virtual(stack: &Arc<StackInner>, local: SocketAddr, sender: VirtualSender) {
    stack.connectors.lock().insert(
        (local, Transport::Udp),
        ConnectorHandle {
            sender: Sender::Virtual(sender),
            reader: None,
            writer: None,
        },
    );
}

pub(crate) fn register_udp(
    stack: &Arc<StackInner>,
    socket: Arc<UdpSocket>,
) -> Result<SocketAddr, Error> {
    let local = socket.local_addr()?;
    let weak = Arc::downgrade(stack);

    let reader = tokio::spawn(udp_recv_loop(weak, socket.clone(), local));

    stack.connectors.lock().insert(
        (local, Transport::Udp),
        ConnectorHandle {
            sender: Sender::Udp(socket),
            reader: Some(reader),
            writer: None,
        },
    );

    Ok(local)
}

async fn udp_recv_loop(stack: Weak<StackInner>, socket: Arc<UdpSocket>, local: SocketAddr) {
    let mut buffer = BytesMut::zeroed(UDP_RECV_BUFFER);

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((size, from)) => {
                let Some(stack) = stack.upgrade() else {
                    break;
                };

                stack.enqueue(RawMessage {
                    bytes: Bytes::copy_from_slice(&buffer[..size]),
                    transport: Transport::Udp,
                    to: local,
                    from,
                });
            }
            // A connection reset here is a bounced icmp for an earlier
            // send, the socket itself is fine.
            Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
            Err(e) => {
                fatal(&stack, local, Transport::Udp, e);
                break;
            }
        }
    }
}

pub(crate) fn register_tcp(stack: &Arc<StackInner>, stream: TcpStream) -> Result<SocketAddr, Error> {
    let local = stream.local_addr()?;
    let peer = stream.peer_addr()?;
    let weak = Arc::downgrade(stack);

    // Keeping real-time behavior matters more than throughput on a
    // signalling-sized stream.
    if let Err(e) = stream.set_nodelay(true) {
        log::warn!("tcp connector set nodelay failed: addr={peer}, err={e}");
    }

    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let frame = (bytes.len() as u16).to_be_bytes();
            if write_half.write_all(&frame).await.is_err()
                || write_half.write_all(&bytes).await.is_err()
            {
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        let mut frame = [0u8; 2];
        let mut buffer = vec![0u8; MAX_TCP_MESSAGE_SIZE];

        loop {
            // rfc4571: every message is prefixed with a 2-byte
            // network-order length; a truncated read ends only this
            // connection.
            if read_half.read_exact(&mut frame).await.is_err() {
                fatal_eof(&weak, local, peer);
                break;
            }

            let size = u16::from_be_bytes(frame) as usize;
            if size > MAX_TCP_MESSAGE_SIZE {
                log::warn!("tcp frame too large: size={size}, addr={peer}");
                fatal_eof(&weak, local, peer);
                break;
            }

            if read_half.read_exact(&mut buffer[..size]).await.is_err() {
                fatal_eof(&weak, local, peer);
                break;
            }

            let Some(stack) = weak.upgrade() else {
                break;
            };

            stack.enqueue(RawMessage {
                bytes: Bytes::copy_from_slice(&buffer[..size]),
                transport: Transport::Tcp,
                from: peer,
                to: local,
            });
        }
    });

    stack.connectors.lock().insert(
        (local, Transport::Tcp),
        ConnectorHandle {
            sender: Sender::Tcp(tx),
            reader: Some(reader),
            writer: Some(writer),
        },
    );

    Ok(local)
}

fn fatal(stack: &Weak<StackInner>, local: SocketAddr, transport: Transport, e: io::Error) {
    log::error!("connector closed: local={local}, transport={transport:?}, err={e}");

    if let Some(stack) = stack.upgrade() {
        if let Some(handle) = stack.connectors.lock().remove(&(local, transport)) {
            handle.shutdown();
        }

        stack.client.fail_by_local_addr(local);
    }
}

fn fatal_eof(stack: &Weak<StackInner>, local: SocketAddr, peer: SocketAddr) {
    log::info!("tcp connector disconnect: local={local}, addr={peer}");

    if let Some(stack) = stack.upgrade() {
        if let Some(handle) = stack.connectors.lock().remove(&(local, Transport::Tcp)) {
            handle.shutdown();
        }

        stack.client.fail_by_local_addr(local);
    }
}
