//! Relayed candidate transport.
//!
//! A relayed candidate's socket view speaks plain `send`/`receive` to
//! its user while internally tunnelling everything through the turn
//! allocation: outbound packets ride Send indications after a
//! permission (a channel in the table below) has been installed for
//! the peer, inbound Data indications are unwrapped into the receive
//! queue, and a background task refreshes the allocation before its
//! lifetime runs out.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use bytes::{Bytes, BytesMut};
use codec::{
    Decoder,
    attribute::{Data, ErrorCode, Lifetime, XorPeerAddress},
    message::{MessageReader, MessageWriter},
    method::{Kind, Method},
};
use parking_lot::Mutex;
use stack::{
    IndicationListener, RawMessage, RequestOutcome, StunStack, Transport, TransactionEvent,
    credentials::LongTermSession, transaction::TransactionId,
};
use tokio::{sync::mpsc, time::Instant};

/// how long the server keeps a permission alive.
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// refresh a permission this long before it would lapse.
pub const PERMISSION_LEEWAY: Duration = Duration::from_secs(60);

/// allocation refresh leeway, mirrors the permission one.
pub const ALLOCATION_LEEWAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unbound,
    Binding,
    Bound,
}

/// Per-peer permission bookkeeping.
#[derive(Debug)]
pub struct Channel {
    state: ChannelState,
    refreshed: Instant,
}

impl Channel {
    fn new() -> Self {
        Self {
            state: ChannelState::Unbound,
            refreshed: Instant::now(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Bound and inside the refresh window.  Past the window the
    /// channel must be re-bound before further sends.
    pub fn is_bound(&self) -> bool {
        self.state == ChannelState::Bound
            && self.refreshed.elapsed() < PERMISSION_LIFETIME - PERMISSION_LEEWAY
    }
}

struct RelayInner {
    stack: StunStack,
    server: SocketAddr,
    /// the host socket the allocation was created through.
    base: SocketAddr,
    relayed: SocketAddr,
    session: Mutex<LongTermSession>,
    channels: Mutex<HashMap<SocketAddr, Channel>>,
    inbound_tx: mpsc::Sender<(SocketAddr, Bytes)>,
    closed: AtomicBool,
    listener: Mutex<Option<u64>>,
}

/// The datagram-socket view of one turn allocation.
pub struct RelayedSocket {
    inner: Arc<RelayInner>,
    outbound: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<(SocketAddr, Bytes)>>,
}

impl RelayedSocket {
    /// Wire up a freshly allocated relay: registers the Data
    /// indication listener, starts the sender task and the allocation
    /// refresh task.
    pub fn new(
        stack: StunStack,
        server: SocketAddr,
        base: SocketAddr,
        relayed: SocketAddr,
        session: LongTermSession,
        lifetime: u32,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(RelayInner {
            channels: Mutex::new(HashMap::new()),
            session: Mutex::new(session),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
            inbound_tx,
            relayed,
            server,
            stack,
            base,
        });

        let listener = inner.stack.add_indication_listener(
            Some(base),
            Arc::new(DataListener {
                inner: Arc::downgrade(&inner),
            }),
        );
        *inner.listener.lock() = Some(listener);

        // The relayed address acts as a full stack endpoint: outbound
        // stun rides the permission-managed sender queue, inbound stun
        // unwrapped from Data indications is injected back into the
        // stack.  Connectivity checks on relayed pairs need nothing
        // special this way.
        let virtual_tx = outbound_tx.clone();
        inner.stack.register_virtual(
            relayed,
            Box::new(move |bytes, to| {
                virtual_tx
                    .send((to, Bytes::copy_from_slice(bytes)))
                    .map_err(|_| stack::Error::SocketClosed)
            }),
        );

        tokio::spawn(sender_loop(inner.clone(), outbound_rx));
        tokio::spawn(refresh_loop(Arc::downgrade(&inner), lifetime));

        Arc::new(Self {
            inbound: tokio::sync::Mutex::new(inbound_rx),
            outbound: outbound_tx,
            inner,
        })
    }

    pub fn relayed_addr(&self) -> SocketAddr {
        self.inner.relayed
    }

    pub fn server(&self) -> SocketAddr {
        self.inner.server
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Queue a datagram for a peer.  The sender task installs the
    /// permission first if need be; a packet for a peer the server
    /// refuses is dropped.
    pub fn send(&self, peer: SocketAddr, bytes: Bytes) -> Result<(), stack::Error> {
        if self.is_closed() {
            return Err(stack::Error::SocketClosed);
        }

        self.outbound
            .send((peer, bytes))
            .map_err(|_| stack::Error::SocketClosed)
    }

    /// Next datagram relayed back from a peer.
    pub async fn receive(&self) -> Result<(SocketAddr, Bytes), stack::Error> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(stack::Error::SocketClosed)
    }

    /// Channel state for a peer, `Unbound` when no traffic was ever
    /// queued for it.
    pub fn channel_state(&self, peer: &SocketAddr) -> ChannelState {
        self.inner
            .channels
            .lock()
            .get(peer)
            .map(|it| it.state())
            .unwrap_or(ChannelState::Unbound)
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for RelayedSocket {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl RelayInner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }

        if let Some(listener) = self.listener.lock().take() {
            self.stack.remove_indication_listener(listener);
        }

        // tearing down the virtual connector also fails any check
        // transaction still in flight through the relay.
        self.stack.remove_connector(self.relayed, Transport::Udp);

        log::info!("relayed socket closed: relayed={}, server={}", self.relayed, self.server);
    }

    /// One authenticated request round-trip to the turn server, with
    /// a single retry after a 401/438 challenge.
    async fn request(&self, build: impl Fn(&LongTermSession, &mut BytesMut)) -> Option<Bytes> {
        for _ in 0..2 {
            let mut bytes = BytesMut::with_capacity(256);
            {
                let session = self.session.lock();
                build(&session, &mut bytes);
            }

            let (collector, outcome) = RequestOutcome::pair();
            self.stack
                .send_request(
                    bytes.freeze(),
                    self.server,
                    (self.base, Transport::Udp),
                    collector,
                )
                .ok()?;

            match outcome.wait().await {
                TransactionEvent::Response { bytes, .. } => {
                    let mut decoder = Decoder::default();
                    let retry = {
                        let message = decoder.decode(&bytes).ok()?;
                        if !message.method().is_error() {
                            return Some(bytes.clone());
                        }

                        self.session.lock().challenge(&message)
                    };

                    if !retry {
                        return Some(bytes);
                    }
                }
                event => {
                    log::warn!("turn request failed: server={}, event={event:?}", self.server);
                    return None;
                }
            }
        }

        None
    }
}

/// Outbound pump: serializes permission installation and Send
/// indications per queued packet, which also keeps per-peer ordering.
async fn sender_loop(
    inner: Arc<RelayInner>,
    mut rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
) {
    while let Some((peer, payload)) = rx.recv().await {
        if inner.closed.load(Ordering::Relaxed) {
            break;
        }

        let needs_binding = {
            let mut channels = inner.channels.lock();
            let channel = channels.entry(peer).or_insert_with(Channel::new);
            if channel.is_bound() {
                false
            } else {
                channel.state = ChannelState::Binding;
                true
            }
        };

        if needs_binding {
            let response = inner
                .request(|session, bytes| {
                    let token = TransactionId::random();
                    let mut writer = MessageWriter::new(
                        Method::CreatePermission(Kind::Request),
                        token.as_bytes(),
                        bytes,
                    );

                    writer.append::<XorPeerAddress>(peer);
                    session.apply(&mut writer);
                    let _ = writer.flush(session.key().as_ref().map(|it| it.as_slice()));
                })
                .await;

            let bound = match response {
                Some(bytes) => {
                    let mut decoder = Decoder::default();
                    matches!(
                        decoder.decode(&bytes).map(|it| it.method()),
                        Ok(Method::CreatePermission(Kind::Response))
                    )
                }
                None => false,
            };

            let mut channels = inner.channels.lock();
            let channel = channels.entry(peer).or_insert_with(Channel::new);
            if bound {
                channel.state = ChannelState::Bound;
                channel.refreshed = Instant::now();
                log::info!("turn permission installed: peer={peer}, relayed={}", inner.relayed);
            } else {
                // non-transient: drop the packet, the next send for
                // this peer starts a fresh attempt.
                channel.state = ChannelState::Unbound;
                log::warn!("turn permission refused: peer={peer}, server={}", inner.server);
                continue;
            }
        }

        // wrap the payload and ship it to the server.
        let token = TransactionId::random();
        let mut bytes = BytesMut::with_capacity(payload.len() + 64);
        let mut writer = MessageWriter::new(Method::SendIndication, token.as_bytes(), &mut bytes);
        writer.append::<XorPeerAddress>(peer);
        writer.append::<Data>(&payload);
        if writer.flush(None).is_err() {
            continue;
        }

        if let Err(e) = inner
            .stack
            .send_indication(&bytes, (inner.base, Transport::Udp), inner.server)
        {
            log::warn!("send indication failed: peer={peer}, err={e}");
        }
    }
}

/// Allocation keep-alive: refresh ahead of expiry, collapse the
/// candidate when the server lets the allocation die.
async fn refresh_loop(inner: std::sync::Weak<RelayInner>, mut lifetime: u32) {
    loop {
        let wait = Duration::from_secs(lifetime as u64)
            .saturating_sub(ALLOCATION_LEEWAY)
            .max(Duration::from_secs(1));
        tokio::time::sleep(wait).await;

        let Some(inner) = inner.upgrade() else {
            break;
        };

        if inner.closed.load(Ordering::Relaxed) {
            break;
        }

        let response = inner
            .request(|session, bytes| {
                let token = TransactionId::random();
                let mut writer =
                    MessageWriter::new(Method::Refresh(Kind::Request), token.as_bytes(), bytes);

                writer.append::<Lifetime>(600);
                session.apply(&mut writer);
                let _ = writer.flush(session.key().as_ref().map(|it| it.as_slice()));
            })
            .await;

        let granted = response.and_then(|bytes| {
            let mut decoder = Decoder::default();
            let message = decoder.decode(&bytes).ok()?;
            match message.method() {
                Method::Refresh(Kind::Response) => Some(message.get::<Lifetime>().unwrap_or(600)),
                _ => {
                    if let Some(error) = message.get::<ErrorCode>() {
                        log::error!(
                            "allocation refresh rejected: code={}, server={}",
                            error.code,
                            inner.server
                        );
                    }

                    None
                }
            }
        });

        match granted {
            Some(next) => lifetime = next,
            None => {
                inner.close();
                break;
            }
        }
    }
}

/// Unwraps Data indications arriving on the allocation's host socket.
struct DataListener {
    inner: std::sync::Weak<RelayInner>,
}

impl IndicationListener for DataListener {
    fn on_indication(&self, _: &StunStack, indication: &MessageReader, raw: &RawMessage) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        // only data indications coming from our own server count.
        if indication.method() != Method::DataIndication || raw.from != inner.server {
            return;
        }

        let (Some(peer), Some(data)) = (
            indication.get::<XorPeerAddress>(),
            indication.get::<Data>(),
        ) else {
            return;
        };

        // stun riding the relay (connectivity checks and their
        // responses) re-enters the stack as if it had arrived on the
        // relayed address; everything else is application payload.
        if stack::is_stun_datagram(data) {
            inner.stack.inject(RawMessage {
                bytes: Bytes::copy_from_slice(data),
                transport: Transport::Udp,
                to: inner.relayed,
                from: peer,
            });

            return;
        }

        if inner
            .inbound_tx
            .try_send((peer, Bytes::copy_from_slice(data)))
            .is_err()
        {
            log::warn!("relayed inbound queue full, datagram dropped: peer={peer}");
        }
    }
}
