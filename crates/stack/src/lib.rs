//! ## STUN agent stack
//!
//! The stack owns the network access fabric shared by every ice
//! component: bound sockets with their receive loops, the raw message
//! queue and its worker pool, the event dispatcher, the client and
//! server transaction tables and the credentials machinery.
//!
//! One stack instance serves one agent.  Harvesters, the connectivity
//! checker and relayed sockets all borrow the same instance, there is
//! no process-global state.
//!
//! Inbound flow: a connector receive task wraps each datagram as a
//! [`RawMessage`] and enqueues it.  A worker pops it, decodes it and
//! routes it: responses are matched to client transactions by
//! transaction id, requests go through the server transaction table
//! (retransmits are answered from the response cache without touching
//! listeners) and validation before reaching request listeners, and
//! indications fan out to indication listeners.

pub mod connector;
pub mod credentials;
pub mod dispatcher;
pub mod mux;
pub mod transaction;

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use codec::{
    Decoder,
    attribute::{ErrKind, ErrorCode, Nonce, Realm, UnknownAttributes},
    message::{MessageReader, MessageWriter},
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    connector::ConnectorHandle,
    credentials::CredentialsManager,
    dispatcher::EventDispatcher,
    transaction::{
        TransactionId,
        client::{ClientTransactions, ResponseCollector},
        server::ServerTransactions,
    },
};

#[derive(Debug)]
pub enum Error {
    Codec(codec::Error),
    Io(io::Error),
    SocketClosed,
    QueueFull,
    ConnectorDoesNotExist,
    TransactionDoesNotExist,
    TransactionAlreadyAnswered,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// transport protocol of a bound endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

/// A datagram as it came off a socket, before decoding.
///
/// Immutable after construction; produced by connectors, consumed by
/// the worker pool.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub bytes: Bytes,
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub transport: Transport,
}

/// Transaction layer and worker pool tuning.
#[derive(Debug, Clone)]
pub struct StackOptions {
    /// initial retransmission timeout (RFC5389 Rto), 500ms by default.
    pub rto: Duration,
    /// maximum number of request transmissions (RFC5389 Rc).
    pub max_retransmissions: u32,
    /// total transaction lifetime in units of rto (RFC5389 Rm).
    pub max_wait_interval: u32,
    /// raw message queue capacity; overflow drops the datagram.
    pub queue_capacity: usize,
    /// number of decode/dispatch workers.
    pub workers: usize,
    /// reject requests that carry no MESSAGE-INTEGRITY attribute.
    pub require_message_integrity: bool,
    /// whether a deduplicated retransmit should still reach listeners.
    pub propagate_received_retransmissions: bool,
    /// SOFTWARE attribute value stamped on generated responses.
    pub software: String,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            rto: Duration::from_millis(500),
            max_retransmissions: 7,
            max_wait_interval: 16,
            queue_capacity: 512,
            workers: 3,
            require_message_integrity: false,
            propagate_received_retransmissions: false,
            software: concat!("ice-agent.", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// The stun stack.
///
/// Cheap to clone; all clones share one state. Dropping the last clone
/// tears down the worker pool, every connector task and every pending
/// transaction.
#[derive(Clone)]
pub struct StunStack {
    inner: Arc<StackInner>,
}

pub(crate) struct StackInner {
    pub(crate) options: StackOptions,
    pub(crate) connectors: Mutex<HashMap<(SocketAddr, Transport), ConnectorHandle>>,
    pub(crate) queue: mpsc::Sender<RawMessage>,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) client: ClientTransactions,
    pub(crate) server: ServerTransactions,
    pub(crate) credentials: CredentialsManager,
}

impl StunStack {
    pub fn new(options: StackOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let workers = options.workers.max(1);

        let inner = Arc::new(StackInner {
            connectors: Mutex::new(HashMap::new()),
            dispatcher: EventDispatcher::default(),
            client: ClientTransactions::new(options.rto, options.max_retransmissions, options.max_wait_interval),
            server: ServerTransactions::new(options.rto),
            credentials: CredentialsManager::default(),
            queue: tx,
            options,
        });

        let this = Self { inner };
        this.spawn_workers(workers, rx);
        this.inner.server.spawn_sweeper();
        this
    }

    /// The credentials manager shared by every component of the owning
    /// agent.
    pub fn credentials(&self) -> &CredentialsManager {
        &self.inner.credentials
    }

    pub fn options(&self) -> &StackOptions {
        &self.inner.options
    }

    /// Spawn the worker pool under a supervisor: a worker that dies on
    /// a listener panic is replaced so the pool never shrinks.
    fn spawn_workers(&self, count: usize, rx: mpsc::Receiver<RawMessage>) {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut pool = tokio::task::JoinSet::new();
            for _ in 0..count {
                pool.spawn(worker_loop(weak.clone(), rx.clone()));
            }

            while let Some(result) = pool.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() && weak.strong_count() > 0 {
                        log::error!("stack worker panicked, respawning: err={e}");
                        pool.spawn(worker_loop(weak.clone(), rx.clone()));
                    }
                }
            }
        });
    }

    /// Register a bound udp socket with the stack and start its
    /// receive loop.  The stack does not own binding decisions, the
    /// harvesters do.
    pub fn register_udp(&self, socket: Arc<tokio::net::UdpSocket>) -> Result<SocketAddr, Error> {
        connector::register_udp(&self.inner, socket)
    }

    /// Register an established tcp stream.  Inbound bytes are
    /// reassembled into messages with the rfc4571 2-byte length
    /// framing before entering the queue.
    pub fn register_tcp(&self, stream: tokio::net::TcpStream) -> Result<SocketAddr, Error> {
        connector::register_tcp(&self.inner, stream)
    }

    /// Register a connector whose transport lives elsewhere (a turn
    /// relayed socket, a demultiplexed view).  Outbound bytes go
    /// through `sender`, inbound traffic is fed back with [`inject`].
    ///
    /// [`inject`]: StunStack::inject
    pub fn register_virtual(&self, local: SocketAddr, sender: connector::VirtualSender) {
        connector::register_virtual(&self.inner, local, sender);
    }

    /// Push a raw message into the worker queue on behalf of a
    /// virtual connector.
    pub fn inject(&self, message: RawMessage) {
        self.inner.enqueue(message);
    }

    /// Remove a connector.  Its receive task stops and any client
    /// transaction sending through it is woken with an unreachable
    /// event.
    pub fn remove_connector(&self, local: SocketAddr, transport: Transport) {
        if let Some(handle) = self.inner.connectors.lock().remove(&(local, transport)) {
            handle.shutdown();
        }

        self.inner.client.fail_by_local_addr(local);
    }

    /// Raw send through a registered connector.
    pub fn send_bytes(
        &self,
        bytes: &[u8],
        through: SocketAddr,
        transport: Transport,
        to: SocketAddr,
    ) -> Result<(), Error> {
        self.inner.send_bytes(bytes, through, transport, to)
    }

    /// Send a request and register a client transaction for it.
    ///
    /// The transaction id is read from the encoded message.  Exactly
    /// one of the collector callbacks will fire for it.
    pub fn send_request(
        &self,
        bytes: Bytes,
        to: SocketAddr,
        through: (SocketAddr, Transport),
        collector: Arc<dyn ResponseCollector>,
    ) -> Result<TransactionId, Error> {
        self.inner
            .client
            .send(&self.inner, bytes, to, through, collector)
    }

    /// Stop retransmitting a pending request.  The transaction lingers
    /// for one more rto to absorb a late response, then reports
    /// cancellation.
    pub fn cancel_request(&self, id: &TransactionId) {
        self.inner.client.cancel(id);
    }

    /// Send an indication; indications create no transaction state.
    pub fn send_indication(
        &self,
        bytes: &[u8],
        through: (SocketAddr, Transport),
        to: SocketAddr,
    ) -> Result<(), Error> {
        self.inner.send_bytes(bytes, through.0, through.1, to)
    }

    /// Answer a request previously delivered to a request listener.
    ///
    /// The response is cached against its server transaction so that a
    /// retransmitted request is answered byte-identically without the
    /// listener running again.  Answering twice fails with
    /// `TransactionAlreadyAnswered`; the cache is never replaced.
    pub fn send_response(
        &self,
        id: &TransactionId,
        bytes: Bytes,
        through: (SocketAddr, Transport),
        to: SocketAddr,
    ) -> Result<(), Error> {
        self.inner.server.answer(id, bytes.clone())?;
        self.inner.send_bytes(&bytes, through.0, through.1, to)
    }

    /// Listener registration; a `None` address means the wildcard
    /// bucket, which sees traffic for every local address.
    pub fn add_request_listener(
        &self,
        local: Option<SocketAddr>,
        listener: Arc<dyn dispatcher::RequestListener>,
    ) -> u64 {
        self.inner.dispatcher.add_request_listener(local, listener)
    }

    pub fn remove_request_listener(&self, id: u64) {
        self.inner.dispatcher.remove_request_listener(id);
    }

    pub fn add_indication_listener(
        &self,
        local: Option<SocketAddr>,
        listener: Arc<dyn dispatcher::IndicationListener>,
    ) -> u64 {
        self.inner
            .dispatcher
            .add_indication_listener(local, listener)
    }

    pub fn remove_indication_listener(&self, id: u64) {
        self.inner.dispatcher.remove_indication_listener(id);
    }

    /// Orderly teardown: connectors stop, pending client transactions
    /// report cancellation, the server transaction table is cleared
    /// and the raw queue is closed so workers drain and exit.
    pub fn shutdown(&self) {
        for (_, handle) in self.inner.connectors.lock().drain() {
            handle.shutdown();
        }

        self.inner.client.cancel_all();
        self.inner.server.clear();
    }
}

impl StackInner {
    pub(crate) fn send_bytes(
        &self,
        bytes: &[u8],
        through: SocketAddr,
        transport: Transport,
        to: SocketAddr,
    ) -> Result<(), Error> {
        let connectors = self.connectors.lock();
        let handle = connectors
            .get(&(through, transport))
            .ok_or(Error::ConnectorDoesNotExist)?;

        handle.send(bytes, to)
    }

    /// Queue push from connector receive loops.  Overflow never blocks
    /// the socket, the datagram is counted and dropped.
    pub(crate) fn enqueue(&self, message: RawMessage) {
        if self.queue.try_send(message).is_err() {
            // Rate limiting is inherent here: one log line per failed
            // datagram and the queue only overflows under sustained
            // pressure.
            log::warn!("raw message queue full, datagram dropped");
        }
    }
}

/// A single worker: pop, decode, dispatch.
async fn worker_loop(
    stack: std::sync::Weak<StackInner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RawMessage>>>,
) {
    let mut decoder = Decoder::default();

    loop {
        let message = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };

        let Some(message) = message else {
            break;
        };

        let Some(stack) = stack.upgrade() else {
            break;
        };

        process(&stack, &mut decoder, &message);
    }
}

/// Decode a raw message and route it.
///
/// Decode failures drop the datagram locally, they are never visible
/// to the remote side.
fn process(stack: &Arc<StackInner>, decoder: &mut Decoder, raw: &RawMessage) {
    let reader = match decoder.decode(&raw.bytes) {
        Ok(reader) => reader,
        Err(e) => {
            log::debug!("dropping malformed datagram: from={}, err={e}", raw.from);
            return;
        }
    };

    let method = reader.method();
    let handle = StunStack {
        inner: stack.clone(),
    };

    if method.is_indication() {
        stack.dispatcher.fire_indication(&handle, &reader, raw);
        return;
    }

    if !method.is_request() {
        // success or error response: correlate with a pending client
        // transaction, unmatched responses are dropped.
        stack.client.dispatch_response(&reader, raw);
        return;
    }

    let Ok(id) = TransactionId::try_from(reader.token()) else {
        return;
    };

    // Server transaction dedup: a retransmit of an answered request is
    // replayed from the cache without listener involvement.
    match stack.server.begin(&id, raw) {
        transaction::server::Admission::Retransmit(Some(cached)) => {
            if let Err(e) = stack.send_bytes(&cached, raw.to, raw.transport, raw.from) {
                log::warn!("cached response resend failed: to={}, err={e}", raw.from);
            }

            if !stack.options.propagate_received_retransmissions {
                return;
            }
        }
        // A retransmit that raced the listener before a response was
        // produced; the first delivery is still in flight, drop.
        transaction::server::Admission::Retransmit(None) => return,
        transaction::server::Admission::New => {}
    }

    // Authentication gate; a rejection is answered right here and
    // cached like any other response.
    if let Err(rejection) = stack.credentials.validate(
        &reader,
        stack.options.require_message_integrity,
    ) {
        respond_rejection(stack, &reader, raw, &id, rejection);
        return;
    }

    stack.dispatcher.fire_request(&handle, &reader, raw);
}

fn respond_rejection(
    stack: &Arc<StackInner>,
    reader: &MessageReader,
    raw: &RawMessage,
    id: &TransactionId,
    rejection: credentials::Rejection,
) {
    let Some(method) = reader.method().error() else {
        return;
    };

    let mut bytes = bytes::BytesMut::with_capacity(256);
    let mut writer = MessageWriter::extend(method, reader, &mut bytes);

    match &rejection {
        credentials::Rejection::Unauthorized { realm, nonce } => {
            writer.append::<ErrorCode>(ErrorCode::from(ErrKind::Unauthorized));
            if let Some(realm) = realm {
                writer.append::<Realm>(realm);
            }

            if let Some(nonce) = nonce {
                writer.append::<Nonce>(nonce);
            }
        }
        credentials::Rejection::UnknownAttributes(kinds) => {
            writer.append::<ErrorCode>(ErrorCode::from(ErrKind::UnknownAttribute));
            writer.append::<UnknownAttributes>(kinds.clone());
        }
    }

    if writer.flush(None).is_err() {
        return;
    }

    let bytes = bytes.freeze();
    let _ = stack.server.answer(id, bytes.clone());
    if let Err(e) = stack.send_bytes(&bytes, raw.to, raw.transport, raw.from) {
        log::warn!("rejection response send failed: to={}, err={e}", raw.from);
    }
}

/// kind of a decoded message, used by tests and filters.
pub fn is_stun_datagram(bytes: &[u8]) -> bool {
    Decoder::is_message(bytes)
}

pub use crate::{
    dispatcher::{IndicationListener, RequestListener},
    transaction::client::{RequestOutcome, TransactionEvent},
};
