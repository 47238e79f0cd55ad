//! Single-port tcp accept demultiplexing.
//!
//! An accept loop hands every new connection to a read task with a
//! hard deadline: within ten seconds the client must deliver one
//! rfc4571-framed stun Binding request whose USERNAME names a
//! registered ufrag, otherwise the connection is closed.  Admitted
//! connections are handed to the owning component together with the
//! first request, which stays on the component's normal receive path
//! so the connectivity checker answers it like any other check.
//!
//! The optional "ssl-tcp" mode expects a fixed pseudo-tls client
//! handshake record first and echoes the fixed server record back
//! before stun framing begins; the bytes carry no cryptography, the
//! exchange only disguises the stream for middleboxes.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use codec::{Decoder, attribute::UserName, method::{Kind, Method}};
use parking_lot::Mutex;
use stack::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};

/// first-frame deadline per accepted connection.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// upper bound for the admission frame.
const MAX_FRAME_SIZE: usize = 2048;

/// Fixed pseudo-tls records, sized like a real ClientHello/ServerHello
/// exchange.  Only the length and byte-for-byte match matter.
pub const SSL_CLIENT_HANDSHAKE: [u8; 517] = pseudo_record::<517>();
pub const SSL_SERVER_HANDSHAKE: [u8; 79] = pseudo_record::<79>();

const fn pseudo_record<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    // tls record header: handshake, tls 1.0, record length.
    buf[0] = 0x16;
    buf[1] = 0x03;
    buf[2] = 0x01;
    buf[3] = ((N - 5) >> 8) as u8;
    buf[4] = ((N - 5) & 0xff) as u8;
    buf
}

/// An admitted connection: the stream plus the Binding request that
/// routed it.
pub struct AcceptedTcp {
    pub stream: TcpStream,
    pub first: Bytes,
    pub peer: SocketAddr,
}

struct Shared {
    ufrags: Mutex<HashMap<String, mpsc::UnboundedSender<AcceptedTcp>>>,
    ssl: bool,
}

/// Passive tcp candidate accept loop.
pub struct TcpAcceptDemux {
    shared: Arc<Shared>,
    local: SocketAddr,
    acceptor: JoinHandle<()>,
}

impl TcpAcceptDemux {
    pub async fn bind(listen: SocketAddr, ssl: bool) -> Result<Self, Error> {
        let listener = TcpListener::bind(listen).await?;
        let local = listener.local_addr()?;

        let shared = Arc::new(Shared {
            ufrags: Mutex::new(HashMap::new()),
            ssl,
        });

        let acceptor = tokio::spawn(accept_loop(listener, shared.clone()));
        log::info!("tcp accept demux listening: addr={local}, ssl={ssl}");

        Ok(Self {
            shared,
            local,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn register_ufrag(&self, ufrag: &str) -> mpsc::UnboundedReceiver<AcceptedTcp> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.ufrags.lock().insert(ufrag.to_string(), tx);
        rx
    }

    pub fn remove_ufrag(&self, ufrag: &str) {
        self.shared.ufrags.lock().remove(ufrag);
    }
}

impl Drop for TcpAcceptDemux {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("tcp accept loop closed: err={e}");
                break;
            }
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            match timeout(READ_TIMEOUT, admit(stream, peer, &shared)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::info!("tcp admission rejected: peer={peer}, err={e}");
                }
                Err(_) => {
                    log::info!("tcp admission timed out: peer={peer}");
                }
            }
        });
    }
}

/// Read (and possibly answer) the pseudo-ssl prefix, then the first
/// framed stun message, then route the connection by ufrag.
async fn admit(mut stream: TcpStream, peer: SocketAddr, shared: &Shared) -> Result<(), Error> {
    if shared.ssl {
        let mut prefix = [0u8; SSL_CLIENT_HANDSHAKE.len()];
        stream.read_exact(&mut prefix).await?;

        if prefix != SSL_CLIENT_HANDSHAKE {
            return Err(Error::Codec(codec::Error::InvalidInput));
        }

        stream.write_all(&SSL_SERVER_HANDSHAKE).await?;
    }

    // rfc4571 framing around the admission request.
    let mut frame = [0u8; 2];
    stream.read_exact(&mut frame).await?;

    let size = u16::from_be_bytes(frame) as usize;
    if size < 20 || size > MAX_FRAME_SIZE {
        return Err(Error::Codec(codec::Error::InvalidInput));
    }

    let mut first = vec![0u8; size];
    stream.read_exact(&mut first).await?;

    let ufrag = {
        let mut decoder = Decoder::default();
        let message = decoder
            .decode(&first)
            .map_err(Error::Codec)?;

        if message.method() != Method::Binding(Kind::Request) {
            return Err(Error::Codec(codec::Error::InvalidInput));
        }

        let username = message
            .get::<UserName>()
            .ok_or(Error::Codec(codec::Error::InvalidInput))?;

        username.split(':').next().unwrap_or(username).to_string()
    };

    let accept = {
        let ufrags = shared.ufrags.lock();
        ufrags.get(&ufrag).cloned()
    };

    let Some(accept) = accept else {
        return Err(Error::ConnectorDoesNotExist);
    };

    log::info!("tcp connection admitted: peer={peer}, ufrag={ufrag}");
    accept
        .send(AcceptedTcp {
            first: Bytes::from(first),
            stream,
            peer,
        })
        .map_err(|_| Error::SocketClosed)
}
