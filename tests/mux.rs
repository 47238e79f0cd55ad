//! Multiplexing and demultiplexing over loopback sockets.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, ensure};
use bytes::BytesMut;
use ice_agent::codec::{
    attribute::UserName,
    message::MessageWriter,
    method::{Kind, Method},
};
use ice_agent::harvest::{single_port::SinglePortUdpHarvester, tcp_mux::TcpAcceptDemux};
use ice_agent::stack::{
    mux::{MuxSocket, StunFilter},
    transaction::TransactionId,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, UdpSocket},
    time::timeout,
};

fn binding_request(username: Option<&str>) -> BytesMut {
    let token = TransactionId::random();
    let mut bytes = BytesMut::with_capacity(128);
    let mut writer = MessageWriter::new(Method::Binding(Kind::Request), token.as_bytes(), &mut bytes);

    if let Some(username) = username {
        writer.append::<UserName>(username);
    }

    writer.flush(None).unwrap();
    bytes
}

/// Scenario: a stun filter view and the fall-through queue split the
/// traffic of one physical socket without overlap.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mux_splits_stun_from_noise() -> Result<()> {
    let physical = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let mux = Arc::new(MuxSocket::new(physical)?);
    let local = mux.local_addr();

    let stun_view = mux.register(Arc::new(StunFilter));

    let remote = UdpSocket::bind("127.0.0.1:0").await?;
    let request = binding_request(None);
    remote.send_to(&request, local).await?;
    remote.send_to(b"definitely not stun", local).await?;

    let (stun_bytes, stun_from) = timeout(Duration::from_secs(1), stun_view.receive()).await??;
    ensure!(stun_bytes[..] == request[..]);
    ensure!(stun_from == remote.local_addr()?);

    let (noise, noise_from) = timeout(Duration::from_secs(1), mux.receive()).await??;
    ensure!(&noise[..] == b"definitely not stun");
    ensure!(noise_from == remote.local_addr()?);

    // neither queue got the other's packet.
    ensure!(
        timeout(Duration::from_millis(200), stun_view.receive())
            .await
            .is_err()
    );
    ensure!(timeout(Duration::from_millis(200), mux.receive()).await.is_err());

    Ok(())
}

/// Scenario: on the shared port, a peer is admitted by a Binding
/// request with a recognized ufrag; unknown raw datagrams are
/// dropped; follow-up traffic from the admitted peer lands on its
/// virtual socket.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_port_demultiplex() -> Result<()> {
    let harvester = SinglePortUdpHarvester::bind("127.0.0.1:0".parse()?).await?;
    let local = harvester.local_addr();
    let mut accept = harvester.register_ufrag("abcd");

    let peer_a = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_b = UdpSocket::bind("127.0.0.1:0").await?;

    // unknown raw datagram first: must vanish without side effects.
    peer_b.send_to(b"junk from nowhere", local).await?;

    let request = binding_request(Some("abcd:peer"));
    peer_a.send_to(&request, local).await?;

    let socket = timeout(Duration::from_secs(1), accept.recv())
        .await?
        .expect("admission queue closed");

    ensure!(socket.peer() == peer_a.local_addr()?);

    // the admitting request itself is on the receive path.
    let first = timeout(Duration::from_secs(1), socket.receive()).await??;
    ensure!(first[..] == request[..]);

    // the junk peer produced no virtual socket.
    ensure!(timeout(Duration::from_millis(200), accept.recv()).await.is_err());

    // follow-up traffic is routed to the same virtual socket.
    peer_a.send_to(b"media payload", local).await?;
    let payload = timeout(Duration::from_secs(1), socket.receive()).await??;
    ensure!(&payload[..] == b"media payload");

    // sends go out of the shared physical port.
    socket.send(b"reply")?;
    let mut buffer = [0u8; 64];
    let (size, from) = timeout(Duration::from_secs(1), peer_a.recv_from(&mut buffer)).await??;
    ensure!(&buffer[..size] == b"reply");
    ensure!(from == local);

    Ok(())
}

/// Scenario: the tcp accept demultiplexer routes a connection to its
/// component from the first rfc4571-framed Binding request.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_accept_demultiplex() -> Result<()> {
    let demux = TcpAcceptDemux::bind("127.0.0.1:0".parse()?, false).await?;
    let local = demux.local_addr();
    let mut accept = demux.register_ufrag("wxyz");

    let mut client = TcpStream::connect(local).await?;
    let request = binding_request(Some("wxyz:peer"));

    client
        .write_all(&(request.len() as u16).to_be_bytes())
        .await?;
    client.write_all(&request).await?;

    let accepted = timeout(Duration::from_secs(1), accept.recv())
        .await?
        .expect("admission queue closed");

    ensure!(accepted.peer == client.local_addr()?);
    ensure!(accepted.first[..] == request[..]);

    // an unknown ufrag never reaches the queue.
    let mut stranger = TcpStream::connect(local).await?;
    let bad = binding_request(Some("nope:peer"));
    stranger.write_all(&(bad.len() as u16).to_be_bytes()).await?;
    stranger.write_all(&bad).await?;
    ensure!(timeout(Duration::from_millis(300), accept.recv()).await.is_err());

    Ok(())
}
