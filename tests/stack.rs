//! Transaction layer behavior over real loopback sockets.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, ensure};
use bytes::BytesMut;
use ice_agent::{
    candidate::Foundations,
    harvest::{CandidateHarvester, HarvestContext, host::HostHarvester, stun::StunHarvester},
    stack::{
        RawMessage, RequestListener, RequestOutcome, StackOptions, StunStack, TransactionEvent,
        Transport, transaction::TransactionId,
    },
};
use ice_agent::codec::{
    Attributes,
    attribute::{Software, XorMappedAddress},
    message::{MessageReader, MessageWriter},
    method::{Kind, Method},
};
use tokio::{net::UdpSocket, time::timeout};

/// A loopback stun server that answers every Binding request with a
/// fixed mapping, dropping the first `drop_count` requests.
async fn mapping_server(mapped: SocketAddr, drop_count: usize) -> Result<SocketAddr> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let local = socket.local_addr()?;

    tokio::spawn(async move {
        let mut buffer = [0u8; 1500];
        let mut seen = 0usize;

        while let Ok((size, from)) = socket.recv_from(&mut buffer).await {
            seen += 1;
            if seen <= drop_count {
                continue;
            }

            let mut attributes = Attributes::default();
            let Ok(request) = MessageReader::decode(&buffer[..size], &mut attributes) else {
                continue;
            };

            if request.method() != Method::Binding(Kind::Request) {
                continue;
            }

            let mut bytes = BytesMut::with_capacity(128);
            let mut writer =
                MessageWriter::extend(Method::Binding(Kind::Response), &request, &mut bytes);
            writer.append::<XorMappedAddress>(mapped);
            writer.append::<Software>("test-server");
            if writer.flush(None).is_ok() {
                let _ = socket.send_to(&bytes, from).await;
            }
        }
    });

    Ok(local)
}

/// Scenario: a stun harvest against a loopback server yields exactly
/// one server reflexive candidate carrying the mapped address.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stun_binding_round_trip() -> Result<()> {
    let mapped: SocketAddr = "192.0.2.4:40000".parse()?;
    let server = mapping_server(mapped, 0).await?;

    let stack = StunStack::new(StackOptions::default());
    let foundations = Arc::new(Foundations::default());

    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let local = stack.register_udp(socket)?;

    let host = ice_agent::Candidate {
        foundation: foundations.assign(ice_agent::CandidateKind::Host, local.ip(), None),
        priority: ice_agent::candidate::priority(ice_agent::CandidateKind::Host, 65535, 1),
        kind: ice_agent::CandidateKind::Host,
        transport: Transport::Udp,
        address: local,
        base: local,
        component: 1,
        relay: None,
    };

    let harvester = StunHarvester::new(server);
    let candidates = harvester
        .harvest(&HarvestContext {
            stack: stack.clone(),
            component: 1,
            hosts: vec![host],
            foundations,
        })
        .await;

    ensure!(candidates.len() == 1);
    ensure!(candidates[0].kind == ice_agent::CandidateKind::ServerReflexive);
    ensure!(candidates[0].address == mapped);
    ensure!(candidates[0].base == local);

    stack.shutdown();
    Ok(())
}

/// Scenario: with Rc=3 and rto=100ms against a black hole the client
/// transmits three times and reports exactly one timeout at the
/// 16 * rto deadline.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retransmit_then_timeout() -> Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));

    let server = UdpSocket::bind("127.0.0.1:0").await?;
    let server_addr = server.local_addr()?;
    {
        let counter = counter.clone();
        tokio::spawn(async move {
            let mut buffer = [0u8; 1500];
            while server.recv_from(&mut buffer).await.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let stack = StunStack::new(StackOptions {
        rto: Duration::from_millis(100),
        max_retransmissions: 3,
        max_wait_interval: 16,
        ..StackOptions::default()
    });

    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let local = stack.register_udp(socket)?;

    let token = TransactionId::random();
    let mut bytes = BytesMut::with_capacity(64);
    MessageWriter::new(Method::Binding(Kind::Request), token.as_bytes(), &mut bytes)
        .flush(None)?;

    let started = tokio::time::Instant::now();
    let (collector, outcome) = RequestOutcome::pair();
    stack.send_request(
        bytes.freeze(),
        server_addr,
        (local, Transport::Udp),
        collector,
    )?;

    let event = timeout(Duration::from_secs(5), outcome.wait()).await?;
    let elapsed = started.elapsed();

    ensure!(matches!(event, TransactionEvent::Timeout));
    ensure!(counter.load(Ordering::SeqCst) == 3);
    // the deadline is 16 * rto = 1.6s; allow generous scheduling slack.
    ensure!(elapsed >= Duration::from_millis(1400));
    ensure!(elapsed <= Duration::from_millis(2500));

    stack.shutdown();
    Ok(())
}

struct EchoOnce {
    invocations: Arc<AtomicUsize>,
}

impl RequestListener for EchoOnce {
    fn on_request(&self, stack: &StunStack, request: &MessageReader, raw: &RawMessage) {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let Ok(id) = TransactionId::try_from(request.token()) else {
            return;
        };

        let mut bytes = BytesMut::with_capacity(128);
        let mut writer =
            MessageWriter::extend(Method::Binding(Kind::Response), request, &mut bytes);
        writer.append::<XorMappedAddress>(raw.from);
        writer.flush(None).unwrap();

        stack
            .send_response(&id, bytes.freeze(), (raw.to, raw.transport), raw.from)
            .unwrap();
    }
}

/// Scenario: a retransmitted request is answered from the response
/// cache byte-identically, and the listener runs exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_transaction_dedup() -> Result<()> {
    let invocations = Arc::new(AtomicUsize::new(0));

    let stack = StunStack::new(StackOptions::default());
    stack.add_request_listener(
        None,
        Arc::new(EchoOnce {
            invocations: invocations.clone(),
        }),
    );

    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let server_addr = stack.register_udp(socket)?;

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client.connect(server_addr).await?;

    let token = TransactionId::random();
    let mut request = BytesMut::with_capacity(64);
    MessageWriter::new(Method::Binding(Kind::Request), token.as_bytes(), &mut request)
        .flush(None)?;

    let mut first = [0u8; 1500];
    client.send(&request).await?;
    let first_len = timeout(Duration::from_secs(1), client.recv(&mut first)).await??;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = [0u8; 1500];
    client.send(&request).await?;
    let second_len = timeout(Duration::from_secs(1), client.recv(&mut second)).await??;

    ensure!(first_len == second_len);
    ensure!(first[..first_len] == second[..second_len]);
    ensure!(invocations.load(Ordering::SeqCst) == 1);

    stack.shutdown();
    Ok(())
}

/// The host harvester refuses to produce nothing: on a machine with
/// no usable non-loopback interface it errors instead of returning an
/// empty set.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_harvest_is_fatal_when_empty() -> Result<()> {
    let stack = StunStack::new(StackOptions::default());
    let foundations = Foundations::default();

    // blocking every address guarantees an empty scan regardless of
    // the machine the test runs on.
    let mut config = ice_agent::config::Harvesting::default();
    config.allowed_addresses = vec!["203.0.113.255".parse()?];

    let harvester = HostHarvester::new(config);
    ensure!(harvester.harvest(&stack, &foundations, 1).await.is_err());

    stack.shutdown();
    Ok(())
}
