//! Relayed candidate harvesting.
//!
//! Sends an Allocate(udp) per host candidate.  The first attempt is
//! unauthenticated; the 401 challenge feeds the long-term credential
//! session and the request is retried signed.  A success yields a
//! relayed candidate (XOR-RELAYED-ADDRESS) plus a server reflexive
//! one (XOR-MAPPED-ADDRESS); an allocation-capacity failure falls
//! back to a plain Binding request for the reflexive mapping alone.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use codec::{
    Decoder,
    attribute::{
        ErrKind, ErrorCode, Lifetime, RequestedTransport, XorMappedAddress, XorRelayedAddress,
    },
    message::MessageWriter,
    method::{Kind, Method},
};
use stack::{
    RequestOutcome, Transport, TransactionEvent, credentials::LongTermSession,
    transaction::TransactionId,
};

use crate::{
    candidate::{Candidate, CandidateKind, priority},
    harvest::{CandidateHarvester, HarvestContext, HarvesterState},
    relay::RelayedSocket,
};

/// udp protocol number for REQUESTED-TRANSPORT.
const TRANSPORT_UDP: u8 = 17;

struct Allocation {
    relayed: SocketAddr,
    mapped: Option<SocketAddr>,
    lifetime: u32,
    session: LongTermSession,
}

enum AllocateOutcome {
    Allocated(Allocation),
    /// the server cannot host the allocation; a reflexive-only
    /// fallback may still be worthwhile.
    Exhausted,
    Failed,
}

pub struct TurnHarvester {
    server: SocketAddr,
    username: String,
    password: String,
    state: HarvesterState,
}

impl TurnHarvester {
    pub fn new(server: SocketAddr, username: &str, password: &str) -> Self {
        Self {
            state: HarvesterState::default(),
            username: username.to_string(),
            password: password.to_string(),
            server,
        }
    }

    async fn allocate(&self, ctx: &HarvestContext, host: &Candidate) -> AllocateOutcome {
        let mut session = LongTermSession::new(&self.username, &self.password);

        // at most two transmissions: the unauthenticated probe and the
        // authenticated retry after the challenge.
        for _ in 0..2 {
            let mut bytes = BytesMut::with_capacity(256);
            {
                let token = TransactionId::random();
                let mut writer = MessageWriter::new(
                    Method::Allocate(Kind::Request),
                    token.as_bytes(),
                    &mut bytes,
                );

                writer.append::<RequestedTransport>(TRANSPORT_UDP);
                session.apply(&mut writer);
                if writer
                    .flush(session.key().as_ref().map(|it| it.as_slice()))
                    .is_err()
                {
                    return AllocateOutcome::Failed;
                }
            }

            let (collector, outcome) = RequestOutcome::pair();
            if ctx
                .stack
                .send_request(
                    bytes.freeze(),
                    self.server,
                    (host.base, Transport::Udp),
                    collector,
                )
                .is_err()
            {
                return AllocateOutcome::Failed;
            }

            let response = match outcome.wait().await {
                TransactionEvent::Response { bytes, .. } => bytes,
                event => {
                    log::warn!(
                        "turn allocate gave no answer: server={}, base={}, event={event:?}",
                        self.server,
                        host.base
                    );

                    return AllocateOutcome::Failed;
                }
            };

            let mut decoder = Decoder::default();
            let Ok(message) = decoder.decode(&response) else {
                return AllocateOutcome::Failed;
            };

            match message.method() {
                Method::Allocate(Kind::Response) => {
                    let Some(relayed) = message.get::<XorRelayedAddress>() else {
                        return AllocateOutcome::Failed;
                    };

                    return AllocateOutcome::Allocated(Allocation {
                        mapped: message.get::<XorMappedAddress>(),
                        lifetime: message.get::<Lifetime>().unwrap_or(600),
                        session,
                        relayed,
                    });
                }
                Method::Allocate(Kind::Error) => {
                    let code = message.get::<ErrorCode>().map(|it| it.kind());
                    match code {
                        Some(Some(ErrKind::InsufficientCapacity))
                        | Some(Some(ErrKind::AllocationQuotaReached)) => {
                            return AllocateOutcome::Exhausted;
                        }
                        _ => {
                            if !session.challenge(&message) {
                                log::warn!(
                                    "turn allocate rejected: server={}, code={:?}",
                                    self.server,
                                    message.get::<ErrorCode>().map(|it| it.code)
                                );

                                return AllocateOutcome::Failed;
                            }

                            // loop once more with credentials applied.
                        }
                    }
                }
                _ => return AllocateOutcome::Failed,
            }
        }

        AllocateOutcome::Failed
    }

    /// 508-path fallback: at least learn the reflexive mapping the
    /// turn server sees.
    async fn binding_fallback(&self, ctx: &HarvestContext, host: &Candidate) -> Option<SocketAddr> {
        let token = TransactionId::random();
        let mut bytes = BytesMut::with_capacity(128);

        {
            let mut writer =
                MessageWriter::new(Method::Binding(Kind::Request), token.as_bytes(), &mut bytes);
            writer.flush(None).ok()?;
        }

        let (collector, outcome) = RequestOutcome::pair();
        ctx.stack
            .send_request(
                bytes.freeze(),
                self.server,
                (host.base, Transport::Udp),
                collector,
            )
            .ok()?;

        match outcome.wait().await {
            TransactionEvent::Response { bytes, .. } => {
                let mut decoder = Decoder::default();
                let message = decoder.decode(&bytes).ok()?;
                (message.method() == Method::Binding(Kind::Response))
                    .then(|| message.get::<XorMappedAddress>())
                    .flatten()
            }
            _ => None,
        }
    }

    fn reflexive_candidate(
        &self,
        ctx: &HarvestContext,
        host: &Candidate,
        mapped: SocketAddr,
    ) -> Option<Candidate> {
        if mapped == host.base {
            return None;
        }

        Some(Candidate {
            foundation: ctx.foundations.assign(
                CandidateKind::ServerReflexive,
                host.base.ip(),
                Some(self.server),
            ),
            priority: priority(CandidateKind::ServerReflexive, 65535, ctx.component),
            kind: CandidateKind::ServerReflexive,
            transport: Transport::Udp,
            address: mapped,
            base: host.base,
            component: ctx.component,
            relay: None,
        })
    }
}

#[async_trait]
impl CandidateHarvester for TurnHarvester {
    async fn harvest(&self, ctx: &HarvestContext) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        for host in &ctx.hosts {
            if host.transport != Transport::Udp || !host.can_reach(&self.server) {
                continue;
            }

            match self.allocate(ctx, host).await {
                AllocateOutcome::Allocated(allocation) => {
                    log::info!(
                        "turn allocation ready: relayed={}, base={}, lifetime={}",
                        allocation.relayed,
                        host.base,
                        allocation.lifetime
                    );

                    let relay = RelayedSocket::new(
                        ctx.stack.clone(),
                        self.server,
                        host.base,
                        allocation.relayed,
                        allocation.session,
                        allocation.lifetime,
                    );

                    candidates.push(Candidate {
                        foundation: ctx.foundations.assign(
                            CandidateKind::Relayed,
                            host.base.ip(),
                            Some(self.server),
                        ),
                        priority: priority(CandidateKind::Relayed, 65535, ctx.component),
                        kind: CandidateKind::Relayed,
                        transport: Transport::Udp,
                        address: allocation.relayed,
                        base: allocation.relayed,
                        component: ctx.component,
                        relay: Some(relay),
                    });

                    if let Some(candidate) = allocation
                        .mapped
                        .and_then(|mapped| self.reflexive_candidate(ctx, host, mapped))
                    {
                        candidates.push(candidate);
                    }
                }
                AllocateOutcome::Exhausted => {
                    if let Some(candidate) = self
                        .binding_fallback(ctx, host)
                        .await
                        .and_then(|mapped| self.reflexive_candidate(ctx, host, mapped))
                    {
                        candidates.push(candidate);
                    }
                }
                AllocateOutcome::Failed => {}
            }
        }

        candidates
    }

    fn name(&self) -> &str {
        "turn"
    }

    fn state(&self) -> &HarvesterState {
        &self.state
    }
}
