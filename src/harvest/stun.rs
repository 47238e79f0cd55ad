//! Server reflexive harvesting.
//!
//! One Binding request per host candidate to the configured stun
//! server; a success response's XOR-MAPPED-ADDRESS becomes a server
//! reflexive candidate based on that host candidate.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use codec::{
    Decoder,
    attribute::{MappedAddress, XorMappedAddress},
    message::MessageWriter,
    method::{Kind, Method},
};
use stack::{RequestOutcome, Transport, TransactionEvent, transaction::TransactionId};

use crate::{
    candidate::{Candidate, CandidateKind, priority},
    harvest::{CandidateHarvester, HarvestContext, HarvesterState},
};

pub struct StunHarvester {
    server: SocketAddr,
    state: HarvesterState,
}

impl StunHarvester {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            state: HarvesterState::default(),
            server,
        }
    }

    async fn resolve(&self, ctx: &HarvestContext, host: &Candidate) -> Option<SocketAddr> {
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
                if message.method() != Method::Binding(Kind::Response) {
                    return None;
                }

                message
                    .get::<XorMappedAddress>()
                    .or_else(|| message.get::<MappedAddress>())
            }
            event => {
                log::warn!(
                    "stun harvest gave no mapping: server={}, base={}, event={event:?}",
                    self.server,
                    host.base
                );

                None
            }
        }
    }
}

#[async_trait]
impl CandidateHarvester for StunHarvester {
    async fn harvest(&self, ctx: &HarvestContext) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        for host in &ctx.hosts {
            if host.transport != Transport::Udp || !host.can_reach(&self.server) {
                continue;
            }

            let Some(mapped) = self.resolve(ctx, host).await else {
                continue;
            };

            // A mapping identical to the base means no nat on the
            // path, the host candidate already covers it.
            if mapped == host.base {
                continue;
            }

            candidates.push(Candidate {
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
            });
        }

        candidates
    }

    fn name(&self) -> &str {
        "stun"
    }

    fn state(&self) -> &HarvesterState {
        &self.state
    }
}
