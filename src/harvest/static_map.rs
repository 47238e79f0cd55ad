//! Static mapping harvesting.
//!
//! When the public/local address relationship is known out of band
//! (a one-to-one nat in front of a cloud instance, typically), no
//! stun round-trip is needed: every host candidate on the mapped
//! local address gets a server reflexive twin at the public address
//! on the same port.
//!
//! Sources are pluggable through [`StaticMappingSource`].  The aws
//! metadata service is the canonical example: fetch
//! `http://169.254.169.254/latest/meta-data/public-ipv4` and
//! `.../local-ipv4` and feed the pair in; any cloud with a similar
//! endpoint plugs in the same way without touching this harvester.

use std::{io, net::IpAddr};

use async_trait::async_trait;
use stack::Transport;

use crate::{
    candidate::{Candidate, CandidateKind, priority},
    config::StaticMapping,
    harvest::{CandidateHarvester, HarvestContext, HarvesterState},
};

/// Resolves one public/local address pair.
pub trait StaticMappingSource: Send + Sync {
    fn discover(&self) -> io::Result<(IpAddr, IpAddr)>;
}

impl StaticMappingSource for StaticMapping {
    fn discover(&self) -> io::Result<(IpAddr, IpAddr)> {
        Ok((self.public_address, self.local_address))
    }
}

pub struct StaticMappingHarvester {
    source: Box<dyn StaticMappingSource>,
    state: HarvesterState,
}

impl StaticMappingHarvester {
    pub fn new(source: Box<dyn StaticMappingSource>) -> Self {
        Self {
            state: HarvesterState::default(),
            source,
        }
    }
}

#[async_trait]
impl CandidateHarvester for StaticMappingHarvester {
    async fn harvest(&self, ctx: &HarvestContext) -> Vec<Candidate> {
        let (public, local) = match self.source.discover() {
            Ok(mapping) => mapping,
            Err(e) => {
                log::warn!("static mapping discovery failed: err={e}");
                return Vec::new();
            }
        };

        ctx.hosts
            .iter()
            .filter(|host| host.base.ip() == local)
            .map(|host| {
                let mut address = host.base;
                address.set_ip(public);

                Candidate {
                    foundation: ctx.foundations.assign(
                        CandidateKind::ServerReflexive,
                        host.base.ip(),
                        None,
                    ),
                    priority: priority(CandidateKind::ServerReflexive, 65535, ctx.component),
                    kind: CandidateKind::ServerReflexive,
                    transport: Transport::Udp,
                    base: host.base,
                    component: ctx.component,
                    relay: None,
                    address,
                }
            })
            .collect()
    }

    fn name(&self) -> &str {
        "static-mapping"
    }

    fn state(&self) -> &HarvesterState {
        &self.state
    }
}
