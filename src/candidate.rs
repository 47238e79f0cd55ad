//! Candidate model.
//!
//! A candidate is a transport address a component can potentially use
//! to exchange media: a locally bound address (host), an address
//! observed by a stun server (server reflexive), an address learned
//! from an inbound connectivity check (peer reflexive), or an address
//! allocated on a turn server (relayed).
//!
//! The component owns its candidates; the sockets behind host
//! candidates are registered with the agent's stack and die with the
//! component.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use stack::Transport;

use crate::relay::RelayedSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    PeerReflexive,
    ServerReflexive,
    Relayed,
}

impl CandidateKind {
    /// rfc5245 section 4.1.2.2 recommended type preferences.
    pub fn preference(&self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relayed => 0,
        }
    }
}

impl std::fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::PeerReflexive => "prflx",
            Self::ServerReflexive => "srflx",
            Self::Relayed => "relay",
        })
    }
}

/// rfc5245 section 4.1.2.1:
///
/// > priority = (2^24) * (type preference) +
/// >            (2^8)  * (local preference) +
/// >            (2^0)  * (256 - component ID)
pub fn priority(kind: CandidateKind, local_preference: u16, component: u16) -> u32 {
    (kind.preference() << 24)
        + ((local_preference as u32) << 8)
        + (256 - component.min(256) as u32)
}

#[derive(Clone)]
pub struct Candidate {
    /// the transport address the remote side would send to.
    pub address: SocketAddr,
    /// the host address whose socket actually carries the traffic.
    pub base: SocketAddr,
    pub kind: CandidateKind,
    pub transport: Transport,
    pub priority: u32,
    pub foundation: String,
    pub component: u16,
    /// the relayed view carrying this candidate's traffic, present on
    /// relayed candidates only.
    pub relay: Option<Arc<RelayedSocket>>,
}

impl Candidate {
    /// Whether this candidate could exchange packets with the other
    /// one: same address family, and a link-local address never talks
    /// to a routable one.
    pub fn can_reach(&self, other: &SocketAddr) -> bool {
        if self.address.is_ipv4() != other.is_ipv4() {
            return false;
        }

        match (self.address.ip(), other.ip()) {
            (IpAddr::V4(a), IpAddr::V4(b)) => a.is_link_local() == b.is_link_local(),
            _ => true,
        }
    }
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {:?} addr={} base={} priority={}",
            self.foundation, self.kind, self.transport, self.address, self.base, self.priority
        )
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.address)
    }
}

/// Foundation registry.
///
/// Candidates sharing type, base address and server get the same
/// foundation string; the freezing algorithm groups check list pairs
/// by it.  Assignment is an incrementing integer per distinct triple.
#[derive(Default)]
pub struct Foundations {
    table: Mutex<(HashMap<(CandidateKind, IpAddr, Option<SocketAddr>), u32>, u32)>,
}

impl Foundations {
    pub fn assign(
        &self,
        kind: CandidateKind,
        base: IpAddr,
        server: Option<SocketAddr>,
    ) -> String {
        let mut table = self.table.lock();
        match table.0.get(&(kind, base, server)) {
            Some(existing) => existing.to_string(),
            None => {
                table.1 += 1;
                let next = table.1;
                table.0.insert((kind, base, server), next);
                next.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_formula() {
        // rfc5245 examples: a host candidate of the first component at
        // maximum local preference.
        assert_eq!(priority(CandidateKind::Host, 65535, 1), 2130706431);
        assert!(
            priority(CandidateKind::Host, 0, 1) > priority(CandidateKind::ServerReflexive, 65535, 1)
        );
        assert!(
            priority(CandidateKind::ServerReflexive, 0, 1)
                > priority(CandidateKind::Relayed, 65535, 1)
        );
        // second component ranks just below the first.
        assert_eq!(
            priority(CandidateKind::Host, 100, 1) - priority(CandidateKind::Host, 100, 2),
            1
        );
    }

    #[test]
    fn foundations_group_by_type_base_server() {
        let foundations = Foundations::default();
        let base: IpAddr = "192.168.0.10".parse().unwrap();
        let other: IpAddr = "10.0.0.1".parse().unwrap();
        let server: SocketAddr = "203.0.113.1:3478".parse().unwrap();

        let a = foundations.assign(CandidateKind::Host, base, None);
        let b = foundations.assign(CandidateKind::Host, base, None);
        let c = foundations.assign(CandidateKind::Host, other, None);
        let d = foundations.assign(CandidateKind::ServerReflexive, base, Some(server));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn link_local_does_not_cross() {
        let link_local = Candidate {
            address: "169.254.10.1:5000".parse().unwrap(),
            base: "169.254.10.1:5000".parse().unwrap(),
            kind: CandidateKind::Host,
            transport: Transport::Udp,
            priority: 1,
            foundation: "1".to_string(),
            component: 1,
            relay: None,
        };

        assert!(!link_local.can_reach(&"8.8.8.8:5000".parse().unwrap()));
        assert!(link_local.can_reach(&"169.254.10.2:5000".parse().unwrap()));
        assert!(!link_local.can_reach(&"[::1]:5000".parse().unwrap()));
    }
}
