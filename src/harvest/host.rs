//! Host candidate harvesting.
//!
//! Walks the machine's network interfaces, binds one udp socket per
//! usable address inside the configured port range and registers each
//! socket with the stack so connectivity checks can be demultiplexed
//! on it.  A single address failing to bind is logged and skipped; a
//! component that ends up with no host candidate at all is dead, which
//! the caller treats as fatal.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use stack::{StunStack, Transport};
use tokio::net::UdpSocket;

use crate::{
    candidate::{Candidate, CandidateKind, Foundations, priority},
    config::Harvesting,
};

#[derive(Debug)]
pub enum BindError {
    NoUsableInterface,
    PortRangeExhausted,
    Io(std::io::Error),
}

impl std::error::Error for BindError {}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub struct HostHarvester {
    config: Harvesting,
}

impl HostHarvester {
    pub fn new(config: Harvesting) -> Self {
        Self { config }
    }

    /// Bind host candidates for one component and register their
    /// sockets with the stack.
    pub async fn harvest(
        &self,
        stack: &StunStack,
        foundations: &Foundations,
        component: u16,
    ) -> Result<Vec<Candidate>, BindError> {
        let addresses = self.usable_addresses()?;
        let mut candidates = Vec::with_capacity(addresses.len());

        // Later interfaces get a slightly lower local preference so
        // enumeration order breaks priority ties deterministically.
        for (index, ip) in addresses.iter().enumerate() {
            let socket = match self.bind_in_range(*ip).await {
                Ok(socket) => socket,
                Err(e) => {
                    log::warn!("host candidate bind failed: ip={ip}, err={e}");
                    continue;
                }
            };

            let local = match stack.register_udp(socket) {
                Ok(local) => local,
                Err(e) => {
                    log::warn!("host candidate register failed: ip={ip}, err={e}");
                    continue;
                }
            };

            let local_preference = 65535 - index as u16;
            log::info!("host candidate bound: addr={local}, component={component}");

            candidates.push(Candidate {
                foundation: foundations.assign(CandidateKind::Host, local.ip(), None),
                priority: priority(CandidateKind::Host, local_preference, component),
                kind: CandidateKind::Host,
                transport: Transport::Udp,
                address: local,
                base: local,
                component,
                relay: None,
            });
        }

        if candidates.is_empty() {
            return Err(BindError::NoUsableInterface);
        }

        Ok(candidates)
    }

    /// Interface addresses that pass the allow/block lists and the
    /// family switches.  Loopback is always excluded.
    fn usable_addresses(&self) -> Result<Vec<IpAddr>, BindError> {
        let interfaces = local_ip_address::list_afinet_netifas().map_err(|e| {
            log::error!("interface enumeration failed: err={e}");
            BindError::NoUsableInterface
        })?;

        let config = &self.config;
        let addresses: Vec<IpAddr> = interfaces
            .into_iter()
            .map(|(_, ip)| ip)
            .filter(|ip| !ip.is_loopback())
            .filter(|ip| !(config.disable_ipv6 && ip.is_ipv6()))
            .filter(|ip| {
                if !config.disable_link_local_addresses {
                    return true;
                }

                match ip {
                    IpAddr::V4(v4) => !v4.is_link_local(),
                    IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
                }
            })
            .filter(|ip| config.allowed_addresses.is_empty() || config.allowed_addresses.contains(ip))
            .filter(|ip| !config.blocked_addresses.contains(ip))
            .collect();

        if addresses.is_empty() {
            return Err(BindError::NoUsableInterface);
        }

        Ok(addresses)
    }

    /// Port range scan: start from the preferred port (or a random
    /// one) and rotate through the range until a bind sticks or the
    /// retry budget runs out.
    async fn bind_in_range(&self, ip: IpAddr) -> Result<Arc<UdpSocket>, BindError> {
        let config = &self.config;
        let (min, max) = (config.min_port, config.max_port.max(config.min_port));
        let span = (max - min) as u32 + 1;

        let mut port = if config.preferred_port >= min && config.preferred_port <= max {
            config.preferred_port
        } else {
            min + (rand::random::<u32>() % span) as u16
        };

        let mut last = None;
        for _ in 0..config.bind_retries.max(1) {
            match UdpSocket::bind(SocketAddr::new(ip, port)).await {
                Ok(socket) => return Ok(Arc::new(socket)),
                Err(e) => {
                    log::debug!("port busy, rotating: ip={ip}, port={port}, err={e}");
                    last = Some(e);
                }
            }

            port = if port >= max { min } else { port + 1 };
        }

        Err(last.map(BindError::Io).unwrap_or(BindError::PortRangeExhausted))
    }
}
