//! Configuration surface.
//!
//! No cli and no config file: the agent is embedded, so the host
//! application builds an [`IceConfig`] (every struct derives serde for
//! applications that want to splice it into their own config tree)
//! or loads the overridable knobs from the environment.

use std::{env, net::IpAddr, net::SocketAddr, str::FromStr, time::Duration};

use serde::Deserialize;

/// Host harvesting knobs.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Harvesting {
    /// attempts when scanning a port range for a free port.
    #[serde(default = "Harvesting::bind_retries")]
    pub bind_retries: u32,
    /// lowest port the host harvester may bind.
    #[serde(default = "Harvesting::min_port")]
    pub min_port: u16,
    /// highest port the host harvester may bind.
    #[serde(default = "Harvesting::max_port")]
    pub max_port: u16,
    /// first port to try; 0 picks a random port in range.
    #[serde(default)]
    pub preferred_port: u16,
    /// bind only these addresses when non-empty.
    #[serde(default)]
    pub allowed_addresses: Vec<IpAddr>,
    /// never bind these addresses.
    #[serde(default)]
    pub blocked_addresses: Vec<IpAddr>,
    #[serde(default)]
    pub disable_ipv6: bool,
    #[serde(default)]
    pub disable_link_local_addresses: bool,
}

impl Harvesting {
    fn bind_retries() -> u32 {
        50
    }

    fn min_port() -> u16 {
        49152
    }

    fn max_port() -> u16 {
        65535
    }
}

impl Default for Harvesting {
    fn default() -> Self {
        Self {
            bind_retries: Self::bind_retries(),
            min_port: Self::min_port(),
            max_port: Self::max_port(),
            preferred_port: 0,
            allowed_addresses: Vec::new(),
            blocked_addresses: Vec::new(),
            disable_ipv6: false,
            disable_link_local_addresses: false,
        }
    }
}

/// Transaction layer tuning, rfc5389 section 7.2.1.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Transactions {
    /// initial retransmission timeout in milliseconds.
    #[serde(default = "Transactions::rto")]
    pub rto: u64,
    /// maximum number of request transmissions (Rc).
    #[serde(default = "Transactions::max_retransmissions")]
    pub max_retransmissions: u32,
    /// total transaction lifetime in units of rto (Rm).
    #[serde(default = "Transactions::max_wait_interval")]
    pub max_wait_interval: u32,
    #[serde(default)]
    pub require_message_integrity: bool,
    /// whether a deduplicated request retransmit should still reach
    /// request listeners.
    #[serde(default)]
    pub propagate_received_retransmissions: bool,
    /// raw message queue capacity.
    #[serde(default = "Transactions::queue_capacity")]
    pub queue_capacity: usize,
    /// decode/dispatch worker count.
    #[serde(default = "Transactions::workers")]
    pub workers: usize,
}

impl Transactions {
    fn rto() -> u64 {
        500
    }

    fn max_retransmissions() -> u32 {
        7
    }

    fn max_wait_interval() -> u32 {
        16
    }

    fn queue_capacity() -> usize {
        512
    }

    fn workers() -> usize {
        3
    }
}

impl Default for Transactions {
    fn default() -> Self {
        Self {
            rto: Self::rto(),
            max_retransmissions: Self::max_retransmissions(),
            max_wait_interval: Self::max_wait_interval(),
            require_message_integrity: false,
            propagate_received_retransmissions: false,
            queue_capacity: Self::queue_capacity(),
            workers: Self::workers(),
        }
    }
}

/// A turn server plus the long-term credentials for it.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct TurnServer {
    pub server: SocketAddr,
    pub username: String,
    pub password: String,
}

/// A pre-resolved public/local address pair for the static mapping
/// harvester.
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct StaticMapping {
    pub public_address: IpAddr,
    pub local_address: IpAddr,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct IceConfig {
    #[serde(default)]
    pub harvesting: Harvesting,
    #[serde(default)]
    pub transactions: Transactions,
    /// stun servers queried for server reflexive candidates.
    #[serde(default)]
    pub stun_servers: Vec<SocketAddr>,
    /// turn servers queried for relayed candidates.
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
    /// static public/local mappings, e.g. from cloud metadata.
    #[serde(default)]
    pub static_mappings: Vec<StaticMapping>,
    /// connectivity check pacing in milliseconds (Ta).
    #[serde(default = "IceConfig::ta")]
    pub ta: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            harvesting: Harvesting::default(),
            transactions: Transactions::default(),
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            static_mappings: Vec::new(),
            ta: Self::ta(),
        }
    }
}

impl IceConfig {
    fn ta() -> u64 {
        20
    }

    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.transactions.rto)
    }

    pub fn pace_interval(&self) -> Duration {
        Duration::from_millis(self.ta.max(1))
    }

    /// Environment overrides for the tuning knobs, applied on top of
    /// the defaults.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `BIND_RETRIES` | `harvesting.bind_retries` |
    /// | `MIN_PORT` / `MAX_PORT` | `harvesting.{min,max}_port` |
    /// | `ALLOWED_ADDRESSES` / `BLOCKED_ADDRESSES` | comma separated ip lists |
    /// | `DISABLE_IPV6` | `harvesting.disable_ipv6` |
    /// | `DISABLE_LINK_LOCAL_ADDRESSES` | `harvesting.disable_link_local_addresses` |
    /// | `MAX_RETRANSMISSIONS` | `transactions.max_retransmissions` |
    /// | `MAX_WAIT_INTERVAL` | `transactions.max_wait_interval` |
    /// | `REQUIRE_MESSAGE_INTEGRITY` | `transactions.require_message_integrity` |
    /// | `PROPAGATE_RECEIVED_RETRANSMISSIONS` | `transactions.propagate_received_retransmissions` |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        read_env("BIND_RETRIES", &mut config.harvesting.bind_retries);
        read_env("MIN_PORT", &mut config.harvesting.min_port);
        read_env("MAX_PORT", &mut config.harvesting.max_port);
        read_env("PREFERRED_PORT", &mut config.harvesting.preferred_port);
        read_env("DISABLE_IPV6", &mut config.harvesting.disable_ipv6);
        read_env(
            "DISABLE_LINK_LOCAL_ADDRESSES",
            &mut config.harvesting.disable_link_local_addresses,
        );
        read_env_list("ALLOWED_ADDRESSES", &mut config.harvesting.allowed_addresses);
        read_env_list("BLOCKED_ADDRESSES", &mut config.harvesting.blocked_addresses);

        read_env("RTO", &mut config.transactions.rto);
        read_env(
            "MAX_RETRANSMISSIONS",
            &mut config.transactions.max_retransmissions,
        );
        read_env(
            "MAX_WAIT_INTERVAL",
            &mut config.transactions.max_wait_interval,
        );
        read_env(
            "REQUIRE_MESSAGE_INTEGRITY",
            &mut config.transactions.require_message_integrity,
        );
        read_env(
            "PROPAGATE_RECEIVED_RETRANSMISSIONS",
            &mut config.transactions.propagate_received_retransmissions,
        );

        config
    }

    pub(crate) fn stack_options(&self) -> stack::StackOptions {
        stack::StackOptions {
            rto: self.rto(),
            max_retransmissions: self.transactions.max_retransmissions,
            max_wait_interval: self.transactions.max_wait_interval,
            queue_capacity: self.transactions.queue_capacity,
            workers: self.transactions.workers,
            require_message_integrity: self.transactions.require_message_integrity,
            propagate_received_retransmissions: self
                .transactions
                .propagate_received_retransmissions,
            software: crate::SOFTWARE.to_string(),
        }
    }
}

fn read_env<T: FromStr>(name: &str, value: &mut T) {
    if let Ok(raw) = env::var(name) {
        if let Ok(parsed) = raw.parse() {
            *value = parsed;
        } else {
            log::warn!("ignoring unparsable environment override: name={name}, value={raw}");
        }
    }
}

fn read_env_list(name: &str, value: &mut Vec<IpAddr>) {
    if let Ok(raw) = env::var(name) {
        *value = raw
            .split(',')
            .filter_map(|it| it.trim().parse().ok())
            .collect();
    }
}
