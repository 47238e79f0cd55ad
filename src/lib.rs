//! ## Interactive Connectivity Establishment (ICE)
//!
//! [RFC5245]: https://tools.ietf.org/html/rfc5245
//! [RFC5389]: https://tools.ietf.org/html/rfc5389
//! [RFC5766]: https://tools.ietf.org/html/rfc5766
//!
//! An embeddable ice agent: candidate harvesting over every usable
//! interface, server reflexive and relayed candidates through stun
//! and turn servers, and rfc5245 connectivity checks over the
//! gathered pairs, all on top of a per-agent stun stack.
//!
//! The crate splits along the protocol layers.  `ice-agent-codec`
//! holds the wire format, `ice-agent-stack` the transaction and
//! dispatch machinery and this crate the ice semantics: candidates,
//! harvesters, the turn client relay and the agent itself.
//!
//! ```no_run
//! use ice_agent::{Agent, IceConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let agent = Agent::new(IceConfig::from_env());
//! agent.add_stream("audio", 1);
//! agent.gather().await?;
//!
//! // exchange ufrag/password and candidates through signalling,
//! // then:
//! agent.start_checks();
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod candidate;
pub mod component;
pub mod config;
pub mod harvest;
pub mod relay;

#[rustfmt::skip]
pub static SOFTWARE: &str = concat!(
    "ice-agent.",
    env!("CARGO_PKG_VERSION")
);

pub use crate::{
    agent::{Agent, AgentState, RemoteCredentials, Role},
    candidate::{Candidate, CandidateKind},
    component::{Component, IceMediaStream},
    config::IceConfig,
    relay::RelayedSocket,
};

pub use codec;
pub use stack;
