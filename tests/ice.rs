//! Two agents negotiating over loopback, including the role conflict
//! path: both start controlling, the tie-breakers sort it out and the
//! session still completes with nominated pairs on both sides.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, ensure};
use ice_agent::{
    Agent, AgentState, Candidate, CandidateKind, IceConfig, Role,
    candidate::priority,
    stack::Transport,
};
use tokio::{net::UdpSocket, time::timeout};

/// Bind a loopback socket on the agent's stack and attach it as a
/// host candidate, sidestepping interface enumeration which is not
/// predictable on a test machine.
async fn attach_loopback_candidate(agent: &Agent, stream: &str) -> Result<Candidate> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let local = agent.stack().register_udp(socket)?;

    let candidate = Candidate {
        foundation: local.port().to_string(),
        priority: priority(CandidateKind::Host, 65535, 1),
        kind: CandidateKind::Host,
        transport: Transport::Udp,
        address: local,
        base: local,
        component: 1,
        relay: None,
    };

    agent.add_local_candidate(stream, candidate.clone());
    Ok(candidate)
}

fn fast_config() -> IceConfig {
    let mut config = IceConfig::default();
    config.transactions.rto = 100;
    config.transactions.max_retransmissions = 3;
    config
}

async fn wait_for_terminal(agent: &Agent) -> Result<AgentState> {
    let mut watch = agent.state_watch();
    timeout(Duration::from_secs(10), async {
        loop {
            let state = *watch.borrow();
            if state == AgentState::Completed || state == AgentState::Failed {
                return state;
            }

            if watch.changed().await.is_err() {
                return *watch.borrow();
            }
        }
    })
    .await
    .map_err(Into::into)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connectivity_with_role_conflict() -> Result<()> {
    let _ = simple_logger::init_with_level(log::Level::Info);

    let left = Agent::new(fast_config());
    let right = Agent::new(fast_config());

    left.add_stream("data", 1);
    right.add_stream("data", 1);

    let left_candidate = attach_loopback_candidate(&left, "data").await?;
    let right_candidate = attach_loopback_candidate(&right, "data").await?;

    // signalling exchange; both sides deliberately claim the
    // controlling role to force the 487 path.
    left.set_role(Role::Controlling);
    right.set_role(Role::Controlling);

    left.set_remote_credentials(right.local_ufrag(), right.local_password());
    right.set_remote_credentials(left.local_ufrag(), left.local_password());

    left.add_remote_candidate("data", right_candidate);
    right.add_remote_candidate("data", left_candidate);

    left.start_checks();
    right.start_checks();

    let left_state = wait_for_terminal(&left).await?;
    let right_state = wait_for_terminal(&right).await?;

    ensure!(left_state == AgentState::Completed, "left agent: {left_state:?}");
    ensure!(right_state == AgentState::Completed, "right agent: {right_state:?}");

    // the conflict resolved into complementary roles.
    ensure!(left.role() != right.role());

    let left_pairs = left.selected_pairs("data");
    let right_pairs = right.selected_pairs("data");
    ensure!(!left_pairs.is_empty());
    ensure!(!right_pairs.is_empty());
    ensure!(left_pairs[0].nominated);
    ensure!(right_pairs[0].nominated);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agent_fails_when_remote_is_dead() -> Result<()> {
    let agent = Agent::new(fast_config());
    agent.add_stream("data", 1);
    attach_loopback_candidate(&agent, "data").await?;

    // a remote candidate nobody answers on.
    let dead = UdpSocket::bind("127.0.0.1:0").await?;
    let dead_addr = dead.local_addr()?;
    drop(dead);

    agent.set_role(Role::Controlling);
    agent.set_remote_credentials("remoteufrag", "remotepasswordremotepass");
    agent.add_remote_candidate(
        "data",
        Candidate {
            foundation: "9".to_string(),
            priority: priority(CandidateKind::Host, 65535, 1),
            kind: CandidateKind::Host,
            transport: Transport::Udp,
            address: dead_addr,
            base: dead_addr,
            component: 1,
            relay: None,
        },
    );

    agent.start_checks();

    let state = wait_for_terminal(&agent).await?;
    ensure!(state == AgentState::Failed, "agent: {state:?}");

    Ok(())
}
