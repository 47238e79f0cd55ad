//! The ice agent.
//!
//! Owns the stun stack instance, the media streams with their
//! components and candidates, the credentials of the session and the
//! connectivity check machinery.  Nothing here is global: two agents
//! in one process are fully isolated.

pub mod checklist;

mod checker;

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use rand::{Rng, distr::Alphanumeric};
use stack::{StunStack, credentials::CredentialsAuthority, transaction::TransactionId};
use tokio::sync::{Notify, watch};

use crate::{
    agent::checklist::CheckList,
    candidate::{Candidate, Foundations},
    component::IceMediaStream,
    config::IceConfig,
    harvest::{
        CandidateHarvester, HarvestContext, HarvestManager, host::HostHarvester,
        static_map::StaticMappingHarvester, stun::StunHarvester, turn::TurnHarvester,
    },
};

/// Overall agent progress; transitions are strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Waiting,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controlling,
    Controlled,
}

#[derive(Debug, Clone)]
pub struct RemoteCredentials {
    pub ufrag: String,
    pub password: String,
}

/// A queued immediate check, caused by an inbound Binding request or
/// a role flip.
pub(crate) struct TriggeredCheck {
    pub stream: String,
    pub local_base: SocketAddr,
    pub remote: SocketAddr,
    pub nominate: bool,
}

/// What an in-flight check transaction was probing.
pub(crate) struct CheckTarget {
    pub stream: String,
    pub local_base: SocketAddr,
    pub remote: SocketAddr,
    pub nominating: bool,
    /// the role the request claimed; a 487 only flips the agent if it
    /// still holds this role when the error arrives.
    pub role: Role,
}

pub(crate) struct StreamEntry {
    pub stream: IceMediaStream,
    pub checklist: CheckList,
}

pub(crate) struct AgentInner {
    pub stack: StunStack,
    pub config: IceConfig,
    pub foundations: Arc<Foundations>,
    pub ufrag: String,
    pub password: String,
    pub tie_breaker: u64,
    pub role: Mutex<Role>,
    pub state: watch::Sender<AgentState>,
    pub remote: Mutex<Option<RemoteCredentials>>,
    pub streams: Mutex<Vec<StreamEntry>>,
    pub triggered: Mutex<VecDeque<TriggeredCheck>>,
    pub checks: Mutex<HashMap<TransactionId, CheckTarget>>,
    pub wake: Arc<Notify>,
    registrations: Mutex<Option<(u64, u64)>>,
}

impl AgentInner {
    pub(crate) fn role(&self) -> Role {
        *self.role.lock()
    }

    /// Forward-only state transitions; anything else is ignored.
    pub(crate) fn set_state(&self, next: AgentState) {
        let current = *self.state.borrow();
        let legal = matches!(
            (current, next),
            (AgentState::Waiting, AgentState::Running)
                | (AgentState::Running, AgentState::Completed)
                | (AgentState::Running, AgentState::Failed)
        );

        if legal {
            log::info!("agent state: {current:?} -> {next:?}");
            self.state.send_replace(next);
        }
    }

    /// Every component of every stream has a nominated pair.
    pub(crate) fn check_completion(&self) {
        let streams = self.streams.lock();
        if streams.is_empty() {
            return;
        }

        let complete = streams.iter().all(|entry| {
            entry
                .stream
                .components
                .iter()
                .all(|component| entry.checklist.nominated_for(component.id))
        });

        if complete {
            drop(streams);
            self.set_state(AgentState::Completed);
        }
    }

    /// The agent fails only when every check list has exhausted every
    /// pair.
    pub(crate) fn check_failure(&self) {
        let streams = self.streams.lock();
        if streams.is_empty() {
            return;
        }

        let failed = streams.iter().all(|entry| entry.checklist.all_failed());
        if failed {
            drop(streams);
            self.set_state(AgentState::Failed);
        }
    }
}

/// Maps the agent's own ufrag to its password for inbound check
/// validation.
struct AgentAuthority {
    ufrag: String,
    password: String,
}

impl CredentialsAuthority for AgentAuthority {
    fn key(&self, ufrag: &str) -> Option<Vec<u8>> {
        (ufrag == self.ufrag).then(|| self.password.as_bytes().to_vec())
    }
}

fn random_token(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub struct Agent {
    inner: Arc<AgentInner>,
    harvesters: Vec<Arc<dyn CandidateHarvester>>,
}

impl Agent {
    /// Create an agent with its own stack.  Must run inside a tokio
    /// runtime, the stack spawns its workers immediately.
    pub fn new(config: IceConfig) -> Self {
        let stack = StunStack::new(config.stack_options());
        let (state, _) = watch::channel(AgentState::Waiting);

        // rfc5245: ufrag at least 4 characters, password at least 22,
        // both from a cryptographic source, constant for the lifetime
        // of the agent.
        let ufrag = random_token(8);
        let password = random_token(24);

        let inner = Arc::new(AgentInner {
            tie_breaker: rand::rng().random::<u64>(),
            foundations: Arc::new(Foundations::default()),
            role: Mutex::new(Role::Controlling),
            remote: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
            triggered: Mutex::new(VecDeque::new()),
            checks: Mutex::new(HashMap::new()),
            wake: Arc::new(Notify::new()),
            registrations: Mutex::new(None),
            password: password.clone(),
            ufrag: ufrag.clone(),
            config,
            stack,
            state,
        });

        let authority = inner
            .stack
            .credentials()
            .register(Arc::new(AgentAuthority { ufrag, password }));

        let listener = inner.stack.add_request_listener(
            None,
            Arc::new(checker::CheckResponder {
                agent: Arc::downgrade(&inner),
            }),
        );

        *inner.registrations.lock() = Some((authority, listener));

        let mut harvesters: Vec<Arc<dyn CandidateHarvester>> = Vec::new();
        for server in &inner.config.stun_servers {
            harvesters.push(Arc::new(StunHarvester::new(*server)));
        }

        for turn in &inner.config.turn_servers {
            harvesters.push(Arc::new(TurnHarvester::new(
                turn.server,
                &turn.username,
                &turn.password,
            )));
        }

        for mapping in &inner.config.static_mappings {
            harvesters.push(Arc::new(StaticMappingHarvester::new(Box::new(*mapping))));
        }

        Self { inner, harvesters }
    }

    pub fn stack(&self) -> &StunStack {
        &self.inner.stack
    }

    pub fn local_ufrag(&self) -> &str {
        &self.inner.ufrag
    }

    pub fn local_password(&self) -> &str {
        &self.inner.password
    }

    pub fn tie_breaker(&self) -> u64 {
        self.inner.tie_breaker
    }

    pub fn role(&self) -> Role {
        self.inner.role()
    }

    pub fn set_role(&self, role: Role) {
        *self.inner.role.lock() = role;
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state.borrow()
    }

    /// Watch channel for state transitions, for callers that want to
    /// await completion.
    pub fn state_watch(&self) -> watch::Receiver<AgentState> {
        self.inner.state.subscribe()
    }

    pub fn add_stream(&self, name: &str, components: u16) {
        self.inner.streams.lock().push(StreamEntry {
            stream: IceMediaStream::new(name, components),
            checklist: CheckList::default(),
        });
    }

    pub fn set_remote_credentials(&self, ufrag: &str, password: &str) {
        *self.inner.remote.lock() = Some(RemoteCredentials {
            ufrag: ufrag.to_string(),
            password: password.to_string(),
        });
    }

    /// Attach an externally prepared local candidate, e.g. one backed
    /// by a single-port demultiplexer or a socket the application
    /// bound itself.  The candidate's socket must already be
    /// registered with this agent's stack.
    pub fn add_local_candidate(&self, stream: &str, candidate: Candidate) {
        let mut streams = self.inner.streams.lock();
        let Some(entry) = streams.iter_mut().find(|it| it.stream.name == stream) else {
            log::warn!("local candidate for unknown stream dropped: stream={stream}");
            return;
        };

        let component = candidate.component;
        if let Some(component) = entry.stream.component_mut(component) {
            component.locals.push(candidate);
        }
    }

    pub fn add_remote_candidate(&self, stream: &str, candidate: Candidate) {
        let mut streams = self.inner.streams.lock();
        let Some(entry) = streams.iter_mut().find(|it| it.stream.name == stream) else {
            log::warn!("remote candidate for unknown stream dropped: stream={stream}");
            return;
        };

        let component = candidate.component;
        if let Some(component) = entry.stream.component_mut(component) {
            component.remotes.push(candidate);
        }
    }

    pub fn local_candidates(&self, stream: &str) -> Vec<Candidate> {
        self.inner
            .streams
            .lock()
            .iter()
            .find(|it| it.stream.name == stream)
            .map(|entry| {
                entry
                    .stream
                    .components
                    .iter()
                    .flat_map(|component| component.locals.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Harvest candidates for every component of every stream.
    ///
    /// Host candidates come first and are fatal when absent; the
    /// reflexive and relayed harvesters then run in parallel per
    /// component and merely log their failures.
    pub async fn gather(&self) -> anyhow::Result<()> {
        let host = HostHarvester::new(self.inner.config.harvesting.clone());
        let mut manager = HarvestManager::default();
        for harvester in &self.harvesters {
            manager.add(harvester.clone());
        }

        // collect the component ids first so the streams lock is not
        // held across binds.
        let layout: Vec<(String, Vec<u16>)> = {
            let streams = self.inner.streams.lock();
            streams
                .iter()
                .map(|entry| {
                    (
                        entry.stream.name.clone(),
                        entry.stream.components.iter().map(|it| it.id).collect(),
                    )
                })
                .collect()
        };

        for (stream, components) in layout {
            for component in components {
                let hosts = host
                    .harvest(&self.inner.stack, &self.inner.foundations, component)
                    .await
                    .map_err(|e| anyhow::anyhow!("host harvest failed: {e}"))?;

                let mut candidates = hosts.clone();
                if !manager.is_empty() {
                    candidates.extend(
                        manager
                            .harvest(HarvestContext {
                                stack: self.inner.stack.clone(),
                                foundations: self.inner.foundations.clone(),
                                component,
                                hosts,
                            })
                            .await,
                    );
                }

                let mut streams = self.inner.streams.lock();
                if let Some(entry) = streams.iter_mut().find(|it| it.stream.name == stream) {
                    if let Some(component) = entry.stream.component_mut(component) {
                        component.locals.extend(candidates);
                    }
                }
            }
        }

        Ok(())
    }

    /// Build the check lists and start the pace maker.
    pub fn start_checks(&self) {
        {
            let controlling = self.inner.role() == Role::Controlling;
            let mut streams = self.inner.streams.lock();
            for entry in streams.iter_mut() {
                entry.checklist = CheckList::build(&entry.stream.components, controlling);
                log::info!(
                    "check list built: stream={}, pairs={}",
                    entry.stream.name,
                    entry.checklist.pairs.len()
                );
            }
        }

        self.inner.set_state(AgentState::Running);
        tokio::spawn(checker::pace_maker(Arc::downgrade(&self.inner)));
    }

    /// Nominated pairs per component of a stream, the final word of a
    /// completed session.
    pub fn selected_pairs(&self, stream: &str) -> Vec<checklist::CandidatePair> {
        self.inner
            .streams
            .lock()
            .iter()
            .find(|it| it.stream.name == stream)
            .map(|entry| {
                entry
                    .checklist
                    .pairs
                    .iter()
                    .filter(|pair| pair.nominated)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stack teardown: stop connectors, cancel transactions, expire
    /// server state, release listeners.
    pub fn shutdown(&self) {
        if let Some((authority, listener)) = self.inner.registrations.lock().take() {
            self.inner.stack.credentials().unregister(authority);
            self.inner.stack.remove_request_listener(listener);
        }

        self.inner.stack.shutdown();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown();
    }
}
