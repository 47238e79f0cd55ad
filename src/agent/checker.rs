//! Connectivity checking.
//!
//! The pace maker issues one Binding check per tick, preferring
//! triggered checks over the ordered walk of the check lists.  The
//! responder half answers inbound checks: credential validation has
//! already happened in the stack, so what is left is role conflict
//! resolution, peer reflexive discovery, triggered check scheduling
//! and the 200 with the reflected transport address.

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use bytes::{Bytes, BytesMut};
use codec::{
    Decoder,
    attribute::{
        ErrKind, ErrorCode, IceControlled, IceControlling, Priority, Software, UseCandidate,
        UserName, XorMappedAddress,
    },
    message::{MessageReader, MessageWriter},
    method::{Kind, Method},
};
use stack::{
    RawMessage, RequestListener, StunStack, Transport,
    transaction::{TransactionId, client::ResponseCollector},
};

use crate::{
    agent::{
        AgentInner, AgentState, CheckTarget, Role, TriggeredCheck,
        checklist::{PairState, pair_priority},
    },
    candidate::{Candidate, CandidateKind, priority as candidate_priority},
};

/// One check about to be issued.
struct CheckSpec {
    stream: String,
    local_base: SocketAddr,
    remote: SocketAddr,
    component: u16,
    transport: Transport,
    nominate: bool,
}

/// Periodic check driver.
///
/// Wakes every `Ta * active check lists`, or immediately when a
/// triggered check lands in the queue.
pub(crate) async fn pace_maker(agent: Weak<AgentInner>) {
    loop {
        let Some(inner) = agent.upgrade() else {
            break;
        };

        if *inner.state.borrow() != AgentState::Running {
            break;
        }

        if let Some(spec) = next_check(&inner) {
            issue_check(&inner, spec);
        }

        let active = inner
            .streams
            .lock()
            .iter()
            .filter(|entry| entry.checklist.has_active_work())
            .count();

        if active == 0 {
            inner.check_completion();
            inner.check_failure();
        }

        let wake = inner.wake.clone();
        let interval = inner.config.pace_interval() * active.max(1) as u32;
        drop(inner);

        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }

    log::debug!("pace maker stopped");
}

/// Pick the next pair to probe: the triggered queue first, then the
/// highest-priority waiting pair, then an unfreeze.
fn next_check(inner: &Arc<AgentInner>) -> Option<CheckSpec> {
    loop {
        let triggered = inner.triggered.lock().pop_front();
        let Some(check) = triggered else {
            break;
        };

        let mut streams = inner.streams.lock();
        let Some(entry) = streams
            .iter_mut()
            .find(|it| it.stream.name == check.stream)
        else {
            continue;
        };

        let Some(pair) = entry.checklist.find(&check.local_base, &check.remote) else {
            continue;
        };

        // a pair already being probed keeps its in-flight check; a
        // nominating re-check of a succeeded pair is the exception
        // that goes out again.
        if pair.state == PairState::InProgress || (pair.state == PairState::Succeeded && !check.nominate) {
            continue;
        }

        if check.nominate {
            pair.nominating = true;
        }

        pair.state = PairState::InProgress;
        return Some(CheckSpec {
            stream: check.stream,
            local_base: check.local_base,
            remote: check.remote,
            component: pair.component(),
            transport: pair.local.transport,
            nominate: check.nominate,
        });
    }

    let mut streams = inner.streams.lock();
    for entry in streams.iter_mut() {
        let name = entry.stream.name.clone();
        if let Some(pair) = entry.checklist.next_waiting() {
            pair.state = PairState::InProgress;
            return Some(CheckSpec {
                local_base: pair.local.base,
                remote: pair.remote.address,
                component: pair.component(),
                transport: pair.local.transport,
                nominate: false,
                stream: name,
            });
        }
    }

    for entry in streams.iter_mut() {
        let name = entry.stream.name.clone();
        if entry.checklist.unfreeze_next() {
            if let Some(pair) = entry.checklist.next_waiting() {
                pair.state = PairState::InProgress;
                return Some(CheckSpec {
                    local_base: pair.local.base,
                    remote: pair.remote.address,
                    component: pair.component(),
                    transport: pair.local.transport,
                    nominate: false,
                    stream: name,
                });
            }
        }
    }

    None
}

/// Build and send one Binding check for a pair.
fn issue_check(inner: &Arc<AgentInner>, spec: CheckSpec) {
    let Some(remote) = inner.remote.lock().clone() else {
        log::warn!("check without remote credentials dropped: stream={}", spec.stream);
        fail_pair(inner, &spec.stream, &spec.local_base, &spec.remote);
        return;
    };

    let role = inner.role();
    let token = TransactionId::random();
    let mut bytes = BytesMut::with_capacity(256);

    {
        let mut writer =
            MessageWriter::new(Method::Binding(Kind::Request), token.as_bytes(), &mut bytes);

        // the username names the receiver's fragment first.
        let username = format!("{}:{}", remote.ufrag, inner.ufrag);
        writer.append::<UserName>(&username);
        writer.append::<Priority>(candidate_priority(
            CandidateKind::PeerReflexive,
            65535,
            spec.component,
        ));

        match role {
            Role::Controlling => writer.append::<IceControlling>(inner.tie_breaker),
            Role::Controlled => writer.append::<IceControlled>(inner.tie_breaker),
        }

        if spec.nominate && role == Role::Controlling {
            writer.append::<UseCandidate>(());
        }

        if writer.flush(Some(remote.password.as_bytes())).is_err() {
            fail_pair(inner, &spec.stream, &spec.local_base, &spec.remote);
            return;
        }
    }

    // the target is registered before the send so a fast response on
    // a worker cannot miss it.
    inner.checks.lock().insert(
        token,
        CheckTarget {
            stream: spec.stream.clone(),
            local_base: spec.local_base,
            remote: spec.remote,
            nominating: spec.nominate,
            role,
        },
    );

    let collector = Arc::new(CheckCollector {
        agent: Arc::downgrade(inner),
    });

    if let Err(e) = inner.stack.send_request(
        bytes.freeze(),
        spec.remote,
        (spec.local_base, spec.transport),
        collector,
    ) {
        log::warn!(
            "check send failed: local={}, remote={}, err={e}",
            spec.local_base,
            spec.remote
        );

        inner.checks.lock().remove(&token);
        fail_pair(inner, &spec.stream, &spec.local_base, &spec.remote);
        return;
    }

    log::debug!(
        "check issued: stream={}, local={}, remote={}, nominate={}",
        spec.stream,
        spec.local_base,
        spec.remote,
        spec.nominate
    );
}

fn fail_pair(inner: &AgentInner, stream: &str, local_base: &SocketAddr, remote: &SocketAddr) {
    {
        let mut streams = inner.streams.lock();
        if let Some(entry) = streams.iter_mut().find(|it| it.stream.name == stream) {
            if let Some(pair) = entry.checklist.find(local_base, remote) {
                pair.state = PairState::Failed;
                log::info!("pair failed: {pair:?}");
            }
        }
    }

    inner.check_failure();
}

/// Client half: routes transaction outcomes back into the pair
/// bookkeeping.
struct CheckCollector {
    agent: Weak<AgentInner>,
}

impl ResponseCollector for CheckCollector {
    fn process_response(&self, id: &TransactionId, from: SocketAddr, to: SocketAddr, bytes: Bytes) {
        if let Some(inner) = self.agent.upgrade() {
            on_response(&inner, id, from, to, &bytes);
        }
    }

    fn process_timeout(&self, id: &TransactionId) {
        self.fail(id, "timeout");
    }

    fn process_unreachable(&self, id: &TransactionId) {
        self.fail(id, "unreachable");
    }

    fn process_cancelled(&self, id: &TransactionId) {
        if let Some(inner) = self.agent.upgrade() {
            inner.checks.lock().remove(id);
        }
    }
}

impl CheckCollector {
    fn fail(&self, id: &TransactionId, reason: &str) {
        let Some(inner) = self.agent.upgrade() else {
            return;
        };

        let Some(target) = inner.checks.lock().remove(id) else {
            return;
        };

        log::info!(
            "check gave no answer: local={}, remote={}, reason={reason}",
            target.local_base,
            target.remote
        );

        fail_pair(&inner, &target.stream, &target.local_base, &target.remote);
    }
}

fn on_response(
    inner: &Arc<AgentInner>,
    id: &TransactionId,
    from: SocketAddr,
    to: SocketAddr,
    bytes: &[u8],
) {
    let Some(target) = inner.checks.lock().remove(id) else {
        return;
    };

    // rfc5245 7.1.3.1: the response must come back from exactly the
    // address the request went to, and land on the address it left
    // from; anything else is a symmetric nat artifact that fails the
    // pair.
    if from != target.remote || to != target.local_base {
        log::info!(
            "asymmetric check response: expected={}->{}, got={}->{}",
            target.local_base,
            target.remote,
            to,
            from
        );

        fail_pair(inner, &target.stream, &target.local_base, &target.remote);
        return;
    }

    let mut decoder = Decoder::default();
    let Ok(message) = decoder.decode(bytes) else {
        fail_pair(inner, &target.stream, &target.local_base, &target.remote);
        return;
    };

    match message.method() {
        Method::Binding(Kind::Response) => on_success(inner, &target),
        Method::Binding(Kind::Error) => {
            let kind = message.get::<ErrorCode>().and_then(|it| it.kind());
            if kind == Some(ErrKind::RoleConflict) {
                on_role_conflict(inner, &target);
            } else {
                log::info!(
                    "check rejected: remote={}, code={:?}",
                    target.remote,
                    message.get::<ErrorCode>().map(|it| it.code)
                );

                fail_pair(inner, &target.stream, &target.local_base, &target.remote);
            }
        }
        _ => fail_pair(inner, &target.stream, &target.local_base, &target.remote),
    }
}

fn on_success(inner: &Arc<AgentInner>, target: &CheckTarget) {
    let mut nominate_next = None;
    let mut completed = false;

    {
        let mut streams = inner.streams.lock();
        let Some(entry) = streams
            .iter_mut()
            .find(|it| it.stream.name == target.stream)
        else {
            return;
        };

        let Some(pair) = entry.checklist.find(&target.local_base, &target.remote) else {
            return;
        };

        pair.state = PairState::Succeeded;
        let foundation = pair.foundation();
        let component = pair.component();
        let nominated_now = target.nominating || pair.nominating;
        if nominated_now {
            pair.nominated = true;
            completed = true;
        }

        log::info!("pair succeeded: {pair:?}");
        entry.checklist.unfreeze_foundation(&foundation);

        // regular nomination: the controlling side re-checks the first
        // valid pair of the component with USE-CANDIDATE.
        if !nominated_now
            && inner.role() == Role::Controlling
            && !entry.checklist.nominated_for(component)
        {
            nominate_next = Some(TriggeredCheck {
                stream: target.stream.clone(),
                local_base: target.local_base,
                remote: target.remote,
                nominate: true,
            });
        }
    }

    if completed {
        inner.check_completion();
    }

    if let Some(check) = nominate_next {
        inner.triggered.lock().push_back(check);
        inner.wake.notify_one();
    }
}

/// 487 from the remote: adopt the opposite role, re-sort the lists
/// and repeat the check as a triggered one.
fn on_role_conflict(inner: &Arc<AgentInner>, target: &CheckTarget) {
    {
        // a stale 487 for a request sent under the old role must not
        // flip the agent back into the conflict it already left.
        let mut role = inner.role.lock();
        if *role != target.role {
            log::debug!("stale role conflict ignored: sent_as={:?}", target.role);
        } else {
            *role = match *role {
                Role::Controlling => Role::Controlled,
                Role::Controlled => Role::Controlling,
            };

            log::warn!("role conflict resolved by flipping: role={:?}", *role);
        }
    }

    let controlling = inner.role() == Role::Controlling;

    {
        let mut streams = inner.streams.lock();
        for entry in streams.iter_mut() {
            for pair in entry.checklist.pairs.iter_mut() {
                pair.priority =
                    pair_priority(pair.local.priority, pair.remote.priority, controlling);
            }
        }

        if let Some(entry) = streams
            .iter_mut()
            .find(|it| it.stream.name == target.stream)
        {
            if let Some(pair) = entry.checklist.find(&target.local_base, &target.remote) {
                pair.state = PairState::Waiting;
            }
        }
    }

    inner.triggered.lock().push_back(TriggeredCheck {
        stream: target.stream.clone(),
        local_base: target.local_base,
        remote: target.remote,
        nominate: false,
    });

    inner.wake.notify_one();
}

/// Server half: answers inbound Binding requests.
pub(crate) struct CheckResponder {
    pub agent: Weak<AgentInner>,
}

impl RequestListener for CheckResponder {
    fn on_request(&self, stack: &StunStack, request: &MessageReader, raw: &RawMessage) {
        if request.method() != Method::Binding(Kind::Request) {
            return;
        }

        let Some(inner) = self.agent.upgrade() else {
            return;
        };

        let Ok(id) = TransactionId::try_from(request.token()) else {
            return;
        };

        // A username-less binding is an ordinary stun client asking
        // for its mapping, answer it plainly.
        let Some(username) = request.get::<UserName>() else {
            respond_mapping(stack, request, raw, &id, None);
            return;
        };

        if username.split(':').next().unwrap_or("") != inner.ufrag {
            return;
        }

        // rfc5245 7.2.1.1 role conflict resolution: the higher
        // tie-breaker keeps its role and rejects with 487, the lower
        // one adapts silently.
        {
            let mut role = inner.role.lock();
            match (*role, request.get::<IceControlling>(), request.get::<IceControlled>()) {
                (Role::Controlling, Some(theirs), _) => {
                    if inner.tie_breaker >= theirs {
                        drop(role);
                        respond_error(stack, request, raw, &id, ErrKind::RoleConflict, &inner.password);
                        return;
                    }

                    *role = Role::Controlled;
                    log::warn!("role conflict on inbound check, now controlled");
                }
                (Role::Controlled, _, Some(theirs)) => {
                    if inner.tie_breaker >= theirs {
                        *role = Role::Controlling;
                        log::warn!("role conflict on inbound check, now controlling");
                    } else {
                        drop(role);
                        respond_error(stack, request, raw, &id, ErrKind::RoleConflict, &inner.password);
                        return;
                    }
                }
                _ => {}
            }
        }

        let use_candidate = request.get::<UseCandidate>().is_some();
        let priority_attr = request.get::<Priority>().unwrap_or_else(|| {
            candidate_priority(CandidateKind::PeerReflexive, 65535, 1)
        });

        let mut completed = false;
        let mut trigger = None;

        {
            let mut streams = inner.streams.lock();

            let located = streams.iter().enumerate().find_map(|(index, entry)| {
                entry
                    .stream
                    .components
                    .iter()
                    .find(|component| component.locals.iter().any(|it| it.base == raw.to))
                    .map(|component| (index, component.id))
            });

            if let Some((index, component_id)) = located {
                let entry = &mut streams[index];
                let stream_name = entry.stream.name.clone();

                // peer reflexive discovery: a source address we have
                // never been told about becomes a remote candidate.
                if let Some(component) = entry.stream.component_mut(component_id) {
                    if !component.remotes.iter().any(|it| it.address == raw.from) {
                        log::info!(
                            "peer reflexive candidate learned: addr={}, component={component_id}",
                            raw.from
                        );

                        component.remotes.push(Candidate {
                            foundation: inner.foundations.assign(
                                CandidateKind::PeerReflexive,
                                raw.from.ip(),
                                None,
                            ),
                            kind: CandidateKind::PeerReflexive,
                            priority: priority_attr,
                            transport: raw.transport,
                            address: raw.from,
                            base: raw.from,
                            component: component_id,
                            relay: None,
                        });
                    }
                }

                // pair bookkeeping only once checks have started.
                if !entry.checklist.pairs.is_empty() {
                    if entry.checklist.find(&raw.to, &raw.from).is_none() {
                        ensure_pair(&inner, entry, component_id, raw);
                    }

                    if let Some(pair) = entry.checklist.find(&raw.to, &raw.from) {
                        if use_candidate {
                            if pair.state == PairState::Succeeded {
                                pair.nominated = true;
                                completed = true;
                            } else {
                                // remember the nomination, it lands
                                // when the pair's own check succeeds.
                                pair.nominating = true;
                            }
                        }

                        if pair.state != PairState::InProgress
                            && pair.state != PairState::Succeeded
                        {
                            trigger = Some(TriggeredCheck {
                                stream: stream_name,
                                local_base: raw.to,
                                remote: raw.from,
                                nominate: false,
                            });
                        }
                    }
                }
            }
        }

        if completed {
            inner.check_completion();
        }

        if let Some(check) = trigger {
            inner.triggered.lock().push_back(check);
            inner.wake.notify_one();
        }

        respond_mapping(stack, request, raw, &id, Some(inner.password.as_bytes()));
    }
}

/// Add the pair an inbound check implies when the ordered build never
/// produced it.
fn ensure_pair(
    inner: &AgentInner,
    entry: &mut crate::agent::StreamEntry,
    component_id: u16,
    raw: &RawMessage,
) {
    let controlling = inner.role() == Role::Controlling;
    let Some(component) = entry.stream.component(component_id) else {
        return;
    };

    let local = component
        .locals
        .iter()
        .find(|it| it.base == raw.to && it.kind != CandidateKind::ServerReflexive);

    let remote = component.remotes.iter().find(|it| it.address == raw.from);

    if let (Some(local), Some(remote)) = (local, remote) {
        let mut pair =
            crate::agent::checklist::CandidatePair::new(local.clone(), remote.clone(), controlling);
        pair.state = PairState::Waiting;
        log::debug!("pair added from inbound check: {pair:?}");
        entry.checklist.pairs.push(pair);
        entry
            .checklist
            .pairs
            .sort_by(|a, b| b.priority.cmp(&a.priority));
    }
}

fn respond_mapping(
    stack: &StunStack,
    request: &MessageReader,
    raw: &RawMessage,
    id: &TransactionId,
    key: Option<&[u8]>,
) {
    let mut bytes = BytesMut::with_capacity(128);
    let mut writer = MessageWriter::extend(Method::Binding(Kind::Response), request, &mut bytes);

    writer.append::<XorMappedAddress>(raw.from);
    writer.append::<Software>(crate::SOFTWARE);

    if writer.flush(key).is_err() {
        return;
    }

    if let Err(e) = stack.send_response(id, bytes.freeze(), (raw.to, raw.transport), raw.from) {
        log::warn!("check response send failed: to={}, err={e}", raw.from);
    }
}

fn respond_error(
    stack: &StunStack,
    request: &MessageReader,
    raw: &RawMessage,
    id: &TransactionId,
    kind: ErrKind,
    password: &str,
) {
    let mut bytes = BytesMut::with_capacity(128);
    let mut writer = MessageWriter::extend(Method::Binding(Kind::Error), request, &mut bytes);

    writer.append::<ErrorCode>(ErrorCode::from(kind));
    writer.append::<Software>(crate::SOFTWARE);

    if writer.flush(Some(password.as_bytes())).is_err() {
        return;
    }

    if let Err(e) = stack.send_response(id, bytes.freeze(), (raw.to, raw.transport), raw.from) {
        log::warn!("error response send failed: to={}, err={e}", raw.from);
    }
}
