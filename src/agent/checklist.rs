//! Check lists and candidate pairs.
//!
//! Per stream, the agent pairs every local candidate against every
//! remote candidate of the same component, orders the pairs by the
//! rfc5245 pair priority, prunes the redundant ones and freezes all
//! but one pair per foundation.  The pace maker then walks the list.

use std::net::SocketAddr;

use crate::{candidate::{Candidate, CandidateKind}, component::Component};

/// check lists never grow beyond this many pairs (rfc5245 suggests
/// 100 as a sane ceiling).
pub const MAX_PAIRS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

/// rfc5245 section 5.7.2:
///
/// > pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
///
/// where G is the controlling agent's candidate priority and D the
/// controlled agent's.
pub fn pair_priority(local: u32, remote: u32, controlling: bool) -> u64 {
    let (g, d) = if controlling {
        (local as u64, remote as u64)
    } else {
        (remote as u64, local as u64)
    };

    (1u64 << 32) * g.min(d) + 2 * g.max(d) + if g > d { 1 } else { 0 }
}

#[derive(Clone)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    pub state: PairState,
    pub priority: u64,
    pub nominated: bool,
    /// a nominating check (USE-CANDIDATE) is in flight or done.
    pub nominating: bool,
}

impl CandidatePair {
    pub fn new(local: Candidate, remote: Candidate, controlling: bool) -> Self {
        Self {
            priority: pair_priority(local.priority, remote.priority, controlling),
            state: PairState::Frozen,
            nominated: false,
            nominating: false,
            local,
            remote,
        }
    }

    pub fn component(&self) -> u16 {
        self.local.component
    }

    /// foundation of the pair, the freezing key.
    pub fn foundation(&self) -> String {
        format!("{}:{}", self.local.foundation, self.remote.foundation)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, PairState::Succeeded | PairState::Failed)
    }
}

impl std::fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} [{:?}{}]",
            self.local,
            self.remote,
            self.state,
            if self.nominated { ", nominated" } else { "" }
        )
    }
}

#[derive(Default)]
pub struct CheckList {
    pub pairs: Vec<CandidatePair>,
}

impl CheckList {
    /// Build the ordered, pruned, foundation-frozen list for one
    /// stream.
    ///
    /// Server reflexive local candidates are skipped outright: their
    /// checks would leave through the base socket anyway, so the host
    /// pair covers them (this is the rfc5245 prune collapsed into
    /// construction).
    pub fn build(components: &[Component], controlling: bool) -> Self {
        let mut pairs: Vec<CandidatePair> = Vec::new();

        for component in components {
            for local in &component.locals {
                if local.kind == CandidateKind::ServerReflexive {
                    continue;
                }

                for remote in &component.remotes {
                    if remote.component != component.id || !local.can_reach(&remote.address) {
                        continue;
                    }

                    pairs.push(CandidatePair::new(
                        local.clone(),
                        remote.clone(),
                        controlling,
                    ));
                }
            }
        }

        pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        pairs.dedup_by(|a, b| {
            a.local.base == b.local.base
                && a.remote.address == b.remote.address
                && a.component() == b.component()
        });
        pairs.truncate(MAX_PAIRS);

        // unfreeze one pair per foundation, the highest-priority one.
        let mut list = Self { pairs };
        let mut seen: Vec<String> = Vec::new();
        for pair in list.pairs.iter_mut() {
            let foundation = pair.foundation();
            if !seen.contains(&foundation) {
                pair.state = PairState::Waiting;
                seen.push(foundation);
            }
        }

        list
    }

    pub fn find(&mut self, local_base: &SocketAddr, remote: &SocketAddr) -> Option<&mut CandidatePair> {
        self.pairs
            .iter_mut()
            .find(|pair| pair.local.base == *local_base && pair.remote.address == *remote)
    }

    /// Highest-priority pair in the waiting state.
    pub fn next_waiting(&mut self) -> Option<&mut CandidatePair> {
        self.pairs
            .iter_mut()
            .filter(|pair| pair.state == PairState::Waiting)
            .max_by_key(|pair| pair.priority)
    }

    /// Unfreeze the lowest-priority frozen pair whose foundation has
    /// no check in progress.
    pub fn unfreeze_next(&mut self) -> bool {
        let busy: Vec<String> = self
            .pairs
            .iter()
            .filter(|pair| pair.state == PairState::InProgress)
            .map(|pair| pair.foundation())
            .collect();

        let target = self
            .pairs
            .iter_mut()
            .filter(|pair| pair.state == PairState::Frozen)
            .filter(|pair| !busy.contains(&pair.foundation()))
            .min_by_key(|pair| pair.priority);

        match target {
            Some(pair) => {
                pair.state = PairState::Waiting;
                true
            }
            None => false,
        }
    }

    /// A successful check unfreezes the siblings of its foundation.
    pub fn unfreeze_foundation(&mut self, foundation: &str) {
        for pair in self.pairs.iter_mut() {
            if pair.state == PairState::Frozen && pair.foundation() == foundation {
                pair.state = PairState::Waiting;
            }
        }
    }

    pub fn all_terminal(&self) -> bool {
        !self.pairs.is_empty() && self.pairs.iter().all(|pair| pair.is_terminal())
    }

    pub fn all_failed(&self) -> bool {
        !self.pairs.is_empty() && self.pairs.iter().all(|pair| pair.state == PairState::Failed)
    }

    pub fn has_active_work(&self) -> bool {
        self.pairs.iter().any(|pair| !pair.is_terminal())
    }

    pub fn nominated_for(&self, component: u16) -> bool {
        self.pairs
            .iter()
            .any(|pair| pair.component() == component && pair.nominated)
    }

    pub fn succeeded_pair_for(&mut self, component: u16) -> Option<&mut CandidatePair> {
        self.pairs
            .iter_mut()
            .filter(|pair| pair.component() == component && pair.state == PairState::Succeeded)
            .max_by_key(|pair| pair.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack::Transport;

    fn candidate(addr: &str, kind: CandidateKind, component: u16, priority: u32) -> Candidate {
        Candidate {
            address: addr.parse().unwrap(),
            base: addr.parse().unwrap(),
            foundation: format!("{kind}"),
            transport: Transport::Udp,
            relay: None,
            component,
            priority,
            kind,
        }
    }

    fn stream_components() -> Vec<Component> {
        let mut component = Component::new(1);
        component.locals = vec![
            candidate("10.0.0.1:4000", CandidateKind::Host, 1, 2130706431),
            candidate("203.0.113.7:4000", CandidateKind::ServerReflexive, 1, 1694498815),
        ];
        component.remotes = vec![
            candidate("192.0.2.10:5000", CandidateKind::Host, 1, 2130706431),
            candidate("192.0.2.11:5001", CandidateKind::ServerReflexive, 1, 1694498815),
        ];

        vec![component]
    }

    #[test]
    fn build_prunes_reflexive_locals_and_orders() {
        let list = CheckList::build(&stream_components(), true);

        // 1 usable local x 2 remotes.
        assert_eq!(list.pairs.len(), 2);
        assert!(list.pairs[0].priority >= list.pairs[1].priority);
        assert!(
            list.pairs
                .iter()
                .all(|pair| pair.local.kind == CandidateKind::Host)
        );
    }

    #[test]
    fn foundation_freezing() {
        let list = CheckList::build(&stream_components(), true);

        // distinct foundations here, so every pair starts waiting.
        assert!(
            list.pairs
                .iter()
                .all(|pair| pair.state == PairState::Waiting)
        );
    }

    #[test]
    fn pair_priority_formula() {
        // controlling side: G = local.
        assert_eq!(pair_priority(2, 1, true), (1u64 << 32) + 4 + 1);
        // mirrored on the controlled side the pair sorts identically.
        assert_eq!(pair_priority(2, 1, true), pair_priority(1, 2, false));
    }

    #[test]
    fn unfreeze_lowest_priority_first() {
        let mut list = CheckList::build(&stream_components(), true);
        for pair in list.pairs.iter_mut() {
            pair.state = PairState::Frozen;
        }

        assert!(list.unfreeze_next());
        let unfrozen: Vec<&CandidatePair> = list
            .pairs
            .iter()
            .filter(|pair| pair.state == PairState::Waiting)
            .collect();

        assert_eq!(unfrozen.len(), 1);
        let min = list.pairs.iter().map(|pair| pair.priority).min().unwrap();
        assert_eq!(unfrozen[0].priority, min);
    }
}
