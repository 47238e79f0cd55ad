//! Candidate harvesting.
//!
//! The host harvester runs first and seeds the component with bound
//! sockets; every other harvester (stun, turn, static mapping, the
//! demultiplexing variants) implements [`CandidateHarvester`] and runs
//! in parallel over those host candidates under the harvest manager.

pub mod host;
pub mod single_port;
pub mod static_map;
pub mod stun;
pub mod tcp_mux;
pub mod turn;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use stack::StunStack;

use crate::candidate::{Candidate, Foundations};

/// Everything a reflexive harvester needs to do its work.
#[derive(Clone)]
pub struct HarvestContext {
    pub stack: StunStack,
    pub component: u16,
    /// host candidates already bound for the component.
    pub hosts: Vec<Candidate>,
    pub foundations: Arc<Foundations>,
}

/// One way of producing candidates for a component.
///
/// Harvesters recover from their own failures: a transaction timeout
/// or a server error yields an empty set, never an error the driver
/// has to handle.
#[async_trait]
pub trait CandidateHarvester: Send + Sync {
    async fn harvest(&self, ctx: &HarvestContext) -> Vec<Candidate>;

    fn name(&self) -> &str;

    fn state(&self) -> &HarvesterState;

    fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.state().set_enabled(enabled)
    }

    /// accumulated wall-clock time spent harvesting.
    fn harvesting_time(&self) -> Duration {
        self.state().harvesting_time()
    }
}

/// Book-keeping shared by every harvester implementation: the enabled
/// flag and the harvesting time counter.
#[derive(Default)]
pub struct HarvesterState {
    disabled: AtomicBool,
    elapsed_millis: AtomicU64,
    ran_once: AtomicBool,
}

impl HarvesterState {
    pub fn is_enabled(&self) -> bool {
        !self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.disabled.store(!enabled, Ordering::Relaxed);
    }

    pub fn harvesting_time(&self) -> Duration {
        Duration::from_millis(self.elapsed_millis.load(Ordering::Relaxed))
    }

    /// Record one run.  A harvester that produces nothing on its very
    /// first run is permanently disabled so later components do not
    /// pay for its timeouts again.
    pub fn record(&self, elapsed: Duration, produced: usize) {
        self.elapsed_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);

        if !self.ran_once.swap(true, Ordering::Relaxed) && produced == 0 {
            self.set_enabled(false);
        }
    }
}

/// Parallel harvest driver.
///
/// All enabled harvesters run concurrently; the driver waits for all
/// of them and merges their candidates.
#[derive(Default)]
pub struct HarvestManager {
    harvesters: Vec<Arc<dyn CandidateHarvester>>,
}

impl HarvestManager {
    pub fn add(&mut self, harvester: Arc<dyn CandidateHarvester>) {
        self.harvesters.push(harvester);
    }

    pub fn is_empty(&self) -> bool {
        self.harvesters.is_empty()
    }

    pub async fn harvest(&self, ctx: HarvestContext) -> Vec<Candidate> {
        let mut pool = tokio::task::JoinSet::new();

        for harvester in &self.harvesters {
            if !harvester.is_enabled() {
                continue;
            }

            let harvester = harvester.clone();
            let ctx = ctx.clone();
            pool.spawn(async move {
                let started = tokio::time::Instant::now();
                let candidates = harvester.harvest(&ctx).await;
                harvester.state().record(started.elapsed(), candidates.len());

                log::info!(
                    "harvester finished: name={}, component={}, candidates={}, elapsed={:?}",
                    harvester.name(),
                    ctx.component,
                    candidates.len(),
                    started.elapsed()
                );

                candidates
            });
        }

        let mut candidates = Vec::new();
        while let Some(result) = pool.join_next().await {
            match result {
                Ok(mut found) => candidates.append(&mut found),
                // a harvester panic disables nothing globally, the
                // remaining harvesters already ran to completion.
                Err(e) => log::error!("harvester crashed: err={e}"),
            }
        }

        candidates
    }
}
