//! Client transactions.
//!
//! A client transaction pairs an outbound request with a collector
//! that receives exactly one terminal event: the response, a timeout,
//! a cancellation or an unreachable report.  Retransmission follows
//! rfc5389 section 7.2.1: transmissions at rto, 2rto, 4rto and so on,
//! at most rc transmissions, with the transaction alive for rm * rto
//! in total.
//!
//! The transaction table entry is the linearization point: whichever
//! task removes the entry emits the terminal event, so the event can
//! never fire twice.

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use codec::message::MessageReader;
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, oneshot},
    time::{Instant, sleep, sleep_until},
};

use crate::{Error, RawMessage, StackInner, Transport, transaction::TransactionId};

/// Terminal outcome of a client transaction.
#[derive(Debug)]
pub enum TransactionEvent {
    Response {
        from: SocketAddr,
        to: SocketAddr,
        bytes: Bytes,
    },
    Timeout,
    Cancelled,
    Unreachable,
}

/// Receives the terminal event of a transaction.
///
/// Exactly one of these methods is invoked per issued request, never
/// zero and never more than one.
pub trait ResponseCollector: Send + Sync {
    fn process_response(&self, id: &TransactionId, from: SocketAddr, to: SocketAddr, bytes: Bytes);
    fn process_timeout(&self, id: &TransactionId);
    fn process_cancelled(&self, id: &TransactionId);
    fn process_unreachable(&self, id: &TransactionId);
}

struct Entry {
    collector: Arc<dyn ResponseCollector>,
    local: SocketAddr,
    cancel: Arc<Notify>,
    done: Arc<Notify>,
}

pub(crate) struct ClientTransactions {
    rto: Duration,
    rc: u32,
    rm: u32,
    entries: Mutex<HashMap<TransactionId, Entry>>,
}

impl ClientTransactions {
    pub(crate) fn new(rto: Duration, rc: u32, rm: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            rto,
            rc: rc.max(1),
            rm: rm.max(1),
        }
    }

    pub(crate) fn send(
        &self,
        stack: &Arc<StackInner>,
        bytes: Bytes,
        to: SocketAddr,
        through: (SocketAddr, Transport),
        collector: Arc<dyn ResponseCollector>,
    ) -> Result<TransactionId, Error> {
        if bytes.len() < 20 {
            return Err(Error::Codec(codec::Error::TruncatedHeader));
        }

        let id = TransactionId::try_from(&bytes[8..20])?;
        let cancel = Arc::new(Notify::new());
        let done = Arc::new(Notify::new());

        self.entries.lock().insert(
            id,
            Entry {
                collector,
                local: through.0,
                cancel: cancel.clone(),
                done: done.clone(),
            },
        );

        tokio::spawn(retransmit_loop(
            Arc::downgrade(stack),
            id,
            bytes,
            to,
            through,
            (self.rto, self.rc, self.rm),
            cancel,
            done,
        ));

        Ok(id)
    }

    /// Match a response to its pending transaction.  Responses with no
    /// matching transaction (late, duplicated or foreign) are dropped.
    pub(crate) fn dispatch_response(&self, reader: &MessageReader, raw: &RawMessage) {
        let Ok(id) = TransactionId::try_from(reader.token()) else {
            return;
        };

        if let Some(entry) = self.take(&id) {
            entry.done.notify_one();
            entry
                .collector
                .process_response(&id, raw.from, raw.to, raw.bytes.clone());
        }
    }

    /// Stop retransmitting; the transaction is retained for one more
    /// rto to absorb a late response, then reports cancellation.
    pub(crate) fn cancel(&self, id: &TransactionId) {
        if let Some(entry) = self.entries.lock().get(id) {
            entry.cancel.notify_one();
        }
    }

    /// Shutdown path: every pending transaction reports cancellation
    /// immediately.
    pub(crate) fn cancel_all(&self) {
        let entries: Vec<(TransactionId, Entry)> = self.entries.lock().drain().collect();
        for (id, entry) in entries {
            entry.done.notify_one();
            entry.collector.process_cancelled(&id);
        }
    }

    /// A connector died: every transaction sending through its local
    /// address reports unreachable.
    pub(crate) fn fail_by_local_addr(&self, local: SocketAddr) {
        let failed: Vec<(TransactionId, Entry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<TransactionId> = entries
                .iter()
                .filter(|(_, entry)| entry.local == local)
                .map(|(id, _)| *id)
                .collect();

            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in failed {
            entry.done.notify_one();
            entry.collector.process_unreachable(&id);
        }
    }

    fn take(&self, id: &TransactionId) -> Option<Entry> {
        self.entries.lock().remove(id)
    }
}

#[allow(clippy::too_many_arguments)]
async fn retransmit_loop(
    stack: Weak<StackInner>,
    id: TransactionId,
    bytes: Bytes,
    to: SocketAddr,
    through: (SocketAddr, Transport),
    (rto, rc, rm): (Duration, u32, u32),
    cancel: Arc<Notify>,
    done: Arc<Notify>,
) {
    let deadline = Instant::now() + rto * rm;
    let mut wait = rto;
    let mut cancelled = false;

    for attempt in 0..rc {
        {
            let Some(stack) = stack.upgrade() else {
                return;
            };

            match stack.send_bytes(&bytes, through.0, through.1, to) {
                Ok(()) => {}
                // A full socket buffer skips this transmission, the
                // schedule carries on.
                Err(Error::QueueFull) => {
                    log::warn!("request transmission dropped: id={id}, to={to}");
                }
                Err(e) => {
                    log::debug!("request unreachable: id={id}, to={to}, err={e}");
                    if let Some(entry) = stack.client.take(&id) {
                        entry.collector.process_unreachable(&id);
                    }

                    return;
                }
            }
        }

        if attempt + 1 == rc {
            break;
        }

        tokio::select! {
            _ = done.notified() => return,
            _ = cancel.notified() => {
                cancelled = true;
                break;
            }
            _ = sleep(wait) => {}
        }

        wait *= 2;
    }

    // After the last transmission the transaction stays alive until
    // the rm * rto deadline; a cancellation shortens that to one rto.
    if !cancelled {
        tokio::select! {
            _ = done.notified() => return,
            _ = cancel.notified() => cancelled = true,
            _ = sleep_until(deadline) => {}
        }
    }

    if cancelled {
        tokio::select! {
            _ = done.notified() => return,
            _ = sleep(rto) => {}
        }
    }

    let Some(stack) = stack.upgrade() else {
        return;
    };

    if let Some(entry) = stack.client.take(&id) {
        if cancelled {
            entry.collector.process_cancelled(&id);
        } else {
            entry.collector.process_timeout(&id);
        }
    }
}

/// Await-style adapter over the collector callbacks.
///
/// The harvesters drive their requests synchronously; this wraps a
/// oneshot channel as a collector so they can simply await the single
/// terminal event.
pub struct RequestOutcome {
    rx: oneshot::Receiver<TransactionEvent>,
}

impl RequestOutcome {
    pub fn pair() -> (Arc<OutcomeCollector>, RequestOutcome) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(OutcomeCollector(Mutex::new(Some(tx)))),
            RequestOutcome { rx },
        )
    }

    pub async fn wait(self) -> TransactionEvent {
        self.rx.await.unwrap_or(TransactionEvent::Cancelled)
    }
}

pub struct OutcomeCollector(Mutex<Option<oneshot::Sender<TransactionEvent>>>);

impl OutcomeCollector {
    fn emit(&self, event: TransactionEvent) {
        if let Some(tx) = self.0.lock().take() {
            let _ = tx.send(event);
        }
    }
}

impl ResponseCollector for OutcomeCollector {
    fn process_response(&self, _: &TransactionId, from: SocketAddr, to: SocketAddr, bytes: Bytes) {
        self.emit(TransactionEvent::Response { from, to, bytes });
    }

    fn process_timeout(&self, _: &TransactionId) {
        self.emit(TransactionEvent::Timeout);
    }

    fn process_cancelled(&self, _: &TransactionId) {
        self.emit(TransactionEvent::Cancelled);
    }

    fn process_unreachable(&self, _: &TransactionId) {
        self.emit(TransactionEvent::Unreachable);
    }
}
