//! Server transactions.
//!
//! Every inbound request opens (or refreshes) a server transaction
//! keyed by its transaction id.  The first answer produced for it is
//! cached; a retransmitted request is then answered byte-identically
//! from the cache without any listener running again.  A transaction
//! expires after 9.5 rto of quiescence (rfc5389 section 7.3.1), a
//! retransmit inside that window restarts the clock.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{Error, RawMessage, transaction::TransactionId};

/// Outcome of admitting an inbound request.
pub(crate) enum Admission {
    /// First sighting of this transaction id; validation and listener
    /// dispatch proceed.
    New,
    /// A retransmit.  `Some` carries the cached response to replay,
    /// `None` means the original request is still being processed.
    Retransmit(Option<Bytes>),
}

struct Entry {
    response: Option<Bytes>,
    last_seen: Instant,
    #[allow(dead_code)]
    from: SocketAddr,
}

pub(crate) struct ServerTransactions {
    lifetime: Duration,
    rto: Duration,
    entries: Arc<Mutex<HashMap<TransactionId, Entry>>>,
}

impl ServerTransactions {
    pub(crate) fn new(rto: Duration) -> Self {
        Self {
            lifetime: rto.mul_f64(9.5),
            entries: Arc::new(Mutex::new(HashMap::new())),
            rto,
        }
    }

    /// Background reaper in the style of a session manager: ticks at
    /// rto granularity and drops transactions quiet for longer than
    /// their lifetime.
    pub(crate) fn spawn_sweeper(&self) {
        let entries = Arc::downgrade(&self.entries);
        let lifetime = self.lifetime;
        let tick = self.rto;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;

                let Some(entries) = entries.upgrade() else {
                    break;
                };

                entries
                    .lock()
                    .retain(|_, entry| entry.last_seen.elapsed() <= lifetime);
            }
        });
    }

    pub(crate) fn begin(&self, id: &TransactionId, raw: &RawMessage) -> Admission {
        let mut entries = self.entries.lock();
        match entries.get_mut(id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                Admission::Retransmit(entry.response.clone())
            }
            None => {
                entries.insert(
                    *id,
                    Entry {
                        response: None,
                        last_seen: Instant::now(),
                        from: raw.from,
                    },
                );

                Admission::New
            }
        }
    }

    /// Cache the answer for a transaction.  Answering an expired or
    /// unknown transaction fails, and so does answering twice: the
    /// cache is write-once, dedup correctness depends on it.
    pub(crate) fn answer(&self, id: &TransactionId, bytes: Bytes) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id).ok_or(Error::TransactionDoesNotExist)?;

        if entry.response.is_some() {
            return Err(Error::TransactionAlreadyAnswered);
        }

        entry.response = Some(bytes);
        entry.last_seen = Instant::now();
        Ok(())
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;

    fn raw() -> RawMessage {
        RawMessage {
            bytes: Bytes::new(),
            from: "127.0.0.1:9000".parse().unwrap(),
            to: "127.0.0.1:3478".parse().unwrap(),
            transport: Transport::Udp,
        }
    }

    #[tokio::test]
    async fn dedup_and_write_once() {
        let table = ServerTransactions::new(Duration::from_millis(500));
        let id = TransactionId::random();

        assert!(matches!(table.begin(&id, &raw()), Admission::New));
        assert!(matches!(
            table.begin(&id, &raw()),
            Admission::Retransmit(None)
        ));

        table.answer(&id, Bytes::from_static(b"response")).unwrap();

        match table.begin(&id, &raw()) {
            Admission::Retransmit(Some(cached)) => {
                assert_eq!(&cached[..], b"response");
            }
            _ => panic!("expected cached response"),
        }

        assert!(matches!(
            table.answer(&id, Bytes::from_static(b"other")),
            Err(Error::TransactionAlreadyAnswered)
        ));

        let unknown = TransactionId::random();
        assert!(matches!(
            table.answer(&unknown, Bytes::new()),
            Err(Error::TransactionDoesNotExist)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_quiescence() {
        let table = ServerTransactions::new(Duration::from_millis(100));
        table.spawn_sweeper();

        let id = TransactionId::random();
        assert!(matches!(table.begin(&id, &raw()), Admission::New));
        table.answer(&id, Bytes::from_static(b"response")).unwrap();

        // 9.5 * rto is 950ms; after that the id is forgotten and the
        // same request would be treated as brand new.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(matches!(table.begin(&id, &raw()), Admission::New));
    }
}
