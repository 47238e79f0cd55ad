//! Decoded message dispatch.
//!
//! Two listener tables, one for requests and one for indications,
//! each keyed by local address with a wildcard bucket that sees every
//! event.  The listener list is snapshotted under a short lock and
//! callbacks run with no dispatcher lock held, so a listener may
//! re-register or unregister freely; the change takes effect on the
//! next event.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::{HashMap, HashMapExt};
use codec::message::MessageReader;
use parking_lot::Mutex;

use crate::{RawMessage, StunStack};

/// Server side of a transaction: handle a validated request and
/// answer it through `StunStack::send_response`.
pub trait RequestListener: Send + Sync {
    fn on_request(&self, stack: &StunStack, request: &MessageReader, raw: &RawMessage);
}

/// Indications expect no answer; they carry relayed data and
/// keep-alives.
pub trait IndicationListener: Send + Sync {
    fn on_indication(&self, stack: &StunStack, indication: &MessageReader, raw: &RawMessage);
}

struct Table<T: ?Sized> {
    wildcard: Vec<(u64, Arc<T>)>,
    by_addr: HashMap<SocketAddr, Vec<(u64, Arc<T>)>>,
}

impl<T: ?Sized> Default for Table<T> {
    fn default() -> Self {
        Self {
            wildcard: Vec::new(),
            by_addr: HashMap::new(),
        }
    }
}

impl<T: ?Sized> Table<T> {
    fn add(&mut self, id: u64, local: Option<SocketAddr>, listener: Arc<T>) {
        match local {
            None => self.wildcard.push((id, listener)),
            Some(addr) => self.by_addr.entry(addr).or_default().push((id, listener)),
        }
    }

    fn remove(&mut self, id: u64) {
        self.wildcard.retain(|(i, _)| *i != id);
        self.by_addr.retain(|_, items| {
            items.retain(|(i, _)| *i != id);
            !items.is_empty()
        });
    }

    /// wildcard listeners first, then the bucket of the event's local
    /// address, in registration order.
    fn snapshot(&self, local: &SocketAddr) -> Vec<Arc<T>> {
        let mut items: Vec<Arc<T>> = self.wildcard.iter().map(|(_, it)| it.clone()).collect();
        if let Some(bucket) = self.by_addr.get(local) {
            items.extend(bucket.iter().map(|(_, it)| it.clone()));
        }

        items
    }
}

#[derive(Default)]
pub(crate) struct EventDispatcher {
    requests: Mutex<Table<dyn RequestListener>>,
    indications: Mutex<Table<dyn IndicationListener>>,
    ids: AtomicU64,
}

impl EventDispatcher {
    pub(crate) fn add_request_listener(
        &self,
        local: Option<SocketAddr>,
        listener: Arc<dyn RequestListener>,
    ) -> u64 {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().add(id, local, listener);
        id
    }

    pub(crate) fn remove_request_listener(&self, id: u64) {
        self.requests.lock().remove(id);
    }

    pub(crate) fn add_indication_listener(
        &self,
        local: Option<SocketAddr>,
        listener: Arc<dyn IndicationListener>,
    ) -> u64 {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        self.indications.lock().add(id, local, listener);
        id
    }

    pub(crate) fn remove_indication_listener(&self, id: u64) {
        self.indications.lock().remove(id);
    }

    pub(crate) fn fire_request(
        &self,
        stack: &StunStack,
        request: &MessageReader,
        raw: &RawMessage,
    ) {
        let listeners = self.requests.lock().snapshot(&raw.to);
        for listener in listeners {
            listener.on_request(stack, request, raw);
        }
    }

    pub(crate) fn fire_indication(
        &self,
        stack: &StunStack,
        indication: &MessageReader,
        raw: &RawMessage,
    ) {
        let listeners = self.indications.lock().snapshot(&raw.to);
        for listener in listeners {
            listener.on_indication(stack, indication, raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use codec::{Attributes, method::{Kind, Method}};
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl RequestListener for Counter {
        fn on_request(&self, _: &StunStack, _: &MessageReader, _: &RawMessage) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn raw(to: SocketAddr) -> RawMessage {
        RawMessage {
            bytes: Bytes::new(),
            from: "127.0.0.1:1000".parse().unwrap(),
            transport: crate::Transport::Udp,
            to,
        }
    }

    #[tokio::test]
    async fn wildcard_and_addressed_buckets() {
        let stack = StunStack::new(Default::default());
        let dispatcher = EventDispatcher::default();

        let local: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:7001".parse().unwrap();

        let wildcard = Arc::new(Counter(AtomicUsize::new(0)));
        let addressed = Arc::new(Counter(AtomicUsize::new(0)));

        dispatcher.add_request_listener(None, wildcard.clone());
        let id = dispatcher.add_request_listener(Some(local), addressed.clone());

        let buffer = [
            0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x8e, 0x1d, 0x5a, 0x33, 0x47, 0xc2,
            0x09, 0x6b, 0xf0, 0x74, 0x2b, 0x95,
        ];

        let mut attributes = Attributes::default();
        let reader = MessageReader::decode(&buffer, &mut attributes).unwrap();
        assert_eq!(reader.method(), Method::Binding(Kind::Request));

        dispatcher.fire_request(&stack, &reader, &raw(local));
        dispatcher.fire_request(&stack, &reader, &raw(other));

        assert_eq!(wildcard.0.load(Ordering::SeqCst), 2);
        assert_eq!(addressed.0.load(Ordering::SeqCst), 1);

        dispatcher.remove_request_listener(id);
        dispatcher.fire_request(&stack, &reader, &raw(local));
        assert_eq!(addressed.0.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.0.load(Ordering::SeqCst), 3);
    }
}
