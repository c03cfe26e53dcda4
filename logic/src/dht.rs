use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, event, instrument, Level};

use crate::config::SystemConfig;
use crate::id::Id;
use crate::routing::{InsertOutcome, RoutingTable};
use crate::search::{Lookup, LookupOptions};
use crate::transport::{Request, Response, TransportListener, TransportSender};

/// The DHT core: one routing table plus the lookup driver, generic
/// over the transport that moves requests around.
///
/// All routing-table mutation goes through the mutex below; the lock
/// is never held across an await point.
pub struct Dht<T: TransportSender> {
    config: SystemConfig,
    id: Id,
    transport: T,
    pub table: Mutex<RoutingTable>,
    // Candidates parked while their probe is in flight, keyed by the
    // probed incumbent
    probes: Mutex<HashMap<Id, Id>>,
}

impl<T: TransportSender> Dht<T> {
    pub fn new(config: SystemConfig, id: Id, transport: T) -> Self {
        Self {
            config: config.clone(),
            id,
            transport,
            table: Mutex::new(RoutingTable::new(id, config.routing)),
            probes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Offers a freshly seen id to the routing table. When the owning
    /// bucket is full and unsplittable, the least-recently-seen
    /// incumbent is probed: only a failed probe evicts it
    /// ([`Dht::resolve_probe`] settles the outcome).
    pub fn add_contact(&self, id: Id) -> InsertOutcome {
        let outcome = self.table.lock().unwrap().insert(id);
        if let InsertOutcome::Probe { candidate, evict } = outcome {
            self.probes.lock().unwrap().insert(evict, candidate);
            self.transport.ping(evict);
        }
        outcome
    }

    /// Settles a pending liveness probe: a live incumbent stays (the
    /// parked candidate is dropped), a dead one is replaced by it.
    pub fn resolve_probe(&self, evict: Id, alive: bool) {
        let candidate = self.probes.lock().unwrap().remove(&evict);
        let mut table = self.table.lock().unwrap();
        if alive {
            table.refresh(evict);
        } else if let Some(candidate) = candidate {
            debug!(local=%self.id, "Evicting {evict} for {candidate}");
            table.replace(evict, candidate);
        }
    }

    fn closest_contacts(&self, key: Id) -> Vec<T::Contact> {
        self.table
            .lock()
            .unwrap()
            .find_closest(key, self.config.routing.bucket_size)
            .iter()
            .map(|x| self.transport.wrap_contact(*x))
            .collect()
    }

    /// Iterative node lookup: the k closest live contacts to `key`.
    pub async fn lookup_nodes(&self, key: Id, options: LookupOptions) -> Vec<T::Contact> {
        let seed = self.closest_contacts(key);
        Lookup::new(self, options, key).run(seed).await
    }

    /// Self-lookup; warms the routing table after a session opens.
    pub async fn bootstrap(&self, options: LookupOptions) {
        self.lookup_nodes(self.id, options).await;
    }
}

impl<T: TransportSender> TransportListener for Dht<T> {
    fn on_connect(&self, id: Id) -> bool {
        event!(Level::INFO, kad_id=%self.id, "Connected {id}");
        matches!(
            self.add_contact(id),
            InsertOutcome::Inserted | InsertOutcome::Refreshed
        )
    }

    fn on_disconnect(&self, id: Id) {
        event!(Level::INFO, kad_id=%self.id, "Disconnected {id}");
        self.table.lock().unwrap().remove(id);
    }

    #[instrument(skip(self), fields(kad_id=%self.id, %sender))]
    fn on_request(&self, sender: Id, message: Request) -> Response {
        debug!("Request: {:?}", message);
        let mut table = self.table.lock().unwrap();
        table.refresh(sender);

        match message {
            Request::Ping => Response::Pong,
            Request::FindNodes(key) => {
                let found: Vec<Id> = table
                    .find_closest(key, self.config.routing.bucket_size)
                    .into_iter()
                    .filter(|x| *x != sender)
                    .collect();
                debug!("| Find closer {key:?}: {found:?}");
                Response::FoundNodes(found)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::future::{self, Ready};

    use crate::transport::{RawResponse, TransportError};

    use super::*;

    #[derive(Clone)]
    struct IgnoreTransport;

    impl TransportSender for IgnoreTransport {
        fn ping(&self, _id: Id) {}

        type Fut = Ready<Result<Response, TransportError>>;
        fn send(&self, _id: Id, _msg: Request) -> Self::Fut {
            future::ready(Err(TransportError::ContactLost))
        }

        type Contact = Id;
        fn wrap_contact(&self, id: Id) -> Id {
            id
        }
    }

    #[test]
    fn failed_probe_admits_the_candidate() {
        let config = SystemConfig {
            routing: crate::config::RoutingConfig {
                bucket_size: 2,
                alpha: 3,
                max_buckets: 1,
            },
            ..Default::default()
        };
        let dht = Dht::new(config, Id::from_hex("a0"), IgnoreTransport);
        let (b, c, d) = (Id::from_hex("b0"), Id::from_hex("c0"), Id::from_hex("d0"));
        assert!(dht.on_connect(b));
        assert!(dht.on_connect(c));

        // The single bucket is full and cannot split
        assert!(matches!(
            dht.add_contact(d),
            InsertOutcome::Probe { candidate, evict } if candidate == d && evict == b
        ));

        dht.resolve_probe(b, false);
        let table = dht.table.lock().unwrap();
        let closest = table.find_closest(d, 3);
        assert!(closest.contains(&d) && !closest.contains(&b));
    }

    #[test]
    fn request_dispatch() {
        let dht = Dht::new(SystemConfig::default(), Id::from_hex("a0"), IgnoreTransport);
        let b = Id::from_hex("b0");
        let c = Id::from_hex("c0");
        assert!(dht.on_connect(b));
        assert!(dht.on_connect(c));

        assert_eq!(dht.on_request(b, Request::Ping), Response::Pong);

        let res = dht.on_request(b, Request::FindNodes(Id::from_hex("c1")));
        match res {
            Response::FoundNodes(found) => {
                // The requester itself is never returned
                assert_eq!(found, vec![c]);
            }
            x => panic!("unexpected response {x:?}"),
        }

        dht.on_disconnect(c);
        let res = dht.on_request(b, Request::FindNodes(Id::from_hex("c1")));
        assert_eq!(res, Response::FoundNodes(vec![]));
    }
}
