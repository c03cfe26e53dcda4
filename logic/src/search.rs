use std::collections::HashSet;
use std::iter;

use futures::prelude::*;
use futures::stream::FuturesUnordered;
use tracing::{debug, instrument, warn};

use crate::transport::{Contact, RawResponse, Request, TransportError, TransportSender};
use crate::{Dht, Id};

#[derive(Clone, Debug)]
pub struct LookupOptions {
    // Also called alpha in the original paper:
    // n. of candidates queried in parallel
    pub parallelism: u32,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self { parallelism: 3 }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum QueryState {
    Waiting,
    Querying,
    Queried,
}

/// Iterative `FIND_NODE` lookup.
///
/// Keeps a bucket-size window of the closest contacts seen so far;
/// at most `parallelism` queries are in flight at a time, always
/// against the closest not-yet-contacted candidates. Newly returned
/// contacts are merged into the window (deduplicated, self excluded)
/// and the window is re-sorted and truncated.
///
/// The lookup converges when the whole window has been queried, or
/// when a full round of `parallelism` answers brings no improvement of
/// the best distance; in the latter case no new queries are issued but
/// results of in-flight ones are still merged when they arrive.
pub struct Lookup<'a, T: TransportSender> {
    dht: &'a Dht<T>,
    options: LookupOptions,
    target: Id,
}

impl<'a, T: TransportSender> Lookup<'a, T> {
    pub fn new(dht: &'a Dht<T>, options: LookupOptions, target: Id) -> Self {
        Self {
            dht,
            options,
            target,
        }
    }

    fn start_query(
        &self,
        window: &mut [(QueryState, T::Contact)],
    ) -> Option<impl Future<Output = (Id, Result<RawResponse<T::Contact>, TransportError>)>> {
        // The window is distance-sorted, so the first waiting entry is
        // the closest unqueried candidate
        let entry = window.iter_mut().find(|x| x.0 == QueryState::Waiting)?;

        entry.0 = QueryState::Querying;
        let queried_id = entry.1.id();

        let fut = self.dht.transport().send(queried_id, Request::FindNodes(self.target));
        Some(fut.map(move |x| (queried_id, x)))
    }

    fn sort_window(&self, window: &mut Vec<(QueryState, T::Contact)>) {
        let target = self.target;
        window.sort_by_key(|x| x.1.id() ^ target);
    }

    fn best_distance(&self, window: &[(QueryState, T::Contact)]) -> Option<Id> {
        window.first().map(|x| x.1.id() ^ self.target)
    }

    #[instrument(skip_all, fields(target = %self.target))]
    pub async fn run(&self, seed: Vec<T::Contact>) -> Vec<T::Contact> {
        let bucket_size = self.dht.config().routing.bucket_size;
        let parallelism = self.options.parallelism;

        let mut queried: HashSet<Id> = seed.iter().map(|x| x.id()).collect();
        queried.insert(self.dht.id());
        debug!("Seed window: {:?}", seed);

        let self_contact = self.dht.transport().wrap_contact(self.dht.id());
        let mut window: Vec<(QueryState, T::Contact)> = seed
            .into_iter()
            .map(|x| (QueryState::Waiting, x))
            .chain(iter::once((QueryState::Queried, self_contact)))
            .collect();
        self.sort_window(&mut window);
        window.truncate(bucket_size);

        let mut best = self.best_distance(&window);
        // Completed queries since `best` last improved; once a full
        // round passes without improvement, stop issuing new queries
        let mut stagnant = 0u32;

        let pending: FuturesUnordered<_> = (0..parallelism)
            .filter_map(|_| self.start_query(&mut window))
            .collect();
        let mut available_slots = parallelism - pending.len() as u32;

        tokio::pin!(pending);
        while let Some((id, res)) = pending.next().await {
            available_slots += 1;
            if let Some(entry) = window.iter_mut().find(|x| x.1.id() == id) {
                entry.0 = QueryState::Queried;
            }
            // (a slower peer may have fallen out of the window; its
            // answer is still merged below)

            match res {
                Err(x) => {
                    // Unreachable for this lookup only, the routing
                    // table keeps its own liveness accounting
                    debug!("Error querying {:?}: {}", id, x);
                    stagnant += 1;
                }
                Ok(RawResponse::FoundNodes(nodes)) => {
                    window.extend(
                        nodes
                            .into_iter()
                            .filter(|x| queried.insert(x.id()))
                            .map(|x| (QueryState::Waiting, x)),
                    );
                    self.sort_window(&mut window);
                    window.truncate(bucket_size);

                    let round_best = self.best_distance(&window);
                    if round_best < best {
                        best = round_best;
                        stagnant = 0;
                    } else {
                        stagnant += 1;
                    }
                }
                Ok(x) => {
                    warn!("Node {:?} returned an invalid lookup response: {:?}", id, x);
                    stagnant += 1;
                }
            }

            if window.iter().all(|x| x.0 == QueryState::Queried) {
                // Every candidate in the closest window answered;
                // nobody left can know anything closer
                break;
            }

            if stagnant >= parallelism {
                // No improvement over a full round: converged, just
                // drain what is still in flight
                continue;
            }

            while available_slots > 0 {
                match self.start_query(&mut window) {
                    None => break,
                    Some(x) => pending.push(x),
                }
                available_slots -= 1;
            }
        }

        window.into_iter().map(|x| x.1).collect()
    }
}
