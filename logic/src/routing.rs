use std::collections::BTreeMap;

use itertools::Itertools;
use tracing::debug;

use crate::config::RoutingConfig;
use crate::consts::ID_LEN_BITS;
use crate::id::Id;
use crate::kbucket::KBucket;

/// What `RoutingTable::insert` did with a candidate contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Appended to a bucket with free capacity (possibly after one or
    /// more splits).
    Inserted,
    /// Already present, moved to the most-recently-seen position.
    Refreshed,
    /// Dropped: the candidate is the local id, or the owning bucket is
    /// full and splitting is no longer permitted after a probe already
    /// kept the incumbent.
    Ignored,
    /// The owning bucket is full and may not split. The caller must
    /// probe `evict` for liveness and then call
    /// [`RoutingTable::replace`] if the probe fails, or
    /// [`RoutingTable::refresh`] if it succeeds (the candidate is then
    /// dropped).
    Probe { candidate: Id, evict: Id },
}

/// Prefix-keyed k-bucket table.
///
/// Starts as a single bucket with the empty prefix covering the whole
/// id space; buckets split on demand, but only while the split touches
/// the bucket owning the local id (or that bucket is still a
/// singleton). The bucket prefixes partition the id space at all
/// times.
pub struct RoutingTable {
    local_id: Id,
    config: RoutingConfig,
    buckets: BTreeMap<String, KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: Id, config: RoutingConfig) -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(String::new(), KBucket::new(String::new(), config.bucket_size));
        RoutingTable {
            local_id,
            config,
            buckets,
        }
    }

    pub fn local_id(&self) -> Id {
        self.local_id
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> impl Iterator<Item = &KBucket> {
        self.buckets.values()
    }

    /// Key of the bucket responsible for `id`: the longest stored
    /// prefix matching it. Exactly one bucket matches because the
    /// prefixes partition the space.
    fn owning_key(&self, id: Id) -> String {
        let bits = id.bits();
        self.buckets
            .keys()
            .filter(|prefix| bits.starts_with(prefix.as_str()))
            .max_by_key(|prefix| prefix.len())
            .expect("bucket prefixes no longer cover the id space")
            .clone()
    }

    pub fn has(&self, id: Id) -> bool {
        self.buckets[&self.owning_key(id)].has(id)
    }

    pub fn insert(&mut self, id: Id) -> InsertOutcome {
        if id == self.local_id {
            return InsertOutcome::Ignored;
        }

        let mut key = self.owning_key(id);
        if self.buckets[&key].has(id) {
            self.buckets.get_mut(&key).unwrap().refresh(id);
            return InsertOutcome::Refreshed;
        }

        // Split while the located bucket is full and splitting is
        // still permitted
        while self.buckets[&key].is_full() && self.may_split(&key) {
            let bucket = self.buckets.remove(&key).unwrap();
            let (zero, one) = bucket.split();
            debug!(local=%self.local_id, "Splitting bucket '{key}'");
            self.buckets.insert(zero.prefix().to_owned(), zero);
            self.buckets.insert(one.prefix().to_owned(), one);
            key = self.owning_key(id);
        }

        let bucket = self.buckets.get_mut(&key).unwrap();
        if !bucket.is_full() {
            bucket.update(id);
            return InsertOutcome::Inserted;
        }

        match bucket.oldest() {
            Some(evict) => InsertOutcome::Probe { candidate: id, evict },
            None => InsertOutcome::Ignored,
        }
    }

    /// Splits only touch the bucket covering the local id, or happen
    /// while that bucket still holds at most one contact; and the
    /// table never outgrows the id bit width.
    fn may_split(&self, key: &str) -> bool {
        if key.len() >= ID_LEN_BITS || self.buckets.len() >= self.config.max_buckets {
            return false;
        }
        let own_key = self.owning_key(self.local_id);
        *key == own_key || self.buckets[&own_key].len() <= 1
    }

    /// Moves an already-known contact to the most-recently-seen slot.
    pub fn refresh(&mut self, id: Id) -> bool {
        let key = self.owning_key(id);
        self.buckets.get_mut(&key).unwrap().refresh(id)
    }

    pub fn remove(&mut self, id: Id) -> bool {
        let key = self.owning_key(id);
        self.buckets.get_mut(&key).unwrap().remove(id)
    }

    /// Evicts `old` (its liveness probe failed) and admits `candidate`
    /// in its stead.
    pub fn replace(&mut self, old: Id, candidate: Id) -> InsertOutcome {
        self.remove(old);
        self.insert(candidate)
    }

    /// Up to `count` known contacts, from buckets ordered by longest
    /// matching prefix with `target`; every bucket's contribution is
    /// distance-sorted before concatenation.
    pub fn find_closest(&self, target: Id, count: usize) -> Vec<Id> {
        let bits = target.bits();
        self.buckets
            .values()
            .sorted_by_key(|bucket| std::cmp::Reverse(common_prefix_len(bucket.prefix(), &bits)))
            .flat_map(|bucket| bucket.closest(target))
            .take(count)
            .collect()
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}
