use crate::id::{sort_by_distance, Id};

/// Fixed-capacity contact list covering one binary prefix of the id
/// space. Contacts are kept in recency order, the most recently seen
/// one at the tail.
#[derive(Debug, Clone)]
pub struct KBucket {
    prefix: String,
    k: usize,
    contacts: Vec<Id>,
}

impl KBucket {
    pub fn new(prefix: String, k: usize) -> Self {
        KBucket {
            prefix,
            k,
            contacts: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.k
    }

    pub fn has(&self, id: Id) -> bool {
        self.contacts.contains(&id)
    }

    pub fn covers(&self, id: Id) -> bool {
        self.prefix
            .bytes()
            .enumerate()
            .all(|(i, b)| id.bit(i) == (b == b'1'))
    }

    pub fn contacts(&self) -> &[Id] {
        &self.contacts
    }

    /// Least-recently-seen contact, the eviction candidate.
    pub fn oldest(&self) -> Option<Id> {
        self.contacts.first().copied()
    }

    /// Moves an already-known id to the most-recently-seen position.
    pub fn refresh(&mut self, id: Id) -> bool {
        match self.contacts.iter().position(|x| *x == id) {
            Some(index) => {
                self.contacts[index..].rotate_left(1);
                true
            }
            None => false,
        }
    }

    /// Appends the id if there is room for it, refreshes it if already
    /// present.
    pub fn update(&mut self, id: Id) -> bool {
        debug_assert!(self.covers(id));
        if self.refresh(id) {
            return true;
        }
        if self.is_full() {
            return false;
        }
        self.contacts.push(id);
        true
    }

    pub fn remove(&mut self, id: Id) -> bool {
        match self.contacts.iter().position(|x| *x == id) {
            Some(index) => {
                self.contacts.remove(index);
                true
            }
            None => false,
        }
    }

    /// Splits into the `prefix + '0'` and `prefix + '1'` children,
    /// redistributing the contacts and preserving recency order.
    pub fn split(self) -> (KBucket, KBucket) {
        let bit = self.prefix.len();
        let mut zero = KBucket::new(format!("{}0", self.prefix), self.k);
        let mut one = KBucket::new(format!("{}1", self.prefix), self.k);
        for id in self.contacts {
            if id.bit(bit) {
                one.contacts.push(id);
            } else {
                zero.contacts.push(id);
            }
        }
        (zero, one)
    }

    /// Contacts sorted ascending by distance to `target`.
    pub fn closest(&self, target: Id) -> Vec<Id> {
        let mut res = self.contacts.clone();
        sort_by_distance(&mut res, target);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_order() {
        let mut bucket = KBucket::new(String::new(), 3);
        let a = Id::from_hex("0a");
        let b = Id::from_hex("0b");
        let c = Id::from_hex("0c");
        assert!(bucket.update(a));
        assert!(bucket.update(b));
        assert!(bucket.update(c));
        assert_eq!(bucket.oldest(), Some(a));

        // Seeing a again moves it to the tail
        assert!(bucket.update(a));
        assert_eq!(bucket.oldest(), Some(b));
        assert_eq!(bucket.contacts().to_vec(), vec![b, c, a]);
    }

    #[test]
    fn full_bucket_rejects() {
        let mut bucket = KBucket::new(String::new(), 2);
        assert!(bucket.update(Id::from_hex("01")));
        assert!(bucket.update(Id::from_hex("02")));
        assert!(!bucket.update(Id::from_hex("03")));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn split_redistributes_by_bit() {
        let mut bucket = KBucket::new(String::new(), 4);
        bucket.update(Id::from_hex("00ff"));
        bucket.update(Id::from_hex("80ff"));
        bucket.update(Id::from_hex("7f00"));
        bucket.update(Id::from_hex("ff00"));
        let (zero, one) = bucket.split();
        assert_eq!(zero.prefix(), "0");
        assert_eq!(one.prefix(), "1");
        assert_eq!(zero.len(), 2);
        assert_eq!(one.len(), 2);
        assert!(zero.has(Id::from_hex("00ff")));
        assert!(zero.has(Id::from_hex("7f00")));
        assert!(one.has(Id::from_hex("80ff")));
        assert!(one.has(Id::from_hex("ff00")));
    }
}
