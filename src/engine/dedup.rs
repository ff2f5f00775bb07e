use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// FIFO-bounded set: remembers the most recent `capacity` keys.
#[derive(Clone, Debug)]
pub struct BoundedSet<T> {
    capacity: usize,
    order: VecDeque<T>,
    members: HashSet<T>,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Returns false when the key was already present.
    pub fn insert(&mut self, key: T) -> bool {
        if self.members.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.members.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &T) -> bool {
        self.members.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Oldest first, so `extend` on restore reproduces the eviction order.
    pub fn to_vec(&self) -> Vec<T> {
        self.order.iter().cloned().collect()
    }

    pub fn extend(&mut self, keys: impl IntoIterator<Item = T>) {
        for key in keys {
            self.insert(key);
        }
    }
}
