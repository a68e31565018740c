//! Variable elimination ordering.

use crate::core::Key;
use crate::error::{PcgError, PcgResult};
use std::collections::HashMap;
use std::fmt;

/// Sequence of unique variable keys, fixed for one solve cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ordering {
    keys: Vec<Key>,
    positions: HashMap<Key, usize>,
}

impl Ordering {
    /// Create an ordering, rejecting duplicate keys
    pub fn new(keys: Vec<Key>) -> PcgResult<Self> {
        let mut positions = HashMap::with_capacity(keys.len());
        for (i, &key) in keys.iter().enumerate() {
            if positions.insert(key, i).is_some() {
                return Err(PcgError::InvalidInput(format!(
                    "Key {key} appears more than once in ordering"
                )));
            }
        }
        Ok(Self { keys, positions })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Key> + '_ {
        self.keys.iter().copied()
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Position of `key` in the ordering
    pub fn position(&self, key: Key) -> Option<usize> {
        self.positions.get(&key).copied()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.positions.contains_key(&key)
    }
}

impl fmt::Display for Ordering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.keys.iter().map(|k| format!("x{k}")).collect();
        write!(f, "Ordering [{}]", keys.join(", "))
    }
}
