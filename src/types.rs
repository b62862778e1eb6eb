use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

pub type HashMap<K, V> = FxHashMap<K, V>;

pub type HashSet<K> = FxHashSet<K>;

/// Spike source identifier. Non-negative values are unique across all ranks, negative values
/// name sources that are only visible on their own thread.
pub type Gid = i32;

/// Identity of a model instance receiving events: the owning thread plus the instance's index
/// in that thread's target list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    pub thread: usize,
    pub index: usize,
}

impl TargetId {
    pub fn new(thread: usize, index: usize) -> Self {
        Self { thread, index }
    }
}
