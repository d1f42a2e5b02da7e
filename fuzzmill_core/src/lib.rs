//! Core data structures and algorithms of fuzzmill

use ahash::{AHashMap, AHashSet};

pub mod coverage;
pub mod crash;
pub mod minimize;
pub mod parse;
pub mod queue;
pub mod report;
pub mod util;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;
