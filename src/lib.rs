//! A concurrent hash map with lock-free reads and per-bin locking for writes.
//!
//! ```
//! use chash_map::HashMap;
//!
//! let map = HashMap::new();
//! let guard = map.guard();
//! map.insert("apple", 1, &guard);
//! assert_eq!(map.get("apple", &guard), Some(&1));
//! assert_eq!(map.remove("apple", &guard), Some(&1));
//! assert!(map.is_empty());
//! ```
//!
//! Memory is reclaimed with epochs: every map owns its own collector, and an
//! entry removed or replaced while some [`Guard`] of that map is alive is only
//! freed once all such guards have been dropped. The collector itself is
//! internal; guards only come from [`HashMap::guard`].
//!
//! ```compile_fail
//! let collector = chash_map::Collector::new(64);
//! ```
#![allow(clippy::cognitive_complexity)]

mod config;
mod error;
mod map;
mod node;
mod raw;
mod reclaim;

pub use config::MapConfig;
pub use error::{ConfigError, TryInsertError};
pub use map::HashMap;
pub use reclaim::Guard;

/// Default hasher for [`HashMap`].
pub type DefaultHashBuilder = ahash::RandomState;
