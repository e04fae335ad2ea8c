use crate::error::ConfigError;
use crate::reclaim::DEFAULT_COLLECT_THRESHOLD;
use serde::{Deserialize, Serialize};

/// Construction-time tuning knobs for a [`HashMap`](crate::HashMap).
///
/// ```
/// use chash_map::MapConfig;
///
/// let config = MapConfig::default()
///     .with_initial_capacity(1024)
///     .with_load_factor(0.5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Number of entries to size the first table for. Zero allocates the
    /// default table lazily on first insert.
    pub initial_capacity: usize,
    /// Fraction of the bins that may be occupied before the table doubles.
    pub load_factor: f32,
    /// Chain length at which a bin is converted into a balanced tree.
    pub treeify_threshold: usize,
    /// Removing from a tree that is left with fewer nodes than this turns
    /// the bin back into a chain. When a resize splits a tree, halves of at
    /// most this many nodes become chains.
    pub untreeify_threshold: usize,
    /// Number of retired objects a thread accumulates before it tries to
    /// advance the epoch and free them.
    pub collect_threshold: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            initial_capacity: 0,
            load_factor: 0.75,
            treeify_threshold: 8,
            untreeify_threshold: 6,
            collect_threshold: DEFAULT_COLLECT_THRESHOLD,
        }
    }
}

impl MapConfig {
    /// Sets how many entries the first table holds without resizing.
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// Sets the fill ratio at which the table doubles.
    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Sets the chain length at which a bin becomes a tree.
    pub fn with_treeify_threshold(mut self, treeify_threshold: usize) -> Self {
        self.treeify_threshold = treeify_threshold;
        self
    }

    /// Sets the node count below which a tree bin reverts to a chain.
    pub fn with_untreeify_threshold(mut self, untreeify_threshold: usize) -> Self {
        self.untreeify_threshold = untreeify_threshold;
        self
    }

    /// Sets how many retired objects a thread holds before it tries to free them.
    pub fn with_collect_threshold(mut self, collect_threshold: usize) -> Self {
        self.collect_threshold = collect_threshold;
        self
    }

    /// Checks that the values describe a usable map.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(ConfigError::LoadFactor(self.load_factor));
        }
        if self.treeify_threshold < 2 {
            return Err(ConfigError::TreeifyThreshold(self.treeify_threshold));
        }
        if self.untreeify_threshold >= self.treeify_threshold {
            return Err(ConfigError::UntreeifyThreshold {
                untreeify: self.untreeify_threshold,
                treeify: self.treeify_threshold,
            });
        }
        if self.collect_threshold == 0 {
            return Err(ConfigError::CollectThreshold);
        }
        Ok(())
    }
}
