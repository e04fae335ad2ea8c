use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};

/// Returned by [`HashMap::try_insert`](crate::HashMap::try_insert) when the
/// key was already present.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TryInsertError<'a, V> {
    /// The value already associated with the key.
    pub current: &'a V,
    /// The value that was not inserted.
    pub not_inserted: V,
}

impl<'a, V> Display for TryInsertError<'a, V>
where
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Insert of \"{:?}\" failed as key was already present with value \"{:?}\"",
            self.not_inserted, self.current
        )
    }
}

impl<'a, V> Error for TryInsertError<'a, V>
where
    V: Debug,
{
    #[inline]
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

/// An invalid [`MapConfig`](crate::MapConfig).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConfigError {
    /// The load factor was not in `(0, 1]`.
    LoadFactor(f32),
    /// Trees need at least two entries to be worth building.
    TreeifyThreshold(usize),
    /// The untreeify threshold must be smaller than the treeify threshold.
    UntreeifyThreshold { untreeify: usize, treeify: usize },
    /// Garbage must be collected after at least one retirement.
    CollectThreshold,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            ConfigError::LoadFactor(lf) => {
                write!(f, "load factor {} is outside of (0, 1]", lf)
            }
            ConfigError::TreeifyThreshold(t) => {
                write!(f, "treeify threshold {} is smaller than 2", t)
            }
            ConfigError::UntreeifyThreshold { untreeify, treeify } => write!(
                f,
                "untreeify threshold {} must be smaller than treeify threshold {}",
                untreeify, treeify
            ),
            ConfigError::CollectThreshold => f.write_str("collect threshold must be at least 1"),
        }
    }
}

impl Error for ConfigError {}
