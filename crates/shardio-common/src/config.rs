//! Configuration types for ShardIO
//!
//! This module defines the configuration consumed by the object context
//! layer and the recovery calculator, and [`ConfigProxy`], the live view
//! that components are handed at construction and that notifies them when
//! a key they track changes.

use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

pub const OBC_LRU_SIZE: &str = "crimson_osd_obc_lru_size";
pub const RECOVER_CLONE_OVERLAP: &str = "osd_recover_clone_overlap";
pub const RECOVER_CLONE_OVERLAP_LIMIT: &str = "osd_recover_clone_overlap_limit";

/// Root configuration for ShardIO
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Object context cache configuration
    #[serde(default)]
    pub obc: ObcConfig,
    /// Recovery configuration
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Object context cache configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObcConfig {
    /// Target number of object contexts kept in the registry
    #[serde(default = "default_obc_lru_size")]
    pub crimson_osd_obc_lru_size: u64,
}

impl Default for ObcConfig {
    fn default() -> Self {
        Self {
            crimson_osd_obc_lru_size: default_obc_lru_size(),
        }
    }
}

/// Recovery configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Copy clone overlap locally instead of pushing it
    #[serde(default = "default_recover_clone_overlap")]
    pub osd_recover_clone_overlap: bool,
    /// Give up on clone copies fragmented into more intervals than this
    #[serde(default = "default_recover_clone_overlap_limit")]
    pub osd_recover_clone_overlap_limit: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            osd_recover_clone_overlap: default_recover_clone_overlap(),
            osd_recover_clone_overlap_limit: default_recover_clone_overlap_limit(),
        }
    }
}

fn default_obc_lru_size() -> u64 {
    512
}

fn default_recover_clone_overlap() -> bool {
    true
}

fn default_recover_clone_overlap_limit() -> u64 {
    10
}

impl Config {
    /// Parse a TOML document; absent sections and keys take defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::configuration(e.to_string()))
    }

    /// Load a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Keys whose values differ between `self` and `other`
    #[must_use]
    pub fn diff(&self, other: &Self) -> BTreeSet<&'static str> {
        let mut changed = BTreeSet::new();
        if self.obc.crimson_osd_obc_lru_size != other.obc.crimson_osd_obc_lru_size {
            changed.insert(OBC_LRU_SIZE);
        }
        if self.recovery.osd_recover_clone_overlap != other.recovery.osd_recover_clone_overlap {
            changed.insert(RECOVER_CLONE_OVERLAP);
        }
        if self.recovery.osd_recover_clone_overlap_limit
            != other.recovery.osd_recover_clone_overlap_limit
        {
            changed.insert(RECOVER_CLONE_OVERLAP_LIMIT);
        }
        changed
    }
}

/// A component that reacts to configuration changes
pub trait ConfigObserver: Send + Sync {
    /// Keys this observer wants to hear about
    fn tracked_keys(&self) -> &'static [&'static str];

    /// Called on the owning shard after one or more tracked keys changed
    fn handle_conf_change(&self, conf: &Config, changed: &BTreeSet<&'static str>);
}

/// Live configuration handed to components at construction
///
/// Observers are held weakly: a component going away unregisters itself
/// implicitly.
pub struct ConfigProxy {
    current: RwLock<Config>,
    observers: Mutex<Vec<Weak<dyn ConfigObserver>>>,
}

impl ConfigProxy {
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(config),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Snapshot of the current configuration
    #[must_use]
    pub fn get(&self) -> Config {
        self.current.read().clone()
    }

    /// Current recovery section
    #[must_use]
    pub fn recovery(&self) -> RecoveryConfig {
        self.current.read().recovery.clone()
    }

    pub fn get_val_u64(&self, key: &str) -> Result<u64> {
        let conf = self.current.read();
        match key {
            OBC_LRU_SIZE => Ok(conf.obc.crimson_osd_obc_lru_size),
            RECOVER_CLONE_OVERLAP_LIMIT => Ok(conf.recovery.osd_recover_clone_overlap_limit),
            _ => Err(Error::configuration(format!("no u64 option named {key}"))),
        }
    }

    pub fn get_val_bool(&self, key: &str) -> Result<bool> {
        let conf = self.current.read();
        match key {
            RECOVER_CLONE_OVERLAP => Ok(conf.recovery.osd_recover_clone_overlap),
            _ => Err(Error::configuration(format!("no bool option named {key}"))),
        }
    }

    /// Register an observer; it is not called for the current values
    pub fn add_observer(&self, observer: Weak<dyn ConfigObserver>) {
        self.observers.lock().push(observer);
    }

    /// Set one option from its string form, notifying observers
    pub fn set_val(&self, key: &str, value: &str) -> Result<()> {
        let mut next = self.get();
        match key {
            OBC_LRU_SIZE => next.obc.crimson_osd_obc_lru_size = parse_value(key, value)?,
            RECOVER_CLONE_OVERLAP => {
                next.recovery.osd_recover_clone_overlap = parse_value(key, value)?;
            }
            RECOVER_CLONE_OVERLAP_LIMIT => {
                next.recovery.osd_recover_clone_overlap_limit = parse_value(key, value)?;
            }
            _ => return Err(Error::configuration(format!("unknown option {key}"))),
        }
        self.apply(next);
        Ok(())
    }

    /// Replace the whole configuration, notifying observers of changed keys
    pub fn apply(&self, next: Config) {
        let changed = {
            let mut current = self.current.write();
            let changed = current.diff(&next);
            *current = next;
            changed
        };
        if changed.is_empty() {
            return;
        }
        info!("Configuration changed: {:?}", changed);

        let conf = self.get();
        let observers: Vec<Arc<dyn ConfigObserver>> = {
            let mut observers = self.observers.lock();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            let relevant: BTreeSet<&'static str> = observer
                .tracked_keys()
                .iter()
                .copied()
                .filter(|k| changed.contains(k))
                .collect();
            if !relevant.is_empty() {
                observer.handle_conf_change(&conf, &relevant);
            }
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::configuration(format!("invalid value {value:?} for {key}")))
}
