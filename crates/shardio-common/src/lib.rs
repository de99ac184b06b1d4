//! ShardIO Common - Shared types and utilities
//!
//! This crate provides the value types consumed by the object context layer
//! and the recovery calculator (object identifiers, snapshot sets, interval
//! sets, missing sets), together with the error and configuration
//! definitions shared by every ShardIO component.

pub mod config;
pub mod error;
pub mod interval;
pub mod missing;
pub mod snap;
pub mod types;

pub use config::{Config, ConfigObserver, ConfigProxy, ObcConfig, RecoveryConfig};
pub use error::{Error, InterruptReason, Result};
pub use interval::IntervalSet;
pub use missing::{CleanRegions, MissingItem, MissingSet};
pub use snap::{SnapSet, SnapSetContext, SnapSetContextRef};
pub use types::*;
