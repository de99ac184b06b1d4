//! ShardIO Recovery - Recovery subset calculation
//!
//! When a replica is missing an object, recovery does not always need to
//! push every byte: parts of a clone (or of the head) may be shared with an
//! older clone the replica already has, and can be cloned locally instead.
//! This crate computes that split:
//! - Subsets: which byte ranges to push and which to clone from where
//! - Recovery info: the per-object record handed to the push machinery
//! - Backfill intervals: the scanned range of objects backfill works on

pub mod backfill;
pub mod recovery_info;
pub mod subsets;

pub use backfill::BackfillInterval;
pub use recovery_info::ObjectRecoveryInfo;
pub use subsets::{RecoverySubsets, calc_clone_subsets, calc_head_subsets, set_subsets};
