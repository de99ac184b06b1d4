//! Metadata source contract
//!
//! The loader never reads object metadata itself; it asks the placement
//! group's backend through [`PgBackend`].

use async_trait::async_trait;
use shardio_common::{ObjectId, ObjectState, Result, SnapSet, SnapSetContextRef};

/// Metadata read for one object
#[derive(Debug, Clone)]
pub struct LoadedMetadata {
    pub os: ObjectState,
    /// Snapset context; present for heads, absent for clones
    pub ssc: Option<SnapSetContextRef>,
}

impl LoadedMetadata {
    #[must_use]
    pub const fn for_head(os: ObjectState, ssc: SnapSetContextRef) -> Self {
        Self { os, ssc: Some(ssc) }
    }

    #[must_use]
    pub const fn for_clone(os: ObjectState) -> Self {
        Self { os, ssc: None }
    }
}

/// Backend of one placement group
#[async_trait]
pub trait PgBackend: Send + Sync {
    /// Read the object info (and, for a head, the snapset) of `oid`.
    ///
    /// A head the store has no record of loads as non-existent with an
    /// empty snapset context; a clone the store has no record of is
    /// `ObjectNotFound`.
    async fn load_metadata(&self, oid: &ObjectId) -> Result<LoadedMetadata>;

    /// Map a snapshot read to the clone (or head) holding its data
    fn resolve_oid(&self, snapset: &SnapSet, oid: &ObjectId) -> Option<ObjectId> {
        snapset.resolve_oid(oid)
    }
}
