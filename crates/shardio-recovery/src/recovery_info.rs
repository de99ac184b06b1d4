//! Per-object recovery record

use serde::{Deserialize, Serialize};
use shardio_common::{Eversion, IntervalSet, ObjectId, ObjectInfo, SnapSet};
use std::collections::BTreeMap;
use std::fmt;

/// What a primary sends a replica to recover one object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecoveryInfo {
    pub soid: ObjectId,
    pub version: Eversion,
    pub size: u64,
    pub oi: ObjectInfo,
    /// Snapset of the head; empty for clones
    pub ss: SnapSet,
    /// Ranges pushed over the network
    pub copy_subset: IntervalSet,
    /// Ranges the replica clones locally, by donor clone
    pub clone_subset: BTreeMap<ObjectId, IntervalSet>,
    /// Whether the replica already has some version of the object
    pub object_exist: bool,
}

impl ObjectRecoveryInfo {
    #[must_use]
    pub fn new(soid: ObjectId, version: Eversion, size: u64) -> Self {
        let mut oi = ObjectInfo::new(soid.clone());
        oi.size = size;
        oi.version = version;
        Self {
            soid,
            version,
            size,
            oi,
            ss: SnapSet::default(),
            copy_subset: IntervalSet::new(),
            clone_subset: BTreeMap::new(),
            object_exist: false,
        }
    }

    /// Record built from the object's own metadata
    #[must_use]
    pub fn from_object_info(oi: ObjectInfo, ss: SnapSet) -> Self {
        Self {
            soid: oi.soid.clone(),
            version: oi.version,
            size: oi.size,
            oi,
            ss,
            copy_subset: IntervalSet::new(),
            clone_subset: BTreeMap::new(),
            object_exist: false,
        }
    }
}

impl fmt::Display for ObjectRecoveryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ObjectRecoveryInfo({}@{}, size: {}, copy_subset: {}, clone_subset: {{",
            self.soid, self.version, self.size, self.copy_subset
        )?;
        for (i, (clone, subset)) in self.clone_subset.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{clone}={subset}")?;
        }
        write!(f, "}}, snapset: {}, object_exist: {})", self.ss, self.object_exist)
    }
}
