use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw identifier value.
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw identifier value.
            #[must_use]
            pub const fn get(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_id!(SegmentId, "Identifier of a segment; allocated in creation order.");
define_id!(PlanId, "Identifier of a single compaction plan.");
define_id!(
    PlanGroupId,
    "Identifier of the plan group produced by one compaction trigger call."
);
define_id!(PartitionId, "Identifier of a partition within a collection.");
define_id!(ShardId, "Shard (virtual channel) index within a collection.");

/// Unique identifier for a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(Uuid);

impl CollectionId {
    /// Generates a new identifier using UUID v7.
    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates an identifier from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CollectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Monotonic allocator for the numeric identifiers above.
///
/// One allocator backs every id kind of a server so segment, plan and group
/// ids never collide and always increase in allocation order.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Creates an allocator whose first id is `start`.
    #[must_use]
    pub const fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a fresh segment id.
    pub fn segment(&self) -> SegmentId {
        SegmentId(self.next_raw())
    }

    /// Allocates a fresh plan id.
    pub fn plan(&self) -> PlanId {
        PlanId(self.next_raw())
    }

    /// Allocates a fresh plan group id.
    pub fn plan_group(&self) -> PlanGroupId {
        PlanGroupId(self.next_raw())
    }

    /// Allocates a fresh partition id.
    pub fn partition(&self) -> PartitionId {
        PartitionId(self.next_raw())
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}
