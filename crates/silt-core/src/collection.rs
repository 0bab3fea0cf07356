use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::{CollectionId, PartitionId};

/// Distance metric for vector similarity search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DistanceMetric {
    /// Euclidean (L2) distance; lower is more similar.
    L2,
    /// Inner product; higher is more similar.
    Ip,
    /// Cosine similarity; higher is more similar.
    Cosine,
}

impl DistanceMetric {
    /// Returns the canonical uppercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::L2 => "L2",
            Self::Ip => "IP",
            Self::Cosine => "COSINE",
        }
    }

    /// True when larger scores rank first.
    #[must_use]
    pub const fn higher_is_better(&self) -> bool {
        !matches!(self, Self::L2)
    }
}

impl Default for DistanceMetric {
    fn default() -> Self {
        Self::L2
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "L2" => Ok(Self::L2),
            "IP" => Ok(Self::Ip),
            "COSINE" => Ok(Self::Cosine),
            _ => Err(()),
        }
    }
}

/// Field layout of a collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionSchema {
    pub name: String,
    /// Name of the int64 primary key field.
    pub primary_field: String,
    /// Name of the float vector field.
    pub vector_field: String,
    pub dimension: u32,
    pub shards_num: u32,
}

impl CollectionSchema {
    /// Default primary key field name.
    pub const DEFAULT_PRIMARY_FIELD: &'static str = "int64";
    /// Default vector field name.
    pub const DEFAULT_VECTOR_FIELD: &'static str = "float_vector";
    /// Default number of shards.
    pub const DEFAULT_SHARDS_NUM: u32 = 2;
    /// Maximum vector dimension.
    pub const MAX_DIMENSION: u32 = 32_768;

    /// Creates a schema with the default field names and shard count.
    #[must_use]
    pub fn new(name: impl Into<String>, dimension: u32) -> Self {
        Self {
            name: name.into(),
            primary_field: Self::DEFAULT_PRIMARY_FIELD.to_string(),
            vector_field: Self::DEFAULT_VECTOR_FIELD.to_string(),
            dimension,
            shards_num: Self::DEFAULT_SHARDS_NUM,
        }
    }

    /// Sets the shard count (builder pattern).
    #[must_use]
    pub fn with_shards(mut self, shards_num: u32) -> Self {
        self.shards_num = shards_num;
        self
    }

    /// Validates name, dimension and shard count.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first violated bound.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("collection name must not be empty".to_string());
        }
        if self.dimension == 0 || self.dimension > Self::MAX_DIMENSION {
            return Err(format!(
                "dimension {} is outside valid range [1, {}]",
                self.dimension,
                Self::MAX_DIMENSION
            ));
        }
        if self.shards_num == 0 {
            return Err("shards_num must be > 0".to_string());
        }
        if self.primary_field == self.vector_field {
            return Err("primary and vector fields must differ".to_string());
        }
        Ok(())
    }
}

/// A named partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub partition_id: PartitionId,
    pub name: String,
}

impl PartitionDescriptor {
    /// Name of the partition every collection starts with.
    pub const DEFAULT_NAME: &'static str = "_default";
}

/// Index built on the vector field; only its metric matters to this engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub field: String,
    pub metric: DistanceMetric,
}

/// Catalog entry for a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub collection_id: CollectionId,
    pub schema: CollectionSchema,
    pub partitions: Vec<PartitionDescriptor>,
    pub index: Option<IndexDescriptor>,
    pub created_at: DateTime<Utc>,
}

impl CollectionDescriptor {
    /// Creates a descriptor holding only the default partition.
    #[must_use]
    pub fn new(schema: CollectionSchema, default_partition: PartitionId) -> Self {
        Self {
            collection_id: CollectionId::new(),
            schema,
            partitions: vec![PartitionDescriptor {
                partition_id: default_partition,
                name: PartitionDescriptor::DEFAULT_NAME.to_string(),
            }],
            index: None,
            created_at: Utc::now(),
        }
    }

    /// Looks up a partition by name.
    #[must_use]
    pub fn partition(&self, name: &str) -> Option<&PartitionDescriptor> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// The default partition.
    #[must_use]
    pub fn default_partition(&self) -> PartitionId {
        self.partitions[0].partition_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_parse_is_case_insensitive() {
        assert_eq!("ip".parse::<DistanceMetric>(), Ok(DistanceMetric::Ip));
        assert_eq!("L2".parse::<DistanceMetric>(), Ok(DistanceMetric::L2));
        assert!("HAMMING".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn test_schema_validation() {
        assert!(CollectionSchema::new("c", 8).validate().is_ok());
        assert!(CollectionSchema::new("", 8).validate().is_err());
        assert!(CollectionSchema::new("c", 0).validate().is_err());
        assert!(CollectionSchema::new("c", 8).with_shards(0).validate().is_err());
    }
}
