//! converge core types: reconciliation units, inventories, conditions and the
//! cluster capability every other crate is written against.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod conditions;
pub mod duration;
pub mod inventory;
pub mod mock;
pub mod status;
pub mod types;

pub use cluster::{Cluster, ClusterError};
pub use conditions::{Condition, ConditionStatus, ConditionType, Conditions, Reason};
pub use inventory::{Inventory, InventoryEntry, InventoryError, ObjectKey, ObjectRef};
pub use types::{Kustomization, KustomizationSpec, KustomizationStatus, UnitKey};

/// Raw Kubernetes object as rendered or read back from the cluster.
pub type Json = serde_json::Value;

pub mod prelude {
    pub use super::{
        Cluster, ClusterError, Condition, ConditionStatus, ConditionType, Inventory, Json, Kustomization,
        KustomizationSpec, KustomizationStatus, ObjectKey, ObjectRef, Reason, UnitKey,
    };
}
