//! In-memory [`Cluster`] for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use kube::core::GroupVersionKind;
use serde_json::Value as Json;

use crate::cluster::{has_labels, Cluster, ClusterError};
use crate::inventory::{ObjectKey, ObjectRef};

/// A mutation performed through the [`Cluster`] surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Apply(ObjectRef),
    Delete(ObjectRef),
}

#[derive(Default)]
struct MockState {
    objects: BTreeMap<ObjectKey, Json>,
    ops: Vec<MockOp>,
    apply_errors: HashMap<ObjectKey, ClusterError>,
    delete_errors: HashMap<ObjectKey, ClusterError>,
    immutable: HashSet<ObjectKey>,
}

/// Simple in-memory cluster. Server-owned `status` survives applies.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object without recording an op.
    pub fn insert(&self, obj: Json) {
        if let Some(id) = ObjectRef::from_object(&obj) {
            self.lock().objects.insert(id.object_key(), obj);
        }
    }

    pub fn object(&self, id: &ObjectRef) -> Option<Json> {
        self.lock().objects.get(&id.object_key()).cloned()
    }

    pub fn contains(&self, id: &ObjectRef) -> bool {
        self.lock().objects.contains_key(&id.object_key())
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ops(&self) -> Vec<MockOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    pub fn deletes_of(&self, id: &ObjectRef) -> usize {
        self.lock()
            .ops
            .iter()
            .filter(|op| matches!(op, MockOp::Delete(d) if d.same_object(id)))
            .count()
    }

    pub fn fail_apply(&self, id: &ObjectRef, err: ClusterError) {
        self.lock().apply_errors.insert(id.object_key(), err);
    }

    pub fn fail_delete(&self, id: &ObjectRef, err: ClusterError) {
        self.lock().delete_errors.insert(id.object_key(), err);
    }

    /// Drop every injected apply and delete failure.
    pub fn clear_failures(&self) {
        let mut st = self.lock();
        st.apply_errors.clear();
        st.delete_errors.clear();
    }

    /// Updates to an existing `id` are rejected as immutable-field changes.
    pub fn make_immutable(&self, id: &ObjectRef) {
        self.lock().immutable.insert(id.object_key());
    }

    /// Replace the server-owned status of a stored object.
    pub fn set_status(&self, id: &ObjectRef, status: Json) {
        if let Some(obj) = self.lock().objects.get_mut(&id.object_key()) {
            if let Some(map) = obj.as_object_mut() {
                map.insert("status".into(), status);
            }
        }
    }
}

#[async_trait::async_trait]
impl Cluster for MockCluster {
    async fn get(&self, id: &ObjectRef) -> Result<Option<Json>, ClusterError> {
        Ok(self.object(id))
    }

    async fn apply(&self, object: &Json) -> Result<Json, ClusterError> {
        let id = ObjectRef::from_object(object)
            .ok_or_else(|| ClusterError::Other("object missing apiVersion, kind or metadata.name".into()))?;
        let key = id.object_key();
        let mut st = self.lock();
        if let Some(err) = st.apply_errors.get(&key) {
            return Err(err.clone());
        }
        if st.immutable.contains(&key) && st.objects.contains_key(&key) {
            return Err(ClusterError::Immutable(format!("{}: field is immutable", id)));
        }
        let mut stored = object.clone();
        let live_status = st.objects.get(&key).and_then(|o| o.get("status")).cloned();
        if let (Some(status), Some(map)) = (live_status, stored.as_object_mut()) {
            map.insert("status".into(), status);
        }
        st.objects.insert(key, stored.clone());
        st.ops.push(MockOp::Apply(id));
        Ok(stored)
    }

    async fn delete(&self, id: &ObjectRef) -> Result<(), ClusterError> {
        let key = id.object_key();
        let mut st = self.lock();
        if let Some(err) = st.delete_errors.get(&key) {
            return Err(err.clone());
        }
        if st.objects.remove(&key).is_none() {
            return Err(ClusterError::NotFound(id.to_string()));
        }
        st.ops.push(MockOp::Delete(id.clone()));
        Ok(())
    }

    async fn list_by_label(
        &self,
        gvk: &GroupVersionKind,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Json>, ClusterError> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.group == gvk.group && k.kind == gvk.kind)
            .filter(|(_, obj)| has_labels(obj, labels))
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}
