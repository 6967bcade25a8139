//! Status conditions: a small map keyed by condition type with upsert semantics.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::types::MAX_CONDITION_MESSAGE_LENGTH;

pub const TRUNCATION_MARKER: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConditionType {
    Ready,
    Healthy,
    Progressing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Stable reason strings published on conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Progressing,
    DependencyNotReady,
    CycleDetected,
    BuildFailed,
    DecryptionFailed,
    SubstitutionFailed,
    ApplyFailed,
    PruneFailed,
    Unhealthy,
    ReconciliationSucceeded,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Progressing => "Progressing",
            Reason::DependencyNotReady => "DependencyNotReady",
            Reason::CycleDetected => "CycleDetected",
            Reason::BuildFailed => "BuildFailed",
            Reason::DecryptionFailed => "DecryptionFailed",
            Reason::SubstitutionFailed => "SubstitutionFailed",
            Reason::ApplyFailed => "ApplyFailed",
            Reason::PruneFailed => "PruneFailed",
            Reason::Unhealthy => "Unhealthy",
            Reason::ReconciliationSucceeded => "ReconciliationSucceeded",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn new(type_: ConditionType, status: ConditionStatus, reason: Reason, message: &str, generation: i64) -> Self {
        Self {
            type_,
            status,
            observed_generation: generation,
            last_transition_time: Utc::now(),
            reason: reason.as_str().to_string(),
            message: truncate_message(message),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Conditions kept sorted by type, at most one per type. Serialized as a plain list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct Conditions(SmallVec<[Condition; 3]>);

impl Conditions {
    pub fn get(&self, t: ConditionType) -> Option<&Condition> {
        self.position(t).ok().map(|i| &self.0[i])
    }

    /// Insert or replace the condition of the same type. The transition time of an
    /// existing entry is kept when its status does not change.
    pub fn set(&mut self, mut cond: Condition) {
        match self.position(cond.type_) {
            Ok(i) => {
                if self.0[i].status == cond.status {
                    cond.last_transition_time = self.0[i].last_transition_time;
                }
                self.0[i] = cond;
            }
            Err(i) => self.0.insert(i, cond),
        }
    }

    pub fn remove(&mut self, t: ConditionType) -> Option<Condition> {
        self.position(t).ok().map(|i| self.0.remove(i))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    fn position(&self, t: ConditionType) -> Result<usize, usize> {
        self.0.binary_search_by(|c| c.type_.cmp(&t))
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(list: Vec<Condition>) -> Self {
        let mut out = Conditions::default();
        for c in list {
            out.set(c);
        }
        out
    }
}

impl From<Conditions> for Vec<Condition> {
    fn from(c: Conditions) -> Self {
        c.0.into_vec()
    }
}

/// Bound a status message to [`MAX_CONDITION_MESSAGE_LENGTH`] characters plus a marker.
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_CONDITION_MESSAGE_LENGTH) {
        None => message.to_string(),
        Some((cut, _)) => format!("{}{}", &message[..cut], TRUNCATION_MARKER),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_by_type_and_keeps_order() {
        let mut c = Conditions::default();
        c.set(Condition::new(ConditionType::Healthy, ConditionStatus::True, Reason::ReconciliationSucceeded, "ok", 1));
        c.set(Condition::new(ConditionType::Ready, ConditionStatus::Unknown, Reason::Progressing, "working", 1));
        c.set(Condition::new(ConditionType::Ready, ConditionStatus::False, Reason::ApplyFailed, "boom", 2));
        assert_eq!(c.len(), 2);
        let types: Vec<_> = c.iter().map(|x| x.type_).collect();
        assert_eq!(types, vec![ConditionType::Ready, ConditionType::Healthy]);
        assert_eq!(c.get(ConditionType::Ready).unwrap().reason, "ApplyFailed");
        assert_eq!(c.get(ConditionType::Ready).unwrap().observed_generation, 2);
    }

    #[test]
    fn transition_time_moves_only_on_status_change() {
        let mut c = Conditions::default();
        let mut first = Condition::new(ConditionType::Ready, ConditionStatus::Unknown, Reason::Progressing, "a", 1);
        first.last_transition_time = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap();
        c.set(first);

        c.set(Condition::new(ConditionType::Ready, ConditionStatus::Unknown, Reason::Progressing, "b", 1));
        let kept = c.get(ConditionType::Ready).unwrap();
        assert_eq!(kept.last_transition_time.timestamp(), 1_000);
        assert_eq!(kept.message, "b");

        c.set(Condition::new(ConditionType::Ready, ConditionStatus::True, Reason::ReconciliationSucceeded, "c", 1));
        assert!(c.get(ConditionType::Ready).unwrap().last_transition_time.timestamp() > 1_000);
    }

    #[test]
    fn deserializes_unsorted_list_with_duplicates() {
        let raw = serde_json::json!([
            { "type": "Healthy", "status": "False", "lastTransitionTime": "2024-01-01T00:00:00Z", "reason": "Unhealthy", "message": "x" },
            { "type": "Ready", "status": "True", "lastTransitionTime": "2024-01-01T00:00:00Z", "reason": "ReconciliationSucceeded", "message": "y" },
            { "type": "Ready", "status": "False", "lastTransitionTime": "2024-01-02T00:00:00Z", "reason": "ApplyFailed", "message": "z" }
        ]);
        let c: Conditions = serde_json::from_value(raw).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.iter().next().unwrap().type_, ConditionType::Ready);
        assert_eq!(c.get(ConditionType::Ready).unwrap().reason, "ApplyFailed");
        let back = serde_json::to_value(&c).unwrap();
        assert_eq!(back.as_array().unwrap().len(), 2);
    }

    #[test]
    fn long_messages_are_truncated_with_marker() {
        let msg = "x".repeat(MAX_CONDITION_MESSAGE_LENGTH + 1);
        let out = truncate_message(&msg);
        assert_eq!(out.len(), MAX_CONDITION_MESSAGE_LENGTH + TRUNCATION_MARKER.len());
        assert!(out.ends_with(TRUNCATION_MARKER));

        let exact = "y".repeat(MAX_CONDITION_MESSAGE_LENGTH);
        assert_eq!(truncate_message(&exact), exact);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let msg = "é".repeat(MAX_CONDITION_MESSAGE_LENGTH + 5);
        let out = truncate_message(&msg);
        assert_eq!(out.chars().count(), MAX_CONDITION_MESSAGE_LENGTH + TRUNCATION_MARKER.len());
    }
}
