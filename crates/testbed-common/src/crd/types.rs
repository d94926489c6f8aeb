//! Shared types used across CRD status blocks

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., AnalysisComplete)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Insert or replace a condition keyed by type.
///
/// The transition time is kept when the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let keep_time = existing.status == condition.status;
            let previous = existing.last_transition_time;
            *existing = condition;
            if keep_time {
                existing.last_transition_time = previous;
            }
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let cond = Condition::new("AnalysisComplete", ConditionStatus::True, "Succeeded", "done");
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "AnalysisComplete");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }

    #[test]
    fn set_condition_replaces_by_type() {
        let mut conditions = vec![Condition::new(
            "AnalysisComplete",
            ConditionStatus::Unknown,
            "Pending",
            "",
        )];
        set_condition(
            &mut conditions,
            Condition::new("AnalysisComplete", ConditionStatus::False, "JobNotFound", "gone"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "JobNotFound");
        assert_eq!(conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_unchanged() {
        let mut first = Condition::new("Ready", ConditionStatus::True, "A", "");
        first.last_transition_time = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let mut conditions = vec![first];
        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "B", "updated"),
        );
        assert_eq!(conditions[0].reason, "B");
        assert_eq!(conditions[0].last_transition_time.timestamp(), 1_700_000_000);
    }
}
