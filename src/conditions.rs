use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition as K8sCondition, Time};
pub use operator_derive::Conditions as DeriveConditions;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Create a Kubernetes meta/v1 Condition stamped with the current time
pub fn new_condition(
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    observed_generation: i64,
) -> K8sCondition {
    K8sCondition {
        type_: type_.to_string(),
        status: status.as_str().to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: Some(observed_generation),
        last_transition_time: Time(chrono::Utc::now()),
    }
}

// A trait for types that expose a Kubernetes-style `conditions` field
pub trait Conditions {
    // Accessors for the underlying conditions vector
    fn conditions(&self) -> &Option<Vec<K8sCondition>>;
    fn conditions_mut(&mut self) -> &mut Option<Vec<K8sCondition>>;

    fn find_condition(&self, type_: &str) -> Option<&K8sCondition> {
        self.conditions()
            .as_ref()
            .and_then(|conds| conds.iter().find(|c| c.type_ == type_))
    }

    fn is_condition_true(&self, type_: &str) -> bool {
        self.find_condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True.as_str())
    }

    /// Insert or replace the condition of the same type.
    ///
    /// Returns `false` and leaves the list untouched when status, reason,
    /// message and observed generation already match. New types are appended. `last_transition_time`
    /// is kept when the status does not change.
    fn upsert_condition(&mut self, new_cond: K8sCondition) -> bool {
        let conds = self.conditions_mut().get_or_insert_with(Vec::new);
        let Some(pos) = conds.iter().position(|c| c.type_ == new_cond.type_) else {
            conds.push(new_cond);
            return true;
        };
        let current = &mut conds[pos];
        if current.status == new_cond.status
            && current.reason == new_cond.reason
            && current.message == new_cond.message
            && current.observed_generation == new_cond.observed_generation
        {
            return false;
        }
        let last_transition_time = if current.status == new_cond.status {
            current.last_transition_time.clone()
        } else {
            new_cond.last_transition_time.clone()
        };
        *current = K8sCondition {
            last_transition_time,
            ..new_cond
        };
        true
    }

    // Default ergonomics: upsert a boolean condition into `self.conditions`
    fn upsert_bool(
        &mut self,
        type_: &str,
        status: bool,
        reason: &str,
        message: Option<&str>,
        observed_generation: i64,
    ) -> bool {
        let cond = new_condition(
            type_,
            status.into(),
            reason,
            message.unwrap_or(""),
            observed_generation,
        );
        self.upsert_condition(cond)
    }

    /// Drop the condition of the given type entirely
    fn remove_condition(&mut self, type_: &str) -> bool {
        match self.conditions_mut() {
            Some(conds) => {
                let before = conds.len();
                conds.retain(|c| c.type_ != type_);
                conds.len() != before
            }
            None => false,
        }
    }
}
