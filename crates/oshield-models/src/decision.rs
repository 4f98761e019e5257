//! Reviewer decisions applied after the waiting-for-review pause.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// What the reviewer chose to do with one verification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    /// Leave the region untouched
    #[default]
    NoModify,
    Blur,
    Pixelate,
    Mask,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::NoModify => "no_modify",
            DecisionAction::Blur => "blur",
            DecisionAction::Pixelate => "pixelate",
            DecisionAction::Mask => "mask",
        }
    }

    /// Whether this decision produces an anonymization action.
    pub fn modifies(&self) -> bool {
        !matches!(self, DecisionAction::NoModify)
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One reviewer decision for one verification record.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct UserDecision {
    #[validate(length(min = 1))]
    pub verification_id: String,
    #[serde(default)]
    pub action: DecisionAction,
    #[serde(default = "default_confirmed")]
    pub confirmed_violation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_confirmed() -> bool {
    true
}

/// Batch of decisions submitted by the reviewer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct UserDecisionBatch {
    #[validate(length(min = 1), nested)]
    pub decisions: Vec<UserDecision>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_modify_does_not_modify() {
        assert!(!DecisionAction::NoModify.modifies());
        assert!(DecisionAction::Blur.modifies());
        assert!(DecisionAction::Mask.modifies());
    }

    #[test]
    fn test_empty_batch_rejected() {
        let batch = UserDecisionBatch { decisions: vec![] };
        assert!(batch.validate().is_err());
    }

    #[test]
    fn test_decision_defaults() {
        let json = r#"{"verification_id": "gdpr_verification:abc"}"#;
        let decision: UserDecision = serde_json::from_str(json).unwrap();
        assert_eq!(decision.action, DecisionAction::NoModify);
        assert!(decision.confirmed_violation);
        assert!(decision.validate().is_ok());
    }
}
