//! Legal verdict shapes produced by the witness and judge.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a violation. Ordering is by escalation level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
    Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Anonymization recommended for a track. Ordering is by protectiveness,
/// so `max` picks the most protective of two recommendations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
    Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    #[default]
    None,
    Blur,
    Pixelate,
    Mask,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendedAction::None => "none",
            RecommendedAction::Blur => "blur",
            RecommendedAction::Pixelate => "pixelate",
            RecommendedAction::Mask => "mask",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "blur" => RecommendedAction::Blur,
            "pixelate" => RecommendedAction::Pixelate,
            "mask" | "scramble" => RecommendedAction::Mask,
            _ => RecommendedAction::None,
        }
    }
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-capture verdict, either rule-derived or fused later by the judge.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct Verdict {
    pub is_violation: bool,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub violated_articles: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub recommended_action: RecommendedAction,
    #[serde(default)]
    pub confidence: f64,
}

/// Final per-track decision produced by the judge.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct TrackVerdict {
    pub is_violation: bool,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub violated_articles: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub recommended_action: RecommendedAction,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub max_confidence: f64,
    /// Vulnerability type for person tracks (medical, minor, …), if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vulnerability_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::None);
    }

    #[test]
    fn test_action_protectiveness_ordering() {
        // mask > pixelate > blur > none
        assert!(RecommendedAction::Mask > RecommendedAction::Pixelate);
        assert!(RecommendedAction::Pixelate > RecommendedAction::Blur);
        assert!(RecommendedAction::Blur > RecommendedAction::None);
        assert_eq!(
            RecommendedAction::Blur.max(RecommendedAction::Pixelate),
            RecommendedAction::Pixelate
        );
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(Severity::parse("High"), Severity::High);
        assert_eq!(Severity::parse("CRITICAL"), Severity::Critical);
        assert_eq!(RecommendedAction::parse("Blur"), RecommendedAction::Blur);
        assert_eq!(RecommendedAction::parse("nonsense"), RecommendedAction::None);
    }
}
