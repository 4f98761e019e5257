//! Witness report: the objective visual description the vision LLM produces
//! for person detections. The witness describes, it never judges.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Level of clothing visible on the subject.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ClothingLevel {
    Formal,
    #[default]
    Casual,
    Athletic,
    Swimwear,
    Medical,
    Minimal,
    Uniform,
    Religious,
}

impl ClothingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClothingLevel::Formal => "formal",
            ClothingLevel::Casual => "casual",
            ClothingLevel::Athletic => "athletic",
            ClothingLevel::Swimwear => "swimwear",
            ClothingLevel::Medical => "medical",
            ClothingLevel::Minimal => "minimal",
            ClothingLevel::Uniform => "uniform",
            ClothingLevel::Religious => "religious",
        }
    }
}

impl fmt::Display for ClothingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Apparent age group of the subject.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AgeGroup {
    Child,
    Teenager,
    Adult,
    Elderly,
    #[default]
    Unknown,
}

impl AgeGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeGroup::Child => "child",
            AgeGroup::Teenager => "teenager",
            AgeGroup::Adult => "adult",
            AgeGroup::Elderly => "elderly",
            AgeGroup::Unknown => "unknown",
        }
    }

    /// Whether this age group forces the `minor` vulnerability type.
    pub fn is_minor(&self) -> bool {
        matches!(self, AgeGroup::Child | AgeGroup::Teenager)
    }
}

impl fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Visibility of biometric features in the capture.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct VisibleBiometrics {
    #[serde(default)]
    pub face_visible: bool,
    #[serde(default)]
    pub tattoos_visible: bool,
    #[serde(default)]
    pub scars_visible: bool,
    #[serde(default)]
    pub distinctive_marks: Vec<String>,
}

/// Structured objective description of one capture image.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct WitnessReport {
    /// Free-text factual summary of the scene
    #[serde(default)]
    pub visual_summary: String,
    /// Content tags (e.g. "hospital_gown", "beach")
    #[serde(default)]
    pub tags: Vec<String>,
    /// Single environment label (e.g. "medical_setting", "public_space")
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub clothing_level: ClothingLevel,
    #[serde(default)]
    pub visible_biometrics: VisibleBiometrics,
    /// Context hints the judge matches against its rulebook
    #[serde(default)]
    pub context_indicators: Vec<String>,
    #[serde(default)]
    pub age_group: AgeGroup,
    #[serde(default)]
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_age_groups() {
        assert!(AgeGroup::Child.is_minor());
        assert!(AgeGroup::Teenager.is_minor());
        assert!(!AgeGroup::Adult.is_minor());
        assert!(!AgeGroup::Unknown.is_minor());
    }

    #[test]
    fn test_report_deserializes_with_defaults() {
        let report: WitnessReport = serde_json::from_str("{}").unwrap();
        assert_eq!(report.age_group, AgeGroup::Unknown);
        assert_eq!(report.clothing_level, ClothingLevel::Casual);
        assert!(report.tags.is_empty());
    }

    #[test]
    fn test_report_roundtrip() {
        let report = WitnessReport {
            visual_summary: "person in a hospital corridor".to_string(),
            tags: vec!["hospital_gown".to_string()],
            environment: "medical_setting".to_string(),
            clothing_level: ClothingLevel::Medical,
            age_group: AgeGroup::Adult,
            confidence: 0.9,
            ..Default::default()
        };
        let json = serde_json::to_string(&report).unwrap();
        let back: WitnessReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.environment, "medical_setting");
        assert_eq!(back.clothing_level, ClothingLevel::Medical);
    }
}
