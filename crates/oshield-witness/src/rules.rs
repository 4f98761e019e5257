//! Deterministic verdicts for non-person detection types.
//!
//! The legal mapping for these classes does not need perception: a readable
//! plate or an identity document in frame is a violation by rule. Keeping the
//! table out of the model makes it testable and keeps the LLM from emitting
//! unvalidated legal conclusions.

use oshield_models::{DetectionType, RecommendedAction, Severity, Verdict};

/// Base GDPR articles implicated by a detection type.
pub fn base_articles(detection_type: DetectionType) -> &'static [&'static str] {
    match detection_type {
        DetectionType::Face => &["6", "9"],
        DetectionType::Person => &["6"],
        DetectionType::Fingerprint | DetectionType::HandBiometric => &["9"],
        DetectionType::IdDocument | DetectionType::CreditCard => &["5", "6"],
        DetectionType::LicensePlate | DetectionType::Signature => &["6"],
        _ => &[],
    }
}

/// Rule-derived verdict for one capture of a non-person detection.
///
/// `context` is the retrieved legal context; the first snippet is echoed into
/// the reasoning so the verdict stays explainable in review.
pub fn rule_verdict(detection_type: DetectionType, context: &[String]) -> Verdict {
    let articles = base_articles(detection_type)
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>();
    let cite = context
        .first()
        .map(|c| format!(" Context: {}", c.lines().next().unwrap_or_default()))
        .unwrap_or_default();

    match detection_type {
        DetectionType::Face
        | DetectionType::Fingerprint
        | DetectionType::IdDocument
        | DetectionType::CreditCard
        | DetectionType::HandBiometric => {
            let action = match detection_type {
                DetectionType::Fingerprint | DetectionType::CreditCard => {
                    RecommendedAction::Pixelate
                }
                // faces, identity documents, palms
                _ => RecommendedAction::Blur,
            };
            Verdict {
                is_violation: true,
                severity: Severity::High,
                violated_articles: articles,
                reasoning: format!(
                    "{} exposes directly identifying personal data.{cite}",
                    detection_type
                ),
                recommended_action: action,
                confidence: 0.95,
            }
        }
        DetectionType::LicensePlate => Verdict {
            is_violation: true,
            severity: Severity::High,
            violated_articles: articles,
            reasoning: format!(
                "A readable license plate identifies the vehicle keeper.{cite}"
            ),
            recommended_action: RecommendedAction::Pixelate,
            confidence: 0.90,
        },
        DetectionType::Signature => Verdict {
            is_violation: true,
            severity: Severity::High,
            violated_articles: articles,
            reasoning: format!("A handwritten signature is identifying personal data.{cite}"),
            recommended_action: RecommendedAction::Blur,
            confidence: 0.90,
        },
        _ => Verdict {
            is_violation: false,
            severity: Severity::None,
            violated_articles: Vec::new(),
            reasoning: format!("No rule marks {} as a violation.", detection_type),
            recommended_action: RecommendedAction::None,
            confidence: 0.80,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_classes_always_violate() {
        for ty in [
            DetectionType::Face,
            DetectionType::Fingerprint,
            DetectionType::IdDocument,
            DetectionType::CreditCard,
            DetectionType::HandBiometric,
        ] {
            let verdict = rule_verdict(ty, &[]);
            assert!(verdict.is_violation, "{ty} must be a violation");
            assert_eq!(verdict.severity, Severity::High);
            assert!(verdict.confidence >= 0.95);
        }
    }

    #[test]
    fn test_face_and_documents_blur() {
        assert_eq!(
            rule_verdict(DetectionType::Face, &[]).recommended_action,
            RecommendedAction::Blur
        );
        assert_eq!(
            rule_verdict(DetectionType::IdDocument, &[]).recommended_action,
            RecommendedAction::Blur
        );
        assert_eq!(
            rule_verdict(DetectionType::HandBiometric, &[]).recommended_action,
            RecommendedAction::Blur
        );
    }

    #[test]
    fn test_plate_pixelates_signature_blurs() {
        let plate = rule_verdict(DetectionType::LicensePlate, &[]);
        assert!(plate.is_violation);
        assert!(plate.confidence >= 0.90);
        assert_eq!(plate.recommended_action, RecommendedAction::Pixelate);

        let signature = rule_verdict(DetectionType::Signature, &[]);
        assert!(signature.is_violation);
        assert_eq!(signature.recommended_action, RecommendedAction::Blur);
    }

    #[test]
    fn test_unknown_is_not_a_violation() {
        let verdict = rule_verdict(DetectionType::Unknown, &[]);
        assert!(!verdict.is_violation);
        assert_eq!(verdict.recommended_action, RecommendedAction::None);
    }

    #[test]
    fn test_context_is_cited() {
        let context = vec!["**GDPR Article 9**\nBiometric data…".to_string()];
        let verdict = rule_verdict(DetectionType::Face, &context);
        assert!(verdict.reasoning.contains("Article 9"));
    }
}
