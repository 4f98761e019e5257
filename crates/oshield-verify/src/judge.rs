//! The judge: vulnerable-context rulebook and per-track consensus.
//!
//! Witness output is perception; everything legal happens here, against two
//! closed keyword sets. That split keeps the rulebook auditable and testable
//! without a model, and the model never emits an unvalidated legal
//! conclusion.

use std::collections::BTreeSet;
use std::fmt;

use oshield_graph::GdprArticle;
use oshield_models::{
    AgeGroup, RecommendedAction, Severity, TrackVerdict, Verdict, WitnessReport,
};

/// Confidence assigned when neither keyword set matches and proportionality
/// says to treat the context as normal.
const UNMATCHED_NORMAL_CONFIDENCE: f64 = 0.60;

/// Vulnerability classes that escalate severity to high.
const HIGH_SEVERITY_VULNERABILITIES: [VulnerabilityType; 3] = [
    VulnerabilityType::Medical,
    VulnerabilityType::Minor,
    VulnerabilityType::Intimate,
];

/// Context class that elevates a neutral person detection into a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VulnerabilityType {
    Medical,
    Minor,
    Religious,
    Political,
    Intimate,
    Ethnic,
}

impl VulnerabilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VulnerabilityType::Medical => "medical",
            VulnerabilityType::Minor => "minor",
            VulnerabilityType::Religious => "religious",
            VulnerabilityType::Political => "political",
            VulnerabilityType::Intimate => "intimate",
            VulnerabilityType::Ethnic => "ethnic",
        }
    }
}

impl fmt::Display for VulnerabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Closed keyword set for vulnerable contexts, keyword → vulnerability type.
fn vulnerable_keyword(keyword: &str) -> Option<VulnerabilityType> {
    use VulnerabilityType::*;
    match keyword {
        "medical" | "medical_setting" | "medical_equipment" | "hospital" | "hospital_gown"
        | "clinic" | "ambulance" | "patient" | "wheelchair" => Some(Medical),
        "minor" | "child" | "children" | "school" | "playground" | "kindergarten"
        | "school_uniform" => Some(Minor),
        "religious" | "religious_symbol" | "religious_clothing" | "church" | "mosque"
        | "synagogue" | "temple" | "worship" => Some(Religious),
        "political" | "political_rally" | "protest" | "demonstration" | "rally" | "banner" => {
            Some(Political)
        }
        "intimate" | "nudity" | "underwear" | "bedroom" | "changing_room" | "locker_room" => {
            Some(Intimate)
        }
        "ethnic" | "ethnic_marker" | "traditional_dress" => Some(Ethnic),
        _ => None,
    }
}

/// Closed keyword set for normal contexts.
fn is_normal_keyword(keyword: &str) -> bool {
    matches!(
        keyword,
        "public_space"
            | "street"
            | "park"
            | "sidewalk"
            | "square"
            | "workplace"
            | "office"
            | "construction_site"
            | "commercial"
            | "shop"
            | "mall"
            | "restaurant"
            | "market"
            | "recreational"
            | "beach"
            | "swimwear"
            | "sports"
            | "gym"
            | "stadium"
            | "concert"
            | "transport"
            | "bus"
            | "train"
            | "station"
            | "airport"
            | "parking"
    )
}

/// Legal context retrieved for a track, used to enrich person verdicts.
#[derive(Debug, Clone, Default)]
pub struct LegalContext {
    pub articles: Vec<GdprArticle>,
    pub snippets: Vec<String>,
}

/// Consolidated view over every witness report of one track.
#[derive(Debug, Default)]
struct Consolidated {
    keywords: BTreeSet<String>,
    age_groups: BTreeSet<AgeGroup>,
    summaries: Vec<String>,
    mean_confidence: f64,
    max_confidence: f64,
}

fn consolidate(reports: &[WitnessReport]) -> Consolidated {
    let mut out = Consolidated::default();
    let mut confidence_sum = 0.0;

    for report in reports {
        for tag in &report.tags {
            out.keywords.insert(tag.to_lowercase());
        }
        if !report.environment.is_empty() {
            out.keywords.insert(report.environment.to_lowercase());
        }
        for indicator in &report.context_indicators {
            out.keywords.insert(indicator.to_lowercase());
        }
        out.age_groups.insert(report.age_group);
        if !report.visual_summary.is_empty() {
            out.summaries.push(report.visual_summary.clone());
        }
        confidence_sum += report.confidence;
        out.max_confidence = out.max_confidence.max(report.confidence);
    }

    if !reports.is_empty() {
        out.mean_confidence = confidence_sum / reports.len() as f64;
    }
    out
}

/// Rule-based consensus over a track's evidence.
pub struct Judge;

impl Judge {
    /// Classify the consolidated context of a person track.
    ///
    /// Any vulnerable keyword wins over any normal keyword; a `child` or
    /// `teenager` age group forces `minor` regardless of keywords. No match
    /// in either set is treated as normal (proportionality).
    fn classify_vulnerability(consolidated: &Consolidated) -> (Option<VulnerabilityType>, bool) {
        if consolidated.age_groups.iter().any(|g| g.is_minor()) {
            return (Some(VulnerabilityType::Minor), true);
        }

        let vulnerable = consolidated
            .keywords
            .iter()
            .find_map(|k| vulnerable_keyword(k));
        if let Some(ty) = vulnerable {
            return (Some(ty), true);
        }

        let matched_normal = consolidated.keywords.iter().any(|k| is_normal_keyword(k));
        (None, matched_normal)
    }

    /// Judge a person track from its witness reports.
    pub fn aggregate_person(reports: &[WitnessReport], legal: &LegalContext) -> TrackVerdict {
        let consolidated = consolidate(reports);
        let (vulnerability, matched) = Self::classify_vulnerability(&consolidated);

        match vulnerability {
            Some(ty) => {
                let mut articles: BTreeSet<String> = ["6", "9"]
                    .iter()
                    .map(|a| a.to_string())
                    .collect();
                for article in &legal.articles {
                    if !article.article_number.is_empty() {
                        articles.insert(article.article_number.clone());
                    }
                }

                let severity = if HIGH_SEVERITY_VULNERABILITIES.contains(&ty) {
                    Severity::High
                } else {
                    Severity::Medium
                };

                let mut reasoning = format!(
                    "Vulnerable context ({ty}): person detected in a setting that \
                     elevates exposure into a violation."
                );
                for snippet in legal.snippets.iter().take(3) {
                    reasoning.push_str("\n- ");
                    reasoning.push_str(snippet.lines().next().unwrap_or_default());
                }

                TrackVerdict {
                    is_violation: true,
                    severity,
                    violated_articles: articles.into_iter().collect(),
                    reasoning,
                    recommended_action: RecommendedAction::Blur,
                    confidence: if consolidated.mean_confidence > 0.0 {
                        consolidated.mean_confidence
                    } else {
                        0.75
                    },
                    max_confidence: consolidated.max_confidence,
                    vulnerability_type: Some(ty.as_str().to_string()),
                }
            }
            None => TrackVerdict {
                is_violation: false,
                severity: Severity::None,
                violated_articles: Vec::new(),
                reasoning: "Normal context: no body-level anonymization required; the face \
                            is handled by its own track."
                    .to_string(),
                recommended_action: RecommendedAction::None,
                confidence: if matched {
                    if consolidated.mean_confidence > 0.0 {
                        consolidated.mean_confidence
                    } else {
                        UNMATCHED_NORMAL_CONFIDENCE
                    }
                } else {
                    UNMATCHED_NORMAL_CONFIDENCE
                },
                max_confidence: consolidated.max_confidence,
                vulnerability_type: None,
            },
        }
    }

    /// Fuse per-frame verdicts of a non-person track by union of evidence.
    ///
    /// A single violating frame makes the track a violation; persistence
    /// escalates severity (two frames to high, three or more to critical).
    /// The recommended action is the most protective seen.
    pub fn aggregate_verdicts(verdicts: &[Verdict]) -> TrackVerdict {
        if verdicts.is_empty() {
            return TrackVerdict::default();
        }

        let violating: Vec<&Verdict> = verdicts.iter().filter(|v| v.is_violation).collect();
        let is_violation = !violating.is_empty();

        let severity = match violating.len() {
            0 => Severity::None,
            1 => violating[0].severity,
            2 => Severity::High,
            _ => Severity::Critical,
        };

        let articles: BTreeSet<String> = violating
            .iter()
            .flat_map(|v| v.violated_articles.iter().cloned())
            .collect();

        let action = verdicts
            .iter()
            .map(|v| v.recommended_action)
            .max()
            .unwrap_or(RecommendedAction::None);

        let confidence =
            verdicts.iter().map(|v| v.confidence).sum::<f64>() / verdicts.len() as f64;
        let max_confidence = verdicts
            .iter()
            .map(|v| v.confidence)
            .fold(0.0, f64::max);

        let reasoning = if is_violation {
            format!(
                "{} of {} analyzed frames show a violation. {}",
                violating.len(),
                verdicts.len(),
                violating[0].reasoning
            )
        } else {
            verdicts[0].reasoning.clone()
        };

        TrackVerdict {
            is_violation,
            severity,
            violated_articles: articles.into_iter().collect(),
            reasoning,
            recommended_action: action,
            confidence,
            max_confidence,
            vulnerability_type: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oshield_models::DetectionType;
    use oshield_witness::rule_verdict;

    fn report(tags: &[&str], environment: &str, age: AgeGroup, confidence: f64) -> WitnessReport {
        WitnessReport {
            visual_summary: "test".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            environment: environment.to_string(),
            age_group: age,
            confidence,
            ..Default::default()
        }
    }

    #[test]
    fn test_hospital_context_is_vulnerable_medical() {
        let reports = vec![report(
            &["hospital_gown"],
            "medical_setting",
            AgeGroup::Adult,
            0.9,
        )];
        let verdict = Judge::aggregate_person(&reports, &LegalContext::default());

        assert!(verdict.is_violation);
        assert_eq!(verdict.severity, Severity::High);
        assert_eq!(verdict.recommended_action, RecommendedAction::Blur);
        assert_eq!(verdict.vulnerability_type.as_deref(), Some("medical"));
        assert!(verdict.violated_articles.contains(&"6".to_string()));
        assert!(verdict.violated_articles.contains(&"9".to_string()));
    }

    #[test]
    fn test_beach_context_is_normal() {
        let reports = vec![report(&["swimwear", "beach"], "beach", AgeGroup::Adult, 0.85)];
        let verdict = Judge::aggregate_person(&reports, &LegalContext::default());

        assert!(!verdict.is_violation);
        assert_eq!(verdict.recommended_action, RecommendedAction::None);
        assert!(verdict.reasoning.contains("face"));
    }

    #[test]
    fn test_child_age_forces_minor_even_on_beach() {
        let reports = vec![report(&["beach"], "beach", AgeGroup::Child, 0.9)];
        let verdict = Judge::aggregate_person(&reports, &LegalContext::default());

        assert!(verdict.is_violation);
        assert_eq!(verdict.vulnerability_type.as_deref(), Some("minor"));
        assert_eq!(verdict.severity, Severity::High);
    }

    #[test]
    fn test_unmatched_context_is_normal_with_low_confidence() {
        let reports = vec![report(&["blurry"], "", AgeGroup::Unknown, 0.0)];
        let verdict = Judge::aggregate_person(&reports, &LegalContext::default());

        assert!(!verdict.is_violation);
        assert!((verdict.confidence - 0.60).abs() < 1e-9);
    }

    #[test]
    fn test_religious_context_is_medium_severity() {
        let reports = vec![report(&["church"], "worship", AgeGroup::Adult, 0.8)];
        let verdict = Judge::aggregate_person(&reports, &LegalContext::default());

        assert!(verdict.is_violation);
        assert_eq!(verdict.severity, Severity::Medium);
    }

    #[test]
    fn test_legal_context_articles_are_unioned() {
        let legal = LegalContext {
            articles: vec![GdprArticle {
                article_number: "35".to_string(),
                ..Default::default()
            }],
            snippets: vec!["**GDPR Article 35**\nImpact assessment".to_string()],
        };
        let reports = vec![report(&["hospital"], "", AgeGroup::Adult, 0.9)];
        let verdict = Judge::aggregate_person(&reports, &legal);

        assert!(verdict.violated_articles.contains(&"35".to_string()));
        assert!(verdict.reasoning.contains("Article 35"));
    }

    #[test]
    fn test_union_of_evidence_any_frame_violates() {
        let clean = Verdict {
            is_violation: false,
            confidence: 0.8,
            ..Default::default()
        };
        let dirty = rule_verdict(DetectionType::LicensePlate, &[]);
        let verdict = Judge::aggregate_verdicts(&[clean, dirty]);

        assert!(verdict.is_violation);
        // One violating frame keeps that frame's severity.
        assert_eq!(verdict.severity, Severity::High);
    }

    #[test]
    fn test_severity_escalates_with_persistence() {
        let dirty = rule_verdict(DetectionType::LicensePlate, &[]);

        let two = Judge::aggregate_verdicts(&[dirty.clone(), dirty.clone()]);
        assert_eq!(two.severity, Severity::High);

        let three = Judge::aggregate_verdicts(&[dirty.clone(), dirty.clone(), dirty.clone()]);
        assert_eq!(three.severity, Severity::Critical);
    }

    #[test]
    fn test_most_protective_action_wins() {
        let blur = Verdict {
            is_violation: true,
            severity: Severity::High,
            recommended_action: RecommendedAction::Blur,
            confidence: 0.9,
            ..Default::default()
        };
        let mask = Verdict {
            is_violation: true,
            severity: Severity::High,
            recommended_action: RecommendedAction::Mask,
            confidence: 0.9,
            ..Default::default()
        };
        let verdict = Judge::aggregate_verdicts(&[blur, mask]);
        assert_eq!(verdict.recommended_action, RecommendedAction::Mask);
    }

    #[test]
    fn test_confidence_is_mean_with_max_recorded() {
        let a = Verdict {
            is_violation: true,
            confidence: 0.8,
            ..Default::default()
        };
        let b = Verdict {
            is_violation: true,
            confidence: 0.6,
            ..Default::default()
        };
        let verdict = Judge::aggregate_verdicts(&[a, b]);
        assert!((verdict.confidence - 0.7).abs() < 1e-9);
        assert!((verdict.max_confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_articles_union_is_sorted() {
        let a = Verdict {
            is_violation: true,
            violated_articles: vec!["9".to_string(), "6".to_string()],
            ..Default::default()
        };
        let b = Verdict {
            is_violation: true,
            violated_articles: vec!["5".to_string(), "6".to_string()],
            ..Default::default()
        };
        let verdict = Judge::aggregate_verdicts(&[a, b]);
        assert_eq!(verdict.violated_articles, vec!["5", "6", "9"]);
    }
}
