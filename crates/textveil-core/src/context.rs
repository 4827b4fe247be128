//! Prompt context analysis
//!
//! Decides how numeric values should be handled once identity entities are
//! masked. Pseudonymized monetary figures break arithmetic, so prompts that
//! ask for computation get special treatment: keep real values when no one
//! is identified, or route to a private model when identities and math
//! appear together.

use crate::entity::{DetectedEntity, EntityClass, EntityType};
use serde::{Deserialize, Serialize};

const COMPUTATION_KEYWORDS: &[&str] = &[
    "calculate",
    "compute",
    "sum",
    "total",
    "average",
    "percentage",
    "interest",
    "amortize",
    "pro rata",
    "prorate",
    "how much",
    "what is the difference",
    "compare the amounts",
];

const CONFIDENTIAL_MARKERS: &[&str] = &[
    "confidential",
    "privileged",
    "attorney-client",
    "work product",
    "under seal",
    "do not distribute",
    "internal only",
];

const INDUSTRY_HINTS: &[(&str, &[&str])] = &[
    (
        "legal",
        &[
            "plaintiff",
            "defendant",
            "deposition",
            "counsel",
            "litigation",
            "settlement",
            "motion",
        ],
    ),
    (
        "finance",
        &[
            "wire transfer",
            "portfolio",
            "escrow",
            "interest rate",
            "principal",
            "dividend",
        ],
    ),
    (
        "healthcare",
        &["patient", "diagnosis", "prescription", "treatment", "mrn"],
    ),
];

/// How detected value entities (monetary amounts, account figures) should be
/// treated during masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueStrategy {
    /// Replace with jittered plausible values.
    Pseudonymize,
    /// Keep values untouched; identities are masked anyway.
    KeepReal,
    /// The prompt needs real values AND names real people; only a private
    /// model should see it.
    PrivateLlm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAnalysis {
    pub has_identified_persons: bool,
    pub is_confidential_document: bool,
    pub needs_computation: bool,
    pub value_strategy: ValueStrategy,
    pub industry: Option<String>,
    pub reasoning: String,
}

pub struct ContextAnalyzer;

impl ContextAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, text: &str, entities: &[DetectedEntity]) -> ContextAnalysis {
        let lower = text.to_lowercase();

        let has_identified_persons = entities.iter().any(|e| {
            matches!(
                e.entity_type.class(),
                EntityClass::Identity | EntityClass::Legal
            ) && e.entity_type != EntityType::MonetaryAmount
        });

        let is_confidential_document = CONFIDENTIAL_MARKERS.iter().any(|m| lower.contains(m))
            || entities
                .iter()
                .any(|e| e.entity_type == EntityType::PrivilegeMarker);

        let needs_computation = COMPUTATION_KEYWORDS.iter().any(|k| lower.contains(k));

        let value_strategy = match (needs_computation, has_identified_persons) {
            (true, true) => ValueStrategy::PrivateLlm,
            (true, false) => ValueStrategy::KeepReal,
            (false, _) => ValueStrategy::Pseudonymize,
        };

        let industry = INDUSTRY_HINTS
            .iter()
            .find(|(_, hints)| hints.iter().any(|h| lower.contains(h)))
            .map(|(name, _)| name.to_string());

        let reasoning = build_reasoning(
            has_identified_persons,
            is_confidential_document,
            needs_computation,
            value_strategy,
        );

        ContextAnalysis {
            has_identified_persons,
            is_confidential_document,
            needs_computation,
            value_strategy,
            industry,
            reasoning,
        }
    }
}

impl Default for ContextAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn build_reasoning(
    persons: bool,
    confidential: bool,
    computation: bool,
    strategy: ValueStrategy,
) -> String {
    let mut parts = Vec::new();

    if persons {
        parts.push("identified parties present");
    }
    if confidential {
        parts.push("confidential document markers present");
    }
    if computation {
        parts.push("prompt requests computation over values");
    }

    let strategy_note = match strategy {
        ValueStrategy::Pseudonymize => "values will be pseudonymized",
        ValueStrategy::KeepReal => "values kept real to preserve arithmetic",
        ValueStrategy::PrivateLlm => "route to private model: computation over identified values",
    };

    if parts.is_empty() {
        strategy_note.to_string()
    } else {
        format!("{}; {}", parts.join(", "), strategy_note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DetectionSource;

    fn entity(entity_type: EntityType, text: &str) -> DetectedEntity {
        DetectedEntity {
            entity_type,
            text: text.to_string(),
            start: 0,
            end: text.len(),
            confidence: 0.9,
            source: DetectionSource::Pattern,
        }
    }

    #[test]
    fn test_computation_without_persons_keeps_values() {
        let analyzer = ContextAnalyzer::new();
        let entities = vec![entity(EntityType::MonetaryAmount, "$45,000.00")];

        let analysis =
            analyzer.analyze("Calculate the total interest on $45,000.00 over 5 years", &entities);

        assert!(analysis.needs_computation);
        assert!(!analysis.has_identified_persons);
        assert_eq!(analysis.value_strategy, ValueStrategy::KeepReal);
    }

    #[test]
    fn test_computation_with_persons_routes_private() {
        let analyzer = ContextAnalyzer::new();
        let entities = vec![
            entity(EntityType::Person, "John Smith"),
            entity(EntityType::MonetaryAmount, "$45,000.00"),
        ];

        let analysis = analyzer.analyze(
            "Calculate what John Smith owes on the $45,000.00 settlement",
            &entities,
        );

        assert_eq!(analysis.value_strategy, ValueStrategy::PrivateLlm);
        assert!(analysis.reasoning.contains("private model"));
    }

    #[test]
    fn test_no_computation_pseudonymizes() {
        let analyzer = ContextAnalyzer::new();
        let entities = vec![
            entity(EntityType::Person, "John Smith"),
            entity(EntityType::MonetaryAmount, "$45,000.00"),
        ];

        let analysis = analyzer.analyze("Summarize the settlement terms for John Smith", &entities);
        assert_eq!(analysis.value_strategy, ValueStrategy::Pseudonymize);
    }

    #[test]
    fn test_confidential_markers() {
        let analyzer = ContextAnalyzer::new();
        let analysis = analyzer.analyze("PRIVILEGED AND CONFIDENTIAL memo follows", &[]);
        assert!(analysis.is_confidential_document);
    }

    #[test]
    fn test_industry_guess() {
        let analyzer = ContextAnalyzer::new();
        let analysis = analyzer.analyze("The plaintiff filed a motion before the deposition", &[]);
        assert_eq!(analysis.industry.as_deref(), Some("legal"));
    }

    #[test]
    fn test_plain_text() {
        let analyzer = ContextAnalyzer::new();
        let analysis = analyzer.analyze("What's a good pasta recipe?", &[]);

        assert!(!analysis.has_identified_persons);
        assert!(!analysis.is_confidential_document);
        assert!(!analysis.needs_computation);
        assert_eq!(analysis.value_strategy, ValueStrategy::Pseudonymize);
        assert!(analysis.industry.is_none());
    }
}
