//! Entity detection engine using regex pattern matching
//!
//! Built-in recognizers cover identity and financial fields; legal-domain
//! recognizers cover matter numbers, privilege markers, client/matter
//! pairs, deal codenames, and opposing-counsel references. The secret
//! scanner and knowledge-base matcher feed the same overlap resolution.

use crate::config::DetectionConfig;
use crate::entity::{DetectedEntity, DetectionSource, EntityType};
use crate::knowledge::KnowledgeBaseMatcher;
use crate::secrets::SecretScanner;
use anyhow::Result;
use regex::{Regex, RegexBuilder};
use tracing::debug;

struct Recognizer {
    entity_type: EntityType,
    regex: Regex,
}

pub struct PatternDetector {
    recognizers: Vec<Recognizer>,
    secret_scanner: SecretScanner,
    confidence_threshold: f64,
}

impl PatternDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let mut recognizers = Vec::new();

        let case_sensitive: &[(EntityType, &str)] = &[
            (EntityType::Person, r"\b[A-Z][a-z]+ [A-Z][a-z]+\b"),
            (
                EntityType::Organization,
                r"\b[A-Z][A-Za-z&.\- ]+ (?:Inc|LLC|LLP|Ltd|Corp|Corporation|Company|Partners|Holdings|Group)\b\.?",
            ),
            (EntityType::Date, r"\b(?:19|20)\d{2}-\d{2}-\d{2}\b"),
            (EntityType::PassportNumber, r"\b[A-Z]\d{8}\b"),
            (EntityType::DriversLicense, r"\b[A-Z]\d{9}\b"),
            (EntityType::MedicalRecord, r"\bMRN[-:\s]?\d{6,8}\b"),
            // Federal court format: NN-cv-NNNNN and friends
            (
                EntityType::MatterNumber,
                r"\b\d{1,2}-(?:cv|cr|mc|mj|ap|bk|po)-\d{4,6}\b",
            ),
            (EntityType::MatterNumber, r"\b20\d{2} [A-Z]{2} \d{4,8}\b"),
            (
                EntityType::DealCodename,
                r"\b(?:Project|Operation|Deal|Transaction|Initiative) [A-Z][a-z]+(?: [A-Z][a-z]+)?\b",
            ),
        ];

        let case_insensitive: &[(EntityType, &str)] = &[
            (
                EntityType::Email,
                r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            ),
            (
                EntityType::PhoneNumber,
                r"\b(?:\(\d{3}\)\s?|\d{3}[-.])\d{3}[-.]\d{4}\b",
            ),
            (EntityType::Ssn, r"\b\d{3}-\d{2}-\d{4}\b"),
            (
                EntityType::CreditCard,
                r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b",
            ),
            (
                EntityType::IpAddress,
                r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b",
            ),
            (
                EntityType::MonetaryAmount,
                r"[$€£]\s?\d{1,3}(?:,\d{3})*(?:\.\d{2})?",
            ),
            (
                EntityType::AccountNumber,
                r"\b(?:acct|account)\s*(?:#|no\.?|number:?)?\s*\d{6,12}\b",
            ),
            (
                EntityType::MatterNumber,
                r"\b(?:matter|case|docket|file)\s*(?:#|no\.?|number:?)\s*\d{2,4}[-./]\d{3,6}(?:[-./]\d{1,4})?",
            ),
            (
                EntityType::ClientMatterPair,
                r"(?:client|matter|re|regarding|in\s+the\s+matter\s+of)[:\s]+[A-Z][a-zA-Z\s&.,]+?\s*(?:matter|case|docket|file)?\s*(?:#|no\.?|number)?\s*\d{2,4}[-./]\d{3,6}",
            ),
            (
                EntityType::PrivilegeMarker,
                r"\b(?:attorney[\s-]client\s+privilege|work\s+product\s+(?:doctrine|protection|privilege)|privileged\s+and\s+confidential|attorney\s+work\s+product|protected\s+communication|legal\s+professional\s+privilege|litigation\s+privilege|common\s+interest\s+privilege|joint\s+defense\s+privilege|without\s+prejudice|under\s+seal|confidential\s+(?:treatment|information))\b",
            ),
            (
                EntityType::OpposingCounsel,
                r"\b(?:opposing\s+counsel|adverse\s+party|defendant'?s?\s+counsel|plaintiff'?s?\s+counsel|respondent'?s?\s+counsel|petitioner'?s?\s+counsel|counsel\s+for\s+(?:the\s+)?(?:defendant|plaintiff|respondent|petitioner))\s*[:\s]*[A-Z][a-zA-Z\s&.,]+?(?:\.|,|\n|$)",
            ),
        ];

        for (entity_type, pattern) in case_sensitive {
            recognizers.push(Recognizer {
                entity_type: *entity_type,
                regex: Regex::new(pattern).map_err(|e| {
                    anyhow::anyhow!("Invalid pattern for '{}': {}", entity_type, e)
                })?,
            });
        }

        for (entity_type, pattern) in case_insensitive {
            recognizers.push(Recognizer {
                entity_type: *entity_type,
                regex: RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        anyhow::anyhow!("Invalid pattern for '{}': {}", entity_type, e)
                    })?,
            });
        }

        Ok(Self {
            recognizers,
            secret_scanner: SecretScanner::new()?,
            confidence_threshold: config.confidence_threshold,
        })
    }

    /// Run every built-in recognizer plus the secret scanner (final pass)
    /// and resolve overlaps. Knowledge-base matches are folded in when a
    /// matcher is supplied.
    pub fn detect(&self, text: &str, knowledge: Option<&KnowledgeBaseMatcher>) -> Vec<DetectedEntity> {
        let mut entities = Vec::new();

        for recognizer in &self.recognizers {
            for mat in recognizer.regex.find_iter(text) {
                let confidence = calculate_confidence(recognizer.entity_type, mat.as_str());
                if confidence >= self.confidence_threshold {
                    entities.push(DetectedEntity {
                        entity_type: recognizer.entity_type,
                        text: mat.as_str().to_string(),
                        start: mat.start(),
                        end: mat.end(),
                        confidence,
                        source: DetectionSource::Pattern,
                    });
                }
            }
        }

        if let Some(matcher) = knowledge {
            entities.extend(matcher.find_matches(text));
        }

        entities.extend(self.secret_scanner.scan(text));

        let resolved = resolve_overlaps(entities);
        debug!("Detected {} entities after overlap resolution", resolved.len());
        resolved
    }
}

/// Sort by start offset and drop lower-confidence overlaps.
pub fn resolve_overlaps(mut entities: Vec<DetectedEntity>) -> Vec<DetectedEntity> {
    if entities.is_empty() {
        return entities;
    }

    entities.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
    });

    let mut merged: Vec<DetectedEntity> = Vec::with_capacity(entities.len());
    for entity in entities {
        match merged.last_mut() {
            Some(last) if entity.start < last.end => {
                if entity.confidence > last.confidence {
                    *last = entity;
                }
            }
            _ => merged.push(entity),
        }
    }
    merged
}

// Structural heuristics, same spirit as checking an email really has an
// '@' before trusting the match.
fn calculate_confidence(entity_type: EntityType, text: &str) -> f64 {
    match entity_type {
        EntityType::Email => {
            if text.contains('@') && text.contains('.') {
                0.95
            } else {
                0.7
            }
        }
        EntityType::PhoneNumber => {
            let digit_count = text.chars().filter(|c| c.is_ascii_digit()).count();
            if digit_count >= 10 {
                0.9
            } else {
                0.6
            }
        }
        EntityType::Ssn => {
            if text.matches('-').count() == 2 {
                0.95
            } else {
                0.8
            }
        }
        EntityType::CreditCard => {
            let digit_count = text.chars().filter(|c| c.is_ascii_digit()).count();
            if digit_count == 16 {
                0.85
            } else {
                0.7
            }
        }
        EntityType::IpAddress => {
            let parts: Vec<&str> = text.split('.').collect();
            if parts.len() == 4 && parts.iter().all(|&p| p.parse::<u8>().is_ok()) {
                0.95
            } else {
                0.7
            }
        }
        EntityType::Person => 0.85,
        EntityType::Organization => 0.8,
        EntityType::Date => 0.7,
        EntityType::MonetaryAmount => 0.9,
        EntityType::AccountNumber => 0.85,
        EntityType::PassportNumber => 0.6,
        EntityType::DriversLicense => 0.6,
        EntityType::MedicalRecord => 0.9,
        EntityType::MatterNumber => 0.85,
        EntityType::ClientMatterPair => 0.9,
        EntityType::PrivilegeMarker => 0.95,
        EntityType::DealCodename => {
            // Common non-deal phrases are not codenames
            const EXCLUDE: &[&str] = &[
                "Project Manager",
                "Project Management",
                "Project Plan",
                "Operation System",
                "Operation Manual",
            ];
            if EXCLUDE.contains(&text) {
                0.0
            } else {
                0.7
            }
        }
        EntityType::OpposingCounsel => 0.75,
        _ => 0.8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionConfig;

    fn detector() -> PatternDetector {
        let config = DetectionConfig {
            enabled: true,
            confidence_threshold: 0.5,
            plugin_budget_ms: 50,
        };
        PatternDetector::new(&config).unwrap()
    }

    #[test]
    fn test_email_detection() {
        let entities = detector().detect("Contact me at john.doe@example.com for info", None);

        let email = entities
            .iter()
            .find(|e| e.entity_type == EntityType::Email)
            .unwrap();
        assert_eq!(email.text, "john.doe@example.com");
        assert_eq!(email.start, 14);
        assert_eq!(email.end, 34);
        assert!(email.confidence >= 0.9);
    }

    #[test]
    fn test_person_and_ssn_scenario() {
        let entities = detector().detect("John Smith's SSN is 123-45-6789", None);

        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::Person && e.text == "John Smith"));
        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::Ssn && e.text == "123-45-6789"));
    }

    #[test]
    fn test_overlap_resolution_prefers_higher_confidence() {
        let entities = vec![
            DetectedEntity {
                entity_type: EntityType::Person,
                text: "Project Falcon".to_string(),
                start: 0,
                end: 14,
                confidence: 0.6,
                source: DetectionSource::Pattern,
            },
            DetectedEntity {
                entity_type: EntityType::DealCodename,
                text: "Project Falcon".to_string(),
                start: 0,
                end: 14,
                confidence: 0.9,
                source: DetectionSource::KnowledgeBase,
            },
        ];

        let resolved = resolve_overlaps(entities);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].entity_type, EntityType::DealCodename);
    }

    #[test]
    fn test_privilege_marker() {
        let entities = detector().detect(
            "This memo is PRIVILEGED AND CONFIDENTIAL attorney work product.",
            None,
        );

        let markers: Vec<_> = entities
            .iter()
            .filter(|e| e.entity_type == EntityType::PrivilegeMarker)
            .collect();
        assert!(!markers.is_empty());
        assert!(markers[0].confidence >= 0.9);
    }

    #[test]
    fn test_matter_number_federal_format() {
        let entities = detector().detect("See case 23-cv-01234 for background", None);

        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::MatterNumber && e.text == "23-cv-01234"));
    }

    #[test]
    fn test_deal_codename_exclusion() {
        let entities = detector().detect("Our Project Manager will follow up", None);
        assert!(!entities
            .iter()
            .any(|e| e.entity_type == EntityType::DealCodename));
    }

    #[test]
    fn test_secret_pass_included() {
        let entities = detector().detect("key: sk-abcdefghij0123456789XYZW", None);
        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::ApiKey
                && e.source == DetectionSource::SecretScanner));
    }

    #[test]
    fn test_monetary_amount() {
        let entities = detector().detect("The settlement totals $1,250,000.00 in cash", None);
        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::MonetaryAmount
                && e.text == "$1,250,000.00"));
    }

    #[test]
    fn test_empty_text() {
        assert!(detector().detect("", None).is_empty());
    }
}
