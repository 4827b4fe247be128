//! Tenant knowledge base matching
//!
//! Known client and matter names, aliases, and counterparties are supplied
//! per tenant by an external collaborator and refreshed on a TTL. Matching
//! is literal and case-insensitive.

use crate::entity::{DetectedEntity, DetectionSource, EntityType};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub clients: Vec<String>,
    pub matters: Vec<String>,
    pub aliases: Vec<String>,
    pub counterparties: Vec<String>,
}

#[derive(Clone)]
pub struct KnowledgeBaseMatcher {
    patterns: Vec<(EntityType, regex::Regex)>,
}

impl KnowledgeBaseMatcher {
    pub fn new(kb: &KnowledgeBase) -> Self {
        let mut patterns = Vec::new();

        let groups: [(&[String], EntityType); 4] = [
            (&kb.clients, EntityType::Organization),
            (&kb.aliases, EntityType::Organization),
            (&kb.counterparties, EntityType::Organization),
            (&kb.matters, EntityType::MatterNumber),
        ];

        for (names, entity_type) in groups {
            for name in names {
                if name.trim().len() < 3 {
                    continue;
                }
                match RegexBuilder::new(&format!(r"\b{}\b", regex::escape(name)))
                    .case_insensitive(true)
                    .build()
                {
                    Ok(regex) => patterns.push((entity_type, regex)),
                    Err(e) => warn!("Skipping unmatchable knowledge-base entry: {}", e),
                }
            }
        }

        Self { patterns }
    }

    pub fn find_matches(&self, text: &str) -> Vec<DetectedEntity> {
        let mut entities = Vec::new();

        for (entity_type, regex) in &self.patterns {
            for mat in regex.find_iter(text) {
                entities.push(DetectedEntity {
                    entity_type: *entity_type,
                    text: mat.as_str().to_string(),
                    start: mat.start(),
                    end: mat.end(),
                    confidence: 0.92,
                    source: DetectionSource::KnowledgeBase,
                });
            }
        }

        entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_kb() -> KnowledgeBase {
        KnowledgeBase {
            clients: vec!["Meridian Holdings".to_string()],
            matters: vec!["M-2024-0847".to_string()],
            aliases: vec!["MeriCo".to_string()],
            counterparties: vec!["Atlas Group".to_string()],
        }
    }

    #[test]
    fn test_client_match_case_insensitive() {
        let matcher = KnowledgeBaseMatcher::new(&sample_kb());
        let found = matcher.find_matches("We represent MERIDIAN HOLDINGS in this dispute");

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_type, EntityType::Organization);
        assert_eq!(found[0].source, DetectionSource::KnowledgeBase);
        assert_eq!(found[0].text, "MERIDIAN HOLDINGS");
    }

    #[test]
    fn test_matter_match() {
        let matcher = KnowledgeBaseMatcher::new(&sample_kb());
        let found = matcher.find_matches("billing code M-2024-0847 applies");

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_type, EntityType::MatterNumber);
    }

    #[test]
    fn test_no_partial_word_match() {
        let matcher = KnowledgeBaseMatcher::new(&sample_kb());
        // "MeriCo" must not match inside "AmeriCorp"
        assert!(matcher.find_matches("AmeriCorp announced earnings").is_empty());
    }

    #[test]
    fn test_short_entries_skipped() {
        let kb = KnowledgeBase {
            clients: vec!["ab".to_string()],
            ..Default::default()
        };
        let matcher = KnowledgeBaseMatcher::new(&kb);
        assert!(matcher.find_matches("ab ab ab").is_empty());
    }
}
