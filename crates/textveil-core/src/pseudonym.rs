//! Deterministic reversible pseudonymization
//!
//! Every replacement value is derived from the SHA-256 of the original
//! text, so the same original always yields the same pseudonym with no
//! coordination. Sessions keep the forward and reverse maps so model
//! responses can be translated back before reaching the caller.

use crate::entity::{DetectedEntity, EntityType};
use anyhow::{bail, Result};
use fake::faker::company::en::CompanyName;
use fake::faker::internet::en::SafeEmail;
use fake::faker::name::en::{FirstName, LastName};
use fake::Fake;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Upper bound on any generated pseudonym. The streaming reverser sizes
/// its holdback window from this.
pub const MAX_PSEUDONYM_LEN: usize = 64;

/// Re-derive rounds before a colliding pseudonym falls back to an opaque
/// tag. Small pools (privilege markers have five entries) can collide on
/// every round once taken.
const MAX_COLLISION_RETRIES: u32 = 8;

const FAKE_LOCATIONS: &[&str] = &[
    "742 Evergreen Terrace, Springfield, IL 62704",
    "1234 Maple Drive, Suite 300, Portland, OR 97201",
    "567 Oak Boulevard, Austin, TX 78701",
    "890 Pine Street, Denver, CO 80202",
    "2345 Elm Avenue, Boston, MA 02108",
    "678 Cedar Lane, Seattle, WA 98101",
    "1011 Birch Road, Nashville, TN 37201",
    "1213 Walnut Court, Miami, FL 33101",
    "1415 Spruce Way, Chicago, IL 60601",
    "1617 Aspen Circle, San Francisco, CA 94102",
];

const FAKE_DEAL_CODENAMES: &[&str] = &[
    "Project Falcon",
    "Project Orion",
    "Project Nexus",
    "Project Horizon",
    "Project Zenith",
    "Project Apex",
    "Project Titan",
    "Project Nova",
    "Project Eclipse",
    "Project Vanguard",
    "Project Aurora",
    "Project Summit",
];

const FAKE_LAW_FIRMS: &[&str] = &[
    "Baker & Associates",
    "Thompson LLP",
    "Crane Legal Group",
    "Marshall & Briggs",
    "Ashford Law Offices",
    "Davenport Partners",
    "Sterling & Young",
    "Whitmore Coleman LLP",
];

const PRIVILEGE_MARKERS: &[&str] = &[
    "PRIVILEGED AND CONFIDENTIAL",
    "ATTORNEY-CLIENT PRIVILEGE",
    "ATTORNEY WORK PRODUCT",
    "PROTECTED COMMUNICATION",
    "LEGAL PROFESSIONAL PRIVILEGE",
];

/// Hex SHA-256 of a string. Also used for audit digests so originals never
/// leave the process.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn seeded_rng(hex_hash: &str) -> StdRng {
    // First 16 hex chars of a SHA-256 digest always parse.
    let seed = u64::from_str_radix(&hex_hash[..16], 16).unwrap_or(0);
    StdRng::seed_from_u64(seed)
}

fn pick_from_pool(pool: &[&str], hex_hash: &str) -> String {
    let seed = u32::from_str_radix(&hex_hash[..8], 16).unwrap_or(0);
    pool[seed as usize % pool.len()].to_string()
}

fn deterministic_fraction(hex_hash: &str) -> f64 {
    let seed = u32::from_str_radix(&hex_hash[8..16], 16).unwrap_or(0);
    seed as f64 / u32::MAX as f64
}

fn hash_digits(hex_hash: &str, count: usize) -> String {
    let bytes = hex_hash.as_bytes();
    (0..count)
        .map(|i| {
            let hi = (bytes[i % bytes.len()] as u32) << 8;
            let lo = bytes[(i + 1) % bytes.len()] as u32;
            char::from_digit((hi | lo) % 10, 10).unwrap_or('0')
        })
        .collect()
}

fn generate_person(hex_hash: &str) -> String {
    let mut rng = seeded_rng(hex_hash);
    let first: String = FirstName().fake_with_rng(&mut rng);
    let last: String = LastName().fake_with_rng(&mut rng);
    format!("{} {}", first, last)
}

fn generate_organization(hex_hash: &str) -> String {
    let mut rng = seeded_rng(hex_hash);
    CompanyName().fake_with_rng(&mut rng)
}

fn generate_email(hex_hash: &str) -> String {
    let mut rng = seeded_rng(hex_hash);
    SafeEmail().fake_with_rng(&mut rng)
}

fn generate_phone(hex_hash: &str) -> String {
    let area = (u32::from_str_radix(&hex_hash[..3], 16).unwrap_or(0) % 800) + 200;
    let mid = (u32::from_str_radix(&hex_hash[3..6], 16).unwrap_or(0) % 900) + 100;
    let last = (u32::from_str_radix(&hex_hash[6..10], 16).unwrap_or(0) % 9000) + 1000;
    format!("({}) {}-{}", area, mid, last)
}

fn generate_ssn(hex_hash: &str) -> String {
    let a = (u32::from_str_radix(&hex_hash[..3], 16).unwrap_or(0) % 899) + 100;
    let b = (u32::from_str_radix(&hex_hash[3..5], 16).unwrap_or(0) % 90) + 10;
    let c = (u32::from_str_radix(&hex_hash[5..9], 16).unwrap_or(0) % 9000) + 1000;
    format!("{}-{}-{}", a, b, c)
}

fn generate_credit_card(hex_hash: &str) -> String {
    let digits = format!("4{}", hash_digits(hex_hash, 15));
    format!(
        "{}-{}-{}-{}",
        &digits[..4],
        &digits[4..8],
        &digits[8..12],
        &digits[12..16]
    )
}

fn generate_monetary_amount(original: &str, hex_hash: &str) -> String {
    let numeric: String = original
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = numeric.parse().unwrap_or(0.0);

    if value == 0.0 {
        return "$1,234.56".to_string();
    }

    let jitter = 0.8 + deterministic_fraction(hex_hash) * 0.4;
    let new_value = value * jitter;

    let prefix: String = original
        .chars()
        .take_while(|c| !c.is_ascii_digit())
        .collect();
    let prefix = prefix.trim();
    let prefix = if prefix.is_empty() { "$" } else { prefix };

    format!("{}{}", prefix, format_with_commas(new_value))
}

fn format_with_commas(value: f64) -> String {
    let formatted = format!("{:.2}", value);
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, f),
        None => (formatted.as_str(), "00"),
    };

    let mut grouped = String::new();
    let digits: Vec<char> = int_part.chars().collect();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }

    format!("{}.{}", grouped, frac_part)
}

fn generate_date(hex_hash: &str) -> String {
    let seed = u32::from_str_radix(&hex_hash[..8], 16).unwrap_or(0);
    let year = 2020 + (seed % 5);
    let month = (seed % 12) + 1;
    let day = (seed % 28) + 1;
    format!("{}-{:02}-{:02}", year, month, day)
}

fn generate_matter_number(hex_hash: &str) -> String {
    let prefix = (u32::from_str_radix(&hex_hash[..4], 16).unwrap_or(0) % 9000) + 1000;
    let suffix = (u32::from_str_radix(&hex_hash[4..8], 16).unwrap_or(0) % 900) + 100;
    format!("M-{}-{}", prefix, suffix)
}

fn generate_ip_address(hex_hash: &str) -> String {
    let last_octet = (u32::from_str_radix(&hex_hash[..4], 16).unwrap_or(0) % 254) + 1;
    format!("192.0.2.{}", last_octet)
}

fn generate_medical_record(hex_hash: &str) -> String {
    let num = (u32::from_str_radix(&hex_hash[..8], 16).unwrap_or(0) % 9_000_000) + 1_000_000;
    format!("MRN-{}", num)
}

fn generate_passport(hex_hash: &str) -> String {
    let letter = (b'A' + (u8::from_str_radix(&hex_hash[..2], 16).unwrap_or(0) % 26)) as char;
    let digits = (u64::from_str_radix(&hex_hash[2..10], 16).unwrap_or(0) % 90_000_000) + 10_000_000;
    format!("{}{}", letter, digits)
}

fn generate_drivers_license(hex_hash: &str) -> String {
    let letter = (b'A' + (u8::from_str_radix(&hex_hash[..2], 16).unwrap_or(0) % 26)) as char;
    let digits =
        (u64::from_str_radix(&hex_hash[2..10], 16).unwrap_or(0) % 900_000_000) + 100_000_000;
    format!("{}{}", letter, digits)
}

fn generate_opposing_counsel(hex_hash: &str) -> String {
    let person = generate_person(hex_hash);
    let firm = pick_from_pool(FAKE_LAW_FIRMS, &hex_hash[8..]);
    format!("{}, {}", person, firm)
}

/// Generate a pseudonym for an entity type from its content hash. Secret
/// classes never get realistic stand-ins, only opaque tags.
pub fn generate_pseudonym(entity_type: EntityType, original: &str, hex_hash: &str) -> String {
    let candidate = match entity_type {
        EntityType::Person => generate_person(hex_hash),
        EntityType::Organization => generate_organization(hex_hash),
        EntityType::Email => generate_email(hex_hash),
        EntityType::PhoneNumber => generate_phone(hex_hash),
        EntityType::Ssn => generate_ssn(hex_hash),
        EntityType::CreditCard => generate_credit_card(hex_hash),
        EntityType::MonetaryAmount => generate_monetary_amount(original, hex_hash),
        EntityType::Location => pick_from_pool(FAKE_LOCATIONS, hex_hash),
        EntityType::Date => generate_date(hex_hash),
        EntityType::MatterNumber => generate_matter_number(hex_hash),
        EntityType::ClientMatterPair => format!(
            "{} / {}",
            generate_organization(hex_hash),
            generate_matter_number(&hex_hash[8..])
        ),
        EntityType::DealCodename => pick_from_pool(FAKE_DEAL_CODENAMES, hex_hash),
        EntityType::AccountNumber => hash_digits(hex_hash, 10),
        EntityType::IpAddress => generate_ip_address(hex_hash),
        EntityType::MedicalRecord => generate_medical_record(hex_hash),
        EntityType::PassportNumber => generate_passport(hex_hash),
        EntityType::DriversLicense => generate_drivers_license(hex_hash),
        EntityType::OpposingCounsel => generate_opposing_counsel(hex_hash),
        EntityType::PrivilegeMarker => pick_from_pool(PRIVILEGE_MARKERS, hex_hash),
        // Secrets and anything unlisted become opaque tags.
        _ => format!("[MASKED_{}_{}]", entity_type.as_str(), &hex_hash[..8]),
    };

    if candidate.len() > MAX_PSEUDONYM_LEN {
        format!("[MASKED_{}_{}]", entity_type.as_str(), &hex_hash[..8])
    } else {
        candidate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PseudonymEntry {
    pub entity_type: EntityType,
    pub original: String,
    pub hash: String,
    pub pseudonym: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaskOutcome {
    pub masked_text: String,
    pub entities_replaced: usize,
    /// original -> pseudonym for the entities touched in this call.
    pub pseudonym_map: HashMap<String, String>,
}

/// Session-scoped pseudonym state. The same original maps to the same
/// pseudonym for the session's lifetime; use after expiry is a hard error.
pub struct PseudonymSession {
    pub session_id: String,
    pub tenant_id: String,
    mappings: HashMap<(EntityType, String), PseudonymEntry>,
    reverse: HashMap<String, String>,
    created_at: Instant,
    expires_at: Instant,
}

impl PseudonymSession {
    pub fn new(session_id: &str, tenant_id: &str, ttl: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            session_id: session_id.to_string(),
            tenant_id: tenant_id.to_string(),
            mappings: HashMap::new(),
            reverse: HashMap::new(),
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Replace all detected entities in the text with pseudonyms.
    /// Entities must carry byte offsets into `text`; replacement runs from
    /// the end of the text backwards so offsets stay valid.
    pub fn pseudonymize(
        &mut self,
        text: &str,
        entities: &[DetectedEntity],
    ) -> Result<MaskOutcome> {
        if self.is_expired() {
            bail!("pseudonym session {} has expired", self.session_id);
        }

        let mut sorted: Vec<&DetectedEntity> = entities.iter().collect();
        sorted.sort_by(|a, b| b.start.cmp(&a.start));

        let mut masked_text = text.to_string();
        let mut pseudonym_map = HashMap::new();
        let mut entities_replaced = 0;

        for entity in sorted {
            if entity.end > masked_text.len() || entity.start >= entity.end {
                continue;
            }
            let pseudonym = self
                .get_or_create(entity.entity_type, &entity.text)
                .pseudonym
                .clone();
            masked_text.replace_range(entity.start..entity.end, &pseudonym);
            pseudonym_map.insert(entity.text.clone(), pseudonym);
            entities_replaced += 1;
        }

        debug!(
            session = %self.session_id,
            replaced = entities_replaced,
            "Pseudonymized text"
        );

        Ok(MaskOutcome {
            masked_text,
            entities_replaced,
            pseudonym_map,
        })
    }

    /// Reverse every known pseudonym in the text. Longest pseudonyms go
    /// first so one replacement cannot corrupt a longer one it prefixes.
    pub fn depseudonymize(&self, text: &str) -> Result<String> {
        if self.is_expired() {
            bail!("pseudonym session {} has expired", self.session_id);
        }

        let mut pairs: Vec<(&String, &String)> = self.reverse.iter().collect();
        pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut result = text.to_string();
        for (pseudonym, original) in pairs {
            result = result.replace(pseudonym.as_str(), original);
        }
        Ok(result)
    }

    /// Snapshot of pseudonym -> original, for streaming reversal.
    pub fn reverse_map(&self) -> HashMap<String, String> {
        self.reverse.clone()
    }

    pub fn pseudonym_map(&self) -> HashMap<String, String> {
        self.mappings
            .values()
            .map(|e| (e.original.clone(), e.pseudonym.clone()))
            .collect()
    }

    /// All entries, for encrypted persistence.
    pub fn export_entries(&self) -> Vec<PseudonymEntry> {
        self.mappings.values().cloned().collect()
    }

    /// Rebuild session state from persisted entries.
    pub fn import_entries(&mut self, entries: Vec<PseudonymEntry>) {
        for entry in entries {
            self.reverse
                .insert(entry.pseudonym.clone(), entry.original.clone());
            self.mappings
                .insert((entry.entity_type, entry.original.clone()), entry);
        }
    }

    fn get_or_create(&mut self, entity_type: EntityType, original: &str) -> &PseudonymEntry {
        let key = (entity_type, original.to_string());

        if !self.mappings.contains_key(&key) {
            let hash = content_hash(original);
            let mut pseudonym = generate_pseudonym(entity_type, original, &hash);

            // Collision with a different original: re-derive from the hash
            // of the hash, still deterministic. Pool-backed generators can
            // run out of distinct values, so after a few rounds switch to
            // opaque tags keyed on the re-derived hash, which cannot
            // exhaust.
            let mut derived = hash.clone();
            let mut attempts = 0;
            while self
                .reverse
                .get(&pseudonym)
                .is_some_and(|existing| existing != original)
            {
                derived = content_hash(&derived);
                attempts += 1;
                pseudonym = if attempts <= MAX_COLLISION_RETRIES {
                    generate_pseudonym(entity_type, original, &derived)
                } else {
                    format!("[MASKED_{}_{}]", entity_type.as_str(), &derived[..12])
                };
            }

            self.reverse
                .insert(pseudonym.clone(), original.to_string());
            self.mappings.insert(
                key.clone(),
                PseudonymEntry {
                    entity_type,
                    original: original.to_string(),
                    hash,
                    pseudonym,
                },
            );
        }

        // Just inserted if absent.
        &self.mappings[&key]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DetectionSource;

    fn entity(entity_type: EntityType, text: &str, start: usize) -> DetectedEntity {
        DetectedEntity {
            entity_type,
            text: text.to_string(),
            start,
            end: start + text.len(),
            confidence: 0.9,
            source: DetectionSource::Pattern,
        }
    }

    fn session() -> PseudonymSession {
        PseudonymSession::new("sess-1", "tenant-a", Duration::from_secs(3600))
    }

    #[test]
    fn test_determinism_across_sessions() {
        let mut s1 = session();
        let mut s2 = PseudonymSession::new("sess-2", "tenant-b", Duration::from_secs(3600));

        let e = entity(EntityType::Person, "John Smith", 0);
        let r1 = s1.pseudonymize("John Smith", &[e.clone()]).unwrap();
        let r2 = s2.pseudonymize("John Smith", &[e]).unwrap();

        assert_eq!(r1.masked_text, r2.masked_text);
        assert_ne!(r1.masked_text, "John Smith");
    }

    #[test]
    fn test_session_consistency() {
        let mut s = session();
        let e = entity(EntityType::Email, "jane@corp.com", 0);

        let r1 = s.pseudonymize("jane@corp.com", &[e.clone()]).unwrap();
        let r2 = s.pseudonymize("jane@corp.com", &[e]).unwrap();

        assert_eq!(r1.masked_text, r2.masked_text);
        assert_eq!(s.mapping_count(), 1);
    }

    #[test]
    fn test_round_trip_reversal() {
        let mut s = session();
        let text = "Email jane@corp.com about John Smith";
        let entities = vec![
            entity(EntityType::Email, "jane@corp.com", 6),
            entity(EntityType::Person, "John Smith", 26),
        ];

        let masked = s.pseudonymize(text, &entities).unwrap();
        assert!(!masked.masked_text.contains("jane@corp.com"));
        assert!(!masked.masked_text.contains("John Smith"));

        let restored = s.depseudonymize(&masked.masked_text).unwrap();
        assert_eq!(restored, text);
    }

    #[test]
    fn test_pool_exhaustion_still_yields_unique_reversible_pseudonyms() {
        // More distinct privilege markers than the pool has entries.
        let phrases = [
            "ATTORNEY-CLIENT PRIVILEGED",
            "ATTORNEY WORK PRODUCT",
            "PRIVILEGED AND CONFIDENTIAL",
            "SUBJECT TO COMMON INTEREST PRIVILEGE",
            "PREPARED IN ANTICIPATION OF LITIGATION",
            "PRIVILEGED - DO NOT FORWARD",
            "JOINT DEFENSE PRIVILEGED",
        ];

        let mut s = session();
        let mut seen = std::collections::HashSet::new();
        for phrase in phrases {
            let e = entity(EntityType::PrivilegeMarker, phrase, 0);
            let masked = s.pseudonymize(phrase, &[e]).unwrap();
            assert_ne!(masked.masked_text, phrase);
            assert!(masked.masked_text.len() <= MAX_PSEUDONYM_LEN);
            assert!(seen.insert(masked.masked_text.clone()));
            assert_eq!(s.depseudonymize(&masked.masked_text).unwrap(), phrase);
        }
        assert_eq!(s.mapping_count(), phrases.len());
    }

    #[test]
    fn test_monetary_jitter_preserves_currency_prefix() {
        let hash = content_hash("$45,000.00");
        let fake = generate_monetary_amount("$45,000.00", &hash);

        assert!(fake.starts_with('$'));
        assert_ne!(fake, "$45,000.00");

        let numeric: String = fake
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let value: f64 = numeric.parse().unwrap();
        assert!(value >= 45_000.0 * 0.8 - 1.0);
        assert!(value <= 45_000.0 * 1.2 + 1.0);
    }

    #[test]
    fn test_monetary_euro_prefix() {
        let hash = content_hash("€2,500.00");
        let fake = generate_monetary_amount("€2,500.00", &hash);
        assert!(fake.starts_with('€'));
    }

    #[test]
    fn test_ssn_format_preserved() {
        let hash = content_hash("123-45-6789");
        let fake = generate_pseudonym(EntityType::Ssn, "123-45-6789", &hash);

        assert_eq!(fake.matches('-').count(), 2);
        assert_ne!(fake, "123-45-6789");
    }

    #[test]
    fn test_secret_gets_opaque_tag() {
        let original = "sk-abcdefghij0123456789";
        let hash = content_hash(original);
        let fake = generate_pseudonym(EntityType::ApiKey, original, &hash);

        assert!(fake.starts_with("[MASKED_API_KEY_"));
        assert!(fake.len() <= MAX_PSEUDONYM_LEN);
    }

    #[test]
    fn test_all_pseudonyms_bounded() {
        let types = [
            EntityType::Person,
            EntityType::Organization,
            EntityType::Email,
            EntityType::PhoneNumber,
            EntityType::Ssn,
            EntityType::CreditCard,
            EntityType::Location,
            EntityType::Date,
            EntityType::MatterNumber,
            EntityType::ClientMatterPair,
            EntityType::DealCodename,
            EntityType::AccountNumber,
            EntityType::IpAddress,
            EntityType::MedicalRecord,
            EntityType::PassportNumber,
            EntityType::DriversLicense,
            EntityType::OpposingCounsel,
            EntityType::PrivilegeMarker,
            EntityType::ApiKey,
            EntityType::PrivateKey,
        ];
        for entity_type in types {
            let hash = content_hash("sample value");
            let fake = generate_pseudonym(entity_type, "sample value", &hash);
            assert!(
                fake.len() <= MAX_PSEUDONYM_LEN,
                "{} produced {} chars",
                entity_type,
                fake.len()
            );
        }
    }

    #[test]
    fn test_expired_session_is_hard_error() {
        let mut s = PseudonymSession::new("sess-1", "tenant-a", Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(5));

        let e = entity(EntityType::Person, "John Smith", 0);
        assert!(s.pseudonymize("John Smith", &[e]).is_err());
        assert!(s.depseudonymize("anything").is_err());
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut s = session();
        let e = entity(EntityType::Person, "John Smith", 0);
        let masked = s.pseudonymize("John Smith", &[e]).unwrap();

        let entries = s.export_entries();
        let mut restored = PseudonymSession::new("sess-1", "tenant-a", Duration::from_secs(3600));
        restored.import_entries(entries);

        assert_eq!(
            restored.depseudonymize(&masked.masked_text).unwrap(),
            "John Smith"
        );
    }

    #[test]
    fn test_descending_replacement_keeps_offsets() {
        let mut s = session();
        let text = "A: john@a.com B: mary@b.com";
        let entities = vec![
            entity(EntityType::Email, "john@a.com", 3),
            entity(EntityType::Email, "mary@b.com", 17),
        ];

        let masked = s.pseudonymize(text, &entities).unwrap();
        assert_eq!(masked.entities_replaced, 2);
        assert!(masked.masked_text.starts_with("A: "));
        assert!(masked.masked_text.contains(" B: "));
    }

    #[test]
    fn test_comma_formatting() {
        assert_eq!(format_with_commas(1234567.891), "1,234,567.89");
        assert_eq!(format_with_commas(999.5), "999.50");
        assert_eq!(format_with_commas(1000.0), "1,000.00");
    }
}
