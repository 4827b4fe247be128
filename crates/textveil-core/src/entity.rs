//! Entity taxonomy shared across detection, scoring, and pseudonymization

use serde::{Deserialize, Serialize};

/// Closed set of entity types the gateway recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Date,
    PhoneNumber,
    Email,
    CreditCard,
    Ssn,
    MonetaryAmount,
    AccountNumber,
    IpAddress,
    MedicalRecord,
    PassportNumber,
    DriversLicense,
    MatterNumber,
    ClientMatterPair,
    PrivilegeMarker,
    DealCodename,
    OpposingCounsel,
    FinancialInstrument,
    TradeSecret,
    LitigationStrategy,
    ProprietaryFormula,
    ApiKey,
    DatabaseUri,
    AuthToken,
    PrivateKey,
    AwsCredential,
    GcpCredential,
    AzureCredential,
}

/// Broad handling class for an entity type. Identity-class entities are
/// always masked; value-class handling depends on document context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
    Identity,
    Value,
    Legal,
    Secret,
}

impl EntityType {
    /// Base scoring weight. These constants are tuned for behavior parity
    /// with the deployed classifier, not re-derived.
    pub fn weight(self) -> f64 {
        match self {
            EntityType::Person => 10.0,
            EntityType::Organization => 8.0,
            EntityType::Location => 3.0,
            EntityType::Date => 2.0,
            EntityType::PhoneNumber => 15.0,
            EntityType::Email => 12.0,
            EntityType::CreditCard => 30.0,
            EntityType::Ssn => 40.0,
            EntityType::MonetaryAmount => 12.0,
            EntityType::AccountNumber => 25.0,
            EntityType::IpAddress => 8.0,
            EntityType::MedicalRecord => 35.0,
            EntityType::PassportNumber => 35.0,
            EntityType::DriversLicense => 30.0,
            EntityType::MatterNumber => 20.0,
            EntityType::ClientMatterPair => 25.0,
            EntityType::PrivilegeMarker => 30.0,
            EntityType::DealCodename => 20.0,
            EntityType::OpposingCounsel => 15.0,
            EntityType::FinancialInstrument => 30.0,
            EntityType::TradeSecret => 50.0,
            EntityType::LitigationStrategy => 45.0,
            EntityType::ProprietaryFormula => 50.0,
            EntityType::ApiKey => 50.0,
            EntityType::DatabaseUri => 50.0,
            EntityType::AuthToken => 45.0,
            EntityType::PrivateKey => 50.0,
            EntityType::AwsCredential => 50.0,
            EntityType::GcpCredential => 45.0,
            EntityType::AzureCredential => 45.0,
        }
    }

    pub fn class(self) -> EntityClass {
        match self {
            EntityType::Person
            | EntityType::Organization
            | EntityType::Location
            | EntityType::PhoneNumber
            | EntityType::Email
            | EntityType::Ssn
            | EntityType::MedicalRecord
            | EntityType::PassportNumber
            | EntityType::DriversLicense
            | EntityType::OpposingCounsel => EntityClass::Identity,
            EntityType::Date
            | EntityType::CreditCard
            | EntityType::MonetaryAmount
            | EntityType::AccountNumber
            | EntityType::IpAddress
            | EntityType::FinancialInstrument => EntityClass::Value,
            EntityType::MatterNumber
            | EntityType::ClientMatterPair
            | EntityType::PrivilegeMarker
            | EntityType::DealCodename
            | EntityType::TradeSecret
            | EntityType::LitigationStrategy
            | EntityType::ProprietaryFormula => EntityClass::Legal,
            EntityType::ApiKey
            | EntityType::DatabaseUri
            | EntityType::AuthToken
            | EntityType::PrivateKey
            | EntityType::AwsCredential
            | EntityType::GcpCredential
            | EntityType::AzureCredential => EntityClass::Secret,
        }
    }

    /// Identity-class entities (and secrets) are masked unconditionally.
    pub fn always_masked(self) -> bool {
        matches!(
            self.class(),
            EntityClass::Identity | EntityClass::Secret | EntityClass::Legal
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Organization => "ORGANIZATION",
            EntityType::Location => "LOCATION",
            EntityType::Date => "DATE",
            EntityType::PhoneNumber => "PHONE_NUMBER",
            EntityType::Email => "EMAIL",
            EntityType::CreditCard => "CREDIT_CARD",
            EntityType::Ssn => "SSN",
            EntityType::MonetaryAmount => "MONETARY_AMOUNT",
            EntityType::AccountNumber => "ACCOUNT_NUMBER",
            EntityType::IpAddress => "IP_ADDRESS",
            EntityType::MedicalRecord => "MEDICAL_RECORD",
            EntityType::PassportNumber => "PASSPORT_NUMBER",
            EntityType::DriversLicense => "DRIVERS_LICENSE",
            EntityType::MatterNumber => "MATTER_NUMBER",
            EntityType::ClientMatterPair => "CLIENT_MATTER_PAIR",
            EntityType::PrivilegeMarker => "PRIVILEGE_MARKER",
            EntityType::DealCodename => "DEAL_CODENAME",
            EntityType::OpposingCounsel => "OPPOSING_COUNSEL",
            EntityType::FinancialInstrument => "FINANCIAL_INSTRUMENT",
            EntityType::TradeSecret => "TRADE_SECRET",
            EntityType::LitigationStrategy => "LITIGATION_STRATEGY",
            EntityType::ProprietaryFormula => "PROPRIETARY_FORMULA",
            EntityType::ApiKey => "API_KEY",
            EntityType::DatabaseUri => "DATABASE_URI",
            EntityType::AuthToken => "AUTH_TOKEN",
            EntityType::PrivateKey => "PRIVATE_KEY",
            EntityType::AwsCredential => "AWS_CREDENTIAL",
            EntityType::GcpCredential => "GCP_CREDENTIAL",
            EntityType::AzureCredential => "AZURE_CREDENTIAL",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| anyhow::anyhow!("unknown entity type '{}'", s))
    }
}

/// Which recognizer produced a detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Pattern,
    SecretScanner,
    KnowledgeBase,
    Plugin(String),
}

/// A single detection. Ephemeral: produced per call, never persisted with
/// raw text (audit rows keep only a hash and length, see [`EntityDigest`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedEntity {
    pub entity_type: EntityType,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
    pub source: DetectionSource,
}

/// Hash-minimized entity summary safe for durable storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDigest {
    pub entity_type: EntityType,
    pub hash: String,
    pub length: usize,
}

impl EntityDigest {
    pub fn from_entity(entity: &DetectedEntity) -> Self {
        Self {
            entity_type: entity.entity_type,
            hash: crate::pseudonym::content_hash(&entity.text),
            length: entity.text.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_lookup() {
        assert_eq!(EntityType::Ssn.weight(), 40.0);
        assert_eq!(EntityType::PrivateKey.weight(), 50.0);
        assert_eq!(EntityType::Date.weight(), 2.0);
        assert_eq!(EntityType::FinancialInstrument.weight(), 30.0);
        assert_eq!(EntityType::TradeSecret.weight(), 50.0);
        assert_eq!(EntityType::LitigationStrategy.weight(), 45.0);
        assert_eq!(EntityType::ProprietaryFormula.weight(), 50.0);
    }

    #[test]
    fn test_confidential_business_types_always_masked() {
        assert!(EntityType::TradeSecret.always_masked());
        assert!(EntityType::LitigationStrategy.always_masked());
        assert!(EntityType::ProprietaryFormula.always_masked());
        assert!(!EntityType::FinancialInstrument.always_masked());
        assert_eq!(
            "TRADE_SECRET".parse::<EntityType>().unwrap(),
            EntityType::TradeSecret
        );
    }

    #[test]
    fn test_identity_class_always_masked() {
        assert!(EntityType::Person.always_masked());
        assert!(EntityType::Ssn.always_masked());
        assert!(EntityType::ApiKey.always_masked());
        assert!(!EntityType::MonetaryAmount.always_masked());
        assert!(!EntityType::Date.always_masked());
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&EntityType::PhoneNumber).unwrap();
        assert_eq!(json, "\"PHONE_NUMBER\"");
        let back: EntityType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EntityType::PhoneNumber);
    }

    #[test]
    fn test_from_str_unknown() {
        assert!("NOT_A_TYPE".parse::<EntityType>().is_err());
        assert_eq!(
            "CLIENT_MATTER_PAIR".parse::<EntityType>().unwrap(),
            EntityType::ClientMatterPair
        );
    }
}
