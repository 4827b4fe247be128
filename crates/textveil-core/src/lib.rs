pub mod audit;
pub mod cache;
pub mod config;
pub mod context;
pub mod cooccurrence;
pub mod detection;
pub mod entity;
pub mod gateway;
pub mod knowledge;
pub mod mapstore;
pub mod notify;
pub mod plugin;
pub mod protocol;
pub mod pseudonym;
pub mod scorer;
pub mod secrets;
pub mod stream;
pub mod tasks;
pub mod upstream;
pub mod vault;

pub use audit::{AuditChain, AuditEvent, ChainVerification, NewAuditEvent, TenantLocks};
pub use cache::{Clock, ManualClock, SystemClock, TtlCache};
pub use config::{
    Config, DetectionConfig, GatewayConfig, PseudonymConfig, ScoringConfig, StorageConfig,
    VaultConfig,
};
pub use context::{ContextAnalysis, ContextAnalyzer, ValueStrategy};
pub use cooccurrence::CooccurrenceStore;
pub use detection::PatternDetector;
pub use entity::{DetectedEntity, DetectionSource, EntityClass, EntityDigest, EntityType};
pub use gateway::{Decision, Gateway, GatewayAction, RequestContext, ScreenOutcome};
pub use knowledge::{KnowledgeBase, KnowledgeBaseMatcher};
pub use mapstore::PseudonymMapStore;
pub use notify::{LogSink, Notification, NotificationSink};
pub use plugin::{PluginRunner, TenantPlugin};
pub use protocol::{adapter_for, Protocol, ProtocolAdapter, TEXT_DELIMITER};
pub use pseudonym::{MaskOutcome, PseudonymEntry, PseudonymSession, MAX_PSEUDONYM_LEN};
pub use scorer::{
    CooccurrenceSource, DocumentType, ScoreBreakdown, ScoreResult, ScoringContext,
    SensitivityLevel, SensitivityScorer,
};
pub use secrets::SecretScanner;
pub use stream::{HoldbackReverser, StreamTransform};
pub use tasks::{BackgroundTask, TaskQueue, TaskQueueConfig};
pub use upstream::UpstreamClient;
pub use vault::TenantKeyVault;
