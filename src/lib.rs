//! Flowlens - streaming normalization-and-correlation pipeline for
//! user-interaction friction signals
//!
//! Flowlens turns a firehose of low-level browser interaction events into
//! session-scoped friction signals through a one-way pipeline:
//! raw event → pattern detection → normalized signal → session correlation
//! → friction event → storage sync.
//!
//! ## Modules
//!
//! - **Pattern Detector**: classifies raw events into rage-click, hesitation,
//!   and backtrack signals over a sliding per-session buffer
//! - **Session Correlator**: folds signals into per-session journeys and
//!   computes a rolling friction score with TTL eviction
//! - **Context Enricher**: attaches page/device/consent metadata to raw and
//!   feedback events
//! - **Prompt Throttle**: per-session cooldown gate for feedback prompts
//! - **Storage Sync**: maps friction and feedback events onto the analytics
//!   store collaborator
//! - **Transport**: minimal publish/subscribe abstraction with an in-memory
//!   bus implementation

pub mod clock;
pub mod config;
pub mod correlator;
pub mod detector;
pub mod enricher;
pub mod error;
pub mod pipeline;
pub mod storage;
pub mod throttle;
pub mod transport;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FrictionWeights, PipelineConfig};
pub use correlator::{CorrelatorStage, JourneyStore, SessionCorrelator};
pub use detector::{DetectorStage, PatternDetector, SessionBufferStore};
pub use enricher::{ContextEnricher, EnricherStage};
pub use error::PipelineError;
pub use pipeline::{replay_events, replay_events_with_clock, FrictionPipeline};
pub use storage::{
    AnalyticsStore, EvidenceRecord, HotspotRecord, MemoryAnalyticsStore, SentimentBucket,
    SentimentRecord, StorageSyncStage,
};
pub use throttle::PromptThrottle;
pub use transport::{topics, InMemoryBus, Subscription, Transport};
pub use types::{
    ContextEnrichedEvent, Device, EvidenceEntry, FeedbackReaction, FeedbackRecorded, FrictionEvent,
    FrictionMetrics, InteractionAction, NormalizedSignal, OriginalEvent, PromptDecision, RawEvent,
    SessionJourney, SignalAction,
};

/// Flowlens version embedded in CLI output
pub const FLOWLENS_VERSION: &str = env!("CARGO_PKG_VERSION");
