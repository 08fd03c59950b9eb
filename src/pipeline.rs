//! Pipeline orchestration
//!
//! Wires the pattern detector, session correlator, context enricher, and
//! storage sync onto a shared transport, and offers a synchronous one-shot
//! replay entry point for batch use.
//!
//! Data flows one way: raw event → detector → normalized signal → correlator
//! → friction event → storage sync. The enricher attaches to the raw and
//! feedback streams independently and never blocks the detection path.

use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::correlator::{CorrelatorStage, SessionCorrelator};
use crate::detector::{DetectorStage, PatternDetector};
use crate::enricher::EnricherStage;
use crate::error::PipelineError;
use crate::storage::{AnalyticsStore, StorageSyncStage};
use crate::throttle::PromptThrottle;
use crate::transport::{self, topics, Transport};
use crate::types::{FeedbackRecorded, FrictionEvent, PromptDecision, RawEvent};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Replay a batch of raw events through detector and correlator, collecting
/// every friction snapshot the sequence produces.
///
/// Stateless one-shot form of the pipeline, without a transport; malformed
/// events are logged and skipped.
pub fn replay_events(
    events: &[RawEvent],
    config: &PipelineConfig,
) -> Result<Vec<FrictionEvent>, PipelineError> {
    replay_events_with_clock(events, config, Arc::new(SystemClock))
}

/// [`replay_events`] with an explicit clock for deterministic timestamps
pub fn replay_events_with_clock(
    events: &[RawEvent],
    config: &PipelineConfig,
    clock: Arc<dyn Clock>,
) -> Result<Vec<FrictionEvent>, PipelineError> {
    config.validate()?;

    let mut detector = PatternDetector::new(config);
    let mut correlator = SessionCorrelator::new(config, clock);
    let mut frictions = Vec::new();

    for event in events {
        let signal = match detector.process(event) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "skipping malformed raw event in replay");
                continue;
            }
        };
        if let Some(signal) = signal {
            if let Some(friction) = correlator.correlate(signal)? {
                frictions.push(friction);
            }
        }
    }

    Ok(frictions)
}

/// The full streaming pipeline attached to one transport.
///
/// Each stage is an independent long-running consumer; stopping the pipeline
/// releases every subscription and discards in-flight per-session state.
pub struct FrictionPipeline {
    transport: Arc<dyn Transport>,
    detector: DetectorStage,
    correlator: CorrelatorStage,
    enricher: EnricherStage,
    storage_sync: StorageSyncStage,
    throttle: Mutex<PromptThrottle>,
}

impl FrictionPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn AnalyticsStore>,
        config: &PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            detector: DetectorStage::new(Arc::clone(&transport), config),
            correlator: CorrelatorStage::new(Arc::clone(&transport), config, Arc::clone(&clock)),
            enricher: EnricherStage::new(Arc::clone(&transport), config, Arc::clone(&clock)),
            storage_sync: StorageSyncStage::new(Arc::clone(&transport), store),
            throttle: Mutex::new(PromptThrottle::new(config, clock)),
            transport,
        })
    }

    /// Start every stage.
    ///
    /// Failing to attach to the transport is the only fatal start-up
    /// condition; stages already started are stopped again before returning
    /// the error.
    pub fn start(&self) -> Result<(), PipelineError> {
        if !self.transport.is_ready() {
            return Err(PipelineError::TransportUnavailable(
                "pipeline cannot start".to_string(),
            ));
        }

        self.detector.start()?;
        if let Err(err) = self.correlator.start() {
            self.stop();
            return Err(err);
        }
        if let Err(err) = self.enricher.start() {
            self.stop();
            return Err(err);
        }
        if let Err(err) = self.storage_sync.start() {
            self.stop();
            return Err(err);
        }
        Ok(())
    }

    /// Stop every stage and release its subscriptions
    pub fn stop(&self) {
        self.detector.stop();
        self.correlator.stop();
        self.enricher.stop();
        self.storage_sync.stop();
    }

    pub fn is_running(&self) -> bool {
        self.detector.is_running()
            && self.correlator.is_running()
            && self.enricher.is_running()
            && self.storage_sync.is_running()
    }

    /// Ingress helper: publish a raw event onto `signal.raw`
    pub fn publish_raw(&self, event: &RawEvent) -> Result<(), PipelineError> {
        transport::publish_json(&*self.transport, topics::SIGNAL_RAW, event)
    }

    /// Ingress helper: publish a feedback event onto `feedback.recorded`
    pub fn publish_feedback(&self, feedback: &FeedbackRecorded) -> Result<(), PipelineError> {
        transport::publish_json(&*self.transport, topics::FEEDBACK_RECORDED, feedback)
    }

    /// Run the prompt throttle for a session and announce the decision.
    ///
    /// The decision is also published to `policy.updated`; a publish failure
    /// does not affect the returned decision.
    pub fn decide_prompt(&self, session_id: &str) -> PromptDecision {
        let decision = self
            .throttle
            .lock()
            .expect("throttle state poisoned")
            .decide(session_id);
        if let Err(err) = transport::publish_json(&*self.transport, topics::POLICY_UPDATED, &decision)
        {
            warn!(error = %err, "failed to publish prompt decision");
        }
        decision
    }
}
