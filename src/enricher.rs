//! Context enrichment
//!
//! Pure transform that wraps raw and feedback events with page, device, and
//! consent metadata before they reach persistence. It shares the transport
//! with the detection path but keeps no state, so it runs independently and
//! never blocks detection.

use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::transport::{self, topics, Subscription, Transport};
use crate::types::{ContextEnrichedEvent, Device, FeedbackRecorded, OriginalEvent, RawEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// User agent attached when enriching server-side
const SERVER_USER_AGENT: &str = "server";

/// Attaches page/device/consent context to raw and feedback events
#[derive(Debug, Clone)]
pub struct ContextEnricher {
    default_consent: bool,
}

impl Default for ContextEnricher {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl ContextEnricher {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            default_consent: config.default_consent,
        }
    }

    /// Wrap a raw event with context metadata
    pub fn enrich_raw(&self, event: RawEvent, now_ms: i64) -> ContextEnrichedEvent {
        ContextEnrichedEvent {
            session_id: event.session_id.clone(),
            project_id: event.project_id.clone(),
            timestamp_ms: now_ms,
            page: page_from_target(event.target.as_deref()),
            device: detect_device(),
            user_agent: SERVER_USER_AGENT.to_string(),
            consent_granted: self.default_consent,
            original_event: OriginalEvent::Raw(event),
        }
    }

    /// Wrap a feedback event with context metadata.
    ///
    /// Feedback already names the page it was given on.
    pub fn enrich_feedback(&self, event: FeedbackRecorded, now_ms: i64) -> ContextEnrichedEvent {
        ContextEnrichedEvent {
            session_id: event.session_id.clone(),
            project_id: event.project_id.clone(),
            timestamp_ms: now_ms,
            page: event.page.clone(),
            device: detect_device(),
            user_agent: SERVER_USER_AGENT.to_string(),
            consent_granted: self.default_consent,
            original_event: OriginalEvent::Feedback(event),
        }
    }
}

/// Page heuristic: a target starting with `/` is a path; strip the query.
fn page_from_target(target: Option<&str>) -> String {
    match target {
        Some(t) if t.starts_with('/') => t.split('?').next().unwrap_or(t).to_string(),
        _ => "/unknown".to_string(),
    }
}

/// No client hints are available server-side; assume desktop.
fn detect_device() -> Device {
    Device::Desktop
}

/// Long-running consumer enriching `signal.raw` and `feedback.recorded`
pub struct EnricherStage {
    enricher: ContextEnricher,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    subscriptions: Mutex<Vec<Subscription>>,
    processed: Arc<AtomicU64>,
}

impl EnricherStage {
    pub fn new(transport: Arc<dyn Transport>, config: &PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            enricher: ContextEnricher::new(config),
            transport,
            clock,
            subscriptions: Mutex::new(Vec::new()),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Attach to both input topics. Fails if the transport is not ready.
    pub fn start(&self) -> Result<(), PipelineError> {
        if !self.transport.is_ready() {
            return Err(PipelineError::TransportUnavailable(
                "enricher stage cannot attach".to_string(),
            ));
        }

        let raw_sub = {
            let enricher = self.enricher.clone();
            let transport = Arc::clone(&self.transport);
            let clock = Arc::clone(&self.clock);
            let processed = Arc::clone(&self.processed);
            self.transport.subscribe(
                topics::SIGNAL_RAW,
                Box::new(move |payload| {
                    let Some(event) =
                        transport::decode_message::<RawEvent>(topics::SIGNAL_RAW, payload)
                    else {
                        return;
                    };
                    let enriched = enricher.enrich_raw(event, clock.now_ms());
                    processed.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) =
                        transport::publish_json(&*transport, topics::CONTEXT_ENRICHED, &enriched)
                    {
                        warn!(error = %err, "failed to publish enriched event");
                    }
                }),
            )?
        };

        let feedback_sub = {
            let enricher = self.enricher.clone();
            let transport = Arc::clone(&self.transport);
            let clock = Arc::clone(&self.clock);
            let processed = Arc::clone(&self.processed);
            self.transport.subscribe(
                topics::FEEDBACK_RECORDED,
                Box::new(move |payload| {
                    let Some(event) = transport::decode_message::<FeedbackRecorded>(
                        topics::FEEDBACK_RECORDED,
                        payload,
                    ) else {
                        return;
                    };
                    let enriched = enricher.enrich_feedback(event, clock.now_ms());
                    processed.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) =
                        transport::publish_json(&*transport, topics::CONTEXT_ENRICHED, &enriched)
                    {
                        warn!(error = %err, "failed to publish enriched event");
                    }
                }),
            )?
        };

        let mut subscriptions = self.subscriptions.lock().expect("subscriptions poisoned");
        subscriptions.push(raw_sub);
        subscriptions.push(feedback_sub);
        Ok(())
    }

    /// Release both subscriptions
    pub fn stop(&self) {
        let mut subscriptions = self.subscriptions.lock().expect("subscriptions poisoned");
        for subscription in subscriptions.drain(..) {
            self.transport.unsubscribe(&subscription);
        }
    }

    pub fn is_running(&self) -> bool {
        !self
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .is_empty()
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeedbackReaction, InteractionAction};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn raw_event(target: Option<&str>) -> RawEvent {
        RawEvent {
            session_id: "s1".to_string(),
            project_id: "proj-1".to_string(),
            timestamp_ms: 1000,
            action: InteractionAction::Click,
            target: target.map(str::to_string),
            dwell_ms: None,
            scroll_depth: None,
            details: HashMap::new(),
        }
    }

    #[test]
    fn test_path_target_becomes_page() {
        let enricher = ContextEnricher::default();
        let enriched = enricher.enrich_raw(raw_event(Some("/checkout?step=2")), 5000);

        assert_eq!(enriched.page, "/checkout");
        assert_eq!(enriched.device, Device::Desktop);
        assert_eq!(enriched.user_agent, "server");
        assert!(enriched.consent_granted);
        assert_eq!(enriched.timestamp_ms, 5000);
    }

    #[test]
    fn test_non_path_target_defaults_unknown() {
        let enricher = ContextEnricher::default();
        let enriched = enricher.enrich_raw(raw_event(Some("#buy-button")), 5000);
        assert_eq!(enriched.page, "/unknown");
    }

    #[test]
    fn test_missing_target_defaults_unknown() {
        let enricher = ContextEnricher::default();
        let enriched = enricher.enrich_raw(raw_event(None), 5000);
        assert_eq!(enriched.page, "/unknown");
    }

    #[test]
    fn test_original_event_preserved() {
        let enricher = ContextEnricher::default();
        let enriched = enricher.enrich_raw(raw_event(Some("/cart")), 5000);

        match enriched.original_event {
            OriginalEvent::Raw(ref original) => {
                assert_eq!(original.timestamp_ms, 1000);
                assert_eq!(original.action, InteractionAction::Click);
            }
            OriginalEvent::Feedback(_) => panic!("expected raw original"),
        }
    }

    #[test]
    fn test_feedback_uses_its_own_page() {
        let enricher = ContextEnricher::default();
        let feedback = FeedbackRecorded {
            session_id: "s1".to_string(),
            project_id: "proj-1".to_string(),
            timestamp_ms: 1000,
            reaction: FeedbackReaction::ThumbsUp,
            prompt_id: "p-1".to_string(),
            page: "/pricing".to_string(),
            dwell_before_ms: Some(1200),
        };

        let enriched = enricher.enrich_feedback(feedback, 5000);
        assert_eq!(enriched.page, "/pricing");
        assert!(matches!(enriched.original_event, OriginalEvent::Feedback(_)));
    }

    #[test]
    fn test_configured_consent_propagates() {
        let config = PipelineConfig {
            default_consent: false,
            ..Default::default()
        };
        let enricher = ContextEnricher::new(&config);
        let enriched = enricher.enrich_raw(raw_event(None), 5000);
        assert!(!enriched.consent_granted);
    }
}
