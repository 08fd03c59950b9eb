//! Pattern detection
//!
//! This module classifies a stream of per-session raw interaction events into
//! normalized behavioral signals using three independent rules:
//! - rage-click: 3+ clicks on the same target within a 500ms window
//! - hesitation: a single hover/idle event dwelling 3s or longer
//! - backtrack: every backtrack navigation is itself a signal
//!
//! The action classes are disjoint, so an incoming event satisfies at most one
//! rule. Events matching no rule stay in the session buffer for future window
//! calculations.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::transport::{self, topics, Subscription, Transport};
use crate::types::{EvidenceEntry, InteractionAction, NormalizedSignal, RawEvent, SignalAction};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Per-session sliding buffer of recent raw events.
///
/// Retains at most `max_events` entries per session; once over the cap,
/// entries older than `max_age_ms` relative to the newest event are dropped.
#[derive(Debug)]
pub struct SessionBufferStore {
    buffers: HashMap<String, Vec<RawEvent>>,
    max_events: usize,
    max_age_ms: i64,
}

impl SessionBufferStore {
    pub fn new(max_events: usize, max_age_ms: i64) -> Self {
        Self {
            buffers: HashMap::new(),
            max_events,
            max_age_ms,
        }
    }

    /// Append an event to its session's buffer, creating the buffer if needed
    pub fn push(&mut self, event: RawEvent) {
        self.buffers
            .entry(event.session_id.clone())
            .or_default()
            .push(event);
    }

    /// Buffered events for a session, oldest first
    pub fn events(&self, session_id: &str) -> &[RawEvent] {
        self.buffers
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Remove matched clicks on `target` inside the window ending at `end_ms`.
    ///
    /// Consumed clicks must not re-trigger the rage-click rule.
    pub fn consume_clicks(
        &mut self,
        session_id: &str,
        target: Option<&str>,
        window_ms: i64,
        end_ms: i64,
    ) {
        if let Some(buffer) = self.buffers.get_mut(session_id) {
            buffer.retain(|e| {
                !(e.action == InteractionAction::Click
                    && e.target.as_deref() == target
                    && end_ms - e.timestamp_ms <= window_ms
                    && e.timestamp_ms <= end_ms)
            });
        }
    }

    /// Enforce the buffer cap for one session, dropping stale entries.
    ///
    /// Trimming only kicks in once the buffer exceeds the event cap; until
    /// then old entries stay around for window calculations.
    pub fn trim(&mut self, session_id: &str, now_ms: i64) {
        if let Some(buffer) = self.buffers.get_mut(session_id) {
            if buffer.len() > self.max_events {
                let cutoff = now_ms - self.max_age_ms;
                buffer.retain(|e| e.timestamp_ms > cutoff);
            }
        }
    }

    /// Drop buffers whose newest event is older than the retention window
    pub fn sweep(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.max_age_ms;
        self.buffers.retain(|_, buffer| {
            buffer
                .last()
                .map(|e| e.timestamp_ms > cutoff)
                .unwrap_or(false)
        });
    }

    pub fn session_count(&self) -> usize {
        self.buffers.len()
    }
}

/// Classifies raw events into normalized behavioral signals
#[derive(Debug)]
pub struct PatternDetector {
    store: SessionBufferStore,
    rage_click_window_ms: i64,
    rage_click_min_count: usize,
    hesitation_threshold_ms: u64,
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl PatternDetector {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            store: SessionBufferStore::new(config.buffer_max_events, config.buffer_max_age_ms),
            rage_click_window_ms: config.rage_click_window_ms,
            rage_click_min_count: config.rage_click_min_count,
            hesitation_threshold_ms: config.hesitation_threshold_ms,
        }
    }

    /// Process one raw event: buffer it, evaluate the detection rules, trim.
    ///
    /// Returns the normalized signal when a rule fired, `None` otherwise.
    /// Events without a session id are rejected.
    pub fn process(&mut self, event: &RawEvent) -> Result<Option<NormalizedSignal>, PipelineError> {
        if event.session_id.is_empty() {
            return Err(PipelineError::InvalidEvent(
                "raw event missing session_id".to_string(),
            ));
        }

        self.store.push(event.clone());
        let signal = self.detect(event);
        self.store.trim(&event.session_id, event.timestamp_ms);
        Ok(signal)
    }

    fn detect(&mut self, event: &RawEvent) -> Option<NormalizedSignal> {
        match event.action {
            InteractionAction::Click => self.detect_rage_click(event),
            InteractionAction::Hover | InteractionAction::Idle => self.detect_hesitation(event),
            InteractionAction::Backtrack => Some(self.backtrack_signal(event)),
            InteractionAction::Scroll | InteractionAction::Nav => None,
        }
    }

    /// 3+ clicks on the same target within the window ending at this click
    fn detect_rage_click(&mut self, event: &RawEvent) -> Option<NormalizedSignal> {
        let matched: Vec<&RawEvent> = self
            .store
            .events(&event.session_id)
            .iter()
            .filter(|e| {
                e.action == InteractionAction::Click
                    && e.target == event.target
                    && e.timestamp_ms <= event.timestamp_ms
                    && event.timestamp_ms - e.timestamp_ms <= self.rage_click_window_ms
            })
            .collect();

        if matched.len() < self.rage_click_min_count {
            return None;
        }

        let oldest = matched.first().map(|e| e.timestamp_ms)?;
        let span_ms = event.timestamp_ms - oldest;
        let mut metrics = HashMap::new();
        metrics.insert("count".to_string(), matched.len() as f64);
        metrics.insert("span_ms".to_string(), span_ms as f64);

        let evidence: Vec<EvidenceEntry> = matched
            .iter()
            .map(|e| EvidenceEntry {
                timestamp_ms: e.timestamp_ms,
                action: Some(e.action.as_str().to_string()),
                target: e.target.clone(),
                details: None,
            })
            .collect();

        let signal = NormalizedSignal {
            session_id: event.session_id.clone(),
            project_id: event.project_id.clone(),
            timestamp_ms: event.timestamp_ms,
            action: SignalAction::RageClick,
            target: event.target.clone(),
            metrics,
            evidence,
        };

        // Consumed clicks do not re-trigger on the next click.
        self.store.consume_clicks(
            &event.session_id,
            event.target.as_deref(),
            self.rage_click_window_ms,
            event.timestamp_ms,
        );

        Some(signal)
    }

    /// Single-event threshold check on dwell time, boundary inclusive
    fn detect_hesitation(&self, event: &RawEvent) -> Option<NormalizedSignal> {
        let dwell_ms = event.dwell_ms?;
        if dwell_ms < self.hesitation_threshold_ms {
            return None;
        }

        let mut metrics = HashMap::new();
        metrics.insert("dwell_ms".to_string(), dwell_ms as f64);

        Some(NormalizedSignal {
            session_id: event.session_id.clone(),
            project_id: event.project_id.clone(),
            timestamp_ms: event.timestamp_ms,
            action: SignalAction::Hesitation,
            target: event.target.clone(),
            metrics,
            evidence: vec![EvidenceEntry {
                timestamp_ms: event.timestamp_ms,
                action: Some(event.action.as_str().to_string()),
                target: event.target.clone(),
                details: None,
            }],
        })
    }

    /// Every backtrack is itself a signal
    fn backtrack_signal(&self, event: &RawEvent) -> NormalizedSignal {
        let mut metrics = HashMap::new();
        metrics.insert("count".to_string(), 1.0);

        NormalizedSignal {
            session_id: event.session_id.clone(),
            project_id: event.project_id.clone(),
            timestamp_ms: event.timestamp_ms,
            action: SignalAction::Backtrack,
            target: Some("navigation".to_string()),
            metrics,
            evidence: vec![EvidenceEntry {
                timestamp_ms: event.timestamp_ms,
                action: Some(event.action.as_str().to_string()),
                target: event.target.clone(),
                details: None,
            }],
        }
    }

    /// Number of sessions with buffered events
    pub fn buffered_sessions(&self) -> usize {
        self.store.session_count()
    }
}

/// Long-running consumer that normalizes `signal.raw` into `signal.normalized`
pub struct DetectorStage {
    detector: Arc<Mutex<PatternDetector>>,
    transport: Arc<dyn Transport>,
    subscription: Mutex<Option<Subscription>>,
    processed: Arc<AtomicU64>,
}

impl DetectorStage {
    pub fn new(transport: Arc<dyn Transport>, config: &PipelineConfig) -> Self {
        Self {
            detector: Arc::new(Mutex::new(PatternDetector::new(config))),
            transport,
            subscription: Mutex::new(None),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Attach to the transport. Fails if the transport is not ready.
    pub fn start(&self) -> Result<(), PipelineError> {
        if !self.transport.is_ready() {
            return Err(PipelineError::TransportUnavailable(
                "detector stage cannot attach".to_string(),
            ));
        }

        let detector = Arc::clone(&self.detector);
        let transport = Arc::clone(&self.transport);
        let processed = Arc::clone(&self.processed);

        let subscription = self.transport.subscribe(
            topics::SIGNAL_RAW,
            Box::new(move |payload| {
                let Some(event) =
                    transport::decode_message::<RawEvent>(topics::SIGNAL_RAW, payload)
                else {
                    return;
                };

                let outcome = detector
                    .lock()
                    .expect("detector state poisoned")
                    .process(&event);

                match outcome {
                    Ok(Some(signal)) => {
                        processed.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            session_id = %signal.session_id,
                            action = signal.action.as_str(),
                            "emitting normalized signal"
                        );
                        if let Err(err) =
                            transport::publish_json(&*transport, topics::SIGNAL_NORMALIZED, &signal)
                        {
                            warn!(error = %err, "failed to publish normalized signal");
                        }
                    }
                    Ok(None) => {
                        processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        warn!(error = %err, "rejecting malformed raw event");
                    }
                }
            }),
        )?;

        *self.subscription.lock().expect("subscription poisoned") = Some(subscription);
        Ok(())
    }

    /// Release the subscription; buffered per-session state is discarded
    pub fn stop(&self) {
        if let Some(subscription) = self
            .subscription
            .lock()
            .expect("subscription poisoned")
            .take()
        {
            self.transport.unsubscribe(&subscription);
        }
    }

    pub fn is_running(&self) -> bool {
        self.subscription
            .lock()
            .expect("subscription poisoned")
            .is_some()
    }

    /// Raw events processed (accepted) since start
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}
