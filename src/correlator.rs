//! Session correlation
//!
//! This module maintains one journey per active session and recomputes a
//! rolling friction score on every incoming normalized signal. The score is a
//! normalized weighted average over the journey's retained signals, so it
//! self-dilutes as benign signals accrue and saturates at 1.
//!
//! Journeys are evicted 30 minutes after creation, swept on every processed
//! signal. The TTL is measured from creation, not last activity, so a
//! long-lived continuously active session still loses its accumulated state.

use crate::clock::Clock;
use crate::config::{FrictionWeights, PipelineConfig};
use crate::error::PipelineError;
use crate::transport::{self, topics, Subscription, Transport};
use crate::types::{
    EvidenceEntry, FrictionEvent, FrictionMetrics, NormalizedSignal, SessionJourney, SignalAction,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Store of per-session journeys with TTL-based eviction
#[derive(Debug)]
pub struct JourneyStore {
    journeys: HashMap<String, SessionJourney>,
    ttl_ms: i64,
}

impl JourneyStore {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            journeys: HashMap::new(),
            ttl_ms,
        }
    }

    /// Look up or create the journey for a session.
    ///
    /// Creation stamps `start_time_ms` with the supplied time.
    pub fn get_or_create(&mut self, session_id: &str, now_ms: i64) -> &mut SessionJourney {
        self.journeys
            .entry(session_id.to_string())
            .or_insert_with(|| SessionJourney::new(now_ms))
    }

    /// Evict journeys created longer than the TTL ago
    pub fn sweep(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.ttl_ms;
        self.journeys.retain(|_, journey| journey.start_time_ms >= cutoff);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.journeys.contains_key(session_id)
    }

    pub fn journey_count(&self) -> usize {
        self.journeys.len()
    }
}

/// Correlates normalized signals into per-session friction snapshots
pub struct SessionCorrelator {
    store: JourneyStore,
    weights: FrictionWeights,
    threshold: f64,
    clock: Arc<dyn Clock>,
}

impl SessionCorrelator {
    pub fn new(config: &PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: JourneyStore::new(config.journey_ttl_ms),
            weights: config.friction_weights,
            threshold: config.friction_threshold,
            clock,
        }
    }

    /// Fold one signal into its session journey and recompute the score.
    ///
    /// Returns a friction snapshot when the score crosses the threshold.
    /// Emission repeats on every qualifying signal ("live score" semantics),
    /// each one a fresh snapshot of the journey-to-date.
    pub fn correlate(
        &mut self,
        signal: NormalizedSignal,
    ) -> Result<Option<FrictionEvent>, PipelineError> {
        if signal.session_id.is_empty() {
            return Err(PipelineError::InvalidEvent(
                "normalized signal missing session_id".to_string(),
            ));
        }

        let now_ms = self.clock.now_ms();
        let session_id = signal.session_id.clone();
        let project_id = signal.project_id.clone();

        let journey = self.store.get_or_create(&session_id, now_ms);
        if let Some(page) = page_from_target(signal.target.as_deref()) {
            if journey.pages.last().map(String::as_str) != Some(page.as_str()) {
                journey.pages.push(page);
            }
        }
        journey.signals.push(signal);

        let mut metrics = FrictionMetrics::default();
        for s in &journey.signals {
            match s.action {
                SignalAction::RageClick => metrics.rage_clicks += 1,
                SignalAction::Hesitation => metrics.hesitations += 1,
                SignalAction::Backtrack => metrics.backtracks += 1,
                SignalAction::ScrollMilestone => {}
            }
        }

        let total = journey.signals.len().max(1) as f64;
        let weighted = f64::from(metrics.rage_clicks) * self.weights.rage_click
            + f64::from(metrics.hesitations) * self.weights.hesitation
            + f64::from(metrics.backtracks) * self.weights.backtrack;
        let friction_score = (weighted / total).min(1.0);

        let friction = if friction_score > self.threshold {
            let evidence: Vec<EvidenceEntry> = journey
                .signals
                .iter()
                .map(|s| EvidenceEntry {
                    timestamp_ms: s.timestamp_ms,
                    action: Some(s.action.as_str().to_string()),
                    target: s.target.clone(),
                    details: serde_json::to_value(&s.metrics).ok(),
                })
                .collect();

            Some(FrictionEvent {
                session_id,
                project_id,
                timestamp_ms: now_ms,
                path: journey.pages.clone(),
                friction_metrics: metrics,
                friction_score,
                evidence,
            })
        } else {
            None
        };

        // Blunt creation-time TTL over all journeys, swept on every signal.
        self.store.sweep(now_ms);

        Ok(friction)
    }

    /// Number of journeys currently retained
    pub fn active_journeys(&self) -> usize {
        self.store.journey_count()
    }
}

/// Treat a path-like signal target as a page identifier
fn page_from_target(target: Option<&str>) -> Option<String> {
    let target = target?;
    if !target.starts_with('/') {
        return None;
    }
    Some(
        target
            .split('?')
            .next()
            .unwrap_or(target)
            .to_string(),
    )
}

/// Long-running consumer that folds `signal.normalized` into `session.friction`
pub struct CorrelatorStage {
    correlator: Arc<Mutex<SessionCorrelator>>,
    transport: Arc<dyn Transport>,
    subscription: Mutex<Option<Subscription>>,
    processed: Arc<AtomicU64>,
}

impl CorrelatorStage {
    pub fn new(transport: Arc<dyn Transport>, config: &PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            correlator: Arc::new(Mutex::new(SessionCorrelator::new(config, clock))),
            transport,
            subscription: Mutex::new(None),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Attach to the transport. Fails if the transport is not ready.
    pub fn start(&self) -> Result<(), PipelineError> {
        if !self.transport.is_ready() {
            return Err(PipelineError::TransportUnavailable(
                "correlator stage cannot attach".to_string(),
            ));
        }

        let correlator = Arc::clone(&self.correlator);
        let transport = Arc::clone(&self.transport);
        let processed = Arc::clone(&self.processed);

        let subscription = self.transport.subscribe(
            topics::SIGNAL_NORMALIZED,
            Box::new(move |payload| {
                let Some(signal) = transport::decode_message::<NormalizedSignal>(
                    topics::SIGNAL_NORMALIZED,
                    payload,
                ) else {
                    return;
                };

                let outcome = correlator
                    .lock()
                    .expect("correlator state poisoned")
                    .correlate(signal);

                match outcome {
                    Ok(Some(friction)) => {
                        processed.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            session_id = %friction.session_id,
                            score = friction.friction_score,
                            "emitting friction snapshot"
                        );
                        if let Err(err) =
                            transport::publish_json(&*transport, topics::SESSION_FRICTION, &friction)
                        {
                            warn!(error = %err, "failed to publish friction event");
                        }
                    }
                    Ok(None) => {
                        processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        warn!(error = %err, "rejecting malformed normalized signal");
                    }
                }
            }),
        )?;

        *self.subscription.lock().expect("subscription poisoned") = Some(subscription);
        Ok(())
    }

    /// Release the subscription; journey state is discarded
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

    /// Normalized signals processed since start
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;

    fn signal(session: &str, action: SignalAction, ts: i64) -> NormalizedSignal {
        NormalizedSignal {
            session_id: session.to_string(),
            project_id: "proj-1".to_string(),
            timestamp_ms: ts,
            action,
            target: None,
            metrics: HashMap::new(),
            evidence: vec![EvidenceEntry {
                timestamp_ms: ts,
                action: Some(action.as_str().to_string()),
                target: None,
                details: None,
            }],
        }
    }

    fn correlator_with_clock(clock: Arc<ManualClock>) -> SessionCorrelator {
        SessionCorrelator::new(&PipelineConfig::default(), clock)
    }

    #[test]
    fn test_single_rage_click_scores_point_three() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut correlator = correlator_with_clock(clock);

        let friction = correlator
            .correlate(signal("s1", SignalAction::RageClick, 1000))
            .unwrap()
            .expect("0.3 > 0.1 should emit");

        assert!((friction.friction_score - 0.3).abs() < 1e-9);
        assert_eq!(friction.friction_metrics.rage_clicks, 1);
        assert_eq!(friction.evidence.len(), 1);
    }

    #[test]
    fn test_weighted_average_mixed_signals() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut correlator = correlator_with_clock(clock);

        // R=2, H=1 out of 5 total signals: (0.3*2 + 0.2*1) / 5 = 0.16.
        let sequence = [
            SignalAction::RageClick,
            SignalAction::RageClick,
            SignalAction::Hesitation,
            SignalAction::ScrollMilestone,
            SignalAction::ScrollMilestone,
        ];

        let mut last = None;
        for (i, action) in sequence.into_iter().enumerate() {
            last = correlator
                .correlate(signal("s1", action, 1000 + i as i64))
                .unwrap();
        }

        let friction = last.expect("0.16 > 0.1 should emit");
        assert!((friction.friction_score - 0.16).abs() < 1e-9);
        assert_eq!(friction.friction_metrics.rage_clicks, 2);
        assert_eq!(friction.friction_metrics.hesitations, 1);
        assert_eq!(friction.friction_metrics.backtracks, 0);
        assert_eq!(friction.evidence.len(), 5);
    }

    #[test]
    fn test_benign_signals_dilute_below_threshold() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut correlator = correlator_with_clock(clock);

        // One backtrack among nine milestones: 0.2 / 10 = 0.02, no emission.
        let mut last = correlator
            .correlate(signal("s1", SignalAction::Backtrack, 1000))
            .unwrap();
        assert!(last.is_some()); // 0.2 / 1 on its own

        for i in 0..9 {
            last = correlator
                .correlate(signal("s1", SignalAction::ScrollMilestone, 1100 + i))
                .unwrap();
        }
        assert!(last.is_none());
    }

    #[test]
    fn test_score_clamped_to_one() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = PipelineConfig {
            friction_weights: FrictionWeights {
                rage_click: 2.0,
                hesitation: 0.2,
                backtrack: 0.2,
            },
            ..Default::default()
        };
        let mut correlator = SessionCorrelator::new(&config, clock);

        let friction = correlator
            .correlate(signal("s1", SignalAction::RageClick, 1000))
            .unwrap()
            .unwrap();
        assert_eq!(friction.friction_score, 1.0);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let run = || {
            let clock = Arc::new(ManualClock::new(1_000_000));
            let mut correlator = correlator_with_clock(clock);
            let sequence = [
                SignalAction::RageClick,
                SignalAction::Hesitation,
                SignalAction::ScrollMilestone,
                SignalAction::Backtrack,
            ];
            sequence
                .into_iter()
                .enumerate()
                .map(|(i, action)| {
                    correlator
                        .correlate(signal("s1", action, 1000 + i as i64))
                        .unwrap()
                        .map(|f| f.friction_score)
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_page_path_accumulates_deduped() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut correlator = correlator_with_clock(clock);

        let mut first = signal("s1", SignalAction::RageClick, 1000);
        first.target = Some("/checkout?step=2".to_string());
        let mut second = signal("s1", SignalAction::RageClick, 1100);
        second.target = Some("/checkout".to_string());
        let mut third = signal("s1", SignalAction::RageClick, 1200);
        third.target = Some("/cart".to_string());

        correlator.correlate(first).unwrap();
        correlator.correlate(second).unwrap();
        let friction = correlator.correlate(third).unwrap().unwrap();

        assert_eq!(friction.path, vec!["/checkout".to_string(), "/cart".to_string()]);
    }

    #[test]
    fn test_non_path_targets_do_not_extend_path() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut correlator = correlator_with_clock(clock);

        let mut s = signal("s1", SignalAction::RageClick, 1000);
        s.target = Some("#buy-button".to_string());
        let friction = correlator.correlate(s).unwrap().unwrap();
        assert!(friction.path.is_empty());
    }

    #[test]
    fn test_ttl_evicts_by_creation_time() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut correlator = correlator_with_clock(Arc::clone(&clock));

        correlator
            .correlate(signal("s1", SignalAction::RageClick, 1000))
            .unwrap();
        assert_eq!(correlator.active_journeys(), 1);

        // 31 minutes later a signal for another session triggers the sweep.
        clock.advance(31 * 60 * 1000);
        correlator
            .correlate(signal("s2", SignalAction::Backtrack, 2000))
            .unwrap();

        assert!(!correlator.store.contains("s1"));
        assert!(correlator.store.contains("s2"));
    }

    #[test]
    fn test_evicted_session_restarts_fresh() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut correlator = correlator_with_clock(Arc::clone(&clock));

        for i in 0..4 {
            correlator
                .correlate(signal("s1", SignalAction::RageClick, 1000 + i))
                .unwrap();
        }

        clock.advance(31 * 60 * 1000);
        correlator
            .correlate(signal("s2", SignalAction::Backtrack, 2000))
            .unwrap();

        // The old journey is gone, so the next signal counts from scratch.
        let friction = correlator
            .correlate(signal("s1", SignalAction::RageClick, 3000))
            .unwrap()
            .unwrap();
        assert_eq!(friction.friction_metrics.rage_clicks, 1);
        assert_eq!(friction.evidence.len(), 1);
    }

    #[test]
    fn test_active_session_still_evicted_after_ttl() {
        // Creation-time TTL: steady activity does not keep a journey alive.
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut correlator = correlator_with_clock(Arc::clone(&clock));

        for i in 0..5 {
            correlator
                .correlate(signal("s1", SignalAction::ScrollMilestone, 1000 + i))
                .unwrap();
            clock.advance(10 * 60 * 1000);
        }

        // After 30+ minutes of activity the journey has been recreated, so
        // only the signals since the last eviction remain.
        let friction = correlator
            .correlate(signal("s1", SignalAction::RageClick, 9000))
            .unwrap();
        let friction = friction.expect("fresh journey scores 0.3 on one rage click");
        assert!(friction.evidence.len() < 6);
    }

    #[test]
    fn test_missing_session_id_rejected() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut correlator = correlator_with_clock(clock);
        let result = correlator.correlate(signal("", SignalAction::RageClick, 1000));
        assert!(result.is_err());
    }
}
