//! Storage sync
//!
//! Terminal consumer mapping friction and feedback events onto the external
//! analytics store collaborator. This module owns no detection logic: it is a
//! deterministic field mapping with fire-and-forget writes. Store failures are
//! logged and the event dropped; friction data is best-effort telemetry, not a
//! system of record.

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::transport::{self, topics, Subscription, Transport};
use crate::types::{FeedbackReaction, FeedbackRecorded, FrictionEvent, FrictionMetrics};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Retained sentiment entries per project
const SENTIMENT_CAP: usize = 5000;

/// Retained evidence entries per project
const EVIDENCE_CAP: usize = 1000;

/// Page-level friction aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotspotRecord {
    pub project_id: String,
    pub page: String,
    pub metrics: FrictionMetrics,
    pub friction_score: f64,
    pub updated_at_ms: i64,
}

/// One recorded feedback reaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentRecord {
    pub project_id: String,
    pub session_id: String,
    pub page: String,
    pub reaction: FeedbackReaction,
    pub timestamp_ms: i64,
}

/// One persisted evidence excerpt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub project_id: String,
    pub session_id: String,
    pub action: String,
    pub details: String,
    pub timestamp_ms: i64,
}

/// Daily reaction counts for a project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentBucket {
    /// Day in YYYY-MM-DD form
    pub date: String,
    pub thumbs_up: u32,
    pub thumbs_down: u32,
    pub neutral: u32,
}

/// Document-store collaborator used by storage sync and the read APIs
pub trait AnalyticsStore: Send + Sync {
    /// Replace the hotspot aggregate for (project, page)
    fn upsert_hotspot(
        &self,
        project_id: &str,
        page: &str,
        metrics: &FrictionMetrics,
        friction_score: f64,
    ) -> Result<(), PipelineError>;

    /// Append one sentiment entry for a project
    fn append_sentiment(
        &self,
        project_id: &str,
        session_id: &str,
        page: &str,
        reaction: FeedbackReaction,
    ) -> Result<(), PipelineError>;

    /// Append one evidence excerpt for a project
    fn append_evidence(
        &self,
        project_id: &str,
        session_id: &str,
        action: &str,
        details: &str,
    ) -> Result<(), PipelineError>;

    /// Hotspots for a project, highest friction first
    fn top_hotspots(&self, project_id: &str, limit: usize)
        -> Result<Vec<HotspotRecord>, PipelineError>;

    /// Per-day reaction counts within a time range, oldest day first
    fn sentiment_trend(
        &self,
        project_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<SentimentBucket>, PipelineError>;

    /// Most recent evidence excerpts, newest first
    fn recent_evidence(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<EvidenceRecord>, PipelineError>;
}

#[derive(Default)]
struct MemoryStoreState {
    hotspots: HashMap<(String, String), HotspotRecord>,
    sentiment: HashMap<String, Vec<SentimentRecord>>,
    evidence: HashMap<String, Vec<EvidenceRecord>>,
}

/// In-memory analytics store.
///
/// Serves as the default collaborator in tests and single-process deployments;
/// keeps the newest entries first and enforces the per-project caps.
pub struct MemoryAnalyticsStore {
    state: Mutex<MemoryStoreState>,
    clock: Arc<dyn Clock>,
}

impl MemoryAnalyticsStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryStoreState::default()),
            clock,
        }
    }
}

impl AnalyticsStore for MemoryAnalyticsStore {
    fn upsert_hotspot(
        &self,
        project_id: &str,
        page: &str,
        metrics: &FrictionMetrics,
        friction_score: f64,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.lock().expect("store state poisoned");
        state.hotspots.insert(
            (project_id.to_string(), page.to_string()),
            HotspotRecord {
                project_id: project_id.to_string(),
                page: page.to_string(),
                metrics: *metrics,
                friction_score,
                updated_at_ms: self.clock.now_ms(),
            },
        );
        Ok(())
    }

    fn append_sentiment(
        &self,
        project_id: &str,
        session_id: &str,
        page: &str,
        reaction: FeedbackReaction,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.lock().expect("store state poisoned");
        let list = state.sentiment.entry(project_id.to_string()).or_default();
        list.insert(
            0,
            SentimentRecord {
                project_id: project_id.to_string(),
                session_id: session_id.to_string(),
                page: page.to_string(),
                reaction,
                timestamp_ms: self.clock.now_ms(),
            },
        );
        list.truncate(SENTIMENT_CAP);
        Ok(())
    }

    fn append_evidence(
        &self,
        project_id: &str,
        session_id: &str,
        action: &str,
        details: &str,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.lock().expect("store state poisoned");
        let list = state.evidence.entry(project_id.to_string()).or_default();
        list.insert(
            0,
            EvidenceRecord {
                project_id: project_id.to_string(),
                session_id: session_id.to_string(),
                action: action.to_string(),
                details: details.to_string(),
                timestamp_ms: self.clock.now_ms(),
            },
        );
        list.truncate(EVIDENCE_CAP);
        Ok(())
    }

    fn top_hotspots(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<HotspotRecord>, PipelineError> {
        let state = self.state.lock().expect("store state poisoned");
        let mut hotspots: Vec<HotspotRecord> = state
            .hotspots
            .iter()
            .filter(|((project, _), _)| project == project_id)
            .map(|(_, record)| record.clone())
            .collect();
        hotspots.sort_by(|a, b| {
            b.friction_score
                .partial_cmp(&a.friction_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hotspots.truncate(limit);
        Ok(hotspots)
    }

    fn sentiment_trend(
        &self,
        project_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<SentimentBucket>, PipelineError> {
        let state = self.state.lock().expect("store state poisoned");
        let mut buckets: HashMap<String, SentimentBucket> = HashMap::new();

        for record in state.sentiment.get(project_id).into_iter().flatten() {
            if record.timestamp_ms < from_ms || record.timestamp_ms > to_ms {
                continue;
            }
            let Some(datetime) = DateTime::from_timestamp_millis(record.timestamp_ms) else {
                continue;
            };
            let date = datetime.date_naive().to_string();
            let bucket = buckets.entry(date.clone()).or_insert_with(|| SentimentBucket {
                date,
                ..Default::default()
            });
            match record.reaction {
                FeedbackReaction::ThumbsUp => bucket.thumbs_up += 1,
                FeedbackReaction::ThumbsDown => bucket.thumbs_down += 1,
                FeedbackReaction::Neutral => bucket.neutral += 1,
            }
        }

        let mut trend: Vec<SentimentBucket> = buckets.into_values().collect();
        trend.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(trend)
    }

    fn recent_evidence(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<EvidenceRecord>, PipelineError> {
        let state = self.state.lock().expect("store state poisoned");
        Ok(state
            .evidence
            .get(project_id)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

/// Map one friction event onto the store: one hotspot upsert keyed by the
/// first path entry, plus one evidence append per evidence excerpt.
pub fn sync_friction(store: &dyn AnalyticsStore, friction: &FrictionEvent) {
    let page = friction
        .path
        .first()
        .map(String::as_str)
        .unwrap_or("/unknown");

    if let Err(err) = store.upsert_hotspot(
        &friction.project_id,
        page,
        &friction.friction_metrics,
        friction.friction_score,
    ) {
        warn!(error = %err, project_id = %friction.project_id, "dropping hotspot write");
        return;
    }

    for entry in &friction.evidence {
        let action = entry.action.as_deref().unwrap_or("unknown");
        let details = entry
            .details
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "{}".to_string());
        if let Err(err) =
            store.append_evidence(&friction.project_id, &friction.session_id, action, &details)
        {
            warn!(error = %err, "dropping evidence write");
        }
    }

    debug!(
        project_id = %friction.project_id,
        score = friction.friction_score,
        "stored friction data"
    );
}

/// Map one feedback event onto the store as a sentiment entry
pub fn sync_feedback(store: &dyn AnalyticsStore, feedback: &FeedbackRecorded) {
    let page = if feedback.page.is_empty() {
        "/unknown"
    } else {
        feedback.page.as_str()
    };
    if let Err(err) = store.append_sentiment(
        &feedback.project_id,
        &feedback.session_id,
        page,
        feedback.reaction,
    ) {
        warn!(error = %err, "dropping sentiment write");
    }
}

/// Terminal consumer persisting `session.friction` and `feedback.recorded`
pub struct StorageSyncStage {
    store: Arc<dyn AnalyticsStore>,
    transport: Arc<dyn Transport>,
    subscriptions: Mutex<Vec<Subscription>>,
    processed: Arc<AtomicU64>,
}

impl StorageSyncStage {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn AnalyticsStore>) -> Self {
        Self {
            store,
            transport,
            subscriptions: Mutex::new(Vec::new()),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Attach to both input topics. Fails if the transport is not ready.
    pub fn start(&self) -> Result<(), PipelineError> {
        if !self.transport.is_ready() {
            return Err(PipelineError::TransportUnavailable(
                "storage sync stage cannot attach".to_string(),
            ));
        }

        let friction_sub = {
            let store = Arc::clone(&self.store);
            let processed = Arc::clone(&self.processed);
            self.transport.subscribe(
                topics::SESSION_FRICTION,
                Box::new(move |payload| {
                    let Some(friction) =
                        transport::decode_message::<FrictionEvent>(topics::SESSION_FRICTION, payload)
                    else {
                        return;
                    };
                    sync_friction(&*store, &friction);
                    processed.fetch_add(1, Ordering::Relaxed);
                }),
            )?
        };

        let feedback_sub = {
            let store = Arc::clone(&self.store);
            let processed = Arc::clone(&self.processed);
            self.transport.subscribe(
                topics::FEEDBACK_RECORDED,
                Box::new(move |payload| {
                    let Some(feedback) = transport::decode_message::<FeedbackRecorded>(
                        topics::FEEDBACK_RECORDED,
                        payload,
                    ) else {
                        return;
                    };
                    sync_feedback(&*store, &feedback);
                    processed.fetch_add(1, Ordering::Relaxed);
                }),
            )?
        };

        let mut subscriptions = self.subscriptions.lock().expect("subscriptions poisoned");
        subscriptions.push(friction_sub);
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
    use crate::clock::ManualClock;
    use crate::types::EvidenceEntry;
    use pretty_assertions::assert_eq;

    fn store() -> MemoryAnalyticsStore {
        MemoryAnalyticsStore::new(Arc::new(ManualClock::new(1_700_000_000_000)))
    }

    fn friction_event(score: f64, path: Vec<&str>) -> FrictionEvent {
        FrictionEvent {
            session_id: "s1".to_string(),
            project_id: "proj-1".to_string(),
            timestamp_ms: 1000,
            path: path.into_iter().map(str::to_string).collect(),
            friction_metrics: FrictionMetrics {
                rage_clicks: 2,
                hesitations: 1,
                backtracks: 0,
                scroll_abandonment: false,
            },
            friction_score: score,
            evidence: vec![
                EvidenceEntry {
                    timestamp_ms: 900,
                    action: Some("rage_click".to_string()),
                    target: Some("#buy".to_string()),
                    details: Some(serde_json::json!({"count": 3.0})),
                },
                EvidenceEntry {
                    timestamp_ms: 950,
                    action: Some("hesitation".to_string()),
                    target: None,
                    details: None,
                },
            ],
        }
    }

    #[test]
    fn test_friction_maps_to_hotspot_and_evidence() {
        let store = store();
        sync_friction(&store, &friction_event(0.4, vec!["/checkout", "/cart"]));

        let hotspots = store.top_hotspots("proj-1", 10).unwrap();
        assert_eq!(hotspots.len(), 1);
        assert_eq!(hotspots[0].page, "/checkout");
        assert_eq!(hotspots[0].friction_score, 0.4);
        assert_eq!(hotspots[0].metrics.rage_clicks, 2);

        let evidence = store.recent_evidence("proj-1", 10).unwrap();
        assert_eq!(evidence.len(), 2);
        // Newest first.
        assert_eq!(evidence[0].action, "hesitation");
        assert_eq!(evidence[0].details, "{}");
        assert_eq!(evidence[1].action, "rage_click");
        assert!(evidence[1].details.contains("count"));
    }

    #[test]
    fn test_empty_path_keys_unknown_page() {
        let store = store();
        sync_friction(&store, &friction_event(0.2, vec![]));

        let hotspots = store.top_hotspots("proj-1", 10).unwrap();
        assert_eq!(hotspots[0].page, "/unknown");
    }

    #[test]
    fn test_hotspot_upsert_replaces() {
        let store = store();
        sync_friction(&store, &friction_event(0.2, vec!["/checkout"]));
        sync_friction(&store, &friction_event(0.5, vec!["/checkout"]));

        let hotspots = store.top_hotspots("proj-1", 10).unwrap();
        assert_eq!(hotspots.len(), 1);
        assert_eq!(hotspots[0].friction_score, 0.5);
    }

    #[test]
    fn test_top_hotspots_sorted_by_score() {
        let store = store();
        sync_friction(&store, &friction_event(0.2, vec!["/cart"]));
        sync_friction(&store, &friction_event(0.8, vec!["/checkout"]));
        sync_friction(&store, &friction_event(0.5, vec!["/pricing"]));

        let hotspots = store.top_hotspots("proj-1", 2).unwrap();
        assert_eq!(hotspots.len(), 2);
        assert_eq!(hotspots[0].page, "/checkout");
        assert_eq!(hotspots[1].page, "/pricing");
    }

    #[test]
    fn test_feedback_maps_to_sentiment() {
        let store = store();
        let feedback = FeedbackRecorded {
            session_id: "s1".to_string(),
            project_id: "proj-1".to_string(),
            timestamp_ms: 1000,
            reaction: FeedbackReaction::ThumbsDown,
            prompt_id: "p-1".to_string(),
            page: "/checkout".to_string(),
            dwell_before_ms: None,
        };
        sync_feedback(&store, &feedback);

        let trend = store
            .sentiment_trend("proj-1", 0, 2_000_000_000_000)
            .unwrap();
        assert_eq!(trend.len(), 1);
        assert_eq!(trend[0].thumbs_down, 1);
        assert_eq!(trend[0].thumbs_up, 0);
    }

    #[test]
    fn test_sentiment_trend_buckets_by_day() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = MemoryAnalyticsStore::new(Arc::clone(&clock) as Arc<dyn Clock>);

        store
            .append_sentiment("proj-1", "s1", "/a", FeedbackReaction::ThumbsUp)
            .unwrap();
        clock.advance(24 * 60 * 60 * 1000);
        store
            .append_sentiment("proj-1", "s2", "/a", FeedbackReaction::ThumbsUp)
            .unwrap();
        store
            .append_sentiment("proj-1", "s3", "/a", FeedbackReaction::Neutral)
            .unwrap();

        let trend = store
            .sentiment_trend("proj-1", 0, 2_000_000_000_000)
            .unwrap();
        assert_eq!(trend.len(), 2);
        assert_eq!(trend[0].thumbs_up, 1);
        assert_eq!(trend[1].thumbs_up, 1);
        assert_eq!(trend[1].neutral, 1);
    }

    #[test]
    fn test_sentiment_trend_respects_range() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = MemoryAnalyticsStore::new(Arc::clone(&clock) as Arc<dyn Clock>);

        store
            .append_sentiment("proj-1", "s1", "/a", FeedbackReaction::ThumbsUp)
            .unwrap();
        clock.advance(10_000);
        store
            .append_sentiment("proj-1", "s2", "/a", FeedbackReaction::ThumbsDown)
            .unwrap();

        let trend = store
            .sentiment_trend("proj-1", 1_700_000_000_000, 1_700_000_005_000)
            .unwrap();
        assert_eq!(trend.len(), 1);
        assert_eq!(trend[0].thumbs_up, 1);
        assert_eq!(trend[0].thumbs_down, 0);
    }

    #[test]
    fn test_evidence_cap_enforced() {
        let store = store();
        for i in 0..(EVIDENCE_CAP + 10) {
            store
                .append_evidence("proj-1", "s1", "backtrack", &format!("{{\"n\":{i}}}"))
                .unwrap();
        }

        let evidence = store.recent_evidence("proj-1", EVIDENCE_CAP + 10).unwrap();
        assert_eq!(evidence.len(), EVIDENCE_CAP);
        // Newest entry survives.
        assert!(evidence[0].details.contains(&format!("{}", EVIDENCE_CAP + 9)));
    }

    #[test]
    fn test_projects_isolated() {
        let store = store();
        sync_friction(&store, &friction_event(0.4, vec!["/checkout"]));

        assert!(store.top_hotspots("proj-2", 10).unwrap().is_empty());
        assert!(store.recent_evidence("proj-2", 10).unwrap().is_empty());
    }
}
