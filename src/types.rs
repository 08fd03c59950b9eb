//! Core types for the Flowlens pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: raw interaction events, normalized behavioral signals, session
//! journeys, and friction events.
//!
//! Event timestamps are epoch milliseconds as produced by the capture widget.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Low-level interaction actions captured by the browser widget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionAction {
    Click,
    Hover,
    Scroll,
    Idle,
    Nav,
    Backtrack,
}

impl InteractionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionAction::Click => "click",
            InteractionAction::Hover => "hover",
            InteractionAction::Scroll => "scroll",
            InteractionAction::Idle => "idle",
            InteractionAction::Nav => "nav",
            InteractionAction::Backtrack => "backtrack",
        }
    }
}

/// A raw interaction event from the capture client.
///
/// Immutable once produced; consumed by the pattern detector, which may buffer
/// it for a bounded window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Client-generated session identifier
    pub session_id: String,
    /// Project the event belongs to
    pub project_id: String,
    /// Event time (epoch milliseconds)
    pub timestamp_ms: i64,
    /// Interaction action
    pub action: InteractionAction,
    /// DOM target or path the interaction hit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Dwell duration for hover/idle events (milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dwell_ms: Option<u64>,
    /// Scroll depth (0-1) for scroll events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_depth: Option<f64>,
    /// Free-form payload details preserved for transparency
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

/// Behavioral signal classes emitted by the pattern detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    RageClick,
    Hesitation,
    Backtrack,
    ScrollMilestone,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::RageClick => "rage_click",
            SignalAction::Hesitation => "hesitation",
            SignalAction::Backtrack => "backtrack",
            SignalAction::ScrollMilestone => "scroll_milestone",
        }
    }
}

/// Raw-event excerpt justifying why a signal fired.
///
/// Every emitted signal and friction event carries at least one entry so the
/// result can be traced back to the raw events that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEntry {
    /// Time of the contributing raw event (epoch milliseconds)
    pub timestamp_ms: i64,
    /// Action of the contributing event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Target of the contributing event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Additional detail payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// A normalized behavioral signal derived from raw events.
///
/// Derived, never mutated after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedSignal {
    pub session_id: String,
    pub project_id: String,
    /// Time of the triggering raw event (epoch milliseconds)
    pub timestamp_ms: i64,
    pub action: SignalAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Rule-specific metrics (count, span_ms, dwell_ms, ...)
    pub metrics: HashMap<String, f64>,
    /// Ordered raw-event excerpts that produced this signal (never empty)
    pub evidence: Vec<EvidenceEntry>,
}

/// Per-session journey state owned by the session correlator.
///
/// Created on the first signal for a session, updated by every subsequent
/// signal, evicted once the creation-time TTL elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionJourney {
    /// Ordered page identifiers visited during the session
    pub pages: Vec<String>,
    /// Ordered signals observed for the session
    pub signals: Vec<NormalizedSignal>,
    /// Journey creation time (epoch milliseconds)
    pub start_time_ms: i64,
}

impl SessionJourney {
    pub fn new(start_time_ms: i64) -> Self {
        Self {
            pages: Vec::new(),
            signals: Vec::new(),
            start_time_ms,
        }
    }
}

/// Per-category signal counts carried by a friction event
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrictionMetrics {
    pub rage_clicks: u32,
    pub hesitations: u32,
    pub backtracks: u32,
    pub scroll_abandonment: bool,
}

/// A friction snapshot for one session window.
///
/// Each emission is a snapshot of the journey-to-date, not a delta; downstream
/// consumers must treat repeated emissions for the same session as fresh
/// replacements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrictionEvent {
    pub session_id: String,
    pub project_id: String,
    /// Emission time (epoch milliseconds)
    pub timestamp_ms: i64,
    /// Sequence of pages the session visited
    pub path: Vec<String>,
    pub friction_metrics: FrictionMetrics,
    /// Weighted friction ratio, clamped to 0-1
    pub friction_score: f64,
    /// Full evidence trail of the journey's signals so far (never empty)
    pub evidence: Vec<EvidenceEntry>,
}

/// One-tap feedback reactions from the capture widget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackReaction {
    ThumbsUp,
    ThumbsDown,
    Neutral,
}

impl FeedbackReaction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackReaction::ThumbsUp => "thumbs_up",
            FeedbackReaction::ThumbsDown => "thumbs_down",
            FeedbackReaction::Neutral => "neutral",
        }
    }
}

/// A recorded feedback reaction tied to a prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecorded {
    pub session_id: String,
    pub project_id: String,
    pub timestamp_ms: i64,
    pub reaction: FeedbackReaction,
    /// Identifier of the prompt that solicited the reaction
    pub prompt_id: String,
    /// Page the feedback was given on
    pub page: String,
    /// Dwell time on the page before reacting (milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dwell_before_ms: Option<u64>,
}

/// Device class attached during context enrichment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Mobile,
    Tablet,
    Desktop,
}

/// The event a context-enriched wrapper was derived from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OriginalEvent {
    Raw(RawEvent),
    Feedback(FeedbackRecorded),
}

/// A raw or feedback event wrapped with page/device/consent context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEnrichedEvent {
    pub session_id: String,
    pub project_id: String,
    /// Enrichment time (epoch milliseconds)
    pub timestamp_ms: i64,
    pub page: String,
    pub device: Device,
    pub user_agent: String,
    pub consent_granted: bool,
    pub original_event: OriginalEvent,
}

/// Outcome of a prompt-throttle check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDecision {
    pub session_id: String,
    pub can_prompt: bool,
    /// Human-readable reason for the decision
    pub reason: String,
    /// Minted prompt identifier when the prompt is allowed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    /// Earliest time the next prompt may show (epoch milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_available_ms: Option<i64>,
}
