//! Prompt throttling
//!
//! A per-session cooldown gate for feedback prompts. Unrelated to the friction
//! pipeline beyond sharing the session id as its key: the only state is a map
//! of last-prompt times.

use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::types::PromptDecision;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Per-session cooldown gate for feedback prompts
pub struct PromptThrottle {
    last_prompt_ms: HashMap<String, i64>,
    cooldown_ms: i64,
    clock: Arc<dyn Clock>,
}

impl PromptThrottle {
    pub fn new(config: &PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            last_prompt_ms: HashMap::new(),
            cooldown_ms: config.prompt_cooldown_ms,
            clock,
        }
    }

    /// Decide whether a prompt may be shown for this session.
    ///
    /// Allowing a prompt records the current time and mints a prompt id; a
    /// denied check has no side effect.
    pub fn decide(&mut self, session_id: &str) -> PromptDecision {
        let now_ms = self.clock.now_ms();

        if let Some(&last) = self.last_prompt_ms.get(session_id) {
            let elapsed = now_ms - last;
            if elapsed < self.cooldown_ms {
                return PromptDecision {
                    session_id: session_id.to_string(),
                    can_prompt: false,
                    reason: format!(
                        "cooldown active, {}ms of {}ms elapsed",
                        elapsed, self.cooldown_ms
                    ),
                    prompt_id: None,
                    next_available_ms: Some(last + self.cooldown_ms),
                };
            }
        }

        self.last_prompt_ms.insert(session_id.to_string(), now_ms);
        PromptDecision {
            session_id: session_id.to_string(),
            can_prompt: true,
            reason: "cooldown elapsed".to_string(),
            prompt_id: Some(Uuid::new_v4().to_string()),
            next_available_ms: None,
        }
    }

    /// Convenience boolean form of [`decide`](Self::decide)
    pub fn can_show_prompt(&mut self, session_id: &str) -> bool {
        self.decide(session_id).can_prompt
    }

    /// Evict sessions whose last prompt is older than `max_idle_ms`
    pub fn sweep(&mut self, max_idle_ms: i64) {
        let cutoff = self.clock.now_ms() - max_idle_ms;
        self.last_prompt_ms.retain(|_, &mut last| last >= cutoff);
    }

    pub fn tracked_sessions(&self) -> usize {
        self.last_prompt_ms.len()
    }
}
