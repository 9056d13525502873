// Session tracking - per-session in-memory state for cadence and workflows
//
// Each active shell session owns a cadence machine and a workflow tracker,
// kept in a session-keyed map and released when the session ends or goes
// idle past the timeout. Nothing here touches the store: this is the
// in-memory half of the engine, updated synchronously on the caller's
// thread.

use crate::cadence::{CadenceConfig, CadenceMachine, TimingHint};
use crate::workflow::{NextStepCandidate, WorkflowConfig, WorkflowPattern, WorkflowTracker};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Default idle eviction threshold: 30 minutes without activity.
pub const DEFAULT_SESSION_IDLE_MS: i64 = 30 * 60 * 1000;

/// Outcome of feeding one keystroke through a session's cadence machine.
#[derive(Debug, Clone, Copy)]
pub struct KeystrokeOutcome {
    /// Whether the cadence machine wants a suggestion request emitted.
    pub request_suggestion: bool,
    pub hint: TimingHint,
}

#[derive(Debug)]
struct SessionState {
    cadence: CadenceMachine,
    workflows: WorkflowTracker,
    /// Candidates from the most recent command, consumed at suggest time.
    workflow_candidates: Vec<NextStepCandidate>,
    last_activity_ms: i64,
}

/// Session-keyed registry of in-memory state.
///
/// Interior mutability keeps the callers simple: the engine shares one
/// registry across the record, keystroke and suggest paths.
#[derive(Debug)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, SessionState>>,
    patterns: Mutex<Arc<[WorkflowPattern]>>,
    cadence_config: CadenceConfig,
    workflow_config: WorkflowConfig,
    idle_timeout_ms: i64,
}

impl SessionRegistry {
    pub fn new(
        patterns: Arc<[WorkflowPattern]>,
        cadence_config: CadenceConfig,
        workflow_config: WorkflowConfig,
        idle_timeout_ms: i64,
    ) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            patterns: Mutex::new(patterns),
            cadence_config,
            workflow_config,
            idle_timeout_ms,
        }
    }

    fn with_session<T>(
        &self,
        session_id: &str,
        now_ms: i64,
        f: impl FnOnce(&mut SessionState) -> T,
    ) -> T {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let state = map.entry(session_id.to_string()).or_insert_with(|| {
            let patterns = {
                let guard = self.patterns.lock().unwrap_or_else(|p| p.into_inner());
                Arc::clone(&*guard)
            };
            SessionState {
                cadence: CadenceMachine::new(self.cadence_config),
                workflows: WorkflowTracker::new(patterns, self.workflow_config),
                workflow_candidates: Vec::new(),
                last_activity_ms: now_ms,
            }
        });
        state.last_activity_ms = state.last_activity_ms.max(now_ms);
        f(state)
    }

    /// Observe one executed command (ephemeral ones included: they still
    /// advance the in-memory workflow context even though nothing is
    /// persisted).
    pub fn on_command(
        &self,
        session_id: &str,
        template_id: &str,
        now_ms: i64,
    ) -> Vec<NextStepCandidate> {
        self.with_session(session_id, now_ms, |state| {
            let candidates = state.workflows.on_command(template_id, now_ms);
            state.workflow_candidates = candidates.clone();
            candidates
        })
    }

    /// Feed one keystroke through the session's cadence machine.
    pub fn on_keystroke(&self, session_id: &str, now_ms: i64) -> KeystrokeOutcome {
        self.with_session(session_id, now_ms, |state| {
            let request_suggestion = state.cadence.on_keystroke(now_ms);
            KeystrokeOutcome {
                request_suggestion,
                hint: state.cadence.timing_hint(),
            }
        })
    }

    /// Timer-driven idle sweep for one session's cadence machine.
    pub fn on_idle(&self, session_id: &str, now_ms: i64) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(state) = map.get_mut(session_id) {
            state.cadence.on_idle(now_ms);
        }
    }

    /// Current timing hint without consuming a keystroke.
    pub fn timing_hint(&self, session_id: &str, now_ms: i64) -> TimingHint {
        self.with_session(session_id, now_ms, |state| state.cadence.timing_hint())
    }

    /// Workflow candidates produced by the session's most recent command.
    pub fn workflow_candidates(&self, session_id: &str) -> Vec<NextStepCandidate> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.get(session_id)
            .map(|state| state.workflow_candidates.clone())
            .unwrap_or_default()
    }

    /// Hot-swap the workflow pattern set for existing and future sessions.
    pub fn set_patterns(&self, patterns: Arc<[WorkflowPattern]>) {
        if let Ok(mut current) = self.patterns.lock() {
            *current = Arc::clone(&patterns);
        }
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for state in map.values_mut() {
            state.workflows.set_patterns(Arc::clone(&patterns));
        }
    }

    /// Release one session's state (explicit session end).
    pub fn end_session(&self, session_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if map.remove(session_id).is_some() {
            debug!("released session state for {session_id}");
        }
    }

    /// Drop sessions idle past the timeout. Returns how many were evicted.
    pub fn evict_idle(&self, now_ms: i64) -> usize {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = map.len();
        map.retain(|_, state| now_ms - state.last_activity_ms <= self.idle_timeout_ms);
        let evicted = before - map.len();
        if evicted > 0 {
            debug!("evicted {evicted} idle sessions");
        }
        evicted
    }

    pub fn active_sessions(&self) -> usize {
        self.inner
            .lock()
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> Arc<[WorkflowPattern]> {
        vec![WorkflowPattern {
            pattern_id: "git-flow".into(),
            template_ids: vec!["t-add".into(), "t-commit".into(), "t-push".into()],
            display_names: vec!["git add".into(), "git commit".into(), "git push".into()],
            step_count: 3,
            occurrence_count: 5,
            avg_duration_ms: None,
        }]
        .into()
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            patterns(),
            CadenceConfig::default(),
            WorkflowConfig::default(),
            DEFAULT_SESSION_IDLE_MS,
        )
    }

    #[test]
    fn test_sessions_are_isolated() {
        let reg = registry();
        reg.on_command("a", "t-add", 1000);
        let b_candidates = reg.workflow_candidates("b");
        assert!(b_candidates.is_empty(), "session b sees nothing from a");
        assert_eq!(reg.workflow_candidates("a").len(), 1);
        assert_eq!(reg.active_sessions(), 1);
    }

    #[test]
    fn test_workflow_advances_per_session() {
        let reg = registry();
        reg.on_command("a", "t-add", 1000);
        let candidates = reg.on_command("a", "t-commit", 2000);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].next_template_id, "t-push");
    }

    #[test]
    fn test_keystrokes_drive_cadence() {
        let reg = registry();
        assert!(!reg.on_keystroke("a", 0).request_suggestion);
        assert!(!reg.on_keystroke("a", 50).request_suggestion);
        let outcome = reg.on_keystroke("a", 1200);
        assert!(outcome.request_suggestion);
        assert_eq!(outcome.hint.suggested_pause_threshold_ms, 150);
    }

    #[test]
    fn test_idle_eviction() {
        let reg = registry();
        reg.on_command("old", "t-add", 0);
        reg.on_command("new", "t-add", DEFAULT_SESSION_IDLE_MS);
        let evicted = reg.evict_idle(DEFAULT_SESSION_IDLE_MS + 1);
        assert_eq!(evicted, 1);
        assert_eq!(reg.active_sessions(), 1);
        assert!(reg.workflow_candidates("old").is_empty());
    }

    #[test]
    fn test_end_session_releases_state() {
        let reg = registry();
        reg.on_command("a", "t-add", 1000);
        reg.end_session("a");
        assert_eq!(reg.active_sessions(), 0);
    }

    #[test]
    fn test_set_patterns_applies_to_live_sessions() {
        let reg = registry();
        reg.on_command("a", "t-add", 1000);
        let swapped: Arc<[WorkflowPattern]> = vec![WorkflowPattern {
            pattern_id: "docker".into(),
            template_ids: vec!["t-build".into(), "t-run".into()],
            display_names: vec!["docker build".into(), "docker run".into()],
            step_count: 2,
            occurrence_count: 1,
            avg_duration_ms: None,
        }]
        .into();
        reg.set_patterns(swapped);

        // The old pattern is gone for the live session...
        let none = reg.on_command("a", "t-commit", 2000);
        assert!(none.is_empty());
        // ...and the new one activates in a fresh session.
        let candidates = reg.on_command("b", "t-build", 3000);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].next_template_id, "t-run");
    }
}
