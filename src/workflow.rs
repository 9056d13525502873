// Workflow tracker - multi-step pattern detection across batch boundaries
//
// Patterns ("git add -> git commit -> git push") are mined offline and
// loaded into an immutable arena; the tracker follows each session's
// progress through them and proposes the next step. Active instances hold
// arena indices plus a step cursor, never references back into the tracker,
// so the pattern set can be hot-swapped and nothing forms a cycle.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// A mined multi-step pattern. `step_count == template_ids.len() >= 2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPattern {
    pub pattern_id: String,
    /// Ordered template ids, one per step.
    pub template_ids: Vec<String>,
    /// Human-readable names parallel to `template_ids`.
    pub display_names: Vec<String>,
    pub step_count: usize,
    pub occurrence_count: u32,
    pub avg_duration_ms: Option<i64>,
}

impl WorkflowPattern {
    /// Human-readable "a -> b -> c" summary.
    pub fn summary(&self) -> String {
        self.display_names.join(" -> ")
    }
}

/// Tracker tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowConfig {
    /// Non-matching commands tolerated before an instance is dropped.
    pub stale_after: u32,
    /// Wall-clock budget between advances.
    pub activation_timeout_ms: i64,
    /// Cap on next-step candidates returned per command.
    pub max_candidates: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stale_after: 5,
            activation_timeout_ms: 600_000,
            max_candidates: 3,
        }
    }
}

/// Progress through one pattern. Holds an arena index, not a reference.
#[derive(Debug, Clone)]
struct ActiveWorkflow {
    pattern: usize,
    /// Index of the last matched step.
    current_step: usize,
    commands_since_advance: u32,
    activated_at_ms: i64,
    last_advanced_ms: i64,
}

/// A proposed next step, surfaced alongside ranker suggestions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextStepCandidate {
    pub pattern_id: String,
    pub next_template_id: String,
    pub display_name: String,
    /// Zero-based index of the proposed step.
    pub step_index: usize,
    pub total_steps: usize,
    pub summary: String,
}

/// Per-session workflow tracker.
#[derive(Debug)]
pub struct WorkflowTracker {
    patterns: Arc<[WorkflowPattern]>,
    active: Vec<ActiveWorkflow>,
    config: WorkflowConfig,
}

impl WorkflowTracker {
    pub fn new(patterns: Arc<[WorkflowPattern]>, config: WorkflowConfig) -> Self {
        Self {
            patterns,
            active: Vec::new(),
            config,
        }
    }

    /// Replace the pattern set after an offline mining pass. All active
    /// instances are dropped; their arena indices no longer mean anything.
    pub fn set_patterns(&mut self, patterns: Arc<[WorkflowPattern]>) {
        self.patterns = patterns;
        self.active.clear();
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Observe one executed command and return next-step candidates from
    /// the workflows still in flight.
    pub fn on_command(&mut self, template_id: &str, now_ms: i64) -> Vec<NextStepCandidate> {
        // 1. Advance or stale-count every active instance.
        for wf in &mut self.active {
            let pattern = &self.patterns[wf.pattern];
            let expected = pattern.template_ids.get(wf.current_step + 1);
            if expected.map(String::as_str) == Some(template_id) {
                wf.current_step += 1;
                wf.commands_since_advance = 0;
                wf.last_advanced_ms = now_ms;
            } else {
                wf.commands_since_advance += 1;
            }
        }

        // 2. Drop stale, timed-out and completed instances.
        let stale_after = self.config.stale_after;
        let timeout = self.config.activation_timeout_ms;
        let patterns = &self.patterns;
        self.active.retain(|wf| {
            let completed = wf.current_step + 1 >= patterns[wf.pattern].template_ids.len();
            wf.commands_since_advance < stale_after
                && now_ms - wf.last_advanced_ms <= timeout
                && !completed
        });

        // 3. Activate patterns whose first step matches this command.
        let already_active: HashSet<usize> = self.active.iter().map(|wf| wf.pattern).collect();
        for (idx, pattern) in self.patterns.iter().enumerate() {
            if already_active.contains(&idx) {
                continue;
            }
            if pattern.template_ids.first().map(String::as_str) == Some(template_id)
                && pattern.template_ids.len() >= 2
            {
                self.active.push(ActiveWorkflow {
                    pattern: idx,
                    current_step: 0,
                    commands_since_advance: 0,
                    activated_at_ms: now_ms,
                    last_advanced_ms: now_ms,
                });
            }
        }

        // 4. Collect candidates, deduplicated by next template id.
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for wf in &self.active {
            let pattern = &self.patterns[wf.pattern];
            let next_index = wf.current_step + 1;
            let Some(next_id) = pattern.template_ids.get(next_index) else {
                continue;
            };
            if !seen.insert(next_id.clone()) {
                continue;
            }
            candidates.push(NextStepCandidate {
                pattern_id: pattern.pattern_id.clone(),
                next_template_id: next_id.clone(),
                display_name: pattern
                    .display_names
                    .get(next_index)
                    .cloned()
                    .unwrap_or_else(|| next_id.clone()),
                step_index: next_index,
                total_steps: pattern.template_ids.len(),
                summary: pattern.summary(),
            });
            if candidates.len() >= self.config.max_candidates {
                break;
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(id: &str, steps: &[&str]) -> WorkflowPattern {
        WorkflowPattern {
            pattern_id: id.to_string(),
            template_ids: steps.iter().map(|s| s.to_string()).collect(),
            display_names: steps.iter().map(|s| format!("step {s}")).collect(),
            step_count: steps.len(),
            occurrence_count: 10,
            avg_duration_ms: Some(30_000),
        }
    }

    fn tracker(patterns: Vec<WorkflowPattern>) -> WorkflowTracker {
        WorkflowTracker::new(patterns.into(), WorkflowConfig::default())
    }

    #[test]
    fn test_activation_proposes_second_step() {
        let mut t = tracker(vec![pattern("deploy", &["a", "b", "c"])]);
        let candidates = t.on_command("a", 0);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].next_template_id, "b");
        assert_eq!(candidates[0].step_index, 1);
        assert_eq!(candidates[0].total_steps, 3);
        assert_eq!(t.active_count(), 1);
    }

    #[test]
    fn test_advance_through_pattern() {
        let mut t = tracker(vec![pattern("deploy", &["a", "b", "c"])]);
        t.on_command("a", 0);
        let candidates = t.on_command("b", 1000);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].next_template_id, "c");
        assert_eq!(candidates[0].step_index, 2);
    }

    #[test]
    fn test_completion_removes_instance() {
        let mut t = tracker(vec![pattern("deploy", &["a", "b"])]);
        t.on_command("a", 0);
        let candidates = t.on_command("b", 1000);
        assert!(candidates.is_empty(), "a completed workflow proposes nothing");
        assert_eq!(t.active_count(), 0);
    }

    #[test]
    fn test_stale_counter_evicts() {
        let mut t = tracker(vec![pattern("deploy", &["a", "b"])]);
        t.on_command("a", 0);
        for i in 0..4 {
            t.on_command("unrelated", 1000 + i);
            assert_eq!(t.active_count(), 1);
        }
        // Fifth miss reaches stale_after = 5.
        t.on_command("unrelated", 2000);
        assert_eq!(t.active_count(), 0);
    }

    #[test]
    fn test_activation_timeout_evicts() {
        let mut t = tracker(vec![pattern("deploy", &["a", "b"])]);
        t.on_command("a", 0);
        t.on_command("x", 700_000);
        assert_eq!(t.active_count(), 0);
    }

    #[test]
    fn test_candidates_deduplicated_by_next_template() {
        // Two patterns proposing the same next step yield one candidate.
        let mut t = tracker(vec![
            pattern("p1", &["a", "b", "c"]),
            pattern("p2", &["a", "b", "d"]),
        ]);
        let candidates = t.on_command("a", 0);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].next_template_id, "b");
    }

    #[test]
    fn test_candidate_cap() {
        let mut t = tracker(vec![
            pattern("p1", &["a", "b1"]),
            pattern("p2", &["a", "b2"]),
            pattern("p3", &["a", "b3"]),
            pattern("p4", &["a", "b4"]),
        ]);
        let candidates = t.on_command("a", 0);
        assert_eq!(candidates.len(), 3, "capped at max_candidates");
    }

    #[test]
    fn test_no_duplicate_activation() {
        let mut t = tracker(vec![pattern("loop", &["a", "a", "b"])]);
        t.on_command("a", 0);
        // Second "a" advances the existing instance rather than stacking a
        // second one.
        t.on_command("a", 100);
        assert_eq!(t.active_count(), 1);
        let candidates = t.on_command("b", 200);
        assert!(candidates.is_empty());
        assert_eq!(t.active_count(), 0);
    }

    #[test]
    fn test_set_patterns_clears_active() {
        let mut t = tracker(vec![pattern("deploy", &["a", "b"])]);
        t.on_command("a", 0);
        assert_eq!(t.active_count(), 1);
        t.set_patterns(vec![pattern("other", &["x", "y"])].into());
        assert_eq!(t.active_count(), 0);
        let candidates = t.on_command("x", 10);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].next_template_id, "y");
    }
}
