//! Retry/escalation bookkeeping for the implement/verify loop.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::json;

use crate::errors::RetryBudgetExhausted;
use crate::issue::{Artifact, ArtifactKind, IssueId, Phase, WorkflowContext};

/// Owns the per-issue Retry Counter.
///
/// The counter is the number of IMPLEMENT attempts consumed. It is rehydrated
/// from the Phase Record log whenever a controller picks an issue up, so the
/// in-memory map is only ever a cache of what the store already says.
#[derive(Debug)]
pub struct RetryManager {
    max: u32,
    counters: Mutex<HashMap<IssueId, u32>>,
}

impl RetryManager {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn count(&self, issue: &IssueId) -> u32 {
        self.counters().get(issue).copied().unwrap_or(0)
    }

    /// Whether another IMPLEMENT attempt fits in the budget.
    pub fn should_retry(&self, issue: &IssueId) -> bool {
        self.count(issue) < self.max
    }

    /// Consume one iteration. Fails instead of ever exceeding the maximum.
    pub fn record_attempt(&self, issue: &IssueId) -> Result<u32, RetryBudgetExhausted> {
        let mut counters = self.counters();
        let count = counters.entry(issue.clone()).or_insert(0);
        if *count >= self.max {
            return Err(RetryBudgetExhausted {
                issue: issue.clone(),
                max: self.max,
            });
        }
        *count += 1;
        Ok(*count)
    }

    /// Set the counter from the persisted log.
    pub fn restore(&self, ctx: &WorkflowContext) -> u32 {
        let count = ctx.attempts(Phase::Implement).min(self.max);
        self.counters().insert(ctx.issue_id().clone(), count);
        count
    }

    pub fn forget(&self, issue: &IssueId) {
        self.counters().remove(issue);
    }

    /// Synthesize the escalation notice that replaces a VERIFY artifact when a
    /// RETRY verdict arrives with the budget spent. `summary` and `body` are the
    /// worker's own output for the attempt being overridden.
    pub fn escalation_notice(
        &self,
        ctx: &WorkflowContext,
        attempt: u32,
        summary: &str,
        body: serde_json::Value,
    ) -> Artifact {
        let mut summaries = ctx.recent_verify_summaries(self.max.saturating_sub(1) as usize);
        summaries.push(summary.to_string());

        let first = (attempt as usize + 1).saturating_sub(summaries.len());
        let text = summaries
            .iter()
            .enumerate()
            .map(|(i, s)| format!("VERIFY {}: {}", first + i, s))
            .collect::<Vec<_>>()
            .join("\n");

        Artifact::new(
            ctx.issue_id(),
            Phase::Verify,
            attempt,
            ArtifactKind::EscalationNotice,
            format!(
                "Escalated after {} implement/verify iterations\n{}",
                self.max, text
            ),
            json!({
                "reason": "retry_budget_exhausted",
                "max_retries": self.max,
                "verify_summaries": summaries,
                "verify_output": body,
            }),
        )
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, HashMap<IssueId, u32>> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }
}
