//! The phase transition table and Phase Record log replay.
//!
//! Everything here is pure: given the phase that just finished, its verdict and
//! how many implement/verify iterations have been consumed, compute where the
//! issue goes next. The controller uses [`next_step`] to decide what to do and
//! `mender replay` uses [`replay`] to audit a persisted log.

use serde::Serialize;

use crate::errors::TransitionError;
use crate::issue::{IssueStatus, Phase, RecordDocument, Resolution, Verdict, WorkflowContext};

/// Where a finished phase leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Target {
    Phase(Phase),
    Terminal(Resolution),
}

/// The next blocking point for an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Invoke the worker for `phase`; `attempt` is the idempotency key.
    Invoke { phase: Phase, attempt: u32 },
    /// Run the archival transaction for a terminal outcome.
    Archive(Resolution),
    /// The issue is already archived.
    Done(Resolution),
}

/// Verdicts a worker may legitimately return for each phase.
pub fn is_valid_verdict(phase: Phase, verdict: Verdict) -> bool {
    matches!(
        (phase, verdict),
        (_, Verdict::Escalate)
            | (Phase::Research, Verdict::Continue)
            | (Phase::Validate, Verdict::Continue)
            | (Phase::Validate, Verdict::Reject)
            | (Phase::Propose, Verdict::Continue)
            | (Phase::Review, Verdict::Continue)
            | (Phase::Implement, Verdict::Continue)
            | (Phase::Verify, Verdict::Continue)
            | (Phase::Verify, Verdict::TerminalSuccess)
            | (Phase::Verify, Verdict::Retry)
            | (Phase::Finalize, Verdict::Continue)
            | (Phase::Finalize, Verdict::TerminalSuccess)
    )
}

/// Apply the transition table.
///
/// `implement_attempts` is the Retry Counter: IMPLEMENT attempts consumed so far.
pub fn transition(
    phase: Phase,
    verdict: Verdict,
    implement_attempts: u32,
    max_retries: u32,
) -> Result<Target, TransitionError> {
    if !is_valid_verdict(phase, verdict) {
        return Err(TransitionError::InvalidVerdict { phase, verdict });
    }

    let target = match (phase, verdict) {
        (_, Verdict::Escalate) => Target::Terminal(Resolution::Escalated),
        (Phase::Research, _) => Target::Phase(Phase::Validate),
        (Phase::Validate, Verdict::Reject) => Target::Terminal(Resolution::Rejected),
        (Phase::Validate, _) => Target::Phase(Phase::Propose),
        (Phase::Propose, _) => Target::Phase(Phase::Review),
        (Phase::Review, _) => Target::Phase(Phase::Implement),
        (Phase::Implement, _) => Target::Phase(Phase::Verify),
        (Phase::Verify, Verdict::Retry) if implement_attempts < max_retries => {
            Target::Phase(Phase::Implement)
        }
        (Phase::Verify, Verdict::Retry) => Target::Terminal(Resolution::Escalated),
        (Phase::Verify, _) => Target::Phase(Phase::Finalize),
        (Phase::Finalize, _) => Target::Terminal(Resolution::Resolved),
    };
    Ok(target)
}

/// One record of a replayed log and the transition it caused.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayedTransition {
    pub sequence: u32,
    pub phase: Phase,
    pub attempt: u32,
    pub verdict: Verdict,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    pub transitions: Vec<ReplayedTransition>,
    pub next: NextStep,
}

/// Walk a Phase Record log from the initial state, checking that every record
/// is exactly the step the table prescribes. Returns the next step after the
/// last record.
pub fn replay(records: &[RecordDocument], max_retries: u32) -> Result<ReplayReport, TransitionError> {
    let mut next = NextStep::Invoke {
        phase: Phase::Research,
        attempt: 1,
    };
    let mut implement_attempts = 0;
    let mut transitions = Vec::with_capacity(records.len());

    for (index, doc) in records.iter().enumerate() {
        let record = &doc.record;
        let expected_sequence = index as u32 + 1;

        let (phase, attempt) = match next {
            NextStep::Invoke { phase, attempt } => (phase, attempt),
            NextStep::Archive(_) | NextStep::Done(_) => {
                return Err(TransitionError::TerminalState {
                    sequence: record.sequence,
                });
            }
        };
        if record.phase != phase || record.attempt != attempt || record.sequence != expected_sequence
        {
            return Err(TransitionError::UnexpectedRecord {
                sequence: record.sequence,
                phase: record.phase,
                attempt: record.attempt,
                expected: format!("#{} {} attempt {}", expected_sequence, phase, attempt),
            });
        }

        if record.phase == Phase::Implement {
            implement_attempts += 1;
        }
        let target = transition(record.phase, record.verdict, implement_attempts, max_retries)?;
        transitions.push(ReplayedTransition {
            sequence: record.sequence,
            phase: record.phase,
            attempt: record.attempt,
            verdict: record.verdict,
            target,
        });

        next = match target {
            Target::Phase(phase) => NextStep::Invoke {
                phase,
                attempt: attempts_in(&records[..=index], phase) + 1,
            },
            Target::Terminal(resolution) => NextStep::Archive(resolution),
        };
    }

    Ok(ReplayReport { transitions, next })
}

/// The next step for a live issue: archived issues are done, everything else
/// follows from its log.
pub fn next_step(ctx: &WorkflowContext, max_retries: u32) -> Result<NextStep, TransitionError> {
    if ctx.issue.status.is_terminal() {
        let resolution = ctx.issue.resolution.unwrap_or(match ctx.issue.status {
            IssueStatus::Resolved => Resolution::Resolved,
            IssueStatus::Rejected => Resolution::Rejected,
            _ => Resolution::Escalated,
        });
        return Ok(NextStep::Done(resolution));
    }
    Ok(replay(&ctx.records, max_retries)?.next)
}

fn attempts_in(records: &[RecordDocument], phase: Phase) -> u32 {
    records.iter().filter(|d| d.record.phase == phase).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{Artifact, ArtifactKind, Issue, IssueId, NewRecord};
    use serde_json::json;

    fn log(steps: &[(Phase, Verdict)]) -> Vec<RecordDocument> {
        let issue = IssueId::parse("fix-timeout-bug").unwrap();
        let mut attempts = std::collections::HashMap::new();
        steps
            .iter()
            .enumerate()
            .map(|(i, (phase, verdict))| {
                let attempt = attempts.entry(*phase).or_insert(0u32);
                *attempt += 1;
                let artifact = Artifact::new(
                    &issue,
                    *phase,
                    *attempt,
                    ArtifactKind::PhaseOutput,
                    "out",
                    json!({}),
                );
                NewRecord::new(*phase, *attempt, *verdict, artifact).into_document(i as u32 + 1)
            })
            .collect()
    }

    #[test]
    fn test_happy_path_table() {
        use Phase::*;
        assert_eq!(transition(Research, Verdict::Continue, 0, 3), Ok(Target::Phase(Validate)));
        assert_eq!(transition(Validate, Verdict::Continue, 0, 3), Ok(Target::Phase(Propose)));
        assert_eq!(transition(Propose, Verdict::Continue, 0, 3), Ok(Target::Phase(Review)));
        assert_eq!(transition(Review, Verdict::Continue, 0, 3), Ok(Target::Phase(Implement)));
        assert_eq!(transition(Implement, Verdict::Continue, 1, 3), Ok(Target::Phase(Verify)));
        assert_eq!(transition(Verify, Verdict::TerminalSuccess, 1, 3), Ok(Target::Phase(Finalize)));
        assert_eq!(transition(Verify, Verdict::Continue, 1, 3), Ok(Target::Phase(Finalize)));
        assert_eq!(
            transition(Finalize, Verdict::Continue, 1, 3),
            Ok(Target::Terminal(Resolution::Resolved))
        );
    }

    #[test]
    fn test_validate_reject_shortcut() {
        assert_eq!(
            transition(Phase::Validate, Verdict::Reject, 0, 3),
            Ok(Target::Terminal(Resolution::Rejected))
        );
    }

    #[test]
    fn test_verify_retry_respects_budget() {
        assert_eq!(
            transition(Phase::Verify, Verdict::Retry, 2, 3),
            Ok(Target::Phase(Phase::Implement))
        );
        assert_eq!(
            transition(Phase::Verify, Verdict::Retry, 3, 3),
            Ok(Target::Terminal(Resolution::Escalated))
        );
    }

    #[test]
    fn test_escalate_from_any_phase() {
        for phase in Phase::ALL {
            assert_eq!(
                transition(phase, Verdict::Escalate, 0, 3),
                Ok(Target::Terminal(Resolution::Escalated))
            );
        }
    }

    #[test]
    fn test_invalid_verdicts_rejected() {
        assert!(matches!(
            transition(Phase::Research, Verdict::Reject, 0, 3),
            Err(TransitionError::InvalidVerdict { .. })
        ));
        assert!(transition(Phase::Implement, Verdict::Retry, 1, 3).is_err());
        assert!(transition(Phase::Review, Verdict::TerminalSuccess, 0, 3).is_err());
        assert!(!is_valid_verdict(Phase::Propose, Verdict::Reject));
    }

    #[test]
    fn test_replay_scenario_a() {
        use Phase::*;
        let records = log(&[
            (Research, Verdict::Continue),
            (Validate, Verdict::Continue),
            (Propose, Verdict::Continue),
            (Review, Verdict::Continue),
            (Implement, Verdict::Continue),
            (Verify, Verdict::Retry),
            (Implement, Verdict::Continue),
            (Verify, Verdict::TerminalSuccess),
            (Finalize, Verdict::Continue),
        ]);
        let report = replay(&records, 3).unwrap();
        assert_eq!(report.transitions.len(), 9);
        assert_eq!(report.transitions[5].target, Target::Phase(Implement));
        assert_eq!(report.next, NextStep::Archive(Resolution::Resolved));
    }

    #[test]
    fn test_replay_partial_log_gives_next_attempt() {
        use Phase::*;
        let records = log(&[
            (Research, Verdict::Continue),
            (Validate, Verdict::Continue),
            (Propose, Verdict::Continue),
            (Review, Verdict::Continue),
            (Implement, Verdict::Continue),
            (Verify, Verdict::Retry),
        ]);
        let report = replay(&records, 3).unwrap();
        assert_eq!(
            report.next,
            NextStep::Invoke {
                phase: Implement,
                attempt: 2
            }
        );
    }

    #[test]
    fn test_replay_empty_log_starts_at_research() {
        let report = replay(&[], 3).unwrap();
        assert_eq!(
            report.next,
            NextStep::Invoke {
                phase: Phase::Research,
                attempt: 1
            }
        );
    }

    #[test]
    fn test_replay_detects_skipped_phase() {
        use Phase::*;
        let records = log(&[(Research, Verdict::Continue), (Propose, Verdict::Continue)]);
        assert!(matches!(
            replay(&records, 3),
            Err(TransitionError::UnexpectedRecord { sequence: 2, .. })
        ));
    }

    #[test]
    fn test_replay_detects_records_after_rejection() {
        use Phase::*;
        let mut records = log(&[(Research, Verdict::Continue), (Validate, Verdict::Reject)]);
        records.extend(log(&[(Propose, Verdict::Continue)]).into_iter().map(|mut d| {
            d.record.sequence = 3;
            d
        }));
        assert!(matches!(
            replay(&records, 3),
            Err(TransitionError::TerminalState { sequence: 3 })
        ));
    }

    #[test]
    fn test_replay_detects_fourth_implement() {
        use Phase::*;
        let records = log(&[
            (Research, Verdict::Continue),
            (Validate, Verdict::Continue),
            (Propose, Verdict::Continue),
            (Review, Verdict::Continue),
            (Implement, Verdict::Continue),
            (Verify, Verdict::Retry),
            (Implement, Verdict::Continue),
            (Verify, Verdict::Retry),
            (Implement, Verdict::Continue),
            (Verify, Verdict::Retry),
            (Implement, Verdict::Continue),
        ]);
        assert!(matches!(
            replay(&records, 3),
            Err(TransitionError::TerminalState { sequence: 11 })
        ));
    }

    #[test]
    fn test_next_step_for_archived_issue() {
        let issue_id = IssueId::parse("done").unwrap();
        let mut issue = Issue::new(issue_id, "t");
        issue.status = IssueStatus::Rejected;
        issue.resolution = Some(Resolution::Rejected);
        let ctx = WorkflowContext {
            issue,
            records: Vec::new(),
        };
        assert_eq!(next_step(&ctx, 3), Ok(NextStep::Done(Resolution::Rejected)));
    }
}
