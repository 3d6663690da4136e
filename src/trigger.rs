//! External entry point: `{"command": "start"|"resume", "issueId": ...}`.
//!
//! A trigger drives one issue to its next blocking point or to completion.
//! [`run_many`] fans several triggers out onto their own tasks, one controller
//! per issue; issues share nothing but the store.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::errors::ControllerError;
use crate::issue::IssueId;
use crate::workflow::{PhaseController, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerCommand {
    Start,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub command: TriggerCommand,
    pub issue_id: IssueId,
    /// Title for `start`; defaults to the issue id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl TriggerRequest {
    pub fn start(issue_id: IssueId, title: Option<String>) -> Self {
        Self {
            command: TriggerCommand::Start,
            issue_id,
            title,
        }
    }

    pub fn resume(issue_id: IssueId) -> Self {
        Self {
            command: TriggerCommand::Resume,
            issue_id,
            title: None,
        }
    }

    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Drive one issue as requested.
pub async fn dispatch(
    controller: &PhaseController,
    request: &TriggerRequest,
) -> Result<RunOutcome, ControllerError> {
    info!(issue = %request.issue_id, command = ?request.command, "trigger received");
    match request.command {
        TriggerCommand::Start => {
            let title = request
                .title
                .clone()
                .unwrap_or_else(|| request.issue_id.to_string());
            controller.start(&request.issue_id, &title).await
        }
        TriggerCommand::Resume => controller.resume(&request.issue_id).await,
    }
}

/// Drive several issues concurrently, each with its own controller from
/// `factory`. Results come back in request order; a repeated issue id is
/// refused rather than driven twice.
pub async fn run_many<F>(
    factory: F,
    requests: Vec<TriggerRequest>,
) -> Vec<(IssueId, Result<RunOutcome, ControllerError>)>
where
    F: Fn() -> PhaseController,
{
    let mut seen = HashSet::new();
    let mut results: Vec<Option<(IssueId, Result<RunOutcome, ControllerError>)>> =
        (0..requests.len()).map(|_| None).collect();
    let mut tasks = JoinSet::new();

    for (index, request) in requests.into_iter().enumerate() {
        if !seen.insert(request.issue_id.clone()) {
            let id = request.issue_id.clone();
            results[index] = Some((id.clone(), Err(ControllerError::Busy(id))));
            continue;
        }
        let controller = factory();
        tasks.spawn(async move {
            let outcome = dispatch(&controller, &request).await;
            (index, request.issue_id, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, id, outcome)) => results[index] = Some((id, outcome)),
            Err(e) => error!(error = %e, "issue task panicked"),
        }
    }

    results.into_iter().flatten().collect()
}
