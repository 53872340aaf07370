//! Queue payloads exchanged with the web layer

use serde::{Deserialize, Serialize};

use crate::runner::{ExecutionOutcome, ExecutionRequest};

/// Job received from the execution queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteJob {
    pub job_id: String,
    pub code: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Snippet the code came from, echoed back untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_id: Option<i64>,
}

impl ExecuteJob {
    pub fn to_request(&self) -> ExecutionRequest {
        let request = ExecutionRequest::new(self.code.clone(), self.language.clone());
        match &self.stdin {
            Some(stdin) => request.with_stdin(stdin.clone()),
            None => request,
        }
    }
}

/// Result stored and published for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_id: Option<i64>,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
}

impl ExecuteResult {
    pub fn new(job: &ExecuteJob, outcome: ExecutionOutcome) -> Self {
        Self {
            job_id: job.job_id.clone(),
            snippet_id: job.snippet_id,
            outcome,
        }
    }
}
