use serde::{Deserialize, Serialize};

use super::Fingerprint;
use crate::{PipelineError, PipelineResult};

/// Upper bound on requests carried by one batch job
pub const MAX_BATCH_REQUESTS: usize = 100;

/// Job payload, discriminated by job class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_class", rename_all = "snake_case")]
pub enum JobPayload {
    DocumentGeneration(DocumentGeneration),
    FactLearning(FactLearning),
    RejectionAnalysis(RejectionAnalysis),
    BatchApiCall(BatchApiCall),
}

/// Generate a document (resume, cover letter, report) from structured inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentGeneration {
    pub document_kind: String,
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub inputs: serde_json::Value,
}

/// Extract durable facts about a user from free text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactLearning {
    pub user_id: String,
    pub source_text: String,
}

/// Analyse a rejection message for an application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionAnalysis {
    pub application_id: String,
    pub rejection_text: String,
}

/// Fan a set of requests out to an upstream API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchApiCall {
    pub endpoint: String,
    pub requests: Vec<serde_json::Value>,
}

impl JobPayload {
    /// Stable job class name, also the serde tag
    pub fn job_class(&self) -> &'static str {
        match self {
            Self::DocumentGeneration(_) => "document_generation",
            Self::FactLearning(_) => "fact_learning",
            Self::RejectionAnalysis(_) => "rejection_analysis",
            Self::BatchApiCall(_) => "batch_api_call",
        }
    }

    /// Reject submissions that can never succeed
    pub fn validate(&self) -> PipelineResult<()> {
        match self {
            Self::DocumentGeneration(p) => {
                require("document_kind", &p.document_kind)?;
                require("subject_id", &p.subject_id)
            }
            Self::FactLearning(p) => {
                require("user_id", &p.user_id)?;
                require("source_text", &p.source_text)
            }
            Self::RejectionAnalysis(p) => {
                require("application_id", &p.application_id)?;
                require("rejection_text", &p.rejection_text)
            }
            Self::BatchApiCall(p) => {
                require("endpoint", &p.endpoint)?;
                if p.requests.is_empty() {
                    return Err(PipelineError::validation("requests must not be empty"));
                }
                if p.requests.len() > MAX_BATCH_REQUESTS {
                    return Err(PipelineError::validation(format!(
                        "batch holds {} requests (max: {})",
                        p.requests.len(),
                        MAX_BATCH_REQUESTS
                    )));
                }
                Ok(())
            }
        }
    }

    /// Deterministic request fingerprint
    pub fn fingerprint(&self) -> PipelineResult<Fingerprint> {
        let canonical = serde_json::to_value(self)?;
        Ok(Fingerprint::compute(self.job_class(), &canonical))
    }
}

fn require(field: &str, value: &str) -> PipelineResult<()> {
    if value.trim().is_empty() {
        Err(PipelineError::validation(format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}
