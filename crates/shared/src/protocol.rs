use serde::{Deserialize, Serialize};

use crate::domain::{Perspective, SessionId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub session_id: SessionId,
}

/// Inbound frame on the per-session event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Status {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_name: Option<String>,
    },
    SummaryToken {
        token: String,
    },
    PartialResult {
        data: PartialResult,
    },
    FinalResult {
        data: FinalResult,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartialResult {
    /// Complete summary value, replacing any accumulated tokens.
    Summary { content: String },
    Perspective { perspective: Perspective },
    ClusterCount { count: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub topic: String,
    #[serde(default, rename = "overallSummary", alias = "summary")]
    pub overall_summary: String,
    #[serde(default)]
    pub perspectives: Vec<Perspective>,
}

impl StreamFrame {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamFrame::Status { .. } => "status",
            StreamFrame::SummaryToken { .. } => "summary_token",
            StreamFrame::PartialResult { .. } => "partial_result",
            StreamFrame::FinalResult { .. } => "final_result",
            StreamFrame::Error { .. } => "error",
            StreamFrame::EndOfStream => "end_of_stream",
        }
    }
}
