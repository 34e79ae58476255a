use serde::{Deserialize, Serialize};

use crate::core::domain::ErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequestMessage {
    pub source_text: String,
    pub entry_point: String,
    pub cases: Vec<TestCaseMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forbidden_calls: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseMessage {
    pub input: Vec<serde_json::Value>,
    pub expected: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResultMessage {
    pub passed: bool,
    pub input: String,
    pub expected: String,
    pub actual: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console: Option<Vec<String>>,
}

/// Either every case was attempted, or the run failed before any case ran.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RunResponseMessage {
    Completed {
        results: Vec<CaseResultMessage>,
        summary: String,
        passed: usize,
        total: usize,
    },
    Failed {
        error: String,
        kind: ErrorKind,
    },
}
