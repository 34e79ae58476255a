use crate::{
    core::{
        domain::{ExecutionLimits, ExecutionResult, RunOutcome, RunRequest, TestCase, is_identifier},
        value::Value,
    },
    protocol::models::{CaseResultMessage, RunRequestMessage, RunResponseMessage, TestCaseMessage},
};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },
    #[error("Invalid entry point: '{name}' is not an identifier")]
    InvalidEntryPoint { name: String },
}

impl TryFrom<RunRequestMessage> for RunRequest {
    type Error = ConversionError;

    fn try_from(req: RunRequestMessage) -> Result<Self, ConversionError> {
        if req.entry_point.is_empty() {
            return Err(ConversionError::MissingField {
                field: "entryPoint".to_string(),
            });
        }
        if !is_identifier(&req.entry_point) {
            return Err(ConversionError::InvalidEntryPoint {
                name: req.entry_point,
            });
        }
        if req.cases.is_empty() {
            return Err(ConversionError::MissingField {
                field: "cases".to_string(),
            });
        }

        let limits = req
            .timeout_ms
            .map(|time_ms| ExecutionLimits { time_ms })
            .unwrap_or_default();

        Ok(Self {
            source_text: req.source_text,
            entry_point: req.entry_point,
            cases: req.cases.into_iter().map(Into::into).collect(),
            limits,
            forbidden_calls: req.forbidden_calls.unwrap_or_default(),
        })
    }
}

impl From<TestCaseMessage> for TestCase {
    fn from(case: TestCaseMessage) -> Self {
        Self {
            input: case.input.into_iter().map(Value::from).collect(),
            expected: case.expected.into(),
        }
    }
}

impl From<ExecutionResult> for CaseResultMessage {
    fn from(result: ExecutionResult) -> Self {
        let (error, error_kind) = match result.error {
            Some(error) => (Some(error.message), Some(error.kind)),
            None => (None, None),
        };
        Self {
            passed: result.passed,
            input: result.input_display,
            expected: result.expected_display,
            actual: result.actual_display,
            error,
            error_kind,
            time_ms: result.elapsed_ms,
            console: (!result.console.is_empty()).then_some(result.console),
        }
    }
}

impl From<RunOutcome> for RunResponseMessage {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed(set) => Self::Completed {
                summary: set.summary.to_string(),
                passed: set.summary.passed,
                total: set.summary.total,
                results: set.results.into_iter().map(Into::into).collect(),
            },
            RunOutcome::Failed(failure) => Self::Failed {
                error: failure.message,
                kind: failure.kind,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::{CaseError, ErrorKind, ResultSet, RunFailure};
    use serde_json::json;

    fn request_message(value: serde_json::Value) -> RunRequestMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_request_conversion() {
        let message = request_message(json!({
            "sourceText": "function add(a, b) { return a + b; }",
            "entryPoint": "add",
            "cases": [{ "input": [1, 2], "expected": 3 }],
            "timeoutMs": 500
        }));

        let request: RunRequest = message.try_into().unwrap();
        assert_eq!(request.entry_point, "add");
        assert_eq!(request.limits.time_ms, 500);
        assert_eq!(request.cases[0].input, vec![Value::Number(1.0), Value::Number(2.0)]);
        assert_eq!(request.cases[0].expected, Value::Number(3.0));
        assert!(request.forbidden_calls.is_empty());
    }

    #[test]
    fn test_default_timeout() {
        let message = request_message(json!({
            "sourceText": "",
            "entryPoint": "f",
            "cases": [{ "input": [], "expected": null }],
            "forbiddenCalls": [".sort("]
        }));

        let request: RunRequest = message.try_into().unwrap();
        assert_eq!(request.limits.time_ms, 2000);
        assert_eq!(request.forbidden_calls, vec![".sort(".to_string()]);
    }

    #[test]
    fn test_invalid_requests() {
        let no_cases = request_message(json!({ "sourceText": "", "entryPoint": "f", "cases": [] }));
        assert!(matches!(
            RunRequest::try_from(no_cases),
            Err(ConversionError::MissingField { field }) if field == "cases"
        ));

        let empty_entry = request_message(json!({
            "sourceText": "",
            "entryPoint": "",
            "cases": [{ "input": [], "expected": 1 }]
        }));
        assert!(matches!(
            RunRequest::try_from(empty_entry),
            Err(ConversionError::MissingField { field }) if field == "entryPoint"
        ));

        let bad_entry = request_message(json!({
            "sourceText": "",
            "entryPoint": "1st",
            "cases": [{ "input": [], "expected": 1 }]
        }));
        assert!(matches!(
            RunRequest::try_from(bad_entry),
            Err(ConversionError::InvalidEntryPoint { .. })
        ));
    }

    #[test]
    fn test_completed_response_shape() {
        let set = ResultSet::new(vec![
            ExecutionResult {
                passed: true,
                input_display: "[1,2]".to_string(),
                expected_display: "3".to_string(),
                actual_display: "3".to_string(),
                error: None,
                elapsed_ms: 1,
                console: vec![],
            },
            ExecutionResult {
                passed: false,
                input_display: "[0,0]".to_string(),
                expected_display: "0".to_string(),
                actual_display: "Error".to_string(),
                error: Some(CaseError {
                    kind: ErrorKind::Timeout,
                    message: "Timeout after 2000 ms".to_string(),
                }),
                elapsed_ms: 2000,
                console: vec!["spinning".to_string()],
            },
        ]);

        let response: RunResponseMessage = RunOutcome::Completed(set).into();
        let value = serde_json::to_value(response).unwrap();

        assert_eq!(value["summary"], "1/2 tests passed");
        assert_eq!(value["passed"], 1);
        assert_eq!(value["total"], 2);
        assert_eq!(
            value["results"][0],
            json!({ "passed": true, "input": "[1,2]", "expected": "3", "actual": "3", "timeMs": 1 })
        );
        assert_eq!(value["results"][1]["errorKind"], "Timeout");
        assert_eq!(value["results"][1]["error"], "Timeout after 2000 ms");
        assert_eq!(value["results"][1]["console"], json!(["spinning"]));
    }

    #[test]
    fn test_failed_response_shape() {
        let response: RunResponseMessage = RunOutcome::Failed(RunFailure {
            kind: ErrorKind::ForbiddenApi,
            message: "Forbidden function used (.sort()). You must implement manually.".to_string(),
        })
        .into();

        assert_eq!(
            serde_json::to_value(response).unwrap(),
            json!({
                "error": "Forbidden function used (.sort()). You must implement manually.",
                "kind": "ForbiddenAPI"
            })
        );
    }
}
