//! Test assertions for stage outputs and run records.

use crate::core::{RunStatus, StageOutput, StageState};
use crate::pipeline::RunRecord;

/// Asserts that an output is successful.
///
/// # Panics
///
/// Panics if the output is not successful.
pub fn assert_output_succeeded(output: &StageOutput) {
    assert!(
        output.is_success(),
        "Expected success, got {} (error: {:?})",
        output.status,
        output.error
    );
}

/// Asserts that an output failed.
///
/// # Panics
///
/// Panics if the output did not fail.
pub fn assert_output_failed(output: &StageOutput) {
    assert!(output.is_failure(), "Expected failure, got {}", output.status);
}

/// Asserts that an output holds a specific value.
///
/// # Panics
///
/// Panics if the key is missing or holds a different value.
pub fn assert_output_value(output: &StageOutput, key: &str, expected: &serde_json::Value) {
    let actual = output
        .get(key)
        .unwrap_or_else(|| panic!("Expected key '{key}' in output data"));
    assert_eq!(actual, expected, "Value mismatch for key '{key}'");
}

/// Asserts the final status of a run.
///
/// # Panics
///
/// Panics if the status differs.
pub fn assert_run_status(record: &RunRecord, expected: RunStatus) {
    assert_eq!(
        record.status(),
        expected,
        "Unexpected run status (error: {:?})",
        record.error().map(ToString::to_string)
    );
}

/// Asserts the final state of a stage.
///
/// # Panics
///
/// Panics if the stage is unknown or in a different state.
pub fn assert_stage_state(record: &RunRecord, stage: &str, expected: StageState) {
    let actual = record
        .state_of(stage)
        .unwrap_or_else(|| panic!("No stage named '{stage}' in the run record"));
    assert_eq!(actual, expected, "Unexpected state for stage '{stage}'");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_assertions() {
        let ok = StageOutput::ok_value("x", json!(1));
        assert_output_succeeded(&ok);
        assert_output_value(&ok, "x", &json!(1));
        assert_output_failed(&StageOutput::fail("nope"));
    }

    #[test]
    #[should_panic(expected = "Expected failure")]
    fn test_assert_failed_panics_on_success() {
        assert_output_failed(&StageOutput::ok_empty());
    }
}
