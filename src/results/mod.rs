// Module: Results
// Immutable-after-write result records with aggregation.

use serde::Serialize;

use crate::errors::EngineError;
use crate::feature::{Scenario, Step};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

/// An attachment captured during a step (screenshot, payload dump).
#[derive(Clone, Debug, Serialize)]
pub struct Embed {
    pub mime_type: String,
    /// Base64-encoded payload.
    pub data: String,
}

/// Result of one executed step. The status is written exactly once by the
/// factory that builds the record; log and embeds stay append-only.
#[derive(Clone, Debug, Serialize)]
pub struct StepResult {
    pub step: Step,
    pub status: StepStatus,
    pub start_millis: i64,
    pub duration_nanos: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
    #[serde(skip)]
    pub call_results: Vec<FeatureResult>,
}

impl StepResult {
    pub fn passed(step: Step, start_millis: i64, duration_nanos: u64) -> Self {
        Self::build(step, StepStatus::Passed, start_millis, duration_nanos, None)
    }

    pub fn failed(
        step: Step,
        start_millis: i64,
        duration_nanos: u64,
        error: &EngineError,
    ) -> Self {
        Self::build(
            step,
            StepStatus::Failed,
            start_millis,
            duration_nanos,
            Some(error.to_string()),
        )
    }

    pub fn skipped(step: Step) -> Self {
        Self::build(step, StepStatus::Skipped, 0, 0, None)
    }

    fn build(
        step: Step,
        status: StepStatus,
        start_millis: i64,
        duration_nanos: u64,
        error: Option<String>,
    ) -> Self {
        Self {
            step,
            status,
            start_millis,
            duration_nanos,
            error,
            log: Vec::new(),
            embeds: Vec::new(),
            call_results: Vec::new(),
        }
    }

    pub fn append_log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    pub fn add_embed(&mut self, embed: Embed) {
        self.embeds.push(embed);
    }

    pub fn add_call_result(&mut self, result: FeatureResult) {
        self.call_results.push(result);
    }
}

/// Result of one scenario run. Status derives from the worst step status;
/// `apply_fail_tag` inverts pass/fail at most once and never touches Skipped.
#[derive(Clone, Debug)]
pub struct ScenarioResult {
    pub scenario: Scenario,
    pub thread_name: String,
    pub start_millis: i64,
    pub end_millis: i64,
    pub step_results: Vec<StepResult>,
    fail_applied: bool,
}

impl ScenarioResult {
    pub fn new(scenario: Scenario, thread_name: impl Into<String>) -> Self {
        Self {
            scenario,
            thread_name: thread_name.into(),
            start_millis: 0,
            end_millis: 0,
            step_results: Vec::new(),
            fail_applied: false,
        }
    }

    pub fn add_step_result(&mut self, result: StepResult) {
        self.step_results.push(result);
    }

    fn worst_step_status(&self) -> StepStatus {
        let mut worst = StepStatus::Skipped;
        for step in &self.step_results {
            match step.status {
                StepStatus::Failed => return StepStatus::Failed,
                StepStatus::Passed => worst = StepStatus::Passed,
                StepStatus::Skipped => {}
            }
        }
        worst
    }

    pub fn status(&self) -> StepStatus {
        let base = self.worst_step_status();
        if self.fail_applied && self.scenario.is_fail {
            match base {
                StepStatus::Passed => StepStatus::Failed,
                StepStatus::Failed => StepStatus::Passed,
                StepStatus::Skipped => StepStatus::Skipped,
            }
        } else {
            base
        }
    }

    /// Applies the `@fail` inversion. Safe to call more than once; the
    /// inversion takes effect exactly once.
    pub fn apply_fail_tag(&mut self) {
        self.fail_applied = true;
    }

    pub fn is_failed(&self) -> bool {
        self.status() == StepStatus::Failed
    }

    pub fn duration_millis(&self) -> i64 {
        self.end_millis.saturating_sub(self.start_millis)
    }

    /// The user-visible failure message: `<feature>:<line> <step text>` plus
    /// the cause on the next line.
    pub fn error_message(&self) -> Option<String> {
        let failed = self
            .step_results
            .iter()
            .find(|s| s.status == StepStatus::Failed)?;
        let cause = failed.error.clone().unwrap_or_default();
        Some(format!(
            "{}:{} {}\n{}",
            self.scenario.feature_path,
            failed.step.line,
            failed.step.display(),
            cause
        ))
    }
}

/// Ordered scenario results for one feature. Passes iff every scenario
/// passed (skipped scenarios do not fail a feature).
#[derive(Clone, Debug, Default)]
pub struct FeatureResult {
    pub feature_name: String,
    pub feature_path: String,
    pub scenario_results: Vec<ScenarioResult>,
}

impl FeatureResult {
    pub fn new(feature_name: impl Into<String>, feature_path: impl Into<String>) -> Self {
        Self {
            feature_name: feature_name.into(),
            feature_path: feature_path.into(),
            scenario_results: Vec::new(),
        }
    }

    pub fn add_result(&mut self, result: ScenarioResult) {
        self.scenario_results.push(result);
    }

    pub fn scenario_count(&self) -> usize {
        self.scenario_results.len()
    }

    pub fn passed_count(&self) -> usize {
        self.scenario_results
            .iter()
            .filter(|r| r.status() == StepStatus::Passed)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.scenario_results.iter().filter(|r| r.is_failed()).count()
    }

    pub fn is_failed(&self) -> bool {
        self.scenario_results.iter().any(|r| r.is_failed())
    }

    pub fn duration_millis(&self) -> i64 {
        self.scenario_results
            .iter()
            .map(ScenarioResult::duration_millis)
            .sum()
    }

    /// Message of the first failed scenario, used by `CallFailed` wrapping.
    pub fn first_error_message(&self) -> Option<String> {
        self.scenario_results
            .iter()
            .find_map(ScenarioResult::error_message)
    }
}

/// Aggregate of a whole run.
#[derive(Clone, Debug, Default)]
pub struct SuiteResult {
    pub feature_results: Vec<FeatureResult>,
    pub start_millis: i64,
    pub end_millis: i64,
    pub thread_count: usize,
}

impl SuiteResult {
    pub fn features_passed(&self) -> usize {
        self.feature_results.iter().filter(|f| !f.is_failed()).count()
    }

    pub fn features_failed(&self) -> usize {
        self.feature_results.iter().filter(|f| f.is_failed()).count()
    }

    pub fn scenarios_passed(&self) -> usize {
        self.feature_results.iter().map(FeatureResult::passed_count).sum()
    }

    pub fn scenarios_failed(&self) -> usize {
        self.feature_results.iter().map(FeatureResult::failed_count).sum()
    }

    pub fn is_failed(&self) -> bool {
        self.feature_results.iter().any(FeatureResult::is_failed)
    }

    pub fn duration_millis(&self) -> i64 {
        self.end_millis.saturating_sub(self.start_millis)
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_failed() {
            1
        } else {
            0
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
