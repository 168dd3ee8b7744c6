//! Artifact verification at stage boundaries.
//!
//! A transition (from → to) carries a contract: a required-field set plus
//! stage-specific rules over the producing stage's artifact. Rules are
//! data-driven per stage rather than baked into executor subclasses, so the
//! same checks run whether the controller validates a transition or an
//! executor validates its own output.

use serde_json::Value;

use crate::stage::{ArtifactBody, Stage};

/// Outcome of validating an artifact. A non-empty `errors` list means the
/// artifact cannot cross the transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl VerificationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.errors.push(message.into());
        self
    }

    pub fn warning(mut self, message: impl Into<String>) -> Self {
        self.warnings.push(message.into());
        self
    }

    pub fn merge(&mut self, other: VerificationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Compact single-line rendering for audit records and context.
    pub fn summary(&self) -> String {
        if self.valid() && self.warnings.is_empty() {
            "valid".to_string()
        } else if self.valid() {
            format!("valid with {} warning(s)", self.warnings.len())
        } else {
            format!(
                "invalid: {} ({} warning(s))",
                self.errors.join("; "),
                self.warnings.len()
            )
        }
    }
}

/// Required-field set for one named transition.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContract {
    pub from: Stage,
    pub to: Stage,
    pub required_fields: &'static [&'static str],
}

/// The named transition contracts. A (from, to) pair not listed here has
/// no field contract; stage rules still apply.
pub const CONTRACTS: &[TransitionContract] = &[
    TransitionContract {
        from: Stage::Intake,
        to: Stage::Clarify,
        required_fields: &["detected_scope", "priority"],
    },
    TransitionContract {
        from: Stage::Intake,
        to: Stage::Analyze,
        required_fields: &["detected_scope", "priority"],
    },
    TransitionContract {
        from: Stage::Clarify,
        to: Stage::Analyze,
        required_fields: &["clarified_requirements", "ready_for_analysis"],
    },
    TransitionContract {
        from: Stage::Analyze,
        to: Stage::Spec,
        required_fields: &["analysis"],
    },
    TransitionContract {
        from: Stage::Spec,
        to: Stage::Red,
        required_fields: &["components"],
    },
    TransitionContract {
        from: Stage::Red,
        to: Stage::Green,
        required_fields: &["test_files", "test_results"],
    },
    TransitionContract {
        from: Stage::Green,
        to: Stage::Refactor,
        required_fields: &["implementation_files", "all_tests_pass"],
    },
    TransitionContract {
        from: Stage::Refactor,
        to: Stage::Deliver,
        required_fields: &["tests_pass"],
    },
];

pub fn contract_for(from: Stage, to: Stage) -> Option<&'static TransitionContract> {
    CONTRACTS.iter().find(|c| c.from == from && c.to == to)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactValidator;

impl ArtifactValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate the artifact produced by `from` for the transition into
    /// `to`: field contract first, then the producing stage's rules.
    pub fn validate_transition(
        &self,
        from: Stage,
        to: Stage,
        artifact: &ArtifactBody,
    ) -> VerificationResult {
        let mut result = VerificationResult::ok();

        if let Some(contract) = contract_for(from, to) {
            for field in contract.required_fields {
                if !artifact.contains_key(*field) {
                    result
                        .errors
                        .push(format!("{from}->{to}: missing required field '{field}'"));
                }
            }
        }

        // Skipping clarify is only allowed when nothing blocks analysis.
        if from == Stage::Intake && to == Stage::Analyze && has_blocking_questions(artifact) {
            result.errors.push(
                "intake->analyze: blocking clarifying questions present; clarify cannot be skipped"
                    .to_string(),
            );
        }

        result.merge(self.validate_stage_output(from, artifact));
        result
    }

    /// Stage-specific invariants over a stage's own output artifact.
    pub fn validate_stage_output(&self, stage: Stage, artifact: &ArtifactBody) -> VerificationResult {
        match stage {
            Stage::Intake => validate_intake(artifact),
            Stage::Clarify => validate_clarify(artifact),
            Stage::Analyze => validate_analyze(artifact),
            Stage::Spec => validate_spec(artifact),
            Stage::Red => validate_red(artifact),
            Stage::Green => validate_green(artifact),
            Stage::Refactor => validate_refactor(artifact),
            Stage::Deliver => validate_deliver(artifact),
        }
    }
}

const VALID_SCOPES: &[&str] = &[
    "bug_fix",
    "feature_addition",
    "refactoring",
    "documentation",
    "testing",
    "unclear",
];

const VALID_PRIORITIES: &[&str] = &["low", "medium", "high", "critical"];

const VALID_DELIVERABLES: &[&str] = &["commit", "pr", "files", "patch"];

fn str_field<'a>(artifact: &'a ArtifactBody, key: &str) -> Option<&'a str> {
    artifact.get(key).and_then(Value::as_str)
}

fn array_field<'a>(artifact: &'a ArtifactBody, key: &str) -> Option<&'a Vec<Value>> {
    artifact.get(key).and_then(Value::as_array)
}

fn array_is_empty(artifact: &ArtifactBody, key: &str) -> bool {
    array_field(artifact, key).is_none_or(|a| a.is_empty())
}

/// A question entry counts as blocking when it is an object with
/// `blocking: true`.
fn has_blocking_questions(artifact: &ArtifactBody) -> bool {
    for key in ["clarifying_questions", "remaining_questions"] {
        if let Some(questions) = array_field(artifact, key)
            && questions
                .iter()
                .any(|q| q.get("blocking").and_then(Value::as_bool) == Some(true))
        {
            return true;
        }
    }
    false
}

fn validate_intake(artifact: &ArtifactBody) -> VerificationResult {
    let mut result = VerificationResult::ok();

    match str_field(artifact, "detected_scope") {
        Some(scope) if VALID_SCOPES.contains(&scope) => {
            if scope == "unclear" && array_is_empty(artifact, "clarifying_questions") {
                result.warnings.push(
                    "intake: scope is unclear but no clarifying questions were produced"
                        .to_string(),
                );
            }
        }
        Some(scope) => {
            result
                .errors
                .push(format!("intake: invalid detected_scope '{scope}'"));
        }
        None => {
            result
                .errors
                .push("intake: detected_scope is missing or not a string".to_string());
        }
    }

    if let Some(priority) = str_field(artifact, "priority")
        && !VALID_PRIORITIES.contains(&priority)
    {
        // Executors substitute the default priority; the validator only flags it.
        result
            .warnings
            .push(format!("intake: invalid priority '{priority}', treating as medium"));
    }

    result
}

fn validate_clarify(artifact: &ArtifactBody) -> VerificationResult {
    let mut result = VerificationResult::ok();

    if array_is_empty(artifact, "clarified_requirements") {
        result
            .errors
            .push("clarify: clarified_requirements must be non-empty".to_string());
    }

    let ready = artifact
        .get("ready_for_analysis")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if ready && has_blocking_questions(artifact) {
        result.warnings.push(
            "clarify: ready_for_analysis is true while blocking questions remain".to_string(),
        );
    }

    result
}

fn validate_analyze(artifact: &ArtifactBody) -> VerificationResult {
    let mut result = VerificationResult::ok();

    if !artifact.contains_key("analysis") {
        result.errors.push("analyze: analysis block is missing".to_string());
    }
    if array_is_empty(artifact, "affected_files") {
        result
            .warnings
            .push("analyze: affected_files list is empty".to_string());
    }
    if array_is_empty(artifact, "components") {
        result
            .warnings
            .push("analyze: components list is empty".to_string());
    }

    result
}

fn validate_spec(artifact: &ArtifactBody) -> VerificationResult {
    let mut result = VerificationResult::ok();

    let Some(components) = array_field(artifact, "components") else {
        return result.error("spec: components list is missing");
    };
    if components.is_empty() {
        return result.error("spec: at least one component is required");
    }

    for (i, component) in components.iter().enumerate() {
        if component.get("name").and_then(Value::as_str).is_none() {
            result
                .errors
                .push(format!("spec: component {i} has no name"));
        }
        if component.get("file").and_then(Value::as_str).is_none() {
            result
                .warnings
                .push(format!("spec: component {i} has no file path"));
        }
    }

    if array_is_empty(artifact, "test_cases") {
        result
            .warnings
            .push("spec: no test cases declared".to_string());
    }

    result
}

fn test_counts(artifact: &ArtifactBody) -> (u64, u64) {
    let results = artifact.get("test_results");
    let passed = results
        .and_then(|r| r.get("passed"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let failed = results
        .and_then(|r| r.get("failed"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    (passed, failed)
}

fn validate_red(artifact: &ArtifactBody) -> VerificationResult {
    let mut result = VerificationResult::ok();

    if array_is_empty(artifact, "test_files") {
        result
            .errors
            .push("red: at least one test file must be produced".to_string());
    }

    let (passed, failed) = test_counts(artifact);
    if failed == 0 && passed > 0 {
        result.warnings.push(
            "red: all recorded tests pass; implementation may already exist".to_string(),
        );
    } else if failed == 0 {
        result
            .errors
            .push("red: test results record no failing tests".to_string());
    }

    result
}

fn validate_green(artifact: &ArtifactBody) -> VerificationResult {
    let mut result = VerificationResult::ok();

    if array_is_empty(artifact, "implementation_files") {
        result
            .errors
            .push("green: at least one implementation file is required".to_string());
    }

    let all_pass = artifact
        .get("all_tests_pass")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let (_, failed) = test_counts(artifact);
    if all_pass && failed > 0 {
        result.errors.push(format!(
            "green: all_tests_pass is true but {failed} test(s) are failing"
        ));
    }

    result
}

fn validate_refactor(artifact: &ArtifactBody) -> VerificationResult {
    let tests_pass = artifact
        .get("tests_pass")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if tests_pass {
        VerificationResult::ok()
    } else {
        VerificationResult::ok()
            .error("refactor: tests must still pass after refactoring".to_string())
    }
}

fn validate_deliver(artifact: &ArtifactBody) -> VerificationResult {
    match str_field(artifact, "deliverable_type") {
        Some(kind) if VALID_DELIVERABLES.contains(&kind) => VerificationResult::ok(),
        Some(kind) => VerificationResult::ok()
            .error(format!("deliver: invalid deliverable_type '{kind}'")),
        None => VerificationResult::ok().error("deliver: deliverable_type is missing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> ArtifactBody {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_every_adjacent_default_transition_has_a_contract() {
        let sequence = [
            Stage::Intake,
            Stage::Clarify,
            Stage::Analyze,
            Stage::Spec,
            Stage::Red,
            Stage::Green,
            Stage::Refactor,
            Stage::Deliver,
        ];
        for pair in sequence.windows(2) {
            assert!(
                contract_for(pair[0], pair[1]).is_some(),
                "no contract for {}->{}",
                pair[0],
                pair[1]
            );
        }
        // The clarify-skipping shortcut is also named.
        assert!(contract_for(Stage::Intake, Stage::Analyze).is_some());
    }

    #[test]
    fn test_missing_required_field_is_an_error() {
        let validator = ArtifactValidator::new();
        let artifact = body(json!({"detected_scope": "bug_fix"}));
        let result = validator.validate_transition(Stage::Intake, Stage::Clarify, &artifact);
        assert!(!result.valid());
        assert!(result.errors.iter().any(|e| e.contains("priority")));
    }

    #[test]
    fn test_valid_intake_passes() {
        let validator = ArtifactValidator::new();
        let artifact = body(json!({
            "detected_scope": "feature_addition",
            "priority": "high",
        }));
        let result = validator.validate_transition(Stage::Intake, Stage::Clarify, &artifact);
        assert!(result.valid(), "errors: {:?}", result.errors);
    }

    #[test]
    fn test_intake_invalid_scope_is_error_invalid_priority_is_warning() {
        let validator = ArtifactValidator::new();
        let bad_scope = body(json!({"detected_scope": "world_domination", "priority": "high"}));
        assert!(!validator.validate_stage_output(Stage::Intake, &bad_scope).valid());

        let bad_priority = body(json!({"detected_scope": "bug_fix", "priority": "urgent"}));
        let result = validator.validate_stage_output(Stage::Intake, &bad_priority);
        assert!(result.valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_intake_unclear_without_questions_warns() {
        let validator = ArtifactValidator::new();
        let artifact = body(json!({"detected_scope": "unclear", "priority": "low"}));
        let result = validator.validate_stage_output(Stage::Intake, &artifact);
        assert!(result.valid());
        assert!(result.warnings.iter().any(|w| w.contains("clarifying")));
    }

    #[test]
    fn test_intake_to_analyze_blocked_by_blocking_questions() {
        let validator = ArtifactValidator::new();
        let artifact = body(json!({
            "detected_scope": "feature_addition",
            "priority": "medium",
            "clarifying_questions": [
                {"question": "Which OAuth flows?", "blocking": true}
            ],
        }));
        let result = validator.validate_transition(Stage::Intake, Stage::Analyze, &artifact);
        assert!(!result.valid());
        assert!(result.errors.iter().any(|e| e.contains("blocking")));
    }

    #[test]
    fn test_clarify_requires_nonempty_requirements() {
        let validator = ArtifactValidator::new();
        let artifact = body(json!({
            "clarified_requirements": [],
            "ready_for_analysis": true,
        }));
        let result = validator.validate_transition(Stage::Clarify, Stage::Analyze, &artifact);
        assert!(!result.valid());
    }

    #[test]
    fn test_clarify_ready_with_blocking_question_warns() {
        let validator = ArtifactValidator::new();
        let artifact = body(json!({
            "clarified_requirements": ["use authorization code flow"],
            "ready_for_analysis": true,
            "remaining_questions": [{"question": "refresh tokens?", "blocking": true}],
        }));
        let result = validator.validate_stage_output(Stage::Clarify, &artifact);
        assert!(result.valid());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn test_analyze_empty_lists_warn() {
        let validator = ArtifactValidator::new();
        let artifact = body(json!({
            "analysis": {"summary": "touches auth"},
            "affected_files": [],
            "components": [],
        }));
        let result = validator.validate_stage_output(Stage::Analyze, &artifact);
        assert!(result.valid());
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn test_spec_component_rules() {
        let validator = ArtifactValidator::new();
        let artifact = body(json!({
            "components": [
                {"name": "TokenService", "file": "src/token.rs"},
                {"file": "src/other.rs"},
                {"name": "Middleware"},
            ],
        }));
        let result = validator.validate_stage_output(Stage::Spec, &artifact);
        assert_eq!(result.errors.len(), 1, "one unnamed component");
        // One component without a file, plus no test cases.
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn test_spec_no_components_is_error() {
        let validator = ArtifactValidator::new();
        let result =
            validator.validate_stage_output(Stage::Spec, &body(json!({"components": []})));
        assert!(!result.valid());
    }

    #[test]
    fn test_red_requires_failing_tests() {
        let validator = ArtifactValidator::new();
        let failing = body(json!({
            "test_files": ["tests/token.rs"],
            "test_results": {"passed": 0, "failed": 3},
        }));
        assert!(validator.validate_stage_output(Stage::Red, &failing).valid());

        let all_green = body(json!({
            "test_files": ["tests/token.rs"],
            "test_results": {"passed": 3, "failed": 0},
        }));
        let result = validator.validate_stage_output(Stage::Red, &all_green);
        assert!(result.valid());
        assert!(result.warnings.iter().any(|w| w.contains("already exist")));

        let no_tests_ran = body(json!({
            "test_files": ["tests/token.rs"],
            "test_results": {"passed": 0, "failed": 0},
        }));
        assert!(!validator.validate_stage_output(Stage::Red, &no_tests_ran).valid());
    }

    #[test]
    fn test_green_contradiction_is_error() {
        let validator = ArtifactValidator::new();
        let artifact = body(json!({
            "implementation_files": ["src/token.rs"],
            "all_tests_pass": true,
            "test_results": {"passed": 5, "failed": 2},
        }));
        let result = validator.validate_stage_output(Stage::Green, &artifact);
        assert!(!result.valid());
    }

    #[test]
    fn test_refactor_must_keep_tests_passing() {
        let validator = ArtifactValidator::new();
        assert!(
            !validator
                .validate_stage_output(Stage::Refactor, &body(json!({"tests_pass": false})))
                .valid()
        );
        assert!(
            validator
                .validate_stage_output(Stage::Refactor, &body(json!({"tests_pass": true})))
                .valid()
        );
    }

    #[test]
    fn test_deliver_type_enum() {
        let validator = ArtifactValidator::new();
        for kind in ["commit", "pr", "files", "patch"] {
            assert!(
                validator
                    .validate_stage_output(Stage::Deliver, &body(json!({"deliverable_type": kind})))
                    .valid()
            );
        }
        assert!(
            !validator
                .validate_stage_output(
                    Stage::Deliver,
                    &body(json!({"deliverable_type": "carrier_pigeon"}))
                )
                .valid()
        );
    }

    #[test]
    fn test_summary_rendering() {
        assert_eq!(VerificationResult::ok().summary(), "valid");
        let warn = VerificationResult::ok().warning("w");
        assert_eq!(warn.summary(), "valid with 1 warning(s)");
        let bad = VerificationResult::ok().error("boom");
        assert!(bad.summary().starts_with("invalid"));
    }
}
