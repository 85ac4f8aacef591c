use crate::parse;
use crate::spec::TestSpecification;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Closed taxonomy of diagnosed failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before execution; never produced by the pattern table
    SyntaxInvalid,
    DependencyMissing,
    AssertionFailed,
    AttributeMismatch,
    TypeMismatch,
    ValueInvalid,
    KeyMissing,
    RecordNotFound,
    ValidationFailed,
    TemplateSyntaxInvalid,
    DatabaseFailure,
    /// Synthesized when the attempt deadline expired
    Timeout,
    /// Synthesized when the sandbox could not be used
    SandboxUnavailable,
    Unclassified,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::SyntaxInvalid => "syntax_invalid",
            ErrorKind::DependencyMissing => "dependency_missing",
            ErrorKind::AssertionFailed => "assertion_failed",
            ErrorKind::AttributeMismatch => "attribute_mismatch",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::ValueInvalid => "value_invalid",
            ErrorKind::KeyMissing => "key_missing",
            ErrorKind::RecordNotFound => "record_not_found",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::TemplateSyntaxInvalid => "template_syntax_invalid",
            ErrorKind::DatabaseFailure => "database_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SandboxUnavailable => "sandbox_unavailable",
            ErrorKind::Unclassified => "unclassified",
        };
        write!(f, "{}", name)
    }
}

/// Where in the test source a failure most likely originates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
}

/// Structured diagnosis of one failed attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<SourceLocation>,
    pub suggested_fix: Option<String>,
    /// How much to trust the diagnosis, in [0, 1]
    pub confidence: f32,
}

impl ErrorAnalysis {
    /// Synthesized diagnosis for a pre-execution validation rejection
    pub fn syntax_invalid(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::SyntaxInvalid,
            message: message.into(),
            location: None,
            suggested_fix: Some("Regenerate the test; the source does not parse.".to_string()),
            confidence: 1.0,
        }
    }

    /// Synthesized diagnosis for an attempt that hit its deadline
    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: format!("Test timed out after {}s", limit.as_secs()),
            location: None,
            suggested_fix: Some(
                "Raise the timeout or remove blocking calls from the test.".to_string(),
            ),
            confidence: 1.0,
        }
    }

    /// Synthesized diagnosis for a run that lost its sandbox
    pub fn sandbox_unavailable(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::SandboxUnavailable,
            message: reason.into(),
            location: None,
            suggested_fix: Some(
                "Install or start Podman/Docker, or disable sandboxed execution.".to_string(),
            ),
            confidence: 1.0,
        }
    }
}

const MAX_MESSAGE_LEN: usize = 500;
const SIMILARITY_CUTOFF: f64 = 0.6;
const MAX_SUGGESTIONS: usize = 3;

/// Maps raw failure text to a structured diagnosis.
///
/// The pattern table is evaluated in a fixed priority order; the first
/// matching entry wins, so classification is deterministic for any input.
pub struct TestErrorAnalyzer {
    patterns: Vec<(ErrorKind, Regex)>,
    module_name: Regex,
    attribute: Regex,
    quoted_field: Regex,
}

impl TestErrorAnalyzer {
    pub fn new() -> Self {
        let table = [
            (
                ErrorKind::DependencyMissing,
                r"(?:ImportError|ModuleNotFoundError): (.+)",
            ),
            (
                ErrorKind::DependencyMissing,
                r"Cannot find module '([^']+)'",
            ),
            (ErrorKind::AssertionFailed, r"AssertionError: (.+)"),
            (ErrorKind::AttributeMismatch, r"AttributeError: (.+)"),
            (ErrorKind::TypeMismatch, r"TypeError: (.+)"),
            (ErrorKind::ValueInvalid, r"ValueError: (.+)"),
            (ErrorKind::KeyMissing, r"KeyError: (.+)"),
            (ErrorKind::RecordNotFound, r"DoesNotExist: (.+)"),
            (ErrorKind::ValidationFailed, r"ValidationError: (.+)"),
            (
                ErrorKind::TemplateSyntaxInvalid,
                r"TemplateSyntaxError: (.+)",
            ),
            (
                ErrorKind::DatabaseFailure,
                r"(?:IntegrityError|DatabaseError|OperationalError): (.+)",
            ),
        ];

        // All patterns are fixed at compile time; a failure to build one
        // is a programming error.
        let patterns = table
            .into_iter()
            .map(|(kind, pattern)| (kind, Regex::new(pattern).unwrap()))
            .collect();

        Self {
            patterns,
            module_name: Regex::new(r#"No module named ['"]([^'"]+)['"]"#).unwrap(),
            attribute: Regex::new(r"'(\w+)' object has no attribute '(\w+)'").unwrap(),
            quoted_field: Regex::new(r"'([^']+)'").unwrap(),
        }
    }

    /// Classify the failure text of one executed attempt
    pub fn classify(&self, spec: &TestSpecification, failure_text: &str) -> ErrorAnalysis {
        for (kind, pattern) in &self.patterns {
            if let Some(captures) = pattern.captures(failure_text) {
                let detail = captures
                    .get(captures.len() - 1)
                    .map(|m| m.as_str().trim())
                    .unwrap_or_default();
                return match kind {
                    ErrorKind::DependencyMissing => self.handle_dependency(spec, detail),
                    ErrorKind::AssertionFailed => self.handle_assertion(spec, detail),
                    ErrorKind::AttributeMismatch => self.handle_attribute(spec, detail),
                    ErrorKind::ValidationFailed => self.handle_validation(detail),
                    other => self.handle_matched(*other, detail),
                };
            }
        }

        self.fallback(failure_text)
    }

    fn handle_dependency(&self, spec: &TestSpecification, detail: &str) -> ErrorAnalysis {
        let module = self
            .module_name
            .captures(detail)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .or_else(|| {
                // The node pattern captures the module name directly.
                (!detail.contains(' ')).then(|| detail.to_string())
            });

        let Some(module) = module else {
            return self.handle_matched(ErrorKind::DependencyMissing, detail);
        };

        let declared = parse::imported_modules(&spec.source, spec.ecosystem);
        let root = module.split('.').next().unwrap_or(&module).to_string();
        let suggested_fix = if declared.contains(&root) {
            format!(
                "'{}' is imported by the test but not importable in the project. \
                 Add it to the application configuration (e.g. INSTALLED_APPS) or \
                 the module search path.",
                module
            )
        } else {
            format!("Add '{}' to the dependency manifest or install it.", module)
        };

        ErrorAnalysis {
            kind: ErrorKind::DependencyMissing,
            message: format!("Missing module: {}", module),
            location: None,
            suggested_fix: Some(suggested_fix),
            confidence: 0.9,
        }
    }

    fn handle_assertion(&self, spec: &TestSpecification, detail: &str) -> ErrorAnalysis {
        let assertion = parse::first_assertion(&spec.source, spec.ecosystem);

        ErrorAnalysis {
            kind: ErrorKind::AssertionFailed,
            message: format!("Assertion failed: {}", truncate(detail)),
            location: assertion.as_ref().map(|(line, _)| SourceLocation {
                file: "test".to_string(),
                line: *line,
            }),
            suggested_fix: assertion
                .map(|(line, text)| format!("Review the assertion on line {}: {}", line, text)),
            confidence: 0.8,
        }
    }

    fn handle_attribute(&self, spec: &TestSpecification, detail: &str) -> ErrorAnalysis {
        let Some(captures) = self.attribute.captures(detail) else {
            return self.handle_matched(ErrorKind::AttributeMismatch, detail);
        };
        let object_type = &captures[1];
        let attribute = &captures[2];

        let vocabulary = parse::attribute_references(&spec.source, spec.ecosystem);
        let similar = close_matches(attribute, &vocabulary, MAX_SUGGESTIONS, SIMILARITY_CUTOFF);

        let mut suggestion = format!(
            "Check if '{}' is the correct attribute name for {}",
            attribute, object_type
        );
        if !similar.is_empty() {
            suggestion.push_str(&format!(". Did you mean: {}?", similar.join(", ")));
        }

        ErrorAnalysis {
            kind: ErrorKind::AttributeMismatch,
            message: truncate(detail),
            location: None,
            suggested_fix: Some(suggestion),
            confidence: 0.85,
        }
    }

    fn handle_validation(&self, detail: &str) -> ErrorAnalysis {
        let required = detail.contains("cannot be blank")
            || detail.contains("This field is required");
        let field = required
            .then(|| {
                self.quoted_field
                    .captures(detail)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            })
            .flatten();

        match field {
            Some(field) => ErrorAnalysis {
                kind: ErrorKind::ValidationFailed,
                message: truncate(detail),
                location: None,
                suggested_fix: Some(format!(
                    "The field '{}' is required but was not provided. \
                     Include it in the test data.",
                    field
                )),
                confidence: 0.9,
            },
            None => ErrorAnalysis {
                kind: ErrorKind::ValidationFailed,
                message: truncate(detail),
                location: None,
                suggested_fix: Some(
                    "Review the validation constraints and make the test data meet them."
                        .to_string(),
                ),
                confidence: 0.8,
            },
        }
    }

    /// Pattern-matched kinds without a specialized handler
    fn handle_matched(&self, kind: ErrorKind, detail: &str) -> ErrorAnalysis {
        let hint = match kind {
            ErrorKind::TypeMismatch => "Check argument and return types at the failure site.",
            ErrorKind::ValueInvalid => "Check the values the test passes at the failure site.",
            ErrorKind::KeyMissing => "Verify the key exists before indexing.",
            ErrorKind::RecordNotFound => {
                "Create the record in test setup or adjust the lookup."
            }
            ErrorKind::TemplateSyntaxInvalid => "Check template tags and syntax.",
            ErrorKind::DatabaseFailure => {
                "Check the test database configuration and migrations."
            }
            ErrorKind::DependencyMissing => "Install the missing dependency.",
            ErrorKind::AttributeMismatch => "Check the attribute name against the object type.",
            _ => "Review the error message and check the relevant code paths.",
        };

        ErrorAnalysis {
            kind,
            message: truncate(detail),
            location: None,
            suggested_fix: Some(hint.to_string()),
            confidence: 0.75,
        }
    }

    /// No pattern matched: surface the last top-level line of the failure
    fn fallback(&self, failure_text: &str) -> ErrorAnalysis {
        let message = failure_text
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with("    "))
            .next_back()
            .unwrap_or("Unknown error");

        ErrorAnalysis {
            kind: ErrorKind::Unclassified,
            message: truncate(message),
            location: None,
            suggested_fix: Some(
                "Review the error message and check the relevant code paths.".to_string(),
            ),
            confidence: 0.5,
        }
    }
}

impl Default for TestErrorAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_MESSAGE_LEN {
        return text.to_string();
    }
    let mut end = MAX_MESSAGE_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.iter().enumerate() {
        let mut previous = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous + usize::from(ca != cb);
            previous = row[j + 1];
            row[j + 1] = substitution.min(previous + 1).min(row[j] + 1);
        }
    }

    row[b.len()]
}

/// Normalized edit-distance similarity in [0, 1]
fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

/// The up-to-`n` vocabulary entries most similar to `target`, above the
/// cutoff, best first. Ties keep vocabulary order, so the result is
/// deterministic.
fn close_matches(target: &str, vocabulary: &[String], n: usize, cutoff: f64) -> Vec<String> {
    let mut scored: Vec<(f64, usize, &String)> = vocabulary
        .iter()
        .enumerate()
        .map(|(i, word)| (similarity(target, word), i, word))
        .filter(|(score, _, _)| *score >= cutoff)
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));
    scored.into_iter().take(n).map(|(_, _, w)| w.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Ecosystem;

    fn spec_with(source: &str) -> TestSpecification {
        TestSpecification::new("sample", source, Ecosystem::Django)
    }

    #[test]
    fn test_dependency_missing_classification() {
        let analyzer = TestErrorAnalyzer::new();
        let spec = spec_with("def test_x():\n    assert True\n");
        let analysis = analyzer.classify(
            &spec,
            "ModuleNotFoundError: No module named 'widgetkit'",
        );

        assert_eq!(analysis.kind, ErrorKind::DependencyMissing);
        assert!(analysis.message.contains("widgetkit"));
        assert!(analysis.suggested_fix.as_ref().unwrap().contains("widgetkit"));
        assert_eq!(analysis.confidence, 0.9);
    }

    #[test]
    fn test_dependency_declared_in_test_gets_configuration_hint() {
        let analyzer = TestErrorAnalyzer::new();
        let spec = spec_with("import widgetkit\n\ndef test_x():\n    assert True\n");
        let analysis = analyzer.classify(
            &spec,
            "ModuleNotFoundError: No module named 'widgetkit'",
        );

        assert_eq!(analysis.kind, ErrorKind::DependencyMissing);
        let fix = analysis.suggested_fix.unwrap();
        assert!(fix.contains("configuration"));
        assert!(!fix.contains("install it"));
    }

    #[test]
    fn test_node_dependency_missing() {
        let analyzer = TestErrorAnalyzer::new();
        let spec = TestSpecification::new("js", "test('x', () => {});", Ecosystem::Node);
        let analysis = analyzer.classify(&spec, "Error: Cannot find module 'supertest'");

        assert_eq!(analysis.kind, ErrorKind::DependencyMissing);
        assert!(analysis.message.contains("supertest"));
    }

    #[test]
    fn test_assertion_failed_points_at_first_assertion() {
        let analyzer = TestErrorAnalyzer::new();
        let spec = spec_with(
            "def test_status():\n    response = client.get('/')\n    assert response.status_code == 200\n",
        );
        let analysis = analyzer.classify(&spec, "AssertionError: expected 200 got 404");

        assert_eq!(analysis.kind, ErrorKind::AssertionFailed);
        let location = analysis.location.unwrap();
        assert_eq!(location.line, 3);
        assert!(analysis
            .suggested_fix
            .unwrap()
            .contains("assert response.status_code == 200"));
        assert_eq!(analysis.confidence, 0.8);
    }

    #[test]
    fn test_attribute_mismatch_suggests_close_names() {
        let analyzer = TestErrorAnalyzer::new();
        let spec = spec_with(
            "def test_user():\n    user = User()\n    assert user.username == 'a'\n    assert user.email\n",
        );
        let analysis = analyzer.classify(
            &spec,
            "AttributeError: 'User' object has no attribute 'usernme'",
        );

        assert_eq!(analysis.kind, ErrorKind::AttributeMismatch);
        assert_eq!(analysis.confidence, 0.85);
        let fix = analysis.suggested_fix.unwrap();
        assert!(fix.contains("Did you mean"));
        assert!(fix.contains("username"));
    }

    #[test]
    fn test_validation_failed_names_required_field() {
        let analyzer = TestErrorAnalyzer::new();
        let spec = spec_with("def test_x():\n    assert True\n");
        let analysis = analyzer.classify(
            &spec,
            "ValidationError: {'title': ['This field cannot be blank.']}",
        );

        assert_eq!(analysis.kind, ErrorKind::ValidationFailed);
        assert_eq!(analysis.confidence, 0.9);
        assert!(analysis.suggested_fix.unwrap().contains("'title'"));
    }

    #[test]
    fn test_matched_kind_without_specialized_handler() {
        let analyzer = TestErrorAnalyzer::new();
        let spec = spec_with("def test_x():\n    assert True\n");
        let analysis = analyzer.classify(&spec, "KeyError: 'user_id'");

        assert_eq!(analysis.kind, ErrorKind::KeyMissing);
        assert_eq!(analysis.confidence, 0.75);
    }

    #[test]
    fn test_priority_order_dependency_before_assertion() {
        let analyzer = TestErrorAnalyzer::new();
        let spec = spec_with("def test_x():\n    assert True\n");
        // Both patterns appear; the table order decides.
        let analysis = analyzer.classify(
            &spec,
            "ImportError: No module named 'widgetkit'\nAssertionError: boom",
        );
        assert_eq!(analysis.kind, ErrorKind::DependencyMissing);
    }

    #[test]
    fn test_fallback_takes_last_top_level_line() {
        let analyzer = TestErrorAnalyzer::new();
        let spec = spec_with("def test_x():\n    assert True\n");
        let failure = "process started\n    indented traceback detail\nsegfault in worker\n";
        let analysis = analyzer.classify(&spec, failure);

        assert_eq!(analysis.kind, ErrorKind::Unclassified);
        assert_eq!(analysis.message, "segfault in worker");
        assert_eq!(analysis.confidence, 0.5);
    }

    #[test]
    fn test_fallback_truncates_long_lines() {
        let analyzer = TestErrorAnalyzer::new();
        let spec = spec_with("def test_x():\n    assert True\n");
        let failure = "x".repeat(2000);
        let analysis = analyzer.classify(&spec, &failure);

        assert_eq!(analysis.message.len(), 500);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let analyzer = TestErrorAnalyzer::new();
        let spec = spec_with("def test_x():\n    assert True\n");
        let failure = "AttributeError: 'User' object has no attribute 'usernme'";

        let first = analyzer.classify(&spec, failure);
        let second = analyzer.classify(&spec, failure);
        assert_eq!(first.kind, second.kind);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.message, second.message);
        assert_eq!(first.suggested_fix, second.suggested_fix);
    }

    #[test]
    fn test_close_matches_ranking() {
        let vocabulary = vec![
            "username".to_string(),
            "email".to_string(),
            "usernames".to_string(),
            "first_name".to_string(),
        ];
        let matches = close_matches("usernme", &vocabulary, 3, 0.6);
        assert_eq!(matches[0], "username");
        assert!(matches.contains(&"usernames".to_string()));
        assert!(!matches.contains(&"email".to_string()));
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("same", "same"), 1.0);
        assert_eq!(similarity("", ""), 1.0);
        assert!(similarity("abc", "xyz") < 0.01);
    }

    #[test]
    fn test_synthesized_analyses() {
        let timeout = ErrorAnalysis::timeout(Duration::from_secs(30));
        assert_eq!(timeout.kind, ErrorKind::Timeout);
        assert!(timeout.message.contains("30"));

        let sandbox = ErrorAnalysis::sandbox_unavailable("daemon not running");
        assert_eq!(sandbox.kind, ErrorKind::SandboxUnavailable);

        let syntax = ErrorAnalysis::syntax_invalid("Syntax error at line 2");
        assert_eq!(syntax.kind, ErrorKind::SyntaxInvalid);
        assert_eq!(syntax.confidence, 1.0);
    }
}
