//! Syntax verification for proposed files
//!
//! Two passes run over every recognized source file and their diagnostics
//! are merged:
//! - a structural pass that parses with the language grammar (tree-sitter)
//!   and, for Python, scans for dangerous constructs
//! - a raw-text pass (trailing whitespace, mixed indentation, bracket
//!   balance) that keeps working when structural parsing is unavailable
//!
//! Only error-severity diagnostics block. The verifier never fails; it
//! always returns a [`VerificationReport`].

mod heuristics;
mod indent;
mod parser;

use serde::Serialize;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Language {
    Rust,
    JavaScript,
    TypeScript,
    Python,
    Go,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "rs" => Language::Rust,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "py" | "pyi" => Language::Python,
            "go" => Language::Go,
            _ => Language::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Language::from_extension)
            .unwrap_or(Language::Unknown)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Language::Rust => "Rust",
            Language::JavaScript => "JavaScript",
            Language::TypeScript => "TypeScript",
            Language::Python => "Python",
            Language::Go => "Go",
            Language::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// Category tag carried by a blocking parse diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParseErrorCategory {
    Syntax,
    Indentation,
    MixedWhitespace,
}

impl ParseErrorCategory {
    pub fn tag(&self) -> &'static str {
        match self {
            ParseErrorCategory::Syntax => "SyntaxError",
            ParseErrorCategory::Indentation => "IndentationError",
            ParseErrorCategory::MixedWhitespace => "TabError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// 1-based line
    pub line: usize,
    /// 1-based column
    pub column: usize,
    pub message: String,
    pub severity: Severity,
}

impl Diagnostic {
    pub fn error(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
            severity: Severity::Warning,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            line: 0,
            column: 0,
            message: message.into(),
            severity: Severity::Info,
        }
    }

    pub(crate) fn parse_error(
        line: usize,
        column: usize,
        category: ParseErrorCategory,
        message: &str,
    ) -> Self {
        Self::error(line, column, format!("{}: {}", category.tag(), message))
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "[{}] {}", self.severity.label(), self.message)
        } else {
            write!(
                f,
                "[{}] line {}, col {}: {}",
                self.severity.label(),
                self.line,
                self.column,
                self.message
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub language: Language,
    pub diagnostics: Vec<Diagnostic>,
}

impl VerificationReport {
    fn from_diagnostics(language: Language, mut diagnostics: Vec<Diagnostic>) -> Self {
        diagnostics.sort_by_key(|d| (d.line, d.column));
        let passed = !diagnostics.iter().any(|d| d.severity == Severity::Error);
        Self {
            passed,
            language,
            diagnostics,
        }
    }

    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }

    /// Human-readable block: counts, bullets, and a next step on failure.
    pub fn render(&self) -> String {
        let mut out = if self.passed {
            format!(
                "Verification passed: {} warning(s)",
                self.warning_count()
            )
        } else {
            format!(
                "Verification failed: {} error(s), {} warning(s)",
                self.error_count(),
                self.warning_count()
            )
        };
        for diagnostic in &self.diagnostics {
            out.push_str("\n• ");
            out.push_str(&diagnostic.to_string());
        }
        if let Some(first) = self.errors().next() {
            out.push_str(&format!(
                "\nFix the error on line {} and re-submit.",
                first.line
            ));
        }
        out
    }
}

/// Static safety and validity gate over a proposed file's full content.
#[derive(Debug, Clone, Default)]
pub struct SyntaxVerifier;

impl SyntaxVerifier {
    pub fn new() -> Self {
        Self
    }

    pub fn verify(&self, content: &str, filename: &str) -> VerificationReport {
        let language = Language::from_path(Path::new(filename));
        if language == Language::Unknown {
            return VerificationReport::from_diagnostics(
                language,
                vec![Diagnostic::info(format!(
                    "No verifier for '{}'; syntax check skipped",
                    filename
                ))],
            );
        }

        let mut diagnostics = Vec::new();

        match parser::parse(content, language, Path::new(filename)) {
            Ok(tree) => {
                let indentation = if language == Language::Python {
                    indent::check_python_indentation(content)
                } else {
                    None
                };
                let structural = parser::first_syntax_error(&tree, content);
                // One blocking diagnostic from this pass. Grammar recovery
                // often lands on the same line as an indentation fault, so
                // indentation wins unless the grammar failed on an earlier line.
                let chosen = match (indentation, structural) {
                    (Some(a), Some(b)) if b.line < a.line => Some(b),
                    (Some(a), _) => Some(a),
                    (None, b) => b,
                };
                diagnostics.extend(chosen);

                if language == Language::Python {
                    diagnostics.extend(parser::scan_python_dangerous(&tree, content));
                }
            }
            Err(err) => {
                tracing::warn!(file = filename, "structural parse unavailable: {}", err);
                diagnostics.push(Diagnostic::warning(
                    0,
                    0,
                    format!("Structural parse unavailable ({}); heuristic checks only", err),
                ));
            }
        }

        diagnostics.extend(heuristics::check(content, language));

        let report = VerificationReport::from_diagnostics(language, diagnostics);
        if report.passed {
            tracing::debug!(
                file = filename,
                warnings = report.warning_count(),
                "verification passed"
            );
        } else {
            tracing::warn!(
                file = filename,
                errors = report.error_count(),
                "verification failed"
            );
        }
        report
    }

    /// Verify a file on disk; an unreadable file is a failed report.
    pub fn verify_file(&self, path: &Path) -> VerificationReport {
        match std::fs::read_to_string(path) {
            Ok(content) => self.verify(&content, &path.to_string_lossy()),
            Err(err) => VerificationReport::from_diagnostics(
                Language::from_path(path),
                vec![Diagnostic::error(
                    0,
                    0,
                    format!("Failed to read {}: {}", path.display(), err),
                )],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify(content: &str, name: &str) -> VerificationReport {
        SyntaxVerifier::new().verify(content, name)
    }

    #[test]
    fn test_python_syntax_error_blocks_on_line_one() {
        let report = verify("def f(:\n", "src/a.py");
        assert!(!report.passed);
        assert!(report.errors().any(|d| d.line == 1));
    }

    #[test]
    fn test_valid_python_passes_cleanly() {
        let report = verify("def f():\n    return 1\n", "src/a.py");
        assert!(report.passed, "{}", report.render());
        assert_eq!(report.error_count(), 0);
    }

    #[test]
    fn test_parse_pass_yields_single_tagged_error() {
        let report = verify("x = (1 +\ny = 2\n", "src/a.py");
        assert!(!report.passed);
        let tagged: Vec<_> = report
            .errors()
            .filter(|d| {
                d.message.starts_with("SyntaxError")
                    || d.message.starts_with("IndentationError")
                    || d.message.starts_with("TabError")
            })
            .collect();
        assert_eq!(tagged.len(), 1);
    }

    #[test]
    fn test_unexpected_indent_is_indentation_error() {
        let report = verify("x = 1\n    y = 2\n", "src/a.py");
        assert!(!report.passed);
        let first = report.errors().next().unwrap();
        assert_eq!(first.line, 2);
        assert!(first.message.starts_with("IndentationError"), "{}", first.message);
    }

    #[test]
    fn test_inconsistent_tabs_is_tab_error() {
        let content = "if True:\n        x = 1\n\ty = 2\n";
        let report = verify(content, "src/a.py");
        assert!(!report.passed);
        assert!(report
            .errors()
            .any(|d| d.line == 3 && d.message.starts_with("TabError")));
    }

    #[test]
    fn test_dangerous_calls_warn_but_do_not_block() {
        let content = "import subprocess\n\nx = eval('1 + 1')\n";
        let report = verify(content, "src/a.py");
        assert!(report.passed, "{}", report.render());
        let warnings: Vec<_> = report
            .diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .collect();
        assert!(warnings.iter().any(|d| d.line == 1 && d.message.contains("subprocess")));
        assert!(warnings.iter().any(|d| d.line == 3 && d.message.contains("eval")));
    }

    #[test]
    fn test_unknown_extension_short_circuits() {
        let report = verify("{{{{ not code", "notes.txt");
        assert!(report.passed);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].severity, Severity::Info);
    }

    #[test]
    fn test_rust_syntax_error_is_reported() {
        let report = verify("fn main() {\n    let x = ;\n}\n", "src/main.rs");
        assert!(!report.passed);
        assert!(report.errors().any(|d| d.message.starts_with("SyntaxError")));
    }

    #[test]
    fn test_rust_lifetimes_do_not_confuse_bracket_scan() {
        let content = "fn first<'a>(items: &'a [u8]) -> &'a u8 {\n    &items[0]\n}\n";
        let report = verify(content, "src/lib.rs");
        assert!(report.passed, "{}", report.render());
    }

    #[test]
    fn test_regex_and_raw_string_brackets_do_not_block() {
        let report = verify("const re = /\\(/;\nconsole.log(re);\n", "src/a.js");
        assert!(report.passed, "{}", report.render());

        let rust = "fn main() {\n    let s = r#\"({[\"#;\n    println!(\"{}\", s);\n}\n";
        let report = verify(rust, "src/main.rs");
        assert!(report.passed, "{}", report.render());
    }

    #[test]
    fn test_render_lists_counts_and_hint() {
        let report = verify("def f(:\n", "src/a.py");
        let text = report.render();
        assert!(text.starts_with("Verification failed:"));
        assert!(text.contains("• [error] line 1"));
        assert!(text.contains("Fix the error on line 1"));
    }

    #[test]
    fn test_language_from_extension() {
        assert_eq!(Language::from_extension("PY"), Language::Python);
        assert_eq!(Language::from_extension("tsx"), Language::TypeScript);
        assert_eq!(Language::from_extension("md"), Language::Unknown);
    }
}
