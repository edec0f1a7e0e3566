//! Tree-sitter structural pass: syntax errors and dangerous constructs

use super::{Diagnostic, Language, ParseErrorCategory};
use std::cell::RefCell;
use std::path::Path;
use tree_sitter::{Node, Parser, Tree};

// ═══════════════════════════════════════════════════════════════════════════
//  THREAD-LOCAL PARSER POOL
// ═══════════════════════════════════════════════════════════════════════════
//
// Parsers are expensive to create but reusable. Each thread that verifies
// files (the blocking pool under the service handle) keeps its own set.

thread_local! {
    static RUST_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_rust::LANGUAGE.into());
        p
    });

    static JS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_javascript::LANGUAGE.into());
        p
    });

    static TS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into());
        p
    });

    static TSX_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TSX.into());
        p
    });

    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });

    static GO_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_go::LANGUAGE.into());
        p
    });
}

/// Parse content using a thread-local parser for the given language
pub(super) fn parse(content: &str, language: Language, path: &Path) -> anyhow::Result<Tree> {
    let parse_result = match language {
        Language::Rust => RUST_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::JavaScript => JS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::TypeScript => {
            let use_tsx = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("tsx"))
                .unwrap_or(false);
            if use_tsx {
                TSX_PARSER.with(|p| p.borrow_mut().parse(content, None))
            } else {
                TS_PARSER.with(|p| p.borrow_mut().parse(content, None))
            }
        }
        Language::Python => PYTHON_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Go => GO_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Unknown => return Err(anyhow::anyhow!("Unknown language")),
    };

    parse_result.ok_or_else(|| anyhow::anyhow!("{} parser produced no tree", language.label()))
}

/// The earliest ERROR or MISSING node, as a single tagged diagnostic.
pub(super) fn first_syntax_error(tree: &Tree, content: &str) -> Option<Diagnostic> {
    let root = tree.root_node();
    if !root.has_error() {
        return None;
    }

    let mut earliest: Option<Node> = None;
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            let better = earliest
                .map(|current| position_key(node) < position_key(current))
                .unwrap_or(true);
            if better {
                earliest = Some(node);
            }
            if node.is_missing() {
                continue;
            }
        }
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.has_error() || child.is_missing() {
                stack.push(child);
            }
        }
    }

    let node = earliest?;
    let position = node.start_position();
    let message = if node.is_missing() {
        format!("expected '{}'", node.kind())
    } else {
        let snippet = node
            .utf8_text(content.as_bytes())
            .ok()
            .and_then(|text| text.lines().map(str::trim).find(|l| !l.is_empty()))
            .map(|line| crate::util::truncate(line, 40))
            .unwrap_or_default();
        if snippet.is_empty() {
            "invalid syntax".to_string()
        } else {
            format!("invalid syntax near '{}'", snippet)
        }
    };

    Some(Diagnostic::parse_error(
        position.row + 1,
        position.column + 1,
        ParseErrorCategory::Syntax,
        &message,
    ))
}

fn position_key(node: Node) -> (usize, usize) {
    let point = node.start_position();
    (point.row, point.column)
}

const DANGEROUS_CALLS: &[(&str, &str)] = &[
    ("eval", "dynamic evaluation"),
    ("exec", "dynamic evaluation"),
    ("compile", "dynamic evaluation"),
    ("__import__", "dynamic import"),
    ("importlib.import_module", "dynamic import"),
    ("os.system", "process execution"),
    ("os.popen", "process execution"),
];

const DANGEROUS_MODULES: &[(&str, &str)] = &[
    ("subprocess", "process execution"),
    ("importlib", "dynamic import"),
    ("ctypes", "native code access"),
];

const DANGEROUS_ATTRIBUTES: &[(&str, &str)] = &[
    ("sys.modules", "module-system introspection"),
    ("sys._getframe", "interpreter introspection"),
];

/// Advisory warnings for dangerous Python constructs anywhere in the tree.
pub(super) fn scan_python_dangerous(tree: &Tree, content: &str) -> Vec<Diagnostic> {
    let bytes = content.as_bytes();
    let text = |node: Node| node.utf8_text(bytes).unwrap_or("").to_string();
    let mut findings = Vec::new();

    let mut stack = vec![tree.root_node()];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "call" => {
                if let Some(function) = node.child_by_field_name("function") {
                    let name = compact(&text(function));
                    if let Some(category) = lookup(DANGEROUS_CALLS, &name) {
                        findings.push(finding(node, category, &format!("{}()", name)));
                    }
                }
            }
            "attribute" => {
                let name = compact(&text(node));
                if let Some(category) = lookup(DANGEROUS_ATTRIBUTES, &name) {
                    findings.push(finding(node, category, &name));
                }
            }
            "import_statement" => {
                let mut cursor = node.walk();
                for name_node in node.children_by_field_name("name", &mut cursor) {
                    let module = imported_name(name_node, &text);
                    if let Some(category) = module_category(&module) {
                        findings.push(finding(node, category, &format!("import {}", module)));
                    }
                }
            }
            "import_from_statement" => {
                let module = node
                    .child_by_field_name("module_name")
                    .map(&text)
                    .unwrap_or_default();
                if let Some(category) = module_category(&module) {
                    findings.push(finding(node, category, &format!("from {} import", module)));
                }
                let mut cursor = node.walk();
                for name_node in node.children_by_field_name("name", &mut cursor) {
                    let qualified = format!("{}.{}", module, imported_name(name_node, &text));
                    if let Some(category) = lookup(DANGEROUS_CALLS, &qualified) {
                        findings.push(finding(node, category, &qualified));
                    }
                }
            }
            _ => {}
        }

        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            stack.push(child);
        }
    }

    findings.sort_by_key(|d| (d.line, d.column));
    findings
}

fn imported_name(node: Node, text: &impl Fn(Node) -> String) -> String {
    if node.kind() == "aliased_import" {
        node.child_by_field_name("name")
            .map(text)
            .unwrap_or_default()
    } else {
        text(node)
    }
}

fn module_category(module: &str) -> Option<&'static str> {
    DANGEROUS_MODULES
        .iter()
        .find(|(name, _)| module == *name || module.starts_with(&format!("{}.", name)))
        .map(|(_, category)| *category)
}

fn lookup(table: &[(&str, &'static str)], name: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, category)| *category)
}

fn compact(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).collect()
}

fn finding(node: Node, category: &str, what: &str) -> Diagnostic {
    let position = node.start_position();
    Diagnostic::warning(
        position.row + 1,
        position.column + 1,
        format!("Potentially dangerous {}: '{}'", category, what),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn python(content: &str) -> Tree {
        parse(content, Language::Python, Path::new("a.py")).unwrap()
    }

    #[test]
    fn test_clean_tree_has_no_syntax_error() {
        let content = "class A:\n    def m(self):\n        return [x for x in range(3)]\n";
        assert!(first_syntax_error(&python(content), content).is_none());
    }

    #[test]
    fn test_syntax_error_is_tagged() {
        let content = "def f(:\n";
        let diagnostic = first_syntax_error(&python(content), content).unwrap();
        assert!(diagnostic.message.starts_with("SyntaxError: "));
        assert!(diagnostic.line >= 1);
    }

    #[test]
    fn test_dangerous_imports_and_calls_are_found() {
        let content = "import importlib as il\nfrom os import system\nimport sys\nmods = sys.modules\n__import__('json')\n";
        let findings = scan_python_dangerous(&python(content), content);
        let lines: Vec<usize> = findings.iter().map(|d| d.line).collect();
        assert_eq!(lines, vec![1, 2, 4, 5]);
        assert!(findings[1].message.contains("os.system"));
        assert!(findings[3].message.contains("__import__()"));
    }

    #[test]
    fn test_safe_code_has_no_findings() {
        let content = "import json\n\ndef load(s):\n    return json.loads(s)\n";
        assert!(scan_python_dangerous(&python(content), content).is_empty());
    }

    #[test]
    fn test_go_parser_reports_errors() {
        let content = "package main\n\nfunc main() {\n\tx := \n}\n";
        let tree = parse(content, Language::Go, Path::new("main.go")).unwrap();
        assert!(first_syntax_error(&tree, content).is_some());
    }
}
