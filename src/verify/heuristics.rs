//! Raw-text checks that need no grammar.

use super::{Diagnostic, Language};

pub(super) fn check(content: &str, language: Language) -> Vec<Diagnostic> {
    let mut diagnostics = whitespace_warnings(content);
    diagnostics.extend(bracket_balance(content, language));
    diagnostics
}

fn whitespace_warnings(content: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (idx, raw_line) in content.split('\n').enumerate() {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let trimmed = line.trim_end_matches([' ', '\t']);
        if trimmed.len() != line.len() {
            diagnostics.push(Diagnostic::warning(
                idx + 1,
                trimmed.chars().count() + 1,
                "trailing whitespace",
            ));
        }

        let leading: Vec<char> = line
            .chars()
            .take_while(|c| *c == ' ' || *c == '\t')
            .collect();
        if leading.contains(&' ') && leading.contains(&'\t') {
            diagnostics.push(Diagnostic::warning(
                idx + 1,
                1,
                "indentation mixes tabs and spaces",
            ));
        }
    }
    diagnostics
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    LineComment,
    BlockComment,
    Str { quote: char, triple: bool },
    /// Rust `r#"…"#`, closed by a quote and the same number of hashes
    RawStr { hashes: usize },
    /// JavaScript/TypeScript `/…/flags`
    Regex { in_class: bool },
}

#[derive(Debug, Clone, Copy)]
struct Open {
    bracket: char,
    line: usize,
    column: usize,
}

fn closing_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

/// Bracket balance over code, skipping string literals and comments.
fn bracket_balance(content: &str, language: Language) -> Vec<Diagnostic> {
    let hash_comments = language == Language::Python;
    let slash_regex = matches!(language, Language::JavaScript | Language::TypeScript);
    let chars: Vec<char> = content.chars().collect();
    let mut diagnostics = Vec::new();
    let mut stack: Vec<Open> = Vec::new();
    let mut state = Scan::Code;
    let mut line = 1;
    let mut column = 0;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        column += 1;

        if ch == '\n' {
            // Only triple-quoted strings, template literals and block
            // comments outlive a line end.
            state = match state {
                Scan::LineComment | Scan::Regex { .. } => Scan::Code,
                Scan::Str { triple: false, quote } if quote != '`' => {
                    if i > 0 && chars[i - 1] == '\\' {
                        state
                    } else {
                        Scan::Code
                    }
                }
                other => other,
            };
            line += 1;
            column = 0;
            i += 1;
            continue;
        }

        match state {
            Scan::LineComment => {}
            Scan::BlockComment => {
                if ch == '*' && next == Some('/') {
                    state = Scan::Code;
                    i += 1;
                    column += 1;
                }
            }
            Scan::RawStr { hashes } => {
                if ch == '"' && (1..=hashes).all(|k| chars.get(i + k) == Some(&'#')) {
                    state = Scan::Code;
                    i += hashes;
                    column += hashes;
                }
            }
            Scan::Regex { in_class } => match ch {
                '\\' if next.is_some_and(|n| n != '\n') => {
                    i += 1;
                    column += 1;
                }
                '[' => state = Scan::Regex { in_class: true },
                ']' => state = Scan::Regex { in_class: false },
                '/' if !in_class => state = Scan::Code,
                _ => {}
            },
            Scan::Str { quote, triple } => {
                if ch == '\\' && next.is_some_and(|n| n != '\n') {
                    i += 1;
                    column += 1;
                } else if ch == quote {
                    if !triple {
                        state = Scan::Code;
                    } else if next == Some(quote) && chars.get(i + 2) == Some(&quote) {
                        state = Scan::Code;
                        i += 2;
                        column += 2;
                    }
                }
            }
            Scan::Code => match ch {
                '#' if hash_comments => state = Scan::LineComment,
                '/' if !hash_comments && next == Some('/') => state = Scan::LineComment,
                '/' if !hash_comments && next == Some('*') => {
                    state = Scan::BlockComment;
                    i += 1;
                    column += 1;
                }
                '/' if slash_regex && regex_allowed(&chars[..i]) => {
                    state = Scan::Regex { in_class: false };
                }
                'r' | 'b' if language == Language::Rust => {
                    if let Some((hashes, skip)) = raw_string_start(&chars, i) {
                        state = Scan::RawStr { hashes };
                        i += skip;
                        column += skip;
                    }
                }
                '\'' if language == Language::Rust => {
                    // Char literal or lifetime; only literals are skipped.
                    if next == Some('\\') {
                        state = Scan::Str {
                            quote: '\'',
                            triple: false,
                        };
                    } else if chars.get(i + 2) == Some(&'\'') {
                        i += 2;
                        column += 2;
                    }
                }
                '"' | '\'' | '`' => {
                    let triple = hash_comments
                        && next == Some(ch)
                        && chars.get(i + 2) == Some(&ch);
                    if triple {
                        i += 2;
                        column += 2;
                    }
                    state = Scan::Str { quote: ch, triple };
                }
                '(' | '[' | '{' => stack.push(Open {
                    bracket: ch,
                    line,
                    column,
                }),
                ')' | ']' | '}' => match stack.last() {
                    Some(open) if closing_for(open.bracket) == ch => {
                        stack.pop();
                    }
                    Some(open) => {
                        diagnostics.push(Diagnostic::error(
                            line,
                            column,
                            format!(
                                "closing '{}' does not match '{}' opened at line {}, column {}",
                                ch, open.bracket, open.line, open.column
                            ),
                        ));
                        stack.pop();
                    }
                    None => diagnostics.push(Diagnostic::error(
                        line,
                        column,
                        format!("extraneous closing '{}'", ch),
                    )),
                },
                _ => {}
            },
        }
        i += 1;
    }

    for open in stack {
        diagnostics.push(Diagnostic::error(
            open.line,
            open.column,
            format!("unmatched '{}'", open.bracket),
        ));
    }
    diagnostics
}

const REGEX_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case",
    "do", "else", "yield", "await",
];

/// Whether a `/` after `before` opens a regex literal rather than dividing.
///
/// A regex follows an operator, opening punctuation, a keyword such as
/// `return`, or nothing at all.
fn regex_allowed(before: &[char]) -> bool {
    let Some(end) = before.iter().rposition(|c| !c.is_whitespace()) else {
        return true;
    };
    let last = before[end];
    if is_ident_char(last) {
        let start = before[..end]
            .iter()
            .rposition(|c| !is_ident_char(*c))
            .map_or(0, |p| p + 1);
        let word: String = before[start..=end].iter().collect();
        return REGEX_KEYWORDS.contains(&word.as_str());
    }
    !matches!(last, ')' | ']' | '}' | '"' | '\'' | '`')
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// For `r"`, `r#"`, `br#"` and friends at `i`, the hash count and how many
/// characters to skip so the opening quote is consumed.
fn raw_string_start(chars: &[char], i: usize) -> Option<(usize, usize)> {
    if i > 0 && is_ident_char(chars[i - 1]) {
        return None;
    }
    let mut j = i;
    if chars[j] == 'b' {
        j += 1;
    }
    if chars.get(j) != Some(&'r') {
        return None;
    }
    j += 1;
    let hashes = chars[j..].iter().take_while(|c| **c == '#').count();
    j += hashes;
    (chars.get(j) == Some(&'"')).then_some((hashes, j - i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::Severity;

    fn errors(content: &str, language: Language) -> Vec<(usize, usize, String)> {
        bracket_balance(content, language)
            .into_iter()
            .map(|d| (d.line, d.column, d.message))
            .collect()
    }

    #[test]
    fn test_unmatched_open_is_reported_at_its_position() {
        let found = errors("def f(:\n", Language::Python);
        assert_eq!(found, vec![(1, 6, "unmatched '('".to_string())]);
    }

    #[test]
    fn test_extraneous_close() {
        let found = errors("x = 1)\n", Language::Python);
        assert_eq!(found, vec![(1, 6, "extraneous closing ')'".to_string())]);
    }

    #[test]
    fn test_brackets_inside_strings_and_comments_are_ignored() {
        let python = "s = '(('  # ))\nt = \"\"\"\n[[\n\"\"\"\n";
        assert!(errors(python, Language::Python).is_empty());

        let js = "const s = \"{\"; // }\n/* ( */ const t = `${s}[`;\n";
        assert!(errors(js, Language::JavaScript).is_empty());
    }

    #[test]
    fn test_mismatched_close() {
        let found = errors("x = (1]\n", Language::Python);
        assert_eq!(found.len(), 1);
        assert!(found[0].2.contains("does not match '('"));
    }

    #[test]
    fn test_rust_char_literals_are_skipped() {
        assert!(errors("let c = '(';\nlet d = '\\'';\n", Language::Rust).is_empty());
    }

    #[test]
    fn test_js_regex_literals_are_skipped() {
        let js = "const re = /\\(/;\nconsole.log(re);\n";
        assert!(errors(js, Language::JavaScript).is_empty());

        let ts = "function f(s: string) {\n  return /[)\\]]+/g.test(s);\n}\n";
        assert!(errors(ts, Language::TypeScript).is_empty());

        let ts = "if (ok) {\n  x = s.split(/}/);\n}\n";
        assert!(errors(ts, Language::TypeScript).is_empty());
    }

    #[test]
    fn test_js_division_still_counts_brackets() {
        let js = "const half = (a + b) / 2;\nconst q = arr[0] / (n;\n";
        let found = errors(js, Language::JavaScript);
        assert_eq!(found, vec![(2, 20, "unmatched '('".to_string())]);
    }

    #[test]
    fn test_rust_raw_strings_are_skipped() {
        let rust = "let a = r\"(\";\nlet b = r#\"{ \"quoted\" ]\"#;\nlet c = br##\"[\"#\"##;\n";
        assert!(errors(rust, Language::Rust).is_empty());
    }

    #[test]
    fn test_rust_identifiers_ending_in_r_are_not_raw_strings() {
        let rust = "let for_r = bar(\"(\");\n";
        assert!(errors(rust, Language::Rust).is_empty());
        let found = errors("let x = ptr(1;\n", Language::Rust);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_whitespace_warnings() {
        let warnings = whitespace_warnings("a = 1  \n\t  b = 2\n");
        assert_eq!(warnings.len(), 2);
        assert_eq!((warnings[0].line, warnings[0].column), (1, 6));
        assert!(warnings.iter().all(|d| d.severity == Severity::Warning));
        assert_eq!(warnings[1].message, "indentation mixes tabs and spaces");
    }
}
