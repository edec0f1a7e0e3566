//! Python indentation rules as the tokenizer applies them.
//!
//! Only logical-line starts are measured: lines inside brackets, string
//! literals or after a backslash continuation are skipped, as are blank and
//! comment-only lines. Every indentation is measured twice (tabs to the
//! next multiple of 8, and tabs as 1) and the two measures must order the
//! same way against the enclosing level, otherwise tabs and spaces are
//! mixed inconsistently.

use super::{Diagnostic, ParseErrorCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Width {
    tabbed: usize,
    flat: usize,
}

#[derive(Debug, Clone, Copy)]
struct OpenString {
    quote: char,
    triple: bool,
}

pub(super) fn check_python_indentation(content: &str) -> Option<Diagnostic> {
    let mut levels = vec![Width { tabbed: 0, flat: 0 }];
    let mut depth = 0usize;
    let mut string: Option<OpenString> = None;
    let mut continuation = false;
    let mut expect_indent = false;
    let mut last_significant: Option<char> = None;

    for (idx, raw_line) in content.split('\n').enumerate() {
        let line_no = idx + 1;
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let at_logical_start = depth == 0 && string.is_none() && !continuation;

        let mut body_start = 0;
        if at_logical_start {
            let leading: String = line
                .chars()
                .take_while(|c| matches!(c, ' ' | '\t' | '\x0c'))
                .collect();
            let rest = &line[leading.len()..];
            if rest.is_empty() || rest.starts_with('#') {
                continue;
            }

            let width = measure(&leading);
            let column = leading.chars().count() + 1;
            if let Some(diagnostic) =
                check_level(&mut levels, width, expect_indent, line_no, column)
            {
                return Some(diagnostic);
            }
            expect_indent = false;
            last_significant = None;
            body_start = leading.len();
        }

        continuation = false;
        let mut chars = line[body_start..].chars().peekable();
        while let Some(ch) = chars.next() {
            if let Some(open) = string {
                match ch {
                    '\\' => {
                        chars.next();
                    }
                    c if c == open.quote => {
                        if !open.triple {
                            string = None;
                        } else if chars.peek() == Some(&open.quote) {
                            chars.next();
                            if chars.peek() == Some(&open.quote) {
                                chars.next();
                                string = None;
                            }
                        }
                    }
                    _ => {}
                }
                continue;
            }

            match ch {
                '#' => break,
                '\'' | '"' => {
                    let mut triple = false;
                    if chars.peek() == Some(&ch) {
                        chars.next();
                        if chars.peek() == Some(&ch) {
                            chars.next();
                            triple = true;
                        } else {
                            // Empty string literal.
                            last_significant = Some(ch);
                            continue;
                        }
                    }
                    string = Some(OpenString { quote: ch, triple });
                }
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth = depth.saturating_sub(1),
                '\\' if chars.peek().is_none() => {
                    continuation = true;
                    continue;
                }
                _ => {}
            }
            if !ch.is_whitespace() {
                last_significant = Some(ch);
            }
        }

        // A single-quoted string cannot span lines without a backslash.
        if let Some(open) = string {
            if !open.triple && !line.ends_with('\\') {
                string = None;
            }
        }

        if depth == 0 && string.is_none() && !continuation {
            expect_indent = last_significant == Some(':');
        }
    }

    None
}

fn measure(leading: &str) -> Width {
    let mut width = Width { tabbed: 0, flat: 0 };
    for ch in leading.chars() {
        match ch {
            ' ' => {
                width.tabbed += 1;
                width.flat += 1;
            }
            '\t' => {
                width.tabbed = (width.tabbed / 8 + 1) * 8;
                width.flat += 1;
            }
            // Form feed resets the count.
            _ => width = Width { tabbed: 0, flat: 0 },
        }
    }
    width
}

fn check_level(
    levels: &mut Vec<Width>,
    width: Width,
    expect_indent: bool,
    line: usize,
    column: usize,
) -> Option<Diagnostic> {
    let indentation = |message: &str| {
        Some(Diagnostic::parse_error(
            line,
            column,
            ParseErrorCategory::Indentation,
            message,
        ))
    };
    let tab_error = || {
        Some(Diagnostic::parse_error(
            line,
            column,
            ParseErrorCategory::MixedWhitespace,
            "inconsistent use of tabs and spaces in indentation",
        ))
    };

    let top = *levels.last()?;
    if width.tabbed == top.tabbed {
        if width.flat != top.flat {
            return tab_error();
        }
        if expect_indent {
            return indentation("expected an indented block");
        }
    } else if width.tabbed > top.tabbed {
        if width.flat <= top.flat {
            return tab_error();
        }
        if !expect_indent {
            return indentation("unexpected indent");
        }
        levels.push(width);
    } else {
        if expect_indent {
            return indentation("expected an indented block");
        }
        while levels.len() > 1 && width.tabbed < levels.last()?.tabbed {
            levels.pop();
        }
        let outer = *levels.last()?;
        if width.tabbed != outer.tabbed {
            return indentation("unindent does not match any outer indentation level");
        }
        if width.flat != outer.flat {
            return tab_error();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> Option<(usize, String)> {
        check_python_indentation(content).map(|d| (d.line, d.message))
    }

    #[test]
    fn test_well_formed_blocks_pass() {
        let content = "class A:\n    def m(self):\n        if x:\n            return 1\n        return 2\n\n\ndef g():\n    pass\n";
        assert_eq!(message(content), None);
    }

    #[test]
    fn test_unexpected_indent() {
        let (line, msg) = message("x = 1\n    y = 2\n").unwrap();
        assert_eq!(line, 2);
        assert_eq!(msg, "IndentationError: unexpected indent");
    }

    #[test]
    fn test_expected_indented_block() {
        let (line, msg) = message("def f():\nreturn 1\n").unwrap();
        assert_eq!(line, 2);
        assert_eq!(msg, "IndentationError: expected an indented block");
    }

    #[test]
    fn test_unindent_mismatch() {
        let (line, msg) = message("if x:\n        a = 1\n    b = 2\n").unwrap();
        assert_eq!(line, 3);
        assert!(msg.contains("unindent does not match"));
    }

    #[test]
    fn test_brackets_and_strings_do_not_count_as_logical_lines() {
        let content = "x = [\n  1,\n        2,\n]\ns = \"\"\"\n   free text:\n\"\"\"\ny = 'a:' # trailing: colon\n";
        assert_eq!(message(content), None);
    }

    #[test]
    fn test_backslash_continuation_is_skipped() {
        let content = "total = 1 + \\\n        2\nprint(total)\n";
        assert_eq!(message(content), None);
    }

    #[test]
    fn test_tab_space_mix() {
        let (line, msg) = message("if x:\n        a = 1\n\tb = 2\n").unwrap();
        assert_eq!(line, 3);
        assert!(msg.starts_with("TabError"));
    }
}
