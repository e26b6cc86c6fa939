//! JSON with comments.
//!
//! The roots config file allows `//` and `/* */` comments and trailing
//! commas. Both are stripped outside of string literals and the remainder is
//! handed to `serde_json`, so everything else must be strict JSON.

use serde_json::{Map, Value};

/// Parses JSONC text. Blank input (after stripping) yields an empty object.
///
/// # Example
///
/// ```
/// use pgch_server::jsonc::parse_jsonc;
///
/// let value = parse_jsonc("{ // roots\n \"roots\": [],\n}").unwrap();
/// assert!(value["roots"].as_array().unwrap().is_empty());
/// ```
pub fn parse_jsonc(input: &str) -> Result<Value, serde_json::Error> {
    let sanitized = strip_trailing_commas(&strip_comments(input));
    if sanitized.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(&sanitized)
}

/// Tracks whether the scanner is inside a quoted string.
#[derive(Default)]
struct StringScanner {
    quote: Option<char>,
    escaped: bool,
}

impl StringScanner {
    /// Feeds one character; returns `true` if it belongs to a string
    /// literal (including the delimiting quotes).
    fn consume(&mut self, c: char) -> bool {
        match self.quote {
            Some(quote) => {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == quote {
                    self.quote = None;
                }
                true
            }
            None if c == '"' || c == '\'' => {
                self.quote = Some(c);
                true
            }
            None => false,
        }
    }
}

/// Removes comments, keeping newlines so parse errors report sane lines.
fn strip_comments(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut strings = StringScanner::default();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if strings.consume(c) {
            output.push(c);
            continue;
        }
        match (c, chars.peek().copied()) {
            ('/', Some('/')) => {
                chars.next();
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        output.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                output.push(' ');
                while let Some(skipped) = chars.next() {
                    if skipped == '\n' {
                        output.push('\n');
                    } else if skipped == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => output.push(c),
        }
    }

    output
}

/// Drops commas that are followed (after whitespace) by `}` or `]`.
fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut output = String::with_capacity(input.len());
    let mut strings = StringScanner::default();

    for (index, &c) in chars.iter().enumerate() {
        if strings.consume(c) {
            output.push(c);
            continue;
        }
        if c == ',' {
            let next = chars[index + 1..]
                .iter()
                .find(|n| !matches!(n, ' ' | '\n' | '\r' | '\t'));
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        output.push(c);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_line_and_block_comments() {
        let text = r#"{
            // the list of roots
            "roots": [ /* none yet */ ],
            "tasksDir": ".tasks" // default
        }"#;
        assert_eq!(parse_jsonc(text).unwrap(), json!({"roots": [], "tasksDir": ".tasks"}));
    }

    #[test]
    fn keeps_comment_markers_inside_strings() {
        let text = r#"{"path": "https://example.com/a/*b*/", "note": "say \"//hi\""}"#;
        let value = parse_jsonc(text).unwrap();
        assert_eq!(value["path"], json!("https://example.com/a/*b*/"));
        assert_eq!(value["note"], json!("say \"//hi\""));
    }

    #[test]
    fn removes_trailing_commas() {
        let text = "{\"roots\": [{\"path\": \"/a\",},\n],\n}";
        assert_eq!(parse_jsonc(text).unwrap(), json!({"roots": [{"path": "/a"}]}));
    }

    #[test]
    fn keeps_commas_inside_strings() {
        let value = parse_jsonc(r#"{"label": "a, ]"}"#).unwrap();
        assert_eq!(value["label"], json!("a, ]"));
    }

    #[test]
    fn blank_input_is_empty_object() {
        assert_eq!(parse_jsonc("").unwrap(), json!({}));
        assert_eq!(parse_jsonc("  // only a comment\n").unwrap(), json!({}));
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_jsonc("{roots: []}").is_err());
        assert!(parse_jsonc("{\"a\": 1").is_err());
    }
}
