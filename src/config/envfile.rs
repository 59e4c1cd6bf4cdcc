//! `KEY=VALUE` env-file grammar, merged behind explicit `env` entries at
//! process start.

use std::collections::BTreeMap;

/// Parses the contents of an env file. Total over any string input: no line
/// shape causes a panic, malformed lines are simply skipped.
///
/// - `#` starts a comment (only at the start of a trimmed line's content is
///   not required; a `#` that begins the line, after trimming, is a comment).
/// - Blank lines are ignored.
/// - Surrounding quotes are stripped only when the first and last
///   characters match (`"..."` or `'...'`); mismatched quotes are kept
///   verbatim.
pub fn parse(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        out.insert(key.to_string(), strip_quotes(value.trim()));
    }

    out
}

fn strip_quotes(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' || first == b'\'') && first == last {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_assignments() {
        let parsed = parse("FOO=bar\nBAZ=qux\n");
        assert_eq!(parsed.get("FOO").unwrap(), "bar");
        assert_eq!(parsed.get("BAZ").unwrap(), "qux");
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let parsed = parse("# a comment\n\nFOO=bar\n   # indented comment\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("FOO").unwrap(), "bar");
    }

    #[test]
    fn strips_matching_quotes_only() {
        let parsed = parse("A=\"quoted\"\nB='single'\nC=\"mismatched'\nD=unquoted");
        assert_eq!(parsed.get("A").unwrap(), "quoted");
        assert_eq!(parsed.get("B").unwrap(), "single");
        assert_eq!(parsed.get("C").unwrap(), "\"mismatched'");
        assert_eq!(parsed.get("D").unwrap(), "unquoted");
    }

    #[test]
    fn empty_input_yields_empty_map() {
        assert!(parse("").is_empty());
    }
}
