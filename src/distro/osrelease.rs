//! Minimal `/etc/os-release` parser.
//!
//! Grounded in `moncic/utils/osrelease.py`'s `parse_osrelase`: the file is
//! POSIX shell-variable-assignment syntax (`KEY=value`, `KEY="value"`,
//! `KEY='value'`), one assignment per line, comments and blank lines
//! ignored. We implement just enough of the quoting rules to round-trip
//! the fields this crate reads (`ID`, `VERSION_ID`).

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::Utf8Path;

/// Parses os-release content into a key/value map, unquoting values.
pub fn parse_os_release_str(content: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, raw_value)) = line.split_once('=') else {
            continue;
        };
        out.insert(key.trim().to_string(), unquote(raw_value.trim()));
    }
    out
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'"' || bytes[0] == b'\'') && bytes[bytes.len() - 1] == bytes[0] {
        let inner = &value[1..value.len() - 1];
        if bytes[0] == b'"' {
            // Only backslash-escapes that matter for the values we read.
            inner.replace("\\\"", "\"").replace("\\\\", "\\").replace("\\$", "$").replace("\\`", "`")
        } else {
            inner.to_string()
        }
    } else {
        value.to_string()
    }
}

/// Reads and parses `<root>/etc/os-release`.
pub fn parse_os_release(root: &Utf8Path) -> Result<BTreeMap<String, String>> {
    let path = root.join("etc").join("os-release");
    let content = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    Ok(parse_os_release_str(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_and_quoted_values() {
        let content = "ID=debian\nVERSION_ID=\"12\"\nPRETTY_NAME='Debian GNU/Linux 12 (bookworm)'\n";
        let info = parse_os_release_str(content);
        assert_eq!(info.get("ID"), Some(&"debian".to_string()));
        assert_eq!(info.get("VERSION_ID"), Some(&"12".to_string()));
        assert_eq!(info.get("PRETTY_NAME"), Some(&"Debian GNU/Linux 12 (bookworm)".to_string()));
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let content = "# comment\n\nID=fedora\n";
        let info = parse_os_release_str(content);
        assert_eq!(info.len(), 1);
        assert_eq!(info.get("ID"), Some(&"fedora".to_string()));
    }

    #[test]
    fn missing_file_is_an_error() {
        let root = Utf8Path::new("/nonexistent/monci-test-root");
        assert!(parse_os_release(root).is_err());
    }
}
